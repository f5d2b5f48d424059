//! Keeper Module
//!
//! Turns a cluster data snapshot into the local instance configuration:
//! the pg_hba.conf rules and the synchronous standby setting, and tells
//! whether the live instance already matches them.

pub mod hba;
pub mod sync_standby;

pub use hba::{render_hba, parse_hba, HbaEntry, HbaGenerator, HbaRule};
pub use sync_standby::{
    parse_synchronous_standby_names, reported_sync_standbys, stolon_name,
    sync_standbys_converged, synchronous_standby_names_value, StandbyNames,
};

use crate::cluster::ClusterData;
use crate::config::KeeperConfig;
use crate::error::{Error, Result};

/// What the local instance should look like for one snapshot
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconcilePlan {
    /// UID of the local db
    pub db_uid: String,
    /// Rules for pg_hba.conf, in order
    pub hba: Vec<String>,
    /// Generated rules differ from the applied ones
    pub hba_changed: bool,
    /// Desired synchronous standbys (db UIDs)
    pub sync_standbys: Vec<String>,
    /// Desired `synchronous_standby_names` value
    pub synchronous_standby_names: String,
    /// Live setting already names the desired standbys
    pub sync_converged: bool,
}

impl ReconcilePlan {
    pub fn needs_apply(&self) -> bool {
        self.hba_changed || !self.sync_converged
    }
}

/// Per-instance keeper
#[derive(Debug, Clone)]
pub struct Keeper {
    uid: String,
    hba: HbaGenerator,
}

impl Keeper {
    pub fn new(config: &KeeperConfig) -> Self {
        Self {
            uid: config.keeper.uid.clone(),
            hba: HbaGenerator::from_config(&config.postgres),
        }
    }

    pub fn uid(&self) -> &str {
        &self.uid
    }

    pub fn hba_generator(&self) -> &HbaGenerator {
        &self.hba
    }

    /// Compute the local configuration for a snapshot
    ///
    /// `current_hba` holds the applied rules as returned by [`parse_hba`]
    /// and `live_sync_standby_names` the value reported by the running
    /// instance, if any.
    pub fn plan(
        &self,
        cd: &ClusterData,
        current_hba: &[String],
        live_sync_standby_names: Option<&str>,
    ) -> Result<ReconcilePlan> {
        let db = cd
            .db_for_keeper(&self.uid)
            .ok_or_else(|| Error::DbNotFound(self.uid.clone()))?;

        let hba = self.hba.generate(cd, db);
        // Compare as read back from disk, where comments and blank lines are gone
        let hba_changed = parse_hba(&render_hba(&hba)) != current_hba;

        let (sync_standbys, external) = if db.is_master() && db.spec.synchronous_replication {
            (
                db.spec.synchronous_standbys.clone(),
                db.spec.external_synchronous_standbys.as_slice(),
            )
        } else {
            (Vec::new(), &[][..])
        };
        let synchronous_standby_names = synchronous_standby_names_value(&sync_standbys, external);

        let sync_converged = match live_sync_standby_names {
            Some(live) => sync_standbys_converged(&sync_standbys, external, live),
            None => sync_standbys.is_empty() && external.is_empty(),
        };

        if hba_changed {
            tracing::info!("pg_hba.conf of db {} needs updating", db.uid);
        }
        if !sync_converged {
            tracing::info!(
                "synchronous_standby_names of db {} not converged, want {:?}",
                db.uid,
                synchronous_standby_names
            );
        }

        Ok(ReconcilePlan {
            db_uid: db.uid.clone(),
            hba,
            hba_changed,
            sync_standbys,
            synchronous_standby_names,
            sync_converged,
        })
    }
}
