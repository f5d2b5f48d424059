//! Cluster Data Types
//!
//! Defines the snapshot structure as stored (JSON) in the cluster state
//! store, plus the read-only lookups the keeper needs.

use std::collections::BTreeMap;
use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Snapshot format version understood by this keeper
pub const CURRENT_FORMAT_VERSION: u64 = 1;

/// Keepers keyed by keeper UID
pub type Keepers = BTreeMap<String, KeeperInfo>;

/// Database instances keyed by db UID (ordered, so iteration is by UID)
pub type Dbs = BTreeMap<String, Db>;

/// Role of a database instance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Master,
    Standby,
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Role::Master => write!(f, "master"),
            Role::Standby => write!(f, "standby"),
        }
    }
}

/// How superuser and replication connections are authorized
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SuReplAccessMode {
    /// Any source address
    #[default]
    All,
    /// Only the addresses of known replication peers
    Strict,
}

impl std::fmt::Display for SuReplAccessMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SuReplAccessMode::All => write!(f, "all"),
            SuReplAccessMode::Strict => write!(f, "strict"),
        }
    }
}

/// Replication source kind of a standby
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FollowType {
    /// Follows another db of the same cluster
    Internal,
    /// Follows a source outside the cluster
    External,
}

/// Cluster lifecycle phase
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ClusterPhase {
    #[default]
    Initializing,
    Normal,
}

/// Root snapshot
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterData {
    #[serde(default = "default_format_version")]
    pub format_version: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub change_time: Option<DateTime<Utc>>,
    pub cluster: Cluster,
    #[serde(default)]
    pub keepers: Keepers,
    #[serde(default)]
    pub dbs: Dbs,
    #[serde(default)]
    pub proxy: Proxy,
}

/// Cluster-wide policy and status
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Cluster {
    #[serde(default)]
    pub uid: String,
    #[serde(default)]
    pub generation: i64,
    #[serde(default)]
    pub spec: ClusterSpec,
    #[serde(default)]
    pub status: ClusterStatus,
}

/// Cluster-wide policy
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterSpec {
    #[serde(
        default,
        rename = "defaultSUReplAccessMode",
        skip_serializing_if = "Option::is_none"
    )]
    pub default_su_repl_access_mode: Option<SuReplAccessMode>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub synchronous_replication: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_synchronous_standbys: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_synchronous_standbys: Option<u16>,
    #[serde(default, rename = "pgHBA", skip_serializing_if = "Vec::is_empty")]
    pub pg_hba: Vec<String>,
}

impl ClusterSpec {
    /// Effective superuser/replication access mode
    ///
    /// An unset mode resolves to [`SuReplAccessMode::All`], the cluster
    /// default applied when a cluster spec is initialised.
    pub fn su_repl_access_mode(&self) -> SuReplAccessMode {
        self.default_su_repl_access_mode.unwrap_or_default()
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterStatus {
    #[serde(default)]
    pub phase: ClusterPhase,
    /// UID of the db currently elected master
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub master: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KeeperInfo {
    #[serde(default)]
    pub uid: String,
    #[serde(default)]
    pub status: KeeperStatus,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KeeperStatus {
    #[serde(default)]
    pub healthy: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_healthy_time: Option<DateTime<Utc>>,
}

/// One PostgreSQL instance: desired state and observed status
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Db {
    pub uid: String,
    #[serde(default)]
    pub generation: i64,
    pub spec: DbSpec,
    #[serde(default)]
    pub status: DbStatus,
}

impl Db {
    pub fn is_master(&self) -> bool {
        self.spec.role == Role::Master
    }

    /// Whether this db replicates from `master_uid` inside the cluster
    pub fn follows_internally(&self, master_uid: &str) -> bool {
        matches!(
            &self.spec.follow_config,
            Some(FollowConfig { follow_type: FollowType::Internal, db_uid: Some(uid) })
                if uid == master_uid
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DbSpec {
    #[serde(default, rename = "keeperUID")]
    pub keeper_uid: String,
    pub role: Role,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub follow_config: Option<FollowConfig>,
    /// Custom rules replacing the default catch-all HBA rules
    #[serde(default, rename = "pgHBA", skip_serializing_if = "Vec::is_empty")]
    pub pg_hba: Vec<String>,
    #[serde(default)]
    pub synchronous_replication: bool,
    /// Desired synchronous standbys (db UIDs)
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub synchronous_standbys: Vec<String>,
    /// Desired synchronous standbys outside the cluster (raw names)
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub external_synchronous_standbys: Vec<String>,
}

impl DbSpec {
    pub fn new(keeper_uid: impl Into<String>, role: Role) -> Self {
        Self {
            keeper_uid: keeper_uid.into(),
            role,
            follow_config: None,
            pg_hba: Vec::new(),
            synchronous_replication: false,
            synchronous_standbys: Vec::new(),
            external_synchronous_standbys: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DbStatus {
    #[serde(default)]
    pub healthy: bool,
    #[serde(default)]
    pub listen_address: String,
    #[serde(default)]
    pub port: String,
    /// Synchronous standbys currently applied (db UIDs)
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub synchronous_standbys: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FollowConfig {
    #[serde(rename = "type")]
    pub follow_type: FollowType,
    #[serde(default, rename = "dbuid", skip_serializing_if = "Option::is_none")]
    pub db_uid: Option<String>,
}

impl FollowConfig {
    pub fn internal(db_uid: impl Into<String>) -> Self {
        Self {
            follow_type: FollowType::Internal,
            db_uid: Some(db_uid.into()),
        }
    }

    pub fn external() -> Self {
        Self {
            follow_type: FollowType::External,
            db_uid: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Proxy {
    #[serde(default)]
    pub generation: i64,
    #[serde(default)]
    pub spec: ProxySpec,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProxySpec {
    #[serde(default, rename = "masterDbUid", skip_serializing_if = "Option::is_none")]
    pub master_db_uid: Option<String>,
}

fn default_format_version() -> u64 {
    CURRENT_FORMAT_VERSION
}

impl ClusterData {
    /// Empty snapshot around the given cluster
    pub fn new(cluster: Cluster) -> Self {
        Self {
            format_version: CURRENT_FORMAT_VERSION,
            change_time: None,
            cluster,
            keepers: Keepers::new(),
            dbs: Dbs::new(),
            proxy: Proxy::default(),
        }
    }

    /// Decode a snapshot from its JSON representation
    pub fn from_json(content: &str) -> Result<Self> {
        Ok(serde_json::from_str(content)?)
    }

    /// Load a snapshot from a JSON file
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_json(&content)
    }

    pub fn to_json_pretty(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn db(&self, uid: &str) -> Option<&Db> {
        self.dbs.get(uid)
    }

    /// Like [`ClusterData::db`], failing with [`Error::UnknownDb`]
    pub fn require_db(&self, uid: &str) -> Result<&Db> {
        self.db(uid).ok_or_else(|| Error::UnknownDb(uid.to_string()))
    }

    /// The db assigned to a keeper
    pub fn db_for_keeper(&self, keeper_uid: &str) -> Option<&Db> {
        self.dbs.values().find(|db| db.spec.keeper_uid == keeper_uid)
    }

    /// Dbs replicating internally from `master_uid`, in ascending UID order
    pub fn internal_followers(&self, master_uid: &str) -> Vec<&Db> {
        self.dbs
            .values()
            .filter(|db| db.follows_internally(master_uid))
            .collect()
    }

    /// Check the referential invariants the keeper relies on
    pub fn check_integrity(&self) -> Result<()> {
        for (key, db) in &self.dbs {
            if key != &db.uid {
                return Err(Error::InconsistentUid {
                    key: key.clone(),
                    uid: db.uid.clone(),
                });
            }

            if let Some(FollowConfig { follow_type: FollowType::Internal, db_uid }) =
                &db.spec.follow_config
            {
                let target = db_uid.as_deref().unwrap_or_default();
                if !self.dbs.contains_key(target) {
                    return Err(Error::DanglingFollow {
                        db: db.uid.clone(),
                        target: target.to_string(),
                    });
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SNAPSHOT: &str = r#"{
        "formatVersion": 1,
        "changeTime": "2024-03-01T10:00:00Z",
        "cluster": {
            "uid": "c1",
            "generation": 3,
            "spec": { "defaultSUReplAccessMode": "strict", "synchronousReplication": true },
            "status": { "phase": "normal", "master": "db1" }
        },
        "keepers": {
            "keeper1": { "uid": "keeper1", "status": { "healthy": true } }
        },
        "dbs": {
            "db3": {
                "uid": "db3",
                "spec": { "keeperUID": "keeper3", "role": "standby",
                          "followConfig": { "type": "internal", "dbuid": "db1" } },
                "status": { "listenAddress": "192.168.0.3", "port": "5432" }
            },
            "db1": {
                "uid": "db1",
                "spec": { "keeperUID": "keeper1", "role": "master",
                          "synchronousReplication": true, "synchronousStandbys": ["db3"] },
                "status": { "healthy": true, "listenAddress": "192.168.0.1" }
            },
            "db2": {
                "uid": "db2",
                "spec": { "keeperUID": "keeper2", "role": "standby",
                          "followConfig": { "type": "internal", "dbuid": "db1" },
                          "pgHBA": ["host all all 10.0.0.0/8 md5"] },
                "status": { "listenAddress": "192.168.0.2" }
            }
        },
        "proxy": { "generation": 1, "spec": { "masterDbUid": "db1" } }
    }"#;

    #[test]
    fn test_decode_snapshot() {
        let cd = ClusterData::from_json(SNAPSHOT).unwrap();
        assert_eq!(cd.cluster.status.phase, ClusterPhase::Normal);
        assert_eq!(cd.cluster.spec.su_repl_access_mode(), SuReplAccessMode::Strict);
        assert_eq!(cd.cluster.spec.synchronous_replication, Some(true));
        assert!(cd.change_time.is_some());
        assert_eq!(cd.proxy.spec.master_db_uid.as_deref(), Some("db1"));

        let db2 = cd.db("db2").unwrap();
        assert_eq!(db2.spec.role, Role::Standby);
        assert_eq!(db2.spec.follow_config, Some(FollowConfig::internal("db1")));
        assert_eq!(db2.spec.pg_hba, vec!["host all all 10.0.0.0/8 md5".to_string()]);

        assert_eq!(cd.db_for_keeper("keeper1").unwrap().uid, "db1");
        assert_eq!(cd.require_db("db3").unwrap().uid, "db3");
        match cd.require_db("db9") {
            Err(e @ Error::UnknownDb(_)) => {
                assert_eq!(e.to_string(), "Db db9 not found in cluster data")
            }
            other => panic!("unexpected result: {:?}", other),
        }
        assert!(cd.db_for_keeper("keeper9").is_none());
        cd.check_integrity().unwrap();
    }

    #[test]
    fn test_json_roundtrip_preserves_wire_names() {
        let cd = ClusterData::from_json(SNAPSHOT).unwrap();
        let json = cd.to_json_pretty().unwrap();
        assert!(json.contains("\"defaultSUReplAccessMode\": \"strict\""));
        assert!(json.contains("\"keeperUID\": \"keeper1\""));
        assert!(json.contains("\"dbuid\": \"db1\""));
        assert_eq!(ClusterData::from_json(&json).unwrap(), cd);
    }

    #[test]
    fn test_unset_access_mode_defaults_to_all() {
        let cd = ClusterData::from_json(r#"{ "cluster": {} }"#).unwrap();
        assert_eq!(cd.cluster.spec.default_su_repl_access_mode, None);
        assert_eq!(cd.cluster.spec.su_repl_access_mode(), SuReplAccessMode::All);
        assert_eq!(cd.format_version, CURRENT_FORMAT_VERSION);
        assert!(cd.dbs.is_empty());
    }

    #[test]
    fn test_internal_followers_sorted_by_uid() {
        let cd = ClusterData::from_json(SNAPSHOT).unwrap();
        let uids: Vec<&str> = cd
            .internal_followers("db1")
            .iter()
            .map(|db| db.uid.as_str())
            .collect();
        assert_eq!(uids, vec!["db2", "db3"]);
        assert!(cd.internal_followers("db2").is_empty());
    }

    #[test]
    fn test_external_follower_is_not_internal() {
        let mut cd = ClusterData::from_json(SNAPSHOT).unwrap();
        cd.dbs.get_mut("db3").unwrap().spec.follow_config = Some(FollowConfig::external());
        let uids: Vec<&str> = cd
            .internal_followers("db1")
            .iter()
            .map(|db| db.uid.as_str())
            .collect();
        assert_eq!(uids, vec!["db2"]);
        cd.check_integrity().unwrap();
    }

    #[test]
    fn test_integrity_errors() {
        let mut cd = ClusterData::from_json(SNAPSHOT).unwrap();
        cd.dbs.get_mut("db2").unwrap().spec.follow_config = Some(FollowConfig::internal("gone"));
        match cd.check_integrity() {
            Err(Error::DanglingFollow { db, target }) => {
                assert_eq!(db, "db2");
                assert_eq!(target, "gone");
            }
            other => panic!("unexpected result: {:?}", other),
        }

        let mut cd = ClusterData::from_json(SNAPSHOT).unwrap();
        let mut db = cd.dbs.remove("db3").unwrap();
        db.uid = "other".to_string();
        cd.dbs.insert("db3".to_string(), db);
        assert!(matches!(
            cd.check_integrity(),
            Err(Error::InconsistentUid { .. })
        ));
    }

    #[test]
    fn test_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("clusterdata.json");
        std::fs::write(&path, SNAPSHOT).unwrap();

        let cd = ClusterData::from_file(&path).unwrap();
        assert_eq!(cd.dbs.len(), 3);
        assert_eq!(cd, ClusterData::from_json(SNAPSHOT).unwrap());

        let missing = ClusterData::from_file(&dir.path().join("missing.json"));
        assert!(matches!(missing, Err(Error::Io(_))));

        std::fs::write(&path, "not json").unwrap();
        assert!(matches!(
            ClusterData::from_file(&path),
            Err(Error::ClusterData(_))
        ));
    }

    #[test]
    fn test_bad_json() {
        let err = ClusterData::from_json("{ \"dbs\": 1 }").unwrap_err();
        assert!(err.is_malformed_input());
    }
}
