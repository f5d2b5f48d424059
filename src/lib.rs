//! pgkeeper - PostgreSQL High-Availability Keeper
//!
//! The keeper runs next to every PostgreSQL instance of a cluster. It reads
//! the cluster data snapshot published by the cluster state store and
//! derives the local configuration from it.
//!
//! # Architecture
//!
//! Everything here is a pure function of a snapshot: no I/O, no shared
//! state. The control loop, process supervision and the state store are
//! external and only call into this crate.
//!
//! # Features
//!
//! - pg_hba.conf generation from role, topology and access policy
//! - Parsing of `synchronous_standby_names`, including quorum lists
//! - Convergence checks between desired and live synchronous standbys
//! - TOML keeper configuration and JSON cluster snapshots

pub mod config;
pub mod error;
pub mod cluster;
pub mod keeper;

pub use config::KeeperConfig;
pub use error::{Error, Result};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::config::KeeperConfig;
    pub use crate::error::{Error, Result};
    pub use crate::cluster::{ClusterData, Db, Role, SuReplAccessMode};
    pub use crate::keeper::{parse_synchronous_standby_names, HbaGenerator, Keeper, ReconcilePlan};
}
