//! Cluster State Model
//!
//! Read-only view of the cluster data snapshot published by the cluster
//! state store. The keeper never mutates a snapshot; a new one replaces it
//! wholesale whenever topology or policy changes.

mod data;

pub use data::{
    Cluster, ClusterData, ClusterPhase, ClusterSpec, ClusterStatus, Db, DbSpec, DbStatus, Dbs,
    FollowConfig, FollowType, KeeperInfo, KeeperStatus, Keepers, Proxy, ProxySpec, Role,
    SuReplAccessMode, CURRENT_FORMAT_VERSION,
};
