//! HBA Rule Generation
//!
//! Builds the pg_hba.conf rules for one db from the cluster snapshot:
//! local socket access for the keeper's roles, superuser and replication
//! host access according to the cluster access mode, then either the db's
//! custom rules or the default catch-all rules.

use std::fmt;

use crate::cluster::{ClusterData, Db, SuReplAccessMode};
use crate::config::PostgresConfig;

const IPV4_ANY: &str = "0.0.0.0/0";
const IPV6_ANY: &str = "::0/0";

/// Connection type column of a rule
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionType {
    Local,
    Host,
}

impl fmt::Display for ConnectionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionType::Local => write!(f, "local"),
            ConnectionType::Host => write!(f, "host"),
        }
    }
}

/// A single pg_hba.conf rule
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HbaRule {
    pub connection: ConnectionType,
    pub database: String,
    pub user: String,
    /// Omitted for local socket rules
    pub address: Option<String>,
    pub method: String,
}

impl HbaRule {
    pub fn local(database: &str, user: &str, method: &str) -> Self {
        Self {
            connection: ConnectionType::Local,
            database: database.to_string(),
            user: user.to_string(),
            address: None,
            method: method.to_string(),
        }
    }

    pub fn host(database: &str, user: &str, address: &str, method: &str) -> Self {
        Self {
            connection: ConnectionType::Host,
            database: database.to_string(),
            user: user.to_string(),
            address: Some(address.to_string()),
            method: method.to_string(),
        }
    }
}

/// A line of the generated pg_hba.conf
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HbaEntry {
    Rule(HbaRule),
    /// User supplied line, written verbatim
    Custom(String),
}

impl fmt::Display for HbaEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HbaEntry::Rule(rule) => fmt::Display::fmt(rule, f),
            HbaEntry::Custom(line) => f.write_str(line),
        }
    }
}

impl fmt::Display for HbaRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} {}", self.connection, self.database, self.user)?;
        if let Some(address) = &self.address {
            write!(f, " {}", address)?;
        }
        write!(f, " {}", self.method)
    }
}

/// Generates the HBA rules of a db
///
/// The role names and auth methods are local keeper settings, not cluster
/// data, so they are fixed at construction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HbaGenerator {
    su_auth_method: String,
    su_username: String,
    repl_auth_method: String,
    repl_username: String,
}

impl HbaGenerator {
    pub fn new(
        su_auth_method: impl Into<String>,
        su_username: impl Into<String>,
        repl_auth_method: impl Into<String>,
        repl_username: impl Into<String>,
    ) -> Self {
        Self {
            su_auth_method: su_auth_method.into(),
            su_username: su_username.into(),
            repl_auth_method: repl_auth_method.into(),
            repl_username: repl_username.into(),
        }
    }

    pub fn from_config(config: &PostgresConfig) -> Self {
        Self::new(
            config.su_auth_method.as_str(),
            config.su_username.as_str(),
            config.repl_auth_method.as_str(),
            config.repl_username.as_str(),
        )
    }

    /// Rules for `db`, in the order they must appear in pg_hba.conf
    ///
    /// Equal inputs always give the same rules in the same order, so the
    /// result can be compared with the applied rules to detect changes.
    pub fn generate(&self, cd: &ClusterData, db: &Db) -> Vec<String> {
        self.entries(cd, db).iter().map(HbaEntry::to_string).collect()
    }

    /// Typed form of [`HbaGenerator::generate`]
    pub fn entries(&self, cd: &ClusterData, db: &Db) -> Vec<HbaEntry> {
        let su = self.su_username.as_str();
        let repl = self.repl_username.as_str();
        let su_method = self.su_auth_method.as_str();
        let repl_method = self.repl_auth_method.as_str();

        let mut rules = vec![
            HbaRule::local("postgres", su, su_method),
            HbaRule::local("replication", repl, repl_method),
        ];

        let mode = cd.cluster.spec.su_repl_access_mode();
        match (mode, db.is_master()) {
            (SuReplAccessMode::Strict, true) => {
                // Only the standbys replicating from this master may connect
                for follower in cd.internal_followers(&db.uid) {
                    let address = format!("{}/32", follower.status.listen_address);
                    rules.push(HbaRule::host("all", su, &address, su_method));
                    rules.push(HbaRule::host("replication", repl, &address, repl_method));
                }
            }
            (SuReplAccessMode::All, _) | (SuReplAccessMode::Strict, false) => {
                rules.extend([
                    HbaRule::host("all", su, IPV4_ANY, su_method),
                    HbaRule::host("all", su, IPV6_ANY, su_method),
                    HbaRule::host("replication", repl, IPV4_ANY, repl_method),
                    HbaRule::host("replication", repl, IPV6_ANY, repl_method),
                ]);
            }
        }

        tracing::debug!(
            "db {} ({}) gets {} superuser/replication host rules, access mode {}",
            db.uid,
            db.spec.role,
            rules.len() - 2,
            mode
        );

        let mut entries: Vec<HbaEntry> = rules.into_iter().map(HbaEntry::Rule).collect();
        if db.spec.pg_hba.is_empty() {
            entries.push(HbaEntry::Rule(HbaRule::host("all", "all", IPV4_ANY, su_method)));
            entries.push(HbaEntry::Rule(HbaRule::host("all", "all", IPV6_ANY, su_method)));
        } else {
            entries.extend(db.spec.pg_hba.iter().cloned().map(HbaEntry::Custom));
        }
        entries
    }
}

/// pg_hba.conf contents for the given rules, one per line
pub fn render_hba(rules: &[String]) -> String {
    let mut content = String::from("# Generated by pgkeeper. Local changes are overwritten.\n");
    for rule in rules {
        content.push_str(rule);
        content.push('\n');
    }
    content
}

/// Rules of an existing pg_hba.conf, skipping comments and blank lines
pub fn parse_hba(content: &str) -> Vec<String> {
    content
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .map(str::to_string)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::{Cluster, DbSpec, DbStatus, FollowConfig, Role};

    fn db(uid: &str, role: Role, follow: Option<&str>, address: &str) -> Db {
        let mut spec = DbSpec::new(format!("keeper-{}", uid), role);
        spec.follow_config = follow.map(FollowConfig::internal);
        Db {
            uid: uid.to_string(),
            generation: 1,
            spec,
            status: DbStatus {
                listen_address: address.to_string(),
                ..Default::default()
            },
        }
    }

    /// One master (db1) with two internal standbys
    fn cluster_data(mode: Option<SuReplAccessMode>) -> ClusterData {
        let mut cd = ClusterData::new(Cluster::default());
        cd.cluster.spec.default_su_repl_access_mode = mode;
        for db in [
            db("db1", Role::Master, None, "192.168.0.1"),
            db("db2", Role::Standby, Some("db1"), "192.168.0.2"),
            db("db3", Role::Standby, Some("db1"), "192.168.0.3"),
        ] {
            cd.dbs.insert(db.uid.clone(), db);
        }
        cd
    }

    fn generator() -> HbaGenerator {
        HbaGenerator::new("md5", "superuser", "md5", "repluser")
    }

    fn lines(v: &[&str]) -> Vec<String> {
        v.iter().map(|s| s.to_string()).collect()
    }

    const UNRESTRICTED: [&str; 4] = [
        "host all superuser 0.0.0.0/0 md5",
        "host all superuser ::0/0 md5",
        "host replication repluser 0.0.0.0/0 md5",
        "host replication repluser ::0/0 md5",
    ];

    #[test]
    fn test_generate_hba() {
        let custom = lines(&["host all all 192.168.0.0/24 md5"]);

        let all_default = [
            "local postgres superuser md5",
            "local replication repluser md5",
            "host all superuser 0.0.0.0/0 md5",
            "host all superuser ::0/0 md5",
            "host replication repluser 0.0.0.0/0 md5",
            "host replication repluser ::0/0 md5",
            "host all all 0.0.0.0/0 md5",
            "host all all ::0/0 md5",
        ];
        let all_custom = [
            "local postgres superuser md5",
            "local replication repluser md5",
            "host all superuser 0.0.0.0/0 md5",
            "host all superuser ::0/0 md5",
            "host replication repluser 0.0.0.0/0 md5",
            "host replication repluser ::0/0 md5",
            "host all all 192.168.0.0/24 md5",
        ];
        let strict_master = [
            "local postgres superuser md5",
            "local replication repluser md5",
            "host all superuser 192.168.0.2/32 md5",
            "host replication repluser 192.168.0.2/32 md5",
            "host all superuser 192.168.0.3/32 md5",
            "host replication repluser 192.168.0.3/32 md5",
            "host all all 0.0.0.0/0 md5",
            "host all all ::0/0 md5",
        ];

        let tests: Vec<(SuReplAccessMode, &str, Vec<String>, &[&str])> = vec![
            (SuReplAccessMode::All, "db1", vec![], &all_default[..]),
            (SuReplAccessMode::All, "db2", vec![], &all_default[..]),
            (SuReplAccessMode::All, "db1", custom.clone(), &all_custom[..]),
            (SuReplAccessMode::All, "db2", custom.clone(), &all_custom[..]),
            (SuReplAccessMode::Strict, "db1", vec![], &strict_master[..]),
            (SuReplAccessMode::Strict, "db2", vec![], &all_default[..]),
            (SuReplAccessMode::Strict, "db3", custom.clone(), &all_custom[..]),
        ];

        for (i, (mode, uid, pg_hba, expected)) in tests.into_iter().enumerate() {
            let mut cd = cluster_data(Some(mode));
            cd.dbs.get_mut(uid).unwrap().spec.pg_hba = pg_hba;

            let out = generator().generate(&cd, cd.db(uid).unwrap());
            assert_eq!(out, lines(expected), "#{}: wrong output", i);
        }
    }

    #[test]
    fn test_generate_is_deterministic() {
        let cd = cluster_data(Some(SuReplAccessMode::Strict));
        let master = cd.db("db1").unwrap();
        let first = generator().generate(&cd, master);
        for _ in 0..10 {
            assert_eq!(generator().generate(&cd.clone(), master), first);
        }
    }

    #[test]
    fn test_strict_master_orders_followers_by_uid() {
        let mut cd = cluster_data(Some(SuReplAccessMode::Strict));
        // Inserted after db2 and db3 but sorts first
        let extra = db("db0", Role::Standby, Some("db1"), "192.168.0.9");
        cd.dbs.insert(extra.uid.clone(), extra);
        // Follows another standby, not the master
        let cascade = db("db4", Role::Standby, Some("db2"), "192.168.0.4");
        cd.dbs.insert(cascade.uid.clone(), cascade);
        // Replicates from outside the cluster
        let mut external = db("db5", Role::Standby, None, "192.168.0.5");
        external.spec.follow_config = Some(FollowConfig::external());
        cd.dbs.insert(external.uid.clone(), external);

        let out = generator().generate(&cd, cd.db("db1").unwrap());
        assert_eq!(
            &out[2..8],
            lines(&[
                "host all superuser 192.168.0.9/32 md5",
                "host replication repluser 192.168.0.9/32 md5",
                "host all superuser 192.168.0.2/32 md5",
                "host replication repluser 192.168.0.2/32 md5",
                "host all superuser 192.168.0.3/32 md5",
                "host replication repluser 192.168.0.3/32 md5",
            ])
            .as_slice()
        );
        assert!(!out.iter().any(|r| r.contains("192.168.0.4")));
        assert!(!out.iter().any(|r| r.contains("192.168.0.5")));
        for rule in UNRESTRICTED {
            assert!(!out.contains(&rule.to_string()));
        }
    }

    #[test]
    fn test_strict_master_without_followers() {
        let mut cd = cluster_data(Some(SuReplAccessMode::Strict));
        cd.dbs.retain(|uid, _| uid == "db1");

        let out = generator().generate(&cd, cd.db("db1").unwrap());
        assert_eq!(
            out,
            lines(&[
                "local postgres superuser md5",
                "local replication repluser md5",
                "host all all 0.0.0.0/0 md5",
                "host all all ::0/0 md5",
            ])
        );
    }

    #[test]
    fn test_unset_access_mode_is_unrestricted() {
        let cd = cluster_data(None);
        let out = generator().generate(&cd, cd.db("db1").unwrap());
        assert_eq!(&out[2..6], lines(&UNRESTRICTED).as_slice());
    }

    #[test]
    fn test_distinct_methods_and_users() {
        let cd = cluster_data(Some(SuReplAccessMode::Strict));
        let generator = HbaGenerator::new("scram-sha-256", "postgres", "trust", "replicator");
        let out = generator.generate(&cd, cd.db("db1").unwrap());
        assert_eq!(out[0], "local postgres postgres scram-sha-256");
        assert_eq!(out[1], "local replication replicator trust");
        assert_eq!(out[2], "host all postgres 192.168.0.2/32 scram-sha-256");
        assert_eq!(out[3], "host replication replicator 192.168.0.2/32 trust");
        assert_eq!(out[out.len() - 1], "host all all ::0/0 scram-sha-256");
    }

    #[test]
    fn test_switching_access_mode_only_changes_su_repl_block() {
        let strict = cluster_data(Some(SuReplAccessMode::Strict));
        let all = cluster_data(Some(SuReplAccessMode::All));

        let before = generator().generate(&strict, strict.db("db1").unwrap());
        let after = generator().generate(&all, all.db("db1").unwrap());

        assert_ne!(before, after);
        assert_eq!(before[..2], after[..2]);
        assert_eq!(before[before.len() - 2..], after[after.len() - 2..]);
        assert_eq!(&after[2..after.len() - 2], lines(&UNRESTRICTED).as_slice());
    }

    #[test]
    fn test_render_and_parse_hba() {
        let cd = cluster_data(Some(SuReplAccessMode::All));
        let rules = generator().generate(&cd, cd.db("db2").unwrap());

        let content = render_hba(&rules);
        assert!(content.starts_with('#'));
        assert!(content.ends_with("host all all ::0/0 md5\n"));
        assert_eq!(parse_hba(&content), rules);
    }

    #[test]
    fn test_rule_display() {
        assert_eq!(
            HbaRule::local("postgres", "su", "md5").to_string(),
            "local postgres su md5"
        );
        assert_eq!(
            HbaEntry::Custom("hostssl all all 10.0.0.0/8 cert".into()).to_string(),
            "hostssl all all 10.0.0.0/8 cert"
        );
    }
}
