//! pgkeeper - PostgreSQL High-Availability Keeper
//!
//! Command line front end: generates the local configuration of one
//! instance from a cluster data snapshot.

use std::path::{Path, PathBuf};

use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use pgkeeper::cluster::ClusterData;
use pgkeeper::config::{KeeperConfig, LoggingConfig};
use pgkeeper::error::{Error, Result};
use pgkeeper::keeper::{parse_hba, parse_synchronous_standby_names, render_hba, Keeper};

/// pgkeeper - PostgreSQL High-Availability Keeper
#[derive(Parser)]
#[command(name = "pgkeeper")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "pgkeeper.toml")]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error), overrides the config file
    #[arg(short, long)]
    log_level: Option<String>,

    /// Log format (pretty, json), overrides the config file
    #[arg(long)]
    log_format: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize a new configuration file
    Init {
        /// Output path for configuration file
        #[arg(short, long, default_value = "pgkeeper.toml")]
        output: PathBuf,

        /// Keeper UID
        #[arg(long, default_value = "keeper0")]
        keeper_uid: String,
    },

    /// Validate configuration file
    Validate,

    /// Generate the pg_hba.conf rules of a db
    Hba {
        /// Cluster data snapshot (JSON)
        #[arg(long)]
        cluster_data: PathBuf,

        /// Db UID (defaults to the db assigned to this keeper)
        #[arg(long)]
        db: Option<String>,

        /// Write the rules to this file instead of stdout
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Parse a synchronous_standby_names value
    SyncStandbys {
        /// Setting value, e.g. "2 (stolon_a,stolon_b)"
        value: String,
    },

    /// Show what the local instance needs to converge
    Plan {
        /// Cluster data snapshot (JSON)
        #[arg(long)]
        cluster_data: PathBuf,

        /// Live synchronous_standby_names value
        #[arg(long)]
        live_sync: Option<String>,

        /// Currently applied pg_hba.conf
        #[arg(long)]
        current_hba: Option<PathBuf>,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging; the config file may not exist yet (init)
    let logging = KeeperConfig::from_file(&cli.config)
        .map(|config| config.logging)
        .unwrap_or_default()
        .with_overrides(cli.log_level.clone(), cli.log_format.clone());
    init_logging(&logging);

    match cli.command {
        Commands::Init { output, keeper_uid } => run_init(output, keeper_uid),
        Commands::Validate => run_validate(cli.config),
        Commands::Hba { cluster_data, db, output } => run_hba(cli.config, cluster_data, db, output),
        Commands::SyncStandbys { value } => run_sync_standbys(&value),
        Commands::Plan { cluster_data, live_sync, current_hba } => {
            run_plan(cli.config, cluster_data, live_sync, current_hba)
        }
    }
}

/// Initialize logging
fn init_logging(logging: &LoggingConfig) {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| logging.level.as_str().into());

    // stdout carries command output
    let registry = tracing_subscriber::registry().with(env_filter);
    if logging.format == "json" {
        registry
            .with(tracing_subscriber::fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        registry
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .init();
    }
}

/// Load and validate the configuration, logging why it failed
fn load_config(config_path: &Path) -> Result<KeeperConfig> {
    match KeeperConfig::from_file(config_path) {
        Ok(config) => {
            tracing::debug!("Loaded configuration for keeper: {}", config.keeper.uid);
            Ok(config)
        }
        Err(e) => {
            tracing::error!("Failed to load configuration from {:?}: {}", config_path, e);
            Err(e)
        }
    }
}

/// Load a snapshot and check the invariants the keeper relies on
fn load_cluster_data(path: &Path) -> Result<ClusterData> {
    let cd = ClusterData::from_file(path)?;
    if let Err(e) = cd.check_integrity() {
        tracing::error!("Cluster data {:?} is inconsistent: {}", path, e);
        return Err(e);
    }
    tracing::debug!("Loaded cluster data with {} dbs", cd.dbs.len());
    Ok(cd)
}

/// Initialize configuration file
fn run_init(output: PathBuf, keeper_uid: String) -> Result<()> {
    let config_content = format!(r#"# pgkeeper Configuration
# Generated configuration file

[keeper]
uid = "{keeper_uid}"
data_dir = "/var/lib/pgkeeper/{keeper_uid}"

[postgres]
listen_address = "127.0.0.1"
port = 5432
su_username = "postgres"
su_auth_method = "md5"
su_password = "changeme"
repl_username = "repluser"
repl_auth_method = "md5"
repl_password = "changeme"

[logging]
level = "info"
format = "pretty"
"#);

    std::fs::write(&output, config_content)?;
    println!("Configuration file created: {}", output.display());
    println!("\nEdit the file to set the PostgreSQL roles and passwords.");
    println!("Then check it with: pgkeeper --config {} validate", output.display());

    Ok(())
}

/// Validate configuration
fn run_validate(config_path: PathBuf) -> Result<()> {
    match KeeperConfig::from_file(&config_path) {
        Ok(config) => {
            println!("✓ Configuration is valid");
            println!("  Keeper UID: {}", config.keeper.uid);
            println!("  Listen Address: {}:{}", config.postgres.listen_address, config.postgres.port);
            println!("  Superuser: {} ({})", config.postgres.su_username, config.postgres.su_auth_method);
            println!("  Replication: {} ({})", config.postgres.repl_username, config.postgres.repl_auth_method);
            println!("  pg_hba.conf: {}", config.hba_path().display());
            Ok(())
        }
        Err(e) => {
            eprintln!("✗ Configuration error: {}", e);
            Err(e)
        }
    }
}

/// Generate pg_hba.conf rules
fn run_hba(
    config_path: PathBuf,
    cluster_data: PathBuf,
    db_uid: Option<String>,
    output: Option<PathBuf>,
) -> Result<()> {
    let config = load_config(&config_path)?;
    let cd = load_cluster_data(&cluster_data)?;
    let keeper = Keeper::new(&config);

    let db = match &db_uid {
        Some(uid) => cd.require_db(uid)?,
        None => cd
            .db_for_keeper(keeper.uid())
            .ok_or_else(|| Error::DbNotFound(keeper.uid().to_string()))?,
    };

    let rules = keeper.hba_generator().generate(&cd, db);
    let content = render_hba(&rules);

    match output {
        Some(path) => {
            write_atomically(&path, &content)?;
            tracing::info!("Wrote {} rules for db {} to {:?}", rules.len(), db.uid, path);
        }
        None => print!("{}", content),
    }
    Ok(())
}

/// Replace a file without exposing a partially written one to readers
fn write_atomically(path: &Path, content: &str) -> Result<()> {
    let tmp = path.with_extension("tmp");
    std::fs::write(&tmp, content)?;
    std::fs::rename(&tmp, path)?;
    Ok(())
}

/// Parse a synchronous_standby_names value
fn run_sync_standbys(value: &str) -> Result<()> {
    let parsed = parse_synchronous_standby_names(value);
    for name in &parsed.names {
        println!("{}", name);
    }
    match parsed.error {
        Some(e) => {
            eprintln!("✗ {}", e);
            Err(e)
        }
        None => Ok(()),
    }
}

/// Show the reconcile plan of this keeper
fn run_plan(
    config_path: PathBuf,
    cluster_data: PathBuf,
    live_sync: Option<String>,
    current_hba: Option<PathBuf>,
) -> Result<()> {
    let config = load_config(&config_path)?;
    let cd = load_cluster_data(&cluster_data)?;
    let keeper = Keeper::new(&config);

    let current_hba_path = current_hba.unwrap_or_else(|| config.hba_path());
    let current = match std::fs::read_to_string(&current_hba_path) {
        Ok(content) => parse_hba(&content),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            tracing::warn!("No pg_hba.conf at {:?}", current_hba_path);
            Vec::new()
        }
        Err(e) => return Err(e.into()),
    };

    let plan = keeper.plan(&cd, &current, live_sync.as_deref())?;

    println!("Keeper {} (db {})", keeper.uid(), plan.db_uid);
    println!("==========================");
    println!();
    println!("pg_hba.conf:      {}", if plan.hba_changed { "update required" } else { "up to date" });
    for rule in &plan.hba {
        println!("  {}", rule);
    }
    println!();
    println!("Synchronous standbys:");
    println!("  Desired:        {:?}", plan.synchronous_standby_names);
    println!("  Live:           {:?}", live_sync.as_deref().unwrap_or(""));
    println!("  Converged:      {}", if plan.sync_converged { "yes" } else { "no" });

    Ok(())
}
