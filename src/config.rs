//! Configuration
//!
//! Static configuration handed to the core at start-up. Loaded from
//! SHARDHERD_* environment variables; CLI and config-file parsing belong to
//! the caller.

use serde::Deserialize;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    // SQL access
    pub app_user: String,
    pub app_schema: String,
    pub root_user: String,
    pub repl_user: String,
    pub repl_password: String,
    pub default_port: u16,

    // Remote machine layout
    pub mysql_datadir: String,
    pub service_status_command: String,
    pub service_start_command: String,
    pub service_stop_command: String,

    // Behavior toggles
    /// Treat a half-stopped replica (exactly one of IO/SQL threads running)
    /// as a fatal fault instead of warning.
    pub strict_replication: bool,
    /// Allow a lenient-mode probe to pause a half-stopped replica. With the
    /// default, probing never mutates remote state.
    pub probe_may_repair: bool,

    // Concurrency & retries
    pub max_concurrency: usize,
    pub chunk_count: usize,
    pub chunk_retries: u32,
    pub command_retries: u32,

    // Shard provisioning
    pub standbys_per_shard: usize,
    pub backups_per_shard: usize,
    pub delete_batch_size: u64,
    pub export_dir: String,

    // Transfer pipeline
    pub transfer_port: u16,
    pub compress_command: Option<String>,
    pub decompress_command: Option<String>,
    pub encrypt_command: Option<String>,
    pub decrypt_command: Option<String>,

    // Timeouts
    pub promotion_timeout_secs: u64,
    pub catchup_timeout_secs: u64,
    pub listener_timeout_secs: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            app_user: "app".to_string(),
            app_schema: "app".to_string(),
            root_user: "root".to_string(),
            repl_user: "replication".to_string(),
            repl_password: String::new(),
            default_port: 3306,
            mysql_datadir: "/var/lib/mysql".to_string(),
            service_status_command: "service mysql status".to_string(),
            service_start_command: "service mysql start".to_string(),
            service_stop_command: "service mysql stop".to_string(),
            strict_replication: true,
            probe_may_repair: false,
            max_concurrency: 40,
            chunk_count: 8,
            chunk_retries: 10,
            command_retries: 3,
            standbys_per_shard: 2,
            backups_per_shard: 0,
            delete_batch_size: 1000,
            export_dir: "/var/tmp".to_string(),
            transfer_port: 7000,
            compress_command: None,
            decompress_command: None,
            encrypt_command: None,
            decrypt_command: None,
            promotion_timeout_secs: 86_400,
            catchup_timeout_secs: 3_600,
            listener_timeout_secs: 30,
        }
    }
}

fn env_str(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_bool(key: &str, default: bool) -> bool {
    std::env::var(key)
        .map(|v| v == "1" || v.to_lowercase() == "true")
        .unwrap_or(default)
}

pub fn load_config() -> anyhow::Result<Config> {
    let defaults = Config::default();

    Ok(Config {
        app_user: env_str("SHARDHERD_APP_USER", &defaults.app_user),
        app_schema: env_str("SHARDHERD_APP_SCHEMA", &defaults.app_schema),
        root_user: env_str("SHARDHERD_ROOT_USER", &defaults.root_user),
        repl_user: env_str("SHARDHERD_REPL_USER", &defaults.repl_user),
        repl_password: env_str("SHARDHERD_REPL_PASSWORD", &defaults.repl_password),
        default_port: env_parse("SHARDHERD_DEFAULT_PORT", defaults.default_port),
        mysql_datadir: env_str("SHARDHERD_MYSQL_DATADIR", &defaults.mysql_datadir),
        service_status_command: env_str(
            "SHARDHERD_SERVICE_STATUS_COMMAND",
            &defaults.service_status_command,
        ),
        service_start_command: env_str(
            "SHARDHERD_SERVICE_START_COMMAND",
            &defaults.service_start_command,
        ),
        service_stop_command: env_str(
            "SHARDHERD_SERVICE_STOP_COMMAND",
            &defaults.service_stop_command,
        ),
        strict_replication: env_bool("SHARDHERD_STRICT_REPLICATION", defaults.strict_replication),
        probe_may_repair: env_bool("SHARDHERD_PROBE_MAY_REPAIR", defaults.probe_may_repair),
        max_concurrency: env_parse("SHARDHERD_MAX_CONCURRENCY", defaults.max_concurrency),
        chunk_count: env_parse("SHARDHERD_CHUNK_COUNT", defaults.chunk_count),
        chunk_retries: env_parse("SHARDHERD_CHUNK_RETRIES", defaults.chunk_retries),
        command_retries: env_parse("SHARDHERD_COMMAND_RETRIES", defaults.command_retries),
        standbys_per_shard: env_parse("SHARDHERD_STANDBYS_PER_SHARD", defaults.standbys_per_shard),
        backups_per_shard: env_parse("SHARDHERD_BACKUPS_PER_SHARD", defaults.backups_per_shard),
        delete_batch_size: env_parse("SHARDHERD_DELETE_BATCH_SIZE", defaults.delete_batch_size),
        export_dir: env_str("SHARDHERD_EXPORT_DIR", &defaults.export_dir),
        transfer_port: env_parse("SHARDHERD_TRANSFER_PORT", defaults.transfer_port),
        compress_command: std::env::var("SHARDHERD_COMPRESS_COMMAND").ok(),
        decompress_command: std::env::var("SHARDHERD_DECOMPRESS_COMMAND").ok(),
        encrypt_command: std::env::var("SHARDHERD_ENCRYPT_COMMAND").ok(),
        decrypt_command: std::env::var("SHARDHERD_DECRYPT_COMMAND").ok(),
        promotion_timeout_secs: env_parse(
            "SHARDHERD_PROMOTION_TIMEOUT_SECS",
            defaults.promotion_timeout_secs,
        ),
        catchup_timeout_secs: env_parse(
            "SHARDHERD_CATCHUP_TIMEOUT_SECS",
            defaults.catchup_timeout_secs,
        ),
        listener_timeout_secs: env_parse(
            "SHARDHERD_LISTENER_TIMEOUT_SECS",
            defaults.listener_timeout_secs,
        ),
    })
}
