//! Typed settings assembled from the configuration map.

use super::{keys, ConfigMap};

/// Settings for the database query daemon.
#[derive(Debug, Clone)]
pub struct DbSettings {
    /// Primary server address.
    pub primary_addr: String,
    /// Primary server port.
    pub primary_port: u16,
    /// Replica server address; empty means "reuse the primary".
    pub replica_addr: String,
    /// Replica server port.
    pub replica_port: u16,
    /// User name presented to the server.
    pub username: String,
    /// Password presented to the server.
    pub password: String,
    /// Schema selected after connecting.
    pub schema: String,
    /// Whether to negotiate TLS.
    pub use_ssl: bool,
    /// Connection character set.
    pub charset: String,
    /// Worker pool size; zero disables the daemon.
    pub max_thread_count: usize,
    /// Write deferral window in milliseconds.
    pub save_delay: u64,
    /// Delay between reconnection attempts in milliseconds.
    pub reconnect_delay: u64,
    /// Attempts before a query is dumped.
    pub max_retry_count: usize,
    /// Base retry delay in milliseconds, doubled per attempt.
    pub retry_init_delay: u64,
    /// Dump directory; empty disables dumping.
    pub dump_dir: String,
}

impl DbSettings {
    /// Reads the `db_*` keys out of `config`, applying defaults for any
    /// that are absent.
    pub fn from_config(config: &ConfigMap) -> Self {
        Self {
            primary_addr: config.get_or(keys::DB_PRIMARY_ADDR, "localhost".into()),
            primary_port: config.get_or(keys::DB_PRIMARY_PORT, 3306),
            replica_addr: config.get_or(keys::DB_REPLICA_ADDR, String::new()),
            replica_port: config.get_or(keys::DB_REPLICA_PORT, 3306),
            username: config.get_or(keys::DB_USERNAME, "root".into()),
            password: config.get_or(keys::DB_PASSWORD, String::new()),
            schema: config.get_or(keys::DB_SCHEMA, "capstan".into()),
            use_ssl: config.get_or(keys::DB_USE_SSL, false),
            charset: config.get_or(keys::DB_CHARSET, "utf8".into()),
            max_thread_count: config.get_or(keys::DB_MAX_THREAD_COUNT, 3),
            save_delay: config.get_or(keys::DB_SAVE_DELAY, 5000),
            reconnect_delay: config.get_or(keys::DB_RECONN_DELAY, 5000),
            max_retry_count: config.get_or(keys::DB_MAX_RETRY_COUNT, 3),
            retry_init_delay: config.get_or(keys::DB_RETRY_INIT_DELAY, 1000),
            dump_dir: config.get_or(keys::DB_DUMP_DIR, String::new()),
        }
    }
}

impl Default for DbSettings {
    fn default() -> Self {
        Self::from_config(&ConfigMap::new())
    }
}
