//! Configuration key names consumed by this crate.

/// Address of the primary database server.
pub const DB_PRIMARY_ADDR: &str = "db_primary_addr";
/// Port of the primary database server.
pub const DB_PRIMARY_PORT: &str = "db_primary_port";
/// Address of the replica server; empty reuses the primary.
pub const DB_REPLICA_ADDR: &str = "db_replica_addr";
/// Port of the replica server.
pub const DB_REPLICA_PORT: &str = "db_replica_port";
/// Database user name.
pub const DB_USERNAME: &str = "db_username";
/// Database password.
pub const DB_PASSWORD: &str = "db_password";
/// Schema selected after connecting.
pub const DB_SCHEMA: &str = "db_schema";
/// Whether connections use TLS.
pub const DB_USE_SSL: &str = "db_use_ssl";
/// Connection character set.
pub const DB_CHARSET: &str = "db_charset";
/// Size of the query worker pool; zero disables database support.
pub const DB_MAX_THREAD_COUNT: &str = "db_max_thread_count";
/// Milliseconds a write may linger in a queue before execution.
pub const DB_SAVE_DELAY: &str = "db_save_delay";
/// Milliseconds between reconnection attempts.
pub const DB_RECONN_DELAY: &str = "db_reconn_delay";
/// Attempts before a failing query is spilled to the dump file.
pub const DB_MAX_RETRY_COUNT: &str = "db_max_retry_count";
/// Base of the exponential retry delay, in milliseconds.
pub const DB_RETRY_INIT_DELAY: &str = "db_retry_init_delay";
/// Directory for SQL dump files; empty disables dumping.
pub const DB_DUMP_DIR: &str = "db_dump_dir";
