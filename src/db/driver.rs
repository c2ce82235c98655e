//! Thin contract between the query daemon and the database driver.
//!
//! The daemon never links a driver library; it executes SQL text against
//! whatever implements [`DbConnection`] and obtains connections from a
//! [`ConnectionFactory`]. Production code supplies a driver-backed
//! factory; tests supply in-memory fakes.

use crate::config::DbSettings;
use crate::error::Error;

/// Where and how to connect.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DbEndpoint {
    /// Server address.
    pub addr: String,
    /// Server port.
    pub port: u16,
    /// User name.
    pub username: String,
    /// Password.
    pub password: String,
    /// Schema selected after connecting.
    pub schema: String,
    /// Whether to negotiate TLS.
    pub use_ssl: bool,
    /// Connection character set.
    pub charset: String,
}

impl DbEndpoint {
    /// The primary endpoint described by `settings`.
    pub fn primary(settings: &DbSettings) -> Self {
        Self {
            addr: settings.primary_addr.clone(),
            port: settings.primary_port,
            username: settings.username.clone(),
            password: settings.password.clone(),
            schema: settings.schema.clone(),
            use_ssl: settings.use_ssl,
            charset: settings.charset.clone(),
        }
    }

    /// The replica endpoint, or `None` when no replica is configured and
    /// replica reads should reuse the primary connection.
    pub fn replica(settings: &DbSettings) -> Option<Self> {
        if settings.replica_addr.is_empty() {
            return None;
        }
        Some(Self {
            addr: settings.replica_addr.clone(),
            port: settings.replica_port,
            ..Self::primary(settings)
        })
    }
}

/// One established connection, owned by exactly one worker thread.
///
/// `execute` runs a statement; for statements producing rows, `fetch_row`
/// advances the cursor and the typed getters read columns of the current
/// row. `discard_result` drops any residual result state so the connection
/// is clean for the next statement.
pub trait DbConnection: Send {
    /// Executes `sql`. Failures carry the driver's `(code, message)`.
    fn execute(&mut self, sql: &str) -> Result<(), Error>;

    /// Advances to the next result row; `Ok(false)` when exhausted.
    fn fetch_row(&mut self) -> Result<bool, Error>;

    /// Signed integer column of the current row.
    fn get_signed(&self, column: &str) -> Option<i64>;

    /// Unsigned integer column of the current row.
    fn get_unsigned(&self, column: &str) -> Option<u64>;

    /// Floating-point column of the current row.
    fn get_double(&self, column: &str) -> Option<f64>;

    /// String column of the current row.
    fn get_string(&self, column: &str) -> Option<String>;

    /// Drops residual result state.
    fn discard_result(&mut self);
}

/// Establishes connections on demand.
///
/// Called from worker threads during reconnection, so implementations must
/// be shareable and may block.
pub trait ConnectionFactory: Send + Sync {
    /// Opens a connection to `endpoint`.
    fn connect(&self, endpoint: &DbEndpoint) -> Result<Box<dyn DbConnection>, Error>;
}
