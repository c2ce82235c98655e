//! Contract for persistable records.
//!
//! A record that wants to be saved through the daemon implements
//! [`DbObject`] and embeds a [`WriteStamp`]. The stamp is how repeated
//! writes of the same object collapse: each queued write stores its own
//! generation serial into the stamp, so at execution time an entry can tell
//! whether it is still the latest write or has been superseded.

use std::sync::atomic::{AtomicU64, Ordering};

use crate::error::Error;

use super::driver::DbConnection;

/// Generation cell for write coalescing. Zero means "no queued write".
///
/// The value is the serial of the most recently queued write entry for the
/// owning object, maintained by the daemon; record types only need to
/// embed one and hand it out via [`DbObject::write_stamp`].
#[derive(Debug, Default)]
pub struct WriteStamp(AtomicU64);

impl WriteStamp {
    /// Creates a clear stamp.
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn load(&self) -> u64 {
        self.0.load(Ordering::Acquire)
    }

    pub(crate) fn store(&self, serial: u64) {
        self.0.store(serial, Ordering::Release);
    }

    pub(crate) fn clear(&self) {
        self.0.store(0, Ordering::Release);
    }
}

/// A record the query daemon can save and load.
///
/// Implementations serialize themselves as SQL column assignments and
/// refill themselves from a fetched row. Field storage needs interior
/// mutability: the daemon holds objects behind shared references and calls
/// [`DbObject::fetch`] from a worker thread.
pub trait DbObject: Send + Sync {
    /// Target table name, without quoting.
    fn table(&self) -> &str;

    /// Appends this object's column assignments to `query` in the form
    /// `` `column` = value, `` — trailing separators are trimmed by the
    /// caller.
    fn generate_sql(&self, query: &mut String);

    /// Fills the object's fields from the connection's current row.
    fn fetch(&self, conn: &mut dyn DbConnection) -> Result<(), Error>;

    /// The coalescing stamp embedded in this object.
    fn write_stamp(&self) -> &WriteStamp;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stamp_starts_clear() {
        let stamp = WriteStamp::new();
        assert_eq!(stamp.load(), 0);
    }

    #[test]
    fn test_stamp_store_and_clear() {
        let stamp = WriteStamp::new();
        stamp.store(42);
        assert_eq!(stamp.load(), 42);
        stamp.store(43);
        assert_eq!(stamp.load(), 43);
        stamp.clear();
        assert_eq!(stamp.load(), 0);
    }
}
