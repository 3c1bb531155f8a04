//! Identity generation for envelopes and subscribers.

use std::sync::atomic::{AtomicU64, Ordering};
use time::OffsetDateTime;

/// Produces process-unique identifiers of the form `<epoch-secs>.<counter>`.
///
/// Both parts are uppercase hexadecimal. The counter alone guarantees
/// uniqueness; the seconds part only makes ids roughly sortable by eye.
#[derive(Debug, Default)]
pub struct IdGenerator {
    counter: AtomicU64,
}

impl IdGenerator {
    /// Create a generator whose first id uses counter value 1.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            counter: AtomicU64::new(0),
        }
    }

    /// Allocate the next id.
    #[must_use]
    pub fn next_id(&self) -> String {
        let ctr = self.counter.fetch_add(1, Ordering::Relaxed) + 1;
        let secs = OffsetDateTime::now_utc().unix_timestamp();
        format!("{:X}.{:X}", secs, ctr)
    }
}
