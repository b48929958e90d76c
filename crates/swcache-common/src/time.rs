//! Wall-clock helpers.

use std::time::{SystemTime, UNIX_EPOCH};

/// Milliseconds since the Unix epoch.
///
/// A clock set before 1970 yields 0 rather than an error; capture timestamps
/// are informational only.
pub fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unix_millis_monotonic_enough() {
        let a = unix_millis();
        let b = unix_millis();
        assert!(a > 0);
        assert!(b >= a);
    }
}
