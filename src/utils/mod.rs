//! Shared helpers.

pub mod fingerprint;

pub use fingerprint::{canonical_json, fingerprint, fingerprint_value, Fingerprint};

/// Seconds since the Unix epoch as a float, used to stamp cache writes.
pub fn unix_timestamp() -> f64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}
