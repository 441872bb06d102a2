//! ID generation utilities for loopd
//!
//! Provides functions for generating unique identifiers for loops, queue items
//! and owner instances.

use rand::Rng;

/// Minimum length of a loop short id.
pub const SHORT_ID_MIN_LEN: usize = 6;

/// Get current timestamp in milliseconds since Unix epoch
pub fn now_ms() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

/// Generate a unique loop ID
///
/// Format: 16 lowercase hex characters
/// Example: `3f9a0c1d7b2e4a55`
pub fn generate_loop_id() -> String {
    let random: u64 = rand::rng().random();
    format!("{:016x}", random)
}

/// Generate a queue item ID
///
/// Format: `qi-{timestamp_ms}-{random_hex}`
pub fn generate_item_id() -> String {
    let random: u32 = rand::rng().random();
    format!("qi-{}-{:08x}", now_ms(), random)
}

/// Generate an owner instance ID
///
/// Format: `{kind}-{pid}-{random_hex}`
/// Example: `daemon-4121-9c2f01ab`
pub fn generate_instance_id(kind: &str) -> String {
    let random: u32 = rand::rng().random();
    format!("{}-{}-{:08x}", kind, std::process::id(), random)
}

/// Shortest prefix of `id` (at least [`SHORT_ID_MIN_LEN`] chars) that no other
/// id in `existing` starts with.
pub fn short_id_for<'a>(id: &str, existing: impl IntoIterator<Item = &'a str>) -> String {
    let others: Vec<&str> = existing.into_iter().filter(|other| *other != id).collect();
    let min = SHORT_ID_MIN_LEN.min(id.len());
    for len in min..=id.len() {
        let prefix = &id[..len];
        if !others.iter().any(|other| other.starts_with(prefix)) {
            return prefix.to_string();
        }
    }
    id.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_now_ms_returns_reasonable_timestamp() {
        let ts = now_ms();
        assert!(ts > 1577836800000); // 2020-01-01
        assert!(ts < 4102444800000); // 2100-01-01
    }

    #[test]
    fn test_generate_loop_id_format() {
        let id = generate_loop_id();
        assert_eq!(id.len(), 16);
        assert!(id.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_generate_loop_id_uniqueness() {
        assert_ne!(generate_loop_id(), generate_loop_id());
    }

    #[test]
    fn test_generate_item_id_format() {
        let id = generate_item_id();
        let parts: Vec<&str> = id.split('-').collect();
        assert_eq!(parts.len(), 3);
        assert_eq!(parts[0], "qi");
        assert!(parts[1].chars().all(|c| c.is_ascii_digit()));
        assert_eq!(parts[2].len(), 8);
    }

    #[test]
    fn test_generate_instance_id_includes_kind_and_pid() {
        let id = generate_instance_id("daemon");
        assert!(id.starts_with("daemon-"));
        assert!(id.contains(&std::process::id().to_string()));
    }

    #[test]
    fn test_short_id_minimum_length() {
        let short = short_id_for("abcdef0123456789", ["0000000000000000"]);
        assert_eq!(short, "abcdef");
    }

    #[test]
    fn test_short_id_extends_past_shared_prefix() {
        let short = short_id_for("abcdef0123456789", ["abcdef01ffffffff", "abcdef0123456789"]);
        assert_eq!(short, "abcdef012");
    }

    #[test]
    fn test_short_id_of_short_input() {
        assert_eq!(short_id_for("abc", std::iter::empty()), "abc");
    }
}
