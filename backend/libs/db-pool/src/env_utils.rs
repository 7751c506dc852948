//! Environment variable parsing utilities
//!
//! Pool tuning knobs are optional; a missing or unparsable value falls back to
//! the caller's default instead of failing startup.

use std::str::FromStr;

/// Parse an environment variable with a default fallback
///
/// # Example
/// ```ignore
/// let max: u32 = parse_env_with_default("DB_MAX_CONNECTIONS", 10);
/// ```
pub fn parse_env_with_default<T: FromStr>(key: &str, default: T) -> T {
    parse_env_optional(key).unwrap_or(default)
}

/// Parse an environment variable, returning `None` if missing or invalid
pub fn parse_env_optional<T: FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.trim().parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    #[serial_test::serial]
    fn test_parse_env_with_default() {
        let result: u32 = parse_env_with_default("DB_POOL_TEST_MISSING_VAR", 42);
        assert_eq!(result, 42);

        std::env::set_var("DB_POOL_TEST_PORT", " 8080 ");
        let result: u16 = parse_env_with_default("DB_POOL_TEST_PORT", 3000);
        assert_eq!(result, 8080);
        std::env::remove_var("DB_POOL_TEST_PORT");
    }

    #[test]
    #[serial_test::serial]
    fn test_parse_env_optional_rejects_garbage() {
        std::env::set_var("DB_POOL_TEST_OPT", "twelve");
        assert_eq!(parse_env_optional::<u32>("DB_POOL_TEST_OPT"), None);

        std::env::set_var("DB_POOL_TEST_OPT", "12");
        assert_eq!(parse_env_optional::<u32>("DB_POOL_TEST_OPT"), Some(12));
        std::env::remove_var("DB_POOL_TEST_OPT");
    }
}
