//! Runtime configuration
//!
//! Read once from the environment on first use.
//!
//! | Variable | Default | Description |
//! |----------|---------|-------------|
//! | `SPRIG_STACK_SIZE` | `1048576` | Default greenlet stack size in bytes |
//! | `SPRIG_DIAGNOSTICS` | unset | `1` or `true` installs the SIGQUIT diagnostics handler |
//!
//! ```bash
//! SPRIG_STACK_SIZE=262144 SPRIG_DIAGNOSTICS=1 ./my-program
//! ```

use std::sync::OnceLock;
use tracing::warn;

/// Default greenlet stack size: 1 MiB
pub const DEFAULT_STACK_SIZE: usize = 1024 * 1024;

/// Smallest stack size handed to the allocator; smaller requests are rounded up
pub const MIN_STACK_SIZE: usize = 64 * 1024;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeConfig {
    /// Stack size for greenlets spawned without an explicit size
    pub stack_size: usize,
    /// Install the SIGQUIT handler when the first thread registers
    pub diagnostics: bool,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            stack_size: DEFAULT_STACK_SIZE,
            diagnostics: false,
        }
    }
}

impl RuntimeConfig {
    /// Load configuration from environment variables
    pub fn from_env() -> Self {
        Self {
            stack_size: parse_stack_size(std::env::var("SPRIG_STACK_SIZE").ok()),
            diagnostics: parse_flag(std::env::var("SPRIG_DIAGNOSTICS").ok()),
        }
    }
}

static CONFIG: OnceLock<RuntimeConfig> = OnceLock::new();

/// Process-wide configuration, loaded from the environment on first call
pub fn config() -> &'static RuntimeConfig {
    CONFIG.get_or_init(RuntimeConfig::from_env)
}

/// Parse stack size from an optional string value.
/// Returns the parsed size, or DEFAULT_STACK_SIZE if the value is missing, zero, or invalid.
fn parse_stack_size(env_value: Option<String>) -> usize {
    match env_value {
        Some(val) => match val.trim().parse::<usize>() {
            Ok(0) => {
                warn!(
                    "SPRIG_STACK_SIZE=0 is invalid, using default {}",
                    DEFAULT_STACK_SIZE
                );
                DEFAULT_STACK_SIZE
            }
            Ok(size) => size.max(MIN_STACK_SIZE),
            Err(_) => {
                warn!(
                    "SPRIG_STACK_SIZE='{}' is not a valid number, using default {}",
                    val, DEFAULT_STACK_SIZE
                );
                DEFAULT_STACK_SIZE
            }
        },
        None => DEFAULT_STACK_SIZE,
    }
}

fn parse_flag(env_value: Option<String>) -> bool {
    matches!(
        env_value.as_deref().map(str::trim),
        Some("1") | Some("true") | Some("TRUE") | Some("yes")
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_stack_size_valid() {
        assert_eq!(parse_stack_size(Some("2097152".to_string())), 2097152);
    }

    #[test]
    fn test_parse_stack_size_none() {
        assert_eq!(parse_stack_size(None), DEFAULT_STACK_SIZE);
    }

    #[test]
    fn test_parse_stack_size_zero() {
        assert_eq!(parse_stack_size(Some("0".to_string())), DEFAULT_STACK_SIZE);
    }

    #[test]
    fn test_parse_stack_size_invalid() {
        assert_eq!(
            parse_stack_size(Some("lots".to_string())),
            DEFAULT_STACK_SIZE
        );
    }

    #[test]
    fn test_parse_stack_size_small_is_raised() {
        assert_eq!(parse_stack_size(Some("4096".to_string())), MIN_STACK_SIZE);
    }

    #[test]
    fn test_parse_flag() {
        assert!(parse_flag(Some("1".to_string())));
        assert!(parse_flag(Some("true".to_string())));
        assert!(!parse_flag(Some("0".to_string())));
        assert!(!parse_flag(None));
    }
}
