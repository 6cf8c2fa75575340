//! Tracing subscriber setup

use crate::config::LoggingConfig;
use crate::error::ChainError;
use std::str::FromStr;
use tracing::Level;

/// Install a global fmt subscriber at the configured level.
///
/// Returns `Ok(false)` when a subscriber was already installed (tests and
/// embedding applications may have set their own).
pub fn init(config: &LoggingConfig) -> Result<bool, ChainError> {
    let level = parse_level(&config.level)?;
    let installed = tracing_subscriber::fmt()
        .with_max_level(level)
        .with_target(false)
        .try_init()
        .is_ok();
    Ok(installed)
}

pub fn parse_level(level: &str) -> Result<Level, ChainError> {
    Level::from_str(level.trim())
        .map_err(|_| ChainError::ConfigError(format!("Unknown log level '{}'", level)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_level() {
        assert_eq!(parse_level("debug").unwrap(), Level::DEBUG);
        assert_eq!(parse_level(" WARN ").unwrap(), Level::WARN);
        assert!(parse_level("chatty").is_err());
    }

    #[test]
    fn test_init_twice_is_harmless() {
        let config = LoggingConfig::default();
        let _ = init(&config).unwrap();
        assert!(!init(&config).unwrap());
    }
}
