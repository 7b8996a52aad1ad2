//! # Environment Overrides
//!
//! Session knobs that can be set without touching the command line:
//!
//! - `ARMTRAP_DEATH_POLL_MS`: death watcher interval in milliseconds
//! - `ARMTRAP_LOAD_BASE`: link-time base of the main image, hex (`0x...`)
//!   or decimal
//!
//! This crate does not depend on the core library; the binary applies the
//! parsed values to its session configuration.

use std::env;
use std::time::Duration;

use thiserror::Error;

/// Environment variable for the death watcher interval.
pub const DEATH_POLL_VAR: &str = "ARMTRAP_DEATH_POLL_MS";

/// Environment variable for the default load base.
pub const LOAD_BASE_VAR: &str = "ARMTRAP_LOAD_BASE";

/// A variable was set to something unusable.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError
{
    /// Not a number
    #[error("{var}={value:?} is not a valid number")]
    InvalidNumber
    {
        /// Variable name
        var: String,
        /// Offending value
        value: String,
    },

    /// A number outside the accepted range
    #[error("{var}={value:?} is out of range: {reason}")]
    OutOfRange
    {
        /// Variable name
        var: String,
        /// Offending value
        value: String,
        /// What was expected
        reason: &'static str,
    },
}

/// Values found in the environment; `None` means unset.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EnvOverrides
{
    pub death_poll_interval: Option<Duration>,
    pub load_base: Option<u64>,
}

impl EnvOverrides
{
    /// Read the process environment.
    ///
    /// ## Errors
    ///
    /// A [`ConfigError`] naming the first variable that does not parse.
    pub fn from_env() -> Result<Self, ConfigError>
    {
        Self::from_lookup(|name| env::var(name).ok())
    }

    /// Same as [`EnvOverrides::from_env`] with an injectable lookup.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError>
    {
        let death_poll_interval = match lookup(DEATH_POLL_VAR) {
            Some(value) => {
                let millis = parse_u64(&value).ok_or_else(|| invalid(DEATH_POLL_VAR, &value))?;
                if millis == 0 {
                    return Err(ConfigError::OutOfRange {
                        var: DEATH_POLL_VAR.to_string(),
                        value,
                        reason: "interval must be at least 1 ms",
                    });
                }
                Some(Duration::from_millis(millis))
            }
            None => None,
        };

        let load_base = match lookup(LOAD_BASE_VAR) {
            Some(value) => Some(parse_address(&value).ok_or_else(|| invalid(LOAD_BASE_VAR, &value))?),
            None => None,
        };

        Ok(Self {
            death_poll_interval,
            load_base,
        })
    }
}

fn invalid(var: &str, value: &str) -> ConfigError
{
    ConfigError::InvalidNumber {
        var: var.to_string(),
        value: value.to_string(),
    }
}

fn parse_u64(value: &str) -> Option<u64>
{
    value.trim().replace('_', "").parse().ok()
}

/// Parse an address written as `0x`-prefixed hex or as decimal.
///
/// Underscores are ignored, so `0x1_0000_0000` works.
pub fn parse_address(value: &str) -> Option<u64>
{
    let cleaned = value.trim().replace('_', "");
    match cleaned.strip_prefix("0x").or_else(|| cleaned.strip_prefix("0X")) {
        Some(hex) => u64::from_str_radix(hex, 16).ok(),
        None => cleaned.parse().ok(),
    }
}

#[cfg(test)]
mod tests
{
    use super::*;

    fn lookup(pairs: &'static [(&'static str, &'static str)]) -> impl Fn(&str) -> Option<String>
    {
        move |name| {
            pairs
                .iter()
                .find(|(key, _)| *key == name)
                .map(|(_, value)| (*value).to_string())
        }
    }

    #[test]
    fn test_parse_address_forms()
    {
        assert_eq!(parse_address("0x1_0000_0000"), Some(0x1_0000_0000));
        assert_eq!(parse_address("0XfF"), Some(0xff));
        assert_eq!(parse_address(" 4096 "), Some(4096));
        assert_eq!(parse_address("0x"), None);
        assert_eq!(parse_address("main"), None);
    }

    #[test]
    fn test_unset_environment_gives_no_overrides()
    {
        assert_eq!(EnvOverrides::from_lookup(lookup(&[])).unwrap(), EnvOverrides::default());
    }

    #[test]
    fn test_overrides_are_parsed()
    {
        let overrides =
            EnvOverrides::from_lookup(lookup(&[(DEATH_POLL_VAR, "250"), (LOAD_BASE_VAR, "0x100004000")])).unwrap();
        assert_eq!(overrides.death_poll_interval, Some(Duration::from_millis(250)));
        assert_eq!(overrides.load_base, Some(0x1_0000_4000));
    }

    #[test]
    fn test_bad_values_name_the_variable()
    {
        let err = EnvOverrides::from_lookup(lookup(&[(LOAD_BASE_VAR, "0xzz")])).unwrap_err();
        assert_eq!(
            err,
            ConfigError::InvalidNumber {
                var: LOAD_BASE_VAR.to_string(),
                value: "0xzz".to_string()
            }
        );

        let err = EnvOverrides::from_lookup(lookup(&[(DEATH_POLL_VAR, "0")])).unwrap_err();
        assert!(matches!(err, ConfigError::OutOfRange { .. }));
    }
}
