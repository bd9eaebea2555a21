use std::str::FromStr;
use std::time::Duration;

use crate::error::ConfigError;

/// Read an env var, treating unset and blank values the same.
pub(crate) fn optional_env(key: &str) -> Result<Option<String>, ConfigError> {
    match std::env::var(key) {
        Ok(value) if value.trim().is_empty() => Ok(None),
        Ok(value) => Ok(Some(value.trim().to_string())),
        Err(std::env::VarError::NotPresent) => Ok(None),
        Err(std::env::VarError::NotUnicode(_)) => Err(ConfigError::InvalidValue {
            key: key.to_string(),
            message: "value is not valid UTF-8".to_string(),
        }),
    }
}

/// Parse an env var into `T`, reporting the key on failure.
pub(crate) fn parse_env<T>(key: &str, expected: &str) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    optional_env(key)?
        .map(|s| s.parse::<T>())
        .transpose()
        .map_err(|e| ConfigError::InvalidValue {
            key: key.to_string(),
            message: format!("must be {expected}: {e}"),
        })
}

/// Resolve a millisecond duration: env var, then file value, then default.
/// Zero is allowed.
pub(crate) fn duration_ms_or_zero(
    key: &str,
    from_file: Option<u64>,
    default_ms: u64,
) -> Result<Duration, ConfigError> {
    let ms = parse_env::<u64>(key, "a whole number of milliseconds")?
        .or(from_file)
        .unwrap_or(default_ms);
    Ok(Duration::from_millis(ms))
}

/// Like [`duration_ms_or_zero`], but zero is rejected.
pub(crate) fn duration_ms(
    key: &str,
    from_file: Option<u64>,
    default_ms: u64,
) -> Result<Duration, ConfigError> {
    let duration = duration_ms_or_zero(key, from_file, default_ms)?;
    if duration.is_zero() {
        return Err(ConfigError::InvalidValue {
            key: key.to_string(),
            message: "must be greater than zero".to_string(),
        });
    }
    Ok(duration)
}
