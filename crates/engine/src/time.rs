//! Validation of time-valued connector parameters.

use cellar_common::ConfigError;
use serde::Deserialize;
use std::time::Duration;

/// A time parameter as it arrives from configuration: seconds as a number,
/// an already-typed duration, or text that must hold a number of seconds.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum TimeParam {
    Seconds(f64),
    #[serde(skip)]
    Duration(Duration),
    Text(String),
}

impl From<f64> for TimeParam {
    fn from(seconds: f64) -> Self {
        TimeParam::Seconds(seconds)
    }
}

impl From<i64> for TimeParam {
    fn from(seconds: i64) -> Self {
        TimeParam::Seconds(seconds as f64)
    }
}

impl From<Duration> for TimeParam {
    fn from(duration: Duration) -> Self {
        TimeParam::Duration(duration)
    }
}

impl From<&str> for TimeParam {
    fn from(text: &str) -> Self {
        TimeParam::Text(text.to_string())
    }
}

impl TimeParam {
    fn seconds(&self, param: &str) -> Result<f64, ConfigError> {
        match self {
            TimeParam::Seconds(s) => Ok(*s),
            TimeParam::Duration(d) => Ok(d.as_secs_f64()),
            TimeParam::Text(text) => text
                .trim()
                .parse::<f64>()
                .map_err(|_| ConfigError::invalid_type(param, "a number of seconds")),
        }
    }
}

/// Accepts only values strictly greater than one second.
///
/// Applies to `init_delay` and `time_per_file`.
pub fn check_time_param(param: &str, value: impl Into<TimeParam>) -> Result<Duration, ConfigError> {
    let seconds = value.into().seconds(param)?;
    if !seconds.is_finite() || seconds <= 1.0 {
        return Err(ConfigError::invalid_value(
            param,
            format!("{} is not more than one second", seconds),
        ));
    }
    Ok(Duration::from_secs_f64(seconds))
}

/// Accepts any finite positive number of seconds.
pub fn check_interval(param: &str, value: impl Into<TimeParam>) -> Result<Duration, ConfigError> {
    let seconds = value.into().seconds(param)?;
    if !seconds.is_finite() || seconds <= 0.0 {
        return Err(ConfigError::invalid_value(param, format!("{} is not a positive interval", seconds)));
    }
    Ok(Duration::from_secs_f64(seconds))
}
