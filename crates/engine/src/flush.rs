//! When a write destination is closed.

use crate::time::{check_time_param, TimeParam};
use cellar_common::ConfigError;
use std::time::Duration;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum FlushPolicy {
    /// Close on window punctuation (and at end of stream).
    #[default]
    OnPunctuation,
    TimeInterval(Duration),
    TupleCount(u64),
    ByteCount(u64),
}

impl FlushPolicy {
    /// Selects the policy from the three mutually exclusive write options.
    ///
    /// Two or more set is a `Conflict` naming them; none set closes on
    /// punctuation only.
    pub fn from_options(
        time_per_file: Option<TimeParam>,
        tuples_per_file: Option<u64>,
        bytes_per_file: Option<u64>,
    ) -> Result<Self, ConfigError> {
        let mut chosen = Vec::new();
        if time_per_file.is_some() {
            chosen.push("time_per_file".to_string());
        }
        if tuples_per_file.is_some() {
            chosen.push("tuples_per_file".to_string());
        }
        if bytes_per_file.is_some() {
            chosen.push("bytes_per_file".to_string());
        }
        if chosen.len() > 1 {
            return Err(ConfigError::Conflict(chosen));
        }

        match (time_per_file, tuples_per_file, bytes_per_file) {
            (Some(time), _, _) => Ok(FlushPolicy::TimeInterval(check_time_param("time_per_file", time)?)),
            (_, Some(0), _) => Err(ConfigError::invalid_value("tuples_per_file", "must be at least 1")),
            (_, Some(n), _) => Ok(FlushPolicy::TupleCount(n)),
            (_, _, Some(0)) => Err(ConfigError::invalid_value("bytes_per_file", "must be at least 1")),
            (_, _, Some(n)) => Ok(FlushPolicy::ByteCount(n)),
            _ => Ok(FlushPolicy::OnPunctuation),
        }
    }

    /// Whether a destination holding `tuples` records and `bytes` bytes is full.
    pub fn is_full(&self, tuples: u64, bytes: u64) -> bool {
        match self {
            FlushPolicy::TupleCount(n) => tuples >= *n,
            FlushPolicy::ByteCount(n) => bytes >= *n,
            FlushPolicy::OnPunctuation | FlushPolicy::TimeInterval(_) => false,
        }
    }

    pub fn rotation_period(&self) -> Option<Duration> {
        match self {
            FlushPolicy::TimeInterval(period) => Some(*period),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_options_select_one_variant() {
        assert_eq!(FlushPolicy::from_options(None, None, None).unwrap(), FlushPolicy::OnPunctuation);
        assert_eq!(FlushPolicy::from_options(None, Some(2), None).unwrap(), FlushPolicy::TupleCount(2));
        assert_eq!(FlushPolicy::from_options(None, None, Some(1024)).unwrap(), FlushPolicy::ByteCount(1024));
        assert_eq!(
            FlushPolicy::from_options(Some(TimeParam::Seconds(5.0)), None, None).unwrap(),
            FlushPolicy::TimeInterval(Duration::from_secs(5))
        );
    }

    #[test]
    fn two_or_more_options_conflict() {
        let cases = [
            (Some(TimeParam::Seconds(5.0)), Some(2), None),
            (Some(TimeParam::Seconds(5.0)), None, Some(10)),
            (None, Some(2), Some(10)),
            (Some(TimeParam::Seconds(5.0)), Some(2), Some(10)),
        ];
        for (time, tuples, bytes) in cases {
            let expected = time.is_some() as usize + tuples.is_some() as usize + bytes.is_some() as usize;
            match FlushPolicy::from_options(time, tuples, bytes) {
                Err(ConfigError::Conflict(names)) => assert_eq!(names.len(), expected),
                other => panic!("expected a conflict, got {:?}", other),
            }
        }
    }

    #[test]
    fn conflict_message_names_both_options() {
        let err = FlushPolicy::from_options(None, Some(2), Some(10)).unwrap_err();
        assert_eq!(
            err.to_string(),
            "The parameters are mutually exclusive: tuples_per_file, bytes_per_file"
        );
    }

    #[test]
    fn degenerate_values_are_rejected() {
        assert!(FlushPolicy::from_options(None, Some(0), None).is_err());
        assert!(FlushPolicy::from_options(None, None, Some(0)).is_err());
        assert!(FlushPolicy::from_options(Some(TimeParam::Seconds(1.0)), None, None).is_err());
    }

    #[test]
    fn fullness_by_policy() {
        assert!(FlushPolicy::TupleCount(2).is_full(2, 0));
        assert!(!FlushPolicy::TupleCount(2).is_full(1, 1000));
        assert!(FlushPolicy::ByteCount(10).is_full(1, 12));
        assert!(!FlushPolicy::OnPunctuation.is_full(1000, 1000));
    }
}
