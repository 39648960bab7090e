#![forbid(unsafe_code)]

pub mod idset;
pub mod query;
pub mod status;

pub use idset::IdSet;
pub use status::{JobStatus, Transition, classify_transition};

pub mod ids {
    use std::fmt;

    pub type JobId = u32;

    const MAX_NAME_LEN: usize = 64;

    /// Name of a queue or queue class: `[A-Za-z0-9][A-Za-z0-9_-]{0,63}`.
    #[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
    pub struct QueueName(String);

    impl QueueName {
        pub fn as_str(&self) -> &str {
            &self.0
        }

        pub fn try_new(value: impl Into<String>) -> Result<Self, QueueNameError> {
            let value = value.into();
            validate_name(&value)?;
            Ok(Self(value))
        }
    }

    impl fmt::Display for QueueName {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.write_str(&self.0)
        }
    }

    #[derive(Clone, Debug, PartialEq, Eq)]
    pub enum QueueNameError {
        Empty,
        TooLong,
        InvalidFirstChar,
        InvalidChar { ch: char, index: usize },
    }

    impl fmt::Display for QueueNameError {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            match self {
                Self::Empty => write!(f, "name must not be empty"),
                Self::TooLong => write!(f, "name is longer than {MAX_NAME_LEN} characters"),
                Self::InvalidFirstChar => write!(f, "name must start with a letter or digit"),
                Self::InvalidChar { ch, index } => {
                    write!(f, "name has invalid character {ch:?} at {index}")
                }
            }
        }
    }

    impl std::error::Error for QueueNameError {}

    pub fn validate_name(value: &str) -> Result<(), QueueNameError> {
        if value.is_empty() {
            return Err(QueueNameError::Empty);
        }
        if value.len() > MAX_NAME_LEN {
            return Err(QueueNameError::TooLong);
        }
        let mut chars = value.chars();
        let Some(first) = chars.next() else {
            return Err(QueueNameError::Empty);
        };
        if !first.is_ascii_alphanumeric() {
            return Err(QueueNameError::InvalidFirstChar);
        }
        for (index, ch) in value.chars().enumerate().skip(1) {
            if ch.is_ascii_alphanumeric() || matches!(ch, '_' | '-') {
                continue;
            }
            return Err(QueueNameError::InvalidChar { ch, index });
        }
        Ok(())
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        #[test]
        fn queue_name_validation() {
            assert_eq!(QueueName::try_new("").unwrap_err(), QueueNameError::Empty);
            assert_eq!(
                QueueName::try_new("_q").unwrap_err(),
                QueueNameError::InvalidFirstChar
            );
            assert_eq!(
                QueueName::try_new("q.1").unwrap_err(),
                QueueNameError::InvalidChar { ch: '.', index: 1 }
            );
            assert_eq!(
                QueueName::try_new("x".repeat(65)).unwrap_err(),
                QueueNameError::TooLong
            );
            assert!(QueueName::try_new("blast_q-2").is_ok());
        }
    }
}
