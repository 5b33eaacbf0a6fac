//! Queue configuration.

use serde::{Deserialize, Serialize};

/// Settings a queue starts with.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Shown in logs.
    pub name: Option<String>,

    /// How many procedures may execute at once. `None` is unbounded; zero is
    /// treated as one.
    pub max_concurrent: Option<usize>,

    /// Start suspended: nothing executes until `set_suspended(false)`.
    pub suspended: bool,
}

impl QueueConfig {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: Some(name.into()),
            ..Self::default()
        }
    }

    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    /// Effective concurrency limit.
    pub fn concurrency_limit(&self) -> Option<usize> {
        self.max_concurrent.map(|n| n.max(1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case::unbounded(None, None)]
    #[case::zero_is_one(Some(0), Some(1))]
    #[case::kept(Some(4), Some(4))]
    fn concurrency_limit_is_normalised(#[case] configured: Option<usize>, #[case] expected: Option<usize>) {
        let config = QueueConfig {
            max_concurrent: configured,
            ..QueueConfig::default()
        };
        assert_eq!(config.concurrency_limit(), expected);
    }

    #[test]
    fn missing_fields_use_defaults() {
        let config = QueueConfig::from_json(r#"{"max_concurrent": 2}"#).unwrap();
        assert_eq!(config.max_concurrent, Some(2));
        assert_eq!(config.name, None);
        assert!(!config.suspended);
    }

    #[test]
    fn json_round_trip() {
        let config = QueueConfig {
            name: Some("downloads".into()),
            max_concurrent: Some(3),
            suspended: true,
        };
        let json = serde_json::to_string(&config).unwrap();
        assert_eq!(QueueConfig::from_json(&json).unwrap(), config);
    }
}
