//! Setup parameters shared by every rank.
//!
//! All ranks must load the same configuration: segment ids, notification
//! bases and branching factors feed the topology and buffer-index math, and a
//! mismatch between two ranks silently pairs the wrong slots.
//!
//! ```toml
//! [diff]
//! segment = 1
//! capacity = 1048576
//!
//! [model]
//! segment = 2
//! notification_base = 1000
//! ```

use crate::error::{CommError, Result};
use crate::ring::{READER_QUEUE_MARGIN, WRITER_QUEUE_MARGIN};
use crate::topology::{MAX_BROADCAST_BRANCHING_FACTOR, REDUCE_BRANCHING_FACTOR};
use crate::transport::{NotificationId, QueueId, SegmentId};
use serde::{Deserialize, Serialize};

/// Default number of free queue slots a consumer keeps before acknowledging.
pub const CONSUMER_QUEUE_MARGIN: usize = 5;

/// Configuration of the gradient reduction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DiffConfig {
    pub segment: SegmentId,
    pub notification_base: NotificationId,
    pub queue: QueueId,
    /// Ring capacity per tree edge, in elements.
    pub capacity: usize,
    pub branching_factor: usize,
    pub writer_queue_margin: usize,
    pub reader_queue_margin: usize,
}

impl Default for DiffConfig {
    fn default() -> Self {
        Self {
            segment: 1,
            notification_base: 0,
            queue: 0,
            capacity: 1 << 20,
            branching_factor: REDUCE_BRANCHING_FACTOR,
            writer_queue_margin: WRITER_QUEUE_MARGIN,
            reader_queue_margin: READER_QUEUE_MARGIN,
        }
    }
}

/// Configuration of the parameter broadcast.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ModelConfig {
    pub segment: SegmentId,
    pub notification_base: NotificationId,
    pub transfer_queue: QueueId,
    pub acknowledge_queue: QueueId,
    /// Fixed fan-out; `None` picks the latency-minimizing one.
    pub branching_factor: Option<usize>,
    pub max_branching_factor: usize,
    pub consumer_queue_margin: usize,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            segment: 2,
            notification_base: 1000,
            transfer_queue: 1,
            acknowledge_queue: 2,
            branching_factor: None,
            max_branching_factor: MAX_BROADCAST_BRANCHING_FACTOR,
            consumer_queue_margin: CONSUMER_QUEUE_MARGIN,
        }
    }
}

/// Top-level configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CommConfig {
    pub diff: DiffConfig,
    pub model: ModelConfig,
}

impl CommConfig {
    /// Parses and validates a TOML document. Missing keys keep their defaults.
    pub fn from_toml_str(source: &str) -> Result<Self> {
        let config: Self =
            toml::from_str(source).map_err(|e| CommError::InvalidConfig(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Checks the values no rank could run with.
    pub fn validate(&self) -> Result<()> {
        let invalid = |msg: String| Err(CommError::InvalidConfig(msg));
        if self.diff.capacity < 2 {
            return invalid(format!("diff.capacity must be at least 2, got {}", self.diff.capacity));
        }
        if self.diff.branching_factor < 2 {
            return invalid(format!(
                "diff.branching_factor must be at least 2, got {}",
                self.diff.branching_factor
            ));
        }
        if let Some(b) = self.model.branching_factor {
            if b < 2 {
                return invalid(format!("model.branching_factor must be at least 2, got {b}"));
            }
        }
        if self.model.max_branching_factor < 2 {
            return invalid(format!(
                "model.max_branching_factor must be at least 2, got {}",
                self.model.max_branching_factor
            ));
        }
        // A wrapping write posts two requests back to back.
        if self.diff.writer_queue_margin < 2 {
            return invalid("diff.writer_queue_margin must be at least 2".to_string());
        }
        if self.diff.reader_queue_margin < 1 || self.model.consumer_queue_margin < 1 {
            return invalid("queue margins must be at least 1".to_string());
        }
        if self.diff.segment == self.model.segment {
            return invalid(format!(
                "diff and model share segment {}",
                self.diff.segment
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = CommConfig::default();
        config.validate().unwrap();
        assert_eq!(config.model.notification_base, 1000);
        assert_eq!(config.diff.writer_queue_margin, 3);
        assert_eq!(config.diff.reader_queue_margin, 1);
        assert_eq!(config.model.consumer_queue_margin, 5);
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config = CommConfig::from_toml_str(
            r#"
            [diff]
            capacity = 16

            [model]
            branching_factor = 4
            "#,
        )
        .unwrap();
        assert_eq!(config.diff.capacity, 16);
        assert_eq!(config.diff.segment, 1);
        assert_eq!(config.model.branching_factor, Some(4));
        assert_eq!(config.model.segment, 2);
    }

    #[test]
    fn test_rejects_shared_segment() {
        let result = CommConfig::from_toml_str("[model]\nsegment = 1\n");
        assert!(matches!(result, Err(CommError::InvalidConfig(_))));
    }

    #[test]
    fn test_rejects_unknown_key() {
        assert!(CommConfig::from_toml_str("[diff]\nsize = 4\n").is_err());
    }

    #[test]
    fn test_rejects_small_capacity() {
        let mut config = CommConfig::default();
        config.diff.capacity = 1;
        assert!(config.validate().is_err());
    }
}
