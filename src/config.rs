//! Projection configuration.
//!
//! This module provides [`ProjectionConfig`] for tuning checkpointing,
//! backpressure and emitted-event writes of a single projection.

use std::time::Duration;

use crate::error::ConfigError;

/// Configuration for one projection instance.
///
/// Controls when checkpoints are suggested and persisted, how much work may
/// be buffered before the reader is paused, and how emitted events are
/// written. All fields have sensible defaults accessible via
/// [`ProjectionConfig::default()`].
///
/// # Examples
///
/// ```
/// use eventfold_projections::ProjectionConfig;
///
/// let config = ProjectionConfig {
///     checkpoint_handled_threshold: 2,
///     emit_event_enabled: true,
///     ..ProjectionConfig::default()
/// };
/// assert!(config.validate().is_ok());
/// assert_eq!(config.pending_events_threshold, 5000);
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct ProjectionConfig {
    /// Whether checkpoints are persisted to the projection's checkpoint
    /// stream.
    ///
    /// When disabled, checkpoint suggestions from the reader are ignored and
    /// a stop still drains in-flight emitted-event writes, but no checkpoint
    /// event is ever written.
    ///
    /// Default: `true`.
    pub checkpoints_enabled: bool,

    /// Number of handled events after which the reader suggests a
    /// checkpoint.
    ///
    /// Default: 4000.
    pub checkpoint_handled_threshold: usize,

    /// Distance in log bytes covered by filtered-out events after which the
    /// reader suggests a checkpoint even though nothing was handled.
    ///
    /// Default: 10 MB.
    pub checkpoint_unhandled_bytes_threshold: i64,

    /// Number of queued work items at which the reader is paused.
    ///
    /// The reader is resumed once the queue drains below half of this value.
    ///
    /// Default: 5000.
    pub pending_events_threshold: usize,

    /// Maximum number of emitted events written to one stream in a single
    /// write.
    ///
    /// Default: 500.
    pub max_write_batch_length: usize,

    /// Whether the state handler is allowed to emit events.
    ///
    /// A handler that emits while this is `false` faults the projection.
    ///
    /// Default: `false`.
    pub emit_event_enabled: bool,

    /// Whether the projection stops on its own once the reader reports the
    /// end of its input.
    ///
    /// Default: `false`.
    pub stop_on_eof: bool,

    /// Number of timed-out emitted-event writes tolerated per stream before
    /// the projection is failed.
    ///
    /// Default: 10.
    pub max_allowed_write_retries: u32,

    /// Upper bound in bytes for a single partition's serialized state.
    ///
    /// Default: 16 MiB.
    pub max_projection_state_size: usize,

    /// Number of concurrent emitted-stream write lanes per checkpoint
    /// generation. `None` gives every destination stream its own lane.
    ///
    /// Default: `None`.
    pub maximum_write_concurrency: Option<usize>,

    /// Base delay for exponential backoff on timed-out emitted-event writes.
    ///
    /// Default: 250 milliseconds.
    pub emitted_retry_base_delay: Duration,

    /// Maximum delay between emitted-event write retries.
    ///
    /// Default: 10 seconds.
    pub emitted_retry_max_delay: Duration,
}

impl Default for ProjectionConfig {
    fn default() -> Self {
        Self {
            checkpoints_enabled: true,
            checkpoint_handled_threshold: 4000,
            checkpoint_unhandled_bytes_threshold: 10_000_000,
            pending_events_threshold: 5000,
            max_write_batch_length: 500,
            emit_event_enabled: false,
            stop_on_eof: false,
            max_allowed_write_retries: 10,
            max_projection_state_size: 16 * 1024 * 1024,
            maximum_write_concurrency: None,
            emitted_retry_base_delay: Duration::from_millis(250),
            emitted_retry_max_delay: Duration::from_secs(10),
        }
    }
}

impl ProjectionConfig {
    /// Check that every threshold and limit is usable.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Zero`] naming the first threshold, batch length,
    /// state size limit or write concurrency that is zero.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let positive = [
            (
                "checkpoint_handled_threshold",
                self.checkpoint_handled_threshold,
            ),
            ("pending_events_threshold", self.pending_events_threshold),
            ("max_write_batch_length", self.max_write_batch_length),
            ("max_projection_state_size", self.max_projection_state_size),
        ];
        if let Some((field, _)) = positive.iter().find(|(_, value)| *value == 0) {
            return Err(ConfigError::Zero { field });
        }
        if self.checkpoint_unhandled_bytes_threshold <= 0 {
            return Err(ConfigError::Zero {
                field: "checkpoint_unhandled_bytes_threshold",
            });
        }
        if self.maximum_write_concurrency == Some(0) {
            return Err(ConfigError::Zero {
                field: "maximum_write_concurrency",
            });
        }
        Ok(())
    }

    /// Delay before retry number `attempt` (1-based) of a timed-out
    /// emitted-event write: `base * 2^(attempt-1)`, capped at the max delay.
    pub(crate) fn emitted_retry_delay(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.emitted_retry_base_delay
            .saturating_mul(factor)
            .min(self.emitted_retry_max_delay)
    }
}
