//! Channel construction parameters (spec.md §6).

use crate::error::ConfigError;

/// Policy applied when a queue is at capacity and a new entry arrives
/// (spec.md §3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OverflowPolicy {
    /// Fail the new request with `Overflow`.
    Reject,
    /// Evict the head of the queue, failing it with `Overflow`.
    EvictOldest,
    /// Evict the tail of the queue, failing it with `Overflow`.
    EvictNewest,
}

/// Validated construction parameters for a [`crate::channel::Channel`].
#[derive(Debug, Clone)]
pub struct ChannelConfig {
    pub(crate) name: String,
    pub(crate) buffer_size: usize,
    pub(crate) max_pending_readers: Option<usize>,
    pub(crate) max_pending_writers: Option<usize>,
    pub(crate) readers_overflow_policy: OverflowPolicy,
    pub(crate) writers_overflow_policy: OverflowPolicy,
}

impl ChannelConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            buffer_size: 0,
            max_pending_readers: None,
            max_pending_writers: None,
            readers_overflow_policy: OverflowPolicy::Reject,
            writers_overflow_policy: OverflowPolicy::Reject,
        }
    }

    pub fn buffer_size(mut self, n: usize) -> Self {
        self.buffer_size = n;
        self
    }

    /// `None` means unbounded (spec.md §6: "negative = unbounded").
    pub fn max_pending_readers(mut self, n: Option<usize>) -> Self {
        self.max_pending_readers = n;
        self
    }

    pub fn max_pending_writers(mut self, n: Option<usize>) -> Self {
        self.max_pending_writers = n;
        self
    }

    pub fn readers_overflow_policy(mut self, policy: OverflowPolicy) -> Self {
        self.readers_overflow_policy = policy;
        self
    }

    pub fn writers_overflow_policy(mut self, policy: OverflowPolicy) -> Self {
        self.writers_overflow_policy = policy;
        self
    }

    /// Validates the barrier floor used by both plain and broadcast
    /// channels: `max_pending_readers >= max(minimum_readers, initial_barrier)`
    /// when the cap is finite (spec.md §6). Plain channels call this with
    /// `floor = 0`.
    pub(crate) fn validate(&self, reader_floor: usize) -> Result<(), ConfigError> {
        if let Some(cap) = self.max_pending_readers
            && cap < reader_floor
        {
            return Err(ConfigError::ReaderCapacityBelowBarrier {
                max_pending_readers: cap,
                floor: reader_floor,
            });
        }
        Ok(())
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_unbuffered_and_unbounded() {
        let cfg = ChannelConfig::new("c");
        assert_eq!(cfg.buffer_size, 0);
        assert_eq!(cfg.max_pending_readers, None);
        assert!(cfg.validate(0).is_ok());
    }

    #[test]
    fn rejects_reader_cap_below_floor() {
        let cfg = ChannelConfig::new("c").max_pending_readers(Some(2));
        assert!(cfg.validate(3).is_err());
        assert!(cfg.validate(2).is_ok());
    }
}
