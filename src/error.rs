//! Error types for playout-audio.
//!
//! Producer-visible calls return [`AudioError`]. The playback worker never
//! propagates errors upward: it logs, attempts recovery, and treats device
//! underrun as the routine slot-drained signal rather than a fault.

/// Errors surfaced through the producer-facing API.
#[derive(Debug, thiserror::Error)]
pub enum AudioError {
    /// The requested sample rate is not in the supported-rates table.
    #[error("{0}Hz sample-rate unsupported")]
    UnsupportedRate(u32),

    /// The requested channel count has no entry in the channel matrix.
    #[error("{0} channels unsupported")]
    UnsupportedChannels(u32),

    /// All pipeline slots are in use; the worker has not caught up.
    #[error("out of ring buffers")]
    RingFull,

    /// A zero rate or channel count was passed.
    #[error("bad channels or sample-rate parameters")]
    BadArgument,

    /// The playback device could not be opened.
    #[error("backend open failed: {0}")]
    BackendOpen(String),

    /// The playback device failed after recovery was attempted.
    #[error("backend error: {0}")]
    Backend(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        assert_eq!(
            AudioError::UnsupportedRate(32_000).to_string(),
            "32000Hz sample-rate unsupported"
        );
        assert_eq!(AudioError::RingFull.to_string(), "out of ring buffers");
    }

    #[test]
    fn test_error_is_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<AudioError>();
    }
}
