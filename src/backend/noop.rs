//! Inert backend used when no playback device is bound.

use super::{Backend, Pump, PumpCtx, SetupStatus};
use crate::error::AudioError;

/// A backend that accepts nothing and plays nothing.
///
/// With the noop backend the capability probe finds no supported formats,
/// so every `setup` request is rejected at the channel matrix and no
/// playback worker is spawned.
#[derive(Debug, Default)]
pub struct NoopBackend;

impl NoopBackend {
    /// Creates the inert backend.
    pub fn new() -> Self {
        Self
    }
}

impl Backend for NoopBackend {
    fn name(&self) -> &'static str {
        "noop"
    }

    fn setup(
        &mut self,
        _rate: &mut u32,
        _channels: &mut u32,
        _passthrough: bool,
    ) -> Result<SetupStatus, AudioError> {
        Err(AudioError::BackendOpen("no audio device".into()))
    }

    fn has_thread(&self) -> bool {
        false
    }

    fn pump(&mut self, _ctx: &mut PumpCtx<'_>) -> Pump {
        Pump::Drained
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_noop_rejects_every_format() {
        let mut backend = NoopBackend::new();
        let (mut rate, mut channels) = (48_000, 2);
        assert!(backend.setup(&mut rate, &mut channels, false).is_err());
        assert!(!backend.has_thread());
    }
}
