//! Playback device backends.
//!
//! A [`Backend`] is the narrow interface between the engine and a PCM
//! device. The worker owns the backend for the engine's lifetime and is
//! the only caller of its methods after the capability probe. Built-in
//! implementations:
//!
//! - [`NoopBackend`]: inert sentinel when no device is bound
//! - [`MockBackend`]: in-memory device for tests and examples
//! - `AlsaBackend` (feature `alsa-backend`): ALSA PCM + simple mixer
//! - `OssBackend` (feature `oss-backend`): OSS `/dev/dsp` ioctls
//!
//! Backend selection follows the configured device name: empty selects
//! noop, a `/`-prefixed path selects OSS, anything else ALSA.

#[cfg(feature = "alsa-backend")]
mod alsa;
mod mock;
mod noop;
#[cfg(feature = "oss-backend")]
mod oss;

#[cfg(feature = "alsa-backend")]
pub use alsa::AlsaBackend;
pub use mock::{MockBackend, MockHandle};
pub use noop::NoopBackend;
#[cfg(feature = "oss-backend")]
pub use oss::OssBackend;

use std::sync::atomic::{AtomicBool, Ordering};

use crate::error::AudioError;
use crate::filter::soft_amplify;
use crate::pipeline::ByteRing;
use crate::EngineConfig;

/// Outcome of a successful [`Backend::setup`] call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SetupStatus {
    /// The device accepted the requested format as-is.
    Accepted,
    /// The device substituted a format it supports; the rate/channel
    /// parameters were written back and the pipeline must adapt.
    Adjusted,
}

/// Result of one bounded [`Backend::pump`] iteration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Pump {
    /// Samples were delivered, or the device needs no data yet.
    Played,
    /// The current slot's buffer ran dry and the device went silent.
    /// Routine signal that the pipeline should advance, not a fault.
    Drained,
    /// The device failed and could not be recovered this iteration.
    Error,
}

/// Playback-side view of the current slot handed to [`Backend::pump`].
///
/// Wraps the slot's byte ring together with the control flags a backend
/// must honor, and applies the software amplifier to pulled bytes.
pub struct PumpCtx<'a> {
    pub(crate) ring: &'a ByteRing,
    pub(crate) cancel: &'a AtomicBool,
    pub(crate) paused: &'a AtomicBool,
    /// Apply the software amplifier (software volume on a PCM slot).
    pub(crate) soften: bool,
    pub(crate) gain: i32,
    pub(crate) mute: bool,
}

impl PumpCtx<'_> {
    /// Cooperative cancellation; check at the top of every iteration.
    pub fn cancelled(&self) -> bool {
        self.cancel.load(Ordering::Relaxed)
    }

    /// Suspend request; pump iterations must early-return when set.
    pub fn paused(&self) -> bool {
        self.paused.load(Ordering::Relaxed)
    }

    /// Bytes currently buffered in the slot.
    pub fn buffered(&self) -> usize {
        self.ring.used()
    }

    /// Hands at most `max` contiguous buffered bytes to `write`, which
    /// returns how many it pushed to the device. The slot advances by that
    /// amount, which is also returned; 0 means the buffer (or `max`) is
    /// exhausted at the wrap point — call again for the next run.
    ///
    /// Muting and software volume are applied in place before the bytes
    /// reach `write`.
    pub fn pull<F>(&self, max: usize, write: F) -> usize
    where
        F: FnOnce(&[u8]) -> usize,
    {
        self.ring.read_with(|chunk| {
            let n = chunk.len().min(max);
            if n == 0 {
                return 0;
            }
            let chunk = &mut chunk[..n];
            if self.mute || self.soften {
                soft_amplify(chunk, self.gain, self.mute);
            }
            write(chunk)
        })
    }
}

/// A playback device.
///
/// All methods are driven from the playback worker thread (plus the
/// capability probe at init). Default implementations are no-ops; a
/// backend implements what its device supports.
pub trait Backend: Send {
    /// Backend name for logging.
    fn name(&self) -> &'static str;

    /// Idempotent device acquisition.
    fn open(&mut self) {}

    /// Idempotent device release.
    fn close(&mut self) {}

    /// Requests a playback format, closing and re-opening the device.
    ///
    /// On [`SetupStatus::Adjusted`] the actually accepted format has been
    /// written back through `rate` and `channels`. Must be callable any
    /// number of times; every format change goes through here.
    fn setup(
        &mut self,
        rate: &mut u32,
        channels: &mut u32,
        passthrough: bool,
    ) -> Result<SetupStatus, AudioError>;

    /// Resumes the device clock after [`suspend`](Self::suspend).
    fn resume(&mut self) {}

    /// Suspends the device clock.
    fn suspend(&mut self) {}

    /// Drops pending device-side samples and returns the device to a
    /// prepared, silent state.
    fn discard(&mut self) {}

    /// Samples held by the device that have not yet been heard, in
    /// 90 kHz ticks.
    fn delay(&self) -> i64 {
        0
    }

    /// Hardware mixer volume, 0..=1000. No-op when the engine applies
    /// volume in software.
    fn set_volume(&mut self, _volume: u32) {}

    /// Device-derived floor for the start threshold, in bytes (one period
    /// of the last accepted format).
    fn start_bytes(&self) -> usize {
        0
    }

    /// Whether the engine should run a playback worker for this backend.
    fn has_thread(&self) -> bool {
        true
    }

    /// One iteration of blocking device work: wait for device-buffer
    /// space with a bounded timeout (at most ~24 ms), then push as much
    /// of the current slot as space permits.
    fn pump(&mut self, ctx: &mut PumpCtx<'_>) -> Pump;
}

/// Picks a backend from the configured device names.
pub(crate) fn select(config: &EngineConfig) -> Box<dyn Backend> {
    let device = if config.device.is_empty() {
        config.passthrough_device.as_str()
    } else {
        config.device.as_str()
    };

    if device.is_empty() {
        tracing::info!("no audio device configured, using noop output");
        return Box::new(NoopBackend::new());
    }

    if device.starts_with('/') {
        #[cfg(feature = "oss-backend")]
        return Box::new(OssBackend::new(config));
        #[cfg(not(feature = "oss-backend"))]
        {
            tracing::error!(%device, "OSS backend not compiled in, using noop output");
            return Box::new(NoopBackend::new());
        }
    }

    #[cfg(feature = "alsa-backend")]
    return Box::new(AlsaBackend::new(config));
    #[cfg(not(feature = "alsa-backend"))]
    {
        tracing::error!(%device, "ALSA backend not compiled in, using noop output");
        Box::new(NoopBackend::new())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_select_empty_device_is_noop() {
        let backend = select(&EngineConfig::default());
        assert_eq!(backend.name(), "noop");
    }

    #[test]
    fn test_select_falls_back_to_passthrough_device() {
        let config = EngineConfig {
            passthrough_device: "hw:0,1".into(),
            ..Default::default()
        };
        let backend = select(&config);
        // resolves to alsa when compiled in, noop otherwise
        assert_ne!(backend.name(), "oss");
    }

    #[test]
    fn test_select_slash_prefix_is_oss_style() {
        let config = EngineConfig {
            device: "/dev/dsp".into(),
            ..Default::default()
        };
        let backend = select(&config);
        assert_ne!(backend.name(), "alsa");
    }

    #[test]
    fn test_pump_ctx_applies_amplifier() {
        use std::sync::atomic::AtomicBool;

        let ring = ByteRing::new(64);
        let samples: Vec<u8> = [1000i16, -1000]
            .iter()
            .flat_map(|s| s.to_ne_bytes())
            .collect();
        ring.write(&samples);

        let cancel = AtomicBool::new(false);
        let paused = AtomicBool::new(false);
        let ctx = PumpCtx {
            ring: &ring,
            cancel: &cancel,
            paused: &paused,
            soften: true,
            gain: 500,
            mute: false,
        };

        let mut seen = Vec::new();
        let n = ctx.pull(usize::MAX, |bytes| {
            seen.extend_from_slice(bytes);
            bytes.len()
        });
        assert_eq!(n, 4);
        assert_eq!(i16::from_ne_bytes([seen[0], seen[1]]), 500);
        assert_eq!(i16::from_ne_bytes([seen[2], seen[3]]), -500);
    }
}
