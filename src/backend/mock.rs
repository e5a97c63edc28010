//! In-memory backend for tests and examples.
//!
//! `MockBackend` behaves like a device with a configurable set of accepted
//! formats and an unbounded sink: each pump iteration drains at most one
//! "period" worth of bytes. A [`MockHandle`] observes everything the
//! engine did to the device from the outside.

use std::sync::atomic::{AtomicI64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use super::{Backend, Pump, PumpCtx, SetupStatus};
use crate::error::AudioError;

#[derive(Debug, Default)]
struct MockState {
    setups: Mutex<Vec<(u32, u32, bool)>>,
    written: Mutex<Vec<u8>>,
    discards: AtomicUsize,
    resumes: AtomicUsize,
    suspends: AtomicUsize,
    volume: AtomicUsize,
    delay_ticks: AtomicI64,
}

/// Observer handle for a [`MockBackend`].
#[derive(Debug, Clone)]
pub struct MockHandle {
    state: Arc<MockState>,
}

impl MockHandle {
    /// Every `(rate, channels, passthrough)` the engine requested, in order.
    pub fn setups(&self) -> Vec<(u32, u32, bool)> {
        self.state.setups.lock().clone()
    }

    /// Total bytes delivered to the device.
    pub fn written_bytes(&self) -> usize {
        self.state.written.lock().len()
    }

    /// Takes the delivered bytes, clearing the sink.
    pub fn take_written(&self) -> Vec<u8> {
        std::mem::take(&mut self.state.written.lock())
    }

    /// Number of device flushes.
    pub fn discards(&self) -> usize {
        self.state.discards.load(Ordering::Relaxed)
    }

    /// Number of device clock resumes.
    pub fn resumes(&self) -> usize {
        self.state.resumes.load(Ordering::Relaxed)
    }

    /// Number of device clock suspends.
    pub fn suspends(&self) -> usize {
        self.state.suspends.load(Ordering::Relaxed)
    }

    /// Last hardware mixer volume the engine applied.
    pub fn volume(&self) -> usize {
        self.state.volume.load(Ordering::Relaxed)
    }

    /// Makes [`Backend::delay`] report the given number of 90 kHz ticks.
    pub fn set_delay_ticks(&self, ticks: i64) {
        self.state.delay_ticks.store(ticks, Ordering::Relaxed);
    }
}

/// A fake playback device.
pub struct MockBackend {
    state: Arc<MockState>,
    accepted_channels: Vec<u32>,
    period_bytes: usize,
    poll: Duration,
    threaded: bool,
}

impl MockBackend {
    /// Creates a device accepting 44.1/48 kHz at 1, 2 and 6 channels.
    pub fn new() -> Self {
        Self {
            state: Arc::new(MockState::default()),
            accepted_channels: vec![1, 2, 6],
            period_bytes: 4096,
            poll: Duration::from_millis(1),
            threaded: true,
        }
    }

    /// Makes the engine skip spawning the playback worker, so published
    /// slots pile up untouched. Useful for backpressure tests.
    #[must_use]
    pub fn without_thread(mut self) -> Self {
        self.threaded = false;
        self
    }

    /// Replaces the set of accepted channel counts.
    #[must_use]
    pub fn accept_channels(mut self, channels: &[u32]) -> Self {
        self.accepted_channels = channels.to_vec();
        self
    }

    /// Sets the period size: the per-iteration drain amount and the
    /// device floor for the start threshold.
    #[must_use]
    pub fn period_bytes(mut self, bytes: usize) -> Self {
        self.period_bytes = bytes;
        self
    }

    /// Returns the observer handle.
    pub fn handle(&self) -> MockHandle {
        MockHandle {
            state: Arc::clone(&self.state),
        }
    }
}

impl Default for MockBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl Backend for MockBackend {
    fn name(&self) -> &'static str {
        "mock"
    }

    fn setup(
        &mut self,
        rate: &mut u32,
        channels: &mut u32,
        passthrough: bool,
    ) -> Result<SetupStatus, AudioError> {
        self.state.setups.lock().push((*rate, *channels, passthrough));
        let rate_ok = matches!(*rate, 44_100 | 48_000);
        if rate_ok && self.accepted_channels.contains(channels) {
            Ok(SetupStatus::Accepted)
        } else {
            Err(AudioError::Backend(format!(
                "mock device rejects {}Hz {}ch",
                rate, channels
            )))
        }
    }

    fn resume(&mut self) {
        self.state.resumes.fetch_add(1, Ordering::Relaxed);
    }

    fn suspend(&mut self) {
        self.state.suspends.fetch_add(1, Ordering::Relaxed);
    }

    fn discard(&mut self) {
        self.state.discards.fetch_add(1, Ordering::Relaxed);
    }

    fn delay(&self) -> i64 {
        self.state.delay_ticks.load(Ordering::Relaxed)
    }

    fn set_volume(&mut self, volume: u32) {
        self.state.volume.store(volume as usize, Ordering::Relaxed);
    }

    fn start_bytes(&self) -> usize {
        self.period_bytes
    }

    fn has_thread(&self) -> bool {
        self.threaded
    }

    fn pump(&mut self, ctx: &mut PumpCtx<'_>) -> Pump {
        // stand-in for waiting on device-buffer space
        std::thread::sleep(self.poll);
        if ctx.cancelled() || ctx.paused() {
            return Pump::Played;
        }

        let mut space = self.period_bytes;
        let mut total = 0;
        while space > 0 {
            let n = ctx.pull(space, |bytes| {
                self.state.written.lock().extend_from_slice(bytes);
                bytes.len()
            });
            if n == 0 {
                break;
            }
            total += n;
            space -= n;
        }

        if total == 0 {
            Pump::Drained
        } else {
            Pump::Played
        }
    }
}
