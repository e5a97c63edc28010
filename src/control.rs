//! Shared control state between the producer API and the playback worker.
//!
//! Everything here is either an atomic flag published without ordering
//! requirements of its own, or part of the condvar wake channel. The
//! producer signals the worker by setting `running` and notifying the
//! start condition under the wake mutex; the worker parks there whenever
//! the pipeline has nothing to play.

use std::sync::atomic::{AtomicBool, AtomicI32, AtomicI64, AtomicU32, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use crate::config::EngineConfig;
use crate::pipeline::{Slot, SlotRing};

pub(crate) struct Control {
    /// Worker is producing to the device.
    pub(crate) running: AtomicBool,
    /// Playback suspended.
    pub(crate) paused: AtomicBool,
    /// Cooperative teardown request.
    pub(crate) cancel: AtomicBool,
    /// The producer saw a valid video timestamp.
    pub(crate) video_ready: AtomicBool,
    /// Bytes the producer must still drop before the next sample goes in.
    pub(crate) skip_bytes: AtomicUsize,

    /// Current volume, 0..=1000.
    pub(crate) volume: AtomicU32,
    pub(crate) muted: AtomicBool,
    pub(crate) soft_volume: AtomicBool,
    /// Software amplifier gain in per-mille, volume after stereo descent.
    pub(crate) amplifier: AtomicI32,
    /// Hardware mixer update pending; applied from the worker.
    pub(crate) volume_dirty: AtomicBool,
    pub(crate) stereo_descent: AtomicI32,

    pub(crate) buffer_time_ms: AtomicU32,
    /// Audio/video delay in 90 kHz ticks.
    pub(crate) video_audio_delay: AtomicI64,
    /// Minimum buffered bytes before the worker starts draining a slot.
    pub(crate) start_threshold: AtomicUsize,
    /// Device-side delay in ticks, published by the worker each iteration.
    pub(crate) device_delay: AtomicI64,

    wake: Mutex<()>,
    start: Condvar,
    flush_done: Condvar,
}

impl Control {
    pub(crate) fn new(config: &EngineConfig) -> Self {
        Self {
            running: AtomicBool::new(false),
            paused: AtomicBool::new(false),
            cancel: AtomicBool::new(false),
            video_ready: AtomicBool::new(false),
            skip_bytes: AtomicUsize::new(0),
            volume: AtomicU32::new(1000),
            muted: AtomicBool::new(false),
            soft_volume: AtomicBool::new(config.soft_volume),
            amplifier: AtomicI32::new(1000),
            volume_dirty: AtomicBool::new(false),
            stereo_descent: AtomicI32::new(config.stereo_descent),
            buffer_time_ms: AtomicU32::new(config.buffer_time_ms),
            video_audio_delay: AtomicI64::new(config.video_audio_delay),
            start_threshold: AtomicUsize::new(0),
            device_delay: AtomicI64::new(0),
            wake: Mutex::new(()),
            start: Condvar::new(),
            flush_done: Condvar::new(),
        }
    }

    pub(crate) fn running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Marks the worker runnable and wakes it. Setting the flag under the
    /// wake mutex pairs with the worker's re-check in `wait_for_start`, so
    /// no wakeup is lost.
    pub(crate) fn wake_worker(&self) {
        let _guard = self.wake.lock();
        self.running.store(true, Ordering::Release);
        self.start.notify_one();
    }

    /// Worker side: parks until the producer marks it runnable again.
    /// Returns `false` when teardown was requested instead.
    pub(crate) fn wait_for_start(&self) -> bool {
        let mut guard = self.wake.lock();
        self.running.store(false, Ordering::Release);
        loop {
            if self.cancel.load(Ordering::Relaxed) {
                return false;
            }
            if self.running.load(Ordering::Acquire) {
                return true;
            }
            self.start.wait(&mut guard);
        }
    }

    /// Worker side: announces that the pipeline drained to empty; unblocks
    /// a producer waiting in `flush_buffers`.
    pub(crate) fn notify_drained(&self) {
        self.flush_done.notify_all();
    }

    /// Producer side: waits until every published slot has been consumed,
    /// waking the worker as needed. Gives up after `timeout` and returns
    /// whether the pipeline is empty.
    pub(crate) fn wait_drained(&self, slots: &SlotRing, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut guard = self.wake.lock();
        loop {
            if slots.filled() == 0 {
                return true;
            }
            // wakeup in case the worker is parked
            self.running.store(true, Ordering::Release);
            self.start.notify_one();
            if self
                .flush_done
                .wait_until(&mut guard, deadline)
                .timed_out()
            {
                return slots.filled() == 0;
            }
        }
    }

    /// Recomputes the software amplifier gain from the current volume and
    /// the slot playing right now. Stereo PCM output is reduced by the
    /// configured descent.
    pub(crate) fn apply_volume(&self, read_slot: &Slot) {
        let volume = self.volume.load(Ordering::Relaxed);
        self.muted.store(volume == 0, Ordering::Relaxed);

        let mut gain = volume as i32;
        let descent = self.stereo_descent.load(Ordering::Relaxed);
        if descent != 0 && read_slot.in_channels() == 2 && !read_slot.passthrough() {
            gain = (gain - descent).clamp(0, 1000);
        }
        self.amplifier.store(gain, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::SlotFormat;

    fn control() -> Control {
        Control::new(&EngineConfig::default())
    }

    #[test]
    fn test_wake_worker_sets_running() {
        let c = control();
        assert!(!c.running());
        c.wake_worker();
        assert!(c.running());
    }

    #[test]
    fn test_wait_for_start_clears_running_and_honors_cancel() {
        let c = control();
        c.cancel.store(true, Ordering::Relaxed);
        assert!(!c.wait_for_start());
        assert!(!c.running());
    }

    #[test]
    fn test_wait_drained_empty_ring_returns_immediately() {
        let c = control();
        let slots = SlotRing::new();
        assert!(c.wait_drained(&slots, Duration::from_millis(1)));
    }

    #[test]
    fn test_wait_drained_times_out_on_stuck_ring() {
        let c = control();
        let slots = SlotRing::new();
        let slot = slots.advance_write();
        slot.prepare(
            SlotFormat {
                passthrough: false,
                rate: 48_000,
                channels: 2,
            },
            48_000,
            2,
            false,
        );
        slots.publish();
        assert!(!c.wait_drained(&slots, Duration::from_millis(5)));
        // the wait wakes the (absent) worker as a side effect
        assert!(c.running());
    }

    #[test]
    fn test_apply_volume_stereo_descent() {
        let config = EngineConfig {
            stereo_descent: 100,
            ..Default::default()
        };
        let c = Control::new(&config);
        c.volume.store(700, Ordering::Relaxed);

        let slots = SlotRing::new();
        let slot = slots.write_slot();
        slot.prepare(
            SlotFormat {
                passthrough: false,
                rate: 48_000,
                channels: 2,
            },
            48_000,
            2,
            false,
        );
        c.apply_volume(slot);
        assert_eq!(c.amplifier.load(Ordering::Relaxed), 600);
        assert!(!c.muted.load(Ordering::Relaxed));
    }

    #[test]
    fn test_apply_volume_no_descent_on_surround() {
        let config = EngineConfig {
            stereo_descent: 100,
            ..Default::default()
        };
        let c = Control::new(&config);
        c.volume.store(700, Ordering::Relaxed);

        let slots = SlotRing::new();
        let slot = slots.write_slot();
        slot.prepare(
            SlotFormat {
                passthrough: false,
                rate: 48_000,
                channels: 6,
            },
            48_000,
            6,
            false,
        );
        c.apply_volume(slot);
        assert_eq!(c.amplifier.load(Ordering::Relaxed), 700);
    }

    #[test]
    fn test_apply_volume_zero_is_mute() {
        let c = control();
        c.volume.store(0, Ordering::Relaxed);
        let slots = SlotRing::new();
        c.apply_volume(slots.read_slot());
        assert!(c.muted.load(Ordering::Relaxed));
        assert_eq!(c.amplifier.load(Ordering::Relaxed), 0);
    }
}
