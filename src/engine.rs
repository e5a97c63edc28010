//! The audio output engine and its producer-facing API.
//!
//! [`AudioOut`] owns the slot pipeline, the playback worker and the
//! channel matrix. One decoder thread drives the producer surface
//! ([`setup`](AudioOut::setup), [`enqueue`](AudioOut::enqueue),
//! [`set_clock`](AudioOut::set_clock), [`video_ready`](AudioOut::video_ready),
//! [`flush_buffers`](AudioOut::flush_buffers)); the volume and filter
//! setters may be called from any thread.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use parking_lot::Mutex;

use crate::backend::{self, Backend};
use crate::clock::{bytes_to_ticks, ticks_to_bytes, BYTES_PER_SAMPLE, NO_PTS};
use crate::config::{EngineConfig, DEFAULT_BUFFER_TIME_MS};
use crate::control::Control;
use crate::error::AudioError;
use crate::filter::FilterChain;
use crate::matrix::{rate_index, ChannelMatrix};
use crate::pipeline::{sample_bytes, Slot, SlotFormat, SlotRing, SLOT_COUNT};
use crate::worker;

/// How long a flush waits for the worker to drain the pipeline.
const FLUSH_WAIT: Duration = Duration::from_millis(48);

/// Result of a format request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SetupOutcome {
    /// The requested format will be played as-is.
    Accepted,
    /// The hardware takes a different format; input is remixed into it.
    Adjusted {
        /// Sample rate actually used.
        rate: u32,
        /// Hardware channel count actually used.
        channels: u32,
    },
}

/// State shared between the producer API and the playback worker.
pub(crate) struct Shared {
    pub(crate) slots: SlotRing,
    pub(crate) control: Control,
    pub(crate) filters: Mutex<FilterChain>,
}

impl Shared {
    pub(crate) fn new(config: &EngineConfig) -> Self {
        Self {
            slots: SlotRing::new(),
            control: Control::new(config),
            filters: Mutex::new(FilterChain::new(config)),
        }
    }
}

/// Builder for [`AudioOut`].
///
/// # Example
///
/// ```no_run
/// use playout_audio::AudioOut;
///
/// let audio = AudioOut::builder()
///     .device("default")
///     .buffer_time(336)
///     .soft_volume(true)
///     .build();
/// ```
#[derive(Default)]
pub struct AudioOutBuilder {
    config: EngineConfig,
    backend: Option<Box<dyn Backend>>,
}

impl AudioOutBuilder {
    /// PCM device name; also selects the backend (see [`EngineConfig::device`]).
    #[must_use]
    pub fn device(mut self, name: impl Into<String>) -> Self {
        self.config.device = name.into();
        self
    }

    /// Pass-through device for compressed payloads.
    #[must_use]
    pub fn passthrough_device(mut self, name: impl Into<String>) -> Self {
        self.config.passthrough_device = name.into();
        self
    }

    /// Hardware mixer device name.
    #[must_use]
    pub fn mixer_device(mut self, name: impl Into<String>) -> Self {
        self.config.mixer_device = name.into();
        self
    }

    /// Hardware mixer channel name (e.g. `PCM` or `Master`).
    #[must_use]
    pub fn mixer_channel(mut self, name: impl Into<String>) -> Self {
        self.config.mixer_channel = name.into();
        self
    }

    /// Audio buffer time in milliseconds; 0 restores the default.
    #[must_use]
    pub fn buffer_time(mut self, ms: u32) -> Self {
        self.config.buffer_time_ms = if ms == 0 { DEFAULT_BUFFER_TIME_MS } else { ms };
        self
    }

    /// Extra audio delay relative to video, in 90 kHz ticks.
    #[must_use]
    pub fn video_audio_delay(mut self, ticks: i64) -> Self {
        self.config.video_audio_delay = ticks;
        self
    }

    /// Apply volume in software instead of the hardware mixer.
    #[must_use]
    pub fn soft_volume(mut self, on: bool) -> Self {
        self.config.soft_volume = on;
        self
    }

    /// Enable the normalizer with the given maximum factor (per-mille).
    #[must_use]
    pub fn normalize(mut self, on: bool, max_factor: i32) -> Self {
        self.config.normalize = on;
        self.config.max_normalize = max_factor;
        self
    }

    /// Enable the compressor with the given maximum factor (per-mille).
    #[must_use]
    pub fn compression(mut self, on: bool, max_factor: i32) -> Self {
        self.config.compression = on;
        self.config.max_compression = max_factor;
        self
    }

    /// Volume reduction for stereo PCM output, per-mille.
    #[must_use]
    pub fn stereo_descent(mut self, per_mille: i32) -> Self {
        self.config.stereo_descent = per_mille;
        self
    }

    /// Replaces the whole configuration.
    #[must_use]
    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    /// Injects a backend instead of resolving one from the device name.
    #[must_use]
    pub fn backend(mut self, backend: Box<dyn Backend>) -> Self {
        self.backend = Some(backend);
        self
    }

    /// Opens the device, probes its capabilities and starts the playback
    /// worker. Never fails: an unusable device degrades to the inert noop
    /// backend, which rejects all format requests.
    pub fn build(self) -> AudioOut {
        let mut backend = self
            .backend
            .unwrap_or_else(|| backend::select(&self.config));
        tracing::info!(backend = backend.name(), "audio output module");

        backend.open();
        let matrix = ChannelMatrix::probe(backend.as_mut());
        matrix.log_summary();

        let shared = Arc::new(Shared::new(&self.config));
        let (worker, idle_backend) = if backend.has_thread() {
            (Some(worker::spawn(backend, Arc::clone(&shared))), None)
        } else {
            (None, Some(backend))
        };

        AudioOut {
            shared,
            matrix,
            worker,
            idle_backend: Mutex::new(idle_backend),
        }
    }
}

/// The audio output engine.
///
/// Decoded PCM (or compressed pass-through) is buffered per format in a
/// ring of slots, remixed to what the device accepts, and fed to the
/// device from a dedicated worker thread. The engine exposes a 90 kHz
/// audio clock for A/V synchronization.
///
/// Dropping the engine cancels the worker, joins it and releases the
/// device.
pub struct AudioOut {
    shared: Arc<Shared>,
    matrix: ChannelMatrix,
    worker: Option<JoinHandle<()>>,
    /// Backend kept engine-side when no worker runs (noop).
    idle_backend: Mutex<Option<Box<dyn Backend>>>,
}

impl AudioOut {
    /// Starts building an engine.
    pub fn builder() -> AudioOutBuilder {
        AudioOutBuilder::default()
    }

    /// Requests a new input format.
    ///
    /// Rotates the pipeline to a fresh slot carrying the format; buffered
    /// audio in earlier slots keeps playing first. The slot's hardware
    /// format comes from the capability matrix; when it differs from the
    /// request the outcome reports the substitution.
    pub fn setup(
        &self,
        rate: u32,
        channels: u32,
        passthrough: bool,
    ) -> Result<SetupOutcome, AudioError> {
        tracing::debug!(rate, channels, passthrough, "setup");
        if rate == 0 || channels == 0 {
            return Err(AudioError::BadArgument);
        }
        if rate_index(rate).is_none() {
            tracing::error!(rate, "sample-rate unsupported");
            return Err(AudioError::UnsupportedRate(rate));
        }
        let hw_channels = self.matrix.hw_channels(rate, channels).ok_or_else(|| {
            tracing::error!(channels, "channels unsupported");
            AudioError::UnsupportedChannels(channels)
        })?;

        let slots = &self.shared.slots;
        if slots.filled() == SLOT_COUNT {
            tracing::error!("out of ring buffers");
            return Err(AudioError::RingFull);
        }
        let slot = slots.advance_write();
        slot.prepare(
            SlotFormat {
                passthrough,
                rate,
                channels: hw_channels,
            },
            rate,
            channels,
            false,
        );
        slots.publish();
        self.shared.control.wake_worker();

        if hw_channels == channels {
            Ok(SetupOutcome::Accepted)
        } else {
            Ok(SetupOutcome::Adjusted {
                rate,
                channels: hw_channels,
            })
        }
    }

    /// Queues interleaved native-endian 16-bit PCM bytes (or an opaque
    /// pass-through payload) for playback.
    ///
    /// Dropped silently until a format is set. PCM input is remixed to
    /// the slot's hardware channel count and run through the enabled
    /// filters; pass-through bytes go in verbatim.
    pub fn enqueue(&self, samples: &[u8]) {
        let slot = self.shared.slots.write_slot();
        if slot.hw_rate() == 0 {
            tracing::debug!("enqueue before setup, dropping");
            return;
        }
        if !samples.is_empty() {
            slot.note_packet_size(samples.len());
        }

        let count;
        let written;
        if slot.passthrough() {
            count = samples.len();
            written = slot.buffer.write(samples);
        } else {
            let mut filters = self.shared.filters.lock();
            let processed = filters.process(samples, slot.in_channels(), slot.hw_channels());
            count = processed.len() * BYTES_PER_SAMPLE;
            written = slot.buffer.write(sample_bytes(processed));
        }
        if written != count {
            tracing::error!(
                bytes = count,
                dropped = count - written,
                "can't place samples in ring buffer"
            );
        }

        if !self.shared.control.running() {
            self.consider_start(slot);
        }

        let pts = slot.pts();
        if pts != NO_PTS {
            slot.set_pts(pts + bytes_to_ticks(count, slot.hw_rate(), slot.hw_channels()));
        }
    }

    /// Startup check on the producer path: apply any pending skip, then
    /// start once enough audio is buffered (or plenty of it, when video
    /// has not reported in yet).
    fn consider_start(&self, slot: &Slot) {
        let control = &self.shared.control;
        let skip = control.skip_bytes.load(Ordering::Relaxed);
        if skip > 0 {
            let dropped = slot.buffer.discard(skip);
            control
                .skip_bytes
                .store(skip - dropped, Ordering::Relaxed);
        }

        let used = slot.buffer.used();
        let threshold = control
            .start_threshold
            .load(Ordering::Relaxed);
        let video_ready = control.video_ready.load(Ordering::Relaxed);
        if threshold * 4 < used || (video_ready && threshold < used) {
            tracing::debug!(used, threshold, video_ready, "restart playback");
            control.wake_worker();
        }
    }

    /// Sets the timestamp of the next sample to be enqueued.
    pub fn set_clock(&self, pts: i64) {
        let slot = self.shared.slots.write_slot();
        if slot.pts() != pts {
            tracing::trace!(from = slot.pts(), to = pts, "set clock");
        }
        slot.set_pts(pts);
    }

    /// Current audio clock in 90 kHz ticks: the timestamp of the sample
    /// being heard right now.
    ///
    /// Returns [`NO_PTS`] while the clock is undefined: not running, no
    /// format, a format transition in flight, or no measurable delay.
    pub fn clock(&self) -> i64 {
        let slot = self.shared.slots.read_slot();
        let pts = slot.pts();
        if pts == NO_PTS {
            return NO_PTS;
        }
        match self.delay() {
            0 => NO_PTS,
            delay => pts - delay,
        }
    }

    /// Audio buffered ahead of the speakers in 90 kHz ticks: device-side
    /// delay plus the bytes still in the playing slot.
    pub fn delay(&self) -> i64 {
        let shared = &self.shared;
        if !shared.control.running() {
            return 0;
        }
        let slot = shared.slots.read_slot();
        if slot.hw_rate() == 0 {
            return 0;
        }
        if shared.slots.filled() > 0 {
            return 0; // format transition in flight, delay is meaningless
        }
        shared
            .control
            .device_delay
            .load(Ordering::Relaxed)
            + bytes_to_ticks(slot.buffer.used(), slot.hw_rate(), slot.hw_channels())
    }

    /// Free space in the current write slot, in bytes.
    pub fn free_bytes(&self) -> usize {
        self.shared.slots.write_slot().buffer.free()
    }

    /// Buffered bytes in the current write slot.
    pub fn used_bytes(&self) -> usize {
        self.shared.slots.write_slot().buffer.used()
    }

    /// Announces the first valid video timestamp; aligns the audio start
    /// to it.
    ///
    /// When more audio is buffered than the video needs, the head of the
    /// buffer is skipped (spilling into a pending skip for future
    /// enqueues) and playback starts as soon as the threshold is met.
    pub fn video_ready(&self, video_pts: i64) {
        let control = &self.shared.control;
        let slot = self.shared.slots.write_slot();

        if video_pts == NO_PTS
            || slot.hw_rate() == 0
            || slot.hw_channels() == 0
            || slot.pts() == NO_PTS
        {
            tracing::debug!("a/v start, audio or video not valid yet");
            control
                .video_ready
                .store(true, Ordering::Relaxed);
            return;
        }

        let used = slot.buffer.used();
        let audio_pts =
            slot.pts() - bytes_to_ticks(used, slot.hw_rate(), slot.hw_channels());
        tracing::debug!(
            audio_pts,
            video_pts,
            lead_ms = (video_pts - audio_pts) / 90,
            "video ready"
        );

        if !control.running() {
            // keep ~15 video frames plus the buffer time ahead of the
            // sync point
            let buffer_ticks =
                i64::from(control.buffer_time_ms.load(Ordering::Relaxed)) * 90;
            let skip = video_pts - 15 * 20 * 90 - buffer_ticks - audio_pts
                + control
                    .video_audio_delay
                    .load(Ordering::Relaxed);

            // guard against stale timestamps
            if skip > 0 && skip < 2000 * 90 {
                let mut skip_bytes = ticks_to_bytes(skip, slot.hw_rate(), slot.hw_channels());
                if skip_bytes > used {
                    control
                        .skip_bytes
                        .store(skip_bytes - used, Ordering::Relaxed);
                    skip_bytes = used;
                }
                tracing::debug!(
                    ms = bytes_to_ticks(skip_bytes, slot.hw_rate(), slot.hw_channels()) / 90,
                    skip_bytes,
                    used,
                    "advance audio"
                );
                slot.buffer.discard(skip_bytes);
            }

            if slot.buffer.used()
                > control
                    .start_threshold
                    .load(Ordering::Relaxed)
            {
                control.wake_worker();
            }
        }

        control
            .video_ready
            .store(true, Ordering::Relaxed);
    }

    /// Discards everything buffered and tells the device to drop what it
    /// holds.
    ///
    /// Rotates to a fresh slot that keeps the current format but carries
    /// a flush marker, then waits up to 48 ms for the worker to apply it.
    pub fn flush_buffers(&self) -> Result<(), AudioError> {
        let shared = &self.shared;
        let slots = &shared.slots;
        if slots.filled() == SLOT_COUNT {
            tracing::error!("out of ring buffers");
            return Err(AudioError::RingFull);
        }

        let old = slots.write_slot();
        let format = old.format();
        let (in_rate, in_channels) = (old.in_rate(), old.in_channels());
        let slot = slots.advance_write();
        slot.prepare(format, in_rate, in_channels, true);
        slots.publish();

        tracing::debug!("reset video ready");
        shared
            .control
            .video_ready
            .store(false, Ordering::Relaxed);
        shared
            .control
            .skip_bytes
            .store(0, Ordering::Relaxed);

        let drained = shared.control.wait_drained(slots, FLUSH_WAIT);
        tracing::debug!(drained, "audio flush");
        Ok(())
    }

    /// Resumes playback after [`pause`](Self::pause).
    pub fn play(&self) {
        let control = &self.shared.control;
        if !control.paused.swap(false, Ordering::Relaxed) {
            tracing::debug!("not paused, check the code");
            return;
        }
        tracing::debug!("resumed");
        control.wake_worker();
    }

    /// Suspends playback.
    pub fn pause(&self) {
        let control = &self.shared.control;
        if control.paused.swap(true, Ordering::Relaxed) {
            tracing::debug!("already paused, check the code");
            return;
        }
        tracing::debug!("paused");
    }

    /// Whether the worker is currently feeding the device.
    pub fn is_playing(&self) -> bool {
        self.shared.control.running()
    }

    /// Shuts the engine down: cancels the worker, joins it and releases
    /// the device. Dropping the engine does the same.
    pub fn close(self) {}

    /// Sets the volume, 0..=1000. Zero mutes.
    ///
    /// With software volume the amplifier gain is updated (including the
    /// stereo descent); otherwise the hardware mixer is told on the next
    /// worker iteration. May be called from any thread.
    pub fn set_volume(&self, volume: u32) {
        let control = &self.shared.control;
        control
            .volume
            .store(volume.min(1000), Ordering::Relaxed);
        control.apply_volume(self.shared.slots.read_slot());
        if !control.soft_volume.load(Ordering::Relaxed) {
            control
                .volume_dirty
                .store(true, Ordering::Relaxed);
        }
    }

    /// Sets the audio buffer time in milliseconds; 0 restores the
    /// default. Takes effect at the next format change.
    pub fn set_buffer_time(&self, ms: u32) {
        let ms = if ms == 0 { DEFAULT_BUFFER_TIME_MS } else { ms };
        self.shared
            .control
            .buffer_time_ms
            .store(ms, Ordering::Relaxed);
    }

    /// Sets the extra audio delay relative to video, in 90 kHz ticks.
    pub fn set_video_audio_delay(&self, ticks: i64) {
        self.shared
            .control
            .video_audio_delay
            .store(ticks, Ordering::Relaxed);
    }

    /// Switches between software and hardware volume.
    pub fn set_soft_volume(&self, on: bool) {
        self.shared
            .control
            .soft_volume
            .store(on, Ordering::Relaxed);
    }

    /// Enables or disables the normalizer and sets its maximum factor.
    pub fn set_normalize(&self, on: bool, max_factor: i32) {
        self.shared.filters.lock().set_normalize(on, max_factor);
    }

    /// Enables or disables the compressor and sets its maximum factor.
    pub fn set_compression(&self, on: bool, max_factor: i32) {
        self.shared.filters.lock().set_compression(on, max_factor);
    }

    /// Sets the stereo volume descent and reapplies the volume.
    pub fn set_stereo_descent(&self, per_mille: i32) {
        let control = &self.shared.control;
        control
            .stereo_descent
            .store(per_mille, Ordering::Relaxed);
        control.apply_volume(self.shared.slots.read_slot());
    }
}

impl Drop for AudioOut {
    fn drop(&mut self) {
        let control = &self.shared.control;
        control
            .cancel
            .store(true, Ordering::Relaxed);
        control.wake_worker();
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                tracing::error!("audio worker panicked during shutdown");
            }
        }
        if let Some(mut backend) = self.idle_backend.lock().take() {
            backend.close();
        }
    }
}
