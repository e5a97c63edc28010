//! ALSA playback backend.
//!
//! Uses plain blocking `writei` with a bounded `snd_pcm_wait`. Every
//! format change closes and re-opens the PCM handle; HDMI sinks lose
//! audio after a re-handshake otherwise. Device errors go through
//! `snd_pcm_recover` once before an iteration gives up.

use std::time::Duration;

use alsa::mixer::{Mixer, SelemId};
use alsa::pcm::{Access, Format, HwParams, State, PCM};
use alsa::{Direction, ValueOr};

use super::{Backend, Pump, PumpCtx, SetupStatus};
use crate::clock::{BYTES_PER_SAMPLE, TICKS_PER_SECOND};
use crate::error::AudioError;
use crate::EngineConfig;

/// Bounded device wait per pump iteration, milliseconds.
const WAIT_MS: i32 = 24;

/// Requested period length in milliseconds; the kernel buffer holds four
/// periods.
const PERIOD_MS: i64 = 24;

/// ALSA PCM output with an optional simple-mixer volume element.
pub struct AlsaBackend {
    pcm_device: String,
    passthrough_device: String,
    mixer_device: String,
    mixer_channel: String,

    pcm: Option<PCM>,
    mixer: Option<Mixer>,
    can_pause: bool,
    rate: u32,
    frame_bytes: usize,
    period_bytes: usize,
    /// Reusable frame transfer buffer, sized by the device buffer.
    xfer: Vec<i16>,
}

impl AlsaBackend {
    /// Creates the backend from the configured device names.
    pub fn new(config: &EngineConfig) -> Self {
        Self {
            pcm_device: config.device.clone(),
            passthrough_device: config.passthrough_device.clone(),
            mixer_device: config.mixer_device.clone(),
            mixer_channel: config.mixer_channel.clone(),
            pcm: None,
            mixer: None,
            can_pause: false,
            rate: 0,
            frame_bytes: 0,
            period_bytes: 0,
            xfer: Vec::new(),
        }
    }

    fn device_name(&self, passthrough: bool) -> String {
        if passthrough {
            if !self.passthrough_device.is_empty() {
                return self.passthrough_device.clone();
            }
            if let Ok(device) = std::env::var("ALSA_AC3_DEVICE") {
                if !device.is_empty() {
                    return device;
                }
            }
        }
        if !self.pcm_device.is_empty() {
            return self.pcm_device.clone();
        }
        match std::env::var("ALSA_DEVICE") {
            Ok(device) if !device.is_empty() => device,
            _ => "default".into(),
        }
    }

    fn open_pcm(&self, passthrough: bool) -> Result<PCM, AudioError> {
        let device = self.device_name(passthrough);
        tracing::info!(%device, passthrough, "using alsa device");
        PCM::new(&device, Direction::Playback, false)
            .map_err(|err| AudioError::BackendOpen(format!("{device}: {err}")))
    }

    fn open_mixer(&mut self) {
        let device = if self.mixer_device.is_empty() {
            std::env::var("ALSA_MIXER").unwrap_or_else(|_| "default".into())
        } else {
            self.mixer_device.clone()
        };
        if self.mixer_channel.is_empty() {
            self.mixer_channel =
                std::env::var("ALSA_MIXER_CHANNEL").unwrap_or_else(|_| "PCM".into());
        }
        tracing::debug!(%device, channel = %self.mixer_channel, "mixer open");
        match Mixer::new(&device, false) {
            Ok(mixer) => self.mixer = Some(mixer),
            Err(err) => tracing::error!(%device, %err, "can't open mixer"),
        }
    }
}

impl Backend for AlsaBackend {
    fn name(&self) -> &'static str {
        "alsa"
    }

    fn open(&mut self) {
        if self.pcm.is_none() {
            match self.open_pcm(false) {
                Ok(pcm) => {
                    if let Ok(hwp) = HwParams::any(&pcm) {
                        self.can_pause = hwp.can_pause();
                    }
                    tracing::info!(can_pause = self.can_pause, "alsa pcm opened");
                    self.pcm = Some(pcm);
                }
                Err(err) => tracing::error!(%err, "alsa open failed"),
            }
        }
        if self.mixer.is_none() {
            self.open_mixer();
        }
    }

    fn close(&mut self) {
        self.pcm = None;
        self.mixer = None;
    }

    fn setup(
        &mut self,
        rate: &mut u32,
        channels: &mut u32,
        passthrough: bool,
    ) -> Result<SetupStatus, AudioError> {
        if self.pcm.is_none() {
            return Err(AudioError::BackendOpen("alsa not running".into()));
        }
        // close+open cycle; required to recover HDMI sinks after a
        // format change re-handshake
        self.pcm = None;
        let pcm = self.open_pcm(passthrough)?;

        let map = |err: alsa::Error| AudioError::Backend(err.to_string());
        {
            let hwp = HwParams::any(&pcm).map_err(map)?;
            hwp.set_access(Access::RWInterleaved).map_err(map)?;
            hwp.set_format(Format::s16()).map_err(map)?;
            hwp.set_channels(*channels).map_err(map)?;
            hwp.set_rate(*rate, ValueOr::Nearest).map_err(map)?;
            let period = hwp
                .set_period_size_near(i64::from(*rate) * PERIOD_MS / 1000, ValueOr::Nearest)
                .map_err(map)?;
            hwp.set_buffer_size_near(period * 4).map_err(map)?;
            pcm.hw_params(&hwp).map_err(map)?;
        }
        pcm.prepare().map_err(map)?;

        let (got_rate, got_channels, period, buffer) = {
            let hwp = pcm.hw_params_current().map_err(map)?;
            (
                hwp.get_rate().map_err(map)?,
                hwp.get_channels().map_err(map)?,
                hwp.get_period_size().map_err(map)?,
                hwp.get_buffer_size().map_err(map)?,
            )
        };
        self.rate = got_rate;
        self.frame_bytes = got_channels as usize * BYTES_PER_SAMPLE;
        self.period_bytes = period.max(0) as usize * self.frame_bytes;
        self.xfer = Vec::with_capacity(buffer.max(0) as usize * got_channels as usize);

        tracing::debug!(
            buffer_frames = buffer,
            period_frames = period,
            rate = got_rate,
            channels = got_channels,
            "alsa setup"
        );

        let adjusted = got_rate != *rate || got_channels != *channels;
        *rate = got_rate;
        *channels = got_channels;
        self.pcm = Some(pcm);
        if adjusted {
            Ok(SetupStatus::Adjusted)
        } else {
            Ok(SetupStatus::Accepted)
        }
    }

    fn resume(&mut self) {
        let Some(pcm) = &self.pcm else { return };
        let result = if self.can_pause {
            pcm.pause(false)
        } else {
            pcm.prepare()
        };
        if let Err(err) = result {
            tracing::error!(%err, "alsa resume failed");
        }
    }

    fn suspend(&mut self) {
        let Some(pcm) = &self.pcm else { return };
        let result = if self.can_pause {
            pcm.pause(true)
        } else {
            pcm.drop()
        };
        if let Err(err) = result {
            tracing::error!(%err, "alsa suspend failed");
        }
    }

    fn discard(&mut self) {
        let Some(pcm) = &self.pcm else { return };
        let state = pcm.state();
        tracing::debug!(?state, "alsa flush");
        // dropping an unconfigured device crashes inside alsa-lib
        if state != State::Open {
            if let Err(err) = pcm.drop() {
                tracing::error!(%err, "snd_pcm_drop");
            }
            if let Err(err) = pcm.prepare() {
                tracing::error!(%err, "snd_pcm_prepare");
            }
        }
    }

    fn delay(&self) -> i64 {
        let Some(pcm) = &self.pcm else { return 0 };
        if self.rate == 0 {
            return 0;
        }
        // frames in alsa + kernel buffers; negative after an underrun
        let frames = pcm.delay().unwrap_or(0).max(0);
        frames * TICKS_PER_SECOND / i64::from(self.rate)
    }

    fn set_volume(&mut self, volume: u32) {
        let Some(mixer) = &self.mixer else { return };
        let Some(selem) = mixer.find_selem(&SelemId::new(&self.mixer_channel, 0)) else {
            return;
        };
        let (min, max) = selem.get_playback_volume_range();
        let value = min + ((max - min) * i64::from(volume)) / 1000;
        if let Err(err) = selem.set_playback_volume_all(value) {
            tracing::error!(%err, volume, "mixer volume failed");
        }
    }

    fn start_bytes(&self) -> usize {
        self.period_bytes
    }

    fn pump(&mut self, ctx: &mut PumpCtx<'_>) -> Pump {
        let Some(pcm) = &self.pcm else {
            std::thread::sleep(Duration::from_millis(WAIT_MS as u64));
            return Pump::Error;
        };

        // wait for space in kernel buffers
        loop {
            if ctx.cancelled() || ctx.paused() {
                return Pump::Played;
            }
            match pcm.wait(Some(WAIT_MS)) {
                Ok(true) => break,
                Ok(false) => return Pump::Played, // timeout
                Err(err) => {
                    tracing::warn!(%err, "alsa wait underrun error?");
                    if pcm.try_recover(err, true).is_err() {
                        tracing::error!("snd_pcm_wait not recoverable");
                        std::thread::sleep(Duration::from_millis(WAIT_MS as u64));
                        return Pump::Error;
                    }
                }
            }
        }

        let Ok(io) = pcm.io_i16() else {
            return Pump::Error;
        };
        let frame_bytes = self.frame_bytes.max(BYTES_PER_SAMPLE);
        let xfer = &mut self.xfer;
        let mut first = true;

        // fill the kernel buffer as much as possible
        loop {
            let avail = match pcm.avail_update() {
                Ok(frames) => frames.max(0) as usize * frame_bytes,
                Err(err) => {
                    tracing::warn!(%err, "alsa avail underrun error?");
                    if pcm.try_recover(err, true).is_ok() {
                        continue;
                    }
                    tracing::error!("snd_pcm_avail_update not recoverable");
                    return Pump::Error;
                }
            };
            if avail < 256 {
                // happens with broken drivers: kick a prepared device
                if first {
                    if pcm.state() == State::Prepared {
                        if let Err(err) = pcm.start() {
                            tracing::error!(%err, "snd_pcm_start");
                        }
                    }
                    std::thread::sleep(Duration::from_millis(5));
                }
                return Pump::Played;
            }

            let mut fatal = false;
            let n = ctx.pull(avail, |bytes| {
                xfer.clear();
                xfer.extend(
                    bytes
                        .chunks_exact(BYTES_PER_SAMPLE)
                        .map(|pair| i16::from_ne_bytes([pair[0], pair[1]])),
                );
                let samples = xfer.len() - xfer.len() % (frame_bytes / BYTES_PER_SAMPLE);
                loop {
                    match io.writei(&xfer[..samples]) {
                        Ok(frames) => return frames * frame_bytes,
                        Err(err) => {
                            tracing::warn!(%err, "alsa writei underrun error?");
                            if pcm.try_recover(err, true).is_ok() {
                                continue;
                            }
                            tracing::error!("snd_pcm_writei not recoverable");
                            fatal = true;
                            return 0;
                        }
                    }
                }
            });
            if fatal {
                return Pump::Error;
            }
            if n == 0 {
                if first {
                    // slot buffer empty; underrun only once the device
                    // has played out what it still holds
                    if pcm.state() != State::Running {
                        tracing::debug!(state = ?pcm.state(), "stopping play");
                        return Pump::Drained;
                    }
                    std::thread::sleep(Duration::from_millis(WAIT_MS as u64));
                }
                return Pump::Played;
            }
            first = false;
        }
    }
}
