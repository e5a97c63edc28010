//! OSS playback backend.
//!
//! Classic `/dev/dsp` output: blocking `write` paced by `poll` with the
//! fragment time as the timeout, `GETODELAY` for the clock and the
//! `GETOSPACE` fragment geometry for the start threshold.

use std::fs::File;
use std::io::Write;
use std::os::fd::{AsFd, AsRawFd};
use std::time::Duration;

use nix::libc;
use nix::poll::{poll, PollFd, PollFlags, PollTimeout};

use super::{Backend, Pump, PumpCtx, SetupStatus};
use crate::clock::{bytes_to_ticks, BYTES_PER_SAMPLE};
use crate::error::AudioError;
use crate::EngineConfig;

pub const AFMT_S16_LE: i32 = 0x0000_0010;
pub const AFMT_S16_NE: i32 = AFMT_S16_LE;

/// `audio_buf_info` of `SNDCTL_DSP_GETOSPACE`.
#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
pub struct BufferInfo {
    pub fragments: libc::c_int,
    pub fragstotal: libc::c_int,
    pub fragsize: libc::c_int,
    pub bytes: libc::c_int,
}

const DSP_MAGIC: u8 = b'P';
const DSP_RESET: u8 = 0;
const DSP_SPEED: u8 = 2;
const DSP_SETFMT: u8 = 5;
const DSP_CHANNELS: u8 = 6;
const DSP_GETOSPACE: u8 = 12;
const DSP_GETODELAY: u8 = 23;

nix::ioctl_none!(oss_halt_output, DSP_MAGIC, DSP_RESET);
nix::ioctl_readwrite!(oss_set_speed, DSP_MAGIC, DSP_SPEED, i32);
nix::ioctl_readwrite!(oss_set_format, DSP_MAGIC, DSP_SETFMT, i32);
nix::ioctl_readwrite!(oss_set_channels, DSP_MAGIC, DSP_CHANNELS, i32);
nix::ioctl_read!(oss_output_space, DSP_MAGIC, DSP_GETOSPACE, BufferInfo);
nix::ioctl_read!(oss_output_delay, DSP_MAGIC, DSP_GETODELAY, i32);

const MIXER_MAGIC: u8 = b'M';
const MIXER_VOLUME: u8 = 0;
const MIXER_PCM: u8 = 4;

nix::ioctl_readwrite!(oss_mixer_write_volume, MIXER_MAGIC, MIXER_VOLUME, i32);
nix::ioctl_readwrite!(oss_mixer_write_pcm, MIXER_MAGIC, MIXER_PCM, i32);

/// OSS `/dev/dsp` output with `/dev/mixer` volume.
pub struct OssBackend {
    pcm_device: String,
    passthrough_device: String,
    mixer_device: String,
    mixer_channel: String,

    dsp: Option<File>,
    mixer: Option<File>,
    rate: u32,
    channels: u32,
    fragment_ms: u64,
    start_bytes: usize,
}

impl OssBackend {
    /// Creates the backend from the configured device names.
    pub fn new(config: &EngineConfig) -> Self {
        Self {
            pcm_device: config.device.clone(),
            passthrough_device: config.passthrough_device.clone(),
            mixer_device: config.mixer_device.clone(),
            mixer_channel: config.mixer_channel.clone(),
            dsp: None,
            mixer: None,
            rate: 0,
            channels: 0,
            fragment_ms: 24,
            start_bytes: 0,
        }
    }

    fn device_name(&self, passthrough: bool) -> String {
        if passthrough {
            if !self.passthrough_device.is_empty() {
                return self.passthrough_device.clone();
            }
            if let Ok(device) = std::env::var("OSS_AC3_AUDIODEV") {
                if !device.is_empty() {
                    return device;
                }
            }
        }
        if !self.pcm_device.is_empty() {
            return self.pcm_device.clone();
        }
        match std::env::var("OSS_AUDIODEV") {
            Ok(device) if !device.is_empty() => device,
            _ => "/dev/dsp".into(),
        }
    }

    fn open_dsp(&self, passthrough: bool) -> Result<File, AudioError> {
        let device = self.device_name(passthrough);
        tracing::info!(%device, passthrough, "using oss device");
        File::options()
            .write(true)
            .open(&device)
            .map_err(|err| AudioError::BackendOpen(format!("{device}: {err}")))
    }

    fn open_mixer(&mut self) {
        let device = if self.mixer_device.is_empty() {
            std::env::var("OSS_MIXERDEV").unwrap_or_else(|_| "/dev/mixer".into())
        } else {
            self.mixer_device.clone()
        };
        if self.mixer_channel.is_empty() {
            self.mixer_channel =
                std::env::var("OSS_MIXER_CHANNEL").unwrap_or_else(|_| "pcm".into());
        }
        tracing::debug!(%device, channel = %self.mixer_channel, "mixer open");
        match File::options().read(true).write(true).open(&device) {
            Ok(file) => self.mixer = Some(file),
            Err(err) => tracing::error!(%device, %err, "can't open mixer device"),
        }
    }
}

impl Backend for OssBackend {
    fn name(&self) -> &'static str {
        "oss"
    }

    fn open(&mut self) {
        if self.dsp.is_none() {
            match self.open_dsp(false) {
                Ok(file) => self.dsp = Some(file),
                Err(err) => tracing::error!(%err, "oss open failed"),
            }
        }
        if self.mixer.is_none() {
            self.open_mixer();
        }
    }

    fn close(&mut self) {
        self.dsp = None;
        self.mixer = None;
    }

    fn setup(
        &mut self,
        rate: &mut u32,
        channels: &mut u32,
        passthrough: bool,
    ) -> Result<SetupStatus, AudioError> {
        if self.dsp.is_none() {
            return Err(AudioError::BackendOpen("oss not ready".into()));
        }
        // close+open for the pcm / pass-through device switch
        self.dsp = None;
        let dsp = self.open_dsp(passthrough)?;
        let fd = dsp.as_raw_fd();
        let mut adjusted = false;

        let mut format = AFMT_S16_NE;
        unsafe { oss_set_format(fd, &mut format) }
            .map_err(|err| AudioError::Backend(format!("SNDCTL_DSP_SETFMT: {err}")))?;
        if format != AFMT_S16_NE {
            return Err(AudioError::Backend(
                "device doesn't support 16 bit sample format".into(),
            ));
        }

        let mut want_channels = *channels as i32;
        unsafe { oss_set_channels(fd, &mut want_channels) }
            .map_err(|err| AudioError::Backend(format!("SNDCTL_DSP_CHANNELS: {err}")))?;
        if want_channels != *channels as i32 {
            tracing::warn!(
                requested = *channels,
                got = want_channels,
                "device doesn't support channel count"
            );
            *channels = want_channels as u32;
            adjusted = true;
        }

        let mut want_rate = *rate as i32;
        unsafe { oss_set_speed(fd, &mut want_rate) }
            .map_err(|err| AudioError::Backend(format!("SNDCTL_DSP_SPEED: {err}")))?;
        if want_rate != *rate as i32 {
            tracing::warn!(
                requested = *rate,
                got = want_rate,
                "device doesn't support sample rate"
            );
            *rate = want_rate as u32;
            adjusted = true;
        }

        let mut info = BufferInfo {
            fragsize: 4096,
            fragstotal: 16,
            ..Default::default()
        };
        if let Err(err) = unsafe { oss_output_space(fd, &mut info) } {
            tracing::error!(%err, "SNDCTL_DSP_GETOSPACE");
        }

        self.rate = *rate;
        self.channels = *channels;
        let byte_rate = (*rate as u64) * (*channels as u64) * BYTES_PER_SAMPLE as u64;
        self.fragment_ms = (info.fragsize.max(1) as u64 * 1000 / byte_rate.max(1)).max(1);
        // enough fragments for the initial burst write
        self.start_bytes = (info.fragsize.max(1) as usize - 1) * info.fragstotal.max(0) as usize;
        self.dsp = Some(dsp);

        tracing::debug!(
            fragsize = info.fragsize,
            fragstotal = info.fragstotal,
            free_fragments = info.fragments,
            fragment_ms = self.fragment_ms,
            "oss setup"
        );

        if adjusted {
            Ok(SetupStatus::Adjusted)
        } else {
            Ok(SetupStatus::Accepted)
        }
    }

    fn discard(&mut self) {
        if let Some(dsp) = &self.dsp {
            if let Err(err) = unsafe { oss_halt_output(dsp.as_raw_fd()) } {
                tracing::error!(%err, "SNDCTL_DSP_RESET");
            }
        }
    }

    fn delay(&self) -> i64 {
        let Some(dsp) = &self.dsp else { return 0 };
        let mut bytes: i32 = -1;
        if let Err(err) = unsafe { oss_output_delay(dsp.as_raw_fd(), &mut bytes) } {
            tracing::error!(%err, "SNDCTL_DSP_GETODELAY");
            return 0;
        }
        bytes_to_ticks(bytes.max(0) as usize, self.rate, self.channels)
    }

    fn set_volume(&mut self, volume: u32) {
        let Some(mixer) = &self.mixer else { return };
        let level = ((volume * 255) / 1000).min(255) as i32;
        let mut both = (level << 8) | level;
        let fd = mixer.as_raw_fd();
        let result = if self.mixer_channel.eq_ignore_ascii_case("volume") {
            unsafe { oss_mixer_write_volume(fd, &mut both) }
        } else {
            unsafe { oss_mixer_write_pcm(fd, &mut both) }
        };
        if let Err(err) = result {
            tracing::error!(%err, volume, "MIXER_WRITE");
        }
    }

    fn start_bytes(&self) -> usize {
        self.start_bytes
    }

    fn pump(&mut self, ctx: &mut PumpCtx<'_>) -> Pump {
        let fragment = Duration::from_millis(self.fragment_ms);
        let Some(dsp) = self.dsp.as_mut() else {
            std::thread::sleep(fragment);
            return Pump::Error;
        };
        let fd = dsp.as_raw_fd();

        // wait for space in kernel buffers
        loop {
            if ctx.cancelled() || ctx.paused() {
                return Pump::Played;
            }
            let mut fds = [PollFd::new(
                dsp.as_fd(),
                PollFlags::POLLOUT | PollFlags::POLLERR,
            )];
            let timeout = PollTimeout::from(self.fragment_ms.min(1000) as u16);
            match poll(&mut fds, timeout) {
                Ok(0) => return Pump::Played, // timeout
                Ok(_) => break,
                Err(nix::errno::Errno::EAGAIN | nix::errno::Errno::EINTR) => continue,
                Err(err) => {
                    tracing::error!(%err, "oss poll");
                    std::thread::sleep(fragment);
                    return Pump::Error;
                }
            }
        }

        let mut first = true;
        let mut stalled = false;
        loop {
            let mut info = BufferInfo::default();
            if let Err(err) = unsafe { oss_output_space(fd, &mut info) } {
                tracing::error!(%err, "SNDCTL_DSP_GETOSPACE");
                return Pump::Error;
            }
            // bytes can go negative on some drivers
            let space = info.bytes.max(0) as usize;
            if space == 0 {
                break;
            }

            let n = ctx.pull(space, |bytes| match dsp.write(bytes) {
                Ok(written) => {
                    if written != bytes.len() {
                        tracing::warn!(written, of = bytes.len(), "short oss write");
                    }
                    written
                }
                Err(err) => {
                    tracing::error!(%err, "oss write error");
                    stalled = true;
                    0
                }
            });
            if stalled || (n == 0 && first) {
                // slot empty or the device choked; let the buffers settle
                std::thread::sleep(fragment);
                return Pump::Drained;
            }
            if n == 0 {
                break;
            }
            first = false;
        }

        Pump::Played
    }
}
