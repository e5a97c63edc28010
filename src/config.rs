//! Engine configuration.

/// Configuration for the audio output engine.
///
/// Use [`EngineConfig::default()`] for sensible defaults, or customize
/// through [`AudioOut::builder()`](crate::AudioOut::builder).
///
/// # Example
///
/// ```
/// use playout_audio::EngineConfig;
///
/// let config = EngineConfig {
///     buffer_time_ms: 500,
///     ..Default::default()
/// };
/// ```
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// PCM playback device name.
    ///
    /// Selects the backend: an empty name selects the inert noop backend,
    /// a `/`-prefixed name (e.g. `/dev/dsp`) selects OSS, anything else
    /// (e.g. `default`, `hw:0,3`) selects ALSA.
    pub device: String,

    /// Pass-through device for compressed payloads (e.g. `hw:0,1`).
    ///
    /// Falls back to [`device`](Self::device) when empty.
    pub passthrough_device: String,

    /// Hardware mixer device name. Empty uses the backend default
    /// (`default` for ALSA, `/dev/mixer` for OSS).
    pub mixer_device: String,

    /// Hardware mixer channel name (e.g. `PCM` or `Master`).
    pub mixer_channel: String,

    /// Audio buffer time in milliseconds, the target amount of audio
    /// buffered before playback starts. Default: 336 ms.
    ///
    /// PES audio packets have a max distance of 300 ms, TS packets 100 ms;
    /// the default leaves headroom for both.
    pub buffer_time_ms: u32,

    /// Extra audio delay relative to video, in 90 kHz ticks. Positive
    /// values delay audio start and widen the start threshold.
    pub video_audio_delay: i64,

    /// Apply volume in software instead of the hardware mixer.
    pub soft_volume: bool,

    /// Enable the volume normalizer.
    pub normalize: bool,

    /// Maximum normalizer factor in per-mille.
    pub max_normalize: i32,

    /// Enable the volume compressor.
    pub compression: bool,

    /// Maximum compression factor in per-mille.
    pub max_compression: i32,

    /// Volume reduction for stereo output in per-mille, applied by the
    /// software amplifier on 2-channel PCM slots.
    pub stereo_descent: i32,
}

/// Default audio buffer time in milliseconds.
pub(crate) const DEFAULT_BUFFER_TIME_MS: u32 = 336;

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            device: String::new(),
            passthrough_device: String::new(),
            mixer_device: String::new(),
            mixer_channel: String::new(),
            buffer_time_ms: DEFAULT_BUFFER_TIME_MS,
            video_audio_delay: 0,
            soft_volume: false,
            normalize: false,
            max_normalize: 1000,
            compression: false,
            max_compression: 2000,
            stereo_descent: 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_defaults() {
        let config = EngineConfig::default();
        assert!(config.device.is_empty());
        assert_eq!(config.buffer_time_ms, 336);
        assert_eq!(config.video_audio_delay, 0);
        assert!(!config.soft_volume);
        assert!(!config.normalize);
        assert!(!config.compression);
        assert_eq!(config.stereo_descent, 0);
    }
}
