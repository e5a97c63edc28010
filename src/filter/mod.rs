//! Sample-domain filters.
//!
//! The producer runs every PCM packet through a fixed chain: channel remix,
//! then compressor, then normalizer, all on interleaved signed 16-bit
//! samples and all in integer per-mille arithmetic. The software amplifier
//! is separate: it runs on the playback side, in place on the bytes about
//! to reach the device.
//!
//! Pass-through slots bypass the whole chain.

mod remix;

pub(crate) use remix::remix;

use crate::clock::BYTES_PER_SAMPLE;

/// Samples per normalizer measurement block.
const NORM_BLOCK_SAMPLES: usize = 4096;

/// Number of measurement blocks in the normalizer window.
const NORM_WINDOW: usize = 128;

/// Floor for the normalizer factor in per-mille.
const MIN_NORMALIZE: i32 = 100;

#[inline]
fn clamp_i16(t: i32) -> i16 {
    t.clamp(i32::from(i16::MIN), i32::from(i16::MAX)) as i16
}

/// Applies the software amplifier in place on raw sample bytes.
///
/// `gain` is per-mille. Muted or zero gain writes silence.
pub(crate) fn soft_amplify(bytes: &mut [u8], gain: i32, mute: bool) {
    if mute || gain == 0 {
        bytes.fill(0);
        return;
    }
    for pair in bytes.chunks_exact_mut(BYTES_PER_SAMPLE) {
        let t = i32::from(i16::from_ne_bytes([pair[0], pair[1]])) * gain / 1000;
        pair.copy_from_slice(&clamp_i16(t).to_ne_bytes());
    }
}

/// Producer-side filter state.
///
/// Single-producer: the enqueue path owns this between slot boundaries;
/// the worker only resets it when a new slot begins.
pub(crate) struct FilterChain {
    compression: bool,
    max_compression: i32,
    compression_factor: i32,

    normalize: bool,
    max_normalize: i32,
    normalize_factor: i32,
    norm_table: [u32; NORM_WINDOW],
    norm_index: usize,
    norm_ready: usize,
    norm_counter: usize,

    /// Reusable remix output, bounded by the largest packet seen
    /// (`frames * hw_channels`); avoids per-call heap allocation.
    scratch: Vec<i16>,
}

impl FilterChain {
    pub(crate) fn new(config: &crate::EngineConfig) -> Self {
        let mut chain = Self {
            compression: config.compression,
            max_compression: config.max_compression,
            compression_factor: 0,
            normalize: config.normalize,
            max_normalize: config.max_normalize,
            normalize_factor: 1000,
            norm_table: [0; NORM_WINDOW],
            norm_index: 0,
            norm_ready: 0,
            norm_counter: 0,
            scratch: Vec::new(),
        };
        chain.reset_compressor();
        chain
    }

    /// Remixes one packet to the hardware channel count and applies the
    /// enabled filters. Returns the processed samples; their length is
    /// `frames * hw_channels`.
    pub(crate) fn process(&mut self, input: &[u8], in_channels: u32, hw_channels: u32) -> &[i16] {
        let frames = input.len() / (in_channels as usize * BYTES_PER_SAMPLE);
        let mut scratch = std::mem::take(&mut self.scratch);
        remix(input, in_channels as usize, frames, &mut scratch, hw_channels as usize);
        if self.compression {
            self.compress(&mut scratch);
        }
        if self.normalize {
            self.normalize(&mut scratch);
        }
        self.scratch = scratch;
        &self.scratch
    }

    /// Look-ahead-free per-packet compression.
    fn compress(&mut self, samples: &mut [i16]) {
        let peak = samples.iter().map(|s| i32::from(*s).abs()).max().unwrap_or(0);
        if peak == 0 {
            return; // silent, nothing to do
        }
        let target = (i32::from(i16::MAX) * 1000) / peak;
        self.compression_factor = (self.compression_factor * 950 + target * 50) / 1000;
        if self.compression_factor > target {
            self.compression_factor = target; // no clipping
        }
        if self.compression_factor > self.max_compression {
            self.compression_factor = self.max_compression;
        }
        tracing::trace!(
            peak,
            target,
            factor = self.compression_factor,
            "compress"
        );
        for s in samples.iter_mut() {
            *s = clamp_i16(i32::from(*s) * self.compression_factor / 1000);
        }
    }

    pub(crate) fn reset_compressor(&mut self) {
        self.compression_factor = 2000.min(self.max_compression);
    }

    /// Windowed block-average normalizer.
    fn normalize(&mut self, samples: &mut [i16]) {
        let mut data = &samples[..];
        while !data.is_empty() {
            let n = data.len().min(NORM_BLOCK_SAMPLES - self.norm_counter);
            let mut avg = self.norm_table[self.norm_index];
            for s in &data[..n] {
                let t = i32::from(*s);
                avg = avg.wrapping_add(((t * t) / NORM_BLOCK_SAMPLES as i32) as u32);
            }
            self.norm_table[self.norm_index] = avg;
            self.norm_counter += n;
            if self.norm_counter >= NORM_BLOCK_SAMPLES {
                self.finish_block();
            }
            data = &data[n..];
        }
        for s in samples.iter_mut() {
            *s = clamp_i16(i32::from(*s) * self.normalize_factor / 1000);
        }
    }

    /// Closes a measurement block; once the window is warm, folds the new
    /// average into the smoothed factor.
    fn finish_block(&mut self) {
        if self.norm_ready < NORM_WINDOW {
            self.norm_ready += 1;
        } else {
            let avg: u32 = self
                .norm_table
                .iter()
                .map(|v| v / NORM_WINDOW as u32)
                .sum();
            if avg > 0 {
                let factor = ((i32::from(i16::MAX) / 8) * 1000) / f64::from(avg).sqrt() as i32;
                self.normalize_factor = (self.normalize_factor * 500 + factor * 500) / 1000;
                self.normalize_factor = self
                    .normalize_factor
                    .clamp(MIN_NORMALIZE, self.max_normalize.max(MIN_NORMALIZE));
                tracing::trace!(avg, factor, smoothed = self.normalize_factor, "normalize");
            }
        }
        self.norm_index = (self.norm_index + 1) % NORM_WINDOW;
        self.norm_counter = 0;
        self.norm_table[self.norm_index] = 0;
    }

    pub(crate) fn reset_normalizer(&mut self) {
        self.norm_counter = 0;
        self.norm_ready = 0;
        self.norm_index = 0;
        self.norm_table = [0; NORM_WINDOW];
        self.normalize_factor = 1000;
    }

    /// Resets the per-slot filter state; called by the worker when a new
    /// slot begins.
    pub(crate) fn reset(&mut self) {
        self.reset_compressor();
        self.reset_normalizer();
    }

    pub(crate) fn set_compression(&mut self, enabled: bool, max_factor: i32) {
        self.compression = enabled;
        self.max_compression = max_factor;
        if self.compression_factor == 0 {
            self.compression_factor = 1000;
        }
        if self.compression_factor > self.max_compression {
            self.compression_factor = self.max_compression;
        }
    }

    pub(crate) fn set_normalize(&mut self, enabled: bool, max_factor: i32) {
        self.normalize = enabled;
        self.max_normalize = max_factor;
    }

    #[cfg(test)]
    pub(crate) fn compression_factor(&self) -> i32 {
        self.compression_factor
    }

    #[cfg(test)]
    pub(crate) fn normalize_factor(&self) -> i32 {
        self.normalize_factor
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::EngineConfig;

    fn bytes(samples: &[i16]) -> Vec<u8> {
        samples.iter().flat_map(|s| s.to_ne_bytes()).collect()
    }

    fn chain(config: &EngineConfig) -> FilterChain {
        FilterChain::new(config)
    }

    // ==================== amplifier ====================

    #[test]
    fn test_amplifier_unity_gain() {
        let mut data = bytes(&[100, -100, 32000]);
        soft_amplify(&mut data, 1000, false);
        assert_eq!(data, bytes(&[100, -100, 32000]));
    }

    #[test]
    fn test_amplifier_scales_and_clamps() {
        let mut data = bytes(&[1000, -1000, 30000]);
        soft_amplify(&mut data, 2000, false);
        assert_eq!(data, bytes(&[2000, -2000, i16::MAX]));
    }

    #[test]
    fn test_amplifier_mute_is_silence() {
        let mut data = bytes(&[1000, -1000]);
        soft_amplify(&mut data, 1000, true);
        assert_eq!(data, bytes(&[0, 0]));
    }

    #[test]
    fn test_amplifier_zero_gain_is_silence() {
        let mut data = bytes(&[1000, -1000]);
        soft_amplify(&mut data, 0, false);
        assert_eq!(data, bytes(&[0, 0]));
    }

    // ==================== compressor ====================

    #[test]
    fn test_compressor_reset_floor() {
        let config = EngineConfig {
            compression: true,
            max_compression: 3000,
            ..Default::default()
        };
        let c = chain(&config);
        assert_eq!(c.compression_factor(), 2000);
    }

    #[test]
    fn test_compressor_reset_clamped_by_max() {
        let config = EngineConfig {
            compression: true,
            max_compression: 1500,
            ..Default::default()
        };
        let c = chain(&config);
        assert_eq!(c.compression_factor(), 1500);
    }

    #[test]
    fn test_compressor_silence_leaves_state() {
        let config = EngineConfig {
            compression: true,
            max_compression: 3000,
            ..Default::default()
        };
        let mut c = chain(&config);
        let out = c.process(&bytes(&[0, 0, 0, 0]), 2, 2).to_vec();
        assert_eq!(out, vec![0, 0, 0, 0]);
        assert_eq!(c.compression_factor(), 2000);
    }

    #[test]
    fn test_compressor_never_exceeds_peak_target() {
        let config = EngineConfig {
            compression: true,
            max_compression: 10_000,
            ..Default::default()
        };
        let mut c = chain(&config);
        // peak 16384 -> target = 32767*1000/16384 = 1999
        c.process(&bytes(&[16384, -16384]), 2, 2);
        let target = (i32::from(i16::MAX) * 1000) / 16384;
        assert!(c.compression_factor() <= target);
    }

    #[test]
    fn test_compressor_converges_upward() {
        let config = EngineConfig {
            compression: true,
            max_compression: 10_000,
            ..Default::default()
        };
        let mut c = chain(&config);
        let quiet = bytes(&[4000i16; 64]);
        let first = {
            c.process(&quiet, 2, 2);
            c.compression_factor()
        };
        for _ in 0..50 {
            c.process(&quiet, 2, 2);
        }
        assert!(c.compression_factor() > first);
    }

    // ==================== normalizer ====================

    #[test]
    fn test_normalizer_warmup_factor_is_unity() {
        let config = EngineConfig {
            normalize: true,
            max_normalize: 4000,
            ..Default::default()
        };
        let mut c = chain(&config);
        // the first 128 completed blocks only fill the window; the
        // factor must stay at unity throughout
        let block = bytes(&[2000i16; NORM_BLOCK_SAMPLES]);
        for _ in 0..NORM_WINDOW {
            c.process(&block, 2, 2);
            assert_eq!(c.normalize_factor(), 1000);
        }
    }

    #[test]
    fn test_normalizer_raises_quiet_signal_after_warmup() {
        let config = EngineConfig {
            normalize: true,
            max_normalize: 8000,
            ..Default::default()
        };
        let mut c = chain(&config);
        let block = bytes(&[500i16; NORM_BLOCK_SAMPLES]);
        // fill the window, then a few more blocks to fold in measurements
        for _ in 0..NORM_WINDOW + 8 {
            c.process(&block, 2, 2);
        }
        // quiet signal: factor should rise above unity, bounded by max
        assert!(c.normalize_factor() > 1000);
        assert!(c.normalize_factor() <= 8000);
    }

    #[test]
    fn test_normalizer_reset_clears_state() {
        let config = EngineConfig {
            normalize: true,
            max_normalize: 8000,
            ..Default::default()
        };
        let mut c = chain(&config);
        let block = bytes(&[500i16; NORM_BLOCK_SAMPLES]);
        for _ in 0..NORM_WINDOW + 8 {
            c.process(&block, 2, 2);
        }
        c.reset_normalizer();
        assert_eq!(c.normalize_factor(), 1000);
        c.process(&block, 2, 2);
        assert_eq!(c.normalize_factor(), 1000); // warming up again
    }

    // ==================== chain ====================

    #[test]
    fn test_chain_remixes_to_hw_channels() {
        let config = EngineConfig::default();
        let mut c = chain(&config);
        let out = c.process(&bytes(&[100, 200]), 1, 2).to_vec();
        assert_eq!(out, vec![100, 100, 200, 200]);
    }

    #[test]
    fn test_chain_disabled_filters_pass_through() {
        let config = EngineConfig::default();
        let mut c = chain(&config);
        let out = c.process(&bytes(&[1234, -1234]), 2, 2).to_vec();
        assert_eq!(out, vec![1234, -1234]);
    }
}
