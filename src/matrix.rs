//! Capability probe and channel remap matrix.
//!
//! At init the engine probes the backend with every supported rate and
//! channel-count combination and builds, per rate, a 9-entry remap vector:
//! for each requested channel count, the hardware channel count a slot
//! should actually carry (0 = unsupported). Format requests are answered
//! from this table without touching the device.

use crate::backend::Backend;

/// Sample rates the engine supports.
///
/// Hardware commonly offers 32000/44100/48000/88200/96000/176400/192000;
/// broadcast audio only ever needs these two.
pub(crate) const RATES: [u32; 2] = [44_100, 48_000];

/// Index into the per-rate tables for a supported rate.
pub(crate) fn rate_index(rate: u32) -> Option<usize> {
    RATES.iter().position(|&r| r == rate)
}

/// Preferred substitutes for an unsupported channel count, tried in order.
fn fallback_channels(requested: usize) -> &'static [u32] {
    match requested {
        1 => &[2],
        2 => &[4, 5, 6, 7, 8, 6, 2, 1],
        3 => &[4, 5, 6, 7, 8, 6, 2, 1],
        4 => &[5, 6, 7, 8, 6, 2, 1],
        5 => &[6, 7, 8, 6, 2, 1],
        6 => &[7, 8, 6, 2, 1],
        7 => &[8, 6, 2, 1],
        8 => &[6, 2, 1],
        _ => &[],
    }
}

/// Input-to-hardware channel matrix, one row per supported rate.
#[derive(Debug, Clone)]
pub(crate) struct ChannelMatrix {
    map: [[u32; 9]; RATES.len()],
}

impl ChannelMatrix {
    /// Probes which `(rate, channels)` tuples the backend accepts and
    /// derives the remap matrix.
    ///
    /// The 48 kHz pass only retries channel counts that 44.1 kHz accepted:
    /// a channel count must work at every supported rate to stay in the
    /// table.
    pub(crate) fn probe(backend: &mut dyn Backend) -> Self {
        let mut channels_in_hw = [0u32; 9];
        let mut rate_supported = [false; RATES.len()];

        for (index, &rate) in RATES.iter().enumerate() {
            for chan in 1..=8u32 {
                if index > 0 && channels_in_hw[chan as usize] == 0 {
                    continue;
                }
                let mut want_rate = rate;
                let mut want_chan = chan;
                match backend.setup(&mut want_rate, &mut want_chan, false) {
                    Ok(_) => {
                        channels_in_hw[chan as usize] = chan;
                        rate_supported[index] = true;
                    }
                    Err(_) => {
                        channels_in_hw[chan as usize] = 0;
                    }
                }
            }
        }

        let mut map = [[0u32; 9]; RATES.len()];
        for (index, row) in map.iter_mut().enumerate() {
            if !rate_supported[index] {
                continue;
            }
            for chan in 1..=8usize {
                if channels_in_hw[chan] != 0 {
                    row[chan] = channels_in_hw[chan];
                } else if let Some(&hw) = fallback_channels(chan)
                    .iter()
                    .find(|&&hw| channels_in_hw[hw as usize] != 0)
                {
                    row[chan] = hw;
                }
            }
        }

        Self { map }
    }

    /// Hardware channel count to use for a request, or `None` when the
    /// combination has no playable mapping.
    pub(crate) fn hw_channels(&self, rate: u32, channels: u32) -> Option<u32> {
        let index = rate_index(rate)?;
        if !(1..=8).contains(&channels) {
            return None;
        }
        match self.map[index][channels as usize] {
            0 => None,
            hw => Some(hw),
        }
    }

    /// Logs the per-rate channel map, like the probe summary at init.
    pub(crate) fn log_summary(&self) {
        for (index, row) in self.map.iter().enumerate() {
            tracing::info!(
                rate = RATES[index],
                map = ?&row[1..=8],
                "supported channel map"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MockBackend;

    fn probe(accept: &[u32]) -> ChannelMatrix {
        let mut backend = MockBackend::new().accept_channels(accept);
        ChannelMatrix::probe(&mut backend)
    }

    #[test]
    fn test_supported_channels_map_to_themselves() {
        let matrix = probe(&[1, 2, 6]);
        assert_eq!(matrix.hw_channels(48_000, 1), Some(1));
        assert_eq!(matrix.hw_channels(48_000, 2), Some(2));
        assert_eq!(matrix.hw_channels(44_100, 6), Some(6));
    }

    #[test]
    fn test_unsupported_rate_is_none() {
        let matrix = probe(&[2]);
        assert_eq!(matrix.hw_channels(32_000, 2), None);
        assert_eq!(matrix.hw_channels(0, 2), None);
    }

    #[test]
    fn test_out_of_range_channels_are_none() {
        let matrix = probe(&[2]);
        assert_eq!(matrix.hw_channels(48_000, 0), None);
        assert_eq!(matrix.hw_channels(48_000, 9), None);
    }

    #[test]
    fn test_surround_falls_back_to_stereo() {
        // stereo-only device: 6-channel input plays as a stereo mixdown
        let matrix = probe(&[2]);
        assert_eq!(matrix.hw_channels(48_000, 6), Some(2));
        assert_eq!(matrix.hw_channels(48_000, 8), Some(2));
    }

    #[test]
    fn test_mono_falls_back_to_stereo() {
        let matrix = probe(&[2]);
        assert_eq!(matrix.hw_channels(48_000, 1), Some(2));
    }

    #[test]
    fn test_eight_channel_prefers_five_one() {
        let matrix = probe(&[2, 6]);
        assert_eq!(matrix.hw_channels(48_000, 8), Some(6));
        // 5.0 upmixes into 5.1 rather than folding down
        assert_eq!(matrix.hw_channels(48_000, 5), Some(6));
    }

    #[test]
    fn test_probe_probes_both_rates() {
        let mut backend = MockBackend::new().accept_channels(&[2]);
        let handle = backend.handle();
        let _ = ChannelMatrix::probe(&mut backend);
        let setups = handle.setups();
        assert!(setups.iter().any(|&(rate, _, _)| rate == 44_100));
        assert!(setups.iter().any(|&(rate, _, _)| rate == 48_000));
        // the 48kHz pass only retries what 44.1kHz accepted
        assert_eq!(
            setups.iter().filter(|&&(rate, _, _)| rate == 48_000).count(),
            1
        );
    }

    #[test]
    fn test_noop_probe_rejects_everything() {
        let mut backend = crate::backend::NoopBackend::new();
        let matrix = ChannelMatrix::probe(&mut backend);
        for chan in 1..=8 {
            assert_eq!(matrix.hw_channels(48_000, chan), None);
        }
    }
}
