//! Presentation timestamps in 90 kHz ticks.
//!
//! The whole engine speaks the MPEG system clock: signed 64-bit integers in
//! units of 1/90 000 s. [`NO_PTS`] marks an undefined or invalidated
//! timestamp.

/// Sentinel for an undefined timestamp.
pub const NO_PTS: i64 = i64::MIN;

/// Ticks per second of the presentation clock.
pub const TICKS_PER_SECOND: i64 = 90_000;

/// Bytes per sample; the engine works on signed 16-bit PCM throughout.
pub const BYTES_PER_SAMPLE: usize = 2;

/// Converts a byte count of interleaved 16-bit samples into clock ticks.
///
/// Returns 0 when the format is not yet known (zero rate or channels).
pub(crate) fn bytes_to_ticks(bytes: usize, rate: u32, channels: u32) -> i64 {
    let per_second = rate as i64 * channels as i64 * BYTES_PER_SAMPLE as i64;
    if per_second == 0 {
        return 0;
    }
    (bytes as i64 * TICKS_PER_SECOND) / per_second
}

/// Converts clock ticks into a byte count, rounded down to a whole frame.
pub(crate) fn ticks_to_bytes(ticks: i64, rate: u32, channels: u32) -> usize {
    if ticks <= 0 {
        return 0;
    }
    let frames = (ticks * rate as i64) / TICKS_PER_SECOND;
    (frames as usize) * channels as usize * BYTES_PER_SAMPLE
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bytes_to_ticks_one_second() {
        // 48kHz stereo, 1s of audio = 192000 bytes = 90000 ticks
        assert_eq!(bytes_to_ticks(192_000, 48_000, 2), 90_000);
    }

    #[test]
    fn test_bytes_to_ticks_unknown_format() {
        assert_eq!(bytes_to_ticks(4096, 0, 2), 0);
        assert_eq!(bytes_to_ticks(4096, 48_000, 0), 0);
    }

    #[test]
    fn test_ticks_to_bytes_round_trip() {
        assert_eq!(ticks_to_bytes(90_000, 48_000, 2), 192_000);
    }

    #[test]
    fn test_ticks_to_bytes_rounds_to_frame() {
        // 1 tick at 44.1kHz is less than a frame
        assert_eq!(ticks_to_bytes(1, 44_100, 2), 0);
        assert_eq!(ticks_to_bytes(-90_000, 48_000, 2), 0);
    }

    #[test]
    fn test_no_pts_is_int64_min() {
        assert_eq!(NO_PTS, i64::MIN);
        assert_eq!(NO_PTS as u64, 0x8000_0000_0000_0000);
    }
}
