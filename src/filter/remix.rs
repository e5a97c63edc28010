//! Integer channel remixing.
//!
//! All mixdown weights are per-mille; the weighted sum is divided by 1000
//! at the end. Only integer channel remixing is performed, never sample-rate
//! conversion.

/// Reads sample `i` of a native-endian 16-bit interleaved byte buffer.
#[inline]
fn sample(bytes: &[u8], i: usize) -> i32 {
    i32::from(i16::from_ne_bytes([bytes[2 * i], bytes[2 * i + 1]]))
}

/// Upmix mono to stereo by duplicating each sample.
fn mono_to_stereo(input: &[u8], frames: usize, out: &mut Vec<i16>) {
    for i in 0..frames {
        let t = sample(input, i) as i16;
        out.push(t);
        out.push(t);
    }
}

/// Downmix stereo to mono by averaging channels.
fn stereo_to_mono(input: &[u8], frames: usize, out: &mut Vec<i16>) {
    for i in 0..frames {
        let l = sample(input, 2 * i);
        let r = sample(input, 2 * i + 1);
        out.push(((l + r) / 2) as i16);
    }
}

/// Downmix surround to stereo.
///
/// Channel order follows the hardware layout: L R Ls Rs C LFE RL RR.
fn surround_to_stereo(input: &[u8], in_channels: usize, frames: usize, out: &mut Vec<i16>) {
    for f in 0..frames {
        let s = |c: usize| sample(input, f * in_channels + c);
        let (l, r) = match in_channels {
            // stereo plus center
            3 => (s(0) * 600 + s(2) * 400, s(1) * 600 + s(2) * 400),
            // quad
            4 => (s(0) * 600 + s(2) * 400, s(1) * 600 + s(3) * 400),
            // 5.0
            5 => (
                s(0) * 500 + s(2) * 200 + s(4) * 300,
                s(1) * 500 + s(3) * 200 + s(4) * 300,
            ),
            // 5.1
            6 => (
                s(0) * 400 + s(2) * 200 + s(4) * 300 + s(5) * 300,
                s(1) * 400 + s(3) * 200 + s(4) * 300 + s(5) * 100,
            ),
            // 7.0
            7 => (
                s(0) * 400 + s(2) * 200 + s(4) * 300 + s(5) * 100,
                s(1) * 400 + s(3) * 200 + s(4) * 300 + s(6) * 100,
            ),
            // 7.1
            8 => (
                s(0) * 400 + s(2) * 150 + s(4) * 250 + s(5) * 100 + s(6) * 100,
                s(1) * 400 + s(3) * 150 + s(4) * 250 + s(5) * 100 + s(7) * 100,
            ),
            _ => unreachable!("caller filters channel counts"),
        };
        out.push((l / 1000) as i16);
        out.push((r / 1000) as i16);
    }
}

/// Upmix by copying existing channels and silencing the missing ones.
fn upmix(input: &[u8], in_channels: usize, frames: usize, out: &mut Vec<i16>, out_channels: usize) {
    for f in 0..frames {
        for c in 0..in_channels {
            out.push(sample(input, f * in_channels + c) as i16);
        }
        for _ in in_channels..out_channels {
            out.push(0);
        }
    }
}

/// Remixes `frames` frames of interleaved 16-bit input into `out`.
///
/// `out` is cleared first and holds `frames * out_channels` samples on
/// return. Unsupported combinations produce silence of the requested
/// output length; the engine never aborts on them.
pub(crate) fn remix(
    input: &[u8],
    in_channels: usize,
    frames: usize,
    out: &mut Vec<i16>,
    out_channels: usize,
) {
    out.clear();
    out.reserve(frames * out_channels);
    match (in_channels, out_channels) {
        (a, b) if a == b => {
            for i in 0..frames * in_channels {
                out.push(sample(input, i) as i16);
            }
        }
        (2, 1) => stereo_to_mono(input, frames, out),
        (1, 2) => mono_to_stereo(input, frames, out),
        (3..=8, 2) => surround_to_stereo(input, in_channels, frames, out),
        (5, 6) => upmix(input, in_channels, frames, out, out_channels),
        _ => {
            tracing::error!(
                in_channels,
                out_channels,
                "unsupported channel remix, playing silence"
            );
            out.resize(frames * out_channels, 0);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bytes(samples: &[i16]) -> Vec<u8> {
        samples.iter().flat_map(|s| s.to_ne_bytes()).collect()
    }

    fn run(input: &[i16], in_ch: usize, out_ch: usize) -> Vec<i16> {
        let mut out = Vec::new();
        remix(&bytes(input), in_ch, input.len() / in_ch, &mut out, out_ch);
        out
    }

    #[test]
    fn test_equal_channels_copy() {
        assert_eq!(run(&[1, 2, 3, 4], 2, 2), vec![1, 2, 3, 4]);
    }

    #[test]
    fn test_stereo_to_mono() {
        assert_eq!(run(&[100, 200, 300, 400], 2, 1), vec![150, 350]);
    }

    #[test]
    fn test_mono_to_stereo() {
        assert_eq!(run(&[100, 200], 1, 2), vec![100, 100, 200, 200]);
    }

    #[test]
    fn test_three_to_stereo_weights() {
        // 600*L + 400*C per side
        assert_eq!(run(&[1000, 2000, 500], 3, 2), vec![800, 1400]);
    }

    #[test]
    fn test_five_one_downmix() {
        // L R Ls Rs C LFE = [1000, 2000, 500, 500, 3000, 1000]
        // left  = (400*1000 + 200*500 + 300*3000 + 300*1000) / 1000 = 1900
        // right = (400*2000 + 200*500 + 300*3000 + 100*1000) / 1000 = 2000
        assert_eq!(run(&[1000, 2000, 500, 500, 3000, 1000], 6, 2), vec![1900, 2000]);
    }

    #[test]
    fn test_seven_one_downmix_mirrors() {
        let out = run(&[100, 100, 100, 100, 100, 100, 100, 100], 8, 2);
        assert_eq!(out[0], out[1]);
    }

    #[test]
    fn test_five_to_six_upmix_zeroes_lfe() {
        let out = run(&[1, 2, 3, 4, 5], 5, 6);
        assert_eq!(out, vec![1, 2, 3, 4, 5, 0]);
    }

    #[test]
    fn test_unsupported_combination_is_silence() {
        // 4 -> 6 has no mixdown table; expect silence of the output length
        let out = run(&[1, 2, 3, 4, 5, 6, 7, 8], 4, 6);
        assert_eq!(out, vec![0; 12]);
    }

    #[test]
    fn test_downmix_then_upmix_preserves_frame_count() {
        // two frames of 5.0 down to stereo and back up to five channels:
        // the frame count survives the round trip, the values do not
        let surround = [10i16, 20, 30, 40, 50, 60, 70, 80, 90, 100];
        let stereo = run(&surround, 5, 2);
        assert_eq!(stereo.len(), 4);
        let back = run(&stereo, 2, 5);
        assert_eq!(back.len(), 10);
    }
}
