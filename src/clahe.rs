// 14-bit raw IR to 8-bit CLAHE-contrast-stretched grayscale
//
// Per the design notes' "Global mutable state" entry, the source treats
// this converter as a process-wide singleton. Here it is an explicit
// owned `ClaheConverter` value, constructed once by `FusionPipeline::new`
// and handed to the IR preprocess worker; its scratch buffers (histogram,
// rearrange map, stretch map) are allocated once and reused frame to
// frame the same way the rest of the pipeline reuses its buffers.
use crate::config::{RawFormat, Resolution};
use crate::error::FusionError;
use crate::frame::PlaneMut;
use fusion_utils::debug;
use fusion_utils::log;
use fusion_utils::Result;

/// Number of bins for a 14-bit raw sample range.
pub const N_BINS: usize = 16384;

/// Recombine packed 14-bit little-endian samples (high bit of the high
/// byte reserved/masked) into 16-bit values.
pub fn recombine(raw: &[u8], out: &mut [u16]) {
    for (i, pair) in raw.chunks_exact(2).enumerate() {
        out[i] = ((pair[1] & 0x7F) as u16) << 8 | pair[0] as u16;
    }
}

fn histogram(vals: &[u16], hist: &mut [u64]) {
    hist.iter_mut().for_each(|h| *h = 0);
    // `recombine` only masks the high byte's reserved top bit (§6), so a
    // recombined sample can reach 0x7FFF -- above `N_BINS`, which is
    // sized for the true 14-bit range. Clamp rather than trust the raw
    // value as an index.
    let top = hist.len() - 1;
    for &v in vals {
        hist[(v as usize).min(top)] += 1;
    }
}

/// Sweep bins low to high, dropping any bin whose count is below
/// `cut_thresh`. Returns the `raw_bin -> compact_bin` map, the number of
/// valid bins, and the total pixel count across valid bins.
///
/// A single forward pass suffices: `compact_idx` only ever holds the
/// index of the next bin to be assigned, so clamping it to
/// `n_valid_bins - 1` gives exactly the source's two cases -- bins
/// below the running compact index map to the bin about to be emitted,
/// bins above the highest valid level collapse onto the last one.
fn rearrange(hist: &[u64], cut_thresh: u64) -> (Vec<u16>, usize, u64) {
    let n_valid_bins = hist.iter().filter(|&&c| c >= cut_thresh).count();
    let mut map = vec![0u16; hist.len()];
    let mut compact_idx: usize = 0;
    let mut n_valid_pixels: u64 = 0;
    for (raw_bin, &count) in hist.iter().enumerate() {
        if count >= cut_thresh {
            map[raw_bin] = compact_idx as u16;
            compact_idx += 1;
            n_valid_pixels += count;
        } else {
            map[raw_bin] = compact_idx.min(n_valid_bins.saturating_sub(1)) as u16;
        }
    }
    (map, n_valid_bins.max(1), n_valid_pixels.max(1))
}

fn compact_histogram(hist: &[u64], cut_thresh: u64, n_valid_bins: usize) -> Vec<u64> {
    let mut out = Vec::with_capacity(n_valid_bins);
    for &count in hist {
        if count >= cut_thresh {
            out.push(count);
        }
    }
    out.resize(n_valid_bins, 0);
    out
}

/// Saturate bins above `clip_level` and iteratively spread the excess
/// across bins that still have headroom, re-saturating as needed, until
/// no excess remains or a pass makes no further progress.
///
/// The source's corresponding loop decrements an unsigned remaining-pixel
/// counter and relies on it never going negative; per the open question
/// this is re-expressed with a signed accumulator and an explicit break.
fn clip_and_redistribute(hist: &mut [u64], clip_level: u64) {
    let n = hist.len();
    if n == 0 {
        return;
    }

    let mut excess: i64 = 0;
    for h in hist.iter_mut() {
        if *h > clip_level {
            excess += *h as i64 - clip_level as i64;
            *h = clip_level;
        }
    }

    for _ in 0..n {
        if excess <= 0 {
            break;
        }
        let headroom_bins = hist.iter().filter(|&&h| h < clip_level).count() as i64;
        if headroom_bins == 0 {
            break; // no bin has room left; remaining excess is dropped
        }
        let share = (excess / headroom_bins).max(1);
        let before = excess;
        for h in hist.iter_mut() {
            if excess <= 0 {
                break;
            }
            if *h < clip_level {
                let room = clip_level as i64 - *h as i64;
                let add = share.min(room).min(excess);
                *h += add as u64;
                excess -= add;
            }
        }
        if excess == before {
            break; // stalled
        }
    }
}

/// Cumulative-sum stretch map over the clipped compact histogram.
///
/// Per §9's open question, the source always passes `BLACK=0, WHITE=255`
/// to this formula regardless of the plane's actual observed range, so
/// that is what is implemented here; behavior for a hypothetical
/// non-default black/white pair is unspecified and not implemented.
fn stretch_map(compact_hist: &[u64], n_valid_pixels: u64) -> Vec<u8> {
    let mut map = vec![0u8; compact_hist.len()];
    let mut accum: u64 = 0;
    let scale = 255.0 / n_valid_pixels.max(1) as f64;
    for (i, &count) in compact_hist.iter().enumerate() {
        accum += count;
        let v = (scale * accum as f64).floor();
        map[i] = v.min(255.0).max(0.0) as u8;
    }
    map
}

/// Process-wide-in-spirit (but explicitly owned) CLAHE converter for one
/// fixed `(format, resolution)` pair. Re-used across every frame.
pub struct ClaheConverter {
    width: usize,
    height: usize,
    format: RawFormat,
    cut_thresh: u64,
    clip_limit: f32,

    raw_vals: Vec<u16>,
    hist: Vec<u64>,
}

impl ClaheConverter {
    pub fn new(
        reso: Resolution,
        format: RawFormat,
        cut_thresh: u64,
        clip_limit: f32,
    ) -> Result<ClaheConverter> {
        let (width, height) = reso.dims();
        if width == 0 || height == 0 {
            return Err(FusionError::UnsupportedResolution { width, height }.into());
        }
        let (width, height) = (width as usize, height as usize);
        Ok(ClaheConverter {
            width,
            height,
            format,
            cut_thresh,
            clip_limit,
            raw_vals: vec![0u16; width * height],
            hist: vec![0u64; N_BINS],
        })
    }

    pub fn raw_len(&self) -> usize {
        2 * self.width * self.height
    }

    /// Run the full recombine -> histogram -> rearrange -> clip ->
    /// stretch -> apply pipeline over one raw frame, writing the 8-bit
    /// result into `dst` (the gsci Y plane; chroma is the caller's
    /// concern -- it stays neutral at this stage).
    pub fn convert(&mut self, raw: &[u8], dst: &mut PlaneMut) -> Result<()> {
        if raw.len() != self.raw_len() {
            return Err(FusionError::BufferTooSmall {
                width: self.width,
                height: self.height,
                stride: 2,
                expected: self.raw_len(),
                actual: raw.len(),
            }
            .into());
        }

        recombine(raw, &mut self.raw_vals);
        histogram(&self.raw_vals, &mut self.hist);

        let (rearrange_map, n_valid_bins, n_valid_pixels) = rearrange(&self.hist, self.cut_thresh);
        let mut compact_hist = compact_histogram(&self.hist, self.cut_thresh, n_valid_bins);

        let clip_level =
            ((self.clip_limit as f64 * self.width as f64 * self.height as f64) / n_valid_bins as f64)
                .floor() as u64;
        clip_and_redistribute(&mut compact_hist, clip_level.max(1));

        let stretch = stretch_map(&compact_hist, n_valid_pixels);

        for y in 0..self.height {
            let row = dst.row_mut(y);
            for x in 0..self.width {
                let raw_val = self.raw_vals[y * self.width + x];
                let compact = rearrange_map[raw_val as usize] as usize;
                row[x] = stretch[compact.min(stretch.len().saturating_sub(1))];
            }
        }

        debug!(
            "clahe: {} valid bins, {} valid pixels, clip level {}",
            n_valid_bins, n_valid_pixels, clip_level
        );

        Ok(())
    }

    /// Serialize an already-converted Y plane per the configured output
    /// pixel layout, for callers of the debug taps that want the raw
    /// packed bytes rather than a typed `Plane`. Chroma is neutral
    /// (0x80) for the planar formats; RGB/RGBA triplicate the Y value.
    pub fn pack(&self, y: &crate::frame::Plane, out: &mut Vec<u8>) {
        out.clear();
        match self.format {
            RawFormat::Yuv420 => {
                out.extend_from_slice(y.as_slice());
                out.resize(out.len() + (self.width / 2) * (self.height / 2) * 2, 0x80);
            }
            RawFormat::Yuv422 => {
                out.extend_from_slice(y.as_slice());
                out.resize(out.len() + (self.width / 2) * self.height * 2, 0x80);
            }
            RawFormat::Rgb => {
                for &v in y.as_slice() {
                    out.extend_from_slice(&[v, v, v]);
                }
            }
            RawFormat::Rgba => {
                for &v in y.as_slice() {
                    out.extend_from_slice(&[v, v, v, 255]);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::PlaneBuf;

    #[test]
    fn recombine_masks_high_bit() {
        // lo=0xFF, hi=0xFF (high bit set, must be masked off) -> 0x7FFF
        let raw = [0xFFu8, 0xFFu8];
        let mut out = [0u16; 1];
        recombine(&raw, &mut out);
        assert_eq!(out[0], 0x7FFF);
    }

    #[test]
    fn histogram_clamps_values_above_n_bins() {
        // recombine can legally produce values up to 0x7FFF, above
        // N_BINS (16384) -- the histogram must clamp, not index OOB.
        let vals = [0x7FFFu16, 0, N_BINS as u16 - 1];
        let mut hist = vec![0u64; N_BINS];
        histogram(&vals, &mut hist);
        assert_eq!(hist[N_BINS - 1], 2);
        assert_eq!(hist[0], 1);
    }

    #[test]
    fn recombine_little_endian_pair() {
        let raw = [0x34u8, 0x12u8]; // lo=0x34 hi=0x12 -> 0x1234
        let mut out = [0u16; 1];
        recombine(&raw, &mut out);
        assert_eq!(out[0], 0x1234);
    }

    #[test]
    fn rearrange_drops_low_count_bins() {
        let mut hist = vec![0u64; 8];
        hist[0] = 1; // below cut_thresh=4, dropped
        hist[3] = 10; // valid
        hist[7] = 5; // valid
        let (map, n_valid, n_pixels) = rearrange(&hist, 4);
        assert_eq!(n_valid, 2);
        assert_eq!(n_pixels, 15);
        assert_eq!(map[3], 0);
        assert_eq!(map[7], 1);
        // bin 0 is below the first valid bin, maps to the next (bin 0)
        assert_eq!(map[0], 0);
        // a dropped bin between two valid bins maps to the upcoming
        // valid bin's compact index, not the prior one
        assert_eq!(map[5], 1);
    }

    #[test]
    fn clip_redistributes_excess_without_exceeding_total() {
        let mut hist = vec![10u64, 10, 10, 10];
        let total_before: u64 = hist.iter().sum();
        clip_and_redistribute(&mut hist, 5);
        let total_after: u64 = hist.iter().sum();
        assert!(total_after <= total_before);
        for h in &hist {
            assert!(*h <= 5);
        }
    }

    #[test]
    fn stretch_map_is_monotonic_and_bounded() {
        let hist = vec![5u64, 5, 5, 5];
        let map = stretch_map(&hist, 20);
        for w in map.windows(2) {
            assert!(w[1] >= w[0]);
        }
        assert_eq!(*map.last().unwrap(), 255);
    }

    #[test]
    fn convert_produces_full_dynamic_range_plane() {
        let w = 16usize;
        let h = 16usize;
        let mut raw = vec![0u8; 2 * w * h];
        for i in 0..(w * h) {
            let v = ((i * 97) % N_BINS) as u16;
            raw[i * 2] = (v & 0xFF) as u8;
            raw[i * 2 + 1] = ((v >> 8) & 0x7F) as u8;
        }

        let mut conv = ClaheConverter::new(Resolution::Custom(w as u32, h as u32), RawFormat::Yuv420, 1, 1.0)
            .unwrap();
        let mut dst = PlaneBuf::new(w, h);
        conv.convert(&raw, &mut dst.as_plane_mut()).unwrap();

        let (lo, hi) = dst.as_plane().min_max();
        assert!(hi > lo);
    }

    #[test]
    fn rejects_wrong_length_input() {
        let mut conv =
            ClaheConverter::new(Resolution::Custom(4, 4), RawFormat::Yuv420, 4, 1.0).unwrap();
        let mut dst = PlaneBuf::new(4, 4);
        assert!(conv.convert(&[0u8; 3], &mut dst.as_plane_mut()).is_err());
    }
}
