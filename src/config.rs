// Tunable options for a fusion pipeline instance
//
// This is a plain, `Default`-implementing struct handed to
// `FusionPipeline::new` by the (out-of-scope) caller. There is no
// mid-run reconfiguration: an `Options` value is consumed once at
// construction.

/// Fusion chroma source.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FusionStyle {
    /// Copy the registered visible frame's UV plane into the output.
    Color,
    /// Fill UV with the neutral value 0x80.
    Gray,
}

/// Output pixel layout for the CLAHE raw-to-gray converter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RawFormat {
    Yuv422,
    Yuv420,
    Rgb,
    Rgba,
}

/// Output frame geometry. The two resolutions named in the spec are
/// first-class variants; `Custom` exists for callers whose base geometry
/// does not match either reference sensor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    Base384x288,
    Base640x480,
    Custom(u32, u32),
}

impl Resolution {
    pub fn dims(&self) -> (u32, u32) {
        match self {
            Resolution::Base384x288 => (384, 288),
            Resolution::Base640x480 => (640, 480),
            Resolution::Custom(w, h) => (*w, *h),
        }
    }
}

/// Quadtree homogeneity thresholds.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct QuadtreeThresholds {
    pub min_bw: i32,
    pub min_bh: i32,
    pub min_range: u8,
}

impl Default for QuadtreeThresholds {
    fn default() -> Self {
        QuadtreeThresholds {
            min_bw: 12,
            min_bh: 9,
            min_range: 78,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Options {
    /// Bins in the suppression histogram (`ngls`).
    pub ngls: u32,
    /// Max suppression ratio (`ssr`).
    pub ssr: f32,
    /// Brightest-pixel fraction (`bpr`).
    pub bpr: f32,
    /// Quadtree split thresholds.
    pub quad: QuadtreeThresholds,
    /// Min-filter kernel size (must be odd).
    pub mf_size: u32,
    /// Gaussian sigma for background smoothing.
    pub gf_sigma: f32,
    /// CLAHE bin-drop threshold.
    pub cut_thresh: u64,
    /// CLAHE clip limit.
    pub clip_limit: f32,
    /// Fusion chroma source.
    pub style: FusionStyle,
    /// Output pixel layout for the CLAHE converter.
    pub raw_format: RawFormat,
    /// Output frame geometry.
    pub raw_reso: Resolution,
    /// Ring buffer capacity per frame slot, in whole frames. The real
    /// per-ring byte size is this multiplied by the frame size the ring
    /// carries.
    pub ring_depth_frames: usize,
}

impl Default for Options {
    fn default() -> Self {
        Options {
            ngls: 65536,
            ssr: 0.8,
            bpr: 0.001,
            quad: QuadtreeThresholds::default(),
            mf_size: 11,
            gf_sigma: 4.5,
            cut_thresh: 4,
            clip_limit: 1.0,
            style: FusionStyle::Color,
            raw_format: RawFormat::Yuv420,
            raw_reso: Resolution::Base640x480,
            ring_depth_frames: 2,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_spec_table() {
        let o = Options::default();
        assert_eq!(o.ngls, 65536);
        assert_eq!(o.ssr, 0.8);
        assert_eq!(o.bpr, 0.001);
        assert_eq!(o.quad.min_bw, 12);
        assert_eq!(o.quad.min_bh, 9);
        assert_eq!(o.quad.min_range, 78);
        assert_eq!(o.mf_size, 11);
        assert_eq!(o.gf_sigma, 4.5);
        assert_eq!(o.cut_thresh, 4);
        assert_eq!(o.clip_limit, 1.0);
        assert_eq!(o.raw_reso.dims(), (640, 480));
    }
}
