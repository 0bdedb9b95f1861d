// Bright-feature extraction and adaptive suppression
//
// One compose() call fuses a synchronized (gsci, regt, bkg) triple into
// a fused YUV frame, following the eight-step algorithm in the spec
// verbatim: saturating background subtraction, visible-background
// estimate, refinement, a 16-bit unsuppressed sum, an adaptive
// suppression ratio drawn from the brightest slice of that sum's
// histogram, and the final saturating overlay onto the registered
// visible luma.
use crate::config::FusionStyle;
use crate::frame::{Plane, PlaneBuf, PlaneMut, Yuv420Buf};
use crate::pixel::{add_saturate, add_widen, mul_scalar_saturate, sub_saturate};
use fusion_utils::Result;

/// Walk `usfn`'s histogram from the highest bin down, accumulating count
/// and bin-weighted sum until the cumulative count exceeds `bpr *
/// npixels`, then return the mean value of that brightest slice. `hist`
/// is caller-owned scratch, re-zeroed and reused every call rather than
/// allocated per frame.
///
/// The source's equivalent loop decrements an unsigned pixel-budget
/// counter that can wrap past zero; here the termination condition is an
/// explicit comparison against a budget that is never decremented below
/// zero, avoiding the wraparound the open question flags.
fn brightest_slice_mean(usfn: &[u16], hist: &mut [u64], bpr: f32) -> f64 {
    let ngls = hist.len();
    hist.iter_mut().for_each(|h| *h = 0);
    for &v in usfn {
        let bin = (v as usize).min(ngls - 1);
        hist[bin] += 1;
    }

    let budget = (bpr as f64 * usfn.len() as f64).max(0.0);
    let mut count: u64 = 0;
    let mut weighted_sum: f64 = 0.0;
    for bin in (0..ngls).rev() {
        let c = hist[bin];
        if c == 0 {
            continue;
        }
        count += c;
        weighted_sum += bin as f64 * c as f64;
        if count as f64 > budget {
            break;
        }
    }

    if count == 0 {
        0.0
    } else {
        weighted_sum / count as f64
    }
}

/// Reusable scratch buffers for one compositor instance, sized once at
/// construction and reused frame over frame.
pub struct FusionCompositor {
    width: usize,
    height: usize,
    bright: PlaneBuf,
    etbk: PlaneBuf,
    refined: PlaneBuf,
    usfn: Vec<u16>,
    suppressed: PlaneBuf,
    /// Suppression histogram, sized to `ngls` bins once at construction
    /// and re-zeroed (not reallocated) every `compose()` call.
    suppression_hist: Vec<u64>,
}

impl FusionCompositor {
    /// `ngls` must be at least 1 (the suppression histogram's bin
    /// count); it is clamped to 1 here, with the real validation living
    /// at `FusionPipeline::new` where a zero `ngls` is a configuration
    /// error.
    pub fn new(width: usize, height: usize, ngls: usize) -> FusionCompositor {
        FusionCompositor {
            width,
            height,
            bright: PlaneBuf::new(width, height),
            etbk: PlaneBuf::new(width, height),
            refined: PlaneBuf::new(width, height),
            usfn: vec![0u16; width * height],
            suppressed: PlaneBuf::new(width, height),
            suppression_hist: vec![0u64; ngls.max(1)],
        }
    }

    /// Fuse one synchronized `(gsci, regt, bkg)` triple into `fused`.
    /// `bright_out`, when given, receives the bright-feature tap
    /// (`gsci - bkg`, saturating) for `get_bright_feature`.
    #[allow(clippy::too_many_arguments)]
    pub fn compose(
        &mut self,
        gsci: &Plane,
        regt: &Yuv420Buf,
        bkg: &Plane,
        ssr: f32,
        bpr: f32,
        style: FusionStyle,
        fused: &mut Yuv420Buf,
        bright_out: Option<&mut PlaneMut>,
    ) -> Result<()> {
        let regt_y = regt.y_plane();

        // 1. bright = sub_saturate(gsci, bkg)
        sub_saturate(gsci, bkg, self.bright.as_slice_mut())?;
        if let Some(out) = bright_out {
            out.as_slice_mut().copy_from_slice(self.bright.as_slice());
        }

        // 2. etbk = sub_saturate(regt_Y, gsci)
        sub_saturate(&regt_y, gsci, self.etbk.as_slice_mut())?;

        // 3. refined = sub_saturate(bright, etbk)
        sub_saturate(&self.bright.as_plane(), &self.etbk.as_plane(), self.refined.as_slice_mut())?;

        // 4. usfn = add_widen(regt_Y, refined) (16-bit)
        add_widen(&regt_y, &self.refined.as_plane(), &mut self.usfn)?;

        // 5. adaptive suppression ratio
        let mean = brightest_slice_mean(&self.usfn, &mut self.suppression_hist, bpr);
        let sr = if mean > 0.0 {
            (255.0 / mean).min(ssr as f64) as f32
        } else {
            ssr
        };

        // 6. suppressed = mul_scalar_saturate(refined, sr)
        mul_scalar_saturate(&self.refined.as_plane(), sr, self.suppressed.as_slice_mut())?;

        // 7. fused_Y = add_saturate(regt_Y, suppressed)
        add_saturate(&regt_y, &self.suppressed.as_plane(), fused.y_plane_mut().as_slice_mut())?;

        // 8. chroma
        match style {
            FusionStyle::Color => {
                fused.uv_slice_mut().copy_from_slice(regt.uv_slice());
            }
            FusionStyle::Gray => {
                fused.fill_chroma_neutral();
            }
        }

        Ok(())
    }

    pub fn width(&self) -> usize {
        self.width
    }

    pub fn height(&self) -> usize {
        self.height
    }
}
