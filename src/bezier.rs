// Bicubic Bezier patch synthesis from a 4x4 control grid
//
// One patch is synthesized per quadtree leaf. The fixed Bernstein basis
// matrix is expressed as a `cgmath::Matrix4`, the same type the teacher
// uses for its own 4x4 transform math (`thundr::pipelines::geometric`),
// so the blob-local `M * P * M^T` contraction is a couple of matrix
// multiplies instead of a hand-rolled 4x4 loop.
use cgmath::{Matrix, Matrix4, Vector4};

use fusion_utils::region::Bounds;

use crate::frame::{Plane, PlaneMut};
use crate::pixel::clip_u8;

/// The fixed bicubic Bernstein basis matrix.
///
/// `cgmath::Matrix4::new` takes its arguments column-major, so the
/// literal rows below appear transposed in the call.
fn bernstein_basis() -> Matrix4<f32> {
    #[rustfmt::skip]
    let m = Matrix4::new(
        1.0, -3.0,  3.0, -1.0,
        0.0,  3.0, -6.0,  3.0,
        0.0,  0.0,  3.0, -3.0,
        0.0,  0.0,  0.0,  1.0,
    );
    m
}

/// Sample the 4x4 control grid for `rect` out of `src`, per
/// `(left + floor(x*bw/4), top + floor(y*bh/4))` for `(x, y)` in
/// `{0..3}^2`. Row index of the returned matrix is `y`, column index
/// is `x`.
fn control_grid(src: &Plane, rect: Bounds) -> Matrix4<f32> {
    let bw = rect.width();
    let bh = rect.height();

    let sample = |iy: i32, ix: i32| -> f32 {
        let sx = rect.left + (ix * bw) / 4;
        let sy = rect.top + (iy * bh) / 4;
        let sx = sx.clamp(0, src.width as i32 - 1) as usize;
        let sy = sy.clamp(0, src.height as i32 - 1) as usize;
        src.get(sx, sy) as f32
    };

    let col = |ix: i32| Vector4::new(sample(0, ix), sample(1, ix), sample(2, ix), sample(3, ix));
    Matrix4::from_cols(col(0), col(1), col(2), col(3))
}

/// Powers `[1, t, t^2, t^3]` for a normalized coordinate `t`.
#[inline]
fn powers(t: f32) -> Vector4<f32> {
    Vector4::new(1.0, t, t * t, t * t * t)
}

/// Synthesize the bicubic Bezier patch for a single quadtree leaf and
/// write it into `dst` at `rect`'s location. `src` is the min-filtered
/// image the control grid is drawn from.
pub fn synthesize_patch(src: &Plane, rect: Bounds, dst: &mut PlaneMut) {
    let bw = rect.width();
    let bh = rect.height();
    if bw <= 0 || bh <= 0 {
        return;
    }

    let m = bernstein_basis();
    let p = control_grid(src, rect);
    // C = M * P * M^T, contracted once per blob.
    let c = m * p * m.transpose();

    for y in 0..bh {
        let u = if bh > 1 {
            y as f32 / (bh - 1) as f32
        } else {
            0.0
        };
        let u_vec = powers(u);
        let dy = rect.top + y;
        if dy < 0 || dy as usize >= dst.height {
            continue;
        }

        for x in 0..bw {
            let v = if bw > 1 {
                x as f32 / (bw - 1) as f32
            } else {
                0.0
            };
            let dx = rect.left + x;
            if dx < 0 || dx as usize >= dst.width {
                continue;
            }

            let v_vec = powers(v);
            let value = u_vec.dot(c * v_vec);
            dst.set(dx as usize, dy as usize, clip_u8(value));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::PlaneBuf;

    fn checker_src() -> PlaneBuf {
        // A source plane big enough that an 8x8 rect's control grid
        // samples land on distinct values, so corners are identifiable.
        let w = 32usize;
        let h = 32usize;
        let mut buf = PlaneBuf::new(w, h);
        let mut p = buf.as_plane_mut();
        for y in 0..h {
            for x in 0..w {
                p.set(x, y, ((x * 7 + y * 13) % 256) as u8);
            }
        }
        buf
    }

    // Bezier corner fidelity: at (u, v) in {(0,0), (0,1), (1,0), (1,1)}
    // the synthesized surface equals the corresponding corner
    // control-point value (up to rounding).
    #[test]
    fn corners_match_control_points() {
        let src_buf = checker_src();
        let src = src_buf.as_plane();
        let rect = Bounds::new(4, 4, 12, 12); // 8x8 blob

        let mut dst_buf = PlaneBuf::new(32, 32);
        {
            let mut dst = dst_buf.as_plane_mut();
            synthesize_patch(&src, rect, &mut dst);
        }
        let dst = dst_buf.as_plane();

        let p = control_grid(&src, rect);
        // cgmath matrix columns are indexed by the control grid's x
        // (v-axis), rows within a column by y (u-axis): p.x is column
        // x=0, p.w is column x=3, and `.x`/`.w` pick row y=0/y=3.
        let expect_tl = p.x.x as u8; // u=0, v=0
        let expect_tr = p.w.x as u8; // u=0, v=1
        let expect_bl = p.x.w as u8; // u=1, v=0
        let expect_br = p.w.w as u8; // u=1, v=1

        assert_eq!(dst.get(rect.left as usize, rect.top as usize), expect_tl);
        assert_eq!(
            dst.get(rect.right as usize - 1, rect.top as usize),
            expect_tr
        );
        assert_eq!(
            dst.get(rect.left as usize, rect.bottom as usize - 1),
            expect_bl
        );
        assert_eq!(
            dst.get(rect.right as usize - 1, rect.bottom as usize - 1),
            expect_br
        );
    }

    #[test]
    fn flat_source_produces_flat_patch() {
        let mut buf = PlaneBuf::new(16, 16);
        {
            let mut p = buf.as_plane_mut();
            p.fill(77);
        }
        let src = buf.as_plane();
        let rect = Bounds::new(0, 0, 16, 16);

        let mut dst_buf = PlaneBuf::new(16, 16);
        {
            let mut dst = dst_buf.as_plane_mut();
            synthesize_patch(&src, rect, &mut dst);
        }
        let dst = dst_buf.as_plane();
        for y in 0..16 {
            for x in 0..16 {
                assert_eq!(dst.get(x, y), 77);
            }
        }
    }
}
