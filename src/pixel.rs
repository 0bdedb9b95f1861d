// Per-pixel arithmetic primitives over equal-shape 8-bit planes
//
// Every operation here is scalar and bit-exact per the spec; SIMD
// variants are a permitted optimization but must reproduce these exact
// results and are out of scope for this implementation.
use crate::frame::Plane;
use fusion_utils::anyhow;
use fusion_utils::Result;

fn require_same_shape(a: &Plane, b: &Plane) -> Result<()> {
    if a.width != b.width || a.height != b.height {
        return Err(anyhow!(
            "pixel op on mismatched shapes: {}x{} vs {}x{}",
            a.width,
            a.height,
            b.width,
            b.height
        ));
    }
    Ok(())
}

/// `C[i] = max(0, A[i] - B[i])` -- "keep gray range".
pub fn sub_saturate(a: &Plane, b: &Plane, out: &mut [u8]) -> Result<()> {
    require_same_shape(a, b)?;
    for y in 0..a.height {
        let ra = a.row(y);
        let rb = b.row(y);
        let dst = &mut out[y * a.width..(y + 1) * a.width];
        for x in 0..a.width {
            dst[x] = ra[x].saturating_sub(rb[x]);
        }
    }
    Ok(())
}

/// `C[i] = int16(A[i]) - int16(B[i])`.
pub fn sub_signed(a: &Plane, b: &Plane, out: &mut [i16]) -> Result<()> {
    require_same_shape(a, b)?;
    for y in 0..a.height {
        let ra = a.row(y);
        let rb = b.row(y);
        let dst = &mut out[y * a.width..(y + 1) * a.width];
        for x in 0..a.width {
            dst[x] = ra[x] as i16 - rb[x] as i16;
        }
    }
    Ok(())
}

/// `C[i] = min(255, A[i] + B[i])`.
pub fn add_saturate(a: &Plane, b: &Plane, out: &mut [u8]) -> Result<()> {
    require_same_shape(a, b)?;
    for y in 0..a.height {
        let ra = a.row(y);
        let rb = b.row(y);
        let dst = &mut out[y * a.width..(y + 1) * a.width];
        for x in 0..a.width {
            dst[x] = ra[x].saturating_add(rb[x]);
        }
    }
    Ok(())
}

/// `C[i] = uint16(A[i]) + uint16(B[i])`.
pub fn add_widen(a: &Plane, b: &Plane, out: &mut [u16]) -> Result<()> {
    require_same_shape(a, b)?;
    for y in 0..a.height {
        let ra = a.row(y);
        let rb = b.row(y);
        let dst = &mut out[y * a.width..(y + 1) * a.width];
        for x in 0..a.width {
            dst[x] = ra[x] as u16 + rb[x] as u16;
        }
    }
    Ok(())
}

/// Clamp a floating-point value to `[0, 255]` and round toward zero,
/// i.e. truncate.
#[inline]
pub fn clip_u8(v: f32) -> u8 {
    if v <= 0.0 {
        0
    } else if v >= 255.0 {
        255
    } else {
        v as u8
    }
}

/// `C[i] = clip_u8(k * A[i])`, rounding toward zero.
pub fn mul_scalar_saturate(a: &Plane, k: f32, out: &mut [u8]) -> Result<()> {
    for y in 0..a.height {
        let ra = a.row(y);
        let dst = &mut out[y * a.width..(y + 1) * a.width];
        for x in 0..a.width {
            dst[x] = clip_u8(k * ra[x] as f32);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn plane(data: &[u8], w: usize, h: usize) -> Vec<u8> {
        assert_eq!(data.len(), w * h);
        data.to_vec()
    }

    // Scenario 4: A = [10, 5, 200], B = [7, 9, 100] => C = [3, 0, 100].
    // Signed subtract on the same inputs => [3, -4, 100].
    #[test]
    fn saturating_and_signed_subtract_scenario() {
        let a_data = plane(&[10, 5, 200], 3, 1);
        let b_data = plane(&[7, 9, 100], 3, 1);
        let a = Plane::new(&a_data, 3, 1).unwrap();
        let b = Plane::new(&b_data, 3, 1).unwrap();

        let mut out = vec![0u8; 3];
        sub_saturate(&a, &b, &mut out).unwrap();
        assert_eq!(out, vec![3, 0, 100]);

        let mut signed_out = vec![0i16; 3];
        sub_signed(&a, &b, &mut signed_out).unwrap();
        assert_eq!(signed_out, vec![3, -4, 100]);
    }

    #[test]
    fn sub_saturate_is_zero_when_b_at_least_a() {
        let a_data = plane(&[0, 10, 255], 3, 1);
        let b_data = plane(&[5, 10, 255], 3, 1);
        let a = Plane::new(&a_data, 3, 1).unwrap();
        let b = Plane::new(&b_data, 3, 1).unwrap();

        let mut out = vec![0u8; 3];
        sub_saturate(&a, &b, &mut out).unwrap();
        assert_eq!(out, vec![0, 0, 0]);
        for v in out {
            assert!(v <= 255);
        }
    }

    #[test]
    fn add_saturate_clamps_at_255() {
        let a_data = plane(&[250, 1], 2, 1);
        let b_data = plane(&[10, 2], 2, 1);
        let a = Plane::new(&a_data, 2, 1).unwrap();
        let b = Plane::new(&b_data, 2, 1).unwrap();

        let mut out = vec![0u8; 2];
        add_saturate(&a, &b, &mut out).unwrap();
        assert_eq!(out, vec![255, 3]);
    }

    #[test]
    fn add_widen_does_not_clamp() {
        let a_data = plane(&[250, 250], 2, 1);
        let b_data = plane(&[250, 0], 2, 1);
        let a = Plane::new(&a_data, 2, 1).unwrap();
        let b = Plane::new(&b_data, 2, 1).unwrap();

        let mut out = vec![0u16; 2];
        add_widen(&a, &b, &mut out).unwrap();
        assert_eq!(out, vec![500, 250]);
    }

    #[test]
    fn mul_scalar_saturate_rounds_toward_zero() {
        let a_data = plane(&[10, 100], 2, 1);
        let a = Plane::new(&a_data, 2, 1).unwrap();

        let mut out = vec![0u8; 2];
        // 10 * 0.99 = 9.9 -> truncates to 9
        mul_scalar_saturate(&a, 0.99, &mut out).unwrap();
        assert_eq!(out[0], 9);

        // 100 * 3.0 = 300 -> clamps to 255
        mul_scalar_saturate(&a, 3.0, &mut out).unwrap();
        assert_eq!(out[1], 255);
    }

    #[test]
    fn mismatched_shapes_are_rejected() {
        let a_data = plane(&[1, 2], 2, 1);
        let b_data = plane(&[1, 2, 3], 3, 1);
        let a = Plane::new(&a_data, 2, 1).unwrap();
        let b = Plane::new(&b_data, 3, 1).unwrap();
        let mut out = vec![0u8; 3];
        assert!(sub_saturate(&a, &b, &mut out).is_err());
    }
}
