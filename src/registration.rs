// Affine registration: control points -> affine matrix -> cached warp LUT
//
// Solves two independent 3x3 normal-equation systems (one per destination
// axis) by ordinary least squares, accumulated directly rather than via an
// explicit design matrix, then Gaussian elimination with partial pivoting.
// The resulting affine matrix is expanded once into a per-pixel float LUT
// that every subsequent frame's warp just samples.
use std::collections::hash_map::DefaultHasher;
use std::fs;
use std::hash::{Hash, Hasher};
use std::io::Write;
use std::path::Path;

use crate::error::FusionError;
use crate::frame::Yuv420Buf;
use fusion_utils::debug;
use fusion_utils::log;
use fusion_utils::Result;

/// One `(x_visible, y_visible) -> (x_base, y_base)` control-point pair.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ControlPoint {
    pub x1: f64,
    pub y1: f64,
    pub x2: f64,
    pub y2: f64,
}

/// Parse the control-point file: one pair per line, four whitespace
/// separated integers `x_visible y_visible x_base y_base`.
pub fn parse_control_points(path: impl AsRef<Path>) -> Result<Vec<ControlPoint>> {
    let path = path.as_ref();
    let text = fs::read_to_string(path)
        .map_err(|e| FusionError::Io(path.display().to_string(), e))?;

    let mut points = Vec::new();
    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let parts: Vec<&str> = line.split_whitespace().collect();
        if parts.len() != 4 {
            return Err(FusionError::ControlPointParse(
                path.display().to_string(),
                format!("expected 4 integers, got {}: `{}`", parts.len(), line),
            )
            .into());
        }
        let mut vals = [0f64; 4];
        for (i, p) in parts.iter().enumerate() {
            vals[i] = p.parse::<i64>().map(|v| v as f64).map_err(|e| {
                FusionError::ControlPointParse(path.display().to_string(), e.to_string())
            })?;
        }
        points.push(ControlPoint {
            x1: vals[0],
            y1: vals[1],
            x2: vals[2],
            y2: vals[3],
        });
    }

    // The external-interfaces table's "minimum 3 pairs" is superseded
    // here by §4.6's explicit ordinary-least-squares requirement of
    // N >= 6 pairs; see DESIGN.md.
    if points.len() < 6 {
        return Err(FusionError::TooFewControlPoints(points.len()).into());
    }
    Ok(points)
}

/// Solve a 3x3 system given as an augmented `[f64; 4]` per row, via
/// Gaussian elimination with partial pivoting.
fn gaussian_eliminate(mut aug: [[f64; 4]; 3]) -> Result<[f64; 3]> {
    for col in 0..3 {
        let mut pivot_row = col;
        let mut pivot_val = aug[col][col].abs();
        for row in (col + 1)..3 {
            if aug[row][col].abs() > pivot_val {
                pivot_row = row;
                pivot_val = aug[row][col].abs();
            }
        }
        if pivot_val < 1e-12 {
            return Err(FusionError::SingularAffineSystem.into());
        }
        aug.swap(col, pivot_row);

        for row in (col + 1)..3 {
            let factor = aug[row][col] / aug[col][col];
            for k in col..4 {
                aug[row][k] -= factor * aug[col][k];
            }
        }
    }

    let mut x = [0f64; 3];
    for row in (0..3).rev() {
        let mut sum = aug[row][3];
        for col in (row + 1)..3 {
            sum -= aug[row][col] * x[col];
        }
        x[row] = sum / aug[row][row];
    }
    Ok(x)
}

/// Accumulate the normal equations for `target(x1, y1) ≈ a*x1 + b*y1 + c`
/// over every control point and solve for `(a, b, c)`.
fn solve_axis(points: &[ControlPoint], target: impl Fn(&ControlPoint) -> f64) -> Result<[f64; 3]> {
    let mut aug = [[0f64; 4]; 3];
    for p in points {
        let row = [p.x1, p.y1, 1.0];
        let t = target(p);
        for i in 0..3 {
            for j in 0..3 {
                aug[i][j] += row[i] * row[j];
            }
            aug[i][3] += row[i] * t;
        }
    }
    gaussian_eliminate(aug)
}

/// The six affine coefficients `x2 = a*x1 + b*y1 + c`, `y2 = d*x1 + e*y1 + f`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AffineMatrix {
    pub a: f64,
    pub b: f64,
    pub c: f64,
    pub d: f64,
    pub e: f64,
    pub f: f64,
}

/// Solve for the affine matrix mapping visible-frame coordinates to
/// base-frame coordinates, via ordinary least squares over `points`.
pub fn solve_affine(points: &[ControlPoint]) -> Result<AffineMatrix> {
    if points.len() < 6 {
        return Err(FusionError::TooFewControlPoints(points.len()).into());
    }
    let [a, b, c] = solve_axis(points, |p| p.x2)?;
    let [d, e, f] = solve_axis(points, |p| p.y2)?;
    Ok(AffineMatrix { a, b, c, d, e, f })
}

/// A per-destination-pixel `(src_x, src_y)` lookup table over base
/// geometry, derived once from an `AffineMatrix`.
pub struct WarpTable {
    pub width: usize,
    pub height: usize,
    pub col_tab: Vec<f32>, // source x per destination pixel
    pub row_tab: Vec<f32>, // source y per destination pixel
}

impl WarpTable {
    pub fn from_affine(m: &AffineMatrix, width: usize, height: usize) -> WarpTable {
        let mut col_tab = vec![0f32; width * height];
        let mut row_tab = vec![0f32; width * height];
        for y in 0..height {
            for x in 0..width {
                let (xf, yf) = (x as f64, y as f64);
                let idx = y * width + x;
                col_tab[idx] = (m.a * xf + m.b * yf + m.c) as f32;
                row_tab[idx] = (m.d * xf + m.e * yf + m.f) as f32;
            }
        }
        WarpTable {
            width,
            height,
            col_tab,
            row_tab,
        }
    }

    fn save_one(path: impl AsRef<Path>, table: &[f32], width: usize, height: usize) -> Result<()> {
        let path = path.as_ref();
        let mut out = String::with_capacity(table.len() * 8);
        for y in 0..height {
            let row = &table[y * width..(y + 1) * width];
            for (i, v) in row.iter().enumerate() {
                if i > 0 {
                    out.push(' ');
                }
                out.push_str(&v.to_string());
            }
            out.push('\n');
        }
        fs::write(path, out).map_err(|e| FusionError::Io(path.display().to_string(), e).into())
    }

    /// Load one table file. A missing file is a cache miss (`Ok(None)`);
    /// a present-but-unparseable file is the configuration error named
    /// in §7 ("unparseable table file -- fatal at init"), surfaced as
    /// `FusionError::TableParse`.
    fn load_one(path: impl AsRef<Path>, width: usize, height: usize) -> Result<Option<Vec<f32>>> {
        let path = path.as_ref();
        let text = match fs::read_to_string(path) {
            Ok(t) => t,
            Err(_) => return Ok(None),
        };
        let mut table = Vec::with_capacity(width * height);
        for line in text.lines() {
            for tok in line.split_whitespace() {
                match tok.parse::<f32>() {
                    Ok(v) => table.push(v),
                    Err(e) => {
                        return Err(FusionError::TableParse(
                            path.display().to_string(),
                            e.to_string(),
                        )
                        .into())
                    }
                }
            }
        }
        if table.len() != width * height {
            return Err(FusionError::TableParse(
                path.display().to_string(),
                format!("expected {} floats, got {}", width * height, table.len()),
            )
            .into());
        }
        Ok(Some(table))
    }

    /// Save both tables to disk, alongside a sidecar fingerprint file
    /// keyed on geometry and the control-point list. Per the design
    /// notes' caching note, this fingerprint -- not just file presence
    /// -- is what gates reuse on the next load.
    pub fn save_cached(
        &self,
        col_path: impl AsRef<Path>,
        row_path: impl AsRef<Path>,
        fingerprint_path: impl AsRef<Path>,
        fingerprint: u64,
    ) -> Result<()> {
        Self::save_one(&col_path, &self.col_tab, self.width, self.height)?;
        Self::save_one(&row_path, &self.row_tab, self.width, self.height)?;
        let path = fingerprint_path.as_ref();
        let mut f = fs::File::create(path).map_err(|e| FusionError::Io(path.display().to_string(), e))?;
        writeln!(f, "{}", fingerprint).map_err(|e| FusionError::Io(path.display().to_string(), e))?;
        Ok(())
    }

    /// Load a cached table pair. A missing or mismatched-fingerprint
    /// cache is a miss (`Ok(None)`, recompute); a cache whose fingerprint
    /// matches but whose table file is unparseable is the fatal
    /// configuration error named in §7, propagated as
    /// `FusionError::TableParse` rather than silently treated as absent.
    pub fn load_cached(
        col_path: impl AsRef<Path>,
        row_path: impl AsRef<Path>,
        fingerprint_path: impl AsRef<Path>,
        width: usize,
        height: usize,
        expected_fingerprint: u64,
    ) -> Result<Option<WarpTable>> {
        let stored = match fs::read_to_string(fingerprint_path.as_ref()) {
            Ok(s) => s,
            Err(_) => return Ok(None),
        };
        let stored = match stored.trim().parse::<u64>() {
            Ok(v) => v,
            Err(_) => return Ok(None),
        };
        if stored != expected_fingerprint {
            debug!("registration: cache fingerprint mismatch, recomputing");
            return Ok(None);
        }
        let col_tab = match Self::load_one(col_path, width, height)? {
            Some(t) => t,
            None => return Ok(None),
        };
        let row_tab = match Self::load_one(row_path, width, height)? {
            Some(t) => t,
            None => return Ok(None),
        };
        Ok(Some(WarpTable {
            width,
            height,
            col_tab,
            row_tab,
        }))
    }
}

/// A stable fingerprint over base/unreg geometry and the control-point
/// list, used to key the on-disk warp-table cache.
pub fn fingerprint(
    base_w: usize,
    base_h: usize,
    unreg_w: usize,
    unreg_h: usize,
    points: &[ControlPoint],
) -> u64 {
    let mut hasher = DefaultHasher::new();
    base_w.hash(&mut hasher);
    base_h.hash(&mut hasher);
    unreg_w.hash(&mut hasher);
    unreg_h.hash(&mut hasher);
    for p in points {
        p.x1.to_bits().hash(&mut hasher);
        p.y1.to_bits().hash(&mut hasher);
        p.x2.to_bits().hash(&mut hasher);
        p.y2.to_bits().hash(&mut hasher);
    }
    hasher.finish()
}

/// Bilinear-sample `src`'s Y plane at floating-point coordinates.
/// Returns `None` if the sample would read outside the source frame.
fn bilinear_sample(src: &Yuv420Buf, x: f32, y: f32) -> Option<u8> {
    if x < 0.0 || y < 0.0 {
        return None;
    }
    let x0 = x.floor() as i64;
    let y0 = y.floor() as i64;
    let (w, h) = (src.width as i64, src.height as i64);
    if x0 < 0 || y0 < 0 || x0 + 1 >= w || y0 + 1 >= h {
        return None;
    }
    let fx = x - x0 as f32;
    let fy = y - y0 as f32;
    let y_plane = src.y_plane();
    let p00 = y_plane.get(x0 as usize, y0 as usize) as f32;
    let p10 = y_plane.get(x0 as usize + 1, y0 as usize) as f32;
    let p01 = y_plane.get(x0 as usize, y0 as usize + 1) as f32;
    let p11 = y_plane.get(x0 as usize + 1, y0 as usize + 1) as f32;
    let top = p00 * (1.0 - fx) + p10 * fx;
    let bottom = p01 * (1.0 - fx) + p11 * fx;
    Some((top * (1.0 - fy) + bottom * fy).round() as u8)
}

/// Warp `src` (unregistered visible, full resolution) into `dst` (base
/// geometry) using `table`. Luma is bilinear-sampled; chroma is
/// nearest-neighbor copied from `src`'s subsampled planes only at
/// destination pixels where both coordinates are even. Destination
/// pixels whose source coordinate is out of bounds are left untouched
/// (the caller must have zero-initialized `dst`'s Y plane; chroma stays
/// at its pre-filled neutral value).
pub fn warp(src: &Yuv420Buf, table: &WarpTable, dst: &mut Yuv420Buf) {
    {
        let mut y_mut = dst.y_plane_mut();
        for y in 0..table.height {
            for x in 0..table.width {
                let idx = y * table.width + x;
                if let Some(v) = bilinear_sample(src, table.col_tab[idx], table.row_tab[idx]) {
                    y_mut.set(x, y, v);
                }
            }
        }
    }

    for y in (0..table.height).step_by(2) {
        for x in (0..table.width).step_by(2) {
            let idx = y * table.width + x;
            let sx = table.col_tab[idx].round();
            let sy = table.row_tab[idx].round();
            if sx < 0.0 || sy < 0.0 {
                continue;
            }
            let (sx, sy) = (sx as usize, sy as usize);
            if sx >= src.width || sy >= src.height {
                continue;
            }
            let (u, v) = src.chroma_at(sx, sy);
            dst.set_chroma_at(x, y, u, v);
        }
    }
}
