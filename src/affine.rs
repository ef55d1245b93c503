//! Voxel-to-world affine transforms.
//!
//! An [`Affine`] maps a zero-based homogeneous voxel index to world
//! coordinates. This module builds affines from the NIfTI quaternion
//! encoding, decomposes them back, and composes transforms between the
//! geometries of two formats.

use crate::error::{Error, Result};

/// Determinant magnitude below which an affine is treated as singular.
pub const SINGULAR_TOLERANCE: f64 = 1e-12;

/// A 4×4 row-major homogeneous transform.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Affine(pub [[f64; 4]; 4]);

impl Default for Affine {
    fn default() -> Self {
        Self::identity()
    }
}

impl From<[[f64; 4]; 4]> for Affine {
    fn from(rows: [[f64; 4]; 4]) -> Self {
        Self(rows)
    }
}

impl Affine {
    pub const fn identity() -> Self {
        Self([
            [1.0, 0.0, 0.0, 0.0],
            [0.0, 1.0, 0.0, 0.0],
            [0.0, 0.0, 1.0, 0.0],
            [0.0, 0.0, 0.0, 1.0],
        ])
    }

    /// Diagonal scaling with the given translation.
    pub fn from_zooms(zooms: [f64; 3], translation: [f64; 3]) -> Self {
        Self([
            [zooms[0], 0.0, 0.0, translation[0]],
            [0.0, zooms[1], 0.0, translation[1]],
            [0.0, 0.0, zooms[2], translation[2]],
            [0.0, 0.0, 0.0, 1.0],
        ])
    }

    /// Build from a 3×3 linear part and a translation.
    pub fn from_parts(linear: [[f64; 3]; 3], translation: [f64; 3]) -> Self {
        let mut m = Self::identity().0;
        for r in 0..3 {
            m[r][..3].copy_from_slice(&linear[r]);
            m[r][3] = translation[r];
        }
        Self(m)
    }

    pub fn rows(&self) -> &[[f64; 4]; 4] {
        &self.0
    }

    /// Rows narrowed to f32 (for formats that store single precision).
    pub fn to_f32(&self) -> [[f32; 4]; 4] {
        self.0.map(|row| row.map(|v| v as f32))
    }

    pub fn linear(&self) -> [[f64; 3]; 3] {
        let m = &self.0;
        [
            [m[0][0], m[0][1], m[0][2]],
            [m[1][0], m[1][1], m[1][2]],
            [m[2][0], m[2][1], m[2][2]],
        ]
    }

    pub fn translation(&self) -> [f64; 3] {
        [self.0[0][3], self.0[1][3], self.0[2][3]]
    }

    pub fn set_translation(&mut self, t: [f64; 3]) {
        for (r, v) in t.into_iter().enumerate() {
            self.0[r][3] = v;
        }
    }

    /// Column `j` of the linear part (the world step of voxel axis `j`).
    pub fn column(&self, j: usize) -> [f64; 3] {
        [self.0[0][j], self.0[1][j], self.0[2][j]]
    }

    /// Voxel sizes: Euclidean norms of the three linear columns.
    pub fn zooms(&self) -> [f64; 3] {
        [0, 1, 2].map(|j| norm(self.column(j)))
    }

    /// Voxel axes whose world step is zero.
    pub fn degenerate_axes(&self) -> Vec<usize> {
        (0..3).filter(|&j| norm(self.column(j)) == 0.0).collect()
    }

    /// Map a voxel coordinate to world space.
    pub fn apply(&self, p: [f64; 3]) -> [f64; 3] {
        let m = &self.0;
        [0, 1, 2].map(|r| m[r][0] * p[0] + m[r][1] * p[1] + m[r][2] * p[2] + m[r][3])
    }

    /// Matrix product `self · other`.
    pub fn matmul(&self, other: &Affine) -> Affine {
        let (a, b) = (&self.0, &other.0);
        let mut out = [[0.0; 4]; 4];
        for (r, row) in out.iter_mut().enumerate() {
            for (c, v) in row.iter_mut().enumerate() {
                *v = (0..4).map(|k| a[r][k] * b[k][c]).sum();
            }
        }
        Affine(out)
    }

    /// Determinant of the linear 3×3 part.
    pub fn determinant(&self) -> f64 {
        det3(&self.linear())
    }

    /// Inverse, failing with `NonInvertibleAffine` near singularity.
    pub fn inverse(&self) -> Result<Affine> {
        let m = self.linear();
        let det = det3(&m);
        if !det.is_finite() || det.abs() < SINGULAR_TOLERANCE {
            return Err(Error::NonInvertibleAffine(det));
        }
        let inv = [
            [
                (m[1][1] * m[2][2] - m[1][2] * m[2][1]) / det,
                (m[0][2] * m[2][1] - m[0][1] * m[2][2]) / det,
                (m[0][1] * m[1][2] - m[0][2] * m[1][1]) / det,
            ],
            [
                (m[1][2] * m[2][0] - m[1][0] * m[2][2]) / det,
                (m[0][0] * m[2][2] - m[0][2] * m[2][0]) / det,
                (m[0][2] * m[1][0] - m[0][0] * m[1][2]) / det,
            ],
            [
                (m[1][0] * m[2][1] - m[1][1] * m[2][0]) / det,
                (m[0][1] * m[2][0] - m[0][0] * m[2][1]) / det,
                (m[0][0] * m[1][1] - m[0][1] * m[1][0]) / det,
            ],
        ];
        let t = self.translation();
        let inv_t = [0, 1, 2].map(|r| -(inv[r][0] * t[0] + inv[r][1] * t[1] + inv[r][2] * t[2]));
        Ok(Affine::from_parts(inv, inv_t))
    }

    /// Largest absolute element-wise difference.
    pub fn max_abs_diff(&self, other: &Affine) -> f64 {
        self.0
            .iter()
            .flatten()
            .zip(other.0.iter().flatten())
            .map(|(a, b)| (a - b).abs())
            .fold(0.0, f64::max)
    }

    pub fn approx_eq(&self, other: &Affine, tol: f64) -> bool {
        self.max_abs_diff(other) <= tol
    }

    /// True when the linear columns are mutually orthogonal (no shear).
    pub fn is_orthogonal(&self, tol: f64) -> bool {
        let cols = [0, 1, 2].map(|j| self.column(j));
        let zooms = cols.map(norm);
        for i in 0..3 {
            for j in (i + 1)..3 {
                let denom = zooms[i] * zooms[j];
                if denom > 0.0 && (dot(cols[i], cols[j]) / denom).abs() > tol {
                    return false;
                }
            }
        }
        true
    }

    /// Translate the origin to voxel `offset`: `new_t = A · [offset, 1]`.
    pub fn shifted(&self, offset: [f64; 3]) -> Affine {
        let mut out = *self;
        out.set_translation(self.apply(offset));
        out
    }
}

/// Transform taking voxel coordinates of `src` to voxel coordinates of `dst`:
/// `inverse(dst) · src`.
pub fn compose(src: &Affine, dst: &Affine) -> Result<Affine> {
    Ok(dst.inverse()?.matmul(src))
}

/// Quaternion geometry fields as stored by NIfTI.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Quaternion {
    /// Stored components `(b, c, d)`; `a` is implied non-negative.
    pub bcd: [f64; 3],
    /// Translation `(qoffset_x, qoffset_y, qoffset_z)`.
    pub offset: [f64; 3],
    /// Voxel sizes along the three axes.
    pub zooms: [f64; 3],
    /// Handedness flag, `-1` flips the third column.
    pub qfac: f64,
}

/// Build the affine encoded by quaternion fields (scale → rotate → translate).
#[allow(clippy::many_single_char_names)]
pub fn quaternion_to_affine(q: &Quaternion) -> Affine {
    let [b, c, d] = q.bcd;
    let a = (1.0 - b * b - c * c - d * d).max(0.0).sqrt();
    let qfac = if q.qfac < 0.0 { -1.0 } else { 1.0 };
    // A zero or negative voxel size is treated as 1, as the reference readers do.
    let [i, j, k] = q.zooms.map(|z| if z > 0.0 { z } else { 1.0 });
    let k = k * qfac;
    let r = [
        [a * a + b * b - c * c - d * d, 2.0 * (b * c - a * d), 2.0 * (b * d + a * c)],
        [2.0 * (b * c + a * d), a * a + c * c - b * b - d * d, 2.0 * (c * d - a * b)],
        [2.0 * (b * d - a * c), 2.0 * (c * d + a * b), a * a + d * d - c * c - b * b],
    ];
    let linear = [0, 1, 2].map(|row| [r[row][0] * i, r[row][1] * j, r[row][2] * k]);
    Affine::from_parts(linear, q.offset)
}

/// Decompose an affine into quaternion fields.
///
/// The linear part is orthogonalised first, so a sheared affine yields the
/// closest rotation. A zero-length column becomes the matching unit axis with
/// zoom 1; callers check [`Affine::degenerate_axes`] and report that loss.
#[allow(clippy::many_single_char_names)]
pub fn affine_to_quaternion(affine: &Affine) -> Quaternion {
    let mut cols = [0, 1, 2].map(|j| affine.column(j));
    let mut zooms = cols.map(norm);
    for (j, col) in cols.iter_mut().enumerate() {
        if zooms[j] == 0.0 {
            // Degenerate column: substitute the matching unit vector.
            zooms[j] = 1.0;
            *col = [0.0; 3];
            col[j] = 1.0;
        } else {
            *col = col.map(|v| v / zooms[j]);
        }
    }
    // Row-major 3×3 with normalised columns.
    let m = [
        [cols[0][0], cols[1][0], cols[2][0]],
        [cols[0][1], cols[1][1], cols[2][1]],
        [cols[0][2], cols[1][2], cols[2][2]],
    ];
    let mut r = polar_orthogonalize(m);
    let qfac = if det3(&r) > 0.0 {
        1.0
    } else {
        for row in &mut r {
            row[2] = -row[2];
        }
        -1.0
    };

    let (r11, r12, r13) = (r[0][0], r[0][1], r[0][2]);
    let (r21, r22, r23) = (r[1][0], r[1][1], r[1][2]);
    let (r31, r32, r33) = (r[2][0], r[2][1], r[2][2]);
    let trace = r11 + r22 + r33 + 1.0;
    let a: f64;
    let (mut b, mut c, mut d): (f64, f64, f64);
    if trace > 0.5 {
        a = 0.5 * trace.sqrt();
        b = 0.25 * (r32 - r23) / a;
        c = 0.25 * (r13 - r31) / a;
        d = 0.25 * (r21 - r12) / a;
    } else {
        let xd = 1.0 + r11 - (r22 + r33);
        let yd = 1.0 + r22 - (r11 + r33);
        let zd = 1.0 + r33 - (r11 + r22);
        if xd > 1.0 {
            b = 0.5 * xd.sqrt();
            c = 0.25 * (r12 + r21) / b;
            d = 0.25 * (r13 + r31) / b;
            a = 0.25 * (r32 - r23) / b;
        } else if yd > 1.0 {
            c = 0.5 * yd.sqrt();
            b = 0.25 * (r12 + r21) / c;
            d = 0.25 * (r23 + r32) / c;
            a = 0.25 * (r13 - r31) / c;
        } else {
            d = 0.5 * zd.sqrt();
            b = 0.25 * (r13 + r31) / d;
            c = 0.25 * (r23 + r32) / d;
            a = 0.25 * (r21 - r12) / d;
        }
        if a < 0.0 {
            b = -b;
            c = -c;
            d = -d;
        }
    }

    Quaternion {
        bcd: [b, c, d],
        offset: affine.translation(),
        zooms,
        qfac,
    }
}

/// Closest orthogonal matrix by Newton iteration on the polar decomposition.
fn polar_orthogonalize(m: [[f64; 3]; 3]) -> [[f64; 3]; 3] {
    let mut x = m;
    for _ in 0..100 {
        let Some(inv) = invert3(&x) else {
            return m;
        };
        // X_{k+1} = (X_k + X_k^{-T}) / 2
        let mut next = [[0.0; 3]; 3];
        let mut delta = 0.0f64;
        for r in 0..3 {
            for c in 0..3 {
                next[r][c] = 0.5 * (x[r][c] + inv[c][r]);
                delta = delta.max((next[r][c] - x[r][c]).abs());
            }
        }
        x = next;
        if delta < 1e-14 {
            break;
        }
    }
    x
}

fn invert3(m: &[[f64; 3]; 3]) -> Option<[[f64; 3]; 3]> {
    let det = det3(m);
    if det.abs() < SINGULAR_TOLERANCE {
        return None;
    }
    let mut out = [[0.0; 3]; 3];
    for (r, row) in out.iter_mut().enumerate() {
        for (c, v) in row.iter_mut().enumerate() {
            // adjugate: transpose of cofactors
            let (r1, r2) = ((c + 1) % 3, (c + 2) % 3);
            let (c1, c2) = ((r + 1) % 3, (r + 2) % 3);
            *v = (m[r1][c1] * m[r2][c2] - m[r1][c2] * m[r2][c1]) / det;
        }
    }
    Some(out)
}

pub(crate) fn det3(m: &[[f64; 3]; 3]) -> f64 {
    m[0][0] * (m[1][1] * m[2][2] - m[1][2] * m[2][1])
        - m[0][1] * (m[1][0] * m[2][2] - m[1][2] * m[2][0])
        + m[0][2] * (m[1][0] * m[2][1] - m[1][1] * m[2][0])
}

fn dot(a: [f64; 3], b: [f64; 3]) -> f64 {
    a[0] * b[0] + a[1] * b[1] + a[2] * b[2]
}

pub(crate) fn norm(v: [f64; 3]) -> f64 {
    dot(v, v).sqrt()
}

/// Rotation about the three world axes by angles in radians, applied x, then y, then z.
pub(crate) fn euler_rotation(rx: f64, ry: f64, rz: f64) -> [[f64; 3]; 3] {
    let (sx, cx) = rx.sin_cos();
    let (sy, cy) = ry.sin_cos();
    let (sz, cz) = rz.sin_cos();
    let x = [[1.0, 0.0, 0.0], [0.0, cx, -sx], [0.0, sx, cx]];
    let y = [[cy, 0.0, sy], [0.0, 1.0, 0.0], [-sy, 0.0, cy]];
    let z = [[cz, -sz, 0.0], [sz, cz, 0.0], [0.0, 0.0, 1.0]];
    matmul3(&z, &matmul3(&y, &x))
}

pub(crate) fn matmul3(a: &[[f64; 3]; 3], b: &[[f64; 3]; 3]) -> [[f64; 3]; 3] {
    let mut out = [[0.0; 3]; 3];
    for (r, row) in out.iter_mut().enumerate() {
        for (c, v) in row.iter_mut().enumerate() {
            *v = (0..3).map(|k| a[r][k] * b[k][c]).sum();
        }
    }
    out
}
