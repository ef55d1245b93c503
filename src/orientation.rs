//! Axis orientation tables: which world direction each voxel axis points
//! along, how to move between two orientations, and the axis conventions
//! each format imposes on the data it stores.

use crate::affine::Affine;
use crate::error::{Error, Result};
use crate::registry::Format;
use ndarray::{ArrayD, Axis};

/// Where one input voxel axis goes: output axis index and whether it flips.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AxisMap {
    pub axis: usize,
    pub flip: bool,
}

impl AxisMap {
    pub const fn new(axis: usize, flip: bool) -> Self {
        Self { axis, flip }
    }
}

/// Orientation of three spatial axes.
pub type Ornt = [AxisMap; 3];

/// The orientation that changes nothing.
pub const IDENTITY: Ornt = [
    AxisMap::new(0, false),
    AxisMap::new(1, false),
    AxisMap::new(2, false),
];

/// Axis labels for the negative and positive direction of each RAS world axis.
const LABELS: [(char, char); 3] = [('L', 'R'), ('P', 'A'), ('I', 'S')];

/// World axis and direction closest to each voxel axis of `affine`.
///
/// Axes are assigned greedily by the largest remaining normalised component,
/// so every voxel axis gets a distinct world axis even for oblique affines.
pub fn io_orientation(affine: &Affine) -> Ornt {
    let zooms = affine.zooms();
    let mut weights = [[0.0f64; 3]; 3];
    for (vox, zoom) in zooms.iter().enumerate() {
        let col = affine.column(vox);
        for world in 0..3 {
            weights[world][vox] = if *zoom > 0.0 { col[world] / zoom } else { 0.0 };
        }
    }
    let mut out = IDENTITY;
    let (mut used_world, mut used_vox) = ([false; 3], [false; 3]);
    for _ in 0..3 {
        let mut best = (0usize, 0usize, -1.0f64);
        for world in (0..3).filter(|w| !used_world[*w]) {
            for vox in (0..3).filter(|v| !used_vox[*v]) {
                let w = weights[world][vox].abs();
                if w > best.2 {
                    best = (world, vox, w);
                }
            }
        }
        let (world, vox, _) = best;
        used_world[world] = true;
        used_vox[vox] = true;
        out[vox] = AxisMap::new(world, weights[world][vox] < 0.0);
    }
    out
}

/// Axis codes such as `['R', 'A', 'S']` for an orientation.
pub fn ornt_to_axcodes(ornt: &Ornt) -> [char; 3] {
    ornt.map(|m| {
        let (neg, pos) = LABELS[m.axis];
        if m.flip {
            neg
        } else {
            pos
        }
    })
}

/// Axis codes of an affine.
pub fn aff2axcodes(affine: &Affine) -> [char; 3] {
    ornt_to_axcodes(&io_orientation(affine))
}

/// Parse axis codes (`"RAS"`, `"LPS"`, ...) into an orientation.
pub fn axcodes_to_ornt(codes: &str) -> Result<Ornt> {
    let chars: Vec<char> = codes.trim().chars().map(|c| c.to_ascii_uppercase()).collect();
    if chars.len() != 3 {
        return Err(Error::MalformedHeader(format!("axis codes {codes:?} must have 3 letters")));
    }
    let mut out = IDENTITY;
    let mut seen = [false; 3];
    for (vox, c) in chars.iter().enumerate() {
        let Some((world, &(neg, _))) = LABELS
            .iter()
            .enumerate()
            .find(|(_, (n, p))| n == c || p == c)
        else {
            return Err(Error::MalformedHeader(format!("unknown axis code {c:?} in {codes:?}")));
        };
        if std::mem::replace(&mut seen[world], true) {
            return Err(Error::MalformedHeader(format!("repeated axis in {codes:?}")));
        }
        out[vox] = AxisMap::new(world, *c == neg);
    }
    Ok(out)
}

/// Orientation taking data in `start` orientation to `end` orientation.
pub fn ornt_transform(start: &Ornt, end: &Ornt) -> Result<Ornt> {
    let mut out = IDENTITY;
    for (i, s) in start.iter().enumerate() {
        let Some((j, e)) = end.iter().enumerate().find(|(_, e)| e.axis == s.axis) else {
            return Err(Error::MalformedHeader(
                "orientations do not share the same world axes".into(),
            ));
        };
        out[i] = AxisMap::new(j, s.flip != e.flip);
    }
    Ok(out)
}

/// Affine taking voxel indices of the reoriented array back to indices of
/// the original array with spatial `shape`.
pub fn inv_ornt_aff(ornt: &Ornt, shape: &[usize]) -> Affine {
    let mut m = [[0.0; 4]; 4];
    m[3][3] = 1.0;
    for (i, map) in ornt.iter().enumerate() {
        let n = shape.get(i).copied().unwrap_or(1) as f64;
        if map.flip {
            m[i][map.axis] = -1.0;
            m[i][3] = n - 1.0;
        } else {
            m[i][map.axis] = 1.0;
        }
    }
    Affine(m)
}

/// Shape after applying `ornt`; axes past the third are unchanged.
pub fn reoriented_shape(ornt: &Ornt, shape: &[usize]) -> Vec<usize> {
    let mut out = shape.to_vec();
    for (i, map) in ornt.iter().enumerate() {
        if i < shape.len() && map.axis < shape.len() {
            out[map.axis] = shape[i];
        }
    }
    out
}

/// Flip and permute the spatial axes of `array` according to `ornt`.
pub fn apply_orientation(array: ArrayD<f64>, ornt: &Ornt) -> ArrayD<f64> {
    if *ornt == IDENTITY || array.ndim() < 3 {
        return array;
    }
    let mut array = array;
    for (i, map) in ornt.iter().enumerate() {
        if map.flip {
            array.invert_axis(Axis(i));
        }
    }
    let mut perm: Vec<usize> = (0..array.ndim()).collect();
    for (i, map) in ornt.iter().enumerate() {
        perm[map.axis] = i;
    }
    array.permuted_axes(perm)
}

/// Reorient an array and its affine together so that the result has the
/// orientation `target`.
pub fn reorient(array: ArrayD<f64>, affine: &Affine, target: &Ornt) -> Result<(ArrayD<f64>, Affine)> {
    let current = io_orientation(affine);
    let transform = ornt_transform(&current, target)?;
    let shape = array.shape().to_vec();
    let new_affine = affine.matmul(&inv_ornt_aff(&transform, &shape));
    Ok((apply_orientation(array, &transform), new_affine))
}

/// Spatial axis constraint a format places on stored arrays.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AxisConvention {
    /// Any orientation; the affine carries the geometry.
    Free,
    /// Spatial axes stored slowest-first (C order over `z, y, x`).
    ReversedSpatial,
    /// Axis-aligned grid with the x axis flipped (`LAS`), no rotation.
    XFlippedAxisAligned,
}

/// Per-format axis conventions used when converting between formats.
static CONVENTIONS: [(Format, AxisConvention); 8] = [
    (Format::Nifti1, AxisConvention::Free),
    (Format::Nifti2, AxisConvention::Free),
    (Format::Analyze, AxisConvention::XFlippedAxisAligned),
    (Format::Minc2, AxisConvention::ReversedSpatial),
    (Format::ParRec, AxisConvention::Free),
    (Format::Gifti, AxisConvention::Free),
    (Format::Trk, AxisConvention::Free),
    (Format::Tck, AxisConvention::Free),
];

pub fn convention(format: Format) -> AxisConvention {
    CONVENTIONS
        .iter()
        .find(|(f, _)| *f == format)
        .map_or(AxisConvention::Free, |(_, c)| *c)
}

/// Axis remapping to apply when moving data from `source` to `target`, or
/// `None` when the target takes the data as it is.
///
/// Analyze targets depend on the affine and are handled by [`reorient`]
/// with [`analyze_target`].
pub fn remap(source: Format, target: Format) -> Option<Ornt> {
    match (convention(source), convention(target)) {
        (AxisConvention::ReversedSpatial, AxisConvention::ReversedSpatial) => None,
        (AxisConvention::ReversedSpatial, _) => Some([
            AxisMap::new(2, false),
            AxisMap::new(1, false),
            AxisMap::new(0, false),
        ]),
        _ => None,
    }
}

/// The `LAS` orientation Analyze readers assume.
pub fn analyze_target() -> Ornt {
    [
        AxisMap::new(0, true),
        AxisMap::new(1, false),
        AxisMap::new(2, false),
    ]
}
