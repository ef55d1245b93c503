//! Philips PAR/REC: a text `.PAR` header and raw `.REC` pixel data.
//!
//! The header has a general information block (`.  key : value` lines) and
//! one row per stored 2D image. Images are grouped into slices and volumes
//! from their slice number and acquisition labels; each image keeps its own
//! rescale slope and intercept, so the proxy scales per slice.

use crate::affine::{euler_rotation, matmul3, Affine};
use crate::compression;
use crate::datatype::{DataType, Endianness, MemoryOrder};
use crate::error::{Error, Result};
use crate::image::{Header, HeaderCodec, ImageContainer};
use crate::proxy::{ArrayProxy, DataSource, Scaling, SliceScaling};
use crate::registry;
use std::collections::BTreeSet;
use std::fmt;
use std::path::Path;

/// PAR file format revision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ParVersion {
    V4,
    V41,
    V42,
}

impl ParVersion {
    /// Whitespace separated values in one image row.
    pub const fn columns(self) -> usize {
        match self {
            Self::V4 => 41,
            Self::V41 => 48,
            Self::V42 => 49,
        }
    }

    fn from_columns(n: usize) -> Option<Self> {
        [Self::V4, Self::V41, Self::V42]
            .into_iter()
            .find(|v| v.columns() == n)
    }
}

impl fmt::Display for ParVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::V4 => "V4",
            Self::V41 => "V4.1",
            Self::V42 => "V4.2",
        })
    }
}

/// Slice orientation codes from the image rows.
const TRANSVERSE: i32 = 1;
const SAGITTAL: i32 = 2;
const CORONAL: i32 = 3;

/// Acquisition voxel axes to patient `P, S, L` axes.
fn acq_to_psl(orientation: i32) -> Result<[[f64; 3]; 3]> {
    Ok(match orientation {
        TRANSVERSE => [[0.0, 1.0, 0.0], [0.0, 0.0, 1.0], [1.0, 0.0, 0.0]],
        SAGITTAL => [[1.0, 0.0, 0.0], [0.0, -1.0, 0.0], [0.0, 0.0, -1.0]],
        CORONAL => [[0.0, 0.0, 1.0], [0.0, -1.0, 0.0], [1.0, 0.0, 0.0]],
        other => {
            return Err(Error::MalformedHeader(format!(
                "slice orientation {other} is not 1 (TRA), 2 (SAG) or 3 (COR)"
            )))
        }
    })
}

const PSL_TO_RAS: [[f64; 3]; 3] = [[0.0, 0.0, -1.0], [-1.0, 0.0, 0.0], [0.0, 1.0, 0.0]];

/// One row of the image information table.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ImageInfo {
    pub slice: usize,
    pub echo: i32,
    pub dynamic: i32,
    pub phase: i32,
    pub image_type: i32,
    pub sequence: i32,
    pub rec_index: usize,
    pub bits: u32,
    pub scan_percentage: f64,
    pub recon: [usize; 2],
    pub rescale_intercept: f64,
    pub rescale_slope: f64,
    pub scale_slope: f64,
    pub window_center: f64,
    pub window_width: f64,
    /// Degrees, `(ap, fh, rl)`.
    pub angulation: [f64; 3],
    /// Millimetres, `(ap, fh, rl)`.
    pub offcentre: [f64; 3],
    pub thickness: f64,
    pub gap: f64,
    pub display_orientation: i32,
    pub slice_orientation: i32,
    pub fmri_status: i32,
    pub ed_es: i32,
    pub pixel_spacing: [f64; 2],
    pub echo_time: f64,
    pub dyn_begin: f64,
    pub trigger_time: f64,
    pub b_factor: f64,
    pub averages: f64,
    pub flip_angle: f64,
    pub cardiac_frequency: f64,
    pub min_rr: f64,
    pub max_rr: f64,
    pub turbo_factor: f64,
    pub inversion_delay: f64,
    pub b_value_number: i32,
    pub gradient_number: i32,
    pub contrast_type: i32,
    pub anisotropy_type: i32,
    pub diffusion: [f64; 3],
    pub label_type: i32,
}

impl ImageInfo {
    fn parse(line: &str, version: ParVersion) -> Result<Self> {
        let values = line
            .split_whitespace()
            .map(|t| {
                t.parse::<f64>().map_err(|_| {
                    Error::MalformedHeader(format!("non-numeric value {t:?} in image row"))
                })
            })
            .collect::<Result<Vec<f64>>>()?;
        if values.len() != version.columns() {
            return Err(Error::MalformedHeader(format!(
                "{version} image rows have {} values, got {}",
                version.columns(),
                values.len()
            )));
        }
        let v = |i: usize| values.get(i).copied().unwrap_or(0.0);
        let int = |i: usize| v(i) as i32;
        let index = |i: usize| -> Result<usize> {
            let x = v(i);
            if x < 0.0 || x.fract() != 0.0 {
                return Err(Error::MalformedHeader(format!(
                    "image row column {} must be a non-negative integer, got {x}",
                    i + 1
                )));
            }
            Ok(x as usize)
        };
        Ok(Self {
            slice: index(0)?,
            echo: int(1),
            dynamic: int(2),
            phase: int(3),
            image_type: int(4),
            sequence: int(5),
            rec_index: index(6)?,
            bits: index(7)? as u32,
            scan_percentage: v(8),
            recon: [index(9)?, index(10)?],
            rescale_intercept: v(11),
            rescale_slope: v(12),
            scale_slope: v(13),
            window_center: v(14),
            window_width: v(15),
            angulation: [v(16), v(17), v(18)],
            offcentre: [v(19), v(20), v(21)],
            thickness: v(22),
            gap: v(23),
            display_orientation: int(24),
            slice_orientation: int(25),
            fmri_status: int(26),
            ed_es: int(27),
            pixel_spacing: [v(28), v(29)],
            echo_time: v(30),
            dyn_begin: v(31),
            trigger_time: v(32),
            b_factor: v(33),
            averages: v(34),
            flip_angle: v(35),
            cardiac_frequency: v(36),
            min_rr: v(37),
            max_rr: v(38),
            turbo_factor: v(39),
            inversion_delay: v(40),
            b_value_number: int(41),
            gradient_number: int(42),
            contrast_type: int(43),
            anisotropy_type: int(44),
            diffusion: [v(45), v(46), v(47)],
            label_type: int(48),
        })
    }

    /// Volume grouping key; the last field varies fastest.
    fn volume_key(&self) -> (i32, i32, i32, i64, i32, i32, i32) {
        (
            self.image_type,
            self.label_type,
            self.gradient_number,
            (self.b_factor * 1000.0).round() as i64,
            self.phase,
            self.echo,
            self.dynamic,
        )
    }
}

/// Parsed PAR header with the slice/volume layout of its images.
#[derive(Debug, Clone, PartialEq)]
pub struct ParRecHeader {
    pub version: ParVersion,
    /// General information entries in file order.
    pub general: Vec<(String, String)>,
    pub images: Vec<ImageInfo>,
    shape: Vec<usize>,
    /// Row of `images` for each output image, slice fastest.
    order: Vec<usize>,
}

impl ParRecHeader {
    /// Parse the text of a `.PAR` file.
    pub fn parse(text: &str) -> Result<Self> {
        let mut declared = None;
        let mut general = Vec::new();
        let mut rows = Vec::new();
        for line in text.lines() {
            let trimmed = line.trim();
            if trimmed.is_empty() {
                continue;
            }
            if let Some(comment) = trimmed.strip_prefix('#') {
                if let Some(pos) = comment.find("Research image export tool") {
                    declared = match comment[pos..].split_whitespace().last() {
                        Some("V4") => Some(ParVersion::V4),
                        Some("V4.1") => Some(ParVersion::V41),
                        Some("V4.2") => Some(ParVersion::V42),
                        other => {
                            return Err(Error::MalformedHeader(format!(
                                "unsupported PAR version {other:?}"
                            )))
                        }
                    };
                }
                continue;
            }
            if let Some(entry) = trimmed.strip_prefix('.') {
                let Some((key, value)) = entry.split_once(':') else {
                    return Err(Error::MalformedHeader(format!(
                        "general information line without ':': {trimmed:?}"
                    )));
                };
                general.push((key.trim().to_string(), value.trim().to_string()));
                continue;
            }
            rows.push(trimmed);
        }

        let Some(first) = rows.first() else {
            return Err(Error::MalformedHeader("PAR file lists no images".into()));
        };
        let version = match declared {
            Some(v) => v,
            None => {
                let columns = first.split_whitespace().count();
                let v = ParVersion::from_columns(columns).ok_or_else(|| {
                    Error::MalformedHeader(format!("no PAR version has {columns} image columns"))
                })?;
                log::debug!("no version line in PAR header; {columns} columns imply {v}");
                v
            }
        };
        let images = rows
            .iter()
            .map(|row| ImageInfo::parse(row, version))
            .collect::<Result<Vec<_>>>()?;
        let (shape, order) = layout(&images)?;
        let header = Self {
            version,
            general,
            images,
            shape,
            order,
        };
        header.validate()?;
        log::debug!(
            "parsed PAR {version} with {} images into {:?}",
            header.images.len(),
            header.shape
        );
        Ok(header)
    }

    /// First general information value whose key starts with `prefix`.
    pub fn general_value(&self, prefix: &str) -> Option<&str> {
        self.general
            .iter()
            .find(|(k, _)| k.starts_with(prefix))
            .map(|(_, v)| v.as_str())
    }

    fn general_floats(&self, prefix: &str) -> Option<Vec<f64>> {
        let values: Vec<f64> = self
            .general_value(prefix)?
            .split_whitespace()
            .filter_map(|t| t.parse().ok())
            .collect();
        (!values.is_empty()).then_some(values)
    }

    fn general_triplet(&self, prefix: &str) -> Option<[f64; 3]> {
        match self.general_floats(prefix)?[..] {
            [a, b, c, ..] => Some([a, b, c]),
            _ => None,
        }
    }

    pub fn shape(&self) -> Vec<usize> {
        self.shape.clone()
    }

    pub fn dtype(&self) -> DataType {
        match self.images.first().map_or(16, |i| i.bits) {
            8 => DataType::UInt8,
            32 => DataType::Int32,
            _ => DataType::Int16,
        }
    }

    fn first(&self) -> &ImageInfo {
        &self.images[self.order[0]]
    }

    /// Repetition time in milliseconds.
    pub fn repetition_time(&self) -> Option<f64> {
        self.general_floats("Repetition time").map(|v| v[0])
    }

    /// Pixel spacing, slice thickness plus gap, and TR in seconds for 4D.
    pub fn zooms(&self) -> Vec<f64> {
        let first = self.first();
        let mut zooms = vec![
            first.pixel_spacing[0],
            first.pixel_spacing[1],
            first.thickness + first.gap,
        ];
        if self.shape.len() > 3 {
            zooms.push(self.repetition_time().unwrap_or(0.0) / 1000.0);
        }
        zooms
    }

    /// Rows of `images` in output order (slice fastest, then volume).
    pub fn image_order(&self) -> &[usize] {
        &self.order
    }

    /// Whether the REC file already holds the images in output order.
    pub fn is_canonical(&self) -> bool {
        self.order
            .iter()
            .enumerate()
            .all(|(k, &row)| self.images[row].rec_index == k)
    }

    /// Rescale factors (`pixel * RS + RI`) per output image.
    pub fn scaling(&self) -> Scaling {
        let slopes: Vec<f64> = self.order.iter().map(|&r| self.images[r].rescale_slope).collect();
        let inters: Vec<f64> = self
            .order
            .iter()
            .map(|&r| self.images[r].rescale_intercept)
            .collect();
        let uniform = slopes.windows(2).all(|w| w[0] == w[1]) && inters.windows(2).all(|w| w[0] == w[1]);
        if uniform {
            return Scaling::from_slope_inter(slopes[0], inters[0]);
        }
        let axes = if self.shape.len() > 3 { vec![2, 3] } else { vec![2] };
        Scaling::PerSlice(SliceScaling { axes, slopes, inters })
    }

    /// Scanner RAS affine from angulation, off-centre and slice orientation.
    pub fn affine(&self) -> Result<Affine> {
        let first = self.first();
        let angulation = self
            .general_triplet("Angulation midslice")
            .unwrap_or(first.angulation)
            .map(f64::to_radians);
        let offcentre = self
            .general_triplet("Off Centre midslice")
            .unwrap_or(first.offcentre);
        let rot = euler_rotation(angulation[0], angulation[1], angulation[2]);
        let perm = acq_to_psl(first.slice_orientation)?;
        let zooms = self.zooms();
        let mut lin = matmul3(&rot, &perm);
        for row in &mut lin {
            for (v, z) in row.iter_mut().zip(&zooms) {
                *v *= z;
            }
        }
        // off-centre is the middle of the volume
        let centre = [0, 1, 2].map(|i| (self.shape[i] as f64 - 1.0) / 2.0);
        let translation = [0, 1, 2].map(|r| {
            offcentre[r] - (0..3).map(|c| lin[r][c] * centre[c]).sum::<f64>()
        });
        let psl = Affine::from_parts(lin, translation);
        Ok(Affine::from_parts(PSL_TO_RAS, [0.0; 3]).matmul(&psl))
    }

    pub fn validate(&self) -> Result<()> {
        let first = self.first();
        if ![8, 16, 32].contains(&first.bits) {
            return Err(Error::UnsupportedDatatype(format!(
                "PAR pixel size {} bits",
                first.bits
            )));
        }
        for image in &self.images {
            if image.bits != first.bits || image.recon != first.recon {
                return Err(Error::MalformedHeader(format!(
                    "image {} is {}x{} at {} bits, the first image is {}x{} at {} bits",
                    image.rec_index,
                    image.recon[0],
                    image.recon[1],
                    image.bits,
                    first.recon[0],
                    first.recon[1],
                    first.bits
                )));
            }
        }
        if self.shape.iter().any(|&n| n == 0) {
            return Err(Error::MalformedHeader(format!("empty PAR shape {:?}", self.shape)));
        }
        acq_to_psl(first.slice_orientation).map(|_| ())
    }
}

/// Output shape and the image row for each `(slice, volume)` position.
fn layout(images: &[ImageInfo]) -> Result<(Vec<usize>, Vec<usize>)> {
    let slices: BTreeSet<usize> = images.iter().map(|i| i.slice).collect();
    let keys: BTreeSet<_> = images.iter().map(ImageInfo::volume_key).collect();
    let slices: Vec<usize> = slices.into_iter().collect();
    let keys: Vec<_> = keys.into_iter().collect();
    let (nslices, nvols) = (slices.len(), keys.len());

    let mut order = vec![None; nslices * nvols];
    for (row, image) in images.iter().enumerate() {
        let s = slices.binary_search(&image.slice).unwrap_or(0);
        let v = keys.binary_search(&image.volume_key()).unwrap_or(0);
        let slot = &mut order[s + nslices * v];
        if slot.is_some() {
            return Err(Error::MalformedHeader(format!(
                "slice {} of volume {v} is listed twice",
                image.slice
            )));
        }
        *slot = Some(row);
    }
    let order = order
        .into_iter()
        .enumerate()
        .map(|(k, row)| {
            row.ok_or_else(|| {
                Error::MalformedHeader(format!(
                    "slice {} of volume {} is missing",
                    slices[k % nslices],
                    k / nslices
                ))
            })
        })
        .collect::<Result<Vec<usize>>>()?;

    let recon = images[0].recon;
    let mut shape = vec![recon[0], recon[1], nslices];
    if nvols > 1 {
        shape.push(nvols);
    }
    Ok((shape, order))
}

impl HeaderCodec for ParRecHeader {
    fn decode(bytes: &[u8]) -> Result<Self> {
        Self::parse(&String::from_utf8_lossy(bytes))
    }

    fn encode(&self) -> Result<Vec<u8>> {
        Err(Error::IncompatibleConversion("PAR/REC is read-only".into()))
    }

    fn validate(&self) -> Result<()> {
        ParRecHeader::validate(self)
    }

    fn default_affine(&self) -> Affine {
        self.affine().unwrap_or_else(|_| Affine::identity())
    }
}

fn pair(path: &Path) -> Result<(std::path::PathBuf, std::path::PathBuf)> {
    registry::resolve_pair(path)?.ok_or_else(|| {
        Error::Configuration(format!("PAR/REC needs a .PAR or .REC name, got {}", path.display()))
    })
}

pub fn load_header(path: &Path) -> Result<ParRecHeader> {
    let (par, _) = pair(path)?;
    ParRecHeader::decode(&compression::read_decompressed(&par)?)
}

/// Load a PAR/REC pair given either file.
///
/// A REC file whose images are already in slice-then-volume order is
/// mapped directly; otherwise it is read once and reordered in memory.
pub fn load(path: &Path) -> Result<ImageContainer> {
    let (_, rec) = pair(path)?;
    let header = load_header(path)?;
    let shape = header.shape();
    let dtype = header.dtype();
    let image_bytes = shape[0] * shape[1] * dtype.byte_size();

    let source = if header.is_canonical() {
        DataSource::open(&rec)?
    } else {
        log::debug!("REC images are out of order; reordering {} images", header.images.len());
        let raw = compression::read_decompressed(&rec)?;
        let mut bytes = Vec::with_capacity(image_bytes * header.image_order().len());
        for &row in header.image_order() {
            let start = header.images[row].rec_index * image_bytes;
            let chunk = raw.get(start..start + image_bytes).ok_or_else(|| {
                Error::CorruptStream(format!(
                    "{} ends before image {}",
                    rec.display(),
                    header.images[row].rec_index
                ))
            })?;
            bytes.extend_from_slice(chunk);
        }
        DataSource::from_bytes(bytes)
    };

    let proxy = ArrayProxy::new(
        source,
        shape,
        dtype,
        0,
        MemoryOrder::Fortran,
        Endianness::Little,
        header.scaling(),
    )?;
    let affine = header.affine()?;
    ImageContainer::from_parts(
        Header::ParRec(header),
        affine,
        proxy,
        Vec::new(),
        Vec::new(),
        Some(path.to_path_buf()),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    const PREAMBLE: &str = "\
# === DATA DESCRIPTION FILE ======================================================
#
# CLINICAL TRYOUT             Research image export tool     V4.2
#
# === GENERAL INFORMATION ========================================================
.    Max. number of slices/locations    :   2
.    Max. number of dynamics            :   2
.    Repetition time [ms]               :   2000.000
.    Angulation midslice(ap,fh,rl)[degr]:   0.000  0.000  0.000
.    Off Centre midslice(ap,fh,rl) [mm] :   10.000  -5.000  2.000
# === IMAGE INFORMATION ==========================================================
";

    fn row(slice: usize, dynamic: i32, rec_index: usize, slope: f64) -> String {
        let mut v = vec!["0".to_string(); 49];
        v[0] = slice.to_string();
        v[1] = "1".into();
        v[2] = dynamic.to_string();
        v[3] = "1".into();
        v[6] = rec_index.to_string();
        v[7] = "16".into();
        v[9] = "4".into();
        v[10] = "3".into();
        v[12] = slope.to_string();
        v[22] = "3.0".into();
        v[23] = "0.5".into();
        v[25] = "1".into();
        v[28] = "2.0".into();
        v[29] = "2.5".into();
        v.join(" ")
    }

    fn par(rows: &[String]) -> String {
        format!("{PREAMBLE}{}\n# === END OF DATA DESCRIPTION FILE\n", rows.join("\n"))
    }

    #[test]
    fn layout_groups_slices_and_dynamics() {
        let text = par(&[row(1, 1, 0, 1.0), row(2, 1, 1, 1.0), row(1, 2, 2, 1.0), row(2, 2, 3, 1.0)]);
        let h = ParRecHeader::parse(&text).unwrap();
        assert_eq!(h.version, ParVersion::V42);
        assert_eq!(h.shape(), vec![4, 3, 2, 2]);
        assert!(h.is_canonical());
        assert_eq!(h.zooms(), vec![2.0, 2.5, 3.5, 2.0]);
        assert_eq!(h.dtype(), DataType::Int16);
        assert_eq!(h.scaling(), Scaling::None);
    }

    #[test]
    fn interleaved_rec_is_not_canonical() {
        let text = par(&[row(1, 1, 0, 1.0), row(1, 2, 1, 1.0), row(2, 1, 2, 1.0), row(2, 2, 3, 1.0)]);
        let h = ParRecHeader::parse(&text).unwrap();
        assert!(!h.is_canonical());
        assert_eq!(h.image_order(), &[0, 2, 1, 3]);
    }

    #[test]
    fn per_slice_rescale() {
        let text = par(&[row(1, 1, 0, 1.0), row(2, 1, 1, 2.0)]);
        let h = ParRecHeader::parse(&text).unwrap();
        assert_eq!(h.shape(), vec![4, 3, 2]);
        let Scaling::PerSlice(s) = h.scaling() else {
            panic!("expected per-slice scaling");
        };
        assert_eq!(s.axes, vec![2]);
        assert_eq!(s.slopes, vec![1.0, 2.0]);
    }

    #[test]
    fn missing_slice_is_malformed() {
        let text = par(&[row(1, 1, 0, 1.0), row(2, 1, 1, 1.0), row(1, 2, 2, 1.0)]);
        assert!(matches!(ParRecHeader::parse(&text), Err(Error::MalformedHeader(_))));
    }

    #[test]
    fn wrong_column_count_is_malformed() {
        let mut text = par(&[row(1, 1, 0, 1.0)]);
        text = text.replacen(" 0 0 0 0 0 0 0 0 0 0 0 0 0 0 0 0 0 0 0", "", 1);
        assert!(matches!(ParRecHeader::parse(&text), Err(Error::MalformedHeader(_))));
    }

    #[test]
    fn transverse_affine_maps_centre_to_offcentre() {
        let text = par(&[row(1, 1, 0, 1.0), row(2, 1, 1, 1.0)]);
        let h = ParRecHeader::parse(&text).unwrap();
        let affine = h.affine().unwrap();
        // centre voxel lands on the off-centre, expressed in RAS
        let centre = affine.apply([1.5, 1.0, 0.5]);
        let expected = [-2.0, -10.0, -5.0];
        for (a, b) in centre.iter().zip(expected) {
            assert!((a - b).abs() < 1e-9, "{centre:?}");
        }
        // transverse slices stack along S
        assert_eq!(affine.column(2), [0.0, 0.0, 3.5]);
        assert_eq!(affine.zooms(), [2.0, 2.5, 3.5]);
    }

    #[test]
    fn load_reorders_interleaved_rec() {
        let dir = tempfile::tempdir().unwrap();
        let text = par(&[row(1, 1, 0, 1.0), row(1, 2, 1, 1.0), row(2, 1, 2, 1.0), row(2, 2, 3, 1.0)]);
        std::fs::write(dir.path().join("scan.PAR"), text).unwrap();
        let mut rec = Vec::new();
        for image in 0..4i16 {
            for _ in 0..12 {
                rec.extend_from_slice(&(image * 10).to_le_bytes());
            }
        }
        std::fs::write(dir.path().join("scan.REC"), rec).unwrap();

        let img = load(&dir.path().join("scan.PAR")).unwrap();
        assert_eq!(img.shape(), &[4, 3, 2, 2]);
        let data = img.get_fdata().unwrap();
        // REC image 1 is slice 1 of dynamic 2
        assert_eq!(data[[0, 0, 0, 1]], 10.0);
        assert_eq!(data[[0, 0, 1, 0]], 20.0);
        assert_eq!(data[[3, 2, 1, 1]], 30.0);
    }
}
