//! `NIfTI` header parsing and representation.
//!
//! Supports both NIfTI-1 (348-byte header) and NIfTI-2 (540-byte header) formats
//! with automatic version detection and endianness handling.

use crate::affine::{affine_to_quaternion, quaternion_to_affine, Affine, Quaternion};
use crate::datatype::{DataType, Endianness};
use crate::error::{Error, Result};
use crate::image::{Diagnostic, DiagnosticKind, HeaderCodec};
use byteorder::{BigEndian, ByteOrder, LittleEndian};

/// NIfTI format version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum NiftiVersion {
    /// NIfTI-1 format (348-byte header, 16-bit dimensions)
    #[default]
    Nifti1,
    /// NIfTI-2 format (540-byte header, 64-bit dimensions)
    Nifti2,
}

impl NiftiVersion {
    /// Header size in bytes for this version.
    pub const fn header_size(self) -> usize {
        match self {
            Self::Nifti1 => 348,
            Self::Nifti2 => 540,
        }
    }

    /// Default vox_offset for this version (header size + empty extender).
    pub const fn default_vox_offset(self) -> i64 {
        match self {
            Self::Nifti1 => 352,
            Self::Nifti2 => 544,
        }
    }
}

/// NIfTI-1 header field byte offsets.
mod offsets_v1 {
    pub const SIZEOF_HDR: usize = 0;
    pub const REGULAR: usize = 38;
    pub const DIM_INFO: usize = 39;
    pub const DIM: usize = 40;
    pub const INTENT_P1: usize = 56;
    pub const INTENT_CODE: usize = 68;
    pub const DATATYPE: usize = 70;
    pub const BITPIX: usize = 72;
    pub const SLICE_START: usize = 74;
    pub const PIXDIM: usize = 76;
    pub const VOX_OFFSET: usize = 108;
    pub const SCL_SLOPE: usize = 112;
    pub const SCL_INTER: usize = 116;
    pub const SLICE_END: usize = 120;
    pub const SLICE_CODE: usize = 122;
    pub const XYZT_UNITS: usize = 123;
    pub const CAL_MAX: usize = 124;
    pub const CAL_MIN: usize = 128;
    pub const SLICE_DURATION: usize = 132;
    pub const TOFFSET: usize = 136;
    pub const GLMAX: usize = 140;
    pub const GLMIN: usize = 144;
    pub const DESCRIP: usize = 148;
    pub const AUX_FILE: usize = 228;
    pub const QFORM_CODE: usize = 252;
    pub const SFORM_CODE: usize = 254;
    pub const QUATERN_B: usize = 256;
    pub const QOFFSET_X: usize = 268;
    pub const SROW_X: usize = 280;
    pub const INTENT_NAME: usize = 328;
    pub const MAGIC: usize = 344;
}

/// NIfTI-2 header field byte offsets.
mod offsets_v2 {
    pub const SIZEOF_HDR: usize = 0;
    pub const MAGIC: usize = 4;
    pub const DATATYPE: usize = 12;
    pub const BITPIX: usize = 14;
    pub const DIM: usize = 16;
    pub const INTENT_P1: usize = 80;
    pub const PIXDIM: usize = 104;
    pub const VOX_OFFSET: usize = 168;
    pub const SCL_SLOPE: usize = 176;
    pub const SCL_INTER: usize = 184;
    pub const CAL_MAX: usize = 192;
    pub const CAL_MIN: usize = 200;
    pub const SLICE_DURATION: usize = 208;
    pub const TOFFSET: usize = 216;
    pub const SLICE_START: usize = 224;
    pub const SLICE_END: usize = 232;
    pub const DESCRIP: usize = 240;
    pub const AUX_FILE: usize = 320;
    pub const QFORM_CODE: usize = 344;
    pub const SFORM_CODE: usize = 348;
    pub const QUATERN_B: usize = 352;
    pub const QOFFSET_X: usize = 376;
    pub const SROW_X: usize = 400;
    pub const SLICE_CODE: usize = 496;
    pub const XYZT_UNITS: usize = 500;
    pub const INTENT_CODE: usize = 504;
    pub const INTENT_NAME: usize = 508;
    pub const DIM_INFO: usize = 524;
}

const MAGIC_V1_SINGLE: &[u8; 4] = b"n+1\0";
const MAGIC_V1_PAIR: &[u8; 4] = b"ni1\0";
const MAGIC_V2_SINGLE: &[u8; 8] = b"n+2\0\r\n\x1a\n";
const MAGIC_V2_PAIR: &[u8; 8] = b"ni2\0\r\n\x1a\n";

/// Largest geometry code (`NIFTI_XFORM_TEMPLATE_OTHER`).
pub const MAX_XFORM_CODE: i32 = 4;
/// `NIFTI_XFORM_SCANNER_ANAT`
pub const XFORM_SCANNER_ANAT: i32 = 1;
/// `NIFTI_XFORM_ALIGNED_ANAT`
pub const XFORM_ALIGNED_ANAT: i32 = 2;

/// Tolerance when comparing sform and qform affines.
const GEOMETRY_TOLERANCE: f64 = 1e-3;

/// Spatial units for voxel dimensions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SpatialUnits {
    #[default]
    /// Units are not specified.
    Unknown,
    /// Voxel dimensions expressed in meters.
    Meter,
    /// Voxel dimensions expressed in millimeters.
    Millimeter,
    /// Voxel dimensions expressed in micrometers.
    Micrometer,
}

impl SpatialUnits {
    fn from_code(code: u8) -> Self {
        match code & 0x07 {
            1 => Self::Meter,
            2 => Self::Millimeter,
            3 => Self::Micrometer,
            _ => Self::Unknown,
        }
    }

    fn to_code(self) -> u8 {
        match self {
            Self::Unknown => 0,
            Self::Meter => 1,
            Self::Millimeter => 2,
            Self::Micrometer => 3,
        }
    }
}

/// Temporal units for time dimensions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TemporalUnits {
    #[default]
    /// Temporal spacing unspecified.
    Unknown,
    /// Temporal spacing in seconds.
    Second,
    /// Temporal spacing in milliseconds.
    Millisecond,
    /// Temporal spacing in microseconds.
    Microsecond,
    /// Hertz.
    Hertz,
    /// Parts per million.
    Ppm,
    /// Radians per second.
    RadPerSec,
}

impl TemporalUnits {
    fn from_code(code: u8) -> Self {
        match code & 0x38 {
            0x08 => Self::Second,
            0x10 => Self::Millisecond,
            0x18 => Self::Microsecond,
            0x20 => Self::Hertz,
            0x28 => Self::Ppm,
            0x30 => Self::RadPerSec,
            _ => Self::Unknown,
        }
    }

    fn to_code(self) -> u8 {
        match self {
            Self::Unknown => 0,
            Self::Second => 0x08,
            Self::Millisecond => 0x10,
            Self::Microsecond => 0x18,
            Self::Hertz => 0x20,
            Self::Ppm => 0x28,
            Self::RadPerSec => 0x30,
        }
    }
}

/// Read a NUL-padded fixed-width text field.
pub(crate) fn read_str(bytes: &[u8]) -> String {
    let end = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
    String::from_utf8_lossy(&bytes[..end]).into_owned()
}

/// Write `s` into a fixed-width field, truncated to leave a NUL terminator.
pub(crate) fn write_str(buf: &mut [u8], s: &str) {
    let bytes = s.as_bytes();
    let len = bytes.len().min(buf.len().saturating_sub(1));
    buf[..len].copy_from_slice(&bytes[..len]);
}

/// Unified NIfTI header supporting both NIfTI-1 and NIfTI-2 formats.
///
/// Internally uses 64-bit dimensions and f64 precision to accommodate NIfTI-2.
/// When writing NIfTI-1, values are downcast (with validation that they fit).
#[derive(Debug, Clone, PartialEq)]
pub struct NiftiHeader {
    /// NIfTI format version.
    pub version: NiftiVersion,
    /// Header and data in separate `.hdr`/`.img` files (`ni1`/`ni2` magic).
    pub pair: bool,
    /// Number of dimensions (1-7).
    pub ndim: u8,
    /// Size along each dimension (64-bit for NIfTI-2 compatibility).
    pub dim: [i64; 7],
    /// Frequency, phase and slice encoding axes packed in two bits each.
    pub dim_info: u8,
    /// Intent parameters.
    pub intent_p: [f64; 3],
    /// Intent code (i32 for NIfTI-2).
    pub intent_code: i32,
    /// Intent name.
    pub intent_name: String,
    /// Data type.
    pub datatype: DataType,
    /// Voxel sizes (pixdim[1..=ndim]) and qfac at index 0 (f64 for NIfTI-2).
    pub pixdim: [f64; 8],
    /// Data offset in file (i64 for NIfTI-2).
    pub vox_offset: i64,
    /// Data scaling slope (f64 for NIfTI-2).
    pub scl_slope: f64,
    /// Data scaling intercept (f64 for NIfTI-2).
    pub scl_inter: f64,
    /// First slice index of the acquisition pattern.
    pub slice_start: i64,
    /// Last slice index of the acquisition pattern.
    pub slice_end: i64,
    /// Slice timing order.
    pub slice_code: u8,
    /// Spatial units.
    pub spatial_units: SpatialUnits,
    /// Temporal units.
    pub temporal_units: TemporalUnits,
    /// Display range maximum.
    pub cal_max: f64,
    /// Display range minimum.
    pub cal_min: f64,
    /// Time to acquire one slice.
    pub slice_duration: f64,
    /// Time axis shift.
    pub toffset: f64,
    /// Legacy global maximum (NIfTI-1 only).
    pub glmax: i32,
    /// Legacy global minimum (NIfTI-1 only).
    pub glmin: i32,
    /// Description string.
    pub descrip: String,
    /// Auxiliary filename.
    pub aux_file: String,
    /// qform transform code (i32 for NIfTI-2).
    pub qform_code: i32,
    /// sform transform code (i32 for NIfTI-2).
    pub sform_code: i32,
    /// Quaternion parameters for qform (f64 for NIfTI-2).
    pub quatern: [f64; 3],
    /// Offset parameters for qform (f64 for NIfTI-2).
    pub qoffset: [f64; 3],
    /// First row of the sform affine matrix (f64 for NIfTI-2).
    pub srow_x: [f64; 4],
    /// Second row of the sform affine matrix (f64 for NIfTI-2).
    pub srow_y: [f64; 4],
    /// Third row of the sform affine matrix (f64 for NIfTI-2).
    pub srow_z: [f64; 4],
    /// Byte order of the header and the voxel data.
    pub endianness: Endianness,
}

impl Default for NiftiHeader {
    fn default() -> Self {
        Self {
            version: NiftiVersion::Nifti1,
            pair: false,
            ndim: 3,
            dim: [1, 1, 1, 1, 1, 1, 1],
            dim_info: 0,
            intent_p: [0.0; 3],
            intent_code: 0,
            intent_name: String::new(),
            datatype: DataType::Float32,
            pixdim: [1.0, 1.0, 1.0, 1.0, 0.0, 0.0, 0.0, 0.0],
            vox_offset: 352,
            scl_slope: 1.0,
            scl_inter: 0.0,
            slice_start: 0,
            slice_end: 0,
            slice_code: 0,
            spatial_units: SpatialUnits::Millimeter,
            temporal_units: TemporalUnits::Unknown,
            cal_max: 0.0,
            cal_min: 0.0,
            slice_duration: 0.0,
            toffset: 0.0,
            glmax: 0,
            glmin: 0,
            descrip: String::new(),
            aux_file: String::new(),
            qform_code: 0,
            sform_code: 0,
            quatern: [0.0; 3],
            qoffset: [0.0; 3],
            srow_x: [0.0; 4],
            srow_y: [0.0; 4],
            srow_z: [0.0; 4],
            endianness: Endianness::native(),
        }
    }
}

impl NiftiHeader {
    /// Size of NIfTI-1 header in bytes.
    pub const SIZE: usize = 348;

    /// Size of NIfTI-2 header in bytes.
    pub const SIZE_V2: usize = 540;

    /// Minimal valid header for an array of `shape` and `dtype`.
    pub fn for_shape(shape: &[usize], dtype: DataType) -> Result<Self> {
        let mut header = Self {
            datatype: dtype,
            ..Self::default()
        };
        header.set_shape(shape)?;
        if header.requires_nifti2() {
            header.version = NiftiVersion::Nifti2;
            header.vox_offset = NiftiVersion::Nifti2.default_vox_offset();
        }
        Ok(header)
    }

    /// Returns the header size for this header's version.
    pub fn header_size(&self) -> usize {
        self.version.header_size()
    }

    /// Detect version and byte order from `sizeof_hdr`, native order first.
    pub fn sniff(bytes: &[u8]) -> Option<(NiftiVersion, Endianness)> {
        let head = bytes.get(0..4)?;
        for endianness in Endianness::probe_order() {
            let size = match endianness {
                Endianness::Little => LittleEndian::read_i32(head),
                Endianness::Big => BigEndian::read_i32(head),
            };
            let version = match size {
                348 => NiftiVersion::Nifti1,
                540 => NiftiVersion::Nifti2,
                _ => continue,
            };
            let magic_ok = match version {
                NiftiVersion::Nifti1 => bytes
                    .get(offsets_v1::MAGIC..offsets_v1::MAGIC + 4)
                    .is_some_and(|m| m == MAGIC_V1_SINGLE || m == MAGIC_V1_PAIR),
                NiftiVersion::Nifti2 => bytes
                    .get(offsets_v2::MAGIC..offsets_v2::MAGIC + 8)
                    .is_some_and(|m| m == MAGIC_V2_SINGLE || m == MAGIC_V2_PAIR),
            };
            if magic_ok {
                return Some((version, endianness));
            }
        }
        None
    }

    /// Read header from bytes with automatic version and endianness detection.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < 4 {
            return Err(Error::MalformedHeader(
                "header too short to detect version".into(),
            ));
        }
        let Some((version, endianness)) = Self::sniff(bytes) else {
            return Err(Error::MalformedHeader(format!(
                "invalid NIfTI magic or sizeof_hdr {:02x?}",
                &bytes[..4]
            )));
        };

        let required_size = version.header_size();
        if bytes.len() < required_size {
            return Err(Error::MalformedHeader(format!(
                "header too short: got {} bytes, need {} for {:?}",
                bytes.len(),
                required_size,
                version
            )));
        }

        let header = match (version, endianness) {
            (NiftiVersion::Nifti1, Endianness::Little) => Self::parse_v1::<LittleEndian>(bytes)?,
            (NiftiVersion::Nifti1, Endianness::Big) => Self::parse_v1::<BigEndian>(bytes)?,
            (NiftiVersion::Nifti2, Endianness::Little) => Self::parse_v2::<LittleEndian>(bytes)?,
            (NiftiVersion::Nifti2, Endianness::Big) => Self::parse_v2::<BigEndian>(bytes)?,
        };
        let header = Self {
            endianness,
            ..header
        };
        header.validate()?;
        Ok(header)
    }

    /// Parse NIfTI-1 header.
    #[allow(clippy::wildcard_imports)]
    fn parse_v1<E: ByteOrder>(bytes: &[u8]) -> Result<Self> {
        use offsets_v1::*;

        let f32_at = |off: usize| E::read_f32(&bytes[off..off + 4]) as f64;
        let i16_at = |off: usize| E::read_i16(&bytes[off..off + 2]);

        let ndim_raw = i16_at(DIM);
        if !(1..=7).contains(&ndim_raw) {
            return Err(Error::MalformedHeader(format!(
                "ndim must be 1..=7, got {ndim_raw}"
            )));
        }

        let mut dim = [1i64; 7];
        for (i, dim_val) in dim.iter_mut().enumerate() {
            *dim_val = i16_at(DIM + 2 + i * 2) as i64;
        }

        let datatype = DataType::from_code(i16_at(DATATYPE) as i32)?;
        check_bitpix(i16_at(BITPIX), datatype)?;

        let mut pixdim = [0.0f64; 8];
        for (i, pix_val) in pixdim.iter_mut().enumerate() {
            *pix_val = f32_at(PIXDIM + i * 4);
        }

        let vox_offset_raw = E::read_f32(&bytes[VOX_OFFSET..VOX_OFFSET + 4]);
        if !vox_offset_raw.is_finite() || vox_offset_raw.fract() != 0.0 {
            return Err(Error::MalformedHeader(format!(
                "vox_offset must be a finite integer, got {vox_offset_raw}"
            )));
        }

        let xyzt_units = bytes[XYZT_UNITS];
        let srow = |base: usize| [0, 1, 2, 3].map(|k| f32_at(base + k * 4));

        Ok(Self {
            version: NiftiVersion::Nifti1,
            pair: &bytes[MAGIC..MAGIC + 4] == MAGIC_V1_PAIR,
            ndim: ndim_raw as u8,
            dim,
            dim_info: bytes[DIM_INFO],
            intent_p: [0, 1, 2].map(|k| f32_at(INTENT_P1 + k * 4)),
            intent_code: i16_at(INTENT_CODE) as i32,
            intent_name: read_str(&bytes[INTENT_NAME..INTENT_NAME + 16]),
            datatype,
            pixdim,
            vox_offset: vox_offset_raw as i64,
            scl_slope: f32_at(SCL_SLOPE),
            scl_inter: f32_at(SCL_INTER),
            slice_start: i16_at(SLICE_START) as i64,
            slice_end: i16_at(SLICE_END) as i64,
            slice_code: bytes[SLICE_CODE],
            spatial_units: SpatialUnits::from_code(xyzt_units),
            temporal_units: TemporalUnits::from_code(xyzt_units),
            cal_max: f32_at(CAL_MAX),
            cal_min: f32_at(CAL_MIN),
            slice_duration: f32_at(SLICE_DURATION),
            toffset: f32_at(TOFFSET),
            glmax: E::read_i32(&bytes[GLMAX..GLMAX + 4]),
            glmin: E::read_i32(&bytes[GLMIN..GLMIN + 4]),
            descrip: read_str(&bytes[DESCRIP..DESCRIP + 80]),
            aux_file: read_str(&bytes[AUX_FILE..AUX_FILE + 24]),
            qform_code: i16_at(QFORM_CODE) as i32,
            sform_code: i16_at(SFORM_CODE) as i32,
            quatern: [0, 1, 2].map(|k| f32_at(QUATERN_B + k * 4)),
            qoffset: [0, 1, 2].map(|k| f32_at(QOFFSET_X + k * 4)),
            srow_x: srow(SROW_X),
            srow_y: srow(SROW_X + 16),
            srow_z: srow(SROW_X + 32),
            endianness: Endianness::native(),
        })
    }

    /// Parse NIfTI-2 header.
    #[allow(clippy::wildcard_imports)]
    fn parse_v2<E: ByteOrder>(bytes: &[u8]) -> Result<Self> {
        use offsets_v2::*;

        let f64_at = |off: usize| E::read_f64(&bytes[off..off + 8]);
        let i64_at = |off: usize| E::read_i64(&bytes[off..off + 8]);
        let i32_at = |off: usize| E::read_i32(&bytes[off..off + 4]);

        // dim[0] is ndim, stored as i64 at offset 16
        let ndim_raw = i64_at(DIM);
        if !(1..=7).contains(&ndim_raw) {
            return Err(Error::MalformedHeader(format!(
                "ndim must be 1..=7, got {ndim_raw}"
            )));
        }

        let mut dim = [1i64; 7];
        for (i, dim_val) in dim.iter_mut().enumerate() {
            *dim_val = i64_at(DIM + 8 + i * 8);
        }

        let datatype = DataType::from_code(E::read_i16(&bytes[DATATYPE..DATATYPE + 2]) as i32)?;
        check_bitpix(E::read_i16(&bytes[BITPIX..BITPIX + 2]), datatype)?;

        let mut pixdim = [0.0f64; 8];
        for (i, pix_val) in pixdim.iter_mut().enumerate() {
            *pix_val = f64_at(PIXDIM + i * 8);
        }

        let xyzt_units = i32_at(XYZT_UNITS) as u8;
        let srow = |base: usize| [0, 1, 2, 3].map(|k| f64_at(base + k * 8));

        Ok(Self {
            version: NiftiVersion::Nifti2,
            pair: &bytes[MAGIC..MAGIC + 8] == MAGIC_V2_PAIR,
            ndim: ndim_raw as u8,
            dim,
            dim_info: bytes[DIM_INFO],
            intent_p: [0, 1, 2].map(|k| f64_at(INTENT_P1 + k * 8)),
            intent_code: i32_at(INTENT_CODE),
            intent_name: read_str(&bytes[INTENT_NAME..INTENT_NAME + 16]),
            datatype,
            pixdim,
            vox_offset: i64_at(VOX_OFFSET),
            scl_slope: f64_at(SCL_SLOPE),
            scl_inter: f64_at(SCL_INTER),
            slice_start: i64_at(SLICE_START),
            slice_end: i64_at(SLICE_END),
            slice_code: i32_at(SLICE_CODE) as u8,
            spatial_units: SpatialUnits::from_code(xyzt_units),
            temporal_units: TemporalUnits::from_code(xyzt_units),
            cal_max: f64_at(CAL_MAX),
            cal_min: f64_at(CAL_MIN),
            slice_duration: f64_at(SLICE_DURATION),
            toffset: f64_at(TOFFSET),
            glmax: 0,
            glmin: 0,
            descrip: read_str(&bytes[DESCRIP..DESCRIP + 80]),
            aux_file: read_str(&bytes[AUX_FILE..AUX_FILE + 24]),
            qform_code: i32_at(QFORM_CODE),
            sform_code: i32_at(SFORM_CODE),
            quatern: [0, 1, 2].map(|k| f64_at(QUATERN_B + k * 8)),
            qoffset: [0, 1, 2].map(|k| f64_at(QOFFSET_X + k * 8)),
            srow_x: srow(SROW_X),
            srow_y: srow(SROW_X + 32),
            srow_z: srow(SROW_X + 64),
            endianness: Endianness::native(),
        })
    }

    /// Write header to bytes in the header's own byte order.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        self.validate()?;
        Ok(match (self.version, self.endianness) {
            (NiftiVersion::Nifti1, Endianness::Little) => self.to_bytes_v1::<LittleEndian>(),
            (NiftiVersion::Nifti1, Endianness::Big) => self.to_bytes_v1::<BigEndian>(),
            (NiftiVersion::Nifti2, Endianness::Little) => self.to_bytes_v2::<LittleEndian>(),
            (NiftiVersion::Nifti2, Endianness::Big) => self.to_bytes_v2::<BigEndian>(),
        })
    }

    /// Write NIfTI-1 format header.
    #[allow(clippy::wildcard_imports)]
    fn to_bytes_v1<E: ByteOrder>(&self) -> Vec<u8> {
        use offsets_v1::*;

        let mut buf = vec![0u8; Self::SIZE];
        let put_f32 = |buf: &mut [u8], off: usize, v: f64| E::write_f32(&mut buf[off..off + 4], v as f32);

        E::write_i32(&mut buf[SIZEOF_HDR..SIZEOF_HDR + 4], 348);
        buf[REGULAR] = b'r';
        buf[DIM_INFO] = self.dim_info;

        // dim; validate() guarantees the values fit in i16
        E::write_i16(&mut buf[DIM..DIM + 2], self.ndim as i16);
        for i in 0..7 {
            let offset = DIM + 2 + i * 2;
            E::write_i16(&mut buf[offset..offset + 2], self.dim[i] as i16);
        }

        for k in 0..3 {
            put_f32(&mut buf, INTENT_P1 + k * 4, self.intent_p[k]);
        }
        E::write_i16(&mut buf[INTENT_CODE..INTENT_CODE + 2], self.intent_code as i16);
        E::write_i16(&mut buf[DATATYPE..DATATYPE + 2], self.datatype.code() as i16);
        E::write_i16(&mut buf[BITPIX..BITPIX + 2], self.datatype.bitpix());
        E::write_i16(&mut buf[SLICE_START..SLICE_START + 2], self.slice_start as i16);

        for (i, &value) in self.pixdim.iter().enumerate() {
            put_f32(&mut buf, PIXDIM + i * 4, value);
        }

        put_f32(&mut buf, VOX_OFFSET, self.vox_offset as f64);
        put_f32(&mut buf, SCL_SLOPE, self.scl_slope);
        put_f32(&mut buf, SCL_INTER, self.scl_inter);
        E::write_i16(&mut buf[SLICE_END..SLICE_END + 2], self.slice_end as i16);
        buf[SLICE_CODE] = self.slice_code;
        buf[XYZT_UNITS] = self.spatial_units.to_code() | self.temporal_units.to_code();
        put_f32(&mut buf, CAL_MAX, self.cal_max);
        put_f32(&mut buf, CAL_MIN, self.cal_min);
        put_f32(&mut buf, SLICE_DURATION, self.slice_duration);
        put_f32(&mut buf, TOFFSET, self.toffset);
        E::write_i32(&mut buf[GLMAX..GLMAX + 4], self.glmax);
        E::write_i32(&mut buf[GLMIN..GLMIN + 4], self.glmin);

        write_str(&mut buf[DESCRIP..DESCRIP + 80], &self.descrip);
        write_str(&mut buf[AUX_FILE..AUX_FILE + 24], &self.aux_file);

        E::write_i16(&mut buf[QFORM_CODE..QFORM_CODE + 2], self.qform_code as i16);
        E::write_i16(&mut buf[SFORM_CODE..SFORM_CODE + 2], self.sform_code as i16);
        for k in 0..3 {
            put_f32(&mut buf, QUATERN_B + k * 4, self.quatern[k]);
            put_f32(&mut buf, QOFFSET_X + k * 4, self.qoffset[k]);
        }
        for (r, row) in [self.srow_x, self.srow_y, self.srow_z].iter().enumerate() {
            for (c, &v) in row.iter().enumerate() {
                put_f32(&mut buf, SROW_X + r * 16 + c * 4, v);
            }
        }
        write_str(&mut buf[INTENT_NAME..INTENT_NAME + 16], &self.intent_name);

        let magic = if self.pair { MAGIC_V1_PAIR } else { MAGIC_V1_SINGLE };
        buf[MAGIC..MAGIC + 4].copy_from_slice(magic);

        buf
    }

    /// Write NIfTI-2 format header.
    #[allow(clippy::wildcard_imports)]
    fn to_bytes_v2<E: ByteOrder>(&self) -> Vec<u8> {
        use offsets_v2::*;

        let mut buf = vec![0u8; Self::SIZE_V2];
        let put_f64 = |buf: &mut [u8], off: usize, v: f64| E::write_f64(&mut buf[off..off + 8], v);
        let put_i64 = |buf: &mut [u8], off: usize, v: i64| E::write_i64(&mut buf[off..off + 8], v);
        let put_i32 = |buf: &mut [u8], off: usize, v: i32| E::write_i32(&mut buf[off..off + 4], v);

        put_i32(&mut buf, SIZEOF_HDR, 540);
        let magic = if self.pair { MAGIC_V2_PAIR } else { MAGIC_V2_SINGLE };
        buf[MAGIC..MAGIC + 8].copy_from_slice(magic);

        E::write_i16(&mut buf[DATATYPE..DATATYPE + 2], self.datatype.code() as i16);
        E::write_i16(&mut buf[BITPIX..BITPIX + 2], self.datatype.bitpix());

        put_i64(&mut buf, DIM, self.ndim as i64);
        for i in 0..7 {
            put_i64(&mut buf, DIM + 8 + i * 8, self.dim[i]);
        }
        for k in 0..3 {
            put_f64(&mut buf, INTENT_P1 + k * 8, self.intent_p[k]);
        }
        for (i, &value) in self.pixdim.iter().enumerate() {
            put_f64(&mut buf, PIXDIM + i * 8, value);
        }

        put_i64(&mut buf, VOX_OFFSET, self.vox_offset);
        put_f64(&mut buf, SCL_SLOPE, self.scl_slope);
        put_f64(&mut buf, SCL_INTER, self.scl_inter);
        put_f64(&mut buf, CAL_MAX, self.cal_max);
        put_f64(&mut buf, CAL_MIN, self.cal_min);
        put_f64(&mut buf, SLICE_DURATION, self.slice_duration);
        put_f64(&mut buf, TOFFSET, self.toffset);
        put_i64(&mut buf, SLICE_START, self.slice_start);
        put_i64(&mut buf, SLICE_END, self.slice_end);

        write_str(&mut buf[DESCRIP..DESCRIP + 80], &self.descrip);
        write_str(&mut buf[AUX_FILE..AUX_FILE + 24], &self.aux_file);

        put_i32(&mut buf, QFORM_CODE, self.qform_code);
        put_i32(&mut buf, SFORM_CODE, self.sform_code);
        for k in 0..3 {
            put_f64(&mut buf, QUATERN_B + k * 8, self.quatern[k]);
            put_f64(&mut buf, QOFFSET_X + k * 8, self.qoffset[k]);
        }
        for (r, row) in [self.srow_x, self.srow_y, self.srow_z].iter().enumerate() {
            for (c, &v) in row.iter().enumerate() {
                put_f64(&mut buf, SROW_X + r * 32 + c * 8, v);
            }
        }

        put_i32(&mut buf, SLICE_CODE, self.slice_code as i32);
        let xyzt_code = (self.spatial_units.to_code() | self.temporal_units.to_code()) as i32;
        put_i32(&mut buf, XYZT_UNITS, xyzt_code);
        put_i32(&mut buf, INTENT_CODE, self.intent_code);
        write_str(&mut buf[INTENT_NAME..INTENT_NAME + 16], &self.intent_name);
        buf[DIM_INFO] = self.dim_info;

        buf
    }

    /// The sform rows as an affine.
    pub fn sform(&self) -> Affine {
        Affine([self.srow_x, self.srow_y, self.srow_z, [0.0, 0.0, 0.0, 1.0]])
    }

    /// The affine encoded by the quaternion fields.
    pub fn qform(&self) -> Affine {
        quaternion_to_affine(&Quaternion {
            bcd: self.quatern,
            offset: self.qoffset,
            zooms: [self.pixdim[1], self.pixdim[2], self.pixdim[3]],
            qfac: self.pixdim[0],
        })
    }

    /// Affine by precedence: sform, then qform, then the default grid.
    ///
    /// A diagnostic is returned when both geometry fields are set but
    /// describe different transforms; the sform wins.
    pub fn best_affine(&self) -> (Affine, Option<Diagnostic>) {
        match (self.sform_code > 0, self.qform_code > 0) {
            (true, true) => {
                let (s, q) = (self.sform(), self.qform());
                let scale = s.zooms().iter().fold(1.0f64, |m, z| m.max(*z));
                let diff = s.max_abs_diff(&q);
                let diagnostic = (diff > GEOMETRY_TOLERANCE * scale).then(|| {
                    Diagnostic::new(
                        DiagnosticKind::GeometryDisagreement,
                        format!("sform and qform differ by up to {diff:.4}; using sform"),
                    )
                });
                (s, diagnostic)
            }
            (true, false) => (self.sform(), None),
            (false, true) => (self.qform(), None),
            (false, false) => (self.base_affine(), None),
        }
    }

    /// Centered, x-flipped grid from the voxel sizes.
    pub fn base_affine(&self) -> Affine {
        let shape = self.shape();
        let zooms = [1, 2, 3].map(|i| {
            let z = self.pixdim[i];
            if z.is_finite() && z != 0.0 {
                z.abs()
            } else {
                1.0
            }
        });
        shape_zoom_affine(&shape, zooms)
    }

    /// Write `affine` into the geometry fields.
    ///
    /// The sform always receives the exact matrix. The qform receives its
    /// quaternion decomposition; when the affine is sheared that
    /// decomposition is lossy, so the qform code drops to 0 and a diagnostic
    /// is returned.
    pub fn set_affine(&mut self, affine: &Affine) -> Option<Diagnostic> {
        if self.sform_code == 0 && self.qform_code == 0 {
            self.sform_code = XFORM_ALIGNED_ANAT;
        }
        self.srow_x = affine.0[0];
        self.srow_y = affine.0[1];
        self.srow_z = affine.0[2];

        let q = affine_to_quaternion(affine);
        self.quatern = q.bcd;
        self.qoffset = q.offset;
        self.pixdim[0] = q.qfac;
        self.pixdim[1..4].copy_from_slice(&q.zooms);

        let degenerate = affine.degenerate_axes();
        if !degenerate.is_empty() {
            self.drop_qform();
            return Some(Diagnostic::new(
                DiagnosticKind::DegenerateAxis,
                format!(
                    "affine has zero-length voxel axes {degenerate:?}; their pixdim is stored as 1"
                ),
            ));
        }
        if !affine.is_orthogonal(1e-5) && self.qform_code > 0 {
            self.drop_qform();
            return Some(Diagnostic::new(
                DiagnosticKind::QformDropped,
                "affine is sheared; qform code set to 0".into(),
            ));
        }
        None
    }

    /// Hand the qform's code to the sform and stop trusting the quaternion.
    fn drop_qform(&mut self) {
        if self.qform_code == 0 {
            return;
        }
        if self.sform_code == 0 {
            self.sform_code = self.qform_code;
        }
        self.qform_code = 0;
    }

    /// Set `ndim` and `dim` from an array shape.
    pub fn set_shape(&mut self, shape: &[usize]) -> Result<()> {
        if shape.is_empty() || shape.len() > 7 {
            return Err(Error::MalformedHeader(format!(
                "NIfTI supports 1 to 7 dimensions, got {}",
                shape.len()
            )));
        }
        self.ndim = shape.len() as u8;
        self.dim = [1; 7];
        for (d, &n) in self.dim.iter_mut().zip(shape) {
            *d = n as i64;
        }
        for p in &mut self.pixdim[shape.len() + 1..] {
            *p = 0.0;
        }
        for p in &mut self.pixdim[1..=shape.len().min(3)] {
            if *p == 0.0 {
                *p = 1.0;
            }
        }
        Ok(())
    }

    /// Get image shape as a Vec<usize> (up to ndim elements).
    pub fn shape(&self) -> Vec<usize> {
        self.dim[..self.ndim as usize]
            .iter()
            .map(|&d| d as usize)
            .collect()
    }

    /// Voxel sizes with f64 precision (up to ndim elements).
    pub fn spacing(&self) -> Vec<f64> {
        let end = (self.ndim as usize + 1).min(self.pixdim.len());
        self.pixdim[1..end].to_vec()
    }

    /// Total number of voxels.
    pub fn num_voxels(&self) -> usize {
        self.dim[..self.ndim as usize]
            .iter()
            .map(|&d| d as usize)
            .product()
    }

    /// Total size of image data in bytes.
    pub fn data_size(&self) -> usize {
        self.num_voxels() * self.datatype.byte_size()
    }

    /// Returns true if this header requires NIfTI-2 format.
    /// NIfTI-2 is required if any dimension exceeds 32767.
    pub fn requires_nifti2(&self) -> bool {
        self.dim.iter().any(|&d| d > i16::MAX as i64)
    }

    /// Validate header fields for basic NIfTI invariants.
    pub fn validate(&self) -> Result<()> {
        if self.ndim == 0 || self.ndim > 7 {
            return Err(Error::MalformedHeader(format!(
                "ndim must be 1..=7, got {}",
                self.ndim
            )));
        }

        let max_dim = match self.version {
            NiftiVersion::Nifti1 => i16::MAX as i64,
            NiftiVersion::Nifti2 => i64::MAX,
        };
        for i in 0..self.ndim as usize {
            if self.dim[i] < 1 || self.dim[i] > max_dim {
                return Err(Error::MalformedHeader(format!(
                    "dimension {} is {}, must be in 1..={max_dim}",
                    i, self.dim[i]
                )));
            }
        }
        if let Some(i) = self.pixdim.iter().position(|p| !p.is_finite()) {
            return Err(Error::MalformedHeader(format!(
                "pixdim[{i}] must be finite, got {}",
                self.pixdim[i]
            )));
        }

        for (name, code) in [("qform_code", self.qform_code), ("sform_code", self.sform_code)] {
            if !(0..=MAX_XFORM_CODE).contains(&code) {
                return Err(Error::MalformedHeader(format!(
                    "{name} {code} outside 0..={MAX_XFORM_CODE}"
                )));
            }
        }

        let min_offset = if self.pair { 0 } else { self.version.header_size() as i64 };
        if self.vox_offset < min_offset {
            return Err(Error::MalformedHeader(format!(
                "vox_offset {} before header end ({})",
                self.vox_offset, min_offset
            )));
        }

        // Check that voxel count and byte size don't overflow usize
        let mut voxels: usize = 1;
        for i in 0..self.ndim as usize {
            voxels = voxels
                .checked_mul(self.dim[i] as usize)
                .ok_or_else(|| Error::MalformedHeader("dimension product overflow".into()))?;
        }
        voxels
            .checked_mul(self.datatype.byte_size())
            .ok_or_else(|| Error::MalformedHeader("data size overflow".into()))?;

        Ok(())
    }
}

impl HeaderCodec for NiftiHeader {
    fn decode(bytes: &[u8]) -> Result<Self> {
        Self::from_bytes(bytes)
    }

    fn encode(&self) -> Result<Vec<u8>> {
        self.to_bytes()
    }

    fn validate(&self) -> Result<()> {
        NiftiHeader::validate(self)
    }

    fn default_affine(&self) -> Affine {
        self.base_affine()
    }
}

fn check_bitpix(bitpix: i16, datatype: DataType) -> Result<()> {
    if bitpix != datatype.bitpix() {
        return Err(Error::MalformedHeader(format!(
            "bitpix {} does not match datatype {} (expected {})",
            bitpix,
            datatype,
            datatype.bitpix()
        )));
    }
    Ok(())
}

/// Axis-aligned affine centred on the volume, x axis flipped.
pub(crate) fn shape_zoom_affine(shape: &[usize], zooms: [f64; 3]) -> Affine {
    let n = [0, 1, 2].map(|i| shape.get(i).copied().unwrap_or(1) as f64);
    Affine::from_zooms(
        [-zooms[0], zooms[1], zooms[2]],
        [
            zooms[0] * (n[0] - 1.0) / 2.0,
            -zooms[1] * (n[1] - 1.0) / 2.0,
            -zooms[2] * (n[2] - 1.0) / 2.0,
        ],
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_header() -> NiftiHeader {
        let mut header = NiftiHeader::for_shape(&[64, 48, 32, 5], DataType::Int16).unwrap();
        header.pixdim = [-1.0, 1.0, 2.0, 3.0, 2.5, 0.0, 0.0, 0.0];
        header.descrip = "sample".into();
        header.intent_code = 2;
        header.intent_name = "corr".into();
        header.intent_p = [0.5, 0.0, 0.0];
        header.slice_code = 1;
        header.slice_end = 31;
        header.slice_duration = 0.05;
        header.temporal_units = TemporalUnits::Second;
        header.cal_max = 100.0;
        header.scl_slope = 2.0;
        header.scl_inter = -1.0;
        header.dim_info = 0x39;
        header
    }

    #[test]
    fn test_temporal_units_roundtrip() {
        for unit in [
            TemporalUnits::Unknown,
            TemporalUnits::Second,
            TemporalUnits::Millisecond,
            TemporalUnits::Microsecond,
            TemporalUnits::Hertz,
            TemporalUnits::Ppm,
            TemporalUnits::RadPerSec,
        ] {
            assert_eq!(TemporalUnits::from_code(unit.to_code()), unit);
        }
        assert_eq!(TemporalUnits::from_code(0x0A), TemporalUnits::Second);
    }

    #[test]
    fn test_spatial_units_from_code() {
        assert_eq!(SpatialUnits::from_code(0x00), SpatialUnits::Unknown);
        assert_eq!(SpatialUnits::from_code(0x01), SpatialUnits::Meter);
        assert_eq!(SpatialUnits::from_code(0x02), SpatialUnits::Millimeter);
        assert_eq!(SpatialUnits::from_code(0x0B), SpatialUnits::Micrometer);
    }

    #[test]
    fn test_nifti1_roundtrip_both_byte_orders() {
        for endianness in [Endianness::Little, Endianness::Big] {
            let mut header = sample_header();
            header.endianness = endianness;
            let bytes = header.to_bytes().unwrap();
            assert_eq!(bytes.len(), 348);
            let parsed = NiftiHeader::from_bytes(&bytes).unwrap();
            assert_eq!(parsed.endianness, endianness);
            assert_eq!(parsed.shape(), vec![64, 48, 32, 5]);
            assert_eq!(parsed.intent_name, "corr");
            assert_eq!(parsed.dim_info, 0x39);
            assert_eq!(parsed.to_bytes().unwrap(), bytes);
        }
    }

    #[test]
    fn test_nifti2_roundtrip() {
        let mut header = NiftiHeader::for_shape(&[100000, 100000, 100], DataType::UInt8).unwrap();
        assert_eq!(header.version, NiftiVersion::Nifti2);
        assert_eq!(header.vox_offset, 544);
        header.pixdim = [-1.0, 0.5, 0.5, 1.0, 0.0, 0.0, 0.0, 0.0];
        header.slice_start = 3;
        header.toffset = 1.25;

        let bytes = header.to_bytes().unwrap();
        assert_eq!(bytes.len(), 540);

        let parsed = NiftiHeader::from_bytes(&bytes).unwrap();
        assert_eq!(parsed.version, NiftiVersion::Nifti2);
        assert_eq!(parsed.dim[0], 100000);
        assert_eq!(parsed.slice_start, 3);
        assert_eq!(parsed.toffset, 1.25);
    }

    #[test]
    fn test_version_detection() {
        // NIfTI-1 header starts with 348
        let mut v1_bytes = vec![0u8; 348];
        LittleEndian::write_i32(&mut v1_bytes[0..4], 348);
        v1_bytes[344..348].copy_from_slice(b"n+1\0");
        LittleEndian::write_i16(&mut v1_bytes[40..42], 3); // ndim
        LittleEndian::write_i16(&mut v1_bytes[42..44], 10);
        LittleEndian::write_i16(&mut v1_bytes[44..46], 10);
        LittleEndian::write_i16(&mut v1_bytes[46..48], 10);
        LittleEndian::write_i16(&mut v1_bytes[70..72], 16); // datatype = Float32
        LittleEndian::write_i16(&mut v1_bytes[72..74], 32); // bitpix
        LittleEndian::write_f32(&mut v1_bytes[108..112], 352.0); // vox_offset

        let h1 = NiftiHeader::from_bytes(&v1_bytes).unwrap();
        assert_eq!(h1.version, NiftiVersion::Nifti1);
        assert_eq!(h1.endianness, Endianness::Little);

        let mut v2_bytes = vec![0u8; 540];
        LittleEndian::write_i32(&mut v2_bytes[0..4], 540);
        v2_bytes[4..12].copy_from_slice(b"ni2\0\r\n\x1a\n");
        LittleEndian::write_i16(&mut v2_bytes[12..14], 16);
        LittleEndian::write_i16(&mut v2_bytes[14..16], 32);
        LittleEndian::write_i64(&mut v2_bytes[16..24], 3);
        LittleEndian::write_i64(&mut v2_bytes[24..32], 10);
        LittleEndian::write_i64(&mut v2_bytes[32..40], 10);
        LittleEndian::write_i64(&mut v2_bytes[40..48], 10);

        let h2 = NiftiHeader::from_bytes(&v2_bytes).unwrap();
        assert_eq!(h2.version, NiftiVersion::Nifti2);
        assert!(h2.pair);
    }

    #[test]
    fn bad_magic_is_malformed() {
        let mut bytes = sample_header().to_bytes().unwrap();
        bytes[344..348].copy_from_slice(b"xyz\0");
        assert!(matches!(NiftiHeader::from_bytes(&bytes), Err(Error::MalformedHeader(_))));
    }

    #[test]
    fn bitpix_mismatch_is_malformed() {
        let mut header = sample_header();
        header.endianness = Endianness::Little;
        let mut bytes = header.to_bytes().unwrap();
        LittleEndian::write_i16(&mut bytes[72..74], 8);
        assert!(matches!(NiftiHeader::from_bytes(&bytes), Err(Error::MalformedHeader(_))));
    }

    #[test]
    fn validate_rejects_out_of_range_fields() {
        let mut header = sample_header();
        header.sform_code = 5;
        assert!(header.validate().is_err());

        let mut header = sample_header();
        header.dim[0] = 40000;
        assert!(header.validate().is_err());
        assert!(header.requires_nifti2());

        let mut header = sample_header();
        header.dim[1] = 0;
        assert!(header.validate().is_err());
    }

    #[test]
    fn qform_identity_with_zooms() {
        let mut header = NiftiHeader::for_shape(&[4, 4, 4], DataType::Float32).unwrap();
        header.qform_code = 1;
        header.pixdim = [1.0, 2.0, 2.0, 2.0, 0.0, 0.0, 0.0, 0.0];
        let (affine, diagnostic) = header.best_affine();
        assert!(diagnostic.is_none());
        assert_eq!(affine, Affine::from_zooms([2.0, 2.0, 2.0], [0.0; 3]));
    }

    #[test]
    fn sform_wins_with_diagnostic() {
        let mut header = NiftiHeader::for_shape(&[4, 4, 4], DataType::Float32).unwrap();
        header.qform_code = 1;
        header.sform_code = 1;
        header.srow_x = [3.0, 0.0, 0.0, 0.0];
        header.srow_y = [0.0, 3.0, 0.0, 0.0];
        header.srow_z = [0.0, 0.0, 3.0, 0.0];
        let (affine, diagnostic) = header.best_affine();
        assert_eq!(affine.zooms(), [3.0, 3.0, 3.0]);
        assert_eq!(diagnostic.map(|d| d.kind), Some(DiagnosticKind::GeometryDisagreement));
    }

    #[test]
    fn default_affine_is_centred_and_flipped() {
        let mut header = NiftiHeader::for_shape(&[11, 21, 31], DataType::Float32).unwrap();
        header.pixdim[1..4].copy_from_slice(&[2.0, 3.0, 4.0]);
        let affine = header.default_affine();
        assert_eq!(affine.column(0), [-2.0, 0.0, 0.0]);
        assert_eq!(affine.translation(), [10.0, -30.0, -60.0]);
    }

    #[test]
    fn set_affine_fills_both_forms() {
        let mut header = NiftiHeader::for_shape(&[4, 4, 4], DataType::Float32).unwrap();
        let affine = Affine::from_zooms([-2.0, 2.0, 2.5], [90.0, -126.0, -72.0]);
        assert!(header.set_affine(&affine).is_none());
        assert_eq!(header.sform_code, XFORM_ALIGNED_ANAT);
        assert_eq!(header.qform_code, 0);
        assert!(header.qform().approx_eq(&affine, 1e-9));
        assert_eq!(&header.pixdim[1..4], &[2.0, 2.0, 2.5]);
    }

    #[test]
    fn sheared_affine_drops_qform() {
        let mut header = NiftiHeader::for_shape(&[4, 4, 4], DataType::Float32).unwrap();
        header.qform_code = 1;
        header.sform_code = 1;
        let sheared = Affine([
            [1.0, 0.5, 0.0, 0.0],
            [0.0, 1.0, 0.0, 0.0],
            [0.0, 0.0, 1.0, 0.0],
            [0.0, 0.0, 0.0, 1.0],
        ]);
        let diagnostic = header.set_affine(&sheared);
        assert_eq!(diagnostic.map(|d| d.kind), Some(DiagnosticKind::QformDropped));
        assert_eq!(header.qform_code, 0);
        assert_eq!(header.sform(), sheared);
    }

    #[test]
    fn zero_length_axis_is_reported() {
        let mut header = NiftiHeader::for_shape(&[4, 4, 4], DataType::Float32).unwrap();
        header.qform_code = 1;
        header.sform_code = 0;
        let flat = Affine([
            [2.0, 0.0, 0.0, 5.0],
            [0.0, 0.0, 0.0, 6.0],
            [0.0, 0.0, 3.0, 7.0],
            [0.0, 0.0, 0.0, 1.0],
        ]);
        let diagnostic = header.set_affine(&flat).unwrap();
        assert_eq!(diagnostic.kind, DiagnosticKind::DegenerateAxis);
        assert!(diagnostic.message.contains("[1]"), "{}", diagnostic.message);
        assert_eq!((header.qform_code, header.sform_code), (0, 1));
        assert_eq!(&header.pixdim[1..4], &[2.0, 1.0, 3.0]);
        assert_eq!(header.sform(), flat);
    }
}
