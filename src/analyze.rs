//! Analyze 7.5 `.hdr`/`.img` pairs with the SPM origin and scale extensions.
//!
//! The 348-byte header carries no orientation. Readers assume a left-handed
//! (`LAS`) axis-aligned grid whose origin is either the SPM `originator`
//! voxel (1-based) or the volume centre.

use crate::affine::Affine;
use crate::compression;
use crate::datatype::{DataType, Endianness, MemoryOrder};
use crate::error::{Error, Result};
use crate::image::{Header, HeaderCodec, ImageContainer};
use crate::io::SaveOptions;
use crate::nifti::header::{read_str, write_str};
use crate::orientation;
use crate::proxy::{ArrayProxy, DataSource, Scaling};
use crate::registry;
use crate::scaling::ScalingCapability;
use byteorder::{BigEndian, ByteOrder, LittleEndian};
use std::path::Path;

/// Analyze header field byte offsets.
mod offsets {
    pub const SIZEOF_HDR: usize = 0;
    pub const DATA_TYPE: usize = 4;
    pub const DB_NAME: usize = 14;
    pub const EXTENTS: usize = 32;
    pub const SESSION_ERROR: usize = 36;
    pub const REGULAR: usize = 38;
    pub const DIM: usize = 40;
    pub const VOX_UNITS: usize = 56;
    pub const CAL_UNITS: usize = 60;
    pub const DATATYPE: usize = 70;
    pub const BITPIX: usize = 72;
    pub const PIXDIM: usize = 76;
    pub const VOX_OFFSET: usize = 108;
    pub const FUNUSED1: usize = 112;
    pub const FUNUSED2: usize = 116;
    pub const FUNUSED3: usize = 120;
    pub const CAL_MAX: usize = 124;
    pub const CAL_MIN: usize = 128;
    pub const COMPRESSED: usize = 132;
    pub const VERIFIED: usize = 136;
    pub const GLMAX: usize = 140;
    pub const GLMIN: usize = 144;
    pub const DESCRIP: usize = 148;
    pub const AUX_FILE: usize = 228;
    pub const ORIENT: usize = 252;
    pub const ORIGINATOR: usize = 253;
    pub const GENERATED: usize = 263;
    pub const SCANNUM: usize = 273;
    pub const PATIENT_ID: usize = 283;
    pub const EXP_DATE: usize = 293;
    pub const EXP_TIME: usize = 303;
    pub const VIEWS: usize = 316;
    pub const VOLS_ADDED: usize = 320;
    pub const START_FIELD: usize = 324;
    pub const FIELD_SKIP: usize = 328;
    pub const OMAX: usize = 332;
    pub const OMIN: usize = 336;
    pub const SMAX: usize = 340;
    pub const SMIN: usize = 344;
}

/// Analyze 7.5 header.
#[derive(Debug, Clone, PartialEq)]
pub struct AnalyzeHeader {
    pub data_type: String,
    pub db_name: String,
    pub extents: i32,
    pub session_error: i16,
    pub regular: u8,
    /// Number of dimensions (`dim[0]`).
    pub ndim: u8,
    pub dim: [i64; 7],
    pub vox_units: String,
    pub cal_units: String,
    pub datatype: DataType,
    pub pixdim: [f64; 8],
    pub vox_offset: f64,
    /// SPM scale factor; applied as a slope when positive.
    pub scale: f64,
    pub funused2: f64,
    pub funused3: f64,
    pub cal_max: f64,
    pub cal_min: f64,
    pub compressed: f64,
    pub verified: f64,
    pub glmax: i32,
    pub glmin: i32,
    pub descrip: String,
    pub aux_file: String,
    pub orient: u8,
    /// SPM origin voxel, 1-based; all zero means "centre of the volume".
    pub originator: [i16; 5],
    pub generated: String,
    pub scannum: String,
    pub patient_id: String,
    pub exp_date: String,
    pub exp_time: String,
    pub views: i32,
    pub vols_added: i32,
    pub start_field: i32,
    pub field_skip: i32,
    pub omax: i32,
    pub omin: i32,
    pub smax: i32,
    pub smin: i32,
    pub endianness: Endianness,
}

impl Default for AnalyzeHeader {
    fn default() -> Self {
        Self {
            data_type: String::new(),
            db_name: String::new(),
            extents: 16384,
            session_error: 0,
            regular: b'r',
            ndim: 3,
            dim: [1; 7],
            vox_units: "mm".into(),
            cal_units: String::new(),
            datatype: DataType::Float32,
            pixdim: [0.0, 1.0, 1.0, 1.0, 0.0, 0.0, 0.0, 0.0],
            vox_offset: 0.0,
            scale: 1.0,
            funused2: 0.0,
            funused3: 0.0,
            cal_max: 0.0,
            cal_min: 0.0,
            compressed: 0.0,
            verified: 0.0,
            glmax: 0,
            glmin: 0,
            descrip: String::new(),
            aux_file: String::new(),
            orient: 0,
            originator: [0; 5],
            generated: String::new(),
            scannum: String::new(),
            patient_id: String::new(),
            exp_date: String::new(),
            exp_time: String::new(),
            views: 0,
            vols_added: 0,
            start_field: 0,
            field_skip: 0,
            omax: 0,
            omin: 0,
            smax: 0,
            smin: 0,
            endianness: Endianness::native(),
        }
    }
}

impl AnalyzeHeader {
    pub const SIZE: usize = 348;

    /// Data types an Analyze reader understands.
    pub const DTYPES: [DataType; 5] = [
        DataType::UInt8,
        DataType::Int16,
        DataType::Int32,
        DataType::Float32,
        DataType::Float64,
    ];

    pub fn supports(dtype: DataType) -> bool {
        Self::DTYPES.contains(&dtype)
    }

    /// Closest storable type that holds every value of `dtype`.
    pub fn storage_dtype(dtype: DataType) -> DataType {
        match dtype {
            d if Self::supports(d) => d,
            DataType::Int8 => DataType::Int16,
            DataType::UInt16 => DataType::Int32,
            _ => DataType::Float64,
        }
    }

    /// Parse a header, trying native byte order first.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < Self::SIZE {
            return Err(Error::MalformedHeader(format!(
                "Analyze header needs {} bytes, got {}",
                Self::SIZE,
                bytes.len()
            )));
        }
        let endianness = Endianness::probe_order()
            .into_iter()
            .find(|e| match e {
                Endianness::Little => LittleEndian::read_i32(bytes) == 348,
                Endianness::Big => BigEndian::read_i32(bytes) == 348,
            })
            .ok_or_else(|| {
                Error::MalformedHeader(format!(
                    "sizeof_hdr is not 348 in either byte order ({:02x?})",
                    &bytes[..4]
                ))
            })?;
        let header = match endianness {
            Endianness::Little => Self::parse::<LittleEndian>(bytes)?,
            Endianness::Big => Self::parse::<BigEndian>(bytes)?,
        };
        let header = Self { endianness, ..header };
        header.validate()?;
        Ok(header)
    }

    #[allow(clippy::wildcard_imports)]
    fn parse<E: ByteOrder>(bytes: &[u8]) -> Result<Self> {
        use offsets::*;

        let f32_at = |off: usize| E::read_f32(&bytes[off..off + 4]) as f64;
        let i16_at = |off: usize| E::read_i16(&bytes[off..off + 2]);
        let i32_at = |off: usize| E::read_i32(&bytes[off..off + 4]);
        let str_at = |off: usize, len: usize| read_str(&bytes[off..off + len]);

        let ndim = i16_at(DIM);
        if !(1..=7).contains(&ndim) {
            return Err(Error::MalformedHeader(format!(
                "Analyze dim[0] must be 1..=7, got {ndim}"
            )));
        }
        let mut dim = [1i64; 7];
        for (i, d) in dim.iter_mut().enumerate() {
            *d = i64::from(i16_at(DIM + 2 + i * 2));
        }
        let code = i16_at(DATATYPE) as i32;
        let datatype = DataType::from_code(code)?;
        if i16_at(BITPIX) != datatype.bitpix() {
            return Err(Error::MalformedHeader(format!(
                "bitpix {} does not match datatype {datatype}",
                i16_at(BITPIX)
            )));
        }

        Ok(Self {
            data_type: str_at(DATA_TYPE, 10),
            db_name: str_at(DB_NAME, 18),
            extents: i32_at(EXTENTS),
            session_error: i16_at(SESSION_ERROR),
            regular: bytes[REGULAR],
            ndim: ndim as u8,
            dim,
            vox_units: str_at(VOX_UNITS, 4),
            cal_units: str_at(CAL_UNITS, 8),
            datatype,
            pixdim: [0, 1, 2, 3, 4, 5, 6, 7].map(|i| f32_at(PIXDIM + i * 4)),
            vox_offset: f32_at(VOX_OFFSET),
            scale: f32_at(FUNUSED1),
            funused2: f32_at(FUNUSED2),
            funused3: f32_at(FUNUSED3),
            cal_max: f32_at(CAL_MAX),
            cal_min: f32_at(CAL_MIN),
            compressed: f32_at(COMPRESSED),
            verified: f32_at(VERIFIED),
            glmax: i32_at(GLMAX),
            glmin: i32_at(GLMIN),
            descrip: str_at(DESCRIP, 80),
            aux_file: str_at(AUX_FILE, 24),
            orient: bytes[ORIENT],
            originator: [0, 1, 2, 3, 4].map(|i| i16_at(ORIGINATOR + i * 2)),
            generated: str_at(GENERATED, 10),
            scannum: str_at(SCANNUM, 10),
            patient_id: str_at(PATIENT_ID, 10),
            exp_date: str_at(EXP_DATE, 10),
            exp_time: str_at(EXP_TIME, 10),
            views: i32_at(VIEWS),
            vols_added: i32_at(VOLS_ADDED),
            start_field: i32_at(START_FIELD),
            field_skip: i32_at(FIELD_SKIP),
            omax: i32_at(OMAX),
            omin: i32_at(OMIN),
            smax: i32_at(SMAX),
            smin: i32_at(SMIN),
            endianness: Endianness::native(),
        })
    }

    /// Serialize in the header's own byte order.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        self.validate()?;
        Ok(match self.endianness {
            Endianness::Little => self.write::<LittleEndian>(),
            Endianness::Big => self.write::<BigEndian>(),
        })
    }

    #[allow(clippy::wildcard_imports)]
    fn write<E: ByteOrder>(&self) -> Vec<u8> {
        use offsets::*;

        let mut buf = vec![0u8; Self::SIZE];
        let put_f32 = |buf: &mut [u8], off: usize, v: f64| E::write_f32(&mut buf[off..off + 4], v as f32);
        let put_i32 = |buf: &mut [u8], off: usize, v: i32| E::write_i32(&mut buf[off..off + 4], v);
        let put_i16 = |buf: &mut [u8], off: usize, v: i16| E::write_i16(&mut buf[off..off + 2], v);

        put_i32(&mut buf, SIZEOF_HDR, Self::SIZE as i32);
        write_str(&mut buf[DATA_TYPE..DATA_TYPE + 10], &self.data_type);
        write_str(&mut buf[DB_NAME..DB_NAME + 18], &self.db_name);
        put_i32(&mut buf, EXTENTS, self.extents);
        put_i16(&mut buf, SESSION_ERROR, self.session_error);
        buf[REGULAR] = self.regular;

        // validate() keeps every dimension within i16
        put_i16(&mut buf, DIM, i16::from(self.ndim));
        for (i, &d) in self.dim.iter().enumerate() {
            put_i16(&mut buf, DIM + 2 + i * 2, d as i16);
        }
        write_str(&mut buf[VOX_UNITS..VOX_UNITS + 4], &self.vox_units);
        write_str(&mut buf[CAL_UNITS..CAL_UNITS + 8], &self.cal_units);
        put_i16(&mut buf, DATATYPE, self.datatype.code() as i16);
        put_i16(&mut buf, BITPIX, self.datatype.bitpix());
        for (i, &p) in self.pixdim.iter().enumerate() {
            put_f32(&mut buf, PIXDIM + i * 4, p);
        }
        put_f32(&mut buf, VOX_OFFSET, self.vox_offset);
        put_f32(&mut buf, FUNUSED1, self.scale);
        put_f32(&mut buf, FUNUSED2, self.funused2);
        put_f32(&mut buf, FUNUSED3, self.funused3);
        put_f32(&mut buf, CAL_MAX, self.cal_max);
        put_f32(&mut buf, CAL_MIN, self.cal_min);
        put_f32(&mut buf, COMPRESSED, self.compressed);
        put_f32(&mut buf, VERIFIED, self.verified);
        put_i32(&mut buf, GLMAX, self.glmax);
        put_i32(&mut buf, GLMIN, self.glmin);
        write_str(&mut buf[DESCRIP..DESCRIP + 80], &self.descrip);
        write_str(&mut buf[AUX_FILE..AUX_FILE + 24], &self.aux_file);
        buf[ORIENT] = self.orient;
        for (i, &o) in self.originator.iter().enumerate() {
            put_i16(&mut buf, ORIGINATOR + i * 2, o);
        }
        write_str(&mut buf[GENERATED..GENERATED + 10], &self.generated);
        write_str(&mut buf[SCANNUM..SCANNUM + 10], &self.scannum);
        write_str(&mut buf[PATIENT_ID..PATIENT_ID + 10], &self.patient_id);
        write_str(&mut buf[EXP_DATE..EXP_DATE + 10], &self.exp_date);
        write_str(&mut buf[EXP_TIME..EXP_TIME + 10], &self.exp_time);
        for (off, v) in [
            (VIEWS, self.views),
            (VOLS_ADDED, self.vols_added),
            (START_FIELD, self.start_field),
            (FIELD_SKIP, self.field_skip),
            (OMAX, self.omax),
            (OMIN, self.omin),
            (SMAX, self.smax),
            (SMIN, self.smin),
        ] {
            put_i32(&mut buf, off, v);
        }
        buf
    }

    pub fn validate(&self) -> Result<()> {
        if !(1..=7).contains(&self.ndim) {
            return Err(Error::MalformedHeader(format!(
                "Analyze supports 1 to 7 dimensions, got {}",
                self.ndim
            )));
        }
        for (i, &d) in self.dim[..self.ndim as usize].iter().enumerate() {
            if !(1..=i64::from(i16::MAX)).contains(&d) {
                return Err(Error::MalformedHeader(format!(
                    "dimension {i} is {d}, must be in 1..=32767"
                )));
            }
        }
        if !Self::supports(self.datatype) {
            return Err(Error::MalformedHeader(format!(
                "Analyze cannot store {}",
                self.datatype
            )));
        }
        if let Some(i) = self.pixdim.iter().position(|p| !p.is_finite()) {
            return Err(Error::MalformedHeader(format!(
                "pixdim[{i}] must be finite, got {}",
                self.pixdim[i]
            )));
        }
        if !self.vox_offset.is_finite() || self.vox_offset < 0.0 || self.vox_offset.fract() != 0.0 {
            return Err(Error::MalformedHeader(format!(
                "vox_offset must be a non-negative integer, got {}",
                self.vox_offset
            )));
        }
        Ok(())
    }

    pub fn shape(&self) -> Vec<usize> {
        self.dim[..self.ndim as usize]
            .iter()
            .map(|&d| d as usize)
            .collect()
    }

    pub fn set_shape(&mut self, shape: &[usize]) -> Result<()> {
        if shape.is_empty() || shape.len() > 7 {
            return Err(Error::MalformedHeader(format!(
                "Analyze supports 1 to 7 dimensions, got {}",
                shape.len()
            )));
        }
        if let Some(&n) = shape.iter().find(|&&n| n > i16::MAX as usize) {
            return Err(Error::IncompatibleConversion(format!(
                "dimension {n} exceeds the Analyze limit of 32767"
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
        Ok(())
    }

    /// Voxel sizes for each dimension.
    pub fn spacing(&self) -> Vec<f64> {
        self.pixdim[1..=self.ndim as usize].to_vec()
    }

    fn spatial_dims(&self) -> [f64; 3] {
        [0, 1, 2].map(|i| if i < self.ndim as usize { self.dim[i] as f64 } else { 1.0 })
    }

    /// Signed spatial zooms: x negative, zero sizes read as 1.
    fn signed_zooms(&self) -> [f64; 3] {
        let z = [1, 2, 3].map(|i| match self.pixdim[i].abs() {
            z if z == 0.0 => 1.0,
            z => z,
        });
        [-z[0], z[1], z[2]]
    }

    /// Whether `origin` (1-based) is a usable SPM origin for these dims.
    fn origin_in_range(origin: [f64; 3], dims: [f64; 3]) -> bool {
        origin.iter().any(|&o| o != 0.0)
            && origin
                .iter()
                .zip(dims)
                .all(|(&o, n)| o > -n && o < 2.0 * n)
    }

    /// `LAS` affine from pixdim and the SPM origin.
    pub fn base_affine(&self) -> Affine {
        let dims = self.spatial_dims();
        let zooms = self.signed_zooms();
        let origin = [0, 1, 2].map(|i| f64::from(self.originator[i]));
        let voxel = if Self::origin_in_range(origin, dims) {
            origin.map(|o| o - 1.0)
        } else {
            dims.map(|n| (n - 1.0) / 2.0)
        };
        Affine::from_zooms(zooms, [0, 1, 2].map(|i| -voxel[i] * zooms[i]))
    }

    /// Store `affine` as pixdim and originator.
    ///
    /// Only axis-aligned `LAS` grids whose origin falls on a voxel (or the
    /// volume centre) are representable.
    pub fn set_affine(&mut self, affine: &Affine) -> Result<()> {
        let m = affine.linear();
        let scale = affine.zooms().iter().fold(0.0f64, |a, &z| a.max(z));
        let tol = 1e-6 * scale.max(1.0);
        let off_diagonal = (0..3)
            .flat_map(|i| (0..3).filter(move |&j| j != i).map(move |j| (i, j)))
            .any(|(i, j)| m[i][j].abs() > tol);
        if off_diagonal || m[0][0] >= 0.0 || m[1][1] <= 0.0 || m[2][2] <= 0.0 {
            return Err(Error::IncompatibleConversion(format!(
                "Analyze stores only axis-aligned LAS grids, affine axes are {:?}",
                orientation::aff2axcodes(affine)
            )));
        }
        let zooms = [m[0][0], m[1][1], m[2][2]];
        let t = affine.translation();
        let voxel = [0, 1, 2].map(|i| -t[i] / zooms[i]);
        let dims = self.spatial_dims();

        let centred = voxel
            .iter()
            .zip(dims)
            .all(|(&v, n)| (v - (n - 1.0) / 2.0).abs() < 1e-3);
        let originator = if centred {
            [0i16; 3]
        } else {
            let origin = voxel.map(|v| v + 1.0);
            let integral = origin
                .iter()
                .all(|&o| (o - o.round()).abs() < 1e-3 && o.round().abs() <= f64::from(i16::MAX));
            let origin = origin.map(f64::round);
            if !integral || !Self::origin_in_range(origin, dims) {
                return Err(Error::IncompatibleConversion(format!(
                    "world origin at voxel {voxel:?} has no Analyze originator"
                )));
            }
            origin.map(|o| o as i16)
        };

        for i in 0..3 {
            self.pixdim[i + 1] = zooms[i].abs();
        }
        self.originator[..3].copy_from_slice(&originator);
        Ok(())
    }
}

impl HeaderCodec for AnalyzeHeader {
    fn decode(bytes: &[u8]) -> Result<Self> {
        Self::from_bytes(bytes)
    }

    fn encode(&self) -> Result<Vec<u8>> {
        self.to_bytes()
    }

    fn validate(&self) -> Result<()> {
        AnalyzeHeader::validate(self)
    }

    fn default_affine(&self) -> Affine {
        self.base_affine()
    }
}

fn pair_paths(path: &Path) -> Result<(std::path::PathBuf, std::path::PathBuf)> {
    registry::resolve_pair(path)?.ok_or_else(|| {
        Error::Configuration(format!(
            "Analyze images are .hdr/.img pairs, got {}",
            path.display()
        ))
    })
}

pub fn load_header(path: &Path) -> Result<AnalyzeHeader> {
    let (header_path, _) = pair_paths(path)?;
    AnalyzeHeader::from_bytes(&compression::read_decompressed(&header_path)?)
}

/// Load an Analyze pair given either of its files.
pub fn load(path: &Path) -> Result<ImageContainer> {
    let (_, data_path) = pair_paths(path)?;
    let header = load_header(path)?;
    let scaling = if header.scale > 0.0 {
        Scaling::from_slope_inter(header.scale, 0.0)
    } else {
        Scaling::None
    };
    let proxy = ArrayProxy::new(
        DataSource::open(&data_path)?,
        header.shape(),
        header.datatype,
        header.vox_offset as u64,
        MemoryOrder::Fortran,
        header.endianness,
        scaling,
    )?;
    let affine = header.base_affine();
    log::debug!(
        "loaded Analyze {:?} {} originator {:?}",
        header.shape(),
        header.datatype,
        &header.originator[..3]
    );
    ImageContainer::from_parts(
        Header::Analyze(header),
        affine,
        proxy,
        Vec::new(),
        Vec::new(),
        Some(path.to_path_buf()),
    )
}

/// Write `image` as an Analyze pair.
///
/// Images that are not already `LAS` are flipped and permuted into it
/// first; rotated or sheared geometry cannot be stored.
pub fn save(image: &ImageContainer, path: &Path, options: &SaveOptions) -> Result<()> {
    let (header_path, data_path) = registry::paired_paths(path).ok_or_else(|| {
        Error::IncompatibleConversion(format!(
            "Analyze output needs a .hdr or .img name, got {}",
            path.display()
        ))
    })?;

    let reoriented;
    let image = {
        let ornt = orientation::ornt_transform(
            &orientation::io_orientation(image.affine()),
            &orientation::analyze_target(),
        )?;
        if ornt == orientation::IDENTITY || image.shape().len() < 3 {
            image
        } else {
            log::debug!("flipping image axes into LAS for Analyze");
            reoriented = image.reoriented(&ornt)?;
            &reoriented
        }
    };

    let dtype = match options.output_dtype {
        Some(d) if AnalyzeHeader::supports(d) => d,
        Some(d) => {
            return Err(Error::UnsupportedDatatype(format!("Analyze cannot store {d}")));
        }
        None => AnalyzeHeader::storage_dtype(image.default_output_dtype()),
    };
    let endianness = options.endianness.unwrap_or(match image.header() {
        Header::Analyze(h) => h.endianness,
        Header::Nifti(h) => h.endianness,
        _ => Endianness::native(),
    });

    let mut header = match image.header() {
        Header::Analyze(h) => h.clone(),
        other => {
            let mut h = AnalyzeHeader::default();
            for (p, z) in h.pixdim[1..].iter_mut().zip(other.zooms()) {
                *p = z;
            }
            h
        }
    };
    header.set_shape(image.shape())?;
    header.set_affine(image.affine())?;
    header.datatype = dtype;
    header.endianness = endianness;
    header.vox_offset = 0.0;

    let (data, scaling) = image.encode_data(dtype, ScalingCapability::Slope, endianness)?;
    header.scale = scaling.slope;

    let codec = options.codec_for(path);
    let head = header.to_bytes()?;
    compression::write_atomic(&data_path, &data, codec, options.compress_level)?;
    compression::write_atomic(&header_path, &head, codec, options.compress_level)
}
