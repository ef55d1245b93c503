//! TrackVis `.trk` files.
//!
//! A 1000-byte header followed by one record per streamline:
//! `n_points: i32`, then `n_points × (3 + n_scalars)` f32 values, then
//! `n_properties` f32 values. Points are in "voxmm" space: voxel
//! coordinates scaled by the voxel size, with the origin at the corner of
//! the first voxel.

use super::{read_or_eof, Reference, Streamline};
use crate::affine::Affine;
use crate::compression;
use crate::datatype::Endianness;
use crate::error::{Error, Result};
use crate::image::HeaderCodec;
use crate::nifti::header::{read_str, write_str};
use crate::orientation;
use byteorder::{BigEndian, ByteOrder, LittleEndian};
use std::io::Read;
use std::path::Path;

/// Byte offsets of the header fields.
mod offsets {
    pub const ID_STRING: usize = 0;
    pub const DIM: usize = 6;
    pub const VOXEL_SIZE: usize = 12;
    pub const ORIGIN: usize = 24;
    pub const N_SCALARS: usize = 36;
    pub const SCALAR_NAME: usize = 38;
    pub const N_PROPERTIES: usize = 238;
    pub const PROPERTY_NAME: usize = 240;
    pub const VOX_TO_RAS: usize = 440;
    pub const VOXEL_ORDER: usize = 948;
    pub const IMAGE_ORIENTATION_PATIENT: usize = 956;
    pub const INVERT_X: usize = 982;
    pub const N_COUNT: usize = 988;
    pub const VERSION: usize = 992;
    pub const HDR_SIZE: usize = 996;
}

const NAME_LEN: usize = 20;
const MAX_NAMES: usize = 10;

#[derive(Debug, Clone, PartialEq)]
pub struct TrkHeader {
    pub dims: [i16; 3],
    pub voxel_size: [f32; 3],
    pub origin: [f32; 3],
    pub n_scalars: usize,
    /// At most ten names are stored.
    pub scalar_names: Vec<String>,
    pub n_properties: usize,
    pub property_names: Vec<String>,
    /// Voxel to RAS+ mm; all zero in version 1 files.
    pub vox_to_ras: Affine,
    pub voxel_order: String,
    pub image_orientation_patient: [f32; 6],
    /// `invert_x`, `invert_y`, `invert_z`, `swap_xy`, `swap_yz`, `swap_zx`.
    pub flags: [u8; 6],
    /// Number of streamlines, 0 when unknown.
    pub n_count: i32,
    pub version: i32,
    pub endianness: Endianness,
}

impl Default for TrkHeader {
    fn default() -> Self {
        Self {
            dims: [1, 1, 1],
            voxel_size: [1.0; 3],
            origin: [0.0; 3],
            n_scalars: 0,
            scalar_names: Vec::new(),
            n_properties: 0,
            property_names: Vec::new(),
            vox_to_ras: Affine::identity(),
            voxel_order: "RAS".into(),
            image_orientation_patient: [0.0; 6],
            flags: [0; 6],
            n_count: 0,
            version: 2,
            endianness: Endianness::Little,
        }
    }
}

impl TrkHeader {
    pub const SIZE: usize = 1000;

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < Self::SIZE {
            return Err(Error::MalformedHeader(format!(
                "TrackVis header needs {} bytes, got {}",
                Self::SIZE,
                bytes.len()
            )));
        }
        if &bytes[..5] != b"TRACK" {
            return Err(Error::MalformedHeader("missing TRACK magic".into()));
        }
        let size_at = offsets::HDR_SIZE..offsets::HDR_SIZE + 4;
        let endianness = Endianness::probe_order()
            .into_iter()
            .find(|e| match e {
                Endianness::Little => LittleEndian::read_i32(&bytes[size_at.clone()]) == 1000,
                Endianness::Big => BigEndian::read_i32(&bytes[size_at.clone()]) == 1000,
            })
            .ok_or_else(|| {
                Error::MalformedHeader("hdr_size is not 1000 in either byte order".into())
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

        let f32_at = |off: usize| E::read_f32(&bytes[off..off + 4]);
        let i16_at = |off: usize| E::read_i16(&bytes[off..off + 2]);
        let count = |off: usize, what: &str| {
            usize::try_from(i16_at(off))
                .map_err(|_| Error::MalformedHeader(format!("negative {what} count")))
        };
        let names = |base: usize, n: usize| {
            (0..n.min(MAX_NAMES))
                .map(|i| read_str(&bytes[base + i * NAME_LEN..base + (i + 1) * NAME_LEN]))
                .collect::<Vec<_>>()
        };

        let mut vox_to_ras = [[0.0; 4]; 4];
        for (r, row) in vox_to_ras.iter_mut().enumerate() {
            for (c, v) in row.iter_mut().enumerate() {
                *v = f64::from(f32_at(VOX_TO_RAS + (r * 4 + c) * 4));
            }
        }
        let n_scalars = count(N_SCALARS, "scalar")?;
        let n_properties = count(N_PROPERTIES, "property")?;
        let mut flags = [0u8; 6];
        flags.copy_from_slice(&bytes[INVERT_X..INVERT_X + 6]);

        Ok(Self {
            dims: [0, 1, 2].map(|k| i16_at(DIM + k * 2)),
            voxel_size: [0, 1, 2].map(|k| f32_at(VOXEL_SIZE + k * 4)),
            origin: [0, 1, 2].map(|k| f32_at(ORIGIN + k * 4)),
            n_scalars,
            scalar_names: names(SCALAR_NAME, n_scalars),
            n_properties,
            property_names: names(PROPERTY_NAME, n_properties),
            vox_to_ras: Affine(vox_to_ras),
            voxel_order: read_str(&bytes[VOXEL_ORDER..VOXEL_ORDER + 4]),
            image_orientation_patient: [0, 1, 2, 3, 4, 5]
                .map(|k| f32_at(IMAGE_ORIENTATION_PATIENT + k * 4)),
            flags,
            n_count: E::read_i32(&bytes[N_COUNT..N_COUNT + 4]),
            version: E::read_i32(&bytes[VERSION..VERSION + 4]),
            endianness: Endianness::native(),
        })
    }

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
        let put_f32 = |buf: &mut [u8], off: usize, v: f32| E::write_f32(&mut buf[off..off + 4], v);

        buf[ID_STRING..ID_STRING + 5].copy_from_slice(b"TRACK");
        for k in 0..3 {
            E::write_i16(&mut buf[DIM + k * 2..DIM + k * 2 + 2], self.dims[k]);
            put_f32(&mut buf, VOXEL_SIZE + k * 4, self.voxel_size[k]);
            put_f32(&mut buf, ORIGIN + k * 4, self.origin[k]);
        }
        // validate() bounds both counts to i16
        E::write_i16(&mut buf[N_SCALARS..N_SCALARS + 2], self.n_scalars as i16);
        E::write_i16(&mut buf[N_PROPERTIES..N_PROPERTIES + 2], self.n_properties as i16);
        for (i, name) in self.scalar_names.iter().take(MAX_NAMES).enumerate() {
            let at = SCALAR_NAME + i * NAME_LEN;
            write_str(&mut buf[at..at + NAME_LEN], name);
        }
        for (i, name) in self.property_names.iter().take(MAX_NAMES).enumerate() {
            let at = PROPERTY_NAME + i * NAME_LEN;
            write_str(&mut buf[at..at + NAME_LEN], name);
        }
        for (r, row) in self.vox_to_ras.0.iter().enumerate() {
            for (c, &v) in row.iter().enumerate() {
                put_f32(&mut buf, VOX_TO_RAS + (r * 4 + c) * 4, v as f32);
            }
        }
        let order = self.voxel_order.as_bytes();
        let len = order.len().min(4);
        buf[VOXEL_ORDER..VOXEL_ORDER + len].copy_from_slice(&order[..len]);
        for (k, &v) in self.image_orientation_patient.iter().enumerate() {
            put_f32(&mut buf, IMAGE_ORIENTATION_PATIENT + k * 4, v);
        }
        buf[INVERT_X..INVERT_X + 6].copy_from_slice(&self.flags);
        E::write_i32(&mut buf[N_COUNT..N_COUNT + 4], self.n_count);
        E::write_i32(&mut buf[VERSION..VERSION + 4], self.version);
        E::write_i32(&mut buf[HDR_SIZE..HDR_SIZE + 4], Self::SIZE as i32);
        buf
    }

    pub fn validate(&self) -> Result<()> {
        if let Some(v) = self.voxel_size.iter().find(|v| !(v.is_finite() && **v > 0.0)) {
            return Err(Error::MalformedHeader(format!(
                "voxel size must be positive, got {v}"
            )));
        }
        if self.n_scalars > i16::MAX as usize || self.n_properties > i16::MAX as usize {
            return Err(Error::MalformedHeader(format!(
                "{} scalars and {} properties exceed the record limits",
                self.n_scalars, self.n_properties
            )));
        }
        if self.n_count < 0 {
            return Err(Error::MalformedHeader(format!(
                "negative streamline count {}",
                self.n_count
            )));
        }
        if !(1..=3).contains(&self.version) {
            return Err(Error::MalformedHeader(format!(
                "unknown TrackVis version {}",
                self.version
            )));
        }
        Ok(())
    }

    /// Voxel to RAS+ mm, falling back to a scaled grid when unset.
    pub fn voxel_to_rasmm(&self) -> Affine {
        if self.vox_to_ras.0[3][3] == 0.0 {
            Affine::from_zooms(self.voxel_size.map(f64::from), [0.0; 3])
        } else {
            self.vox_to_ras
        }
    }

    /// Transform from stored voxmm points to RAS+ mm.
    pub fn to_rasmm(&self) -> Affine {
        let to_voxel = Affine::from_zooms(self.voxel_size.map(|v| 1.0 / f64::from(v)), [-0.5; 3]);
        self.voxel_to_rasmm().matmul(&to_voxel)
    }

    pub fn reference(&self) -> Reference {
        Reference {
            affine: self.voxel_to_rasmm(),
            dims: self.dims.map(|d| d.max(1) as usize),
        }
    }

    /// Adopt the grid of `reference`.
    pub fn set_reference(&mut self, reference: &Reference) -> Result<()> {
        let dims = reference.dims.map(i16::try_from);
        let [Ok(x), Ok(y), Ok(z)] = dims else {
            return Err(Error::IncompatibleConversion(format!(
                "reference dims {:?} exceed the TrackVis limit",
                reference.dims
            )));
        };
        self.dims = [x, y, z];
        self.voxel_size = reference.affine.zooms().map(|z| z as f32);
        self.vox_to_ras = reference.affine;
        self.voxel_order = orientation::aff2axcodes(&reference.affine).iter().collect();
        self.version = 2;
        Ok(())
    }

    /// Read one record; `None` at a clean end of file.
    pub(crate) fn read_streamline(&self, reader: &mut dyn Read) -> Result<Option<Streamline>> {
        match self.endianness {
            Endianness::Little => self.read_record::<LittleEndian>(reader),
            Endianness::Big => self.read_record::<BigEndian>(reader),
        }
    }

    fn read_record<E: ByteOrder>(&self, reader: &mut dyn Read) -> Result<Option<Streamline>> {
        let mut count = [0u8; 4];
        if !read_or_eof(reader, &mut count)? {
            return Ok(None);
        }
        let n_points = usize::try_from(E::read_i32(&count))
            .map_err(|_| Error::CorruptStream("negative point count in record".into()))?;
        let width = 3 + self.n_scalars;
        let byte_len = n_points
            .checked_mul(width)
            .and_then(|n| n.checked_add(self.n_properties))
            .and_then(|n| n.checked_mul(4))
            .ok_or_else(|| {
                Error::CorruptStream(format!("record of {n_points} points overflows"))
            })?;
        // grow with the bytes actually present, never from the declared count
        let mut raw = Vec::new();
        Read::take(&mut *reader, byte_len as u64)
            .read_to_end(&mut raw)
            .map_err(|e| Error::from_stream(e, "reading TrackVis record"))?;
        if raw.len() != byte_len {
            return Err(Error::CorruptStream(format!(
                "TrackVis record of {n_points} points ends after {} of {byte_len} bytes",
                raw.len()
            )));
        }
        let mut values = vec![0f32; byte_len / 4];
        E::read_f32_into(&raw, &mut values);

        let (point_values, properties) = values.split_at(n_points * width);
        let mut streamline = Streamline {
            points: Vec::with_capacity(n_points),
            scalars: Vec::new(),
            properties: properties.to_vec(),
        };
        for row in point_values.chunks_exact(width) {
            streamline.points.push([row[0], row[1], row[2]]);
            if self.n_scalars > 0 {
                streamline.scalars.push(row[3..].to_vec());
            }
        }
        Ok(Some(streamline))
    }

    fn write_record<E: ByteOrder>(&self, out: &mut Vec<u8>, streamline: &Streamline) -> Result<()> {
        let n_points = streamline.points.len();
        let scalars_fit = if self.n_scalars == 0 {
            streamline.scalars.is_empty()
        } else {
            streamline.scalars.len() == n_points
                && streamline.scalars.iter().all(|s| s.len() == self.n_scalars)
        };
        if !scalars_fit {
            return Err(Error::ShapeMismatch {
                expected: vec![n_points, self.n_scalars],
                actual: vec![
                    streamline.scalars.len(),
                    streamline.scalars.first().map_or(0, Vec::len),
                ],
            });
        }
        if streamline.properties.len() != self.n_properties {
            return Err(Error::ShapeMismatch {
                expected: vec![self.n_properties],
                actual: vec![streamline.properties.len()],
            });
        }
        let n = i32::try_from(n_points).map_err(|_| {
            Error::IncompatibleConversion(format!("streamline of {n_points} points"))
        })?;

        let mut word = [0u8; 4];
        E::write_i32(&mut word, n);
        out.extend_from_slice(&word);
        let mut push = |v: f32| {
            E::write_f32(&mut word, v);
            out.extend_from_slice(&word);
        };
        for (i, p) in streamline.points.iter().enumerate() {
            p.iter().copied().for_each(&mut push);
            if let Some(s) = streamline.scalars.get(i) {
                s.iter().copied().for_each(&mut push);
            }
        }
        streamline.properties.iter().copied().for_each(&mut push);
        Ok(())
    }
}

impl HeaderCodec for TrkHeader {
    fn decode(bytes: &[u8]) -> Result<Self> {
        Self::from_bytes(bytes)
    }

    fn encode(&self) -> Result<Vec<u8>> {
        self.to_bytes()
    }

    fn validate(&self) -> Result<()> {
        TrkHeader::validate(self)
    }

    fn default_affine(&self) -> Affine {
        self.voxel_to_rasmm()
    }
}

pub fn load_header(path: &Path) -> Result<TrkHeader> {
    let head = compression::read_head(path, TrkHeader::SIZE)?;
    if head.len() < TrkHeader::SIZE && head.starts_with(b"TRACK") {
        return Err(Error::CorruptStream(format!(
            "{} ends inside its header after {} bytes",
            path.display(),
            head.len()
        )));
    }
    TrkHeader::from_bytes(&head)
}

/// Encode a whole file; streamlines are in voxmm. The count is filled in
/// once every record is written.
pub(crate) fn encode<I>(header: &TrkHeader, streamlines: I) -> Result<(Vec<u8>, usize)>
where
    I: IntoIterator<Item = Result<Streamline>>,
{
    let mut out = vec![0u8; TrkHeader::SIZE];
    let mut count = 0usize;
    for streamline in streamlines {
        let streamline = streamline?;
        match header.endianness {
            Endianness::Little => header.write_record::<LittleEndian>(&mut out, &streamline)?,
            Endianness::Big => header.write_record::<BigEndian>(&mut out, &streamline)?,
        }
        count += 1;
    }
    let mut header = header.clone();
    header.n_count = i32::try_from(count).map_err(|_| {
        Error::IncompatibleConversion(format!("{count} streamlines exceed the TrackVis count"))
    })?;
    out[..TrkHeader::SIZE].copy_from_slice(&header.to_bytes()?);
    log::debug!("encoded {count} TrackVis records ({} bytes)", out.len());
    Ok((out, count))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn header() -> TrkHeader {
        TrkHeader {
            dims: [10, 12, 8],
            voxel_size: [2.0, 2.0, 2.5],
            n_scalars: 2,
            scalar_names: vec!["fa".into(), "md".into()],
            n_properties: 1,
            property_names: vec!["length".into()],
            vox_to_ras: Affine::from_zooms([2.0, 2.0, 2.5], [-10.0, -12.0, -10.0]),
            ..TrkHeader::default()
        }
    }

    #[test]
    fn header_roundtrip_both_byte_orders() {
        for endianness in [Endianness::Little, Endianness::Big] {
            let original = TrkHeader { endianness, n_count: 7, ..header() };
            let bytes = original.to_bytes().unwrap();
            assert_eq!(bytes.len(), TrkHeader::SIZE);
            assert_eq!(TrkHeader::from_bytes(&bytes).unwrap(), original);
        }
    }

    #[test]
    fn bad_size_is_malformed() {
        let mut bytes = header().to_bytes().unwrap();
        bytes[996..1000].copy_from_slice(&[1, 2, 3, 4]);
        assert!(matches!(TrkHeader::from_bytes(&bytes), Err(Error::MalformedHeader(_))));
        assert!(matches!(
            TrkHeader::from_bytes(&[0u8; 10]),
            Err(Error::MalformedHeader(_))
        ));
    }

    #[test]
    fn voxmm_maps_voxel_centres() {
        let h = header();
        // centre of voxel (0, 0, 0) in voxmm is half a voxel in
        let centre = h.to_rasmm().apply([1.0, 1.0, 1.25]);
        for (got, want) in centre.iter().zip([-10.0, -12.0, -10.0]) {
            assert!((got - want).abs() < 1e-9);
        }
    }

    #[test]
    fn records_roundtrip() {
        let h = header();
        let streamlines = vec![
            Streamline {
                points: vec![[1.0, 2.0, 3.0], [4.0, 5.0, 6.0]],
                scalars: vec![vec![0.5, 0.1], vec![0.6, 0.2]],
                properties: vec![12.5],
            },
            Streamline {
                points: vec![[7.0, 8.0, 9.0]],
                scalars: vec![vec![0.7, 0.3]],
                properties: vec![3.0],
            },
        ];
        let (bytes, count) = encode(&h, streamlines.clone().into_iter().map(Ok)).unwrap();
        assert_eq!(count, 2);
        let parsed = TrkHeader::from_bytes(&bytes).unwrap();
        assert_eq!(parsed.n_count, 2);

        let mut reader = &bytes[TrkHeader::SIZE..];
        let mut back = Vec::new();
        while let Some(s) = parsed.read_streamline(&mut reader).unwrap() {
            back.push(s);
        }
        assert_eq!(back, streamlines);
    }

    #[test]
    fn wrong_scalar_width_is_rejected() {
        let s = Streamline {
            points: vec![[0.0; 3]],
            scalars: vec![vec![1.0]],
            properties: vec![0.0],
        };
        assert!(matches!(
            encode(&header(), [Ok(s)]),
            Err(Error::ShapeMismatch { .. })
        ));
    }

    #[test]
    fn oversized_point_count_is_corrupt() {
        let h = header();
        let s = Streamline {
            points: vec![[0.0; 3]],
            scalars: vec![vec![0.0; 2]],
            properties: vec![1.0],
        };
        let (mut bytes, _) = encode(&h, [Ok(s)]).unwrap();
        bytes[TrkHeader::SIZE..TrkHeader::SIZE + 4].copy_from_slice(&i32::MAX.to_le_bytes());
        let mut reader = &bytes[TrkHeader::SIZE..];
        assert!(matches!(h.read_streamline(&mut reader), Err(Error::CorruptStream(_))));

        bytes[TrkHeader::SIZE..TrkHeader::SIZE + 4].copy_from_slice(&(-1i32).to_le_bytes());
        let mut reader = &bytes[TrkHeader::SIZE..];
        assert!(matches!(h.read_streamline(&mut reader), Err(Error::CorruptStream(_))));
    }

    #[test]
    fn file_ending_inside_header_is_corrupt() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("short.trk");
        let bytes = header().to_bytes().unwrap();
        std::fs::write(&path, &bytes[..600]).unwrap();
        assert!(matches!(load_header(&path), Err(Error::CorruptStream(_))));
    }

    #[test]
    fn truncated_record_is_corrupt() {
        let s = Streamline {
            points: vec![[0.0; 3], [1.0; 3]],
            scalars: vec![vec![0.0; 2], vec![0.0; 2]],
            properties: vec![1.0],
        };
        let (bytes, _) = encode(&header(), [Ok(s)]).unwrap();
        let mut reader = &bytes[TrkHeader::SIZE..bytes.len() - 6];
        assert!(matches!(
            header().read_streamline(&mut reader),
            Err(Error::CorruptStream(_))
        ));
    }
}
