//! `NIfTI` file format support.
//!
//! `NIfTI` (Neuroimaging Informatics Technology Initiative) is a standard format
//! for neuroimaging data. This module reads and writes NIfTI-1 and NIfTI-2 as
//! single `.nii` files or `.hdr`/`.img` pairs, optionally gzip or zstd
//! compressed, with header extensions kept verbatim.

pub mod extension;
pub mod header;

pub use extension::Extension;
pub use header::{NiftiHeader, NiftiVersion, SpatialUnits, TemporalUnits};

use crate::compression;
use crate::datatype::{Endianness, MemoryOrder};
use crate::error::{Error, Result};
use crate::image::{Header, ImageContainer};
use crate::io::SaveOptions;
use crate::proxy::{ArrayProxy, DataSource, Scaling};
use crate::registry;
use crate::scaling::ScalingCapability;
use std::path::Path;

/// Enough leading bytes for either header version plus its extender.
const HEAD_LEN: usize = NiftiHeader::SIZE_V2 + 4;

/// Load a NIfTI image from file.
///
/// Supports `.nii`, `.nii.gz`, `.nii.zst` and `.hdr`/`.img` pairs. Voxel
/// data of uncompressed files is memory-mapped.
///
/// # Example
/// ```ignore
/// let img = medio::nifti::load("brain.nii.gz")?;
/// let data = img.get_fdata()?;
/// ```
#[must_use = "this function returns a loaded image that should be used"]
pub fn load(path: &Path) -> Result<ImageContainer> {
    let (header, extensions) = load_header(path)?;
    let data_path = if header.pair {
        registry::resolve_pair(path)?
            .map(|(_, data)| data)
            .ok_or_else(|| {
                Error::MalformedHeader(format!(
                    "{} declares a separate data file but has no .hdr/.img name",
                    path.display()
                ))
            })?
    } else {
        path.to_path_buf()
    };

    let source = DataSource::open(&data_path)?;
    let proxy = ArrayProxy::new(
        source,
        header.shape(),
        header.datatype,
        header.vox_offset as u64,
        MemoryOrder::Fortran,
        header.endianness,
        Scaling::from_slope_inter(header.scl_slope, header.scl_inter),
    )?;
    let (affine, diagnostic) = header.best_affine();
    log::debug!(
        "loaded {:?} {} header for {:?} {}",
        header.version,
        if header.pair { "pair" } else { "single-file" },
        header.shape(),
        header.datatype
    );
    ImageContainer::from_parts(
        Header::Nifti(header),
        affine,
        proxy,
        extensions,
        diagnostic.into_iter().collect(),
        Some(path.to_path_buf()),
    )
}

/// Read the header and extensions without touching the voxel data.
pub fn load_header(path: &Path) -> Result<(NiftiHeader, Vec<Extension>)> {
    if let Some((header_path, _)) = registry::resolve_pair(path)? {
        let bytes = compression::read_decompressed(&header_path)?;
        let header = NiftiHeader::from_bytes(&bytes)?;
        let extensions = extension::parse(&bytes[header.header_size()..], header.endianness)?;
        return Ok((header, extensions));
    }

    let mut head = compression::read_head(path, HEAD_LEN)?;
    let header = NiftiHeader::from_bytes(&head)?;
    let vox_offset = header.vox_offset as usize;
    if vox_offset > head.len() {
        head = compression::read_head(path, vox_offset)?;
    }
    let end = vox_offset.min(head.len());
    let extensions = match head.get(header.header_size()..end) {
        Some(tail) => extension::parse(tail, header.endianness)?,
        None => Vec::new(),
    };
    Ok((header, extensions))
}

/// NIfTI header describing `image` as stored with `version`.
pub(crate) fn header_for(image: &ImageContainer, version: NiftiVersion) -> Result<NiftiHeader> {
    let shape = image.shape();
    if shape.len() > 7 {
        return Err(Error::IncompatibleConversion(format!(
            "NIfTI stores at most 7 dimensions, image has {}",
            shape.len()
        )));
    }
    let mut header = match image.header() {
        Header::Nifti(h) => h.clone(),
        _ => {
            let mut h = NiftiHeader::default();
            for (p, z) in h.pixdim[1..].iter_mut().zip(image.zooms()) {
                *p = z;
            }
            h
        }
    };
    header.version = version;
    header.set_shape(shape)?;
    if version == NiftiVersion::Nifti1 && header.requires_nifti2() {
        return Err(Error::IncompatibleConversion(format!(
            "dimensions {shape:?} exceed the NIfTI-1 limit of 32767; write NIfTI-2"
        )));
    }
    header.set_affine(image.affine());
    Ok(header)
}

/// Write `image` as NIfTI.
///
/// A `.hdr`/`.img` name writes a pair (`ni1`/`ni2` magic, data at offset
/// 0); anything else writes a single file with the data after the header
/// and extensions, aligned to 16 bytes.
pub fn save(
    image: &ImageContainer,
    path: &Path,
    version: NiftiVersion,
    options: &SaveOptions,
) -> Result<()> {
    let dtype = options
        .output_dtype
        .unwrap_or_else(|| image.default_output_dtype());
    let endianness = options.endianness.unwrap_or(match image.header() {
        Header::Nifti(h) => h.endianness,
        _ => Endianness::native(),
    });
    let mut header = header_for(image, version)?;
    header.datatype = dtype;
    header.endianness = endianness;

    let (data, scaling) = image.encode_data(dtype, ScalingCapability::SlopeInter, endianness)?;
    header.scl_slope = scaling.slope;
    header.scl_inter = scaling.inter;

    let extensions = extension::encode(image.extensions(), endianness);
    let codec = options.codec_for(path);
    match registry::paired_paths(path) {
        Some((header_path, data_path)) => {
            header.pair = true;
            header.vox_offset = 0;
            let mut head = header.to_bytes()?;
            head.extend_from_slice(&extensions);
            // data first, so a header never points at a missing image file
            compression::write_atomic(&data_path, &data, codec, options.compress_level)?;
            compression::write_atomic(&header_path, &head, codec, options.compress_level)
        }
        None => {
            header.pair = false;
            let vox_offset = (header.header_size() + extensions.len()).div_ceil(16) * 16;
            header.vox_offset = vox_offset as i64;
            let mut payload = Vec::with_capacity(vox_offset + data.len());
            payload.extend_from_slice(&header.to_bytes()?);
            payload.extend_from_slice(&extensions);
            payload.resize(vox_offset, 0);
            payload.extend_from_slice(&data);
            compression::write_atomic(path, &payload, codec, options.compress_level)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::affine::Affine;
    use crate::datatype::DataType;
    use ndarray::{ArrayD, IxDyn};

    fn sample_image(dtype: DataType) -> ImageContainer {
        let array = ArrayD::from_shape_fn(IxDyn(&[5, 4, 3]), |ix| (ix[0] + 10 * ix[1] + 100 * ix[2]) as f64);
        let affine = Affine::from_zooms([-1.5, 1.5, 2.0], [40.0, -30.0, -20.0]);
        ImageContainer::from_array(&array, affine, dtype).unwrap()
    }

    #[test]
    fn single_file_roundtrip_with_extensions() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("vol.nii.gz");
        let mut image = sample_image(DataType::Int16);
        image.add_extension(Extension::text(extension::codes::COMMENT, "processed"));
        save(&image, &path, NiftiVersion::Nifti1, &SaveOptions::default()).unwrap();

        let loaded = load(&path).unwrap();
        assert_eq!(loaded.shape(), &[5, 4, 3]);
        assert_eq!(loaded.dtype(), DataType::Int16);
        assert_eq!(loaded.get_fdata().unwrap(), image.get_fdata().unwrap());
        assert!(loaded.affine().approx_eq(image.affine(), 1e-5));
        assert_eq!(loaded.extensions().len(), 1);
        assert_eq!(loaded.extensions()[0].as_text(), "processed");
        let Header::Nifti(h) = loaded.header() else {
            panic!("expected a NIfTI header");
        };
        assert_eq!(h.vox_offset, 368);
    }

    #[test]
    fn pair_roundtrip_big_endian() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("vol.img");
        let image = sample_image(DataType::Float32);
        let options = SaveOptions::default().endianness(Endianness::Big);
        save(&image, &path, NiftiVersion::Nifti1, &options).unwrap();
        assert!(dir.path().join("vol.hdr").exists());

        let loaded = load(&dir.path().join("vol.hdr")).unwrap();
        let Header::Nifti(h) = loaded.header() else {
            panic!("expected a NIfTI header");
        };
        assert!(h.pair);
        assert_eq!(h.endianness, Endianness::Big);
        assert_eq!(h.vox_offset, 0);
        assert_eq!(loaded.get_fdata().unwrap(), image.get_fdata().unwrap());
    }

    #[test]
    fn nifti2_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("vol.nii");
        let image = sample_image(DataType::UInt16);
        save(&image, &path, NiftiVersion::Nifti2, &SaveOptions::default()).unwrap();
        let loaded = load(&path).unwrap();
        assert_eq!(loaded.format(), crate::registry::Format::Nifti2);
        assert_eq!(loaded.get_fdata().unwrap(), image.get_fdata().unwrap());
        assert!(loaded.affine().approx_eq(image.affine(), 1e-9));
    }

    #[test]
    fn float_data_into_uint8_is_scaled() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("scaled.nii");
        let array = ArrayD::from_shape_fn(IxDyn(&[4, 4, 4]), |ix| ix[0] as f64 * 0.37 - 0.5);
        let image = ImageContainer::from_array(&array, Affine::identity(), DataType::Float32).unwrap();
        let options = SaveOptions::default().output_dtype(DataType::UInt8);
        save(&image, &path, NiftiVersion::Nifti1, &options).unwrap();

        let loaded = load(&path).unwrap();
        let Header::Nifti(h) = loaded.header() else {
            panic!("expected a NIfTI header");
        };
        assert_eq!(loaded.dtype(), DataType::UInt8);
        assert!(h.scl_slope > 0.0 && h.scl_slope != 1.0);
        let back = loaded.get_fdata().unwrap();
        let original = image.get_fdata().unwrap();
        for (a, b) in back.iter().zip(original.iter()) {
            assert!((a - b).abs() <= h.scl_slope);
        }
    }

    #[test]
    fn truncated_data_is_corrupt() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("short.nii");
        save(&sample_image(DataType::Int32), &path, NiftiVersion::Nifti1, &SaveOptions::default())
            .unwrap();
        let bytes = std::fs::read(&path).unwrap();
        std::fs::write(&path, &bytes[..bytes.len() - 10]).unwrap();
        assert!(matches!(load(&path), Err(Error::CorruptStream(_))));
    }
}
