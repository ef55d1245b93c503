//! Format-dispatching load and save entry points.

use crate::compression::Codec;
use crate::datatype::{DataType, Endianness};
use crate::error::{Error, Result};
use crate::image::{Header, ImageContainer};
use crate::nifti::NiftiVersion;
use crate::orientation;
use crate::registry::{self, Format};
use crate::{analyze, gifti, minc2, nifti, parrec};
use std::path::Path;

/// Compression level used when none is configured.
pub const DEFAULT_LEVEL: u32 = 6;

/// Options for writing an image.
#[derive(Debug, Clone, PartialEq)]
pub struct SaveOptions {
    /// Compression level, `0..=9`.
    pub compress_level: u32,
    /// Container compression; inferred from the file name when `None`.
    pub codec: Option<Codec>,
    /// Stored type; the image's own type when `None`.
    pub output_dtype: Option<DataType>,
    /// Byte order; the source header's order (or native) when `None`.
    pub endianness: Option<Endianness>,
}

impl Default for SaveOptions {
    fn default() -> Self {
        Self {
            compress_level: DEFAULT_LEVEL,
            codec: None,
            output_dtype: None,
            endianness: None,
        }
    }
}

impl SaveOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn compress_level(mut self, level: u32) -> Self {
        self.compress_level = level;
        self
    }

    pub fn codec(mut self, codec: Codec) -> Self {
        self.codec = Some(codec);
        self
    }

    pub fn output_dtype(mut self, dtype: DataType) -> Self {
        self.output_dtype = Some(dtype);
        self
    }

    pub fn endianness(mut self, endianness: Endianness) -> Self {
        self.endianness = Some(endianness);
        self
    }

    /// Codec for `path`: the configured one, else the file name suffix.
    pub(crate) fn codec_for(&self, path: &Path) -> Codec {
        self.codec.unwrap_or_else(|| Codec::from_path(path))
    }
}

/// Load any supported image file.
///
/// The format comes from the file content. Voxel data stays on disk until
/// requested through the returned container.
///
/// # Example
/// ```ignore
/// let img = medio::load("brain.nii.gz")?;
/// let data = img.get_fdata()?;
/// ```
#[must_use = "this function returns a loaded image that should be used"]
pub fn load(path: impl AsRef<Path>) -> Result<ImageContainer> {
    let path = path.as_ref();
    match registry::detect(path)? {
        Format::Nifti1 | Format::Nifti2 => nifti::load(path),
        Format::Analyze => analyze::load(path),
        Format::Minc2 => minc2::load(path),
        Format::ParRec => parrec::load(path),
        Format::Gifti => gifti::load(path),
        format @ (Format::Trk | Format::Tck) => Err(Error::IncompatibleConversion(format!(
            "{} is a {format} tractogram, not an image; use load_tractogram",
            path.display()
        ))),
    }
}

/// Read only the header of an image file.
pub fn load_header(path: impl AsRef<Path>) -> Result<Header> {
    let path = path.as_ref();
    match registry::detect(path)? {
        Format::Nifti1 | Format::Nifti2 => Ok(Header::Nifti(nifti::load_header(path)?.0)),
        Format::Analyze => Ok(Header::Analyze(analyze::load_header(path)?)),
        Format::Minc2 => Ok(Header::Minc2(minc2::load_header(path)?)),
        Format::ParRec => Ok(Header::ParRec(parrec::load_header(path)?)),
        Format::Gifti => Ok(Header::Gifti(Box::new(gifti::load_header(path)?))),
        format @ (Format::Trk | Format::Tck) => Err(Error::IncompatibleConversion(format!(
            "{} is a {format} tractogram, not an image",
            path.display()
        ))),
    }
}

/// Save with default options; the format follows the file name when `None`.
pub fn save(image: &ImageContainer, path: impl AsRef<Path>, format: Option<Format>) -> Result<()> {
    save_with(image, path, format, &SaveOptions::default())
}

/// Save an image, remapping axes when the target stores them differently.
///
/// The destination is replaced atomically; a failed save leaves it as it was.
pub fn save_with(
    image: &ImageContainer,
    path: impl AsRef<Path>,
    format: Option<Format>,
    options: &SaveOptions,
) -> Result<()> {
    let path = path.as_ref();
    let format = match format {
        Some(format) => format,
        None => Format::from_path(path)?,
    };
    if format.is_tractogram() {
        return Err(Error::IncompatibleConversion(format!(
            "cannot write an image as a {format} tractogram"
        )));
    }
    if !format.is_writable() {
        return Err(Error::IncompatibleConversion(format!(
            "{format} is a read-only format"
        )));
    }
    if let Header::Gifti(g) = image.header() {
        if format != Format::Gifti && g.arrays.len() > 1 {
            return Err(Error::IncompatibleConversion(format!(
                "GIFTI image with {} data arrays cannot be stored as one {format} volume",
                g.arrays.len()
            )));
        }
    }

    let remapped;
    let image = match orientation::remap(image.format(), format) {
        Some(ornt) if image.shape().len() >= 3 => {
            log::debug!("remapping axes from {} to {format} convention", image.format());
            remapped = image.reoriented(&ornt)?;
            &remapped
        }
        _ => image,
    };

    log::debug!("saving {} as {format}", path.display());
    match format {
        Format::Nifti1 => nifti::save(image, path, NiftiVersion::Nifti1, options),
        Format::Nifti2 => nifti::save(image, path, NiftiVersion::Nifti2, options),
        Format::Analyze => analyze::save(image, path, options),
        Format::Gifti => gifti::save(image, path, options),
        Format::Minc2 | Format::ParRec | Format::Trk | Format::Tck => Err(
            Error::IncompatibleConversion(format!("no image writer for {format}")),
        ),
    }
}
