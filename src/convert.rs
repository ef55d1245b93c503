//! Conversion between formats: crop, cast, axis remap and atomic write.
//!
//! # Example
//! ```ignore
//! use medio::{convert, ConversionSpec, CropRange, DataType};
//!
//! let spec = ConversionSpec::new()
//!     .output_dtype(DataType::Int16)
//!     .crop(vec![CropRange::new(10, 170), CropRange::full(), "20:150".parse()?]);
//! convert("scan.PAR", "scan.nii.gz", &spec)?;
//! ```

use crate::affine;
use crate::compression;
use crate::datatype::{DataType, Endianness};
use crate::error::{Error, Result};
use crate::io::{self, SaveOptions, DEFAULT_LEVEL};
use crate::registry::{self, Format};
use crate::streamlines::{self, Reference, StreamlineReader, TractogramHeader};
use rayon::prelude::*;
use std::fmt;
use std::ops::Range;
use std::path::{Path, PathBuf};
use std::str::FromStr;

/// Half-open `[lo, hi)` index range along one axis; `hi` defaults to the
/// axis length.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CropRange {
    pub lo: usize,
    pub hi: Option<usize>,
}

impl CropRange {
    pub fn new(lo: usize, hi: usize) -> Self {
        Self { lo, hi: Some(hi) }
    }

    /// The whole axis.
    pub fn full() -> Self {
        Self::default()
    }

    /// Concrete range on an axis of length `len`.
    pub fn resolve(&self, len: usize) -> Result<Range<usize>> {
        let hi = self.hi.unwrap_or(len);
        if self.lo >= hi || hi > len {
            return Err(Error::InvalidCropRegion(format!(
                "[{}, {hi}) on an axis of length {len}",
                self.lo
            )));
        }
        Ok(self.lo..hi)
    }
}

impl fmt::Display for CropRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.hi {
            Some(hi) => write!(f, "{}:{hi}", self.lo),
            None => write!(f, "{}:", self.lo),
        }
    }
}

impl FromStr for CropRange {
    type Err = Error;

    /// Parse `lo:hi`, where either side may be empty.
    fn from_str(s: &str) -> Result<Self> {
        let (lo, hi) = s.split_once(':').ok_or_else(|| {
            Error::Configuration(format!("crop range '{s}' is not of the form lo:hi"))
        })?;
        let bound = |text: &str| -> Result<Option<usize>> {
            let text = text.trim();
            if text.is_empty() {
                return Ok(None);
            }
            text.parse()
                .map(Some)
                .map_err(|_| Error::Configuration(format!("crop bound '{text}' is not an index")))
        };
        Ok(Self {
            lo: bound(lo)?.unwrap_or(0),
            hi: bound(hi)?,
        })
    }
}

/// Options for [`convert`]. Immutable once built.
#[derive(Debug, Clone, PartialEq)]
pub struct ConversionSpec {
    /// Target format; inferred from the sink name when `None`.
    pub format: Option<Format>,
    /// Stored type of the target; the source's when `None`.
    pub output_dtype: Option<DataType>,
    /// Compression level, `0..=9`.
    pub compress_level: u32,
    /// Per-axis ranges; missing trailing axes are kept whole.
    pub crop: Option<Vec<CropRange>>,
    /// Target grid for tractograms.
    pub reference: Option<Reference>,
    /// Byte order of the target; the source's (or native) when `None`.
    pub endianness: Option<Endianness>,
}

impl Default for ConversionSpec {
    fn default() -> Self {
        Self {
            format: None,
            output_dtype: None,
            compress_level: DEFAULT_LEVEL,
            crop: None,
            reference: None,
            endianness: None,
        }
    }
}

impl ConversionSpec {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn format(mut self, format: Format) -> Self {
        self.format = Some(format);
        self
    }

    pub fn output_dtype(mut self, dtype: DataType) -> Self {
        self.output_dtype = Some(dtype);
        self
    }

    pub fn compress_level(mut self, level: u32) -> Self {
        self.compress_level = level;
        self
    }

    pub fn crop(mut self, ranges: Vec<CropRange>) -> Self {
        self.crop = Some(ranges);
        self
    }

    pub fn reference(mut self, reference: Reference) -> Self {
        self.reference = Some(reference);
        self
    }

    pub fn endianness(mut self, endianness: Endianness) -> Self {
        self.endianness = Some(endianness);
        self
    }

    /// Index ranges for an image of `shape`.
    pub fn crop_ranges(&self, shape: &[usize]) -> Result<Option<Vec<Range<usize>>>> {
        let Some(crop) = &self.crop else {
            return Ok(None);
        };
        if crop.len() > shape.len() {
            return Err(Error::InvalidCropRegion(format!(
                "{} crop ranges for a {}-dimensional image",
                crop.len(),
                shape.len()
            )));
        }
        shape
            .iter()
            .enumerate()
            .map(|(axis, &len)| crop.get(axis).copied().unwrap_or_default().resolve(len))
            .collect::<Result<Vec<_>>>()
            .map(Some)
    }

    fn save_options(&self) -> SaveOptions {
        SaveOptions {
            compress_level: self.compress_level,
            codec: None,
            output_dtype: self.output_dtype,
            endianness: self.endianness,
        }
    }
}

/// Convert `source` into `sink` according to `spec`.
///
/// Images are cropped (reading only the covered bytes), cast, remapped to
/// the target's axis convention and written atomically. Tractograms are
/// streamed record by record into the target layout, re-expressed in the
/// target's coordinates.
pub fn convert(source: impl AsRef<Path>, sink: impl AsRef<Path>, spec: &ConversionSpec) -> Result<()> {
    let (source, sink) = (source.as_ref(), sink.as_ref());
    compression::check_level(spec.compress_level)?;
    let source_format = registry::detect(source)?;
    let target = match spec.format {
        Some(format) => format,
        None => Format::from_path(sink)?,
    };
    if source_format.is_tractogram() != target.is_tractogram() {
        return Err(Error::IncompatibleConversion(format!(
            "cannot convert {source_format} into {target}"
        )));
    }
    log::debug!(
        "converting {} ({source_format}) to {} ({target})",
        source.display(),
        sink.display()
    );

    if target.is_tractogram() {
        return convert_tractogram(source, sink, target, spec);
    }

    let image = io::load(source)?;
    let image = match spec.crop_ranges(image.shape())? {
        Some(ranges) => image.crop(&ranges)?,
        None => image,
    };
    io::save_with(&image, sink, Some(target), &spec.save_options())
}

fn convert_tractogram(source: &Path, sink: &Path, target: Format, spec: &ConversionSpec) -> Result<()> {
    if spec.crop.is_some() {
        return Err(Error::Configuration(
            "cropping applies to images, not tractograms".into(),
        ));
    }
    if let Some(dtype) = spec.output_dtype {
        log::debug!("ignoring output type {dtype} for a tractogram");
    }
    let reader = StreamlineReader::open(source)?;
    let header = TractogramHeader::for_target(target, Some(reader.header()), spec.reference.as_ref())?;
    let transform = affine::compose(&reader.header().to_rasmm(), &header.to_rasmm())?;
    let count = streamlines::write_streamlines(
        &header,
        reader.with_transform(transform),
        sink,
        &spec.save_options(),
    )?;
    log::debug!("converted {count} streamlines");
    Ok(())
}

/// Run independent conversions on the rayon pool.
///
/// Results come back in job order; one failure does not stop the others.
pub fn convert_batch(jobs: &[(PathBuf, PathBuf)], spec: &ConversionSpec) -> Vec<Result<()>> {
    jobs.par_iter()
        .map(|(source, sink)| convert(source, sink, spec))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_crop_ranges() {
        assert_eq!("2:8".parse::<CropRange>().unwrap(), CropRange::new(2, 8));
        assert_eq!(":5".parse::<CropRange>().unwrap(), CropRange { lo: 0, hi: Some(5) });
        assert_eq!("3:".parse::<CropRange>().unwrap(), CropRange { lo: 3, hi: None });
        assert_eq!(":".parse::<CropRange>().unwrap(), CropRange::full());
        assert!(matches!("7".parse::<CropRange>(), Err(Error::Configuration(_))));
        assert!(matches!("a:4".parse::<CropRange>(), Err(Error::Configuration(_))));
        assert_eq!(CropRange::new(1, 4).to_string(), "1:4");
    }

    #[test]
    fn resolve_checks_bounds() {
        assert_eq!(CropRange::new(2, 8).resolve(10).unwrap(), 2..8);
        assert_eq!(CropRange::full().resolve(10).unwrap(), 0..10);
        assert!(matches!(CropRange::new(4, 4).resolve(10), Err(Error::InvalidCropRegion(_))));
        assert!(matches!(CropRange::new(0, 11).resolve(10), Err(Error::InvalidCropRegion(_))));
    }

    #[test]
    fn trailing_axes_stay_whole() {
        let spec = ConversionSpec::new().crop(vec![CropRange::new(2, 8)]);
        assert_eq!(spec.crop_ranges(&[10, 10, 10]).unwrap(), Some(vec![2..8, 0..10, 0..10]));
        let too_many = ConversionSpec::new().crop(vec![CropRange::full(); 4]);
        assert!(matches!(too_many.crop_ranges(&[10, 10, 10]), Err(Error::InvalidCropRegion(_))));
        assert_eq!(ConversionSpec::new().crop_ranges(&[4]).unwrap(), None);
    }

    #[test]
    fn bad_level_is_configuration_error() {
        let dir = tempfile::tempdir().unwrap();
        let spec = ConversionSpec::new().compress_level(12);
        let result = convert(dir.path().join("a.nii"), dir.path().join("b.nii"), &spec);
        assert!(matches!(result, Err(Error::Configuration(_))));
    }
}
