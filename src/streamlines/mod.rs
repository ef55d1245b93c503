//! Tractography streamlines: TrackVis `.trk` and MRtrix `.tck`.
//!
//! Streamlines are read lazily through [`StreamlineReader`], one record at
//! a time, and written in the target's record layout. [`Tractogram`] is the
//! eager form holding every streamline in RAS+ mm.

pub mod tck;
pub mod trk;

pub use tck::{TckDataType, TckHeader};
pub use trk::TrkHeader;

use crate::affine::{self, Affine};
use crate::compression;
use crate::error::{Error, Result};
use crate::image::ImageContainer;
use crate::io::SaveOptions;
use crate::registry::{self, Format};
use std::io::Read;
use std::path::{Path, PathBuf};

/// One tractography path.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Streamline {
    pub points: Vec<[f32; 3]>,
    /// One row of per-point values for each point, or empty.
    pub scalars: Vec<Vec<f32>>,
    pub properties: Vec<f32>,
}

impl Streamline {
    pub fn new(points: Vec<[f32; 3]>) -> Self {
        Self {
            points,
            ..Self::default()
        }
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    /// Points mapped through `affine`; scalars and properties unchanged.
    pub fn transformed(&self, affine: &Affine) -> Self {
        let points = self
            .points
            .iter()
            .map(|p| affine.apply(p.map(f64::from)).map(|v| v as f32))
            .collect();
        Self {
            points,
            scalars: self.scalars.clone(),
            properties: self.properties.clone(),
        }
    }
}

/// Voxel grid a tractogram is registered to.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Reference {
    /// Voxel index to RAS+ mm.
    pub affine: Affine,
    pub dims: [usize; 3],
}

impl Reference {
    pub fn new(affine: Affine, dims: [usize; 3]) -> Self {
        Self { affine, dims }
    }

    /// Grid of the first three axes of `image`.
    pub fn from_image(image: &ImageContainer) -> Result<Self> {
        let &[x, y, z, ..] = image.shape() else {
            return Err(Error::IncompatibleConversion(format!(
                "reference image of shape {:?} is not a volume",
                image.shape()
            )));
        };
        Ok(Self::new(*image.affine(), [x, y, z]))
    }
}

/// Header of either tractogram format.
#[derive(Debug, Clone, PartialEq)]
pub enum TractogramHeader {
    Trk(TrkHeader),
    Tck(TckHeader),
}

impl TractogramHeader {
    pub fn format(&self) -> Format {
        match self {
            Self::Trk(_) => Format::Trk,
            Self::Tck(_) => Format::Tck,
        }
    }

    /// Declared streamline count, when the file records one.
    pub fn count(&self) -> Option<usize> {
        match self {
            Self::Trk(h) => usize::try_from(h.n_count).ok().filter(|&n| n > 0),
            Self::Tck(h) => Some(h.count),
        }
    }

    /// Transform from stored point coordinates to RAS+ mm.
    pub fn to_rasmm(&self) -> Affine {
        match self {
            Self::Trk(h) => h.to_rasmm(),
            Self::Tck(_) => Affine::identity(),
        }
    }

    pub fn reference(&self) -> Option<Reference> {
        match self {
            Self::Trk(h) => Some(h.reference()),
            Self::Tck(_) => None,
        }
    }

    fn data_offset(&self) -> u64 {
        match self {
            Self::Trk(_) => TrkHeader::SIZE as u64,
            Self::Tck(h) => h.offset as u64,
        }
    }

    fn read_streamline(&self, reader: &mut dyn Read) -> Result<Option<Streamline>> {
        match self {
            Self::Trk(h) => h.read_streamline(reader),
            Self::Tck(h) => h.read_streamline(reader),
        }
    }

    /// Header for writing `format`, carrying over what `source` can keep.
    ///
    /// TCK has no room for scalars or properties; a TrackVis source that
    /// declares them cannot become TCK.
    pub fn for_target(
        format: Format,
        source: Option<&TractogramHeader>,
        reference: Option<&Reference>,
    ) -> Result<Self> {
        match (format, source) {
            (Format::Trk, Some(Self::Trk(h))) => {
                let mut h = h.clone();
                if let Some(reference) = reference {
                    h.set_reference(reference)?;
                }
                Ok(Self::Trk(h))
            }
            (Format::Trk, _) => {
                let mut h = TrkHeader::default();
                if let Some(reference) = reference.copied().or_else(|| source.and_then(Self::reference)) {
                    h.set_reference(&reference)?;
                }
                Ok(Self::Trk(h))
            }
            (Format::Tck, Some(Self::Trk(h))) if h.n_scalars > 0 || h.n_properties > 0 => {
                Err(Error::IncompatibleConversion(format!(
                    "TCK cannot store {} per-point scalars and {} properties",
                    h.n_scalars, h.n_properties
                )))
            }
            (Format::Tck, Some(Self::Tck(h))) => Ok(Self::Tck(h.clone())),
            (Format::Tck, _) => Ok(Self::Tck(TckHeader::default())),
            (format, _) => Err(Error::IncompatibleConversion(format!(
                "{format} is an image format, not a tractogram"
            ))),
        }
    }

    fn with_endianness(mut self, options: &SaveOptions) -> Self {
        if let Some(endianness) = options.endianness {
            match &mut self {
                Self::Trk(h) => h.endianness = endianness,
                Self::Tck(h) => h.endianness = endianness,
            }
        }
        self
    }
}

/// Read exactly `buf.len()` bytes; `false` on a clean end of stream before
/// the first byte, `CorruptStream` when the stream stops part way.
pub(crate) fn read_or_eof(reader: &mut dyn Read, buf: &mut [u8]) -> Result<bool> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => {}
            Err(e) => return Err(Error::from_stream(e, "reading streamline data")),
        }
    }
    match filled {
        0 => Ok(false),
        n if n == buf.len() => Ok(true),
        n => Err(Error::CorruptStream(format!(
            "streamline data ends after {n} of {} bytes",
            buf.len()
        ))),
    }
}

/// Read the header of a `.trk` or `.tck` file.
pub fn load_header(path: &Path) -> Result<TractogramHeader> {
    match registry::detect(path)? {
        Format::Trk => Ok(TractogramHeader::Trk(trk::load_header(path)?)),
        Format::Tck => Ok(TractogramHeader::Tck(tck::load_header(path)?)),
        format => Err(Error::IncompatibleConversion(format!(
            "{} is a {format} image, not a tractogram",
            path.display()
        ))),
    }
}

/// Lazy, restartable iterator over the streamlines of a file.
///
/// Yields stored coordinates unless a transform is set, e.g. with
/// [`StreamlineReader::to_rasmm`].
pub struct StreamlineReader {
    path: PathBuf,
    header: TractogramHeader,
    reader: Box<dyn Read + Send>,
    transform: Option<Affine>,
    done: bool,
}

impl StreamlineReader {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let header = load_header(path)?;
        let reader = Self::open_data(path, &header)?;
        log::debug!("streaming {} from {}", header.format(), path.display());
        Ok(Self {
            path: path.to_path_buf(),
            header,
            reader,
            transform: None,
            done: false,
        })
    }

    fn open_data(path: &Path, header: &TractogramHeader) -> Result<Box<dyn Read + Send>> {
        let mut reader = compression::open_reader(path)?;
        compression::skip(&mut reader, header.data_offset())?;
        Ok(reader)
    }

    pub fn header(&self) -> &TractogramHeader {
        &self.header
    }

    /// Yield points in RAS+ mm.
    pub fn to_rasmm(self) -> Self {
        let transform = self.header.to_rasmm();
        self.with_transform(transform)
    }

    /// Map every yielded point through `affine`.
    pub fn with_transform(mut self, affine: Affine) -> Self {
        self.transform = Some(affine);
        self
    }

    /// Go back to the first record.
    pub fn restart(&mut self) -> Result<()> {
        self.reader = Self::open_data(&self.path, &self.header)?;
        self.done = false;
        Ok(())
    }
}

impl Iterator for StreamlineReader {
    type Item = Result<Streamline>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        match self.header.read_streamline(&mut self.reader) {
            Ok(Some(streamline)) => Some(Ok(match &self.transform {
                Some(affine) => streamline.transformed(affine),
                None => streamline,
            })),
            Ok(None) => {
                self.done = true;
                None
            }
            Err(e) => {
                self.done = true;
                Some(Err(e))
            }
        }
    }
}

/// Every streamline of a file, in RAS+ mm.
#[derive(Debug, Clone, PartialEq)]
pub struct Tractogram {
    pub header: TractogramHeader,
    pub streamlines: Vec<Streamline>,
}

impl Tractogram {
    /// TCK-style tractogram of RAS+ mm streamlines.
    pub fn new(streamlines: Vec<Streamline>) -> Self {
        Self {
            header: TractogramHeader::Tck(TckHeader::default()),
            streamlines,
        }
    }

    pub fn len(&self) -> usize {
        self.streamlines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.streamlines.is_empty()
    }
}

pub fn load_tractogram(path: impl AsRef<Path>) -> Result<Tractogram> {
    let reader = StreamlineReader::open(path)?.to_rasmm();
    let header = reader.header().clone();
    let streamlines = reader.collect::<Result<Vec<_>>>()?;
    if let Some(declared) = header.count() {
        if declared != streamlines.len() {
            log::warn!(
                "header declares {declared} streamlines, file holds {}",
                streamlines.len()
            );
        }
    }
    Ok(Tractogram { header, streamlines })
}

/// Save with default options; the format follows the file name when `None`.
pub fn save_tractogram(
    tractogram: &Tractogram,
    path: impl AsRef<Path>,
    format: Option<Format>,
) -> Result<()> {
    save_tractogram_with(tractogram, path, format, None, &SaveOptions::default())
}

/// Save registered to `reference` (TrackVis), or to the source's own grid.
pub fn save_tractogram_with(
    tractogram: &Tractogram,
    path: impl AsRef<Path>,
    format: Option<Format>,
    reference: Option<&Reference>,
    options: &SaveOptions,
) -> Result<()> {
    let path = path.as_ref();
    let format = match format {
        Some(format) => format,
        None => Format::from_path(path)?,
    };
    let header = TractogramHeader::for_target(format, Some(&tractogram.header), reference)?;
    let to_file = affine::compose(&Affine::identity(), &header.to_rasmm())?;
    let streamlines = tractogram
        .streamlines
        .iter()
        .map(|s| Ok(s.transformed(&to_file)));
    write_streamlines(&header, streamlines, path, options)?;
    Ok(())
}

/// Write streamlines already in `header`'s stored coordinates.
///
/// The declared count is set from what was written. Returns that count.
pub fn write_streamlines<I>(
    header: &TractogramHeader,
    streamlines: I,
    path: &Path,
    options: &SaveOptions,
) -> Result<usize>
where
    I: IntoIterator<Item = Result<Streamline>>,
{
    let header = header.clone().with_endianness(options);
    let (payload, count) = match &header {
        TractogramHeader::Trk(h) => trk::encode(h, streamlines)?,
        TractogramHeader::Tck(h) => tck::encode(h, streamlines)?,
    };
    compression::write_atomic(path, &payload, options.codec_for(path), options.compress_level)?;
    log::debug!("wrote {count} streamlines to {}", path.display());
    Ok(count)
}
