//! The format-independent image: header, affine, lazy data and extensions.

use crate::affine::Affine;
use crate::analyze::AnalyzeHeader;
use crate::datatype::{ArrayData, DataType, Endianness, MemoryOrder};
use crate::error::{Error, Result};
use crate::gifti::GiftiImage;
use crate::io::SaveOptions;
use crate::minc2::Minc2Header;
use crate::nifti::{Extension, NiftiHeader, NiftiVersion};
use crate::orientation::{self, Ornt};
use crate::parrec::ParRecHeader;
use crate::proxy::{ArrayProxy, CachePolicy, Scaling};
use crate::registry::Format;
use crate::scaling::{ArrayWriter, ScalingCapability, WriteScaling};
use ndarray::ArrayD;
use std::ops::Range;
use std::path::{Path, PathBuf};

/// Capabilities every per-format header type provides.
pub trait HeaderCodec: Sized {
    /// Parse a header from its serialized bytes.
    fn decode(bytes: &[u8]) -> Result<Self>;

    /// Serialize in the format's own layout and byte order.
    fn encode(&self) -> Result<Vec<u8>>;

    /// Check field ranges; never clamps.
    fn validate(&self) -> Result<()>;

    /// Voxel-to-world affine implied by the header alone.
    fn default_affine(&self) -> Affine;
}

/// Kind of a non-fatal observation made while loading or updating an image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiagnosticKind {
    /// Two geometry encodings are set and disagree.
    GeometryDisagreement,
    /// A sheared affine could not be stored in the quaternion fields.
    QformDropped,
    /// The affine collapses a voxel axis to zero length.
    DegenerateAxis,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Diagnostic {
    pub kind: DiagnosticKind,
    pub message: String,
}

impl Diagnostic {
    /// Record and log a diagnostic.
    pub fn new(kind: DiagnosticKind, message: String) -> Self {
        log::warn!("{message}");
        Self { kind, message }
    }
}

/// Header of any supported image format.
#[derive(Debug, Clone, PartialEq)]
pub enum Header {
    Nifti(NiftiHeader),
    Analyze(AnalyzeHeader),
    Minc2(Minc2Header),
    ParRec(ParRecHeader),
    Gifti(Box<GiftiImage>),
}

impl Header {
    pub fn format(&self) -> Format {
        match self {
            Self::Nifti(h) => match h.version {
                NiftiVersion::Nifti1 => Format::Nifti1,
                NiftiVersion::Nifti2 => Format::Nifti2,
            },
            Self::Analyze(_) => Format::Analyze,
            Self::Minc2(_) => Format::Minc2,
            Self::ParRec(_) => Format::ParRec,
            Self::Gifti(_) => Format::Gifti,
        }
    }

    pub fn shape(&self) -> Vec<usize> {
        match self {
            Self::Nifti(h) => h.shape(),
            Self::Analyze(h) => h.shape(),
            Self::Minc2(h) => h.shape(),
            Self::ParRec(h) => h.shape(),
            Self::Gifti(g) => g.arrays.first().map_or_else(Vec::new, |a| a.dims.clone()),
        }
    }

    pub fn dtype(&self) -> DataType {
        match self {
            Self::Nifti(h) => h.datatype,
            Self::Analyze(h) => h.datatype,
            Self::Minc2(h) => h.dtype,
            Self::ParRec(h) => h.dtype(),
            Self::Gifti(g) => g.arrays.first().map_or(DataType::Float32, |a| a.dtype),
        }
    }

    /// Voxel sizes along each axis.
    pub fn zooms(&self) -> Vec<f64> {
        match self {
            Self::Nifti(h) => h.spacing(),
            Self::Analyze(h) => h.spacing(),
            Self::Minc2(h) => h.zooms(),
            Self::ParRec(h) => h.zooms(),
            Self::Gifti(g) => vec![1.0; g.arrays.first().map_or(0, |a| a.dims.len())],
        }
    }

    pub fn validate(&self) -> Result<()> {
        match self {
            Self::Nifti(h) => h.validate(),
            Self::Analyze(h) => HeaderCodec::validate(h),
            Self::Minc2(h) => HeaderCodec::validate(h),
            Self::ParRec(h) => HeaderCodec::validate(h),
            Self::Gifti(g) => HeaderCodec::validate(g.as_ref()),
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        match self {
            Self::Nifti(h) => h.encode(),
            Self::Analyze(h) => h.encode(),
            Self::Minc2(h) => h.encode(),
            Self::ParRec(h) => h.encode(),
            Self::Gifti(g) => g.encode(),
        }
    }

    pub fn default_affine(&self) -> Affine {
        match self {
            Self::Nifti(h) => h.default_affine(),
            Self::Analyze(h) => h.default_affine(),
            Self::Minc2(h) => h.default_affine(),
            Self::ParRec(h) => h.default_affine(),
            Self::Gifti(g) => g.default_affine(),
        }
    }

    /// Rewrite the geometry fields from `affine`.
    pub fn update_from_affine(&mut self, affine: &Affine) -> Result<Option<Diagnostic>> {
        match self {
            Self::Nifti(h) => Ok(h.set_affine(affine)),
            Self::Analyze(h) => h.set_affine(affine).map(|()| None),
            Self::Minc2(h) => h.set_affine(affine).map(|()| None),
            Self::ParRec(_) => {
                log::debug!("PAR/REC geometry is read-only; keeping the affine on the image");
                Ok(None)
            }
            Self::Gifti(g) => {
                g.set_affine(affine);
                Ok(None)
            }
        }
    }

    /// Header describing an array of `shape` and `dtype` with this header's
    /// metadata. Formats that cannot describe an arbitrary array become a
    /// NIfTI header.
    pub fn resized(&self, shape: &[usize], dtype: DataType) -> Result<Header> {
        match self {
            Self::Nifti(h) => {
                let mut h = h.clone();
                h.datatype = dtype;
                h.set_shape(shape)?;
                if h.version == NiftiVersion::Nifti1 && h.requires_nifti2() {
                    h.version = NiftiVersion::Nifti2;
                }
                Ok(Self::Nifti(h))
            }
            Self::Analyze(h) if AnalyzeHeader::supports(dtype) && shape.len() <= 7 => {
                let mut h = h.clone();
                h.datatype = dtype;
                h.set_shape(shape)?;
                Ok(Self::Analyze(h))
            }
            _ => {
                let mut h = NiftiHeader::for_shape(shape, dtype)?;
                for (p, z) in h.pixdim[1..].iter_mut().zip(self.zooms()) {
                    *p = z;
                }
                Ok(Self::Nifti(h))
            }
        }
    }
}

/// Header, affine, lazily read data and extensions of one image.
#[derive(Debug)]
pub struct ImageContainer {
    header: Header,
    affine: Affine,
    proxy: ArrayProxy,
    extensions: Vec<Extension>,
    diagnostics: Vec<Diagnostic>,
    path: Option<PathBuf>,
}

impl ImageContainer {
    /// Assemble a container, checking that header and proxy agree.
    pub fn from_parts(
        header: Header,
        affine: Affine,
        proxy: ArrayProxy,
        extensions: Vec<Extension>,
        diagnostics: Vec<Diagnostic>,
        path: Option<PathBuf>,
    ) -> Result<Self> {
        let declared = header.shape();
        if declared != proxy.shape() {
            return Err(Error::ShapeMismatch {
                expected: declared,
                actual: proxy.shape().to_vec(),
            });
        }
        if header.dtype() != proxy.dtype() {
            return Err(Error::UnsupportedDatatype(format!(
                "header declares {} but the data is {}",
                header.dtype(),
                proxy.dtype()
            )));
        }
        Ok(Self {
            header,
            affine,
            proxy,
            extensions,
            diagnostics,
            path,
        })
    }

    /// Image from an in-memory array with a minimal NIfTI header.
    ///
    /// Values are stored as `dtype` with rounding and saturation; use
    /// [`ImageContainer::get_data`] to read them back.
    pub fn from_array(array: &ArrayD<f64>, affine: Affine, dtype: DataType) -> Result<Self> {
        let mut header = NiftiHeader::for_shape(array.shape(), dtype)?;
        let diagnostics = header.set_affine(&affine).into_iter().collect();
        let proxy = ArrayProxy::from_array(array, dtype);
        Self::from_parts(Header::Nifti(header), affine, proxy, Vec::new(), diagnostics, None)
    }

    /// Image from a typed array; the stored type is the array's own.
    pub fn from_data(data: &ArrayData, affine: Affine) -> Result<Self> {
        Self::from_array(&data.to_f64(), affine, data.dtype())
    }

    /// Open any supported image file.
    pub fn from_source(path: impl AsRef<Path>) -> Result<Self> {
        crate::io::load(path)
    }

    /// Write to `path` as `format` (inferred from the name when `None`).
    pub fn to_sink(
        &self,
        path: impl AsRef<Path>,
        format: Option<Format>,
        options: &SaveOptions,
    ) -> Result<()> {
        crate::io::save_with(self, path, format, options)
    }

    pub fn header(&self) -> &Header {
        &self.header
    }

    pub fn affine(&self) -> &Affine {
        &self.affine
    }

    pub fn proxy(&self) -> &ArrayProxy {
        &self.proxy
    }

    pub fn shape(&self) -> &[usize] {
        self.proxy.shape()
    }

    /// Stored data type.
    pub fn dtype(&self) -> DataType {
        self.proxy.dtype()
    }

    pub fn zooms(&self) -> Vec<f64> {
        self.header.zooms()
    }

    pub fn format(&self) -> Format {
        self.header.format()
    }

    pub fn extensions(&self) -> &[Extension] {
        &self.extensions
    }

    pub fn diagnostics(&self) -> &[Diagnostic] {
        &self.diagnostics
    }

    /// File the image was read from.
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn add_extension(&mut self, extension: Extension) {
        self.extensions.push(extension);
    }

    /// Remove all extensions with `code`, returning how many were removed.
    pub fn remove_extensions(&mut self, code: i32) -> usize {
        let before = self.extensions.len();
        self.extensions.retain(|e| e.code != code);
        before - self.extensions.len()
    }

    pub fn find_extension(&self, code: i32) -> Option<&Extension> {
        self.extensions.iter().find(|e| e.code == code)
    }

    /// Keep (or stop keeping) the materialized array between calls.
    pub fn set_cache_policy(&mut self, policy: CachePolicy) {
        self.proxy.set_cache_policy(policy);
    }

    /// Drop the cached array, if any.
    pub fn uncache(&self) {
        self.proxy.uncache();
    }

    /// Scaled values as f64.
    pub fn get_fdata(&self) -> Result<ArrayD<f64>> {
        self.proxy.get_scaled()
    }

    /// Scaled values, as f64 or cast to `dtype` (rounded, saturated, NaN
    /// to zero for integer types).
    pub fn get_data(&self, dtype: Option<DataType>) -> Result<ArrayData> {
        let values = self.get_fdata()?;
        Ok(match dtype {
            None | Some(DataType::Float64) => ArrayData::Float64(values),
            Some(dtype) => ArrayData::from_f64(&values, dtype),
        })
    }

    /// Replace the affine and rewrite the header geometry to match.
    pub fn set_affine(&mut self, affine: Affine) -> Result<()> {
        self.affine = affine;
        self.update_header_from_affine()
    }

    /// Re-derive the header's geometry fields from the affine.
    pub fn update_header_from_affine(&mut self) -> Result<()> {
        if let Some(diagnostic) = self.header.update_from_affine(&self.affine)? {
            self.diagnostics.push(diagnostic);
        }
        Ok(())
    }

    /// Sub-image over per-axis half-open `ranges`, reading only those bytes.
    ///
    /// The new affine maps voxel 0 of the crop to where voxel `lo` of this
    /// image was. Non-spatial axes crop the data only.
    pub fn crop(&self, ranges: &[Range<usize>]) -> Result<ImageContainer> {
        let proxy = self.proxy.crop(ranges)?;
        let offset = [0, 1, 2].map(|i| ranges.get(i).map_or(0.0, |r| r.start as f64));
        let affine = self.affine.shifted(offset);
        log::debug!("cropped {:?} to {:?}", self.shape(), proxy.shape());
        let header = self.header.resized(proxy.shape(), proxy.dtype())?;
        let mut image = Self::from_parts(
            header,
            affine,
            proxy,
            self.extensions.clone(),
            Vec::new(),
            None,
        )?;
        image.update_header_from_affine()?;
        Ok(image)
    }

    /// Flip and permute the spatial axes by `ornt`, keeping world positions.
    ///
    /// Stored values move as they are under global scaling; per-slice scaled
    /// data is materialized to f64 first.
    pub fn reoriented(&self, ornt: &Ornt) -> Result<ImageContainer> {
        let shape = self.shape().to_vec();
        if shape.len() < 3 {
            return Err(Error::IncompatibleConversion(format!(
                "cannot reorient a {}-dimensional array",
                shape.len()
            )));
        }
        let (values, dtype, scaling) = match self.proxy.scaling() {
            Scaling::PerSlice(_) => (self.get_fdata()?, DataType::Float64, Scaling::None),
            scaling => (
                self.proxy.read_slice(&self.proxy.full_ranges())?.to_f64()?,
                self.dtype(),
                scaling.clone(),
            ),
        };
        let affine = self.affine.matmul(&orientation::inv_ornt_aff(ornt, &shape));
        let array = orientation::apply_orientation(values, ornt);
        let proxy = ArrayProxy::from_array(&array, dtype).with_scaling(scaling)?;
        let header = self.header.resized(proxy.shape(), dtype)?;
        let mut image = Self::from_parts(
            header,
            affine,
            proxy,
            self.extensions.clone(),
            Vec::new(),
            None,
        )?;
        image.update_header_from_affine()?;
        Ok(image)
    }

    /// Output type used when none is requested: the stored type, or f64
    /// when per-slice factors cannot be carried over.
    pub fn default_output_dtype(&self) -> DataType {
        match self.proxy.scaling() {
            Scaling::PerSlice(_) => DataType::Float64,
            _ => self.dtype(),
        }
    }

    /// Data bytes in Fortran order for a writer, with the scaling to record.
    ///
    /// Stored bytes pass through untouched when the type and layout already
    /// match and the target can record the scaling; otherwise values are
    /// materialized and fitted to `dtype` by an [`ArrayWriter`].
    pub(crate) fn encode_data(
        &self,
        dtype: DataType,
        capability: ScalingCapability,
        endianness: Endianness,
    ) -> Result<(Vec<u8>, WriteScaling)> {
        let passthrough = match self.proxy.scaling().global() {
            Some((slope, inter)) if dtype == self.dtype() && self.proxy.order() == MemoryOrder::Fortran => {
                let expressible = match capability {
                    ScalingCapability::SlopeInter => true,
                    ScalingCapability::Slope => inter == 0.0,
                    ScalingCapability::None => slope == 1.0 && inter == 0.0,
                };
                expressible.then_some(WriteScaling { slope, inter })
            }
            _ => None,
        };
        if let Some(scaling) = passthrough {
            log::debug!("writing stored {dtype} bytes unchanged");
            let block = self.proxy.read_slice(&self.proxy.full_ranges())?;
            return Ok((block.into_bytes(endianness), scaling));
        }

        let array = self.get_fdata()?;
        let values: Vec<f64> = array.t().iter().copied().collect();
        let source_is_float = self.dtype().is_float() || !self.proxy.scaling().is_identity();
        let writer = ArrayWriter::new(&values, dtype, capability, source_is_float);
        let scaling = writer.scaling()?;
        log::debug!(
            "writing {dtype} with slope {} and intercept {}",
            scaling.slope,
            scaling.inter
        );
        let stored = writer.apply(&values, &scaling);
        Ok((dtype.encode_values(&stored, endianness), scaling))
    }

    /// Release the data source now rather than at end of scope.
    pub fn close(self) {
        log::trace!("closing image {:?}", self.path);
    }
}
