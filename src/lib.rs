//! # medio
//!
//! Readers, writers and converters for neuroimaging data: NIfTI-1/2,
//! Analyze 7.5, MINC2, Philips PAR/REC and GIFTI images, and TrackVis /
//! MRtrix tractograms.
//!
//! Every image loads into an [`ImageContainer`] holding the format's
//! header, a voxel-to-world [`Affine`] and a lazy [`ArrayProxy`] over the
//! stored bytes. Data is read, and scaled, only when asked for.
//!
//! ## Quick start
//!
//! ```ignore
//! use medio::{convert, ConversionSpec, CropRange, DataType};
//!
//! let img = medio::load("brain.nii.gz")?;
//! let data = img.get_fdata()?;
//! println!("{:?} voxels of {:?}", img.shape(), img.zooms());
//!
//! // PAR/REC to compressed NIfTI, cropped along x and cast to int16
//! let spec = ConversionSpec::new()
//!     .output_dtype(DataType::Int16)
//!     .crop(vec![CropRange::new(2, 8)]);
//! convert("scan.PAR", "scan.nii.gz", &spec)?;
//! ```
//!
//! ## Features
//!
//! - `minc2`: MINC2 reading through the system HDF5 library.

pub mod affine;
pub mod analyze;
pub mod compression;
pub mod convert;
pub mod datatype;
pub mod error;
pub mod gifti;
pub mod image;
pub mod io;
pub mod minc2;
pub mod nifti;
pub mod orientation;
pub mod parrec;
pub mod proxy;
pub mod registry;
pub mod scaling;
pub mod streamlines;

pub use affine::{compose, Affine};
pub use compression::Codec;
pub use convert::{convert, convert_batch, ConversionSpec, CropRange};
pub use datatype::{ArrayData, DataType, Endianness, MemoryOrder};
pub use error::{Error, Result};
pub use image::{Diagnostic, DiagnosticKind, Header, HeaderCodec, ImageContainer};
pub use io::{load, load_header, save, save_with, SaveOptions};
pub use nifti::Extension;
pub use proxy::{ArrayProxy, CachePolicy, Scaling};
pub use registry::Format;
pub use streamlines::{
    load_tractogram, save_tractogram, save_tractogram_with, Reference, Streamline,
    StreamlineReader, Tractogram,
};

use std::path::Path;

/// Detect the format of a file from its content.
pub fn detect(path: impl AsRef<Path>) -> Result<Format> {
    registry::detect(path.as_ref())
}
