//! MINC2 volumes (HDF5 containers), read-only.
//!
//! Geometry and scaling are decoded by plain Rust code that always compiles;
//! touching an actual file needs the `minc2` feature, which links the
//! system HDF5 library through `hdf5-metno`.
//!
//! Dimensions are kept in file order (slowest varying first, usually
//! `zspace, yspace, xspace`), so the proxy reads in C order and the affine's
//! columns follow the same order. Writers that expect `x, y, z` remap the
//! axes on save.

use crate::affine::Affine;
use crate::datatype::DataType;
use crate::error::{Error, Result};
use crate::image::HeaderCodec;
#[cfg(not(feature = "minc2"))]
use crate::image::ImageContainer;
use crate::proxy::{Scaling, SliceScaling};
#[cfg(not(feature = "minc2"))]
use std::path::Path;

/// Spatial dimension names and their world axis.
const SPATIAL: [(&str, usize); 3] = [("xspace", 0), ("yspace", 1), ("zspace", 2)];

/// One MINC dimension variable.
#[derive(Debug, Clone, PartialEq)]
pub struct MincDimension {
    pub name: String,
    pub length: usize,
    pub start: f64,
    pub step: f64,
    pub cosines: [f64; 3],
}

impl MincDimension {
    /// Dimension with MINC defaults: start 0, step 1, unit cosine along
    /// its own world axis.
    pub fn new(name: &str, length: usize) -> Self {
        let mut cosines = [0.0; 3];
        if let Some(axis) = world_axis(name) {
            cosines[axis] = 1.0;
        }
        Self {
            name: name.to_string(),
            length,
            start: 0.0,
            step: 1.0,
            cosines,
        }
    }
}

fn world_axis(name: &str) -> Option<usize> {
    SPATIAL.iter().find(|(n, _)| *n == name).map(|(_, a)| *a)
}

/// MINC2 image header.
#[derive(Debug, Clone, PartialEq)]
pub struct Minc2Header {
    /// Dimensions in file order.
    pub dims: Vec<MincDimension>,
    pub dtype: DataType,
    /// Stored value range that maps onto `image-min`/`image-max`.
    pub valid_range: Option<(f64, f64)>,
    pub image_min: Vec<f64>,
    pub image_max: Vec<f64>,
    /// File-order axes over which `image-min`/`image-max` vary.
    pub slice_dims: Vec<usize>,
}

impl Minc2Header {
    pub fn shape(&self) -> Vec<usize> {
        self.dims.iter().map(|d| d.length).collect()
    }

    pub fn zooms(&self) -> Vec<f64> {
        self.dims.iter().map(|d| d.step.abs()).collect()
    }

    /// Voxel-to-world affine with columns in file order.
    pub fn affine(&self) -> Affine {
        let mut linear = [[0.0; 3]; 3];
        let mut translation = [0.0; 3];
        for (col, dim) in self.dims.iter().take(3).enumerate() {
            for row in 0..3 {
                linear[row][col] = dim.cosines[row] * dim.step;
                translation[row] += dim.cosines[row] * dim.start;
            }
        }
        Affine::from_parts(linear, translation)
    }

    /// Rewrite start, step and cosines from `affine` (columns in file order).
    pub fn set_affine(&mut self, affine: &Affine) -> Result<()> {
        let mut cosines = [[0.0; 3]; 3];
        let mut steps = [0.0; 3];
        for (col, step) in steps.iter_mut().enumerate() {
            let column = affine.column(col);
            *step = crate::affine::norm(column);
            if *step == 0.0 {
                return Err(Error::NonInvertibleAffine(0.0));
            }
            for row in 0..3 {
                cosines[row][col] = column[row] / *step;
            }
        }
        let starts = Affine::from_parts(cosines, [0.0; 3])
            .inverse()?
            .apply(affine.translation());
        for (col, dim) in self.dims.iter_mut().take(3).enumerate() {
            dim.step = steps[col];
            dim.start = starts[col];
            dim.cosines = [cosines[0][col], cosines[1][col], cosines[2][col]];
        }
        Ok(())
    }

    /// Value scaling from the image range variables.
    ///
    /// Integer data maps `valid_range` linearly onto `[image-min,
    /// image-max]`, slice by slice when those vary; float data is stored
    /// as-is.
    pub fn scaling(&self) -> Result<Scaling> {
        if self.dtype.is_float() || self.image_min.is_empty() || self.image_max.is_empty() {
            return Ok(Scaling::None);
        }
        if self.image_min.len() != self.image_max.len() {
            return Err(Error::MalformedHeader(format!(
                "image-min has {} values but image-max has {}",
                self.image_min.len(),
                self.image_max.len()
            )));
        }
        let (vmin, vmax) = self
            .valid_range
            .unwrap_or((self.dtype.min_value(), self.dtype.max_value()));
        if vmax <= vmin {
            return Err(Error::MalformedHeader(format!(
                "valid_range [{vmin}, {vmax}] is empty"
            )));
        }
        let (slopes, inters): (Vec<f64>, Vec<f64>) = self
            .image_min
            .iter()
            .zip(&self.image_max)
            .map(|(&imin, &imax)| {
                let scale = (imax - imin) / (vmax - vmin);
                (scale, imin - vmin * scale)
            })
            .unzip();
        if slopes.len() == 1 {
            return Ok(Scaling::from_slope_inter(slopes[0], inters[0]));
        }
        // image-min is stored C order, so its last dimension varies fastest
        let axes = self.slice_dims.iter().rev().copied().collect();
        Ok(Scaling::PerSlice(SliceScaling { axes, slopes, inters }))
    }

    pub fn validate(&self) -> Result<()> {
        if self.dims.len() != 3 {
            return Err(Error::MalformedHeader(format!(
                "MINC images with {} dimensions are not supported, need 3 spatial",
                self.dims.len()
            )));
        }
        for dim in &self.dims {
            if world_axis(&dim.name).is_none() {
                return Err(Error::MalformedHeader(format!(
                    "non-spatial MINC dimension {}",
                    dim.name
                )));
            }
            if dim.length == 0 || !dim.step.is_finite() || dim.step == 0.0 || !dim.start.is_finite() {
                return Err(Error::MalformedHeader(format!(
                    "dimension {} has length {}, step {}, start {}",
                    dim.name, dim.length, dim.step, dim.start
                )));
            }
        }
        if let Some(&axis) = self.slice_dims.iter().find(|&&a| a >= self.dims.len()) {
            return Err(Error::MalformedHeader(format!(
                "image-min varies over missing dimension {axis}"
            )));
        }
        Ok(())
    }
}

impl HeaderCodec for Minc2Header {
    fn decode(_bytes: &[u8]) -> Result<Self> {
        Err(Error::Configuration(
            "MINC2 headers live in HDF5 attributes; open the file with minc2::load_header".into(),
        ))
    }

    fn encode(&self) -> Result<Vec<u8>> {
        Err(Error::IncompatibleConversion("MINC2 is read-only".into()))
    }

    fn validate(&self) -> Result<()> {
        Minc2Header::validate(self)
    }

    fn default_affine(&self) -> Affine {
        self.affine()
    }
}

#[cfg(feature = "minc2")]
pub use hdf5_io::{load, load_header, DatasetSource};

#[cfg(not(feature = "minc2"))]
fn hdf5_missing(path: &Path) -> Error {
    Error::Configuration(format!(
        "{} is MINC2; rebuild with the `minc2` feature to read it",
        path.display()
    ))
}

#[cfg(not(feature = "minc2"))]
pub fn load_header(path: &Path) -> Result<Minc2Header> {
    Err(hdf5_missing(path))
}

#[cfg(not(feature = "minc2"))]
pub fn load(path: &Path) -> Result<ImageContainer> {
    Err(hdf5_missing(path))
}

#[cfg(feature = "minc2")]
mod hdf5_io {
    use super::{Minc2Header, MincDimension};
    use crate::datatype::{DataType, Endianness, MemoryOrder};
    use crate::error::{Error, Result};
    use crate::image::{Header, ImageContainer};
    use crate::proxy::{ArrayProxy, DataSource};
    use hdf5::types::{FloatSize, IntSize, TypeDescriptor, VarLenAscii, VarLenUnicode};
    use std::path::{Path, PathBuf};
    use std::sync::{Arc, Mutex};

    const IMAGE: &str = "minc-2.0/image/0/image";
    const DIMENSIONS: &str = "minc-2.0/dimensions";

    fn h5(context: &str) -> impl Fn(hdf5::Error) -> Error + '_ {
        move |e| Error::MalformedHeader(format!("{context}: {e}"))
    }

    fn string_attr(location: &hdf5::Location, name: &str) -> Option<String> {
        let attr = location.attr(name).ok()?;
        if let Ok(s) = attr.read_scalar::<VarLenUnicode>() {
            return Some(s.as_str().to_string());
        }
        if let Ok(s) = attr.read_scalar::<VarLenAscii>() {
            return Some(s.as_str().to_string());
        }
        attr.read_scalar::<hdf5::types::FixedAscii<256>>()
            .ok()
            .map(|s| s.as_str().to_string())
    }

    fn f64_attr(location: &hdf5::Location, name: &str) -> Option<Vec<f64>> {
        location.attr(name).ok()?.read_raw::<f64>().ok()
    }

    fn dimorder(location: &hdf5::Location) -> Vec<String> {
        string_attr(location, "dimorder")
            .map(|s| {
                s.split(',')
                    .map(|d| d.trim().to_string())
                    .filter(|d| !d.is_empty())
                    .collect()
            })
            .unwrap_or_default()
    }

    fn dtype_of(dataset: &hdf5::Dataset) -> Result<DataType> {
        let descriptor = dataset
            .dtype()
            .and_then(|t| t.to_descriptor())
            .map_err(h5("image type"))?;
        Ok(match descriptor {
            TypeDescriptor::Unsigned(IntSize::U1) => DataType::UInt8,
            TypeDescriptor::Integer(IntSize::U1) => DataType::Int8,
            TypeDescriptor::Unsigned(IntSize::U2) => DataType::UInt16,
            TypeDescriptor::Integer(IntSize::U2) => DataType::Int16,
            TypeDescriptor::Unsigned(IntSize::U4) => DataType::UInt32,
            TypeDescriptor::Integer(IntSize::U4) => DataType::Int32,
            TypeDescriptor::Unsigned(IntSize::U8) => DataType::UInt64,
            TypeDescriptor::Integer(IntSize::U8) => DataType::Int64,
            TypeDescriptor::Float(FloatSize::U4) => DataType::Float32,
            TypeDescriptor::Float(FloatSize::U8) => DataType::Float64,
            other => {
                return Err(Error::UnsupportedDatatype(format!(
                    "MINC image type {other:?}"
                )))
            }
        })
    }

    /// Image min/max values and the file-order axes they vary over.
    fn range_variable(
        file: &hdf5::File,
        name: &str,
        dims: &[MincDimension],
    ) -> Result<(Vec<f64>, Vec<usize>)> {
        let Ok(dataset) = file.dataset(&format!("minc-2.0/image/0/{name}")) else {
            return Ok((Vec::new(), Vec::new()));
        };
        let values = dataset.read_raw::<f64>().map_err(h5(name))?;
        let axes = dimorder(&dataset)
            .iter()
            .map(|d| {
                dims.iter().position(|dim| &dim.name == d).ok_or_else(|| {
                    Error::MalformedHeader(format!("{name} varies over unknown dimension {d}"))
                })
            })
            .collect::<Result<Vec<_>>>()?;
        Ok((values, axes))
    }

    /// Read the header from a MINC2 file.
    pub fn load_header(path: &Path) -> Result<Minc2Header> {
        let file = hdf5::File::open(path).map_err(h5("opening MINC2 file"))?;
        let image = file.dataset(IMAGE).map_err(h5(IMAGE))?;
        let shape = image.shape();
        let names = dimorder(&image);
        let names = if names.len() == shape.len() {
            names
        } else {
            log::debug!("image dimorder missing or partial; assuming zspace,yspace,xspace");
            ["zspace", "yspace", "xspace"]
                .iter()
                .rev()
                .take(shape.len())
                .rev()
                .map(|s| (*s).to_string())
                .collect()
        };

        let dims = names
            .iter()
            .zip(&shape)
            .map(|(name, &length)| {
                let mut dim = MincDimension::new(name, length);
                if let Ok(var) = file.dataset(&format!("{DIMENSIONS}/{name}")) {
                    if let Some(v) = f64_attr(&var, "start").and_then(|v| v.first().copied()) {
                        dim.start = v;
                    }
                    if let Some(v) = f64_attr(&var, "step").and_then(|v| v.first().copied()) {
                        dim.step = v;
                    }
                    if let Some(v) = f64_attr(&var, "direction_cosines") {
                        if let [x, y, z] = v[..] {
                            dim.cosines = [x, y, z];
                        }
                    }
                }
                dim
            })
            .collect::<Vec<_>>();

        let dtype = dtype_of(&image)?;
        let valid_range = f64_attr(&image, "valid_range").and_then(|v| match v[..] {
            [a, b] => Some((a.min(b), a.max(b))),
            _ => None,
        });
        let (image_min, slice_dims) = range_variable(&file, "image-min", &dims)?;
        let (image_max, max_dims) = range_variable(&file, "image-max", &dims)?;
        // image-max decides the slice layout when the two disagree
        let slice_dims = if max_dims.is_empty() { slice_dims } else { max_dims };

        let header = Minc2Header {
            dims,
            dtype,
            valid_range,
            image_min,
            image_max,
            slice_dims,
        };
        header.validate()?;
        Ok(header)
    }

    /// Deferred read of the image dataset into native-endian bytes.
    #[derive(Debug)]
    pub struct DatasetSource {
        path: PathBuf,
        dtype: DataType,
        bytes: Mutex<Option<Arc<Vec<u8>>>>,
    }

    macro_rules! read_native {
        ($dataset:expr, $t:ty) => {{
            let values = $dataset.read_raw::<$t>().map_err(h5("reading MINC image"))?;
            values.iter().flat_map(|v| v.to_ne_bytes()).collect::<Vec<u8>>()
        }};
    }

    impl DatasetSource {
        pub fn new(path: &Path, dtype: DataType) -> Self {
            Self {
                path: path.to_path_buf(),
                dtype,
                bytes: Mutex::new(None),
            }
        }

        /// The whole dataset, read on first use.
        pub fn bytes(&self) -> Result<Arc<Vec<u8>>> {
            let mut slot = self
                .bytes
                .lock()
                .map_err(|_| Error::Configuration("MINC dataset cache poisoned".into()))?;
            if let Some(bytes) = slot.as_ref() {
                return Ok(Arc::clone(bytes));
            }
            let file = hdf5::File::open(&self.path).map_err(h5("opening MINC2 file"))?;
            let dataset = file.dataset(IMAGE).map_err(h5(IMAGE))?;
            let bytes = match self.dtype {
                DataType::UInt8 => read_native!(dataset, u8),
                DataType::Int8 => read_native!(dataset, i8),
                DataType::UInt16 => read_native!(dataset, u16),
                DataType::Int16 => read_native!(dataset, i16),
                DataType::UInt32 => read_native!(dataset, u32),
                DataType::Int32 => read_native!(dataset, i32),
                DataType::UInt64 => read_native!(dataset, u64),
                DataType::Int64 => read_native!(dataset, i64),
                DataType::Float32 => read_native!(dataset, f32),
                DataType::Float64 => read_native!(dataset, f64),
            };
            log::debug!("read {} bytes from {}", bytes.len(), self.path.display());
            let bytes = Arc::new(bytes);
            *slot = Some(Arc::clone(&bytes));
            Ok(bytes)
        }
    }

    /// Open a MINC2 file; the image dataset is read on first data access.
    pub fn load(path: &Path) -> Result<ImageContainer> {
        let header = load_header(path)?;
        let source = DataSource::Hdf5(Arc::new(DatasetSource::new(path, header.dtype)));
        let proxy = ArrayProxy::new(
            source,
            header.shape(),
            header.dtype,
            0,
            MemoryOrder::C,
            Endianness::native(),
            header.scaling()?,
        )?;
        let affine = header.affine();
        ImageContainer::from_parts(
            Header::Minc2(header),
            affine,
            proxy,
            Vec::new(),
            Vec::new(),
            Some(path.to_path_buf()),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn header() -> Minc2Header {
        let mut z = MincDimension::new("zspace", 4);
        z.start = -10.0;
        z.step = 2.5;
        let mut y = MincDimension::new("yspace", 5);
        y.start = 20.0;
        y.step = -1.0;
        let mut x = MincDimension::new("xspace", 6);
        x.start = 3.0;
        Minc2Header {
            dims: vec![z, y, x],
            dtype: DataType::UInt16,
            valid_range: Some((0.0, 1000.0)),
            image_min: vec![0.0],
            image_max: vec![1.0],
            slice_dims: Vec::new(),
        }
    }

    #[test]
    fn default_cosines_follow_dimension_names() {
        assert_eq!(MincDimension::new("yspace", 3).cosines, [0.0, 1.0, 0.0]);
        assert_eq!(MincDimension::new("time", 3).cosines, [0.0, 0.0, 0.0]);
    }

    #[test]
    fn affine_columns_follow_file_order() {
        let affine = header().affine();
        assert_eq!(affine.column(0), [0.0, 0.0, 2.5]);
        assert_eq!(affine.column(1), [0.0, -1.0, 0.0]);
        assert_eq!(affine.column(2), [1.0, 0.0, 0.0]);
        assert_eq!(affine.translation(), [3.0, 20.0, -10.0]);
        // voxel (k, j, i) lands at (x, y, z)
        assert_eq!(affine.apply([1.0, 2.0, 3.0]), [6.0, 18.0, -7.5]);
    }

    #[test]
    fn rotated_cosines_rotate_the_start() {
        let mut h = header();
        let c = std::f64::consts::FRAC_1_SQRT_2;
        h.dims[2].cosines = [c, c, 0.0];
        h.dims[1].cosines = [-c, c, 0.0];
        h.dims[1].step = 1.0;
        h.dims[2].start = 1.0;
        h.dims[1].start = 1.0;
        let affine = h.affine();
        let t = affine.translation();
        assert!((t[0] - 0.0).abs() < 1e-12);
        assert!((t[1] - 2.0 * c).abs() < 1e-12);

        let mut copy = h.clone();
        copy.set_affine(&affine).unwrap();
        assert!(copy.affine().approx_eq(&affine, 1e-12));
        assert!((copy.dims[2].start - 1.0).abs() < 1e-12);
    }

    #[test]
    fn global_range_scaling() {
        let scaling = header().scaling().unwrap();
        let Scaling::Global { slope, inter } = scaling else {
            panic!("expected global scaling, got {scaling:?}");
        };
        assert!((slope - 0.001).abs() < 1e-15);
        assert_eq!(inter, 0.0);
    }

    #[test]
    fn per_slice_ranges_reverse_dimorder() {
        let mut h = header();
        h.valid_range = Some((0.0, 100.0));
        h.image_min = vec![0.0, 10.0, -5.0, 0.0];
        h.image_max = vec![100.0, 20.0, 5.0, 1.0];
        h.slice_dims = vec![0];
        let Scaling::PerSlice(s) = h.scaling().unwrap() else {
            panic!("expected per-slice scaling");
        };
        assert_eq!(s.axes, vec![0]);
        assert_eq!(s.slopes[0], 1.0);
        assert_eq!(s.inters[1], 10.0);
        assert_eq!(s.slopes[2], 0.1);

        h.image_min = vec![0.0; 20];
        h.image_max = vec![1.0; 20];
        h.slice_dims = vec![0, 1];
        let Scaling::PerSlice(s) = h.scaling().unwrap() else {
            panic!("expected per-slice scaling");
        };
        assert_eq!(s.axes, vec![1, 0]);
    }

    #[test]
    fn float_images_are_unscaled() {
        let mut h = header();
        h.dtype = DataType::Float32;
        assert_eq!(h.scaling().unwrap(), Scaling::None);
    }

    #[test]
    fn only_spatial_volumes_validate() {
        assert!(header().validate().is_ok());
        let mut h = header();
        h.dims.insert(0, MincDimension::new("time", 2));
        assert!(matches!(h.validate(), Err(Error::MalformedHeader(_))));
        assert!(matches!(header().encode(), Err(Error::IncompatibleConversion(_))));
    }

    #[cfg(not(feature = "minc2"))]
    #[test]
    fn loading_without_hdf5_is_a_configuration_error() {
        let err = load(Path::new("brain.mnc")).unwrap_err();
        assert!(matches!(err, Error::Configuration(_)));
    }
}
