//! Lazy access to on-disk voxel data.
//!
//! An [`ArrayProxy`] knows where the voxel bytes live and how to interpret
//! them, but holds no decoded values. Sub-regions are read by computing the
//! contiguous byte runs they cover, so a crop touches only the bytes it
//! needs. Scaling is applied on the way out, never to the source.

use crate::compression;
use crate::datatype::{fortran_array, DataType, Endianness, MemoryOrder};
use crate::error::{Error, Result};
use memmap2::Mmap;
use ndarray::{ArrayD, IxDyn, Slice, SliceInfoElem};
use rayon::prelude::*;
use std::cell::RefCell;
use std::fs::File;
use std::io::{Read, Seek};
use std::ops::Range;
use std::path::Path;
use std::sync::{Arc, Mutex, PoisonError};

/// Where the stored bytes come from.
#[derive(Debug, Clone)]
pub enum DataSource {
    /// Memory-mapped uncompressed file.
    Mapped(Arc<Mmap>),
    /// Bytes already in memory (decoded containers, arrays built in code).
    Memory(Arc<Vec<u8>>),
    /// gzip or zstd file held open from construction, decoded from the
    /// start on every read.
    Compressed {
        file: Arc<Mutex<File>>,
        codec: compression::Codec,
    },
    /// HDF5 dataset read on first access.
    #[cfg(feature = "minc2")]
    Hdf5(Arc<crate::minc2::DatasetSource>),
}

impl DataSource {
    /// Map an uncompressed file, or fall back to streamed reads when the
    /// file is compressed.
    pub fn open(path: &Path) -> Result<Self> {
        match compression::Codec::probe(path)? {
            compression::Codec::None => {
                let file = File::open(path)?;
                // SAFETY: the mapping is read-only and this crate never writes
                // through it. Concurrent truncation by another process is the
                // usual mmap caveat and outside our control.
                #[allow(unsafe_code)]
                let mmap = unsafe { Mmap::map(&file)? };
                Ok(Self::Mapped(Arc::new(mmap)))
            }
            codec => Ok(Self::Compressed {
                file: Arc::new(Mutex::new(File::open(path)?)),
                codec,
            }),
        }
    }

    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        Self::Memory(Arc::new(bytes))
    }

    fn describe(&self) -> &'static str {
        match self {
            Self::Mapped(_) => "mapped file",
            Self::Memory(_) => "memory",
            Self::Compressed { .. } => "compressed stream",
            #[cfg(feature = "minc2")]
            Self::Hdf5(_) => "hdf5 dataset",
        }
    }
}

/// Per-slice scale factors, indexed by the voxel index along `axes`
/// (first listed axis varies fastest).
#[derive(Debug, Clone, PartialEq)]
pub struct SliceScaling {
    pub axes: Vec<usize>,
    pub slopes: Vec<f64>,
    pub inters: Vec<f64>,
}

impl SliceScaling {
    /// Index into the factor tables for a full-array voxel index.
    fn factor_index(&self, shape: &[usize], index: &[usize]) -> usize {
        let mut flat = 0;
        let mut stride = 1;
        for &axis in &self.axes {
            let n = shape.get(axis).copied().unwrap_or(1);
            flat += index.get(axis).copied().unwrap_or(0) * stride;
            stride *= n;
        }
        flat
    }

    /// Factors for the sub-array covered by `ranges`.
    fn cropped(&self, shape: &[usize], ranges: &[Range<usize>]) -> SliceScaling {
        let lens: Vec<usize> = self
            .axes
            .iter()
            .map(|&a| ranges.get(a).map_or(1, |r| r.len()))
            .collect();
        let count: usize = lens.iter().product();
        let mut full_index = vec![0usize; shape.len()];
        let (mut slopes, mut inters) = (Vec::with_capacity(count), Vec::with_capacity(count));
        for flat in 0..count {
            let mut rem = flat;
            for (&axis, &n) in self.axes.iter().zip(&lens) {
                let start = ranges.get(axis).map_or(0, |r| r.start);
                if let Some(slot) = full_index.get_mut(axis) {
                    *slot = start + rem % n;
                }
                rem /= n;
            }
            let f = self.factor_index(shape, &full_index);
            slopes.push(self.slopes[f]);
            inters.push(self.inters[f]);
        }
        SliceScaling {
            axes: self.axes.clone(),
            slopes,
            inters,
        }
    }

    fn expected_len(&self, shape: &[usize]) -> usize {
        self.axes
            .iter()
            .map(|&a| shape.get(a).copied().unwrap_or(1))
            .product()
    }
}

/// How stored values map to physical values.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum Scaling {
    #[default]
    None,
    /// `value = raw * slope + inter` everywhere.
    Global { slope: f64, inter: f64 },
    /// Factors vary per slice (PAR/REC, MINC2 per-slice ranges).
    PerSlice(SliceScaling),
}

impl Scaling {
    /// Header slope/intercept with the usual conventions: a zero or
    /// non-finite slope means "unscaled", a non-finite intercept is zero.
    pub fn from_slope_inter(slope: f64, inter: f64) -> Self {
        if slope == 0.0 || !slope.is_finite() {
            return Self::None;
        }
        let inter = if inter.is_finite() { inter } else { 0.0 };
        if slope == 1.0 && inter == 0.0 {
            Self::None
        } else {
            Self::Global { slope, inter }
        }
    }

    /// Global `(slope, inter)`, or `None` for per-slice factors.
    pub fn global(&self) -> Option<(f64, f64)> {
        match self {
            Self::None => Some((1.0, 0.0)),
            Self::Global { slope, inter } => Some((*slope, *inter)),
            Self::PerSlice(_) => None,
        }
    }

    pub fn is_identity(&self) -> bool {
        matches!(self, Self::None)
    }
}

/// Whether a proxy keeps its fully materialized array.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CachePolicy {
    /// Every read goes to the source.
    #[default]
    Never,
    /// The first full materialization is kept until [`ArrayProxy::uncache`].
    Keep,
}

/// Stored bytes of a sub-region, in the source's element order.
#[derive(Debug, Clone)]
pub struct RawBlock {
    pub bytes: Vec<u8>,
    pub shape: Vec<usize>,
    pub dtype: DataType,
    pub endianness: Endianness,
    pub order: MemoryOrder,
}

impl RawBlock {
    /// Decode to unscaled f64 values with the block's shape.
    pub fn to_f64(&self) -> Result<ArrayD<f64>> {
        let values = self.dtype.decode_values(&self.bytes, self.endianness);
        match self.order {
            MemoryOrder::Fortran => fortran_array(&self.shape, values),
            MemoryOrder::C => {
                let actual = values.len();
                ArrayD::from_shape_vec(IxDyn(&self.shape), values).map_err(|_| {
                    Error::ShapeMismatch {
                        expected: self.shape.clone(),
                        actual: vec![actual],
                    }
                })
            }
        }
    }

    /// Bytes re-encoded in `endianness`.
    pub fn into_bytes(mut self, endianness: Endianness) -> Vec<u8> {
        if endianness != self.endianness {
            self.dtype.swap_in_place(&mut self.bytes);
        }
        self.bytes
    }
}

/// Lazy, scaled view of an array stored somewhere else.
#[derive(Debug)]
pub struct ArrayProxy {
    source: DataSource,
    shape: Vec<usize>,
    dtype: DataType,
    offset: u64,
    order: MemoryOrder,
    endianness: Endianness,
    scaling: Scaling,
    cache_policy: CachePolicy,
    cache: RefCell<Option<ArrayD<f64>>>,
}

impl ArrayProxy {
    pub fn new(
        source: DataSource,
        shape: Vec<usize>,
        dtype: DataType,
        offset: u64,
        order: MemoryOrder,
        endianness: Endianness,
        scaling: Scaling,
    ) -> Result<Self> {
        if let Scaling::PerSlice(s) = &scaling {
            let expected = s.expected_len(&shape);
            if s.slopes.len() != expected || s.inters.len() != expected {
                return Err(Error::ShapeMismatch {
                    expected: vec![expected],
                    actual: vec![s.slopes.len(), s.inters.len()],
                });
            }
        }
        let need = usize::try_from(offset)
            .ok()
            .zip(
                shape
                    .iter()
                    .try_fold(dtype.byte_size(), |acc, &n| acc.checked_mul(n)),
            )
            .and_then(|(offset, data)| offset.checked_add(data))
            .ok_or_else(|| {
                Error::MalformedHeader(format!(
                    "voxel data of shape {shape:?} at offset {offset} overflows the address space"
                ))
            })?;
        if let DataSource::Mapped(_) | DataSource::Memory(_) = &source {
            let have = source_len(&source);
            if have < need {
                return Err(Error::CorruptStream(format!(
                    "voxel data truncated: need {need} bytes from the {}, have {have}",
                    source.describe()
                )));
            }
        }
        Ok(Self {
            source,
            shape,
            dtype,
            offset,
            order,
            endianness,
            scaling,
            cache_policy: CachePolicy::Never,
            cache: RefCell::new(None),
        })
    }

    /// Proxy over an in-memory f64 array (Fortran order, native endian).
    pub fn from_array(array: &ArrayD<f64>, dtype: DataType) -> Self {
        let values: Vec<f64> = array.t().iter().copied().collect();
        let bytes = dtype.encode_values(&values, Endianness::native());
        Self {
            source: DataSource::from_bytes(bytes),
            shape: array.shape().to_vec(),
            dtype,
            offset: 0,
            order: MemoryOrder::Fortran,
            endianness: Endianness::native(),
            scaling: Scaling::None,
            cache_policy: CachePolicy::Never,
            cache: RefCell::new(None),
        }
    }

    pub fn with_cache_policy(mut self, policy: CachePolicy) -> Self {
        self.cache_policy = policy;
        self
    }

    pub fn set_cache_policy(&mut self, policy: CachePolicy) {
        self.cache_policy = policy;
        if policy == CachePolicy::Never {
            self.uncache();
        }
    }

    /// Replace the scaling applied on materialization.
    pub fn with_scaling(mut self, scaling: Scaling) -> Result<Self> {
        if let Scaling::PerSlice(s) = &scaling {
            let expected = s.expected_len(&self.shape);
            if s.slopes.len() != expected || s.inters.len() != expected {
                return Err(Error::ShapeMismatch {
                    expected: vec![expected],
                    actual: vec![s.slopes.len(), s.inters.len()],
                });
            }
        }
        self.scaling = scaling;
        self.uncache();
        Ok(self)
    }

    /// In-memory proxy over the stored bytes of `ranges`, keeping the
    /// scaling of the covered region.
    pub fn crop(&self, ranges: &[Range<usize>]) -> Result<ArrayProxy> {
        let block = self.read_slice(ranges)?;
        let scaling = match &self.scaling {
            Scaling::PerSlice(factors) => Scaling::PerSlice(factors.cropped(&self.shape, ranges)),
            other => other.clone(),
        };
        let proxy = ArrayProxy::new(
            DataSource::from_bytes(block.bytes),
            block.shape,
            block.dtype,
            0,
            block.order,
            block.endianness,
            scaling,
        )?;
        Ok(proxy.with_cache_policy(self.cache_policy))
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    pub fn dtype(&self) -> DataType {
        self.dtype
    }

    pub fn offset(&self) -> u64 {
        self.offset
    }

    pub fn order(&self) -> MemoryOrder {
        self.order
    }

    pub fn endianness(&self) -> Endianness {
        self.endianness
    }

    pub fn scaling(&self) -> &Scaling {
        &self.scaling
    }

    pub fn source(&self) -> &DataSource {
        &self.source
    }

    pub fn is_cached(&self) -> bool {
        self.cache.borrow().is_some()
    }

    /// Drop the cached array; the next read goes back to the source.
    pub fn uncache(&self) {
        self.cache.borrow_mut().take();
    }

    /// Ranges covering the whole array.
    pub fn full_ranges(&self) -> Vec<Range<usize>> {
        self.shape.iter().map(|&n| 0..n).collect()
    }

    fn check_ranges(&self, ranges: &[Range<usize>]) -> Result<()> {
        if ranges.len() != self.shape.len() {
            return Err(Error::InvalidCropRegion(format!(
                "{} ranges given for a {}-dimensional array",
                ranges.len(),
                self.shape.len()
            )));
        }
        for (axis, (r, &n)) in ranges.iter().zip(&self.shape).enumerate() {
            if r.start >= r.end || r.end > n {
                return Err(Error::InvalidCropRegion(format!(
                    "axis {axis}: [{}, {}) outside [0, {n})",
                    r.start, r.end
                )));
            }
        }
        Ok(())
    }

    /// Contiguous byte runs (relative to the data offset) covering `ranges`,
    /// in increasing order.
    fn byte_runs(&self, ranges: &[Range<usize>]) -> Vec<(usize, usize)> {
        let elem = self.dtype.byte_size();
        let ndim = self.shape.len();
        // Axes from fastest to slowest varying on disk.
        let axes: Vec<usize> = match self.order {
            MemoryOrder::Fortran => (0..ndim).collect(),
            MemoryOrder::C => (0..ndim).rev().collect(),
        };
        let mut strides = vec![0usize; ndim];
        let mut stride = 1;
        for &a in &axes {
            strides[a] = stride;
            stride *= self.shape[a];
        }

        // Fully covered fast axes fold into one run.
        let mut run_elems = 1;
        let mut k = 0;
        while k < ndim {
            let a = axes[k];
            run_elems *= ranges[a].len();
            k += 1;
            if ranges[a].len() != self.shape[a] {
                break;
            }
        }
        let outer: Vec<usize> = axes[k..].to_vec();
        let base: usize = axes[..k].iter().map(|&a| ranges[a].start * strides[a]).sum();

        let mut runs = Vec::new();
        let mut counter: Vec<usize> = outer.iter().map(|&a| ranges[a].start).collect();
        loop {
            let start: usize = base
                + outer
                    .iter()
                    .zip(&counter)
                    .map(|(&a, &i)| i * strides[a])
                    .sum::<usize>();
            runs.push((start * elem, run_elems * elem));
            // advance the odometer, fastest outer axis first
            let mut pos = 0;
            loop {
                if pos == outer.len() {
                    return runs;
                }
                counter[pos] += 1;
                if counter[pos] < ranges[outer[pos]].end {
                    break;
                }
                counter[pos] = ranges[outer[pos]].start;
                pos += 1;
            }
        }
    }

    /// Stored bytes for the half-open per-axis `ranges`, without scaling.
    pub fn read_slice(&self, ranges: &[Range<usize>]) -> Result<RawBlock> {
        self.check_ranges(ranges)?;
        let runs = self.byte_runs(ranges);
        let total: usize = runs.iter().map(|(_, len)| len).sum();
        log::trace!(
            "reading {} runs ({total} bytes) from the {}",
            runs.len(),
            self.source.describe()
        );
        let bytes = match &self.source {
            DataSource::Mapped(map) => copy_runs(map, self.offset as usize, &runs, total)?,
            DataSource::Memory(buf) => copy_runs(buf, self.offset as usize, &runs, total)?,
            DataSource::Compressed { file, codec } => {
                // a File carries no invariant a panicking reader could break
                let mut file = file.lock().unwrap_or_else(PoisonError::into_inner);
                file.rewind()?;
                let mut reader = compression::decoder(&*file, *codec)?;
                stream_runs(&mut reader, self.offset, &runs, total)?
            }
            #[cfg(feature = "minc2")]
            DataSource::Hdf5(ds) => copy_runs(&ds.bytes()?, self.offset as usize, &runs, total)?,
        };
        Ok(RawBlock {
            bytes,
            shape: ranges.iter().map(|r| r.len()).collect(),
            dtype: self.dtype,
            endianness: self.endianness,
            order: self.order,
        })
    }

    /// Scaled f64 values for `ranges`.
    pub fn materialize(&self, ranges: &[Range<usize>]) -> Result<ArrayD<f64>> {
        self.check_ranges(ranges)?;
        if let Some(cached) = self.cache.borrow().as_ref() {
            let info: Vec<SliceInfoElem> = ranges
                .iter()
                .map(|r| Slice::from(r.clone()).into())
                .collect();
            return Ok(cached.slice(info.as_slice()).to_owned());
        }
        let full = ranges.iter().zip(&self.shape).all(|(r, &n)| r.start == 0 && r.end == n);
        let mut array = self.read_slice(ranges)?.to_f64()?;
        self.apply_scaling(&mut array, ranges);
        if full && self.cache_policy == CachePolicy::Keep {
            *self.cache.borrow_mut() = Some(array.clone());
        }
        Ok(array)
    }

    /// The whole array, scaled.
    pub fn get_scaled(&self) -> Result<ArrayD<f64>> {
        self.materialize(&self.full_ranges())
    }

    fn apply_scaling(&self, array: &mut ArrayD<f64>, ranges: &[Range<usize>]) {
        match &self.scaling {
            Scaling::None => {}
            Scaling::Global { slope, inter } => {
                let (slope, inter) = (*slope, *inter);
                match array.as_slice_memory_order_mut() {
                    Some(values) => values.par_iter_mut().for_each(|v| *v = *v * slope + inter),
                    None => array.mapv_inplace(|v| v * slope + inter),
                }
            }
            Scaling::PerSlice(factors) => {
                let mut full_index = vec![0usize; self.shape.len()];
                for (ix, v) in array.indexed_iter_mut() {
                    for (axis, r) in ranges.iter().enumerate() {
                        full_index[axis] = ix[axis] + r.start;
                    }
                    let f = factors.factor_index(&self.shape, &full_index);
                    *v = *v * factors.slopes[f] + factors.inters[f];
                }
            }
        }
    }
}

fn source_len(source: &DataSource) -> usize {
    match source {
        DataSource::Mapped(map) => map.len(),
        DataSource::Memory(buf) => buf.len(),
        _ => usize::MAX,
    }
}

fn copy_runs(src: &[u8], offset: usize, runs: &[(usize, usize)], total: usize) -> Result<Vec<u8>> {
    let mut out = Vec::with_capacity(total);
    for &(start, len) in runs {
        let begin = offset + start;
        let chunk = src.get(begin..begin + len).ok_or_else(|| {
            Error::CorruptStream(format!(
                "voxel data truncated at byte {} of {}",
                begin + len,
                src.len()
            ))
        })?;
        out.extend_from_slice(chunk);
    }
    Ok(out)
}

fn stream_runs(
    reader: &mut dyn Read,
    offset: u64,
    runs: &[(usize, usize)],
    total: usize,
) -> Result<Vec<u8>> {
    let mut out = vec![0u8; total];
    let mut position = 0u64;
    let mut filled = 0;
    for &(start, len) in runs {
        let target = offset + start as u64;
        compression::skip(reader, target - position)?;
        reader
            .read_exact(&mut out[filled..filled + len])
            .map_err(|e| Error::from_stream(e, "reading voxel data"))?;
        position = target + len as u64;
        filled += len;
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ramp_proxy(shape: &[usize], order: MemoryOrder) -> ArrayProxy {
        let n: usize = shape.iter().product();
        let values: Vec<f64> = (0..n).map(|v| v as f64).collect();
        let bytes = DataType::Int16.encode_values(&values, Endianness::Big);
        let mut padded = vec![0u8; 16];
        padded.extend(bytes);
        ArrayProxy::new(
            DataSource::from_bytes(padded),
            shape.to_vec(),
            DataType::Int16,
            16,
            order,
            Endianness::Big,
            Scaling::None,
        )
        .unwrap()
    }

    #[test]
    fn fortran_subregion_matches_full_read() {
        let proxy = ramp_proxy(&[4, 5, 6], MemoryOrder::Fortran);
        let full = proxy.get_scaled().unwrap();
        assert_eq!(full[[1, 2, 3]], (1 + 2 * 4 + 3 * 20) as f64);

        let crop = proxy.materialize(&[1..3, 0..5, 2..4]).unwrap();
        assert_eq!(crop.shape(), &[2, 5, 2]);
        for ((i, j, k), v) in [((0, 0, 0), crop[[0, 0, 0]]), ((1, 4, 1), crop[[1, 4, 1]])] {
            assert_eq!(v, full[[i + 1, j, k + 2]]);
        }
    }

    #[test]
    fn c_order_subregion() {
        let proxy = ramp_proxy(&[3, 4, 5], MemoryOrder::C);
        let full = proxy.get_scaled().unwrap();
        assert_eq!(full[[1, 2, 3]], (1 * 20 + 2 * 5 + 3) as f64);
        let crop = proxy.materialize(&[1..2, 1..3, 0..5]).unwrap();
        assert_eq!(crop[[0, 1, 4]], full[[1, 2, 4]]);
    }

    #[test]
    fn full_fast_axes_fold_into_one_run() {
        let proxy = ramp_proxy(&[4, 5, 6], MemoryOrder::Fortran);
        let runs = proxy.byte_runs(&[0..4, 0..5, 1..3]);
        assert_eq!(runs, vec![(20 * 2, 40 * 2)]);
        assert_eq!(proxy.byte_runs(&[1..2, 0..1, 0..1]).len(), 1);
        assert_eq!(proxy.byte_runs(&[1..2, 0..2, 0..2]).len(), 4);
    }

    #[test]
    fn global_scaling_applied_lazily() {
        let bytes = DataType::UInt8.encode_values(&[1.0, 2.0, 3.0, 4.0], Endianness::Little);
        let proxy = ArrayProxy::new(
            DataSource::from_bytes(bytes),
            vec![2, 2],
            DataType::UInt8,
            0,
            MemoryOrder::Fortran,
            Endianness::Little,
            Scaling::from_slope_inter(2.0, -1.0),
        )
        .unwrap();
        let raw = proxy.read_slice(&proxy.full_ranges()).unwrap().to_f64().unwrap();
        let scaled = proxy.get_scaled().unwrap();
        assert_eq!(raw[[1, 1]], 4.0);
        assert_eq!(scaled[[1, 1]], 7.0);
        assert_eq!(scaled, proxy.get_scaled().unwrap());
    }

    #[test]
    fn per_slice_scaling_uses_absolute_index() {
        let values = vec![1.0; 8];
        let bytes = DataType::Int16.encode_values(&values, Endianness::Little);
        let scaling = Scaling::PerSlice(SliceScaling {
            axes: vec![2],
            slopes: vec![1.0, 2.0],
            inters: vec![0.0, 0.5],
        });
        let proxy = ArrayProxy::new(
            DataSource::from_bytes(bytes),
            vec![2, 2, 2],
            DataType::Int16,
            0,
            MemoryOrder::Fortran,
            Endianness::Little,
            scaling,
        )
        .unwrap();
        let top = proxy.materialize(&[0..2, 0..2, 1..2]).unwrap();
        assert!(top.iter().all(|&v| v == 2.5));
        let full = proxy.get_scaled().unwrap();
        assert_eq!(full[[0, 0, 0]], 1.0);
        assert_eq!(full[[1, 1, 1]], 2.5);
    }

    #[test]
    fn crop_keeps_per_slice_factors() {
        let values: Vec<f64> = (0..12).map(f64::from).collect();
        let bytes = DataType::Int16.encode_values(&values, Endianness::Little);
        let scaling = Scaling::PerSlice(SliceScaling {
            axes: vec![2],
            slopes: vec![1.0, 2.0, 3.0],
            inters: vec![0.0; 3],
        });
        let proxy = ArrayProxy::new(
            DataSource::from_bytes(bytes),
            vec![2, 2, 3],
            DataType::Int16,
            0,
            MemoryOrder::Fortran,
            Endianness::Little,
            scaling,
        )
        .unwrap();
        let full = proxy.get_scaled().unwrap();
        let cropped = proxy.crop(&[0..2, 1..2, 1..3]).unwrap();
        assert_eq!(cropped.shape(), &[2, 1, 2]);
        let data = cropped.get_scaled().unwrap();
        assert_eq!(data[[1, 0, 0]], full[[1, 1, 1]]);
        assert_eq!(data[[0, 0, 1]], full[[0, 1, 2]]);
    }

    #[test]
    fn cache_is_kept_until_uncache() {
        let proxy = ramp_proxy(&[2, 2, 2], MemoryOrder::Fortran).with_cache_policy(CachePolicy::Keep);
        assert!(!proxy.is_cached());
        let first = proxy.get_scaled().unwrap();
        assert!(proxy.is_cached());
        assert_eq!(proxy.materialize(&[0..1, 0..2, 0..2]).unwrap()[[0, 1, 1]], first[[0, 1, 1]]);
        proxy.uncache();
        assert!(!proxy.is_cached());
    }

    #[test]
    fn bad_ranges_are_rejected() {
        let proxy = ramp_proxy(&[2, 2, 2], MemoryOrder::Fortran);
        assert!(matches!(proxy.materialize(&[0..3, 0..2, 0..2]), Err(Error::InvalidCropRegion(_))));
        assert!(matches!(proxy.materialize(&[1..1, 0..2, 0..2]), Err(Error::InvalidCropRegion(_))));
        assert!(matches!(proxy.materialize(&[0..2, 0..2]), Err(Error::InvalidCropRegion(_))));
    }

    #[test]
    fn truncated_source_is_corrupt() {
        let result = ArrayProxy::new(
            DataSource::from_bytes(vec![0u8; 10]),
            vec![4, 4],
            DataType::Int16,
            0,
            MemoryOrder::Fortran,
            Endianness::Little,
            Scaling::None,
        );
        assert!(matches!(result, Err(Error::CorruptStream(_))));
    }

    #[test]
    fn streamed_compressed_reads() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data.raw.gz");
        let values: Vec<f64> = (0..60).map(f64::from).collect();
        let mut payload = vec![0u8; 8];
        payload.extend(DataType::Float32.encode_values(&values, Endianness::Little));
        compression::write_atomic(&path, &payload, compression::Codec::Gzip, 6).unwrap();

        let source = DataSource::open(&path).unwrap();
        assert!(matches!(source, DataSource::Compressed { .. }));
        let proxy = ArrayProxy::new(
            source,
            vec![3, 4, 5],
            DataType::Float32,
            8,
            MemoryOrder::Fortran,
            Endianness::Little,
            Scaling::None,
        )
        .unwrap();
        let crop = proxy.materialize(&[1..3, 2..4, 4..5]).unwrap();
        assert_eq!(crop[[0, 0, 0]], (1 + 2 * 3 + 4 * 12) as f64);
        assert_eq!(crop[[1, 1, 0]], (2 + 3 * 3 + 4 * 12) as f64);
    }

    #[test]
    fn oversized_shape_is_malformed() {
        let huge = ArrayProxy::new(
            DataSource::from_bytes(vec![0u8; 64]),
            vec![usize::MAX / 2, 3],
            DataType::Float32,
            0,
            MemoryOrder::Fortran,
            Endianness::Little,
            Scaling::None,
        );
        assert!(matches!(huge, Err(Error::MalformedHeader(_))));

        let far = ArrayProxy::new(
            DataSource::from_bytes(vec![0u8; 64]),
            vec![4],
            DataType::UInt8,
            u64::MAX,
            MemoryOrder::Fortran,
            Endianness::Little,
            Scaling::None,
        );
        assert!(matches!(far, Err(Error::MalformedHeader(_))));
    }

    #[test]
    fn compressed_source_survives_unlink() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data.raw.zst");
        let values: Vec<f64> = (0..24).map(f64::from).collect();
        let payload = DataType::UInt8.encode_values(&values, Endianness::Little);
        compression::write_atomic(&path, &payload, compression::Codec::Zstd, 3).unwrap();

        let proxy = ArrayProxy::new(
            DataSource::open(&path).unwrap(),
            vec![2, 3, 4],
            DataType::UInt8,
            0,
            MemoryOrder::Fortran,
            Endianness::Little,
            Scaling::None,
        )
        .unwrap();
        std::fs::remove_file(&path).unwrap();
        let first = proxy.get_scaled().unwrap();
        let second = proxy.materialize(&[0..2, 0..3, 3..4]).unwrap();
        assert_eq!(second[[1, 2, 0]], first[[1, 2, 3]]);
        assert_eq!(first[[1, 2, 3]], (1 + 2 * 2 + 3 * 6) as f64);
    }
}
