//! Voxel data types, byte order, and typed array containers.
//!
//! Data type codes follow the NIfTI numbering, which Analyze, GIFTI and the
//! PAR/REC reader reuse. Each format restricts the set it accepts through
//! its own `validate`.

use crate::error::{Error, Result};
use byteorder::{BigEndian, ByteOrder, LittleEndian};
use ndarray::{ArrayD, IxDyn, ShapeBuilder};
use rayon::prelude::*;

/// Element counts above this are converted on the rayon pool.
const PARALLEL_ELEMENTS: usize = 1 << 16;

/// Byte order of stored binary data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Endianness {
    /// Least significant byte first.
    Little,
    /// Most significant byte first.
    Big,
}

impl Endianness {
    /// Byte order of the running machine.
    pub const fn native() -> Self {
        if cfg!(target_endian = "little") {
            Self::Little
        } else {
            Self::Big
        }
    }

    /// The other byte order.
    pub const fn swapped(self) -> Self {
        match self {
            Self::Little => Self::Big,
            Self::Big => Self::Little,
        }
    }

    /// Native order first, then swapped: the order in which headers are sniffed.
    pub const fn probe_order() -> [Self; 2] {
        [Self::native(), Self::native().swapped()]
    }

    pub const fn is_little(self) -> bool {
        matches!(self, Self::Little)
    }
}

/// Memory layout of a multi-dimensional array on disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MemoryOrder {
    /// Column-major: first index varies fastest (NIfTI, Analyze, PAR/REC).
    #[default]
    Fortran,
    /// Row-major: last index varies fastest (MINC2, GIFTI row-major arrays).
    C,
}

/// Supported voxel data types, keyed by their NIfTI codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i16)]
pub enum DataType {
    /// Unsigned 8-bit integer
    UInt8 = 2,
    /// Signed 16-bit integer
    Int16 = 4,
    /// Signed 32-bit integer
    Int32 = 8,
    /// 32-bit floating point
    Float32 = 16,
    /// 64-bit floating point
    Float64 = 64,
    /// Signed 8-bit integer
    Int8 = 256,
    /// Unsigned 16-bit integer
    UInt16 = 512,
    /// Unsigned 32-bit integer
    UInt32 = 768,
    /// Signed 64-bit integer
    Int64 = 1024,
    /// Unsigned 64-bit integer
    UInt64 = 1280,
}

impl DataType {
    /// Every supported type, in code order.
    pub const ALL: [Self; 10] = [
        Self::UInt8,
        Self::Int16,
        Self::Int32,
        Self::Float32,
        Self::Float64,
        Self::Int8,
        Self::UInt16,
        Self::UInt32,
        Self::Int64,
        Self::UInt64,
    ];

    /// Parse from a NIfTI datatype code.
    pub fn from_code(code: i32) -> Result<Self> {
        Self::ALL
            .into_iter()
            .find(|dt| dt.code() == code)
            .ok_or_else(|| Error::UnsupportedDatatype(format!("datatype code {code}")))
    }

    /// NIfTI datatype code.
    pub const fn code(self) -> i32 {
        self as i16 as i32
    }

    /// Size of each element in bytes.
    pub const fn byte_size(self) -> usize {
        match self {
            Self::UInt8 | Self::Int8 => 1,
            Self::Int16 | Self::UInt16 => 2,
            Self::Int32 | Self::UInt32 | Self::Float32 => 4,
            Self::Int64 | Self::UInt64 | Self::Float64 => 8,
        }
    }

    /// Bits per element, as stored in `bitpix`.
    pub const fn bitpix(self) -> i16 {
        (self.byte_size() * 8) as i16
    }

    pub const fn is_float(self) -> bool {
        matches!(self, Self::Float32 | Self::Float64)
    }

    pub const fn is_signed(self) -> bool {
        !matches!(
            self,
            Self::UInt8 | Self::UInt16 | Self::UInt32 | Self::UInt64
        )
    }

    /// Smallest representable value as f64.
    pub fn min_value(self) -> f64 {
        match self {
            Self::UInt8 | Self::UInt16 | Self::UInt32 | Self::UInt64 => 0.0,
            Self::Int8 => i8::MIN as f64,
            Self::Int16 => i16::MIN as f64,
            Self::Int32 => i32::MIN as f64,
            Self::Int64 => i64::MIN as f64,
            Self::Float32 => f32::MIN as f64,
            Self::Float64 => f64::MIN,
        }
    }

    /// Largest representable value as f64.
    pub fn max_value(self) -> f64 {
        match self {
            Self::UInt8 => u8::MAX as f64,
            Self::UInt16 => u16::MAX as f64,
            Self::UInt32 => u32::MAX as f64,
            Self::UInt64 => u64::MAX as f64,
            Self::Int8 => i8::MAX as f64,
            Self::Int16 => i16::MAX as f64,
            Self::Int32 => i32::MAX as f64,
            Self::Int64 => i64::MAX as f64,
            Self::Float32 => f32::MAX as f64,
            Self::Float64 => f64::MAX,
        }
    }

    /// Rust type name, also accepted by `FromStr`.
    pub const fn type_name(self) -> &'static str {
        match self {
            Self::UInt8 => "u8",
            Self::Int8 => "i8",
            Self::Int16 => "i16",
            Self::UInt16 => "u16",
            Self::Int32 => "i32",
            Self::UInt32 => "u32",
            Self::Int64 => "i64",
            Self::UInt64 => "u64",
            Self::Float32 => "f32",
            Self::Float64 => "f64",
        }
    }

    /// Decode one stored element.
    fn read_one<E: ByteOrder>(self, b: &[u8]) -> f64 {
        match self {
            Self::UInt8 => b[0] as f64,
            Self::Int8 => b[0] as i8 as f64,
            Self::Int16 => E::read_i16(b) as f64,
            Self::UInt16 => E::read_u16(b) as f64,
            Self::Int32 => E::read_i32(b) as f64,
            Self::UInt32 => E::read_u32(b) as f64,
            Self::Int64 => E::read_i64(b) as f64,
            Self::UInt64 => E::read_u64(b) as f64,
            Self::Float32 => E::read_f32(b) as f64,
            Self::Float64 => E::read_f64(b),
        }
    }

    /// Encode one element; integers round to nearest, saturate, NaN becomes 0.
    fn write_one<E: ByteOrder>(self, b: &mut [u8], v: f64) {
        match self {
            Self::UInt8 => b[0] = v.round() as u8,
            Self::Int8 => b[0] = v.round() as i8 as u8,
            Self::Int16 => E::write_i16(b, v.round() as i16),
            Self::UInt16 => E::write_u16(b, v.round() as u16),
            Self::Int32 => E::write_i32(b, v.round() as i32),
            Self::UInt32 => E::write_u32(b, v.round() as u32),
            Self::Int64 => E::write_i64(b, v.round() as i64),
            Self::UInt64 => E::write_u64(b, v.round() as u64),
            Self::Float32 => E::write_f32(b, v as f32),
            Self::Float64 => E::write_f64(b, v),
        }
    }

    /// Decode a packed run of stored elements into f64 values.
    pub fn decode_values(self, bytes: &[u8], endianness: Endianness) -> Vec<f64> {
        let size = self.byte_size();
        let read = |chunk: &[u8]| match endianness {
            Endianness::Little => self.read_one::<LittleEndian>(chunk),
            Endianness::Big => self.read_one::<BigEndian>(chunk),
        };
        if bytes.len() / size >= PARALLEL_ELEMENTS {
            bytes.par_chunks_exact(size).map(read).collect()
        } else {
            bytes.chunks_exact(size).map(read).collect()
        }
    }

    /// Encode f64 values into packed stored elements.
    pub fn encode_values(self, values: &[f64], endianness: Endianness) -> Vec<u8> {
        let size = self.byte_size();
        let mut out = vec![0u8; values.len() * size];
        let write = |(chunk, &v): (&mut [u8], &f64)| match endianness {
            Endianness::Little => self.write_one::<LittleEndian>(chunk, v),
            Endianness::Big => self.write_one::<BigEndian>(chunk, v),
        };
        if values.len() >= PARALLEL_ELEMENTS {
            out.par_chunks_exact_mut(size)
                .zip(values.par_iter())
                .for_each(write);
        } else {
            out.chunks_exact_mut(size).zip(values.iter()).for_each(write);
        }
        out
    }

    /// Reverse the byte order of every element in place.
    pub fn swap_in_place(self, bytes: &mut [u8]) {
        let size = self.byte_size();
        if size > 1 {
            bytes.chunks_exact_mut(size).for_each(<[u8]>::reverse);
        }
    }
}

impl std::fmt::Display for DataType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.type_name())
    }
}

impl std::str::FromStr for DataType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "u8" | "uint8" => Ok(Self::UInt8),
            "i8" | "int8" => Ok(Self::Int8),
            "i16" | "int16" => Ok(Self::Int16),
            "u16" | "uint16" => Ok(Self::UInt16),
            "i32" | "int32" => Ok(Self::Int32),
            "u32" | "uint32" => Ok(Self::UInt32),
            "i64" | "int64" => Ok(Self::Int64),
            "u64" | "uint64" => Ok(Self::UInt64),
            "f32" | "float32" => Ok(Self::Float32),
            "f64" | "float64" => Ok(Self::Float64),
            _ => Err(Error::Configuration(format!(
                "unknown data type: '{}' (expected u8, i16, f32, etc.)",
                s
            ))),
        }
    }
}

/// Rust scalar types that can back a typed voxel array.
pub trait Element: Copy + Send + Sync + 'static {
    /// Matching stored data type.
    const DATATYPE: DataType;

    /// Cast from f64 (rounding and saturating for integer types, NaN to 0).
    fn from_f64(v: f64) -> Self;

    fn to_f64(self) -> f64;

    /// Wrap an array of this element type.
    fn wrap(array: ArrayD<Self>) -> ArrayData;
}

macro_rules! impl_int_element {
    ($t:ty, $dt:ident) => {
        impl Element for $t {
            const DATATYPE: DataType = DataType::$dt;

            #[inline]
            fn from_f64(v: f64) -> Self {
                v.round() as $t
            }

            #[inline]
            fn to_f64(self) -> f64 {
                self as f64
            }

            fn wrap(array: ArrayD<Self>) -> ArrayData {
                ArrayData::$dt(array)
            }
        }
    };
}

macro_rules! impl_float_element {
    ($t:ty, $dt:ident) => {
        impl Element for $t {
            const DATATYPE: DataType = DataType::$dt;

            #[inline]
            fn from_f64(v: f64) -> Self {
                v as $t
            }

            #[inline]
            fn to_f64(self) -> f64 {
                self as f64
            }

            fn wrap(array: ArrayD<Self>) -> ArrayData {
                ArrayData::$dt(array)
            }
        }
    };
}

impl_int_element!(u8, UInt8);
impl_int_element!(i8, Int8);
impl_int_element!(i16, Int16);
impl_int_element!(u16, UInt16);
impl_int_element!(i32, Int32);
impl_int_element!(u32, UInt32);
impl_int_element!(i64, Int64);
impl_int_element!(u64, UInt64);
impl_float_element!(f32, Float32);
impl_float_element!(f64, Float64);

/// A materialized voxel array of any supported element type.
#[derive(Debug, Clone, PartialEq)]
pub enum ArrayData {
    UInt8(ArrayD<u8>),
    Int8(ArrayD<i8>),
    Int16(ArrayD<i16>),
    UInt16(ArrayD<u16>),
    Int32(ArrayD<i32>),
    UInt32(ArrayD<u32>),
    Int64(ArrayD<i64>),
    UInt64(ArrayD<u64>),
    Float32(ArrayD<f32>),
    Float64(ArrayD<f64>),
}

macro_rules! with_array {
    ($self:expr, $a:ident => $body:expr) => {
        match $self {
            ArrayData::UInt8($a) => $body,
            ArrayData::Int8($a) => $body,
            ArrayData::Int16($a) => $body,
            ArrayData::UInt16($a) => $body,
            ArrayData::Int32($a) => $body,
            ArrayData::UInt32($a) => $body,
            ArrayData::Int64($a) => $body,
            ArrayData::UInt64($a) => $body,
            ArrayData::Float32($a) => $body,
            ArrayData::Float64($a) => $body,
        }
    };
}

impl ArrayData {
    /// Cast an f64 array to `dtype`, keeping its memory layout.
    pub fn from_f64(array: &ArrayD<f64>, dtype: DataType) -> Self {
        fn cast<T: Element>(array: &ArrayD<f64>) -> ArrayData {
            T::wrap(array.mapv(T::from_f64))
        }
        match dtype {
            DataType::UInt8 => cast::<u8>(array),
            DataType::Int8 => cast::<i8>(array),
            DataType::Int16 => cast::<i16>(array),
            DataType::UInt16 => cast::<u16>(array),
            DataType::Int32 => cast::<i32>(array),
            DataType::UInt32 => cast::<u32>(array),
            DataType::Int64 => cast::<i64>(array),
            DataType::UInt64 => cast::<u64>(array),
            DataType::Float32 => cast::<f32>(array),
            DataType::Float64 => ArrayData::Float64(array.clone()),
        }
    }

    pub fn dtype(&self) -> DataType {
        match self {
            Self::UInt8(_) => DataType::UInt8,
            Self::Int8(_) => DataType::Int8,
            Self::Int16(_) => DataType::Int16,
            Self::UInt16(_) => DataType::UInt16,
            Self::Int32(_) => DataType::Int32,
            Self::UInt32(_) => DataType::UInt32,
            Self::Int64(_) => DataType::Int64,
            Self::UInt64(_) => DataType::UInt64,
            Self::Float32(_) => DataType::Float32,
            Self::Float64(_) => DataType::Float64,
        }
    }

    pub fn shape(&self) -> &[usize] {
        with_array!(self, a => a.shape())
    }

    /// Values as f64, same layout.
    pub fn to_f64(&self) -> ArrayD<f64> {
        with_array!(self, a => a.mapv(Element::to_f64))
    }

    /// Element values in Fortran (column-major) order.
    pub fn to_f64_fortran_vec(&self) -> Vec<f64> {
        with_array!(self, a => a.t().iter().map(|v| v.to_f64()).collect())
    }

    /// Borrow as an `f32` array when that is the stored type.
    pub fn as_f32(&self) -> Option<&ArrayD<f32>> {
        match self {
            Self::Float32(a) => Some(a),
            _ => None,
        }
    }

    /// Borrow as an `f64` array when that is the stored type.
    pub fn as_f64(&self) -> Option<&ArrayD<f64>> {
        match self {
            Self::Float64(a) => Some(a),
            _ => None,
        }
    }
}

/// Build a Fortran-ordered array from values listed in Fortran order.
pub(crate) fn fortran_array(shape: &[usize], values: Vec<f64>) -> Result<ArrayD<f64>> {
    let actual = values.len();
    ArrayD::from_shape_vec(IxDyn(shape).f(), values).map_err(|_| Error::ShapeMismatch {
        expected: shape.to_vec(),
        actual: vec![actual],
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_roundtrip() {
        for dt in DataType::ALL {
            assert_eq!(DataType::from_code(dt.code()).unwrap(), dt);
        }
    }

    #[test]
    fn unknown_code_is_unsupported() {
        // complex64 exists in NIfTI but has no scalar representation here
        let err = DataType::from_code(32).unwrap_err();
        assert!(matches!(err, Error::UnsupportedDatatype(_)));
    }

    #[test]
    fn integer_encode_rounds_saturates_and_zeroes_nan() {
        let bytes =
            DataType::Int8.encode_values(&[1.6, -300.0, 300.0, f64::NAN], Endianness::Little);
        assert_eq!(bytes, vec![2u8, 0x80, 0x7f, 0]);
    }

    #[test]
    fn big_endian_decode() {
        let values = DataType::Int16.decode_values(&[0x01, 0x00, 0xff, 0xfe], Endianness::Big);
        assert_eq!(values, vec![256.0, -2.0]);
    }

    #[test]
    fn swap_in_place_reverses_each_element() {
        let mut bytes = vec![1, 2, 3, 4, 5, 6, 7, 8];
        DataType::Int32.swap_in_place(&mut bytes);
        assert_eq!(bytes, vec![4, 3, 2, 1, 8, 7, 6, 5]);
    }

    #[test]
    fn parse_names() {
        assert_eq!("float32".parse::<DataType>().unwrap(), DataType::Float32);
        assert_eq!("U16".parse::<DataType>().unwrap(), DataType::UInt16);
        assert!("complex".parse::<DataType>().is_err());
    }

    #[test]
    fn fortran_vec_follows_column_major() {
        let arr = fortran_array(&[2, 2], vec![1.0, 2.0, 3.0, 4.0]).unwrap();
        assert_eq!(arr[[1, 0]], 2.0);
        let data = ArrayData::Float64(arr);
        assert_eq!(data.to_f64_fortran_vec(), vec![1.0, 2.0, 3.0, 4.0]);
    }
}
