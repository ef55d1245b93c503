//! GIFTI surface and per-vertex data files.
//!
//! A GIFTI document is XML: file-level metadata and label table, then any
//! number of `DataArray` elements, each with its own type, shape, encoding
//! and optional coordinate transforms. Array payloads are decoded once on
//! load and kept in native byte order.

use crate::affine::Affine;
use crate::compression;
use crate::datatype::{DataType, Endianness, MemoryOrder};
use crate::error::{Error, Result};
use crate::image::{Header, HeaderCodec, ImageContainer};
use crate::io::SaveOptions;
use crate::proxy::{ArrayProxy, DataSource, Scaling};
use crate::scaling::ScalingCapability;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use flate2::Compression;
use roxmltree::{Document, Node, ParsingOptions};
use std::fmt::Write as _;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;
use std::sync::Arc;

/// Common `Intent` attribute values.
pub mod intent {
    pub const NONE: &str = "NIFTI_INTENT_NONE";
    pub const LABEL: &str = "NIFTI_INTENT_LABEL";
    pub const SHAPE: &str = "NIFTI_INTENT_SHAPE";
    pub const POINTSET: &str = "NIFTI_INTENT_POINTSET";
    pub const TRIANGLE: &str = "NIFTI_INTENT_TRIANGLE";
    pub const TIME_SERIES: &str = "NIFTI_INTENT_TIME_SERIES";
    pub const VECTOR: &str = "NIFTI_INTENT_VECTOR";
}

const XFORM_UNKNOWN: &str = "NIFTI_XFORM_UNKNOWN";
const XFORM_SCANNER_ANAT: &str = "NIFTI_XFORM_SCANNER_ANAT";

/// How a `DataArray` payload is written in the document.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Encoding {
    Ascii,
    Base64Binary,
    /// Base64 of zlib-compressed bytes.
    GZipBase64Binary,
    ExternalFileBinary,
}

impl Encoding {
    fn parse(s: &str) -> Result<Self> {
        match s {
            "ASCII" => Ok(Self::Ascii),
            "Base64Binary" => Ok(Self::Base64Binary),
            "GZipBase64Binary" => Ok(Self::GZipBase64Binary),
            "ExternalFileBinary" => Ok(Self::ExternalFileBinary),
            other => Err(Error::MalformedHeader(format!("unknown GIFTI encoding {other:?}"))),
        }
    }

    fn name(self) -> &'static str {
        match self {
            Self::Ascii => "ASCII",
            Self::Base64Binary => "Base64Binary",
            Self::GZipBase64Binary => "GZipBase64Binary",
            Self::ExternalFileBinary => "ExternalFileBinary",
        }
    }
}

fn type_name(dtype: DataType) -> &'static str {
    match dtype {
        DataType::UInt8 => "NIFTI_TYPE_UINT8",
        DataType::Int8 => "NIFTI_TYPE_INT8",
        DataType::Int16 => "NIFTI_TYPE_INT16",
        DataType::UInt16 => "NIFTI_TYPE_UINT16",
        DataType::Int32 => "NIFTI_TYPE_INT32",
        DataType::UInt32 => "NIFTI_TYPE_UINT32",
        DataType::Int64 => "NIFTI_TYPE_INT64",
        DataType::UInt64 => "NIFTI_TYPE_UINT64",
        DataType::Float32 => "NIFTI_TYPE_FLOAT32",
        DataType::Float64 => "NIFTI_TYPE_FLOAT64",
    }
}

fn parse_type(name: &str) -> Result<DataType> {
    DataType::ALL
        .into_iter()
        .find(|&d| type_name(d) == name)
        .ok_or_else(|| Error::UnsupportedDatatype(format!("GIFTI data type {name:?}")))
}

/// External binary file holding an array's bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExternalFile {
    pub name: String,
    pub offset: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CoordSystem {
    pub dataspace: String,
    pub xformspace: String,
    pub matrix: Affine,
}

/// One label table entry.
#[derive(Debug, Clone, PartialEq)]
pub struct Label {
    pub key: i32,
    pub name: String,
    pub rgba: Option<[f32; 4]>,
}

/// One `DataArray` element with its decoded payload.
#[derive(Debug, Clone, PartialEq)]
pub struct DataArray {
    pub intent: String,
    pub dtype: DataType,
    pub dims: Vec<usize>,
    pub order: MemoryOrder,
    pub encoding: Encoding,
    /// Byte order the payload was (or will be) written in.
    pub endianness: Endianness,
    pub external: Option<ExternalFile>,
    pub meta: Vec<(String, String)>,
    pub coordsys: Vec<CoordSystem>,
    /// Elements in `order`, native byte order.
    pub data: Arc<Vec<u8>>,
}

impl DataArray {
    /// Array of `values` stored as `dtype`, column-major.
    pub fn from_values(intent: &str, dtype: DataType, dims: Vec<usize>, values: &[f64]) -> Self {
        Self {
            intent: intent.to_string(),
            dtype,
            dims,
            order: MemoryOrder::Fortran,
            encoding: Encoding::GZipBase64Binary,
            endianness: Endianness::Little,
            external: None,
            meta: Vec::new(),
            coordsys: Vec::new(),
            data: Arc::new(dtype.encode_values(values, Endianness::native())),
        }
    }

    pub fn num_elements(&self) -> usize {
        self.dims.iter().product()
    }

    /// Values in stored element order.
    pub fn values(&self) -> Vec<f64> {
        self.dtype.decode_values(&self.data, Endianness::native())
    }

    fn check_len(&self) -> Result<()> {
        let expected = self.num_elements() * self.dtype.byte_size();
        if self.data.len() != expected {
            return Err(Error::CorruptStream(format!(
                "{} array {:?} needs {expected} bytes of data, found {}",
                self.intent,
                self.dims,
                self.data.len()
            )));
        }
        Ok(())
    }
}

/// A whole GIFTI document.
#[derive(Debug, Clone, PartialEq)]
pub struct GiftiImage {
    pub version: String,
    pub meta: Vec<(String, String)>,
    pub labels: Vec<Label>,
    pub arrays: Vec<DataArray>,
}

impl Default for GiftiImage {
    fn default() -> Self {
        Self {
            version: "1.0".into(),
            meta: Vec::new(),
            labels: Vec::new(),
            arrays: Vec::new(),
        }
    }
}

fn malformed(e: roxmltree::Error) -> Error {
    Error::MalformedHeader(format!("GIFTI XML: {e}"))
}

fn elements<'a, 'input: 'a>(
    node: Node<'a, 'input>,
    tag: &'a str,
) -> impl Iterator<Item = Node<'a, 'input>> + 'a {
    node.children().filter(move |n| n.is_element() && n.has_tag_name(tag))
}

fn child_text<'a>(node: Node<'a, '_>, tag: &str) -> &'a str {
    node.children()
        .find(|n| n.is_element() && n.has_tag_name(tag))
        .and_then(|n| n.text())
        .map_or("", str::trim)
}

fn parse_meta(node: Node<'_, '_>) -> Vec<(String, String)> {
    elements(node, "MetaData")
        .flat_map(|md| elements(md, "MD").collect::<Vec<_>>())
        .map(|md| (child_text(md, "Name").to_string(), child_text(md, "Value").to_string()))
        .collect()
}

fn parse_labels(node: Node<'_, '_>) -> Result<Vec<Label>> {
    let mut labels = Vec::new();
    for table in elements(node, "LabelTable") {
        for label in elements(table, "Label") {
            let key = label
                .attribute("Key")
                .unwrap_or("0")
                .trim()
                .parse()
                .map_err(|_| Error::MalformedHeader("label Key is not an integer".into()))?;
            let channel = |name: &str| label.attribute(name).and_then(|v| v.trim().parse::<f32>().ok());
            let rgba = match (channel("Red"), channel("Green"), channel("Blue")) {
                (Some(r), Some(g), Some(b)) => Some([r, g, b, channel("Alpha").unwrap_or(1.0)]),
                _ => None,
            };
            labels.push(Label {
                key,
                name: label.text().map_or("", str::trim).to_string(),
                rgba,
            });
        }
    }
    Ok(labels)
}

fn parse_matrix(text: &str) -> Result<Affine> {
    let values: Vec<f64> = text
        .split_whitespace()
        .map(|t| {
            t.parse()
                .map_err(|_| Error::MalformedHeader(format!("bad MatrixData value {t:?}")))
        })
        .collect::<Result<_>>()?;
    let [a, b, c, d, e, f, g, h, i, j, k, l, m, n, o, p] = values[..] else {
        return Err(Error::MalformedHeader(format!(
            "MatrixData has {} values, need 16",
            values.len()
        )));
    };
    Ok(Affine([[a, b, c, d], [e, f, g, h], [i, j, k, l], [m, n, o, p]]))
}

fn decode_payload(
    node: Node<'_, '_>,
    array: &DataArray,
    base_dir: Option<&Path>,
) -> Result<Vec<u8>> {
    let text = child_text(node, "Data");
    let count = array.num_elements();
    let size = count * array.dtype.byte_size();
    let mut bytes = match array.encoding {
        Encoding::Ascii => {
            let values = text
                .split_whitespace()
                .map(|t| {
                    t.parse::<f64>()
                        .map_err(|_| Error::CorruptStream(format!("bad ASCII data value {t:?}")))
                })
                .collect::<Result<Vec<f64>>>()?;
            if values.len() != count {
                return Err(Error::CorruptStream(format!(
                    "ASCII data has {} values, dims {:?} need {count}",
                    values.len(),
                    array.dims
                )));
            }
            // already native
            return Ok(array.dtype.encode_values(&values, Endianness::native()));
        }
        Encoding::Base64Binary | Encoding::GZipBase64Binary => {
            let compact: String = text.chars().filter(|c| !c.is_ascii_whitespace()).collect();
            let raw = STANDARD
                .decode(compact.as_bytes())
                .map_err(|e| Error::CorruptStream(format!("base64 data: {e}")))?;
            if array.encoding == Encoding::GZipBase64Binary {
                let mut out = Vec::with_capacity(size);
                ZlibDecoder::new(raw.as_slice())
                    .read_to_end(&mut out)
                    .map_err(|e| Error::from_stream(e, "inflating GIFTI data"))?;
                out
            } else {
                raw
            }
        }
        Encoding::ExternalFileBinary => {
            let external = array.external.as_ref().ok_or_else(|| {
                Error::MalformedHeader("ExternalFileBinary array without ExternalFileName".into())
            })?;
            let path = match base_dir {
                Some(dir) => dir.join(&external.name),
                None => Path::new(&external.name).to_path_buf(),
            };
            let mut file = std::fs::File::open(&path)?;
            file.seek(SeekFrom::Start(external.offset))?;
            let mut out = vec![0u8; size];
            file.read_exact(&mut out)
                .map_err(|e| Error::from_stream(e, &format!("reading {}", path.display())))?;
            out
        }
    };
    if bytes.len() != size {
        return Err(Error::CorruptStream(format!(
            "array payload has {} bytes, dims {:?} of {} need {size}",
            bytes.len(),
            array.dims,
            array.dtype
        )));
    }
    if array.endianness != Endianness::native() {
        array.dtype.swap_in_place(&mut bytes);
    }
    Ok(bytes)
}

fn parse_array(node: Node<'_, '_>, base_dir: Option<&Path>) -> Result<DataArray> {
    let attr = |name: &str| node.attribute(name).map(str::trim);
    let required = |name: &str| {
        attr(name).ok_or_else(|| Error::MalformedHeader(format!("DataArray without {name}")))
    };
    let ndim: usize = required("Dimensionality")?
        .parse()
        .map_err(|_| Error::MalformedHeader("Dimensionality is not an integer".into()))?;
    let dims = (0..ndim)
        .map(|i| {
            required(&format!("Dim{i}"))?
                .parse::<usize>()
                .map_err(|_| Error::MalformedHeader(format!("Dim{i} is not a size")))
        })
        .collect::<Result<Vec<_>>>()?;
    let order = match attr("ArrayIndexingOrder").unwrap_or("RowMajorOrder") {
        "RowMajorOrder" => MemoryOrder::C,
        "ColumnMajorOrder" => MemoryOrder::Fortran,
        other => {
            return Err(Error::MalformedHeader(format!(
                "unknown ArrayIndexingOrder {other:?}"
            )))
        }
    };
    let endianness = match attr("Endian").unwrap_or("LittleEndian") {
        "BigEndian" => Endianness::Big,
        _ => Endianness::Little,
    };
    let external = attr("ExternalFileName")
        .filter(|n| !n.is_empty())
        .map(|name| ExternalFile {
            name: name.to_string(),
            offset: attr("ExternalFileOffset")
                .and_then(|o| o.parse().ok())
                .unwrap_or(0),
        });
    let coordsys = elements(node, "CoordinateSystemTransformMatrix")
        .map(|c| {
            Ok(CoordSystem {
                dataspace: child_text(c, "DataSpace").to_string(),
                xformspace: child_text(c, "TransformedSpace").to_string(),
                matrix: parse_matrix(child_text(c, "MatrixData"))?,
            })
        })
        .collect::<Result<Vec<_>>>()?;

    let mut array = DataArray {
        intent: attr("Intent").unwrap_or(intent::NONE).to_string(),
        dtype: parse_type(required("DataType")?)?,
        dims,
        order,
        encoding: Encoding::parse(required("Encoding")?)?,
        endianness,
        external,
        meta: parse_meta(node),
        coordsys,
        data: Arc::new(Vec::new()),
    };
    array.data = Arc::new(decode_payload(node, &array, base_dir)?);
    Ok(array)
}

/// Escape text for an attribute value.
fn escape_attr(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}

fn cdata(s: &str) -> String {
    format!("<![CDATA[{}]]>", s.replace("]]>", "]]]]><![CDATA[>"))
}

fn write_meta(out: &mut String, meta: &[(String, String)], indent: &str) {
    if meta.is_empty() {
        let _ = writeln!(out, "{indent}<MetaData/>");
        return;
    }
    let _ = writeln!(out, "{indent}<MetaData>");
    for (name, value) in meta {
        let _ = writeln!(
            out,
            "{indent}  <MD>\n{indent}    <Name>{}</Name>\n{indent}    <Value>{}</Value>\n{indent}  </MD>",
            cdata(name),
            cdata(value)
        );
    }
    let _ = writeln!(out, "{indent}</MetaData>");
}

fn encode_payload(array: &DataArray, level: u32) -> Result<String> {
    let mut bytes = array.data.as_ref().clone();
    if array.endianness != Endianness::native() {
        array.dtype.swap_in_place(&mut bytes);
    }
    Ok(match array.encoding {
        Encoding::Ascii => array
            .values()
            .iter()
            .map(f64::to_string)
            .collect::<Vec<_>>()
            .join(" "),
        Encoding::Base64Binary | Encoding::ExternalFileBinary => STANDARD.encode(&bytes),
        Encoding::GZipBase64Binary => {
            let mut encoder = ZlibEncoder::new(Vec::new(), Compression::new(level.max(1)));
            encoder.write_all(&bytes)?;
            STANDARD.encode(encoder.finish()?)
        }
    })
}

impl GiftiImage {
    /// Parse a document; external files resolve against `base_dir`.
    pub fn parse(text: &str, base_dir: Option<&Path>) -> Result<Self> {
        let options = ParsingOptions {
            allow_dtd: true,
            ..ParsingOptions::default()
        };
        let doc = Document::parse_with_options(text, options).map_err(malformed)?;
        let root = doc.root_element();
        if !root.has_tag_name("GIFTI") {
            return Err(Error::MalformedHeader(format!(
                "root element is <{}>, not <GIFTI>",
                root.tag_name().name()
            )));
        }
        let arrays = elements(root, "DataArray")
            .map(|node| parse_array(node, base_dir))
            .collect::<Result<Vec<_>>>()?;
        if let Some(declared) = root
            .attribute("NumberOfDataArrays")
            .and_then(|n| n.trim().parse::<usize>().ok())
        {
            if declared != arrays.len() {
                log::warn!(
                    "GIFTI declares {declared} data arrays but contains {}",
                    arrays.len()
                );
            }
        }
        let image = Self {
            version: root.attribute("Version").unwrap_or("1.0").to_string(),
            meta: parse_meta(root),
            labels: parse_labels(root)?,
            arrays,
        };
        log::debug!("parsed GIFTI with {} data arrays", image.arrays.len());
        Ok(image)
    }

    /// Serialize to XML; each array uses its own encoding and byte order.
    ///
    /// External-file arrays are written inline as base64.
    pub fn to_xml(&self, level: u32) -> Result<String> {
        let mut out = String::new();
        out.push_str("<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n");
        out.push_str("<!DOCTYPE GIFTI SYSTEM \"http://www.nitrc.org/frs/download.php/115/gifti.dtd\">\n");
        let _ = writeln!(
            out,
            "<GIFTI Version=\"{}\" NumberOfDataArrays=\"{}\">",
            escape_attr(&self.version),
            self.arrays.len()
        );
        write_meta(&mut out, &self.meta, "  ");
        if !self.labels.is_empty() {
            out.push_str("  <LabelTable>\n");
            for label in &self.labels {
                let colour = label.rgba.map_or_else(String::new, |[r, g, b, a]| {
                    format!(" Red=\"{r}\" Green=\"{g}\" Blue=\"{b}\" Alpha=\"{a}\"")
                });
                let _ = writeln!(
                    out,
                    "    <Label Key=\"{}\"{colour}>{}</Label>",
                    label.key,
                    cdata(&label.name)
                );
            }
            out.push_str("  </LabelTable>\n");
        }
        for array in &self.arrays {
            array.check_len()?;
            let encoding = match array.encoding {
                Encoding::ExternalFileBinary => Encoding::Base64Binary,
                e => e,
            };
            let _ = write!(
                out,
                "  <DataArray Intent=\"{}\" DataType=\"{}\" ArrayIndexingOrder=\"{}\" Dimensionality=\"{}\"",
                escape_attr(&array.intent),
                type_name(array.dtype),
                match array.order {
                    MemoryOrder::C => "RowMajorOrder",
                    MemoryOrder::Fortran => "ColumnMajorOrder",
                },
                array.dims.len()
            );
            for (i, d) in array.dims.iter().enumerate() {
                let _ = write!(out, " Dim{i}=\"{d}\"");
            }
            let _ = writeln!(
                out,
                " Encoding=\"{}\" Endian=\"{}\" ExternalFileName=\"\" ExternalFileOffset=\"\">",
                encoding.name(),
                if array.endianness.is_little() { "LittleEndian" } else { "BigEndian" }
            );
            write_meta(&mut out, &array.meta, "    ");
            for c in &array.coordsys {
                let matrix = c
                    .matrix
                    .0
                    .iter()
                    .map(|row| row.map(|v| v.to_string()).join(" "))
                    .collect::<Vec<_>>()
                    .join("\n");
                let _ = writeln!(
                    out,
                    "    <CoordinateSystemTransformMatrix>\n      <DataSpace>{}</DataSpace>\n      <TransformedSpace>{}</TransformedSpace>\n      <MatrixData>{matrix}</MatrixData>\n    </CoordinateSystemTransformMatrix>",
                    cdata(&c.dataspace),
                    cdata(&c.xformspace)
                );
            }
            let payload = encode_payload(&DataArray { encoding, ..array.clone() }, level)?;
            let _ = writeln!(out, "    <Data>{payload}</Data>\n  </DataArray>");
        }
        out.push_str("</GIFTI>\n");
        Ok(out)
    }

    /// Transform of the first array's first coordinate system.
    pub fn affine(&self) -> Option<Affine> {
        self.arrays
            .first()
            .and_then(|a| a.coordsys.first())
            .map(|c| c.matrix)
    }

    /// Store `affine` as the first array's first coordinate system.
    pub fn set_affine(&mut self, affine: &Affine) {
        let Some(array) = self.arrays.first_mut() else {
            return;
        };
        match array.coordsys.first_mut() {
            Some(c) => c.matrix = *affine,
            None => array.coordsys.push(CoordSystem {
                dataspace: XFORM_UNKNOWN.into(),
                xformspace: XFORM_SCANNER_ANAT.into(),
                matrix: *affine,
            }),
        }
    }

    pub fn default_affine(&self) -> Affine {
        self.affine().unwrap_or_else(Affine::identity)
    }

    pub fn validate(&self) -> Result<()> {
        for array in &self.arrays {
            if array.dims.is_empty() || array.dims.contains(&0) {
                return Err(Error::MalformedHeader(format!(
                    "{} array has dims {:?}",
                    array.intent, array.dims
                )));
            }
            array.check_len()?;
            if let Some(c) = array
                .coordsys
                .iter()
                .find(|c| c.matrix.0.iter().flatten().any(|v| !v.is_finite()))
            {
                return Err(Error::MalformedHeader(format!(
                    "non-finite transform to {}",
                    c.xformspace
                )));
            }
        }
        Ok(())
    }
}

impl HeaderCodec for GiftiImage {
    fn decode(bytes: &[u8]) -> Result<Self> {
        let text = std::str::from_utf8(bytes)
            .map_err(|e| Error::MalformedHeader(format!("GIFTI is not UTF-8: {e}")))?;
        Self::parse(text, None)
    }

    fn encode(&self) -> Result<Vec<u8>> {
        Ok(self.to_xml(crate::io::DEFAULT_LEVEL)?.into_bytes())
    }

    fn validate(&self) -> Result<()> {
        GiftiImage::validate(self)
    }

    fn default_affine(&self) -> Affine {
        GiftiImage::default_affine(self)
    }
}

/// Parse a GIFTI file, decoding every array.
pub fn load_header(path: &Path) -> Result<GiftiImage> {
    let bytes = compression::read_decompressed(path)?;
    let text = std::str::from_utf8(&bytes)
        .map_err(|e| Error::MalformedHeader(format!("{} is not UTF-8: {e}", path.display())))?;
    GiftiImage::parse(text, path.parent())
}

/// Load a GIFTI file; the container exposes its first data array.
pub fn load(path: &Path) -> Result<ImageContainer> {
    let gifti = load_header(path)?;
    let Some(first) = gifti.arrays.first() else {
        return Err(Error::MalformedHeader(format!(
            "{} has no data arrays",
            path.display()
        )));
    };
    let proxy = ArrayProxy::new(
        DataSource::Memory(Arc::clone(&first.data)),
        first.dims.clone(),
        first.dtype,
        0,
        first.order,
        Endianness::native(),
        Scaling::None,
    )?;
    let affine = gifti.default_affine();
    ImageContainer::from_parts(
        Header::Gifti(Box::new(gifti)),
        affine,
        proxy,
        Vec::new(),
        Vec::new(),
        Some(path.to_path_buf()),
    )
}

/// Write `image` as GIFTI.
///
/// A GIFTI source keeps its other arrays, metadata and labels; any other
/// image becomes a single column-major array.
pub fn save(image: &ImageContainer, path: &Path, options: &SaveOptions) -> Result<()> {
    let dtype = options
        .output_dtype
        .unwrap_or_else(|| image.default_output_dtype());
    let (data, _) = image.encode_data(dtype, ScalingCapability::None, Endianness::native())?;
    let encoding = if options.compress_level > 0 {
        Encoding::GZipBase64Binary
    } else {
        Encoding::Base64Binary
    };
    let endianness = options.endianness.unwrap_or(Endianness::Little);

    let mut gifti = match image.header() {
        Header::Gifti(g) => g.as_ref().clone(),
        _ => GiftiImage::default(),
    };
    let mut array = match gifti.arrays.first() {
        Some(first) => first.clone(),
        None => DataArray::from_values(intent::NONE, dtype, image.shape().to_vec(), &[]),
    };
    array.dtype = dtype;
    array.dims = image.shape().to_vec();
    array.order = MemoryOrder::Fortran;
    array.external = None;
    array.data = Arc::new(data);
    match gifti.arrays.first_mut() {
        Some(first) => *first = array,
        None => gifti.arrays.push(array),
    }
    for array in &mut gifti.arrays {
        array.encoding = encoding;
        array.endianness = endianness;
    }
    gifti.set_affine(image.affine());
    gifti.validate()?;

    let xml = gifti.to_xml(options.compress_level)?;
    compression::write_atomic(path, xml.as_bytes(), options.codec_for(path), options.compress_level)
}
