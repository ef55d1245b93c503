//! MRtrix `.tck` files.
//!
//! A text header (`mrtrix tracks`, `key: value` lines, `END`) followed at
//! `file: . <offset>` by point triplets in RAS+ mm. A NaN triplet closes
//! each streamline and an Inf triplet ends the data.

use super::{read_or_eof, Streamline};
use crate::affine::Affine;
use crate::compression;
use crate::datatype::Endianness;
use crate::error::{Error, Result};
use crate::image::HeaderCodec;
use byteorder::{BigEndian, ByteOrder, LittleEndian};
use std::fmt;
use std::io::Read;
use std::path::Path;

const MAGIC: &str = "mrtrix tracks";
/// Width of the zero-padded `count` value, so it can be rewritten in place.
const COUNT_WIDTH: usize = 10;
const MAX_HEADER: usize = 1 << 24;

/// Stored point type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TckDataType {
    Float32,
    Float64,
}

impl TckDataType {
    fn byte_size(self) -> usize {
        match self {
            Self::Float32 => 4,
            Self::Float64 => 8,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct TckHeader {
    pub datatype: TckDataType,
    pub endianness: Endianness,
    pub count: usize,
    /// Byte offset of the first triplet.
    pub offset: usize,
    /// Remaining header lines in file order.
    pub fields: Vec<(String, String)>,
}

impl Default for TckHeader {
    fn default() -> Self {
        Self {
            datatype: TckDataType::Float32,
            endianness: Endianness::Little,
            count: 0,
            offset: 0,
            fields: Vec::new(),
        }
    }
}

impl fmt::Display for TckHeader {
    /// The header text without its `file` line.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{MAGIC}")?;
        for (key, value) in &self.fields {
            writeln!(f, "{key}: {value}")?;
        }
        let kind = match self.datatype {
            TckDataType::Float32 => "Float32",
            TckDataType::Float64 => "Float64",
        };
        let order = if self.endianness.is_little() { "LE" } else { "BE" };
        writeln!(f, "datatype: {kind}{order}")?;
        writeln!(f, "count: {:0width$}", self.count, width = COUNT_WIDTH)
    }
}

fn parse_datatype(value: &str) -> Result<(TckDataType, Endianness)> {
    match value {
        "Float32LE" => Ok((TckDataType::Float32, Endianness::Little)),
        "Float32BE" => Ok((TckDataType::Float32, Endianness::Big)),
        "Float64LE" => Ok((TckDataType::Float64, Endianness::Little)),
        "Float64BE" => Ok((TckDataType::Float64, Endianness::Big)),
        other => Err(Error::UnsupportedDatatype(format!("TCK datatype {other:?}"))),
    }
}

impl TckHeader {
    /// Parse the header text; `bytes` must reach at least to `END`.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let end = find_end(bytes).ok_or_else(|| {
            Error::MalformedHeader("TCK header has no END line".into())
        })?;
        let text = String::from_utf8_lossy(&bytes[..end]);
        let mut lines = text.lines();
        if lines.next().map(str::trim_end) != Some(MAGIC) {
            return Err(Error::MalformedHeader(format!(
                "TCK header does not start with {MAGIC:?}"
            )));
        }

        let mut header = Self::default();
        let mut datatype = None;
        let mut offset = None;
        let mut count = None;
        for line in lines.map(str::trim).filter(|l| !l.is_empty()) {
            if line == "END" {
                break;
            }
            let Some((key, value)) = line.split_once(':') else {
                return Err(Error::MalformedHeader(format!("TCK header line {line:?}")));
            };
            let value = value.trim();
            match key.trim() {
                "datatype" => datatype = Some(parse_datatype(value)?),
                "count" => {
                    count = Some(value.parse::<usize>().map_err(|_| {
                        Error::MalformedHeader(format!("TCK count {value:?}"))
                    })?)
                }
                "file" => {
                    let mut parts = value.split_whitespace();
                    if parts.next() != Some(".") {
                        return Err(Error::MalformedHeader(format!(
                            "TCK data in a separate file ({value:?}) is not supported"
                        )));
                    }
                    offset = parts.next().and_then(|o| o.parse::<usize>().ok());
                }
                key => header.fields.push((key.to_string(), value.to_string())),
            }
        }

        (header.datatype, header.endianness) = datatype.ok_or_else(|| {
            Error::MalformedHeader("TCK header has no datatype".into())
        })?;
        header.offset = offset.ok_or_else(|| {
            Error::MalformedHeader("TCK header has no data offset".into())
        })?;
        header.count = count.unwrap_or(0);
        header.validate()?;
        Ok(header)
    }

    /// Header bytes with `offset` pointing just past them.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let body = self.to_string();
        let mut offset = body.len();
        loop {
            let text = format!("{body}file: . {offset}\nEND\n");
            if text.len() == offset {
                return Ok(text.into_bytes());
            }
            offset = text.len();
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.count as u64 >= 10u64.pow(COUNT_WIDTH as u32) {
            return Err(Error::MalformedHeader(format!(
                "TCK count {} does not fit the header field",
                self.count
            )));
        }
        if let Some((key, _)) = self
            .fields
            .iter()
            .find(|(k, v)| k.contains(['\n', ':']) || v.contains('\n'))
        {
            return Err(Error::MalformedHeader(format!("TCK header field {key:?}")));
        }
        Ok(())
    }

    fn read_triplet<E: ByteOrder>(&self, reader: &mut dyn Read) -> Result<Option<[f32; 3]>> {
        let mut raw = [0u8; 24];
        let raw = &mut raw[..3 * self.datatype.byte_size()];
        if !read_or_eof(reader, raw)? {
            return Ok(None);
        }
        Ok(Some(match self.datatype {
            TckDataType::Float32 => [0, 1, 2].map(|k| E::read_f32(&raw[k * 4..k * 4 + 4])),
            TckDataType::Float64 => [0, 1, 2].map(|k| E::read_f64(&raw[k * 8..k * 8 + 8]) as f32),
        }))
    }

    /// Read one streamline; `None` at the Inf terminator or end of file.
    pub(crate) fn read_streamline(&self, reader: &mut dyn Read) -> Result<Option<Streamline>> {
        let mut points = Vec::new();
        loop {
            let triplet = match self.endianness {
                Endianness::Little => self.read_triplet::<LittleEndian>(reader)?,
                Endianness::Big => self.read_triplet::<BigEndian>(reader)?,
            };
            match triplet {
                Some(p) if p.iter().any(|v| v.is_nan()) => {
                    if !points.is_empty() {
                        return Ok(Some(Streamline::new(points)));
                    }
                }
                Some(p) if p.iter().any(|v| v.is_infinite()) => break,
                Some(p) => points.push(p),
                None => break,
            }
        }
        Ok((!points.is_empty()).then(|| Streamline::new(points)))
    }

    fn write_triplet<E: ByteOrder>(&self, out: &mut Vec<u8>, p: [f32; 3]) {
        let mut word = [0u8; 8];
        for v in p {
            match self.datatype {
                TckDataType::Float32 => {
                    E::write_f32(&mut word[..4], v);
                    out.extend_from_slice(&word[..4]);
                }
                TckDataType::Float64 => {
                    E::write_f64(&mut word, f64::from(v));
                    out.extend_from_slice(&word);
                }
            }
        }
    }

    fn push_triplet(&self, out: &mut Vec<u8>, p: [f32; 3]) {
        match self.endianness {
            Endianness::Little => self.write_triplet::<LittleEndian>(out, p),
            Endianness::Big => self.write_triplet::<BigEndian>(out, p),
        }
    }
}

/// End of the `END` line, if present.
fn find_end(bytes: &[u8]) -> Option<usize> {
    let mut start = 0;
    for (i, &b) in bytes.iter().enumerate() {
        if b == b'\n' {
            if bytes[start..i].trim_ascii() == b"END" {
                return Some(i + 1);
            }
            start = i + 1;
        }
    }
    None
}

impl HeaderCodec for TckHeader {
    fn decode(bytes: &[u8]) -> Result<Self> {
        Self::from_bytes(bytes)
    }

    fn encode(&self) -> Result<Vec<u8>> {
        self.to_bytes()
    }

    fn validate(&self) -> Result<()> {
        TckHeader::validate(self)
    }

    /// Points are already RAS+ mm.
    fn default_affine(&self) -> Affine {
        Affine::identity()
    }
}

/// Read the text header, growing the read until `END` shows up.
pub fn load_header(path: &Path) -> Result<TckHeader> {
    let mut len = 4096;
    loop {
        let head = compression::read_head(path, len)?;
        if find_end(&head).is_some() {
            return TckHeader::from_bytes(&head);
        }
        if head.len() < len || len >= MAX_HEADER {
            return Err(Error::MalformedHeader(format!(
                "{} has no END line in its header",
                path.display()
            )));
        }
        len *= 4;
    }
}

/// Encode a whole file from RAS+ mm streamlines.
pub(crate) fn encode<I>(header: &TckHeader, streamlines: I) -> Result<(Vec<u8>, usize)>
where
    I: IntoIterator<Item = Result<Streamline>>,
{
    let mut data = Vec::new();
    let mut count = 0usize;
    for streamline in streamlines {
        let streamline = streamline?;
        if !streamline.scalars.is_empty() || !streamline.properties.is_empty() {
            return Err(Error::IncompatibleConversion(
                "TCK cannot store per-point scalars or per-streamline properties".into(),
            ));
        }
        if streamline.points.is_empty() {
            continue;
        }
        for &p in &streamline.points {
            header.push_triplet(&mut data, p);
        }
        header.push_triplet(&mut data, [f32::NAN; 3]);
        count += 1;
    }
    header.push_triplet(&mut data, [f32::INFINITY; 3]);

    let mut header = header.clone();
    header.count = count;
    header.validate()?;
    let mut out = header.to_bytes()?;
    out.extend_from_slice(&data);
    log::debug!("encoded {count} TCK streamlines ({} bytes)", out.len());
    Ok((out, count))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn offset_accounts_for_its_own_digits() {
        let mut header = TckHeader::default();
        header.fields.push(("timestamp".into(), "1.5".into()));
        for extra in 0..120 {
            header.fields[0].1 = "x".repeat(extra);
            let bytes = header.to_bytes().unwrap();
            let parsed = TckHeader::from_bytes(&bytes).unwrap();
            assert_eq!(parsed.offset, bytes.len());
        }
    }

    #[test]
    fn header_fields_survive() {
        let header = TckHeader {
            datatype: TckDataType::Float64,
            endianness: Endianness::Big,
            count: 42,
            offset: 0,
            fields: vec![
                ("command_history".into(), "tckgen in.mif out.tck".into()),
                ("step_size".into(), "0.5".into()),
            ],
        };
        let bytes = header.to_bytes().unwrap();
        let text = std::str::from_utf8(&bytes).unwrap();
        assert!(text.starts_with("mrtrix tracks\n"));
        assert!(text.contains("count: 0000000042\n"));
        assert!(text.ends_with("END\n"));
        let parsed = TckHeader::from_bytes(&bytes).unwrap();
        assert_eq!(parsed, TckHeader { offset: bytes.len(), ..header });
    }

    #[test]
    fn missing_end_or_datatype_is_malformed() {
        assert!(matches!(
            TckHeader::from_bytes(b"mrtrix tracks\ncount: 1\n"),
            Err(Error::MalformedHeader(_))
        ));
        assert!(matches!(
            TckHeader::from_bytes(b"mrtrix tracks\nfile: . 40\nEND\n"),
            Err(Error::MalformedHeader(_))
        ));
        assert!(matches!(
            TckHeader::from_bytes(b"mrtrix tracks\ndatatype: Int16LE\nfile: . 40\nEND\n"),
            Err(Error::UnsupportedDatatype(_))
        ));
    }

    #[test]
    fn streamlines_roundtrip() {
        let streamlines = vec![
            Streamline::new(vec![[0.0, 1.0, 2.0], [3.0, 4.0, 5.0], [6.0, 7.0, 8.0]]),
            Streamline::new(vec![[-1.5, 0.25, 9.0]]),
        ];
        for endianness in [Endianness::Little, Endianness::Big] {
            let header = TckHeader { endianness, ..TckHeader::default() };
            let (bytes, count) = encode(&header, streamlines.clone().into_iter().map(Ok)).unwrap();
            assert_eq!(count, 2);
            let parsed = TckHeader::from_bytes(&bytes).unwrap();
            assert_eq!(parsed.count, 2);

            let mut reader = &bytes[parsed.offset..];
            let mut back = Vec::new();
            while let Some(s) = parsed.read_streamline(&mut reader).unwrap() {
                back.push(s);
            }
            assert_eq!(back, streamlines);
        }
    }

    #[test]
    fn scalars_are_incompatible() {
        let s = Streamline {
            points: vec![[0.0; 3]],
            scalars: vec![vec![1.0]],
            properties: Vec::new(),
        };
        assert!(matches!(
            encode(&TckHeader::default(), [Ok(s)]),
            Err(Error::IncompatibleConversion(_))
        ));
    }

    #[test]
    fn partial_triplet_is_corrupt() {
        let header = TckHeader::default();
        let (bytes, _) = encode(&header, [Ok(Streamline::new(vec![[1.0; 3]]))]).unwrap();
        let parsed = TckHeader::from_bytes(&bytes).unwrap();
        let mut reader = &bytes[parsed.offset..parsed.offset + 7];
        assert!(matches!(
            parsed.read_streamline(&mut reader),
            Err(Error::CorruptStream(_))
        ));
    }
}
