//! NIfTI header extensions.
//!
//! After the fixed header comes a 4-byte extender; a non-zero first byte
//! announces a chain of `(esize, ecode, data)` records running up to
//! `vox_offset` (or to the end of a `.hdr` file). Payloads are kept exactly
//! as stored, padding included, so an untouched extension re-encodes to the
//! same bytes.

use crate::datatype::Endianness;
use crate::error::{Error, Result};
use byteorder::{BigEndian, ByteOrder, LittleEndian};

/// Registered extension codes.
pub mod codes {
    pub const IGNORE: i32 = 0;
    pub const DICOM: i32 = 2;
    pub const AFNI: i32 = 4;
    pub const COMMENT: i32 = 6;
    pub const XCEDE: i32 = 8;
    pub const JIMDIMINFO: i32 = 10;
    pub const WORKFLOW_FWDS: i32 = 12;
    pub const FREESURFER: i32 = 14;
    pub const PYPICKLE: i32 = 16;
    pub const MIND_IDENT: i32 = 18;
    pub const B_VALUE: i32 = 20;
    pub const SPHERICAL_DIRECTION: i32 = 22;
    pub const DT_COMPONENT: i32 = 24;
    pub const SHC_DEGREEORDER: i32 = 26;
    pub const VOXBO: i32 = 28;
    pub const CARET: i32 = 30;
    pub const CIFTI: i32 = 32;
    pub const VARIABLE_FRAME_TIMING: i32 = 34;
    pub const EVAL: i32 = 38;
    pub const MATLAB: i32 = 40;
    pub const QUANTIPHYSE: i32 = 42;
    pub const MRS: i32 = 44;
}

/// One opaque extension record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Extension {
    pub code: i32,
    pub data: Vec<u8>,
}

impl Extension {
    pub fn new(code: i32, data: Vec<u8>) -> Self {
        Self { code, data }
    }

    /// Text extension (comments, AFNI XML, CIFTI XML).
    pub fn text(code: i32, text: &str) -> Self {
        Self::new(code, text.as_bytes().to_vec())
    }

    /// Payload as text with trailing NUL padding removed.
    pub fn as_text(&self) -> String {
        let end = self
            .data
            .iter()
            .rposition(|&b| b != 0)
            .map_or(0, |p| p + 1);
        String::from_utf8_lossy(&self.data[..end]).into_owned()
    }

    /// On-disk record size: 8 header bytes plus the payload, rounded up to 16.
    pub fn esize(&self) -> usize {
        (8 + self.data.len()).div_ceil(16) * 16
    }
}

/// Bytes taken by the extender and all records.
pub fn encoded_len(extensions: &[Extension]) -> usize {
    4 + extensions.iter().map(Extension::esize).sum::<usize>()
}

/// Parse the extender and records from the bytes following the header.
pub fn parse(bytes: &[u8], endianness: Endianness) -> Result<Vec<Extension>> {
    match endianness {
        Endianness::Little => parse_with::<LittleEndian>(bytes),
        Endianness::Big => parse_with::<BigEndian>(bytes),
    }
}

fn parse_with<E: ByteOrder>(bytes: &[u8]) -> Result<Vec<Extension>> {
    if bytes.len() < 4 || bytes[0] == 0 {
        return Ok(Vec::new());
    }
    let mut extensions = Vec::new();
    let mut pos = 4;
    while pos + 8 <= bytes.len() {
        let esize = E::read_i32(&bytes[pos..pos + 4]);
        let code = E::read_i32(&bytes[pos + 4..pos + 8]);
        if esize == 0 {
            // zero fill up to vox_offset
            break;
        }
        if esize < 8 || pos + esize as usize > bytes.len() {
            return Err(Error::MalformedHeader(format!(
                "extension at byte {pos} has esize {esize}, {} bytes remain",
                bytes.len() - pos
            )));
        }
        let esize = esize as usize;
        if esize % 16 != 0 {
            log::warn!("extension code {code} has esize {esize}, not a multiple of 16");
        }
        extensions.push(Extension::new(code, bytes[pos + 8..pos + esize].to_vec()));
        pos += esize;
    }
    log::debug!("parsed {} header extensions", extensions.len());
    Ok(extensions)
}

/// Encode the extender and records; a bare zero extender when empty.
pub fn encode(extensions: &[Extension], endianness: Endianness) -> Vec<u8> {
    match endianness {
        Endianness::Little => encode_with::<LittleEndian>(extensions),
        Endianness::Big => encode_with::<BigEndian>(extensions),
    }
}

fn encode_with<E: ByteOrder>(extensions: &[Extension]) -> Vec<u8> {
    let mut out = vec![0u8; encoded_len(extensions)];
    if extensions.is_empty() {
        return out;
    }
    out[0] = 1;
    let mut pos = 4;
    for ext in extensions {
        let esize = ext.esize();
        E::write_i32(&mut out[pos..pos + 4], esize as i32);
        E::write_i32(&mut out[pos + 4..pos + 8], ext.code);
        out[pos + 8..pos + 8 + ext.data.len()].copy_from_slice(&ext.data);
        pos += esize;
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_extender_is_four_zero_bytes() {
        assert_eq!(encode(&[], Endianness::Little), vec![0, 0, 0, 0]);
        assert!(parse(&[0, 0, 0, 0], Endianness::Little).unwrap().is_empty());
        assert!(parse(&[], Endianness::Big).unwrap().is_empty());
    }

    #[test]
    fn records_are_padded_to_sixteen() {
        let ext = Extension::text(codes::COMMENT, "hello");
        assert_eq!(ext.esize(), 16);
        let bytes = encode(&[ext], Endianness::Big);
        assert_eq!(bytes.len(), 20);
        assert_eq!(BigEndian::read_i32(&bytes[4..8]), 16);

        let parsed = parse(&bytes, Endianness::Big).unwrap();
        assert_eq!(parsed.len(), 1);
        assert_eq!(parsed[0].code, codes::COMMENT);
        assert_eq!(parsed[0].data.len(), 8);
        assert_eq!(parsed[0].as_text(), "hello");
        // Padding is part of the payload now, so re-encoding is byte-exact.
        assert_eq!(encode(&parsed, Endianness::Big), bytes);
    }

    #[test]
    fn chained_records() {
        let exts = vec![
            Extension::new(codes::AFNI, vec![7u8; 40]),
            Extension::new(codes::DICOM, vec![1u8; 8]),
        ];
        let bytes = encode(&exts, Endianness::Little);
        assert_eq!(bytes.len(), encoded_len(&exts));
        let parsed = parse(&bytes, Endianness::Little).unwrap();
        assert_eq!(parsed.iter().map(|e| e.code).collect::<Vec<_>>(), vec![codes::AFNI, codes::DICOM]);
        assert_eq!(parsed[0].data[..40], [7u8; 40]);
    }

    #[test]
    fn overrunning_record_is_malformed() {
        let mut bytes = encode(&[Extension::text(codes::COMMENT, "x")], Endianness::Little);
        LittleEndian::write_i32(&mut bytes[4..8], 64);
        assert!(matches!(parse(&bytes, Endianness::Little), Err(Error::MalformedHeader(_))));
    }
}
