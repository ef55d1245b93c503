//! Format detection and dispatch.
//!
//! A fixed table pairs each [`Format`] with a structural signature test and
//! the file name extensions used when writing. Detection always looks at the
//! decompressed leading bytes; extensions only decide where to write.

use crate::compression::{self, Codec};
use crate::error::{Error, Result};
use crate::scaling::ScalingCapability;
use byteorder::{BigEndian, ByteOrder, LittleEndian};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

/// Leading payload bytes inspected by [`detect`].
const HEAD_LEN: usize = 2048;

/// Every format this crate can identify.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Format {
    /// NIfTI-1, single file or `.hdr`/`.img` pair.
    Nifti1,
    /// NIfTI-2.
    Nifti2,
    /// Analyze 7.5 `.hdr`/`.img` pair.
    Analyze,
    /// MINC2 (HDF5 container).
    Minc2,
    /// Philips PAR/REC.
    ParRec,
    /// GIFTI XML.
    Gifti,
    /// TrackVis streamlines.
    Trk,
    /// MRtrix streamlines.
    Tck,
}

struct Entry {
    format: Format,
    signature: fn(&[u8]) -> bool,
    extensions: &'static [&'static str],
}

/// Checked in order: NIfTI before Analyze, which shares its header size.
static REGISTRY: [Entry; 8] = [
    Entry {
        format: Format::Nifti1,
        signature: is_nifti1,
        extensions: &["nii", "hdr", "img"],
    },
    Entry {
        format: Format::Nifti2,
        signature: is_nifti2,
        extensions: &["nii"],
    },
    Entry {
        format: Format::Analyze,
        signature: is_analyze,
        extensions: &["hdr", "img"],
    },
    Entry {
        format: Format::Minc2,
        signature: is_hdf5,
        extensions: &["mnc"],
    },
    Entry {
        format: Format::ParRec,
        signature: is_par,
        extensions: &["par", "rec"],
    },
    Entry {
        format: Format::Gifti,
        signature: is_gifti,
        extensions: &["gii"],
    },
    Entry {
        format: Format::Trk,
        signature: is_trk,
        extensions: &["trk"],
    },
    Entry {
        format: Format::Tck,
        signature: is_tck,
        extensions: &["tck"],
    },
];

fn sizeof_hdr_is(head: &[u8], size: i32) -> bool {
    head.len() >= 4 && (LittleEndian::read_i32(head) == size || BigEndian::read_i32(head) == size)
}

fn is_nifti1(head: &[u8]) -> bool {
    sizeof_hdr_is(head, 348)
        && head
            .get(344..348)
            .is_some_and(|m| m == b"n+1\0" || m == b"ni1\0")
}

fn is_nifti2(head: &[u8]) -> bool {
    sizeof_hdr_is(head, 540)
        && head
            .get(4..12)
            .is_some_and(|m| m == b"n+2\0\r\n\x1a\n" || m == b"ni2\0\r\n\x1a\n")
}

fn is_analyze(head: &[u8]) -> bool {
    sizeof_hdr_is(head, 348) && head.len() >= 348 && !is_nifti1(head)
}

fn is_hdf5(head: &[u8]) -> bool {
    head.starts_with(b"\x89HDF\r\n\x1a\n")
}

fn contains(head: &[u8], needle: &[u8]) -> bool {
    head.windows(needle.len()).any(|w| w == needle)
}

fn is_par(head: &[u8]) -> bool {
    head.starts_with(b"#") && contains(head, b"DATA DESCRIPTION FILE")
}

fn is_gifti(head: &[u8]) -> bool {
    let text = head.strip_prefix(b"\xef\xbb\xbf").unwrap_or(head);
    text.trim_ascii_start().starts_with(b"<") && contains(text, b"<GIFTI")
}

fn is_trk(head: &[u8]) -> bool {
    head.starts_with(b"TRACK")
}

fn is_tck(head: &[u8]) -> bool {
    head.starts_with(b"mrtrix tracks")
}

/// Identify a format from leading (decompressed) payload bytes.
pub fn detect_bytes(head: &[u8]) -> Result<Format> {
    REGISTRY
        .iter()
        .find(|entry| (entry.signature)(head))
        .map(|entry| entry.format)
        .ok_or_else(|| {
            Error::UnrecognizedFormat(format!(
                "no format signature matches leading bytes {:02x?}",
                &head[..head.len().min(8)]
            ))
        })
}

/// Identify the format of a file by its content.
///
/// Data files of a pair (`.img`, `.REC`) are identified through their
/// header file.
pub fn detect(path: &Path) -> Result<Format> {
    let header_path = resolve_pair(path)?.map_or_else(|| path.to_path_buf(), |(h, _)| h);
    let head = compression::read_head(&header_path, HEAD_LEN)?;
    let format = detect_bytes(&head)
        .map_err(|e| Error::UnrecognizedFormat(format!("{}: {e}", path.display())))?;
    // a bare 348-byte header is only Analyze when named as a pair; anything
    // else is a NIfTI file with damaged magic
    if format == Format::Analyze
        && !matches!(base_extension(path).as_deref(), Some("hdr" | "img"))
    {
        return Err(Error::UnrecognizedFormat(format!(
            "{}: 348-byte header without NIfTI magic outside an .hdr/.img pair",
            path.display()
        )));
    }
    log::debug!("detected {} as {format}", path.display());
    Ok(format)
}

impl Format {
    pub const ALL: [Self; 8] = [
        Self::Nifti1,
        Self::Nifti2,
        Self::Analyze,
        Self::Minc2,
        Self::ParRec,
        Self::Gifti,
        Self::Trk,
        Self::Tck,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Self::Nifti1 => "nifti1",
            Self::Nifti2 => "nifti2",
            Self::Analyze => "analyze",
            Self::Minc2 => "minc2",
            Self::ParRec => "parrec",
            Self::Gifti => "gifti",
            Self::Trk => "trk",
            Self::Tck => "tck",
        }
    }

    /// Streamline formats rather than voxel arrays.
    pub fn is_tractogram(self) -> bool {
        matches!(self, Self::Trk | Self::Tck)
    }

    /// Whether this crate can encode the format.
    pub fn is_writable(self) -> bool {
        !matches!(self, Self::Minc2 | Self::ParRec)
    }

    /// What the format can record about stored-value scaling.
    pub fn scaling_capability(self) -> ScalingCapability {
        match self {
            Self::Nifti1 | Self::Nifti2 | Self::ParRec | Self::Minc2 => ScalingCapability::SlopeInter,
            Self::Analyze => ScalingCapability::Slope,
            Self::Gifti | Self::Trk | Self::Tck => ScalingCapability::None,
        }
    }

    /// Known file name extensions, without compression suffix.
    pub fn extensions(self) -> &'static [&'static str] {
        REGISTRY
            .iter()
            .find(|e| e.format == self)
            .map_or(&[], |e| e.extensions)
    }

    /// Format to write for a file name.
    ///
    /// `.hdr`/`.img` select a NIfTI-1 pair; Analyze output has to be
    /// requested explicitly.
    pub fn from_path(path: &Path) -> Result<Self> {
        let ext = base_extension(path).ok_or_else(|| {
            Error::UnrecognizedFormat(format!("{} has no file extension", path.display()))
        })?;
        REGISTRY
            .iter()
            .find(|e| e.extensions.contains(&ext.as_str()))
            .map(|e| e.format)
            .ok_or_else(|| {
                Error::UnrecognizedFormat(format!(
                    "no format uses the extension .{ext} ({})",
                    path.display()
                ))
            })
    }
}

impl fmt::Display for Format {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Format {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "nifti1" | "nifti" | "nii" => Ok(Self::Nifti1),
            "nifti2" => Ok(Self::Nifti2),
            "analyze" => Ok(Self::Analyze),
            "minc2" | "minc" | "mnc" => Ok(Self::Minc2),
            "parrec" | "par" => Ok(Self::ParRec),
            "gifti" | "gii" => Ok(Self::Gifti),
            "trk" | "trackvis" => Ok(Self::Trk),
            "tck" | "mrtrix" => Ok(Self::Tck),
            _ => Err(Error::Configuration(format!(
                "unknown format: '{s}' (expected nifti1, nifti2, analyze, gifti, trk, ...)"
            ))),
        }
    }
}

/// Lower-case extension with any compression suffix removed.
pub(crate) fn base_extension(path: &Path) -> Option<String> {
    let stem = strip_codec(path);
    stem.extension()
        .and_then(|e| e.to_str())
        .map(str::to_ascii_lowercase)
}

fn strip_codec(path: &Path) -> PathBuf {
    match Codec::from_path(path) {
        Codec::None => path.to_path_buf(),
        _ => path.with_extension(""),
    }
}

/// `(header, data)` paths of a two-file format, or `None` for single files.
///
/// The letter case of the data extension follows the given one, and a
/// compression suffix carries over to the sibling.
pub fn paired_paths(path: &Path) -> Option<(PathBuf, PathBuf)> {
    let codec_suffix = Codec::from_path(path).suffix();
    let base = strip_codec(path);
    let ext = base.extension()?.to_str()?;
    let (header_ext, data_ext) = match ext.to_ascii_lowercase().as_str() {
        "hdr" | "img" => ("hdr", "img"),
        "par" | "rec" => ("par", "rec"),
        _ => return None,
    };
    let upper = ext.chars().all(|c| c.is_ascii_uppercase());
    let with = |e: &str| {
        let e = if upper { e.to_ascii_uppercase() } else { e.to_string() };
        let p = base.with_extension(e);
        match codec_suffix {
            Some(s) => PathBuf::from(format!("{}.{s}", p.display())),
            None => p,
        }
    };
    Some((with(header_ext), with(data_ext)))
}

/// Pair paths for reading: like [`paired_paths`], but a sibling that only
/// exists without (or with a different) compression suffix is found too.
pub fn resolve_pair(path: &Path) -> Result<Option<(PathBuf, PathBuf)>> {
    let Some((header, data)) = paired_paths(path) else {
        return Ok(None);
    };
    let find = |p: PathBuf| -> PathBuf {
        if p.exists() {
            return p;
        }
        let plain = strip_codec(&p);
        [None, Some("gz"), Some("zst")]
            .into_iter()
            .map(|suffix| match suffix {
                Some(s) => PathBuf::from(format!("{}.{s}", plain.display())),
                None => plain.clone(),
            })
            .find(|candidate| candidate.exists())
            .unwrap_or(p)
    };
    Ok(Some((find(header), find(data))))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signatures() {
        let mut nifti = vec![0u8; 352];
        LittleEndian::write_i32(&mut nifti, 348);
        nifti[344..348].copy_from_slice(b"n+1\0");
        assert_eq!(detect_bytes(&nifti).unwrap(), Format::Nifti1);

        nifti[344..348].copy_from_slice(b"\0\0\0\0");
        assert_eq!(detect_bytes(&nifti).unwrap(), Format::Analyze);

        let mut big = vec![0u8; 352];
        BigEndian::write_i32(&mut big, 348);
        big[344..348].copy_from_slice(b"ni1\0");
        assert_eq!(detect_bytes(&big).unwrap(), Format::Nifti1);

        assert_eq!(detect_bytes(b"TRACK\0\0\0").unwrap(), Format::Trk);
        assert_eq!(detect_bytes(b"mrtrix tracks\ncount: 1\n").unwrap(), Format::Tck);
        assert_eq!(
            detect_bytes(b"<?xml version=\"1.0\"?>\n<GIFTI Version=\"1.0\">").unwrap(),
            Format::Gifti
        );
        assert_eq!(detect_bytes(b"\x89HDF\r\n\x1a\n").unwrap(), Format::Minc2);
        assert_eq!(
            detect_bytes(b"# === DATA DESCRIPTION FILE ===\n").unwrap(),
            Format::ParRec
        );
    }

    #[test]
    fn garbage_is_unrecognized() {
        assert!(matches!(detect_bytes(b"not an image"), Err(Error::UnrecognizedFormat(_))));
        assert!(matches!(detect_bytes(&[]), Err(Error::UnrecognizedFormat(_))));
    }

    #[test]
    fn formats_for_writing() {
        assert_eq!(Format::from_path(Path::new("a.nii.gz")).unwrap(), Format::Nifti1);
        assert_eq!(Format::from_path(Path::new("a.hdr")).unwrap(), Format::Nifti1);
        assert_eq!(Format::from_path(Path::new("a.surf.gii")).unwrap(), Format::Gifti);
        assert_eq!(Format::from_path(Path::new("t.TRK")).unwrap(), Format::Trk);
        assert!(Format::from_path(Path::new("a.xyz")).is_err());
        assert_eq!("NIfTI2".parse::<Format>().unwrap(), Format::Nifti2);
        assert!("bmp".parse::<Format>().is_err());
    }

    #[test]
    fn pair_paths_follow_case_and_codec() {
        let (h, d) = paired_paths(Path::new("/x/scan.REC")).unwrap();
        assert_eq!(h, Path::new("/x/scan.PAR"));
        assert_eq!(d, Path::new("/x/scan.REC"));

        let (h, d) = paired_paths(Path::new("vol.img.gz")).unwrap();
        assert_eq!(h, Path::new("vol.hdr.gz"));
        assert_eq!(d, Path::new("vol.img.gz"));

        assert!(paired_paths(Path::new("vol.nii")).is_none());
    }
}
