//! Transparent gzip/zstd stream handling and atomic file publication.
//!
//! Readers sniff the leading magic bytes, so callers always see plain
//! payload bytes. Writers compress into a temporary file next to the
//! destination and rename it into place only once everything succeeded.

use crate::error::{Error, Result};
use flate2::bufread::MultiGzDecoder;
use gzp::deflate::Gzip;
use gzp::par::compress::ParCompressBuilder;
use gzp::ZWriter;
use libdeflater::{CompressionLvl, Compressor, DecompressionError, Decompressor};
use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::Path;

const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];
const ZSTD_MAGIC: [u8; 4] = [0x28, 0xb5, 0x2f, 0xfd];

/// Buffer size for streaming decompression.
const STREAM_BUFFER_SIZE: usize = 256 * 1024;

/// Payloads at least this large are gzip-compressed on the rayon-backed gzp pool.
const PARALLEL_THRESHOLD: usize = 1024 * 1024;

/// Highest accepted compression level.
pub const MAX_LEVEL: u32 = 9;

thread_local! {
    static DECOMPRESSOR: std::cell::RefCell<Decompressor> = std::cell::RefCell::new(Decompressor::new());
}

/// Container compression wrapped around a format's payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Codec {
    /// Plain bytes.
    #[default]
    None,
    /// RFC 1952 gzip (single or multi-member).
    Gzip,
    /// Zstandard frame.
    Zstd,
}

impl Codec {
    /// Identify the codec from the leading bytes of a stream.
    pub fn sniff(head: &[u8]) -> Self {
        if head.starts_with(&GZIP_MAGIC) {
            Self::Gzip
        } else if head.starts_with(&ZSTD_MAGIC) {
            Self::Zstd
        } else {
            Self::None
        }
    }

    /// Codec implied by a file name suffix (`.gz`, `.zst`).
    pub fn from_path(path: &Path) -> Self {
        match path.extension().and_then(|e| e.to_str()) {
            Some(ext) if ext.eq_ignore_ascii_case("gz") => Self::Gzip,
            Some(ext) if ext.eq_ignore_ascii_case("zst") => Self::Zstd,
            _ => Self::None,
        }
    }

    /// File name suffix, without the dot.
    pub fn suffix(self) -> Option<&'static str> {
        match self {
            Self::None => None,
            Self::Gzip => Some("gz"),
            Self::Zstd => Some("zst"),
        }
    }

    /// Sniff the codec of a file from its first bytes.
    pub fn probe(path: &Path) -> Result<Self> {
        let mut head = [0u8; 4];
        let mut file = File::open(path)?;
        let n = read_up_to(&mut file, &mut head)?;
        Ok(Self::sniff(&head[..n]))
    }
}

/// Reject levels outside `0..=9`.
pub fn check_level(level: u32) -> Result<u32> {
    if level > MAX_LEVEL {
        return Err(Error::Configuration(format!(
            "compression level {level} outside 0..={MAX_LEVEL}"
        )));
    }
    Ok(level)
}

/// Read a whole file, hinting sequential access to the kernel.
#[cfg(target_os = "linux")]
pub fn read_file(path: &Path) -> Result<Vec<u8>> {
    use std::os::unix::io::AsRawFd;

    let file = File::open(path)?;
    let len = file.metadata()?.len() as usize;

    // SAFETY: the descriptor is valid for the lifetime of `file`; the call only
    // sets an advisory access pattern and never touches process memory.
    unsafe {
        libc::posix_fadvise(
            file.as_raw_fd(),
            0,
            len as libc::off_t,
            libc::POSIX_FADV_SEQUENTIAL,
        );
    }

    let mut buffer = Vec::with_capacity(len);
    let mut reader = BufReader::with_capacity(STREAM_BUFFER_SIZE, file);
    reader.read_to_end(&mut buffer)?;
    Ok(buffer)
}

#[cfg(not(target_os = "linux"))]
pub fn read_file(path: &Path) -> Result<Vec<u8>> {
    Ok(std::fs::read(path)?)
}

/// Decode a complete in-memory stream, passing plain bytes through.
pub fn decompress(bytes: Vec<u8>) -> Result<Vec<u8>> {
    match Codec::sniff(&bytes) {
        Codec::None => Ok(bytes),
        Codec::Gzip => decompress_gzip(&bytes),
        Codec::Zstd => zstd::stream::decode_all(bytes.as_slice())
            .map_err(|e| Error::from_stream(e, "zstd stream decode failed")),
    }
}

/// Read a file and decode it if compressed.
pub fn read_decompressed(path: &Path) -> Result<Vec<u8>> {
    decompress(read_file(path)?)
}

/// Open a file as a reader over its decompressed payload.
pub fn open_reader(path: &Path) -> Result<Box<dyn Read + Send>> {
    let codec = Codec::probe(path)?;
    log::debug!("opening {} as {:?} stream", path.display(), codec);
    decoder(File::open(path)?, codec)
}

/// Decode `codec` from an already opened stream positioned at its start.
pub fn decoder<'a, R>(inner: R, codec: Codec) -> Result<Box<dyn Read + Send + 'a>>
where
    R: Read + Send + 'a,
{
    let inner = BufReader::with_capacity(STREAM_BUFFER_SIZE, inner);
    Ok(match codec {
        Codec::None => Box::new(inner),
        Codec::Gzip => Box::new(MultiGzDecoder::new(inner)),
        Codec::Zstd => Box::new(
            zstd::stream::read::Decoder::with_buffer(inner)
                .map_err(|e| Error::from_stream(e, "zstd stream init failed"))?,
        ),
    })
}

/// Up to `len` leading payload bytes of a possibly compressed file.
pub fn read_head(path: &Path, len: usize) -> Result<Vec<u8>> {
    let mut reader = open_reader(path)?;
    let mut head = vec![0u8; len];
    let n = read_up_to(&mut reader, &mut head)
        .map_err(|e| match e {
            Error::Io(io) => Error::from_stream(io, "reading stream head"),
            other => other,
        })?;
    head.truncate(n);
    Ok(head)
}

/// Skip `count` payload bytes of a stream; short streams are corrupt.
pub fn skip(reader: &mut dyn Read, count: u64) -> Result<()> {
    let skipped = std::io::copy(&mut reader.take(count), &mut std::io::sink())
        .map_err(|e| Error::from_stream(e, "skipping to data offset"))?;
    if skipped < count {
        return Err(Error::CorruptStream(format!(
            "stream ended after {skipped} of {count} bytes"
        )));
    }
    Ok(())
}

/// Fill `buf` as far as the reader allows, returning the byte count.
fn read_up_to(reader: &mut dyn Read, buf: &mut [u8]) -> Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e.into()),
        }
    }
    Ok(filled)
}

fn estimate_gzip_uncompressed_size(compressed: &[u8]) -> usize {
    // ISIZE per RFC 1952: original size modulo 2^32, exact only for a
    // single member below 4 GiB.
    if compressed.len() >= 4 {
        let trailer = &compressed[compressed.len() - 4..];
        u32::from_le_bytes([trailer[0], trailer[1], trailer[2], trailer[3]]) as usize
    } else {
        compressed.len() * 4
    }
}

fn decompress_gzip_streaming(compressed: &[u8]) -> Result<Vec<u8>> {
    let mut decoder = MultiGzDecoder::new(BufReader::with_capacity(STREAM_BUFFER_SIZE, compressed));
    let capacity = estimate_gzip_uncompressed_size(compressed).min(compressed.len().saturating_mul(1032));
    let mut output = Vec::with_capacity(capacity);
    decoder
        .read_to_end(&mut output)
        .map_err(|e| Error::from_stream(e, "gzip stream decode failed"))?;
    Ok(output)
}

/// Single-shot libdeflate decode sized from the trailer, falling back to a
/// streaming decode for multi-member or oversized payloads.
fn decompress_gzip(compressed: &[u8]) -> Result<Vec<u8>> {
    let estimated = estimate_gzip_uncompressed_size(compressed);
    // Deflate cannot expand beyond ~1032:1, so a larger trailer value is not a size.
    if estimated == 0 || estimated / 1032 > compressed.len() {
        return decompress_gzip_streaming(compressed);
    }
    let mut output = vec![0u8; estimated];
    let result = DECOMPRESSOR.with(|d| d.borrow_mut().gzip_decompress(compressed, &mut output));
    match result {
        Ok(written) if written == estimated => Ok(output),
        // Short output: a multi-member stream stopped after its first member.
        Ok(_) | Err(DecompressionError::InsufficientSpace) => {
            log::debug!("gzip single-shot decode fell back to streaming");
            decompress_gzip_streaming(compressed)
        }
        Err(e) => Err(Error::CorruptStream(format!("gzip decode failed: {e}"))),
    }
}

/// Compress a payload in memory.
pub fn compress(payload: &[u8], codec: Codec, level: u32) -> Result<Vec<u8>> {
    let level = check_level(level)?;
    match codec {
        Codec::None => Ok(payload.to_vec()),
        Codec::Gzip => {
            let lvl = CompressionLvl::new(level as i32)
                .map_err(|e| Error::Configuration(format!("gzip level {level}: {e:?}")))?;
            let mut compressor = Compressor::new(lvl);
            let mut compressed = vec![0u8; compressor.gzip_compress_bound(payload.len())];
            let written = compressor
                .gzip_compress(payload, &mut compressed)
                .map_err(|e| Error::Io(std::io::Error::other(format!("compression failed: {e:?}"))))?;
            compressed.truncate(written);
            Ok(compressed)
        }
        Codec::Zstd => zstd::stream::encode_all(payload, zstd_level(level)).map_err(Error::Io),
    }
}

/// zstd treats level 0 as "default"; keep 0 meaning fastest.
fn zstd_level(level: u32) -> i32 {
    level.max(1) as i32
}

/// Write `payload` to `path` through `codec`, atomically.
///
/// The bytes go to a temporary file in the destination directory, which is
/// renamed over `path` only after the write fully succeeded. On any error
/// the temporary file is removed and `path` is left untouched.
pub fn write_atomic(path: &Path, payload: &[u8], codec: Codec, level: u32) -> Result<()> {
    let level = check_level(level)?;
    let parent = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    };
    let tmp = tempfile::NamedTempFile::new_in(parent)?;
    match codec {
        Codec::Gzip if payload.len() >= PARALLEL_THRESHOLD => {
            log::debug!(
                "parallel gzip of {} bytes at level {level} to {}",
                payload.len(),
                path.display()
            );
            let writer = BufWriter::with_capacity(1024 * 1024, tmp.reopen()?);
            let mut parz = ParCompressBuilder::<Gzip>::new()
                .compression_level(flate2::Compression::new(level))
                .from_writer(writer);
            parz.write_all(payload)?;
            parz.finish().map_err(|e| {
                Error::Io(std::io::Error::other(format!(
                    "parallel compression finish failed: {e}"
                )))
            })?;
        }
        _ => {
            let packed = match codec {
                Codec::None => std::borrow::Cow::Borrowed(payload),
                _ => std::borrow::Cow::Owned(compress(payload, codec, level)?),
            };
            let mut writer = BufWriter::with_capacity(1024 * 1024, tmp.as_file());
            writer.write_all(&packed)?;
            writer.flush()?;
        }
    }
    tmp.as_file().sync_all()?;
    tmp.persist(path).map_err(|e| Error::Io(e.error))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn payload() -> Vec<u8> {
        (0..50_000u32).flat_map(|v| (v % 251).to_le_bytes()).collect()
    }

    #[test]
    fn sniff_recognizes_magic() {
        assert_eq!(Codec::sniff(&[0x1f, 0x8b, 8, 0]), Codec::Gzip);
        assert_eq!(Codec::sniff(&[0x28, 0xb5, 0x2f, 0xfd]), Codec::Zstd);
        assert_eq!(Codec::sniff(b"n+1\0"), Codec::None);
        assert_eq!(Codec::sniff(&[]), Codec::None);
    }

    #[test]
    fn gzip_and_zstd_decode_to_original() {
        let data = payload();
        for codec in [Codec::Gzip, Codec::Zstd] {
            let packed = compress(&data, codec, 6).unwrap();
            assert_eq!(Codec::sniff(&packed), codec);
            assert_eq!(decompress(packed).unwrap(), data);
        }
    }

    #[test]
    fn multi_member_gzip_is_fully_decoded() {
        let a = compress(b"first ", Codec::Gzip, 1).unwrap();
        let b = compress(b"second member", Codec::Gzip, 1).unwrap();
        let joined = [a, b].concat();
        assert_eq!(decompress(joined).unwrap(), b"first second member");
    }

    #[test]
    fn truncated_gzip_is_corrupt() {
        let mut packed = compress(&payload(), Codec::Gzip, 6).unwrap();
        packed.truncate(packed.len() / 2);
        assert!(matches!(decompress(packed), Err(Error::CorruptStream(_))));
    }

    #[test]
    fn level_above_nine_is_rejected() {
        assert!(matches!(check_level(10), Err(Error::Configuration(_))));
        assert!(compress(b"x", Codec::Gzip, 12).is_err());
    }

    #[test]
    fn atomic_write_and_streamed_read() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("payload.bin.gz");
        let data = payload();
        write_atomic(&path, &data, Codec::Gzip, 4).unwrap();

        assert_eq!(Codec::probe(&path).unwrap(), Codec::Gzip);
        assert_eq!(read_decompressed(&path).unwrap(), data);
        assert_eq!(read_head(&path, 8).unwrap(), data[..8]);

        let mut reader = open_reader(&path).unwrap();
        skip(&mut reader, 4).unwrap();
        let mut next = [0u8; 4];
        reader.read_exact(&mut next).unwrap();
        assert_eq!(next, data[4..8]);
    }

    #[test]
    fn failed_write_leaves_destination_untouched() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("keep.bin");
        std::fs::write(&path, b"original").unwrap();
        assert!(write_atomic(&path, b"new", Codec::Gzip, 42).is_err());
        assert_eq!(std::fs::read(&path).unwrap(), b"original");
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 1);
    }

    #[test]
    fn skip_past_end_is_corrupt() {
        let mut reader: &[u8] = b"short";
        assert!(matches!(skip(&mut reader, 10), Err(Error::CorruptStream(_))));
    }
}
