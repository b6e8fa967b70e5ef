//! Blob compression and exact-size decompression.

use std::io::{self, Read, Write};

use depot_schema::{CompressionScheme, ZSTD_MAGIC};
use flate2::Compression;
use flate2::read::DeflateDecoder;
use flate2::write::DeflateEncoder;
use thiserror::Error;
use zstd::stream::raw::{Decoder, InBuffer, Operation, OutBuffer};

/// Compression must save at least this many bytes to be worth storing.
pub const COMPRESSION_SAVINGS_THRESHOLD: usize = 10;

/// Level used for zstd blobs.
pub const ZSTD_LEVEL: i32 = 3;

/// Failures while turning a stored blob back into bytes.
#[derive(Error, Debug)]
pub enum CodecError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("stream ended after {actual} of {expected} bytes")]
    Underrun { expected: usize, actual: usize },

    #[error("stream holds more than the declared {expected} bytes")]
    Overrun { expected: usize },

    #[error("malformed {scheme} stream: {reason}")]
    Malformed {
        scheme: CompressionScheme,
        reason: String,
    },
}

/// Random-access view over stored bytes.
pub(crate) trait BlobSource {
    fn len(&self) -> usize;
    fn read_exact_at(&self, buf: &mut [u8], offset: usize) -> io::Result<()>;
}

impl BlobSource for [u8] {
    fn len(&self) -> usize {
        <[u8]>::len(self)
    }

    fn read_exact_at(&self, buf: &mut [u8], offset: usize) -> io::Result<()> {
        let end = offset + buf.len();
        let src = self
            .get(offset..end)
            .ok_or_else(|| io::Error::from(io::ErrorKind::UnexpectedEof))?;
        buf.copy_from_slice(src);
        Ok(())
    }
}

impl BlobSource for rusqlite::blob::Blob<'_> {
    fn len(&self) -> usize {
        rusqlite::blob::Blob::len(self)
    }

    fn read_exact_at(&self, buf: &mut [u8], offset: usize) -> io::Result<()> {
        self.read_at_exact(buf, offset).map_err(io::Error::other)
    }
}

/// Sequential reader over a [`BlobSource`].
struct SourceReader<'a, S: BlobSource + ?Sized> {
    source: &'a S,
    pos: usize,
}

impl<S: BlobSource + ?Sized> Read for SourceReader<'_, S> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = buf.len().min(self.source.len() - self.pos);
        if n == 0 {
            return Ok(0);
        }
        self.source.read_exact_at(&mut buf[..n], self.pos)?;
        self.pos += n;
        Ok(n)
    }
}

/// Compress `data` with exactly `scheme`.
///
/// # Errors
///
/// Propagates encoder I/O errors.
pub fn compress(data: &[u8], scheme: CompressionScheme) -> io::Result<Vec<u8>> {
    match scheme {
        CompressionScheme::None => Ok(data.to_vec()),
        CompressionScheme::Deflate => {
            let mut encoder = DeflateEncoder::new(Vec::new(), Compression::default());
            encoder.write_all(data)?;
            encoder.finish()
        }
        CompressionScheme::ZStd => zstd::bulk::compress(data, ZSTD_LEVEL),
    }
}

/// Compress with `preferred`, falling back to [`CompressionScheme::None`] when the
/// savings are below [`COMPRESSION_SAVINGS_THRESHOLD`].
///
/// # Errors
///
/// Propagates encoder I/O errors.
pub fn compress_for_storage(
    data: &[u8],
    preferred: CompressionScheme,
) -> io::Result<(CompressionScheme, Vec<u8>)> {
    if preferred == CompressionScheme::None {
        return Ok((CompressionScheme::None, data.to_vec()));
    }

    let packed = compress(data, preferred)?;
    if packed.len() + COMPRESSION_SAVINGS_THRESHOLD <= data.len() {
        Ok((preferred, packed))
    } else {
        Ok((CompressionScheme::None, data.to_vec()))
    }
}

/// Input chunk size recommended by zstd for streaming decompression.
pub(crate) fn zstd_chunk_size() -> usize {
    zstd::zstd_safe::DCtx::in_size()
}

/// Decode a stored blob into exactly `size` bytes.
pub(crate) fn decode<S: BlobSource + ?Sized>(
    source: &S,
    scheme: CompressionScheme,
    size: usize,
    zstd: &mut Decoder<'static>,
) -> Result<Vec<u8>, CodecError> {
    match scheme {
        CompressionScheme::None => decode_plain(source, size),
        CompressionScheme::Deflate => decode_deflate(source, size),
        CompressionScheme::ZStd => decode_zstd(source, size, zstd, zstd_chunk_size()),
    }
}

fn decode_plain<S: BlobSource + ?Sized>(source: &S, size: usize) -> Result<Vec<u8>, CodecError> {
    let len = source.len();
    if len < size {
        return Err(CodecError::Underrun {
            expected: size,
            actual: len,
        });
    }
    if len > size {
        return Err(CodecError::Overrun { expected: size });
    }

    let mut out = vec![0u8; size];
    source.read_exact_at(&mut out, 0)?;
    Ok(out)
}

fn decode_deflate<S: BlobSource + ?Sized>(source: &S, size: usize) -> Result<Vec<u8>, CodecError> {
    let malformed = |e: io::Error| match e.kind() {
        io::ErrorKind::InvalidData | io::ErrorKind::InvalidInput | io::ErrorKind::UnexpectedEof => {
            CodecError::Malformed {
                scheme: CompressionScheme::Deflate,
                reason: e.to_string(),
            }
        }
        _ => CodecError::Io(e),
    };

    let mut decoder = DeflateDecoder::new(SourceReader { source, pos: 0 });
    let mut out = vec![0u8; size];
    let mut filled = 0;

    while filled < size {
        let n = decoder.read(&mut out[filled..]).map_err(malformed)?;
        if n == 0 {
            return Err(CodecError::Underrun {
                expected: size,
                actual: filled,
            });
        }
        filled += n;
    }

    let mut overrun = [0u8; 1];
    if decoder.read(&mut overrun).map_err(malformed)? != 0 {
        return Err(CodecError::Overrun { expected: size });
    }

    Ok(out)
}

fn decode_zstd<S: BlobSource + ?Sized>(
    source: &S,
    size: usize,
    dctx: &mut Decoder<'static>,
    chunk_size: usize,
) -> Result<Vec<u8>, CodecError> {
    let malformed = |reason: String| CodecError::Malformed {
        scheme: CompressionScheme::ZStd,
        reason,
    };

    // A previous read may have bailed out mid-frame.
    dctx.reinit()?;

    let total = source.len();
    if total < ZSTD_MAGIC.len() {
        return Err(malformed(format!("{total} byte blob has no frame header")));
    }

    let mut chunk = vec![0u8; chunk_size.min(total)];
    let mut out = vec![0u8; size];
    let mut written = 0usize;
    let mut offset = 0usize;
    let mut finished = false;
    let mut trailing = false;

    while offset < total && !finished {
        let len = chunk.len().min(total - offset);
        source.read_exact_at(&mut chunk[..len], offset)?;
        if offset == 0 && chunk[..ZSTD_MAGIC.len()] != ZSTD_MAGIC {
            return Err(malformed("bad frame magic".to_string()));
        }
        offset += len;

        let mut input = InBuffer::around(&chunk[..len]);
        while input.pos() < len {
            let consumed_before = input.pos();
            let mut output = OutBuffer::around(&mut out[written..]);
            let hint = dctx
                .run(&mut input, &mut output)
                .map_err(|e| malformed(e.to_string()))?;
            let produced = output.pos();
            written += produced;

            if hint == 0 {
                finished = true;
                trailing = input.pos() < len || offset < total;
                break;
            }

            if produced == 0 && input.pos() == consumed_before {
                // No progress possible: the output buffer is full and more remains.
                return if written == size {
                    Err(CodecError::Overrun { expected: size })
                } else {
                    Err(malformed("decoder stalled".to_string()))
                };
            }
        }
    }

    if finished {
        if written < size {
            return Err(CodecError::Underrun {
                expected: size,
                actual: written,
            });
        }
        if trailing {
            return Err(CodecError::Overrun { expected: size });
        }
        return Ok(out);
    }

    // Input exhausted without a frame end. Either the frame is truncated or it
    // still holds output that does not fit.
    if written == size {
        let mut overrun = [0u8; 1];
        let mut input = InBuffer::around(&[]);
        let mut output = OutBuffer::around(&mut overrun[..]);
        dctx.run(&mut input, &mut output)
            .map_err(|e| malformed(e.to_string()))?;
        if output.pos() > 0 {
            return Err(CodecError::Overrun { expected: size });
        }
    }

    Err(CodecError::Underrun {
        expected: size,
        actual: written,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn noise(len: usize) -> Vec<u8> {
        // xorshift keeps the data incompressible without a rand dependency in tests.
        let mut state = 0x9E37_79B9_7F4A_7C15_u64;
        (0..len)
            .map(|_| {
                state ^= state << 13;
                state ^= state >> 7;
                state ^= state << 17;
                state as u8
            })
            .collect()
    }

    fn roundtrip(data: &[u8], scheme: CompressionScheme) -> Result<Vec<u8>, CodecError> {
        let packed = compress(data, scheme).unwrap();
        let mut dctx = Decoder::new().unwrap();
        decode(packed.as_slice(), scheme, data.len(), &mut dctx)
    }

    #[test]
    fn test_all_schemes_round_trip() {
        let big = noise(zstd_chunk_size() * 3 + 17);
        for scheme in [
            CompressionScheme::None,
            CompressionScheme::Deflate,
            CompressionScheme::ZStd,
        ] {
            for data in [&b""[..], &b"x"[..], big.as_slice()] {
                assert_eq!(roundtrip(data, scheme).unwrap(), data, "{scheme} len {}", data.len());
            }
        }
    }

    #[test]
    fn test_small_chunks_force_many_pulls() {
        let data = noise(10_000);
        let packed = compress(&data, CompressionScheme::ZStd).unwrap();
        let mut dctx = Decoder::new().unwrap();
        let out = decode_zstd(packed.as_slice(), data.len(), &mut dctx, 64).unwrap();
        assert_eq!(out, data);
    }

    #[test]
    fn test_declared_size_too_large_is_underrun() {
        let data = b"hello world hello world hello world".repeat(10);
        for scheme in [
            CompressionScheme::None,
            CompressionScheme::Deflate,
            CompressionScheme::ZStd,
        ] {
            let packed = compress(&data, scheme).unwrap();
            let mut dctx = Decoder::new().unwrap();
            let err = decode(packed.as_slice(), scheme, data.len() + 5, &mut dctx).unwrap_err();
            assert!(matches!(err, CodecError::Underrun { .. }), "{scheme}: {err}");
        }
    }

    #[test]
    fn test_declared_size_too_small_is_overrun() {
        let data = b"hello world hello world hello world".repeat(10);
        for scheme in [
            CompressionScheme::None,
            CompressionScheme::Deflate,
            CompressionScheme::ZStd,
        ] {
            let packed = compress(&data, scheme).unwrap();
            let mut dctx = Decoder::new().unwrap();
            let err = decode(packed.as_slice(), scheme, data.len() - 5, &mut dctx).unwrap_err();
            assert!(matches!(err, CodecError::Overrun { .. }), "{scheme}: {err}");
        }
    }

    #[test]
    fn test_context_reusable_after_failure() {
        let data = noise(4096);
        let packed = compress(&data, CompressionScheme::ZStd).unwrap();
        let mut dctx = Decoder::new().unwrap();

        let truncated = &packed[..packed.len() / 2];
        assert!(decode(truncated, CompressionScheme::ZStd, data.len(), &mut dctx).is_err());
        let out = decode(packed.as_slice(), CompressionScheme::ZStd, data.len(), &mut dctx).unwrap();
        assert_eq!(out, data);
    }

    #[test]
    fn test_garbage_is_malformed() {
        let mut dctx = Decoder::new().unwrap();
        let err = decode(&b"not zstd at all"[..], CompressionScheme::ZStd, 4, &mut dctx).unwrap_err();
        assert!(matches!(err, CodecError::Malformed { .. }));
    }

    #[test]
    fn test_storage_threshold() {
        let (scheme, bytes) = compress_for_storage(b"abc", CompressionScheme::ZStd).unwrap();
        assert_eq!(scheme, CompressionScheme::None);
        assert_eq!(bytes, b"abc");

        let text = b"aaaaaaaaaa".repeat(100);
        let (scheme, bytes) = compress_for_storage(&text, CompressionScheme::Deflate).unwrap();
        assert_eq!(scheme, CompressionScheme::Deflate);
        assert!(bytes.len() < text.len());
    }
}
