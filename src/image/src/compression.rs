//! Stream compression detection by magic bytes.

use std::io::{self, Cursor, Read, Write};

use flate2::read::MultiGzDecoder;

use crate::media::Compression;

const GZIP_MAGIC: &[u8] = &[0x1f, 0x8b];
const ZSTD_MAGIC: &[u8] = &[0x28, 0xb5, 0x2f, 0xfd];
const BZIP2_MAGIC: &[u8] = b"BZh";
const XZ_MAGIC: &[u8] = &[0xfd, 0x37, 0x7a, 0x58, 0x5a, 0x00];

/// Compression algorithm of a byte stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Algorithm {
    Uncompressed,
    Gzip,
    Zstd,
    Bzip2,
    Xz,
}

impl Algorithm {
    /// Detect the algorithm from the first bytes of a stream.
    pub fn detect(head: &[u8]) -> Self {
        if head.starts_with(GZIP_MAGIC) {
            Algorithm::Gzip
        } else if head.starts_with(ZSTD_MAGIC) {
            Algorithm::Zstd
        } else if head.starts_with(BZIP2_MAGIC) {
            Algorithm::Bzip2
        } else if head.starts_with(XZ_MAGIC) {
            Algorithm::Xz
        } else {
            Algorithm::Uncompressed
        }
    }
}

impl std::fmt::Display for Algorithm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Algorithm::Uncompressed => "uncompressed",
            Algorithm::Gzip => "gzip",
            Algorithm::Zstd => "zstd",
            Algorithm::Bzip2 => "bzip2",
            Algorithm::Xz => "xz",
        };
        f.write_str(name)
    }
}

/// Wrap `reader` in the decoder its magic bytes call for.
///
/// Concatenated gzip members are decoded as one stream.
pub fn decompress<'a, R: Read + Send + 'a>(
    mut reader: R,
) -> io::Result<(Algorithm, Box<dyn Read + Send + 'a>)> {
    let mut head = Vec::with_capacity(XZ_MAGIC.len());
    (&mut reader)
        .take(XZ_MAGIC.len() as u64)
        .read_to_end(&mut head)?;
    let algorithm = Algorithm::detect(&head);
    let stream = Cursor::new(head).chain(reader);
    let decoded: Box<dyn Read + Send + 'a> = match algorithm {
        Algorithm::Uncompressed => Box::new(stream),
        Algorithm::Gzip => Box::new(MultiGzDecoder::new(stream)),
        Algorithm::Zstd => Box::new(zstd::stream::read::Decoder::new(stream)?),
        Algorithm::Bzip2 => Box::new(bzip2::read::BzDecoder::new(stream)),
        Algorithm::Xz => Box::new(xz2::read::XzDecoder::new(stream)),
    };
    Ok((algorithm, decoded))
}

/// Decompress a whole buffer.
pub fn decompress_all(data: &[u8]) -> io::Result<Vec<u8>> {
    let (_, mut reader) = decompress(data)?;
    let mut out = Vec::new();
    reader.read_to_end(&mut out)?;
    Ok(out)
}

/// Gzip a whole buffer at the default level.
pub fn gzip_all(data: &[u8]) -> io::Result<Vec<u8>> {
    let mut encoder = flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
    encoder.write_all(data)?;
    encoder.finish()
}

/// Compress `reader` into `writer` as `compression` calls for and return the
/// writer. `level` is the encoder level; `None` picks the default.
pub fn compress<R: Read, W: Write>(
    compression: Compression,
    level: Option<i32>,
    mut reader: R,
    writer: W,
) -> io::Result<W> {
    match compression {
        Compression::Uncompressed => {
            let mut writer = writer;
            io::copy(&mut reader, &mut writer)?;
            Ok(writer)
        }
        Compression::Gzip => {
            let level = level
                .map(|l| flate2::Compression::new(l.clamp(0, 9) as u32))
                .unwrap_or_default();
            let mut encoder = flate2::write::GzEncoder::new(writer, level);
            io::copy(&mut reader, &mut encoder)?;
            encoder.finish()
        }
        Compression::Zstd => {
            let mut encoder = zstd::stream::write::Encoder::new(writer, level.unwrap_or(3))?;
            io::copy(&mut reader, &mut encoder)?;
            encoder.finish()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_detect() {
        assert_eq!(Algorithm::detect(&[0x1f, 0x8b, 8]), Algorithm::Gzip);
        assert_eq!(Algorithm::detect(b"BZh91AY"), Algorithm::Bzip2);
        assert_eq!(Algorithm::detect(b"ustar"), Algorithm::Uncompressed);
        assert_eq!(Algorithm::detect(b""), Algorithm::Uncompressed);
    }

    #[test]
    fn test_decompress_gzip_members() {
        let mut data = gzip_all(b"hello ").unwrap();
        data.extend(gzip_all(b"world").unwrap());
        assert_eq!(decompress_all(&data).unwrap(), b"hello world");
    }

    #[test]
    fn test_decompress_each_algorithm() {
        let payload = b"layer payload".to_vec();

        let zstd_data = zstd::encode_all(&payload[..], 3).unwrap();
        assert_eq!(decompress_all(&zstd_data).unwrap(), payload);

        let mut bz = bzip2::write::BzEncoder::new(Vec::new(), bzip2::Compression::default());
        bz.write_all(&payload).unwrap();
        assert_eq!(decompress_all(&bz.finish().unwrap()).unwrap(), payload);

        let mut xz = xz2::write::XzEncoder::new(Vec::new(), 6);
        xz.write_all(&payload).unwrap();
        assert_eq!(decompress_all(&xz.finish().unwrap()).unwrap(), payload);

        assert_eq!(decompress_all(&payload).unwrap(), payload);
    }

    #[test]
    fn test_compress_then_detect() {
        let payload = b"tar bytes".to_vec();
        let gz = compress(Compression::Gzip, Some(9), &payload[..], Vec::new()).unwrap();
        assert_eq!(Algorithm::detect(&gz), Algorithm::Gzip);
        let zst = compress(Compression::Zstd, None, &payload[..], Vec::new()).unwrap();
        assert_eq!(Algorithm::detect(&zst), Algorithm::Zstd);
        assert_eq!(decompress_all(&zst).unwrap(), payload);
        let raw = compress(Compression::Uncompressed, None, &payload[..], Vec::new()).unwrap();
        assert_eq!(raw, payload);
    }

    #[test]
    fn test_decompress_short_input() {
        let (algorithm, mut reader) = decompress(&b"ab"[..]).unwrap();
        assert_eq!(algorithm, Algorithm::Uncompressed);
        let mut out = Vec::new();
        reader.read_to_end(&mut out).unwrap();
        assert_eq!(out, b"ab");
    }
}
