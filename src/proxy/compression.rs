//! Content-Encoding codecs for bodies that hooks want to read or rewrite.

use std::io::{Read, Write};

use bytes::Bytes;

use crate::error::{ProxyError, Result};

/// Pluggable body codec. The proxy only decides when to call it, based on
/// `Content-Encoding`.
pub trait Compression: Send + Sync {
    fn compress(&self, data: &[u8], encoding: &str) -> Result<Bytes>;
    fn decompress(&self, data: &[u8], encoding: &str) -> Result<Bytes>;
}

/// gzip, deflate and identity via flate2.
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultCompression;

fn normalize(encoding: &str) -> String {
    encoding.trim().to_ascii_lowercase()
}

fn unsupported(encoding: &str) -> ProxyError {
    ProxyError::protocol(format!("unsupported content encoding {encoding:?}"))
}

fn codec_error(encoding: &str, err: std::io::Error) -> ProxyError {
    ProxyError::protocol(format!("{encoding} body could not be decoded: {err}"))
}

impl Compression for DefaultCompression {
    fn compress(&self, data: &[u8], encoding: &str) -> Result<Bytes> {
        let level = flate2::Compression::default();
        match normalize(encoding).as_str() {
            "" | "identity" => Ok(Bytes::copy_from_slice(data)),
            "gzip" | "x-gzip" => {
                let mut encoder = flate2::write::GzEncoder::new(Vec::new(), level);
                encoder.write_all(data)?;
                Ok(Bytes::from(encoder.finish()?))
            }
            "deflate" => {
                let mut encoder = flate2::write::ZlibEncoder::new(Vec::new(), level);
                encoder.write_all(data)?;
                Ok(Bytes::from(encoder.finish()?))
            }
            _ => Err(unsupported(encoding)),
        }
    }

    fn decompress(&self, data: &[u8], encoding: &str) -> Result<Bytes> {
        let mut decoded = Vec::new();
        match normalize(encoding).as_str() {
            "" | "identity" => return Ok(Bytes::copy_from_slice(data)),
            "gzip" | "x-gzip" => {
                flate2::read::GzDecoder::new(data)
                    .read_to_end(&mut decoded)
                    .map_err(|e| codec_error("gzip", e))?;
            }
            "deflate" => {
                // Servers send both zlib-wrapped and raw deflate.
                if flate2::read::ZlibDecoder::new(data)
                    .read_to_end(&mut decoded)
                    .is_err()
                {
                    decoded.clear();
                    flate2::read::DeflateDecoder::new(data)
                        .read_to_end(&mut decoded)
                        .map_err(|e| codec_error("deflate", e))?;
                }
            }
            _ => return Err(unsupported(encoding)),
        }
        Ok(Bytes::from(decoded))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gzip_and_deflate_round_trip() {
        let codec = DefaultCompression;
        let text = b"hello hello hello hello".repeat(10);
        for encoding in ["gzip", "deflate", "identity", "GZIP"] {
            let packed = codec.compress(&text, encoding).unwrap();
            assert_eq!(&codec.decompress(&packed, encoding).unwrap()[..], &text[..]);
        }
    }

    #[test]
    fn raw_deflate_is_accepted() {
        let mut encoder =
            flate2::write::DeflateEncoder::new(Vec::new(), flate2::Compression::default());
        encoder.write_all(b"raw stream").unwrap();
        let raw = encoder.finish().unwrap();
        assert_eq!(
            &DefaultCompression.decompress(&raw, "deflate").unwrap()[..],
            b"raw stream"
        );
    }

    #[test]
    fn unknown_encoding_is_rejected() {
        let err = DefaultCompression.decompress(b"x", "br").unwrap_err();
        assert!(err.to_string().contains("unsupported content encoding"));
    }

    #[test]
    fn corrupt_gzip_is_reported() {
        assert!(DefaultCompression.decompress(b"not gzip", "gzip").is_err());
    }
}
