//! Chunked transfer-coding (RFC 7230 §4.1).

use tokio::io::{AsyncWrite, AsyncWriteExt};

use crate::error::{ProxyError, Result};

pub const LAST_CHUNK: &[u8] = b"0\r\n\r\n";

/// Encode `body` as a single chunk plus the terminating chunk. An empty body
/// encodes to just the terminator.
pub fn chunk_encode(body: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(body.len() + 16);
    if !body.is_empty() {
        out.extend_from_slice(format!("{:x}\r\n", body.len()).as_bytes());
        out.extend_from_slice(body);
        out.extend_from_slice(b"\r\n");
    }
    out.extend_from_slice(LAST_CHUNK);
    out
}

/// Parse the size from a chunk-size line, ignoring any `;extension`.
pub fn parse_chunk_size(line: &str) -> Result<usize> {
    let token = line.split(';').next().unwrap_or("").trim();
    if token.is_empty() {
        return Err(ProxyError::protocol("empty chunk size line"));
    }
    usize::from_str_radix(token, 16)
        .map_err(|_| ProxyError::protocol(format!("invalid chunk size {token:?}")))
}

/// Decode a complete chunked body held in memory. Trailers are discarded.
pub fn chunk_decode(data: &[u8]) -> Result<Vec<u8>> {
    let mut out = Vec::with_capacity(data.len());
    let mut pos = 0;

    loop {
        let line_end = find_crlf(&data[pos..])
            .ok_or_else(|| ProxyError::protocol("truncated chunk size line"))?;
        let line = std::str::from_utf8(&data[pos..pos + line_end])
            .map_err(|_| ProxyError::protocol("non-ASCII chunk size line"))?;
        let size = parse_chunk_size(line)?;
        pos += line_end + 2;

        if size == 0 {
            // trailers up to the blank line
            loop {
                let end = find_crlf(&data[pos..])
                    .ok_or_else(|| ProxyError::protocol("truncated chunk trailer"))?;
                pos += end + 2;
                if end == 0 {
                    return Ok(out);
                }
            }
        }

        let chunk_end = pos
            .checked_add(size)
            .filter(|end| *end + 2 <= data.len())
            .ok_or_else(|| ProxyError::protocol("truncated chunk data"))?;
        out.extend_from_slice(&data[pos..chunk_end]);
        if &data[chunk_end..chunk_end + 2] != b"\r\n" {
            return Err(ProxyError::protocol("missing CRLF after chunk data"));
        }
        pos = chunk_end + 2;
    }
}

fn find_crlf(data: &[u8]) -> Option<usize> {
    data.windows(2).position(|w| w == b"\r\n")
}

/// Write one data chunk. Empty input writes nothing, since a zero-size chunk
/// would end the body.
pub async fn write_chunk<W: AsyncWrite + Unpin>(writer: &mut W, data: &[u8]) -> std::io::Result<()> {
    if data.is_empty() {
        return Ok(());
    }
    writer
        .write_all(format!("{:x}\r\n", data.len()).as_bytes())
        .await?;
    writer.write_all(data).await?;
    writer.write_all(b"\r\n").await
}

pub async fn write_last_chunk<W: AsyncWrite + Unpin>(writer: &mut W) -> std::io::Result<()> {
    writer.write_all(LAST_CHUNK).await
}
