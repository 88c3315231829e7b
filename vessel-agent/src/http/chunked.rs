//! HTTP/1.1 chunked transfer-coding decoder.
//!
//! Exposed as a pure function over an in-memory buffer (easy to test
//! byte-exactly against RFC 7230 framing) plus a thin async driver that
//! feeds it from a socket.

use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncRead, AsyncReadExt};

use crate::error::{AgentError, AgentResult};

/// Decodes a complete chunked body already held in memory.
///
/// Handles chunk-size lines, chunk data followed by CRLF, the zero-length
/// final chunk, and trailing header lines (discarded) up to the final
/// CRLF. Chunk extensions (`;key=value` after the size) are ignored.
pub fn decode_buffered(input: &[u8]) -> AgentResult<Vec<u8>> {
    let mut pos = 0usize;
    let mut out = Vec::new();

    loop {
        let line_end = find_crlf(input, pos)
            .ok_or_else(|| AgentError::Protocol("truncated chunk size line".into()))?;
        let size_line = std::str::from_utf8(&input[pos..line_end])
            .map_err(|_| AgentError::Protocol("non-UTF-8 chunk size line".into()))?;
        let size_str = size_line.split(';').next().unwrap_or("").trim();
        let size = usize::from_str_radix(size_str, 16)
            .map_err(|_| AgentError::Protocol(format!("invalid chunk size: {size_str}")))?;
        pos = line_end + 2;

        if size == 0 {
            // Consume trailer lines up to the empty line that terminates them.
            loop {
                let trailer_end = find_crlf(input, pos)
                    .ok_or_else(|| AgentError::Protocol("truncated chunk trailer".into()))?;
                if trailer_end == pos {
                    pos = trailer_end + 2;
                    break;
                }
                pos = trailer_end + 2;
            }
            break;
        }

        if pos + size > input.len() {
            return Err(AgentError::Protocol("chunk data runs past buffer".into()));
        }
        out.extend_from_slice(&input[pos..pos + size]);
        pos += size;

        if input.get(pos..pos + 2) != Some(b"\r\n") {
            return Err(AgentError::Protocol("chunk data missing trailing CRLF".into()));
        }
        pos += 2;
    }

    Ok(out)
}

fn find_crlf(input: &[u8], from: usize) -> Option<usize> {
    input[from..]
        .windows(2)
        .position(|w| w == b"\r\n")
        .map(|i| from + i)
}

/// Reads and decodes a chunked body from an async, buffered socket stream.
pub async fn read_chunked_body<R>(reader: &mut R) -> AgentResult<Vec<u8>>
where
    R: AsyncBufRead + AsyncRead + Unpin,
{
    let mut out = Vec::new();

    loop {
        let mut size_line = String::new();
        reader.read_line(&mut size_line).await?;
        let size_str = size_line.trim_end().split(';').next().unwrap_or("").trim();
        if size_str.is_empty() {
            return Err(AgentError::Protocol("empty chunk size line".into()));
        }
        let size = usize::from_str_radix(size_str, 16)
            .map_err(|_| AgentError::Protocol(format!("invalid chunk size: {size_str}")))?;

        if size == 0 {
            loop {
                let mut trailer = String::new();
                reader.read_line(&mut trailer).await?;
                if trailer == "\r\n" || trailer.is_empty() {
                    break;
                }
            }
            break;
        }

        let mut chunk = vec![0u8; size];
        reader.read_exact(&mut chunk).await?;
        out.extend_from_slice(&chunk);

        let mut crlf = [0u8; 2];
        reader.read_exact(&mut crlf).await?;
        if &crlf != b"\r\n" {
            return Err(AgentError::Protocol("chunk data missing trailing CRLF".into()));
        }
    }

    Ok(out)
}

/// Encodes a payload as chunked body bytes, for tests and fixtures.
#[cfg(test)]
pub fn encode_for_test(payload: &[u8], chunk_size: usize) -> Vec<u8> {
    let mut out = Vec::new();
    for chunk in payload.chunks(chunk_size.max(1)) {
        out.extend_from_slice(format!("{:x}\r\n", chunk.len()).as_bytes());
        out.extend_from_slice(chunk);
        out.extend_from_slice(b"\r\n");
    }
    out.extend_from_slice(b"0\r\n\r\n");
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_simple_roundtrip() {
        let payload = b"hello world";
        let encoded = encode_for_test(payload, 4);
        let decoded = decode_buffered(&encoded).unwrap();
        assert_eq!(decoded, payload);
    }

    #[test]
    fn test_decode_single_chunk() {
        let payload = b"abc";
        let encoded = encode_for_test(payload, 100);
        assert_eq!(encoded, b"3\r\nabc\r\n0\r\n\r\n");
        assert_eq!(decode_buffered(&encoded).unwrap(), payload);
    }

    #[test]
    fn test_decode_empty_body() {
        let encoded = b"0\r\n\r\n";
        assert_eq!(decode_buffered(encoded).unwrap(), Vec::<u8>::new());
    }

    #[test]
    fn test_decode_with_trailers() {
        let mut encoded = encode_for_test(b"data", 100);
        // Replace the final "0\r\n\r\n" with a version carrying a trailer header.
        encoded.truncate(encoded.len() - 5);
        encoded.extend_from_slice(b"0\r\nX-Trailer: value\r\n\r\n");
        assert_eq!(decode_buffered(&encoded).unwrap(), b"data");
    }

    #[test]
    fn test_decode_rejects_truncated_chunk() {
        let encoded = b"5\r\nabc";
        assert!(decode_buffered(encoded).is_err());
    }

    #[test]
    fn test_decode_rejects_missing_crlf() {
        let encoded = b"3\r\nabcXX0\r\n\r\n";
        assert!(decode_buffered(encoded).is_err());
    }

    #[tokio::test]
    async fn test_read_chunked_body_from_async_reader() {
        let payload = b"the quick brown fox".to_vec();
        let encoded = encode_for_test(&payload, 5);
        let mut reader = tokio::io::BufReader::new(std::io::Cursor::new(encoded));
        let decoded = read_chunked_body(&mut reader).await.unwrap();
        assert_eq!(decoded, payload);
    }
}
