//! HTTP message framing over a byte stream.
//!
//! Requests and responses are read whole: the header block first, then
//! exactly `Content-Length` body bytes. The raw bytes are returned untouched
//! so they can be forwarded verbatim.

use bytes::{Bytes, BytesMut};
use std::io;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::time::timeout;

use crate::config::HEADER_SIZE;
use crate::error::ProxyError;

const MAX_HEADERS: usize = 64;

/// Reads one complete HTTP message (request or response) from `stream`.
pub async fn read_http_message<R>(stream: &mut R, io_timeout: Duration) -> Result<Bytes, ProxyError>
where
    R: AsyncRead + Unpin,
{
    let mut buffer = BytesMut::with_capacity(HEADER_SIZE);

    let header_len = loop {
        if let Some(pos) = find_header_end(&buffer) {
            break pos;
        }
        if buffer.len() >= HEADER_SIZE {
            return Err(ProxyError::HeaderTooLarge(HEADER_SIZE));
        }
        if receive(stream, &mut buffer, io_timeout).await? == 0 {
            return Err(io::Error::from(io::ErrorKind::UnexpectedEof).into());
        }
    };

    let content_length = body_length(&buffer[..header_len])?;
    while buffer.len() - header_len < content_length {
        if receive(stream, &mut buffer, io_timeout).await? == 0 {
            return Err(io::Error::from(io::ErrorKind::UnexpectedEof).into());
        }
    }

    Ok(buffer.freeze())
}

async fn receive<R>(stream: &mut R, buffer: &mut BytesMut, io_timeout: Duration) -> Result<usize, ProxyError>
where
    R: AsyncRead + Unpin,
{
    let mut chunk = [0u8; HEADER_SIZE];
    let n = timeout(io_timeout, stream.read(&mut chunk))
        .await
        .map_err(|_| ProxyError::Timeout)??;
    buffer.extend_from_slice(&chunk[..n]);
    Ok(n)
}

/// Offset just past the blank line that ends the header block.
pub fn find_header_end(data: &[u8]) -> Option<usize> {
    data.windows(4).position(|w| w == b"\r\n\r\n").map(|pos| pos + 4)
}

/// Body length announced by the header block; 0 when there is none.
fn body_length(head: &[u8]) -> Result<usize, ProxyError> {
    let mut length = 0;
    for (name, value) in header_fields(head)? {
        if name.eq_ignore_ascii_case("transfer-encoding")
            && value.to_ascii_lowercase().contains("chunked")
        {
            return Err(ProxyError::Unsupported("chunked transfer-encoding"));
        }
        if name.eq_ignore_ascii_case("content-length") {
            length = value
                .trim()
                .parse()
                .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "bad Content-Length"))?;
        }
    }
    Ok(length)
}

/// Header fields of a message, skipping its start line.
pub fn header_fields(message: &[u8]) -> Result<Vec<(String, String)>, ProxyError> {
    let Some(line_end) = message.windows(2).position(|w| w == b"\r\n") else {
        return Ok(Vec::new());
    };
    let fields = &message[line_end + 2..];

    let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
    match httparse::parse_headers(fields, &mut headers) {
        Ok(httparse::Status::Complete((_, parsed))) => Ok(parsed
            .iter()
            .map(|h| (h.name.to_string(), String::from_utf8_lossy(h.value).into_owned()))
            .collect()),
        Ok(httparse::Status::Partial) => Ok(Vec::new()),
        Err(e) => Err(io::Error::new(io::ErrorKind::InvalidData, e).into()),
    }
}

/// First value of `name` in the message's header block.
pub fn header_value(message: &[u8], name: &str) -> Option<String> {
    let end = find_header_end(message).unwrap_or(message.len());
    header_fields(&message[..end])
        .ok()?
        .into_iter()
        .find(|(n, _)| n.eq_ignore_ascii_case(name))
        .map(|(_, v)| v)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_test::io::Builder;

    const TIMEOUT: Duration = Duration::from_secs(5);

    #[tokio::test]
    async fn test_message_without_body() {
        let raw = b"GET http://example.com/ HTTP/1.1\r\nHost: example.com\r\n\r\n";
        let mut stream = Builder::new().read(raw).build();
        let message = read_http_message(&mut stream, TIMEOUT).await.unwrap();
        assert_eq!(&message[..], &raw[..]);
    }

    #[tokio::test]
    async fn test_body_split_across_reads() {
        let mut stream = Builder::new()
            .read(b"HTTP/1.1 200 OK\r\nContent-Length: 10\r\n\r\nhel")
            .read(b"lo")
            .read(b"world")
            .build();
        let message = read_http_message(&mut stream, TIMEOUT).await.unwrap();
        assert_eq!(
            &message[..],
            b"HTTP/1.1 200 OK\r\nContent-Length: 10\r\n\r\nhelloworld"
        );
    }

    #[tokio::test]
    async fn test_headers_split_across_reads() {
        let mut stream = Builder::new()
            .read(b"HTTP/1.1 200 OK\r\nConte")
            .read(b"nt-Length: 2\r\n\r")
            .read(b"\nok")
            .build();
        let message = read_http_message(&mut stream, TIMEOUT).await.unwrap();
        assert!(message.ends_with(b"\r\n\r\nok"));
    }

    #[tokio::test]
    async fn test_content_length_case_insensitive() {
        let mut stream = Builder::new()
            .read(b"HTTP/1.1 200 OK\r\ncontent-length: 4\r\n\r\n")
            .read(b"body")
            .build();
        let message = read_http_message(&mut stream, TIMEOUT).await.unwrap();
        assert!(message.ends_with(b"body"));
    }

    #[tokio::test]
    async fn test_chunked_is_unsupported() {
        let mut stream = Builder::new()
            .read(b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n5\r\nhello\r\n0\r\n\r\n")
            .build();
        let err = read_http_message(&mut stream, TIMEOUT).await.unwrap_err();
        assert!(matches!(err, ProxyError::Unsupported(_)));
    }

    #[tokio::test]
    async fn test_truncated_body_is_eof() {
        let mut stream = Builder::new()
            .read(b"HTTP/1.1 200 OK\r\nContent-Length: 100\r\n\r\nshort")
            .build();
        let err = read_http_message(&mut stream, TIMEOUT).await.unwrap_err();
        match err {
            ProxyError::Io(e) => assert_eq!(e.kind(), io::ErrorKind::UnexpectedEof),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_oversized_header_block() {
        let mut stream = Builder::new()
            .read(b"GET / HTTP/1.1\r\n")
            .read(&vec![b'a'; HEADER_SIZE])
            .build();
        let err = read_http_message(&mut stream, TIMEOUT).await.unwrap_err();
        assert!(matches!(err, ProxyError::HeaderTooLarge(HEADER_SIZE)));
    }

    #[test]
    fn test_header_value_lookup() {
        let response = b"HTTP/1.1 200 OK\r\nDate: Sun, 06 Nov 1994 08:49:37 GMT\r\nExpires: Sun, 06 Nov 1994 09:49:37 GMT\r\n\r\nbody";
        assert_eq!(
            header_value(response, "date").as_deref(),
            Some("Sun, 06 Nov 1994 08:49:37 GMT")
        );
        assert_eq!(
            header_value(response, "Expires").as_deref(),
            Some("Sun, 06 Nov 1994 09:49:37 GMT")
        );
        assert_eq!(header_value(response, "Last-Modified"), None);
    }
}
