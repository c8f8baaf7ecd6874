//! Minimal HTTP/1.1 framing shared by the dispatcher and handlers.
//!
//! The proxy only ever parses request heads and (for plain forwarding)
//! response heads. Bodies and tunneled bytes are relayed untouched.

use crate::error::{ProxyError, Result};
use std::time::Duration;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::debug;

/// Maximum total size of a request or response head (64 KiB). Prevents OOM
/// from peers sending unbounded header data.
pub const MAX_HEADER_SIZE: usize = 64 * 1024;

/// Most client input discarded after a rejection before the socket is dropped.
const DRAIN_LIMIT: u64 = 1024 * 1024;

/// Longest wait for a rejected client to finish sending.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

/// Body of every policy denial.
pub const BLOCKED_BODY: &str = "ddash: connection blocked\n";

/// Headers that describe a single connection and are never forwarded.
const HOP_BY_HOP: &[&str] = &[
    "connection",
    "proxy-connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "upgrade",
];

/// A header field as received.
pub type Header = (String, String);

/// Start line plus header fields of an HTTP message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Head {
    pub start_line: String,
    pub headers: Vec<Header>,
}

impl Head {
    /// First value of `name`, compared case-insensitively.
    #[must_use]
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

/// Read a message head (start line and headers up to the blank line).
///
/// Returns `Ok(None)` if the peer closed before sending anything. Fails with
/// [`ProxyError::HeaderTooLarge`] once the head exceeds [`MAX_HEADER_SIZE`].
pub async fn read_head<R>(reader: &mut R) -> Result<Option<Head>>
where
    R: AsyncBufRead + Unpin,
{
    let mut total = 0usize;
    let mut start_line = String::new();
    let n = read_bounded_line(reader, &mut start_line, &mut total).await?;
    if n == 0 {
        return Ok(None);
    }

    let mut headers = Vec::new();
    loop {
        let mut line = String::new();
        let n = read_bounded_line(reader, &mut line, &mut total).await?;
        let line = line.trim_end_matches(['\r', '\n']);
        if n == 0 || line.is_empty() {
            break;
        }
        match line.split_once(':') {
            Some((name, value)) => {
                headers.push((name.trim().to_string(), value.trim().to_string()));
            }
            None => {
                return Err(ProxyError::HttpParse(format!(
                    "malformed header line: {}",
                    line
                )))
            }
        }
    }

    Ok(Some(Head {
        start_line: start_line.trim_end().to_string(),
        headers,
    }))
}

async fn read_bounded_line<R>(reader: &mut R, line: &mut String, total: &mut usize) -> Result<usize>
where
    R: AsyncBufRead + Unpin,
{
    // Never buffer more than the head limit, even for a single line.
    let remaining = (MAX_HEADER_SIZE + 1).saturating_sub(*total) as u64;
    let n = (&mut *reader).take(remaining).read_line(line).await?;
    *total = total.saturating_add(n);
    if *total > MAX_HEADER_SIZE {
        return Err(ProxyError::HeaderTooLarge {
            limit: MAX_HEADER_SIZE,
        });
    }
    Ok(n)
}

/// Drop hop-by-hop headers, including any named in `Connection`.
///
/// `Transfer-Encoding` and `Content-Length` are kept: bodies are relayed
/// with their original framing.
#[must_use]
pub fn strip_hop_by_hop(headers: &[Header]) -> Vec<Header> {
    let named: Vec<String> = headers
        .iter()
        .filter(|(n, _)| n.eq_ignore_ascii_case("connection"))
        .flat_map(|(_, v)| v.split(','))
        .map(|token| token.trim().to_ascii_lowercase())
        .filter(|token| !token.is_empty())
        .collect();

    headers
        .iter()
        .filter(|(name, _)| {
            let lower = name.to_ascii_lowercase();
            !HOP_BY_HOP.contains(&lower.as_str()) && !named.contains(&lower)
        })
        .cloned()
        .collect()
}

/// Serialize a head with a trailing `Connection: close`.
#[must_use]
pub fn encode_head(start_line: &str, headers: &[Header]) -> String {
    let mut out = encode_fields(start_line, headers);
    out.push_str("Connection: close\r\n\r\n");
    out
}

/// Serialize an interim (1xx) response head as-is.
#[must_use]
pub fn encode_interim_head(start_line: &str, headers: &[Header]) -> String {
    let mut out = encode_fields(start_line, headers);
    out.push_str("\r\n");
    out
}

fn encode_fields(start_line: &str, headers: &[Header]) -> String {
    let mut out = String::with_capacity(256);
    out.push_str(start_line);
    out.push_str("\r\n");
    for (name, value) in headers {
        out.push_str(name);
        out.push_str(": ");
        out.push_str(value);
        out.push_str("\r\n");
    }
    out
}

/// Canonical reason phrase for the statuses the proxy generates.
#[must_use]
pub fn reason_phrase(status: u16) -> &'static str {
    match status {
        200 => "OK",
        400 => "Bad Request",
        403 => "Forbidden",
        431 => "Request Header Fields Too Large",
        502 => "Bad Gateway",
        _ => "Error",
    }
}

/// Send a complete plaintext response.
pub async fn send_response<W>(stream: &mut W, status: u16, body: &str) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let response = format!(
        "HTTP/1.1 {} {}\r\nContent-Type: text/plain; charset=utf-8\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
        status,
        reason_phrase(status),
        body.len(),
        body
    );
    stream.write_all(response.as_bytes()).await?;
    stream.flush().await?;
    Ok(())
}

/// Answer a request the proxy will not serve, then close gracefully.
///
/// After the response the write side is shut down and whatever the client
/// is still sending (usually a request body) is read and discarded, up to
/// [`DRAIN_LIMIT`] bytes or [`DRAIN_TIMEOUT`]. Dropping a socket with unread
/// input makes the kernel answer with RST, and the client can lose the
/// response it has not read yet.
pub async fn reject<S>(stream: &mut S, status: u16, body: &str) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    send_response(stream, status, body).await?;
    stream.shutdown().await?;

    let mut rest = (&mut *stream).take(DRAIN_LIMIT);
    match tokio::time::timeout(DRAIN_TIMEOUT, tokio::io::copy(&mut rest, &mut tokio::io::sink())).await {
        Ok(Ok(n)) => debug!("Discarded {} bytes after {} response", n, status),
        Ok(Err(e)) => debug!("Client input ended after {} response: {}", status, e),
        Err(_) => debug!("Client still sending after {} response; closing", status),
    }
    Ok(())
}

/// Whether a response status is an interim (1xx) response that will be
/// followed by another head. `101` ends HTTP framing and counts as final.
#[must_use]
pub fn is_interim(status: u16) -> bool {
    (100..200).contains(&status) && status != 101
}

/// Parse the status code out of a response start line.
pub fn parse_status_code(line: &str) -> Result<u16> {
    let mut parts = line.split_whitespace();
    match (parts.next(), parts.next()) {
        (Some(version), Some(code)) if version.starts_with("HTTP/") && code.len() == 3 => code
            .parse::<u16>()
            .map_err(|_| ProxyError::HttpParse(format!("invalid status code in response: {}", line))),
        _ => Err(ProxyError::HttpParse(format!(
            "malformed HTTP response: {}",
            line
        ))),
    }
}
