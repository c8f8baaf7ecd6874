//! HTTP CONNECT tunnel handler.
//!
//! Handles permitted `CONNECT host:port HTTP/1.1` requests by:
//! 1. Dialing the literal `host:port` (502 on failure)
//! 2. Taking ownership of the raw client socket
//! 3. Returning `200 Connection Established`
//! 4. Relaying bytes in both directions until each side is done
//!
//! The proxy never terminates TLS. Tunneled bytes are never inspected.

use crate::error::{ProxyError, Result};
use crate::http;
use crate::target::join_host_port;
use std::io;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tracing::debug;

const CONNECTION_ESTABLISHED: &[u8] = b"HTTP/1.1 200 Connection Established\r\n\r\n";

/// Open a TCP connection to `host:port`, bounded by `timeout`.
pub async fn dial(host: &str, port: u16, timeout: Duration) -> Result<TcpStream> {
    match tokio::time::timeout(timeout, TcpStream::connect((host, port))).await {
        Ok(Ok(stream)) => Ok(stream),
        Ok(Err(e)) => Err(ProxyError::UpstreamConnect {
            host: join_host_port(host, port),
            reason: e.to_string(),
        }),
        Err(_) => Err(ProxyError::UpstreamConnect {
            host: join_host_port(host, port),
            reason: "connection timed out".to_string(),
        }),
    }
}

/// Tunnel a permitted CONNECT request.
///
/// `client` is the buffered client connection positioned just after the
/// request head. Any bytes the client pipelined behind the head are sent to
/// the destination ahead of the relay.
pub async fn handle_connect(
    mut client: BufReader<TcpStream>,
    host: &str,
    port: u16,
    timeout: Duration,
) -> Result<()> {
    let upstream = match dial(host, port, timeout).await {
        Ok(s) => s,
        Err(e) => {
            http::reject(&mut client, 502, &format!("ddash: {}\n", e)).await?;
            return Err(e);
        }
    };

    let pipelined = client.buffer().to_vec();
    let mut client = client.into_inner();

    client.write_all(CONNECTION_ESTABLISHED).await?;
    client.flush().await?;

    let (client_r, client_w) = client.into_split();
    let (upstream_r, upstream_w) = upstream.into_split();
    let result = relay(client_r, client_w, upstream_r, upstream_w, &pipelined).await;
    debug!(
        "CONNECT tunnel closed for {}: {:?}",
        join_host_port(host, port),
        result
    );

    Ok(())
}

/// Copy bytes in both directions until both reach EOF or either errors.
///
/// When one direction reaches EOF, the write side it was feeding is shut
/// down so the peer sees the half-close. An error in either direction ends
/// the relay; all four halves are dropped when this returns, closing each
/// socket exactly once. Returns bytes copied (client->upstream,
/// upstream->client).
pub async fn relay<CR, CW, UR, UW>(
    mut client_r: CR,
    mut client_w: CW,
    mut upstream_r: UR,
    mut upstream_w: UW,
    pipelined: &[u8],
) -> io::Result<(u64, u64)>
where
    CR: AsyncRead + Unpin,
    CW: AsyncWrite + Unpin,
    UR: AsyncRead + Unpin,
    UW: AsyncWrite + Unpin,
{
    let outbound = async {
        if !pipelined.is_empty() {
            upstream_w.write_all(pipelined).await?;
        }
        let copied = tokio::io::copy(&mut client_r, &mut upstream_w).await?;
        upstream_w.shutdown().await?;
        Ok::<u64, io::Error>(copied + pipelined.len() as u64)
    };

    let inbound = async {
        let copied = tokio::io::copy(&mut upstream_r, &mut client_w).await?;
        client_w.shutdown().await?;
        Ok::<u64, io::Error>(copied)
    };

    tokio::try_join!(outbound, inbound)
}
