//! Plain HTTP forwarding handler.
//!
//! Replays a permitted absolute-form request (`GET http://host/path`) to the
//! destination in origin form, then streams the response back. Neither body
//! is buffered in full: the request body is relayed while the response is
//! read, and the response body is copied through as it arrives.
//!
//! Every forwarded exchange is sent with `Connection: close` in both
//! directions, so a client connection carries exactly one gated request.
//! `https://` targets are dialed over TLS with the system web PKI roots.

use crate::audit;
use crate::connect::dial;
use crate::error::{ProxyError, Result};
use crate::http::{self, Head};
use crate::target::{ForwardTarget, RequestLine, Scheme};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use tracing::debug;

/// Shared context passed from the server to the forwarding handler.
pub struct ForwardCtx<'a> {
    /// Shared TLS connector for `https://` targets
    pub tls_connector: &'a TlsConnector,
    /// Destination dial timeout
    pub connect_timeout: Duration,
}

/// Build the TLS connector used for `https://` forwarding.
///
/// Uses the ring provider explicitly to avoid ambiguity when multiple
/// crypto providers are in the dependency tree.
pub fn tls_connector() -> Result<TlsConnector> {
    let mut root_store = rustls::RootCertStore::empty();
    root_store.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
    let tls_config = rustls::ClientConfig::builder_with_provider(Arc::new(
        rustls::crypto::ring::default_provider(),
    ))
    .with_safe_default_protocol_versions()
    .map_err(|e| ProxyError::Config(format!("TLS config error: {}", e)))?
    .with_root_certificates(root_store)
    .with_no_client_auth();
    Ok(TlsConnector::from(Arc::new(tls_config)))
}

/// Forward a permitted plain HTTP request.
///
/// `client` is positioned just after the request head; `head` is that head.
pub async fn handle_forward(
    mut client: BufReader<TcpStream>,
    request: &RequestLine,
    head: &Head,
    target: &ForwardTarget,
    ctx: &ForwardCtx<'_>,
) -> Result<()> {
    let tcp = match dial(&target.host, target.port, ctx.connect_timeout).await {
        Ok(s) => s,
        Err(e) => {
            http::reject(&mut client, 502, &format!("ddash: {}\n", e)).await?;
            return Err(e);
        }
    };

    let status = match target.scheme {
        Scheme::Http => exchange(client, tcp, request, head, target).await?,
        Scheme::Https => {
            let tls = match connect_tls(tcp, &target.host, ctx.tls_connector).await {
                Ok(s) => s,
                Err(e) => {
                    http::reject(&mut client, 502, &format!("ddash: {}\n", e)).await?;
                    return Err(e);
                }
            };
            exchange(client, tls, request, head, target).await?
        }
    };

    audit::log_forwarded(&request.method, &target.host, target.port, status);
    Ok(())
}

async fn connect_tls(
    tcp: TcpStream,
    host: &str,
    connector: &TlsConnector,
) -> Result<tokio_rustls::client::TlsStream<TcpStream>> {
    let server_name = rustls::pki_types::ServerName::try_from(host.to_string()).map_err(|_| {
        ProxyError::UpstreamConnect {
            host: host.to_string(),
            reason: "invalid server name for TLS".to_string(),
        }
    })?;

    connector
        .connect(server_name, tcp)
        .await
        .map_err(|e| ProxyError::UpstreamConnect {
            host: host.to_string(),
            reason: format!("TLS handshake failed: {}", e),
        })
}

/// Upstream request head: origin-form request line, hop-by-hop headers
/// removed, `Host` filled in when the client omitted it.
fn upstream_head(request: &RequestLine, head: &Head, target: &ForwardTarget) -> String {
    let mut headers = http::strip_hop_by_hop(&head.headers);
    if head.header("host").is_none() {
        headers.insert(0, ("Host".to_string(), target.authority.clone()));
    }
    let start_line = format!("{} {} {}", request.method, target.path, request.version);
    http::encode_head(&start_line, &headers)
}

/// Request body framing taken from the client head.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BodyFraming {
    None,
    Length(u64),
    /// Chunked or otherwise delimited by the client; relayed until the
    /// response completes.
    Streamed,
}

fn body_framing(head: &Head) -> Result<BodyFraming> {
    if head.header("transfer-encoding").is_some() {
        return Ok(BodyFraming::Streamed);
    }
    match head.header("content-length") {
        Some(value) => value
            .trim()
            .parse::<u64>()
            .map(|len| {
                if len == 0 {
                    BodyFraming::None
                } else {
                    BodyFraming::Length(len)
                }
            })
            .map_err(|_| ProxyError::HttpParse(format!("invalid Content-Length: {}", value))),
        None => Ok(BodyFraming::None),
    }
}

/// Send the request upstream and stream the response back.
///
/// Returns the upstream status code.
async fn exchange<S>(
    mut client: BufReader<TcpStream>,
    upstream: S,
    request: &RequestLine,
    head: &Head,
    target: &ForwardTarget,
) -> Result<u16>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let framing = match body_framing(head) {
        Ok(f) => f,
        Err(e) => {
            http::reject(&mut client, 400, &format!("ddash: {}\n", e)).await?;
            return Err(e);
        }
    };

    let pipelined = client.buffer().to_vec();
    let (client_r, mut client_w) = client.into_inner().into_split();

    let (upstream_r, mut upstream_w) = tokio::io::split(upstream);
    upstream_w
        .write_all(upstream_head(request, head, target).as_bytes())
        .await?;
    upstream_w.flush().await?;

    let upload = async {
        let mut body = (&pipelined[..]).chain(client_r);
        let sent = match framing {
            BodyFraming::None => 0,
            BodyFraming::Length(len) => tokio::io::copy(&mut body.take(len), &mut upstream_w).await?,
            BodyFraming::Streamed => tokio::io::copy(&mut body, &mut upstream_w).await?,
        };
        upstream_w.flush().await?;
        Ok::<u64, std::io::Error>(sent)
    };

    let download = relay_response(upstream_r, &mut client_w, request, target);

    tokio::pin!(upload);
    tokio::pin!(download);

    // The response may complete before a streamed request body ends; in
    // that case the upload is abandoned.
    let mut uploading = true;
    loop {
        tokio::select! {
            status = &mut download => break status,
            sent = &mut upload, if uploading => {
                uploading = false;
                match sent {
                    Ok(n) => debug!("Request body relayed ({} bytes)", n),
                    Err(e) => debug!("Request body relay ended early: {}", e),
                }
            }
        }
    }
}

/// Read the upstream response and stream it to the client.
///
/// Interim `1xx` heads (e.g. `100 Continue`) are passed through and the
/// next head is read. Returns the final status code.
async fn relay_response<R>(
    upstream_r: R,
    client_w: &mut OwnedWriteHalf,
    request: &RequestLine,
    target: &ForwardTarget,
) -> Result<u16>
where
    R: AsyncRead + Unpin,
{
    let mut upstream_r = BufReader::new(upstream_r);
    loop {
        let response = match http::read_head(&mut upstream_r).await {
            Ok(Some(response)) => response,
            Ok(None) => {
                let e = ProxyError::UpstreamConnect {
                    host: target.authority.clone(),
                    reason: "upstream closed without a response".to_string(),
                };
                http::send_response(client_w, 502, &format!("ddash: {}\n", e)).await?;
                return Err(e);
            }
            Err(e) => {
                http::send_response(client_w, 502, &format!("ddash: {}\n", e)).await?;
                return Err(e);
            }
        };

        let status = match http::parse_status_code(&response.start_line) {
            Ok(status) => status,
            Err(e) => {
                http::send_response(client_w, 502, &format!("ddash: {}\n", e)).await?;
                return Err(e);
            }
        };

        let headers = http::strip_hop_by_hop(&response.headers);
        if http::is_interim(status) {
            client_w
                .write_all(http::encode_interim_head(&response.start_line, &headers).as_bytes())
                .await?;
            client_w.flush().await?;
            continue;
        }

        client_w
            .write_all(http::encode_head(&response.start_line, &headers).as_bytes())
            .await?;
        let copied = tokio::io::copy(&mut upstream_r, client_w).await?;
        client_w.shutdown().await?;
        debug!(
            "Forwarded {} {} -> {} ({} body bytes)",
            request.method, target.authority, status, copied
        );
        return Ok(status);
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::target::{parse_forward_target, parse_request_line};

    fn head(lines: &[(&str, &str)]) -> Head {
        Head {
            start_line: String::new(),
            headers: lines
                .iter()
                .map(|(n, v)| (n.to_string(), v.to_string()))
                .collect(),
        }
    }

    #[test]
    fn test_upstream_head_rewrites_to_origin_form() {
        let request = parse_request_line("GET http://example.com:8080/a?b=1 HTTP/1.1").unwrap();
        let target = parse_forward_target(&request.target).unwrap();
        let head = head(&[
            ("Host", "example.com:8080"),
            ("Proxy-Connection", "keep-alive"),
            ("Accept", "*/*"),
        ]);

        let out = upstream_head(&request, &head, &target);
        assert_eq!(
            out,
            "GET /a?b=1 HTTP/1.1\r\nHost: example.com:8080\r\nAccept: */*\r\nConnection: close\r\n\r\n"
        );
    }

    #[test]
    fn test_upstream_head_adds_missing_host() {
        let request = parse_request_line("GET http://example.com/ HTTP/1.0").unwrap();
        let target = parse_forward_target(&request.target).unwrap();
        let out = upstream_head(&request, &head(&[]), &target);
        assert!(out.starts_with("GET / HTTP/1.0\r\nHost: example.com\r\n"));
    }

    #[test]
    fn test_body_framing() {
        assert_eq!(body_framing(&head(&[])).unwrap(), BodyFraming::None);
        assert_eq!(
            body_framing(&head(&[("Content-Length", "12")])).unwrap(),
            BodyFraming::Length(12)
        );
        assert_eq!(
            body_framing(&head(&[("Content-Length", "0")])).unwrap(),
            BodyFraming::None
        );
        assert_eq!(
            body_framing(&head(&[("Transfer-Encoding", "chunked"), ("Content-Length", "3")]))
                .unwrap(),
            BodyFraming::Streamed
        );
        assert!(body_framing(&head(&[("Content-Length", "lots")])).is_err());
    }

    #[tokio::test]
    async fn test_exchange_reports_final_status_after_continue() {
        use tokio::net::TcpListener;

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let mut client = TcpStream::connect(listener.local_addr().unwrap()).await.unwrap();
        let (accepted, _) = listener.accept().await.unwrap();

        let (upstream, origin) = tokio::io::duplex(4096);
        let origin_task = tokio::spawn(async move {
            let mut origin = BufReader::new(origin);
            let request = http::read_head(&mut origin).await.unwrap().unwrap();
            assert_eq!(request.start_line, "GET /upload HTTP/1.1");
            let origin = origin.get_mut();
            origin
                .write_all(b"HTTP/1.1 100 Continue\r\n\r\nHTTP/1.1 201 Created\r\nContent-Length: 2\r\n\r\nok")
                .await
                .unwrap();
            origin.shutdown().await.unwrap();
        });

        let request = parse_request_line("GET http://example.com/upload HTTP/1.1").unwrap();
        let target = parse_forward_target(&request.target).unwrap();
        let head = head(&[("Host", "example.com")]);

        let status = exchange(BufReader::new(accepted), upstream, &request, &head, &target)
            .await
            .unwrap();
        assert_eq!(status, 201);
        origin_task.await.unwrap();

        let mut response = String::new();
        client.read_to_string(&mut response).await.unwrap();
        assert!(response.starts_with("HTTP/1.1 100 Continue\r\n\r\nHTTP/1.1 201 Created\r\n"));
        assert!(response.ends_with("\r\n\r\nok"));
    }

    #[test]
    fn test_tls_connector_builds() {
        assert!(tls_connector().is_ok());
    }
}
