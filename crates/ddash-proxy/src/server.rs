//! Proxy server: TCP listener, connection dispatch, and lifecycle.
//!
//! The server binds to `127.0.0.1:0` (OS-assigned port) by default, accepts
//! TCP connections, reads the request head, and gates the target domain
//! through the [`DecisionStore`] before handing the connection on.
//!
//! CONNECT method -> [`connect`] tunnel
//! Other methods  -> [`forward`] plain HTTP forwarding
//!
//! Denied domains get `403` and the destination is never contacted.

use crate::audit::{self, ProxyMode};
use crate::config::ProxyConfig;
use crate::connect;
use crate::decision::Decision;
use crate::error::{ProxyError, Result};
use crate::forward::{self, ForwardCtx};
use crate::http;
use crate::prompt::{Resolver, TerminalResolver};
use crate::store::DecisionStore;
use crate::target::{parse_connect_target, parse_forward_target, parse_request_line};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// Shared state for the proxy server.
struct ProxyState {
    store: Arc<DecisionStore>,
    config: ProxyConfig,
    /// Created once at startup to avoid rebuilding the root cert store per request.
    tls_connector: tokio_rustls::TlsConnector,
    active_connections: AtomicUsize,
}

/// A bound proxy that is not yet accepting connections.
pub struct ProxyServer {
    listener: TcpListener,
    local_addr: SocketAddr,
    state: Arc<ProxyState>,
}

impl ProxyServer {
    /// Bind the listener and build the decision store.
    ///
    /// Prompts go to the control channel at `config.control_path`.
    pub async fn bind(config: ProxyConfig) -> Result<Self> {
        let resolver = TerminalResolver::new(config.control_path.clone());
        Self::bind_with_resolver(config, Box::new(resolver)).await
    }

    /// Bind with a caller-supplied resolver for unknown domains.
    pub async fn bind_with_resolver(config: ProxyConfig, resolver: Box<dyn Resolver>) -> Result<Self> {
        let bind_addr = SocketAddr::new(config.bind_addr, config.bind_port);
        let listener = TcpListener::bind(bind_addr)
            .await
            .map_err(|e| ProxyError::Bind {
                addr: bind_addr.to_string(),
                source: e,
            })?;

        let local_addr = listener.local_addr().map_err(|e| ProxyError::Bind {
            addr: bind_addr.to_string(),
            source: e,
        })?;

        let store = Arc::new(DecisionStore::from_tokens(
            &config.domains,
            config.command_name.clone(),
            resolver,
        ));
        let tls_connector = forward::tls_connector()?;

        Ok(Self {
            listener,
            local_addr,
            state: Arc::new(ProxyState {
                store,
                config,
                tls_connector,
                active_connections: AtomicUsize::new(0),
            }),
        })
    }

    /// The bound listen address.
    #[must_use]
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Begin accepting connections on the current runtime.
    ///
    /// Returns immediately. The caller MUST keep the runtime driven (e.g.
    /// a multi-thread runtime or a thread calling `block_on`).
    pub fn start(self) -> ProxyHandle {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        info!("Proxy server listening on {}", self.local_addr);

        let store = Arc::clone(&self.state.store);
        tokio::spawn(accept_loop(self.listener, self.state, shutdown_rx));

        ProxyHandle {
            addr: self.local_addr,
            store,
            shutdown_tx,
        }
    }
}

/// Handle returned when the proxy server starts.
///
/// Call [`shutdown`](Self::shutdown) (or drop the handle) to stop accepting.
pub struct ProxyHandle {
    addr: SocketAddr,
    store: Arc<DecisionStore>,
    shutdown_tx: watch::Sender<bool>,
}

impl std::fmt::Debug for ProxyHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProxyHandle")
            .field("addr", &self.addr)
            .finish_non_exhaustive()
    }
}

impl ProxyHandle {
    /// The address the proxy is listening on.
    #[must_use]
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// The port the proxy is listening on.
    #[must_use]
    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    /// Copy of the current domain -> decision state.
    #[must_use]
    pub fn decisions(&self) -> HashMap<String, Decision> {
        self.store.snapshot()
    }

    /// The `always`/`never` decisions the caller should persist.
    #[must_use]
    pub fn persistent_decisions(&self) -> HashMap<String, Decision> {
        self.store.persistent()
    }

    /// Close the listener and the control channel.
    ///
    /// Connections already accepted are not interrupted.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
        self.store.close();
    }

    /// Environment variables to inject into the sandboxed process.
    #[must_use]
    pub fn env_vars(&self) -> Vec<(String, String)> {
        let proxy_url = format!("http://{}", self.addr);
        let no_proxy = "localhost,127.0.0.1,::1".to_string();

        let mut vars = vec![
            ("HTTP_PROXY".to_string(), proxy_url.clone()),
            ("HTTPS_PROXY".to_string(), proxy_url.clone()),
            ("NO_PROXY".to_string(), no_proxy.clone()),
        ];

        // Lowercase variants for compatibility
        vars.push(("http_proxy".to_string(), proxy_url.clone()));
        vars.push(("https_proxy".to_string(), proxy_url));
        vars.push(("no_proxy".to_string(), no_proxy));

        vars
    }
}

/// Bind and start the proxy with the terminal resolver.
pub async fn start(config: ProxyConfig) -> Result<ProxyHandle> {
    Ok(ProxyServer::bind(config).await?.start())
}

/// Bind and start the proxy with a caller-supplied resolver.
pub async fn start_with_resolver(
    config: ProxyConfig,
    resolver: Box<dyn Resolver>,
) -> Result<ProxyHandle> {
    Ok(ProxyServer::bind_with_resolver(config, resolver)
        .await?
        .start())
}

/// Accept loop: listen for connections until shutdown.
async fn accept_loop(
    listener: TcpListener,
    state: Arc<ProxyState>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            result = listener.accept() => {
                match result {
                    Ok((stream, addr)) => {
                        let max = state.config.max_connections;
                        if max > 0 {
                            let current = state.active_connections.load(Ordering::Relaxed);
                            if current >= max {
                                warn!("Connection limit reached ({}/{}), rejecting {}", current, max, addr);
                                drop(stream);
                                continue;
                            }
                        }
                        state.active_connections.fetch_add(1, Ordering::Relaxed);

                        debug!("Accepted connection from {}", addr);
                        let state = Arc::clone(&state);
                        tokio::spawn(async move {
                            if let Err(e) = handle_connection(stream, &state).await {
                                debug!("Connection handler error: {}", e);
                            }
                            state.active_connections.fetch_sub(1, Ordering::Relaxed);
                        });
                    }
                    Err(e) => {
                        warn!("Accept error: {}", e);
                    }
                }
            }
            changed = shutdown_rx.changed() => {
                if changed.is_err() || *shutdown_rx.borrow() {
                    info!("Proxy server shutting down");
                    return;
                }
            }
        }
    }
}

/// Handle a single client connection.
///
/// Reads the request head, extracts the target domain, consults the store,
/// and dispatches to the tunnel or forwarding handler.
async fn handle_connection(stream: TcpStream, state: &ProxyState) -> Result<()> {
    // The BufReader stays with the connection: it may have read ahead past
    // the head, and the handlers relay those bytes.
    let mut reader = BufReader::new(stream);
    let head = match http::read_head(&mut reader).await {
        Ok(Some(head)) => head,
        Ok(None) => return Ok(()),
        Err(e @ ProxyError::HeaderTooLarge { .. }) => {
            http::reject(&mut reader, 431, &format!("ddash: {}\n", e)).await?;
            return Err(e);
        }
        Err(ProxyError::Io(e)) => return Err(ProxyError::Io(e)),
        Err(e) => return bad_request(&mut reader, e).await,
    };

    let request = match parse_request_line(&head.start_line) {
        Ok(r) => r,
        Err(e) => return bad_request(&mut reader, e).await,
    };

    if request.is_connect() {
        let (host, port) = match parse_connect_target(&request.target) {
            Ok(t) => t,
            Err(e) => return bad_request(&mut reader, e).await,
        };
        debug!("CONNECT request to {}:{}", host, port);

        if !gate(state, ProxyMode::Connect, &host, port, &mut reader).await? {
            return Ok(());
        }
        connect::handle_connect(reader, &host, port, state.config.connect_timeout()).await
    } else {
        let target = match parse_forward_target(&request.target) {
            Ok(t) => t,
            Err(e) => return bad_request(&mut reader, e).await,
        };
        debug!("{} request to {}", request.method, target.authority);

        if !gate(state, ProxyMode::Forward, &target.host, target.port, &mut reader).await? {
            return Ok(());
        }
        let ctx = ForwardCtx {
            tls_connector: &state.tls_connector,
            connect_timeout: state.config.connect_timeout(),
        };
        forward::handle_forward(reader, &request, &head, &target, &ctx).await
    }
}

/// Resolve the domain for `host` and answer 403 if it is not permitted.
///
/// Returns whether the connection may proceed.
async fn gate<S>(state: &ProxyState, mode: ProxyMode, host: &str, port: u16, client: &mut S) -> Result<bool>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let resolution = state.store.resolve(host).await;
    audit::log_decision(mode, host, port, resolution.decision, resolution.source);

    if resolution.decision.is_allowed() {
        return Ok(true);
    }
    http::reject(client, 403, http::BLOCKED_BODY).await?;
    Ok(false)
}

async fn bad_request<S>(client: &mut S, e: ProxyError) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    http::reject(client, 400, &format!("ddash: bad request: {}\n", e)).await?;
    Err(e)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::prompt::ControlChannel;
    use std::io::Cursor;
    use std::time::Duration;
    use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWriteExt};

    /// Loopback backend that answers every request and counts connections.
    ///
    /// Requests with a body (length-delimited or chunked) are echoed back as
    /// `echo:<body>`. `/chunked` gets a chunked response. Others get `body`.
    async fn backend(body: &'static str) -> (SocketAddr, Arc<AtomicUsize>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        serve_backend(listener, body)
    }

    fn serve_backend(listener: TcpListener, body: &'static str) -> (SocketAddr, Arc<AtomicUsize>) {
        let addr = listener.local_addr().unwrap();
        let connections = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&connections);

        tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else {
                    return;
                };
                counter.fetch_add(1, Ordering::SeqCst);
                tokio::spawn(async move {
                    let mut reader = BufReader::new(stream);
                    let Ok(Some(head)) = http::read_head(&mut reader).await else {
                        return;
                    };
                    let response = if head.start_line.contains(" /chunked ") {
                        "HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n4\r\nabcd\r\n0\r\n\r\n"
                            .to_string()
                    } else {
                        let reply = if head.header("transfer-encoding").is_some() {
                            format!("echo:{}", read_chunked(&mut reader).await)
                        } else if let Some(len) = head.header("content-length") {
                            let mut buf = vec![0u8; len.parse().unwrap()];
                            reader.read_exact(&mut buf).await.unwrap();
                            format!("echo:{}", String::from_utf8(buf).unwrap())
                        } else {
                            body.to_string()
                        };
                        format!(
                            "HTTP/1.1 200 OK\r\nContent-Type: text/plain\r\nContent-Length: {}\r\nKeep-Alive: timeout=5\r\n\r\n{}",
                            reply.len(),
                            reply
                        )
                    };
                    let stream = reader.get_mut();
                    let _ = stream.write_all(response.as_bytes()).await;
                    let _ = stream.shutdown().await;
                });
            }
        });

        (addr, connections)
    }

    async fn read_chunked<R: AsyncBufRead + Unpin>(reader: &mut R) -> String {
        let mut body = Vec::new();
        loop {
            let mut size_line = String::new();
            reader.read_line(&mut size_line).await.unwrap();
            let size = usize::from_str_radix(size_line.trim(), 16).unwrap();
            let mut chunk = vec![0u8; size + 2];
            reader.read_exact(&mut chunk).await.unwrap();
            if size == 0 {
                return String::from_utf8(body).unwrap();
            }
            body.extend_from_slice(&chunk[..size]);
        }
    }

    fn seeded(domain: &str, token: &str) -> ProxyConfig {
        let mut config = ProxyConfig {
            command_name: "test".to_string(),
            ..Default::default()
        };
        config.domains.insert(domain.to_string(), token.to_string());
        config
    }

    fn scripted(input: &str) -> Box<dyn Resolver> {
        let channel = ControlChannel::new(Cursor::new(input.as_bytes().to_vec()), std::io::sink());
        Box::new(TerminalResolver::with_channel(channel))
    }

    fn no_terminal() -> Box<dyn Resolver> {
        Box::new(TerminalResolver::new("/nonexistent/ddash-control-tty"))
    }

    /// Send a raw request and read until the proxy closes the connection.
    async fn roundtrip(proxy: SocketAddr, request: &str) -> String {
        let mut stream = TcpStream::connect(proxy).await.unwrap();
        stream.write_all(request.as_bytes()).await.unwrap();
        let mut response = Vec::new();
        tokio::time::timeout(Duration::from_secs(5), stream.read_to_end(&mut response))
            .await
            .unwrap()
            .unwrap();
        String::from_utf8_lossy(&response).into_owned()
    }

    /// Like [`roundtrip`], but `None` if the connection fails at any point.
    async fn try_roundtrip(proxy: SocketAddr, request: &str) -> Option<String> {
        let mut stream = TcpStream::connect(proxy).await.ok()?;
        stream.write_all(request.as_bytes()).await.ok()?;
        let mut response = Vec::new();
        tokio::time::timeout(Duration::from_secs(5), stream.read_to_end(&mut response))
            .await
            .ok()?
            .ok()?;
        Some(String::from_utf8_lossy(&response).into_owned())
    }

    fn get(backend: SocketAddr) -> String {
        format!(
            "GET http://{}/ HTTP/1.1\r\nHost: {}\r\nProxy-Connection: keep-alive\r\n\r\n",
            backend, backend
        )
    }

    fn body_of(response: &str) -> &str {
        response.split_once("\r\n\r\n").map(|(_, b)| b).unwrap_or("")
    }

    #[tokio::test]
    async fn test_proxy_starts_and_binds() {
        let handle = start_with_resolver(ProxyConfig::default(), no_terminal())
            .await
            .unwrap();

        assert!(handle.port() > 0);
        assert!(handle.addr().ip().is_loopback());

        let stream = TcpStream::connect(handle.addr()).await;
        assert!(stream.is_ok());

        handle.shutdown();
    }

    #[tokio::test]
    async fn test_bind_failure_is_returned() {
        let taken = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let config = ProxyConfig {
            bind_port: taken.local_addr().unwrap().port(),
            ..Default::default()
        };
        let err = start_with_resolver(config, no_terminal()).await.unwrap_err();
        assert!(matches!(err, ProxyError::Bind { .. }));
    }

    #[tokio::test]
    async fn test_proxy_env_vars() {
        let handle = start_with_resolver(ProxyConfig::default(), no_terminal())
            .await
            .unwrap();

        let vars = handle.env_vars();
        let expected = format!("http://127.0.0.1:{}", handle.port());
        for key in ["HTTP_PROXY", "HTTPS_PROXY", "http_proxy", "https_proxy"] {
            let var = vars.iter().find(|(k, _)| k == key).unwrap();
            assert_eq!(var.1, expected);
        }

        handle.shutdown();
    }

    #[tokio::test]
    async fn test_cached_allow_reaches_backend() {
        let (backend, connections) = backend("backend-ok").await;
        let handle = start_with_resolver(seeded("127.0.0.1", "allow"), no_terminal())
            .await
            .unwrap();

        let response = roundtrip(handle.addr(), &get(backend)).await;
        assert!(response.starts_with("HTTP/1.1 200 OK\r\n"), "{}", response);
        assert_eq!(body_of(&response), "backend-ok");
        assert!(response.contains("Connection: close\r\n"));
        assert!(!response.contains("Keep-Alive"));
        assert_eq!(connections.load(Ordering::SeqCst), 1);

        handle.shutdown();
    }

    #[tokio::test]
    async fn test_cached_always_allows() {
        let (backend, _) = backend("ok").await;
        let handle = start_with_resolver(seeded("127.0.0.1", "always"), no_terminal())
            .await
            .unwrap();

        let response = roundtrip(handle.addr(), &get(backend)).await;
        assert_eq!(body_of(&response), "ok");

        handle.shutdown();
    }

    #[tokio::test]
    async fn test_cached_deny_never_reaches_backend() {
        for token in ["deny", "never", "bogus"] {
            let (backend, connections) = backend("should-not-reach").await;
            let handle = start_with_resolver(seeded("127.0.0.1", token), no_terminal())
                .await
                .unwrap();

            let response = roundtrip(handle.addr(), &get(backend)).await;
            assert!(response.starts_with("HTTP/1.1 403 Forbidden\r\n"), "{}", response);
            assert_eq!(body_of(&response), http::BLOCKED_BODY);
            assert_eq!(connections.load(Ordering::SeqCst), 0);

            handle.shutdown();
        }
    }

    #[tokio::test]
    async fn test_post_body_is_forwarded() {
        let (backend, _) = backend("unused").await;
        let handle = start_with_resolver(seeded("127.0.0.1", "allow"), no_terminal())
            .await
            .unwrap();

        let request = format!(
            "POST http://{}/submit HTTP/1.1\r\nHost: {}\r\nContent-Length: 11\r\n\r\nhello world",
            backend, backend
        );
        let response = roundtrip(handle.addr(), &request).await;
        assert_eq!(body_of(&response), "echo:hello world");

        handle.shutdown();
    }

    #[tokio::test]
    async fn test_connect_allowed_tunnels_bytes() {
        let (backend, connections) = backend("tunneled").await;
        let handle = start_with_resolver(seeded("127.0.0.1", "allow"), no_terminal())
            .await
            .unwrap();

        let mut stream = TcpStream::connect(handle.addr()).await.unwrap();
        stream
            .write_all(format!("CONNECT {} HTTP/1.1\r\nHost: {}\r\n\r\n", backend, backend).as_bytes())
            .await
            .unwrap();

        let mut established = [0u8; 39];
        stream.read_exact(&mut established).await.unwrap();
        assert_eq!(&established[..], b"HTTP/1.1 200 Connection Established\r\n\r\n");

        // Anything can flow through the tunnel; plain HTTP is easy to assert on.
        stream
            .write_all(b"GET / HTTP/1.1\r\nHost: backend\r\n\r\n")
            .await
            .unwrap();
        let mut response = Vec::new();
        tokio::time::timeout(Duration::from_secs(5), stream.read_to_end(&mut response))
            .await
            .unwrap()
            .unwrap();
        let response = String::from_utf8(response).unwrap();
        assert!(response.contains("Keep-Alive: timeout=5"), "tunnel must not rewrite bytes");
        assert_eq!(body_of(&response), "tunneled");
        assert_eq!(connections.load(Ordering::SeqCst), 1);

        handle.shutdown();
    }

    #[tokio::test]
    async fn test_connect_denied_never_dials() {
        let (backend, connections) = backend("should-not-reach").await;
        let handle = start_with_resolver(seeded("127.0.0.1", "deny"), no_terminal())
            .await
            .unwrap();

        let response = roundtrip(
            handle.addr(),
            &format!("CONNECT {} HTTP/1.1\r\nHost: {}\r\n\r\n", backend, backend),
        )
        .await;
        assert!(response.starts_with("HTTP/1.1 403 "), "{}", response);

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(connections.load(Ordering::SeqCst), 0);

        handle.shutdown();
    }

    #[tokio::test]
    async fn test_connect_unreachable_is_502() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let dead = listener.local_addr().unwrap();
        drop(listener);

        let handle = start_with_resolver(seeded("127.0.0.1", "allow"), no_terminal())
            .await
            .unwrap();
        let response = roundtrip(handle.addr(), &format!("CONNECT {} HTTP/1.1\r\n\r\n", dead)).await;
        assert!(response.starts_with("HTTP/1.1 502 Bad Gateway\r\n"), "{}", response);
        assert!(body_of(&response).contains(&dead.to_string()));

        handle.shutdown();
    }

    #[tokio::test]
    async fn test_forward_unreachable_is_502() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let dead = listener.local_addr().unwrap();
        drop(listener);

        let handle = start_with_resolver(seeded("127.0.0.1", "allow"), no_terminal())
            .await
            .unwrap();
        let response = roundtrip(handle.addr(), &get(dead)).await;
        assert!(response.starts_with("HTTP/1.1 502 "), "{}", response);

        handle.shutdown();
    }

    #[tokio::test]
    async fn test_malformed_requests_are_400() {
        let handle = start_with_resolver(ProxyConfig::default(), no_terminal())
            .await
            .unwrap();

        for request in [
            "garbage\r\n\r\n",
            "GET /relative HTTP/1.1\r\nHost: example.com\r\n\r\n",
            "CONNECT example.com:notaport HTTP/1.1\r\n\r\n",
        ] {
            let response = roundtrip(handle.addr(), request).await;
            assert!(response.starts_with("HTTP/1.1 400 "), "{}: {}", request, response);
        }
        assert!(handle.decisions().is_empty());

        handle.shutdown();
    }

    #[tokio::test]
    async fn test_prompt_allow_is_cached() {
        let (backend, _) = backend("reached").await;
        let handle = start_with_resolver(ProxyConfig::default(), scripted("a\n"))
            .await
            .unwrap();

        let response = roundtrip(handle.addr(), &get(backend)).await;
        assert_eq!(body_of(&response), "reached");

        // The scripted channel is exhausted; a second prompt would deny.
        let response = roundtrip(handle.addr(), &get(backend)).await;
        assert_eq!(body_of(&response), "reached");
        assert_eq!(handle.decisions().get("127.0.0.1"), Some(&Decision::Allow));
        assert!(handle.persistent_decisions().is_empty());

        handle.shutdown();
    }

    #[tokio::test]
    async fn test_prompt_always_recorded() {
        let (backend, _) = backend("ok").await;
        let handle = start_with_resolver(ProxyConfig::default(), scripted("l\n"))
            .await
            .unwrap();

        let response = roundtrip(handle.addr(), &get(backend)).await;
        assert_eq!(body_of(&response), "ok");
        assert_eq!(handle.decisions().get("127.0.0.1"), Some(&Decision::Always));
        assert_eq!(
            handle.persistent_decisions().get("127.0.0.1"),
            Some(&Decision::Always)
        );

        handle.shutdown();
    }

    #[tokio::test]
    async fn test_prompt_never_recorded() {
        let (backend, connections) = backend("should-not-reach").await;
        let handle = start_with_resolver(ProxyConfig::default(), scripted("n\n"))
            .await
            .unwrap();

        let response = roundtrip(handle.addr(), &get(backend)).await;
        assert!(response.starts_with("HTTP/1.1 403 "), "{}", response);
        assert_eq!(handle.decisions().get("127.0.0.1"), Some(&Decision::Never));
        assert_eq!(connections.load(Ordering::SeqCst), 0);

        handle.shutdown();
    }

    #[tokio::test]
    async fn test_prompt_unknown_input_denies() {
        let (backend, _) = backend("should-not-reach").await;
        let handle = start_with_resolver(ProxyConfig::default(), scripted("whatever\n"))
            .await
            .unwrap();

        let response = roundtrip(handle.addr(), &get(backend)).await;
        assert!(response.starts_with("HTTP/1.1 403 "), "{}", response);
        assert_eq!(handle.decisions().get("127.0.0.1"), Some(&Decision::Deny));
        assert!(handle.persistent_decisions().is_empty());

        handle.shutdown();
    }

    #[tokio::test]
    async fn test_no_control_channel_denies() {
        let (backend, connections) = backend("should-not-reach").await;
        let handle = start_with_resolver(ProxyConfig::default(), no_terminal())
            .await
            .unwrap();

        let response = roundtrip(handle.addr(), &get(backend)).await;
        assert!(response.starts_with("HTTP/1.1 403 "), "{}", response);
        assert_eq!(handle.decisions().get("127.0.0.1"), Some(&Decision::Deny));
        assert!(handle.persistent_decisions().is_empty());
        assert_eq!(connections.load(Ordering::SeqCst), 0);

        handle.shutdown();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_requests_prompt_once() {
        let (backend, _) = backend("ok").await;
        // One line of input: a second prompt would read EOF and deny.
        let handle = start_with_resolver(ProxyConfig::default(), scripted("a\n"))
            .await
            .unwrap();

        let proxy = handle.addr();
        let mut tasks = Vec::new();
        for _ in 0..8 {
            let request = get(backend);
            tasks.push(tokio::spawn(async move { roundtrip(proxy, &request).await }));
        }
        for task in tasks {
            let response = task.await.unwrap();
            assert_eq!(body_of(&response), "ok", "{}", response);
        }

        handle.shutdown();
    }

    #[tokio::test]
    async fn test_shutdown_closes_listener() {
        let handle = start_with_resolver(ProxyConfig::default(), no_terminal())
            .await
            .unwrap();
        let addr = handle.addr();
        handle.shutdown();

        let mut refused = false;
        for _ in 0..50 {
            if TcpStream::connect(addr).await.is_err() {
                refused = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(refused, "listener still accepting after shutdown");
    }

    #[tokio::test]
    async fn test_denied_upload_is_answered_not_reset() {
        let handle = start_with_resolver(seeded("blocked.example", "deny"), no_terminal())
            .await
            .unwrap();
        let body = vec![b'x'; 512 * 1024];

        for _ in 0..5 {
            let stream = TcpStream::connect(handle.addr()).await.unwrap();
            let (mut read_half, mut write_half) = stream.into_split();
            let mut payload = format!(
                "POST http://blocked.example/upload HTTP/1.1\r\nHost: blocked.example\r\nContent-Length: {}\r\n\r\n",
                body.len()
            )
            .into_bytes();
            payload.extend_from_slice(&body);

            let writer = tokio::spawn(async move {
                write_half.write_all(&payload).await.unwrap();
                write_half.shutdown().await.unwrap();
            });

            let mut response = Vec::new();
            tokio::time::timeout(Duration::from_secs(5), read_half.read_to_end(&mut response))
                .await
                .unwrap()
                .unwrap();
            let response = String::from_utf8_lossy(&response);
            assert!(response.starts_with("HTTP/1.1 403 Forbidden\r\n"), "{}", response);
            assert_eq!(body_of(&response), http::BLOCKED_BODY);
            writer.await.unwrap();
        }

        handle.shutdown();
    }

    #[tokio::test]
    async fn test_oversized_head_is_431() {
        let handle = start_with_resolver(ProxyConfig::default(), no_terminal())
            .await
            .unwrap();

        let request = format!(
            "GET http://example.com/ HTTP/1.1\r\nHost: example.com\r\nX-Big: {}\r\n\r\n",
            "a".repeat(http::MAX_HEADER_SIZE + 4096)
        );
        let response = roundtrip(handle.addr(), &request).await;
        assert!(
            response.starts_with("HTTP/1.1 431 Request Header Fields Too Large\r\n"),
            "{}",
            response
        );
        assert!(handle.decisions().is_empty());

        handle.shutdown();
    }

    #[tokio::test]
    async fn test_connection_limit() {
        let (backend, _) = backend("ok").await;
        let mut config = seeded("127.0.0.1", "allow");
        config.max_connections = 1;
        let handle = start_with_resolver(config, no_terminal()).await.unwrap();

        // An open tunnel holds the only slot.
        let mut tunnel = TcpStream::connect(handle.addr()).await.unwrap();
        tunnel
            .write_all(format!("CONNECT {} HTTP/1.1\r\n\r\n", backend).as_bytes())
            .await
            .unwrap();
        let mut established = [0u8; 39];
        tunnel.read_exact(&mut established).await.unwrap();

        let mut rejected = TcpStream::connect(handle.addr()).await.unwrap();
        let mut received = Vec::new();
        let read = tokio::time::timeout(Duration::from_secs(5), rejected.read_to_end(&mut received))
            .await
            .unwrap();
        assert!(read.is_err() || received.is_empty());

        // Closing the tunnel frees the slot.
        drop(tunnel);
        let mut served = false;
        for _ in 0..50 {
            if let Some(response) = try_roundtrip(handle.addr(), &get(backend)).await {
                if body_of(&response) == "ok" {
                    served = true;
                    break;
                }
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(served, "slot was not released after the tunnel closed");

        handle.shutdown();
    }

    #[tokio::test]
    async fn test_chunked_request_body_is_forwarded() {
        let (backend, _) = backend("unused").await;
        let handle = start_with_resolver(seeded("127.0.0.1", "allow"), no_terminal())
            .await
            .unwrap();

        let request = format!(
            "POST http://{}/submit HTTP/1.1\r\nHost: {}\r\nTransfer-Encoding: chunked\r\n\r\n5\r\nhello\r\n6\r\n world\r\n0\r\n\r\n",
            backend, backend
        );
        let response = roundtrip(handle.addr(), &request).await;
        assert!(response.starts_with("HTTP/1.1 200 OK\r\n"), "{}", response);
        assert_eq!(body_of(&response), "echo:hello world");

        handle.shutdown();
    }

    #[tokio::test]
    async fn test_chunked_response_passes_through() {
        let (backend, _) = backend("unused").await;
        let handle = start_with_resolver(seeded("127.0.0.1", "allow"), no_terminal())
            .await
            .unwrap();

        let request = format!(
            "GET http://{}/chunked HTTP/1.1\r\nHost: {}\r\n\r\n",
            backend, backend
        );
        let response = roundtrip(handle.addr(), &request).await;
        assert!(response.contains("Transfer-Encoding: chunked\r\n"), "{}", response);
        assert!(response.contains("Connection: close\r\n"));
        assert_eq!(body_of(&response), "4\r\nabcd\r\n0\r\n\r\n");

        handle.shutdown();
    }

    #[tokio::test]
    async fn test_connect_ipv6_literal() {
        let Ok(listener) = TcpListener::bind("[::1]:0").await else {
            // No IPv6 loopback on this host.
            return;
        };
        let (backend, connections) = serve_backend(listener, "over-v6");
        let handle = start_with_resolver(seeded("::1", "allow"), no_terminal())
            .await
            .unwrap();

        let mut stream = TcpStream::connect(handle.addr()).await.unwrap();
        stream
            .write_all(format!("CONNECT {} HTTP/1.1\r\nHost: {}\r\n\r\n", backend, backend).as_bytes())
            .await
            .unwrap();
        let mut established = [0u8; 39];
        stream.read_exact(&mut established).await.unwrap();
        assert_eq!(&established[..], b"HTTP/1.1 200 Connection Established\r\n\r\n");

        stream
            .write_all(b"GET / HTTP/1.1\r\nHost: backend\r\n\r\n")
            .await
            .unwrap();
        let mut response = Vec::new();
        tokio::time::timeout(Duration::from_secs(5), stream.read_to_end(&mut response))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(body_of(&String::from_utf8(response).unwrap()), "over-v6");
        assert_eq!(connections.load(Ordering::SeqCst), 1);
        assert_eq!(handle.decisions().get("::1"), Some(&Decision::Allow));

        handle.shutdown();
    }
}
