//! Request-target parsing and policy-domain extraction.
//!
//! CONNECT requests carry `host:port` authority-form targets; plain proxy
//! requests carry absolute-form URLs (`http://host:port/path`). Both reduce
//! to a policy domain by dropping the port, which is never part of the key.

use crate::error::{ProxyError, Result};
use url::{Host, Url};

/// Default port for CONNECT targets that omit one.
const DEFAULT_CONNECT_PORT: u16 = 443;

/// Parsed HTTP request line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestLine {
    pub method: String,
    pub target: String,
    pub version: String,
}

impl RequestLine {
    #[must_use]
    pub fn is_connect(&self) -> bool {
        self.method.eq_ignore_ascii_case("CONNECT")
    }
}

/// Parse `METHOD target HTTP/x.y`.
pub fn parse_request_line(line: &str) -> Result<RequestLine> {
    let mut parts = line.split_whitespace();
    match (parts.next(), parts.next(), parts.next(), parts.next()) {
        (Some(method), Some(target), Some(version), None) if version.starts_with("HTTP/") => {
            Ok(RequestLine {
                method: method.to_string(),
                target: target.to_string(),
                version: version.to_string(),
            })
        }
        _ => Err(ProxyError::HttpParse(format!(
            "malformed request line: {}",
            line
        ))),
    }
}

/// Parse the `host:port` authority of a CONNECT request.
///
/// IPv6 literals lose their brackets. A missing port defaults to 443.
pub fn parse_connect_target(authority: &str) -> Result<(String, u16)> {
    let (host, port) = if let Some(rest) = authority.strip_prefix('[') {
        let (host, tail) = rest.split_once(']').ok_or_else(|| {
            ProxyError::HttpParse(format!("unterminated IPv6 literal: {}", authority))
        })?;
        match tail.strip_prefix(':') {
            Some(port) => (host, Some(port)),
            None if tail.is_empty() => (host, None),
            None => {
                return Err(ProxyError::HttpParse(format!(
                    "malformed CONNECT authority: {}",
                    authority
                )))
            }
        }
    } else {
        match authority.rsplit_once(':') {
            Some((host, port)) if !host.contains(':') => (host, Some(port)),
            Some(_) => {
                return Err(ProxyError::HttpParse(format!(
                    "unbracketed IPv6 literal in CONNECT: {}",
                    authority
                )))
            }
            None => (authority, None),
        }
    };

    if host.is_empty() {
        return Err(ProxyError::HttpParse(format!(
            "missing host in CONNECT: {}",
            authority
        )));
    }

    let port = match port {
        Some(p) => p.parse::<u16>().map_err(|_| {
            ProxyError::HttpParse(format!("invalid port in CONNECT: {}", authority))
        })?,
        None => DEFAULT_CONNECT_PORT,
    };

    Ok((host.to_string(), port))
}

/// Scheme of an absolute-form proxy request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scheme {
    Http,
    Https,
}

/// Destination of a plain (non-CONNECT) proxy request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForwardTarget {
    pub scheme: Scheme,
    /// Host without brackets, suitable for dialing and TLS server names
    pub host: String,
    pub port: u16,
    /// Origin-form path plus query, sent on the upstream request line
    pub path: String,
    /// Authority for the upstream `Host` header when the client sent none
    pub authority: String,
}

/// Parse an absolute-form request target.
///
/// Origin-form targets (`/path`) are rejected: a forward proxy has no way to
/// know the destination for them.
pub fn parse_forward_target(target: &str) -> Result<ForwardTarget> {
    let url = Url::parse(target)
        .map_err(|e| ProxyError::HttpParse(format!("invalid request target '{}': {}", target, e)))?;

    let scheme = match url.scheme() {
        "http" => Scheme::Http,
        "https" => Scheme::Https,
        other => {
            return Err(ProxyError::HttpParse(format!(
                "unsupported URL scheme: {}",
                other
            )))
        }
    };

    let host = match url.host() {
        Some(Host::Domain(d)) => d.to_string(),
        Some(Host::Ipv4(ip)) => ip.to_string(),
        Some(Host::Ipv6(ip)) => ip.to_string(),
        None => {
            return Err(ProxyError::HttpParse(format!(
                "missing host in URL: {}",
                target
            )))
        }
    };

    let port = url.port_or_known_default().unwrap_or(match scheme {
        Scheme::Http => 80,
        Scheme::Https => 443,
    });

    let mut path = url.path().to_string();
    if path.is_empty() {
        path.push('/');
    }
    if let Some(query) = url.query() {
        path.push('?');
        path.push_str(query);
    }

    let authority = match (url.host_str(), url.port()) {
        (Some(h), Some(p)) => format!("{}:{}", h, p),
        (Some(h), None) => h.to_string(),
        (None, _) => host.clone(),
    };

    Ok(ForwardTarget {
        scheme,
        host,
        port,
        path,
        authority,
    })
}

/// Remove a `:port` suffix and IPv6 brackets from a host.
///
/// `example.com:443` -> `example.com`, `[::1]:443` -> `::1`. Hosts without a
/// port, and bare IPv6 literals, are returned unchanged.
#[must_use]
pub fn strip_port(host: &str) -> &str {
    if let Some(rest) = host.strip_prefix('[') {
        return match rest.split_once(']') {
            Some((inner, _)) => inner,
            None => host,
        };
    }
    match host.rsplit_once(':') {
        Some((name, _)) if !name.contains(':') => name,
        _ => host,
    }
}

/// Inverse of [`parse_connect_target`]: re-bracket IPv6 literals.
#[must_use]
pub fn join_host_port(host: &str, port: u16) -> String {
    if host.contains(':') {
        format!("[{}]:{}", host, port)
    } else {
        format!("{}:{}", host, port)
    }
}

/// Policy key for a host or authority.
///
/// Port and brackets are stripped, the name is lower-cased, and a single
/// trailing root dot is dropped.
#[must_use]
pub fn normalize_domain(host: &str) -> String {
    let stripped = strip_port(host.trim());
    let stripped = stripped.strip_suffix('.').unwrap_or(stripped);
    stripped.to_ascii_lowercase()
}
