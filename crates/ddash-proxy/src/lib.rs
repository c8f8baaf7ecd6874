//! Interactive network-permission proxy for the ddash sandbox.
//!
//! `ddash-proxy` listens on loopback and gates every outbound connection of
//! a sandboxed command by its destination domain:
//!
//! 1. **CONNECT tunnel** (`connect`) - Opaque byte relay after the domain is
//!    permitted. TLS is never terminated.
//!
//! 2. **Plain forwarding** (`forward`) - Absolute-form `http://` and
//!    `https://` requests are replayed to the destination and the response
//!    streamed back.
//!
//! Domains are resolved through the [`DecisionStore`]. Pre-seeded or
//! previously answered domains resolve immediately; unknown domains are put
//! to the user over a control channel (`/dev/tty` by default) exactly once.
//! Anything that goes wrong while asking denies.

pub mod audit;
pub mod config;
pub mod connect;
pub mod decision;
pub mod error;
pub mod forward;
pub mod http;
pub mod prompt;
pub mod server;
pub mod store;
pub mod target;

pub use config::ProxyConfig;
pub use decision::Decision;
pub use error::{ProxyError, Result};
pub use prompt::{ControlChannel, Resolver, TerminalResolver};
pub use server::{start, start_with_resolver, ProxyHandle, ProxyServer};
pub use store::DecisionStore;
