//! Interactive resolution of first-seen domains.
//!
//! When a domain has no recorded decision, the proxy asks the operator over
//! a control channel that is separate from the sandboxed process's own
//! stdio (by default `/dev/tty`). The channel is opened lazily on the first
//! prompt and reused for the rest of the run.
//!
//! Every failure path resolves to [`Decision::Deny`]: a missing terminal,
//! a write or read error, EOF, and any reply that is not one of the four
//! menu tokens.

use crate::decision::Decision;
use std::fmt;
use std::fs::OpenOptions;
use std::io::{self, BufRead, BufReader, Read, Write};
use std::path::PathBuf;
use tracing::{debug, warn};

/// Default control channel device.
pub const DEFAULT_CONTROL_PATH: &str = "/dev/tty";

/// Source of decisions for domains the store has not seen yet.
///
/// Implementations are called with the store's resolution lock held, so at
/// most one `prompt` runs at a time. `prompt` is blocking and runs on a
/// blocking-capable thread.
pub trait Resolver: Send + 'static {
    /// Decide on `domain`, which `command` is trying to reach.
    fn prompt(&mut self, domain: &str, command: &str) -> Decision;

    /// Release any open control channel. Called on proxy shutdown.
    fn close(&mut self) {}
}

/// An open bidirectional text stream to the operator.
pub struct ControlChannel {
    reader: Box<dyn BufRead + Send>,
    writer: Box<dyn Write + Send>,
}

impl fmt::Debug for ControlChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ControlChannel").finish_non_exhaustive()
    }
}

impl ControlChannel {
    /// Build a channel from separate read and write halves.
    pub fn new<R, W>(reader: R, writer: W) -> Self
    where
        R: Read + Send + 'static,
        W: Write + Send + 'static,
    {
        Self {
            reader: Box::new(BufReader::new(reader)),
            writer: Box::new(writer),
        }
    }

    /// Open a terminal-like device read+write.
    pub fn open(path: &std::path::Path) -> io::Result<Self> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        let writer = file.try_clone()?;
        Ok(Self::new(file, writer))
    }

    /// Write the question and menu for `domain`.
    fn ask(&mut self, domain: &str, command: &str) -> io::Result<()> {
        write!(
            self.writer,
            "\nddash: {} wants to connect to {}\n       [a]llow  [d]eny  a[l]ways  [n]ever: ",
            command, domain
        )?;
        self.writer.flush()
    }

    /// Read one line of reply. EOF yields an empty string.
    fn read_reply(&mut self) -> io::Result<String> {
        let mut line = String::new();
        self.reader.read_line(&mut line)?;
        Ok(line)
    }

    fn notify(&mut self, message: &str) -> io::Result<()> {
        writeln!(self.writer, "       {}", message)?;
        self.writer.flush()
    }
}

type Opener = Box<dyn FnMut() -> io::Result<ControlChannel> + Send>;

/// Interactive resolver backed by a lazily-opened control channel.
pub struct TerminalResolver {
    label: String,
    opener: Opener,
    channel: Option<ControlChannel>,
}

impl fmt::Debug for TerminalResolver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TerminalResolver")
            .field("label", &self.label)
            .field("open", &self.channel.is_some())
            .finish()
    }
}

impl TerminalResolver {
    /// Resolver that opens the device at `path` on first use.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let label = path.display().to_string();
        Self {
            label,
            opener: Box::new(move || ControlChannel::open(&path)),
            channel: None,
        }
    }

    /// Resolver with a custom opener, invoked on first use and again after a
    /// failed open.
    pub fn with_opener<F>(label: impl Into<String>, opener: F) -> Self
    where
        F: FnMut() -> io::Result<ControlChannel> + Send + 'static,
    {
        Self {
            label: label.into(),
            opener: Box::new(opener),
            channel: None,
        }
    }

    /// Resolver over an already-open channel.
    pub fn with_channel(channel: ControlChannel) -> Self {
        Self {
            label: "control channel".to_string(),
            opener: Box::new(|| {
                Err(io::Error::new(
                    io::ErrorKind::NotConnected,
                    "control channel closed",
                ))
            }),
            channel: Some(channel),
        }
    }

    /// Whether the control channel is currently open.
    #[must_use]
    pub fn is_open(&self) -> bool {
        self.channel.is_some()
    }

    fn channel(&mut self, domain: &str) -> Option<&mut ControlChannel> {
        if self.channel.is_none() {
            match (self.opener)() {
                Ok(channel) => {
                    debug!("Opened control channel {}", self.label);
                    self.channel = Some(channel);
                }
                Err(e) => {
                    warn!(
                        "Cannot open control channel {}: {}; denying {}",
                        self.label, e, domain
                    );
                    eprintln!("ddash: can't open {}, denying {}", self.label, domain);
                    return None;
                }
            }
        }
        self.channel.as_mut()
    }
}

impl Resolver for TerminalResolver {
    fn prompt(&mut self, domain: &str, command: &str) -> Decision {
        let Some(channel) = self.channel(domain) else {
            return Decision::Deny;
        };

        if let Err(e) = channel.ask(domain, command) {
            warn!("Failed to write prompt for {}: {}", domain, e);
            return Decision::Deny;
        }

        let reply = match channel.read_reply() {
            Ok(reply) => reply,
            Err(e) => {
                warn!("Failed to read reply for {}: {}", domain, e);
                return Decision::Deny;
            }
        };

        let reply = reply.trim().to_lowercase();
        match parse_reply(&reply) {
            Some(decision) => decision,
            None => {
                let _ = channel.notify(&format!("(unknown input {:?}, denying)", reply));
                Decision::Deny
            }
        }
    }

    fn close(&mut self) {
        if self.channel.take().is_some() {
            debug!("Closed control channel {}", self.label);
        }
    }
}

/// Map a trimmed, lower-cased reply to a decision.
///
/// Accepts the single-letter menu keys and the full words. Anything else,
/// including the empty string, is `None` and must be treated as a denial.
#[must_use]
pub fn parse_reply(reply: &str) -> Option<Decision> {
    match reply {
        "a" | "allow" => Some(Decision::Allow),
        "d" | "deny" => Some(Decision::Deny),
        "l" | "always" => Some(Decision::Always),
        "n" | "never" => Some(Decision::Never),
        _ => None,
    }
}
