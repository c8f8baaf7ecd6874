//! Decision Store: the single source of truth for per-domain decisions.
//!
//! Lookups of already-decided domains take a short lock on the decision map
//! and never wait on an interactive prompt. First-seen domains go through a
//! separate resolution lock that owns the [`Resolver`]; it is held for the
//! whole prompt, so resolutions are serialized and the control channel never
//! carries two interleaved questions. A caller that waited on the resolution
//! lock re-checks the map before prompting, which is what guarantees a single
//! prompt per domain.

use crate::decision::Decision;
use crate::prompt::Resolver;
use crate::target::normalize_domain;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::{debug, warn};

/// Where a resolved decision came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Source {
    /// Already recorded (pre-seeded or resolved earlier in the run)
    Cached,
    /// Answered by the resolver for this call
    Prompted,
}

impl fmt::Display for Source {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Source::Cached => write!(f, "cached"),
            Source::Prompted => write!(f, "prompt"),
        }
    }
}

/// Outcome of [`DecisionStore::resolve`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Resolution {
    pub decision: Decision,
    pub source: Source,
}

type DecisionMap = Arc<Mutex<HashMap<String, Decision>>>;

/// Shared mapping from domain to decision.
pub struct DecisionStore {
    decisions: DecisionMap,
    resolver: Arc<tokio::sync::Mutex<Box<dyn Resolver>>>,
    command: String,
    closed: Arc<AtomicBool>,
}

impl fmt::Debug for DecisionStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DecisionStore")
            .field("command", &self.command)
            .field("domains", &lock(&self.decisions).len())
            .finish_non_exhaustive()
    }
}

fn lock(map: &Mutex<HashMap<String, Decision>>) -> MutexGuard<'_, HashMap<String, Decision>> {
    map.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Record `decision` unless the domain already has one. Returns the stored value.
fn record(map: &Mutex<HashMap<String, Decision>>, domain: &str, decision: Decision) -> Decision {
    *lock(map).entry(domain.to_string()).or_insert(decision)
}

impl DecisionStore {
    /// Create a store pre-seeded with `seed`.
    ///
    /// Keys are normalized the same way request hosts are, so seeds with a
    /// port or mixed case still match.
    pub fn new<I>(seed: I, command: impl Into<String>, resolver: Box<dyn Resolver>) -> Self
    where
        I: IntoIterator<Item = (String, Decision)>,
    {
        let decisions: HashMap<String, Decision> = seed
            .into_iter()
            .map(|(domain, decision)| (normalize_domain(&domain), decision))
            .collect();
        Self {
            decisions: Arc::new(Mutex::new(decisions)),
            resolver: Arc::new(tokio::sync::Mutex::new(resolver)),
            command: command.into(),
            closed: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Create a store from raw policy tokens.
    ///
    /// Unrecognized tokens are recorded as [`Decision::Deny`].
    pub fn from_tokens(
        seed: &HashMap<String, String>,
        command: impl Into<String>,
        resolver: Box<dyn Resolver>,
    ) -> Self {
        let parsed = seed.iter().map(|(domain, token)| {
            let decision = Decision::from_token(token);
            if decision.as_str() != token {
                warn!(
                    "unknown decision token {:?} for domain {}; treating as deny",
                    token, domain
                );
            }
            (domain.clone(), decision)
        });
        Self::new(parsed, command, resolver)
    }

    /// Recorded decision for `domain`, if any. Never prompts.
    #[must_use]
    pub fn get(&self, domain: &str) -> Option<Decision> {
        lock(&self.decisions).get(&normalize_domain(domain)).copied()
    }

    /// Return the decision for `domain`, prompting once if it is unknown.
    ///
    /// Concurrent callers for the same unknown domain all receive the answer
    /// of the single prompt. Callers for different unknown domains wait for
    /// the prompt in flight. After [`close`](Self::close) unknown domains are
    /// denied without prompting.
    pub async fn resolve(&self, domain: &str) -> Resolution {
        let domain = normalize_domain(domain);
        if let Some(decision) = self.get(&domain) {
            return Resolution {
                decision,
                source: Source::Cached,
            };
        }

        let mut resolver = Arc::clone(&self.resolver).lock_owned().await;

        if let Some(decision) = self.get(&domain) {
            debug!("{} resolved while waiting for the resolution lock", domain);
            return Resolution {
                decision,
                source: Source::Cached,
            };
        }

        if self.closed.load(Ordering::SeqCst) {
            debug!("Store closed, denying {} without prompting", domain);
            return Resolution {
                decision: record(&self.decisions, &domain, Decision::Deny),
                source: Source::Cached,
            };
        }

        let decisions = Arc::clone(&self.decisions);
        let closed = Arc::clone(&self.closed);
        let command = self.command.clone();
        let task_domain = domain.clone();

        // The prompt blocks on terminal I/O. The guard moves into the blocking
        // task and is released only after the answer is recorded.
        let joined = tokio::task::spawn_blocking(move || {
            let answer = resolver.prompt(&task_domain, &command);
            let stored = record(&decisions, &task_domain, answer);
            if closed.load(Ordering::SeqCst) {
                resolver.close();
            }
            stored
        })
        .await;

        let decision = match joined {
            Ok(decision) => decision,
            Err(e) => {
                warn!("Resolver task for {} failed: {}; denying", domain, e);
                record(&self.decisions, &domain, Decision::Deny)
            }
        };

        Resolution {
            decision,
            source: Source::Prompted,
        }
    }

    /// Copy of the current domain -> decision mapping.
    #[must_use]
    pub fn snapshot(&self) -> HashMap<String, Decision> {
        lock(&self.decisions).clone()
    }

    /// The `always`/`never` subset of the snapshot.
    #[must_use]
    pub fn persistent(&self) -> HashMap<String, Decision> {
        lock(&self.decisions)
            .iter()
            .filter(|(_, decision)| decision.is_persistent())
            .map(|(domain, decision)| (domain.clone(), *decision))
            .collect()
    }

    /// Stop prompting and release the control channel.
    ///
    /// If a prompt is in flight the channel is released as soon as it
    /// completes.
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        if let Ok(mut resolver) = self.resolver.try_lock() {
            resolver.close();
        }
    }
}
