//! Per-conversation session state.

mod identity;

use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};

use crate::backend::ScanType;

pub use self::identity::{
    AmbientIdSource, FileAmbientSource, MemoryAmbientSource, NoAmbientSource, SessionIdentity,
};

/// Kind of multi-step operation guarded by an activity token.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ActivityKind {
    Bootstrap,
    Scan,
    Stream,
}

/// Proof that an operation was the latest one started for its key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActivityToken {
    pub kind: ActivityKind,
    pub key: String,
    generation: u64,
}

/// Latest generation per `(kind, key)`.
///
/// Starting an operation hands out a new token and supersedes any older one
/// for the same key. A token stays current until it finishes, is superseded,
/// or the map is cleared.
#[derive(Debug, Default)]
pub struct ActivityTokens {
    next_generation: u64,
    active: HashMap<(ActivityKind, String), u64>,
}

impl ActivityTokens {
    pub fn begin(&mut self, kind: ActivityKind, key: impl Into<String>) -> ActivityToken {
        self.next_generation += 1;
        let key = key.into();
        self.active
            .insert((kind, key.clone()), self.next_generation);
        ActivityToken {
            kind,
            key,
            generation: self.next_generation,
        }
    }

    /// Whether any operation is in flight for `(kind, key)`.
    pub fn is_active(&self, kind: ActivityKind, key: &str) -> bool {
        self.active.contains_key(&(kind, key.to_string()))
    }

    pub fn is_current(&self, token: &ActivityToken) -> bool {
        self.active
            .get(&(token.kind, token.key.clone()))
            .is_some_and(|generation| *generation == token.generation)
    }

    /// Release `token`. Returns false if it had already been superseded.
    pub fn finish(&mut self, token: &ActivityToken) -> bool {
        if self.is_current(token) {
            self.active.remove(&(token.kind, token.key.clone()));
            true
        } else {
            false
        }
    }

    /// Drop every token of `kind`.
    pub fn cancel_kind(&mut self, kind: ActivityKind) {
        self.active.retain(|(k, _), _| *k != kind);
    }

    pub fn clear(&mut self) {
        self.active.clear();
    }
}

/// Account bootstrap progress for one address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BootstrapPhase {
    Idle,
    Initializing,
    FetchingSummary,
    Presenting,
    OfferingScanTypes,
    Done,
    Error,
}

/// A completed scan that questions are answered against.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BoundJob {
    pub job_id: String,
    pub address: String,
    pub scan_type: ScanType,
    pub count: u64,
}

/// Scan waiting for the user to say how many items to fetch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingLimit {
    pub address: String,
    pub scan_type: ScanType,
}

#[derive(Debug, Default)]
pub struct Session {
    /// Address the conversation is about.
    pub address: Option<String>,
    /// Job currently being polled. Cleared on any terminal status.
    pub job_id: Option<String>,
    pub bound_job: Option<BoundJob>,
    pub scan_type: ScanType,
    pub pending_limit: Option<PendingLimit>,
    /// A scan is being submitted or polled.
    pub scan_loading: bool,
    /// An answer is streaming.
    pub stream_loading: bool,
    pub activity: ActivityTokens,
    failed_auto: HashSet<String>,
    phases: HashMap<String, BootstrapPhase>,
}

impl Session {
    pub fn remember_failed(&mut self, key: &str) {
        self.failed_auto.insert(key.to_string());
    }

    pub fn forget_failed(&mut self, key: &str) {
        self.failed_auto.remove(key);
    }

    pub fn has_failed(&self, key: &str) -> bool {
        self.failed_auto.contains(key)
    }

    pub fn phase(&self, address: &str) -> BootstrapPhase {
        self.phases
            .get(address)
            .copied()
            .unwrap_or(BootstrapPhase::Idle)
    }

    pub fn set_phase(&mut self, address: &str, phase: BootstrapPhase) {
        tracing::debug!(address, ?phase, "Bootstrap phase");
        self.phases.insert(address.to_string(), phase);
    }

    pub fn is_loading(&self) -> bool {
        self.scan_loading || self.stream_loading
    }

    /// Take the polled job id, marking it terminal.
    pub fn clear_job(&mut self) -> Option<String> {
        self.scan_loading = false;
        self.job_id.take()
    }
}
