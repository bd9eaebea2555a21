//! Durable conversation identity.
//!
//! A conversation id is minted at most once. Before minting, the identity
//! consults an [`AmbientIdSource`]: a place where an interrupted run of the
//! same front end may already have published the id (the terminal front end
//! uses a small pointer file for this).

use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// External place an id can be recovered from and published to.
pub trait AmbientIdSource: Send + Sync {
    fn read(&self) -> Option<String>;

    fn publish(&self, id: &str) -> io::Result<()>;

    fn clear(&self) -> io::Result<()>;
}

/// No ambient state: every conversation mints a fresh id.
#[derive(Debug, Default)]
pub struct NoAmbientSource;

impl AmbientIdSource for NoAmbientSource {
    fn read(&self) -> Option<String> {
        None
    }

    fn publish(&self, _id: &str) -> io::Result<()> {
        Ok(())
    }

    fn clear(&self) -> io::Result<()> {
        Ok(())
    }
}

/// Process-local ambient slot, shared between controllers in one process.
#[derive(Debug, Default)]
pub struct MemoryAmbientSource {
    slot: Mutex<Option<String>>,
}

impl MemoryAmbientSource {
    pub fn with_id(id: impl Into<String>) -> Self {
        Self {
            slot: Mutex::new(Some(id.into())),
        }
    }
}

impl AmbientIdSource for MemoryAmbientSource {
    fn read(&self) -> Option<String> {
        self.slot.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    fn publish(&self, id: &str) -> io::Result<()> {
        *self.slot.lock().unwrap_or_else(|e| e.into_inner()) = Some(id.to_string());
        Ok(())
    }

    fn clear(&self) -> io::Result<()> {
        *self.slot.lock().unwrap_or_else(|e| e.into_inner()) = None;
        Ok(())
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct SessionPointer {
    session_id: String,
    published_at: DateTime<Utc>,
}

/// Pointer file holding the id of the conversation to resume.
#[derive(Debug, Clone)]
pub struct FileAmbientSource {
    path: PathBuf,
}

impl FileAmbientSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Accepts the JSON pointer, a bare JSON string, or a plain-text id.
fn parse_pointer(data: &str) -> Option<String> {
    let trimmed = data.trim();
    if trimmed.is_empty() {
        return None;
    }
    let id = if let Ok(pointer) = serde_json::from_str::<SessionPointer>(trimmed) {
        pointer.session_id
    } else if let Ok(legacy) = serde_json::from_str::<String>(trimmed) {
        legacy
    } else if trimmed.starts_with('{') {
        return None;
    } else {
        trimmed.to_string()
    };
    let id = id.trim().to_string();
    if id.is_empty() { None } else { Some(id) }
}

impl AmbientIdSource for FileAmbientSource {
    fn read(&self) -> Option<String> {
        match std::fs::read_to_string(&self.path) {
            Ok(data) => {
                let id = parse_pointer(&data);
                if id.is_none() {
                    tracing::warn!("Ignoring unreadable session pointer {}", self.path.display());
                }
                id
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => None,
            Err(e) => {
                tracing::warn!("Failed to read session pointer {}: {}", self.path.display(), e);
                None
            }
        }
    }

    fn publish(&self, id: &str) -> io::Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let pointer = SessionPointer {
            session_id: id.to_string(),
            published_at: Utc::now(),
        };
        let json = serde_json::to_string_pretty(&pointer).map_err(io::Error::other)?;
        std::fs::write(&self.path, json)?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&self.path, std::fs::Permissions::from_mode(0o600))?;
        }
        Ok(())
    }

    fn clear(&self) -> io::Result<()> {
        match std::fs::remove_file(&self.path) {
            Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
            _ => Ok(()),
        }
    }
}

/// Binds one conversation to a stable id.
pub struct SessionIdentity {
    bound: Mutex<Option<String>>,
    /// Serializes writes to the ambient source. Never taken under `bound`.
    publishing: Mutex<()>,
    source: Arc<dyn AmbientIdSource>,
}

impl SessionIdentity {
    pub fn new(source: Arc<dyn AmbientIdSource>) -> Self {
        Self {
            bound: Mutex::new(None),
            publishing: Mutex::new(()),
            source,
        }
    }

    /// Identity with no ambient source.
    pub fn ephemeral() -> Self {
        Self::new(Arc::new(NoAmbientSource))
    }

    pub fn current(&self) -> Option<String> {
        self.bound.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Return the bound id, recovering or minting one if needed.
    ///
    /// Concurrent callers agree on a single id. The ambient source is read
    /// and written outside the `bound` lock.
    pub fn ensure_id(&self) -> String {
        if let Some(id) = self.current() {
            return id;
        }

        let recovered = self.source.read();
        let minted = {
            let mut bound = self.bound.lock().unwrap_or_else(|e| e.into_inner());
            if let Some(id) = bound.as_ref() {
                return id.clone();
            }
            match recovered {
                Some(id) => {
                    tracing::debug!(session_id = %id, "Recovered session id from ambient source");
                    *bound = Some(id.clone());
                    return id;
                }
                None => {
                    let id = uuid::Uuid::new_v4().to_string();
                    *bound = Some(id.clone());
                    id
                }
            }
        };

        tracing::info!(session_id = %minted, "Started new conversation");
        self.publish(&minted);
        minted
    }

    /// Publish `id` unless a reset replaced it in the meantime.
    fn publish(&self, id: &str) {
        let _writing = self.publishing.lock().unwrap_or_else(|e| e.into_inner());
        if self.current().as_deref() != Some(id) {
            return;
        }
        if let Err(e) = self.source.publish(id) {
            tracing::warn!(session_id = %id, "Failed to publish session id: {}", e);
        }
    }

    /// Forget the bound id so the next [`ensure_id`](Self::ensure_id) mints
    /// a fresh one.
    pub fn reset(&self) {
        *self.bound.lock().unwrap_or_else(|e| e.into_inner()) = None;
        let _writing = self.publishing.lock().unwrap_or_else(|e| e.into_inner());
        if let Err(e) = self.source.clear() {
            tracing::warn!("Failed to clear session pointer: {}", e);
        }
    }
}

impl std::fmt::Debug for SessionIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionIdentity")
            .field("bound", &self.current())
            .finish()
    }
}
