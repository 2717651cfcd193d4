//! File-backed identity persistence.

use std::fs;
use std::path::PathBuf;

use tracing::{debug, warn};

use crate::domain::StoredIdentity;
use crate::ports::outbound::IdentityStore;

/// Identity store over a single-line file.
///
/// Reads are forgiving: a missing file, unreadable contents, or a bad
/// magic all mean "no prior state". Writes are best-effort; a failure is
/// logged and the agent continues on its in-memory identity.
#[derive(Debug, Clone)]
pub struct FileIdentityStore {
    path: PathBuf,
}

impl FileIdentityStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        FileIdentityStore { path: path.into() }
    }
}

impl IdentityStore for FileIdentityStore {
    fn load(&self) -> Option<StoredIdentity> {
        let contents = match fs::read_to_string(&self.path) {
            Ok(c) => c,
            Err(e) => {
                debug!(path = %self.path.display(), error = %e, "No identity store to restore");
                return None;
            }
        };
        let stored = StoredIdentity::parse(&contents);
        if stored.is_none() {
            warn!(path = %self.path.display(), "Identity store unreadable, starting fresh");
        }
        stored
    }

    fn save(&self, identity: &StoredIdentity) {
        let line = format!("{}\n", identity.to_line());
        if let Err(e) = fs::write(&self.path, line) {
            warn!(path = %self.path.display(), error = %e, "Failed to persist identity");
        }
    }
}

/// Store used when no identity file is configured.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopIdentityStore;

impl IdentityStore for NoopIdentityStore {
    fn load(&self) -> Option<StoredIdentity> {
        None
    }

    fn save(&self, _identity: &StoredIdentity) {}
}
