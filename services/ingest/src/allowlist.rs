//! Identity allowlist.
//!
//! Loaded once at startup from a line-oriented file (one identifier per line,
//! surrounding whitespace trimmed, blank lines ignored) and shared read-only
//! with every connection handler. A missing file yields an empty allowlist,
//! so every heartbeat is rejected. There is no hot-reload; a reload would
//! swap the `Arc<Allowlist>` handed to new connections.

use std::collections::HashSet;
use std::io::ErrorKind;
use std::path::Path;
use tracing::warn;

#[derive(Debug, thiserror::Error)]
pub enum AllowlistError {
    #[error("reading allowlist '{path}': {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

/// The set of identifiers whose heartbeats may be persisted.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Allowlist {
    approved: HashSet<String>,
}

impl Allowlist {
    /// Load from `path`.
    ///
    /// A missing file is not an error: it logs a warning and returns an empty
    /// allowlist. Any other read failure is returned to the caller.
    pub fn load(path: &Path) -> Result<Self, AllowlistError> {
        match std::fs::read_to_string(path) {
            Ok(contents) => Ok(Self::parse(&contents)),
            Err(e) if e.kind() == ErrorKind::NotFound => {
                warn!(path = %path.display(), "allowlist file not found; no identifiers approved");
                Ok(Self::default())
            }
            Err(source) => Err(AllowlistError::Io {
                path: path.display().to_string(),
                source,
            }),
        }
    }

    /// Parse allowlist file contents.
    pub fn parse(contents: &str) -> Self {
        Self::from_ids(contents.lines())
    }

    pub fn from_ids<I, S>(ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let approved = ids
            .into_iter()
            .map(|id| id.as_ref().trim().to_owned())
            .filter(|id| !id.is_empty())
            .collect();
        Allowlist { approved }
    }

    /// Exact, case-sensitive membership check.
    pub fn is_approved(&self, id: &str) -> bool {
        self.approved.contains(id)
    }

    pub fn len(&self) -> usize {
        self.approved.len()
    }

    pub fn is_empty(&self) -> bool {
        self.approved.is_empty()
    }
}
