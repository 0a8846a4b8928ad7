pub mod store;

pub use store::SqliteStore;

use crate::errors::MxfError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;

/// Memory visibility scope. `Relationship` is symmetric: `(a, b)` and
/// `(b, a)` address the same entry.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum MemoryScope {
    Agent(String),
    Channel(String),
    Relationship(String, String),
    Shared,
}

impl MemoryScope {
    pub fn relationship(a: impl Into<String>, b: impl Into<String>) -> Self {
        let (a, b) = (a.into(), b.into());
        if a <= b {
            Self::Relationship(a, b)
        } else {
            Self::Relationship(b, a)
        }
    }

    /// Storage coordinates: `(scope_kind, owner)`. Keys are unique within
    /// one pair.
    pub(crate) fn storage_key(&self) -> (&'static str, String) {
        match self {
            Self::Agent(agent_id) => ("agent", agent_id.clone()),
            Self::Channel(channel_id) => ("channel", channel_id.clone()),
            Self::Relationship(a, b) => {
                // Normalized at construction, but defend against direct
                // enum construction with unsorted members.
                if a <= b {
                    ("relationship", format!("{}|{}", a, b))
                } else {
                    ("relationship", format!("{}|{}", b, a))
                }
            }
            Self::Shared => ("shared", String::new()),
        }
    }

    pub fn kind(&self) -> &'static str {
        self.storage_key().0
    }
}

/// Who is asking. Produced by the session layer from verified identity;
/// the memory service trusts it.
#[derive(Debug, Clone)]
pub struct MemoryAccessor {
    pub agent_id: String,
    pub channel_id: String,
    /// System-designated writers may write `shared` scope.
    pub system_writer: bool,
}

impl MemoryAccessor {
    pub fn agent(agent_id: impl Into<String>, channel_id: impl Into<String>) -> Self {
        Self {
            agent_id: agent_id.into(),
            channel_id: channel_id.into(),
            system_writer: false,
        }
    }

    pub fn system(agent_id: impl Into<String>, channel_id: impl Into<String>) -> Self {
        Self {
            agent_id: agent_id.into(),
            channel_id: channel_id.into(),
            system_writer: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryEntry {
    pub key: String,
    pub value: Value,
    #[serde(rename = "type")]
    pub entry_type: String,
    #[serde(default)]
    pub metadata: Value,
    #[serde(rename = "expiresAt", skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
}

/// Scoped key-value memory with access control.
///
/// - `agent` — readable/writable only by that agent
/// - `channel` — readable/writable by any member agent
/// - `relationship(a,b)` — readable/writable only by `a` and `b`
/// - `shared` — readable by all, writable only by system writers
pub struct MemoryService {
    store: Arc<SqliteStore>,
}

impl MemoryService {
    pub fn new(store: Arc<SqliteStore>) -> Self {
        Self { store }
    }

    fn check_read(accessor: &MemoryAccessor, scope: &MemoryScope) -> Result<(), MxfError> {
        let allowed = match scope {
            MemoryScope::Agent(agent_id) => *agent_id == accessor.agent_id,
            MemoryScope::Channel(channel_id) => *channel_id == accessor.channel_id,
            MemoryScope::Relationship(a, b) => {
                *a == accessor.agent_id || *b == accessor.agent_id
            }
            MemoryScope::Shared => true,
        };
        if allowed {
            Ok(())
        } else {
            Err(MxfError::Operation(format!(
                "agent {} may not read {} scope",
                accessor.agent_id,
                scope.kind()
            )))
        }
    }

    fn check_write(accessor: &MemoryAccessor, scope: &MemoryScope) -> Result<(), MxfError> {
        let allowed = match scope {
            MemoryScope::Agent(agent_id) => *agent_id == accessor.agent_id,
            MemoryScope::Channel(channel_id) => *channel_id == accessor.channel_id,
            MemoryScope::Relationship(a, b) => {
                *a == accessor.agent_id || *b == accessor.agent_id
            }
            MemoryScope::Shared => accessor.system_writer,
        };
        if allowed {
            Ok(())
        } else {
            Err(MxfError::Operation(format!(
                "agent {} may not write {} scope",
                accessor.agent_id,
                scope.kind()
            )))
        }
    }

    pub fn put(
        &self,
        accessor: &MemoryAccessor,
        scope: &MemoryScope,
        entry: &MemoryEntry,
    ) -> Result<(), MxfError> {
        Self::check_write(accessor, scope)?;
        let (scope_kind, owner) = scope.storage_key();
        let metadata = entry.metadata.to_string();
        let expires = entry.expires_at.map(|t| t.to_rfc3339());
        self.store
            .put_entry(
                scope_kind,
                &owner,
                &entry.key,
                &entry.value.to_string(),
                &entry.entry_type,
                &metadata,
                expires.as_deref(),
                &Utc::now().to_rfc3339(),
            )
            .map_err(MxfError::Internal)
    }

    pub fn get(
        &self,
        accessor: &MemoryAccessor,
        scope: &MemoryScope,
        key: &str,
    ) -> Result<Option<MemoryEntry>, MxfError> {
        Self::check_read(accessor, scope)?;
        let (scope_kind, owner) = scope.storage_key();
        let row = self
            .store
            .get_entry(scope_kind, &owner, key)
            .map_err(MxfError::Internal)?;
        let Some((value, entry_type, metadata, expires_at)) = row else {
            return Ok(None);
        };

        let expires_at = expires_at.and_then(|raw| {
            DateTime::parse_from_rfc3339(&raw)
                .ok()
                .map(|t| t.with_timezone(&Utc))
        });
        // Lazy expiry: an expired entry reads as absent and is removed.
        if let Some(expiry) = expires_at {
            if expiry < Utc::now() {
                let _ = self.store.delete_entry(scope_kind, &owner, key);
                return Ok(None);
            }
        }

        Ok(Some(MemoryEntry {
            key: key.to_string(),
            value: serde_json::from_str(&value).unwrap_or(Value::String(value)),
            entry_type,
            metadata: serde_json::from_str(&metadata).unwrap_or(Value::Null),
            expires_at,
        }))
    }

    /// Idempotent delete. Returns whether an entry existed.
    pub fn delete(
        &self,
        accessor: &MemoryAccessor,
        scope: &MemoryScope,
        key: &str,
    ) -> Result<bool, MxfError> {
        Self::check_write(accessor, scope)?;
        let (scope_kind, owner) = scope.storage_key();
        self.store
            .delete_entry(scope_kind, &owner, key)
            .map_err(MxfError::Internal)
    }

    /// Keys only, sorted.
    pub fn list(
        &self,
        accessor: &MemoryAccessor,
        scope: &MemoryScope,
    ) -> Result<Vec<String>, MxfError> {
        Self::check_read(accessor, scope)?;
        let (scope_kind, owner) = scope.storage_key();
        self.store
            .list_keys(scope_kind, &owner)
            .map_err(MxfError::Internal)
    }

    pub fn sweep_expired(&self) -> Result<usize, MxfError> {
        self.store
            .sweep_expired(&Utc::now().to_rfc3339())
            .map_err(MxfError::Internal)
    }
}
