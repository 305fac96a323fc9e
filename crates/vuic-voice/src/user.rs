//! End-user identity sent with every request.
//!
//! The generated id is created once and persisted under [`END_USER_ID_KEY`] so the
//! same installation is recognized across runs.

use crate::error::{VoiceError, VoiceResult};
use once_cell::sync::OnceCell;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tracing::{debug, warn};

/// Storage key of the generated end-user id.
pub const END_USER_ID_KEY: &str = "VUIC_EU_ID";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EndUser {
    pub end_user_agent: String,
    pub generated_end_user_id: String,
    pub provided_end_user_id: Option<String>,
}

/// Key/value persistence for identity data.
pub trait IdentityStore: Send + Sync {
    fn get(&self, key: &str) -> VoiceResult<Option<String>>;
    fn set(&self, key: &str, value: &str) -> VoiceResult<()>;
}

/// Identity persisted as a flat TOML table.
#[derive(Debug)]
pub struct FileIdentityStore {
    path: PathBuf,
    lock: Mutex<()>,
}

impl FileIdentityStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    /// `<data_dir>/identity.toml`
    pub fn in_dir(data_dir: &Path) -> Self {
        Self::new(data_dir.join("identity.toml"))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn read_table(&self) -> VoiceResult<BTreeMap<String, String>> {
        if !self.path.exists() {
            return Ok(BTreeMap::new());
        }
        let content = fs::read_to_string(&self.path)?;
        toml::from_str(&content).map_err(|e| {
            VoiceError::Config(format!("invalid identity file {}: {}", self.path.display(), e))
        })
    }
}

impl IdentityStore for FileIdentityStore {
    fn get(&self, key: &str) -> VoiceResult<Option<String>> {
        let _guard = self.lock.lock().unwrap_or_else(|e| e.into_inner());
        Ok(self.read_table()?.remove(key))
    }

    fn set(&self, key: &str, value: &str) -> VoiceResult<()> {
        let _guard = self.lock.lock().unwrap_or_else(|e| e.into_inner());
        let mut table = self.read_table()?;
        table.insert(key.to_string(), value.to_string());
        let content = toml::to_string_pretty(&table)
            .map_err(|e| VoiceError::Config(format!("could not encode identity: {}", e)))?;

        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&self.path, content)?;
        Ok(())
    }
}

/// In-process store; nothing survives a restart.
#[derive(Debug, Default)]
pub struct MemoryIdentityStore {
    values: Mutex<BTreeMap<String, String>>,
}

impl MemoryIdentityStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl IdentityStore for MemoryIdentityStore {
    fn get(&self, key: &str) -> VoiceResult<Option<String>> {
        Ok(self.values.lock().unwrap_or_else(|e| e.into_inner()).get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> VoiceResult<()> {
        self.values
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(key.to_string(), value.to_string());
        Ok(())
    }
}

/// Builds the [`EndUser`] bundle, generating and persisting the id on first use.
pub struct UserIdentity {
    provided_id: Option<String>,
    store: Arc<dyn IdentityStore>,
    generated_id: OnceCell<String>,
}

impl UserIdentity {
    pub fn new(provided_id: Option<String>, store: Arc<dyn IdentityStore>) -> Self {
        Self {
            provided_id,
            store,
            generated_id: OnceCell::new(),
        }
    }

    pub fn end_user(&self) -> EndUser {
        EndUser {
            end_user_agent: user_agent(),
            generated_end_user_id: self.generated_id().to_string(),
            provided_end_user_id: self.provided_id.clone(),
        }
    }

    /// Stored id, or a new one. Store failures are logged and yield an id for this process only.
    pub fn generated_id(&self) -> &str {
        self.generated_id.get_or_init(|| {
            match self.store.get(END_USER_ID_KEY) {
                Ok(Some(id)) if !id.trim().is_empty() => return id,
                Ok(_) => {}
                Err(e) => warn!("could not read end-user id: {}", e),
            }
            let id = generate_end_user_id();
            match self.store.set(END_USER_ID_KEY, &id) {
                Ok(()) => debug!("generated end-user id {}", id),
                Err(e) => warn!("could not persist end-user id: {}", e),
            }
            id
        })
    }
}

/// `vuic:uid:{unix_millis}:{random}`
pub fn generate_end_user_id() -> String {
    let random = uuid::Uuid::new_v4().simple().to_string();
    format!("vuic:uid:{}:{}", chrono::Utc::now().timestamp_millis(), &random[..12])
}

/// Host description standing in for a browser user agent.
pub fn user_agent() -> String {
    format!(
        "vuic-voice/{} ({}; {})",
        env!("CARGO_PKG_VERSION"),
        std::env::consts::OS,
        std::env::consts::ARCH
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_id_format() {
        let id = generate_end_user_id();
        let parts: Vec<&str> = id.split(':').collect();
        assert_eq!(parts.len(), 4);
        assert_eq!(parts[0], "vuic");
        assert_eq!(parts[1], "uid");
        assert!(parts[2].parse::<i64>().is_ok());
        assert_eq!(parts[3].len(), 12);
        assert_ne!(id, generate_end_user_id());
    }

    #[test]
    fn id_is_persisted_and_reused() {
        let dir = tempfile::tempdir().unwrap();
        let store: Arc<dyn IdentityStore> =
            Arc::new(FileIdentityStore::in_dir(&dir.path().join("nested")));

        let first = UserIdentity::new(None, Arc::clone(&store)).end_user();
        let second = UserIdentity::new(Some("customer-42".into()), Arc::clone(&store)).end_user();

        assert_eq!(first.generated_end_user_id, second.generated_end_user_id);
        assert_eq!(second.provided_end_user_id.as_deref(), Some("customer-42"));
        assert_eq!(store.get(END_USER_ID_KEY).unwrap(), Some(first.generated_end_user_id));
    }

    #[test]
    fn serializes_with_wire_names() {
        let identity = UserIdentity::new(None, Arc::new(MemoryIdentityStore::new()));
        let json = serde_json::to_value(identity.end_user()).unwrap();
        assert!(json["endUserAgent"].as_str().unwrap().starts_with("vuic-voice/"));
        assert!(json["generatedEndUserId"].as_str().unwrap().starts_with("vuic:uid:"));
        assert!(json["providedEndUserId"].is_null());
    }

    #[test]
    fn corrupt_store_still_yields_an_id() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("identity.toml");
        fs::write(&path, "not = [valid").unwrap();
        let identity = UserIdentity::new(None, Arc::new(FileIdentityStore::new(&path)));
        assert!(identity.generated_id().starts_with("vuic:uid:"));
    }
}
