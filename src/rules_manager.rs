//! Rule set lifecycle: embedded → cached → remote
//!
//! A remote blob is fetched by [`RulesManager::check_for_updates`] and parked
//! as pending until the host confirms it with
//! [`RulesManager::apply_remote_rules`]. Readers get an immutable snapshot
//! that is swapped as a whole.

use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::PathBuf;
use std::sync::{Arc, RwLock};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use arc_swap::ArcSwap;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::config::RulesManagerConfig;
use crate::error::{RulesError, StorageError};
use crate::rules::{content_hash, CompiledRules, RuleSet, RuleSetPatch};

pub const KEY_RULES_CACHE: &str = "parsing_rules_cache";
pub const KEY_RULES_METADATA: &str = "parsing_rules_metadata";
pub const KEY_PENDING_RULES: &str = "parsing_rules_pending";
pub const KEY_REMOTE_URL: &str = "remote_config_url";

/// Key/value persistence for rule blobs
pub trait RuleStorage: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<String>, StorageError>;
    fn set(&self, key: &str, value: &str) -> Result<(), StorageError>;
    fn delete(&self, key: &str) -> Result<(), StorageError>;
}

/// In-process storage
#[derive(Debug, Default)]
pub struct MemoryStorage {
    entries: RwLock<HashMap<String, String>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

impl RuleStorage for MemoryStorage {
    fn get(&self, key: &str) -> Result<Option<String>, StorageError> {
        let entries = self.entries.read().map_err(|_| StorageError::Poisoned)?;
        Ok(entries.get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> Result<(), StorageError> {
        let mut entries = self.entries.write().map_err(|_| StorageError::Poisoned)?;
        entries.insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn delete(&self, key: &str) -> Result<(), StorageError> {
        let mut entries = self.entries.write().map_err(|_| StorageError::Poisoned)?;
        entries.remove(key);
        Ok(())
    }
}

/// One file per key under a directory
#[derive(Debug, Clone)]
pub struct FileStorage {
    dir: PathBuf,
}

impl FileStorage {
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self, StorageError> {
        let dir = dir.into();
        fs::create_dir_all(&dir).map_err(|source| StorageError::Io {
            key: dir.display().to_string(),
            source,
        })?;
        Ok(Self { dir })
    }

    fn path(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{}.json", key))
    }
}

impl RuleStorage for FileStorage {
    fn get(&self, key: &str) -> Result<Option<String>, StorageError> {
        match fs::read_to_string(self.path(key)) {
            Ok(text) => Ok(Some(text)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(source) => Err(StorageError::Io {
                key: key.to_string(),
                source,
            }),
        }
    }

    fn set(&self, key: &str, value: &str) -> Result<(), StorageError> {
        fs::write(self.path(key), value).map_err(|source| StorageError::Io {
            key: key.to_string(),
            source,
        })
    }

    fn delete(&self, key: &str) -> Result<(), StorageError> {
        match fs::remove_file(self.path(key)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(source) => Err(StorageError::Io {
                key: key.to_string(),
                source,
            }),
        }
    }
}

/// Where remote rule text comes from
pub trait RuleSource: Send + Sync {
    fn fetch(&self, url: &str) -> Result<String, RulesError>;
}

/// Blocking HTTP GET through a ureq agent
#[derive(Clone)]
pub struct HttpRuleSource {
    agent: ureq::Agent,
}

impl HttpRuleSource {
    pub fn new(config: &RulesManagerConfig) -> Self {
        let agent = ureq::Agent::new_with_config(
            ureq::Agent::config_builder()
                .timeout_global(Some(Duration::from_secs(config.fetch_timeout_secs)))
                .user_agent(config.user_agent.as_str())
                .build(),
        );
        Self { agent }
    }
}

impl Default for HttpRuleSource {
    fn default() -> Self {
        Self::new(&RulesManagerConfig::default())
    }
}

impl RuleSource for HttpRuleSource {
    fn fetch(&self, url: &str) -> Result<String, RulesError> {
        let response = match self.agent.get(url).call() {
            Ok(resp) => resp,
            Err(ureq::Error::StatusCode(status)) => {
                return Err(RulesError::Status {
                    url: url.to_string(),
                    status,
                })
            }
            Err(e) => {
                return Err(RulesError::Fetch {
                    url: url.to_string(),
                    message: e.to_string(),
                })
            }
        };

        if !response.status().is_success() {
            return Err(RulesError::Status {
                url: url.to_string(),
                status: response.status().as_u16(),
            });
        }

        response
            .into_body()
            .read_to_string()
            .map_err(|e| RulesError::Fetch {
                url: url.to_string(),
                message: e.to_string(),
            })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RulesOrigin {
    Embedded,
    Cached,
    Remote,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RuleSetMetadata {
    pub source: RulesOrigin,
    pub hash: String,
    /// Unix milliseconds
    pub last_updated: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remote_url: Option<String>,
}

/// Outcome of an update check
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateCheck {
    pub has_update: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub new_version: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hash: Option<String>,
}

impl UpdateCheck {
    pub fn no_update() -> Self {
        Self::default()
    }
}

/// Active rules plus their provenance
#[derive(Debug)]
pub struct RulesSnapshot {
    pub rules: CompiledRules,
    pub metadata: RuleSetMetadata,
}

/// Metadata as persisted next to the cached rules
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StoredMetadata {
    last_updated: u64,
    hash: String,
    #[serde(default)]
    remote_url: Option<String>,
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

pub struct RulesManager {
    storage: Arc<dyn RuleStorage>,
    source: Arc<dyn RuleSource>,
    current: ArcSwap<RulesSnapshot>,
}

impl RulesManager {
    /// Load cached rules when both blobs parse, the embedded defaults otherwise
    pub fn load(storage: Arc<dyn RuleStorage>, source: Arc<dyn RuleSource>) -> Self {
        let snapshot = match Self::load_cached(storage.as_ref()) {
            Some(snapshot) => {
                info!(hash = %snapshot.metadata.hash, "using cached parsing rules");
                snapshot
            }
            None => {
                info!("using embedded parsing rules");
                Self::embedded_snapshot()
            }
        };

        Self {
            storage,
            source,
            current: ArcSwap::from_pointee(snapshot),
        }
    }

    /// Memory storage and an HTTP source configured from `config`
    pub fn with_defaults(config: &RulesManagerConfig) -> Self {
        Self::load(
            Arc::new(MemoryStorage::new()),
            Arc::new(HttpRuleSource::new(config)),
        )
    }

    fn embedded_snapshot() -> RulesSnapshot {
        let rules = RuleSet::embedded();
        let hash = rules.content_hash();
        RulesSnapshot {
            rules: CompiledRules::new(rules),
            metadata: RuleSetMetadata {
                source: RulesOrigin::Embedded,
                hash,
                last_updated: now_millis(),
                remote_url: None,
            },
        }
    }

    fn load_cached(storage: &dyn RuleStorage) -> Option<RulesSnapshot> {
        let rules_text = match storage.get(KEY_RULES_CACHE) {
            Ok(text) => text?,
            Err(e) => {
                warn!(error = %e, "failed to read cached rules");
                return None;
            }
        };
        let meta_text = storage.get(KEY_RULES_METADATA).ok().flatten()?;

        let parsed = RuleSet::from_json(&rules_text).and_then(|rules| {
            serde_json::from_str::<StoredMetadata>(&meta_text).map(|meta| (rules, meta))
        });
        match parsed {
            Ok((rules, meta)) => Some(RulesSnapshot {
                rules: CompiledRules::new(rules),
                metadata: RuleSetMetadata {
                    source: RulesOrigin::Cached,
                    hash: meta.hash,
                    last_updated: meta.last_updated,
                    remote_url: meta.remote_url,
                },
            }),
            Err(e) => {
                warn!(error = %e, "cached rules are corrupt, ignoring");
                None
            }
        }
    }

    /// Current snapshot; stays valid while a newer one is swapped in
    pub fn current(&self) -> Arc<RulesSnapshot> {
        self.current.load_full()
    }

    pub fn metadata(&self) -> RuleSetMetadata {
        self.current.load().metadata.clone()
    }

    pub fn remote_url(&self) -> Option<String> {
        self.storage.get(KEY_REMOTE_URL).ok().flatten()
    }

    pub fn set_remote_url(&self, url: &str) -> Result<(), StorageError> {
        let url = url.trim();
        if url.is_empty() {
            self.storage.delete(KEY_REMOTE_URL)
        } else {
            self.storage.set(KEY_REMOTE_URL, url)
        }
    }

    /// Fetch the remote rules and park them as pending when the hash differs.
    /// Every failure is logged and reported as "no update".
    pub fn check_for_updates(&self, url: Option<&str>) -> UpdateCheck {
        let url = match url.map(str::to_string).or_else(|| self.remote_url()) {
            Some(url) => url,
            None => {
                debug!("no remote rules URL configured");
                return UpdateCheck::no_update();
            }
        };

        match self.fetch_pending(&url) {
            Ok(check) => check,
            Err(e) => {
                warn!(url = %url, error = %e, "rule update check failed");
                UpdateCheck::no_update()
            }
        }
    }

    fn fetch_pending(&self, url: &str) -> Result<UpdateCheck, RulesError> {
        info!(url = %url, "checking for parsing rule updates");
        let text = self.source.fetch(url)?;
        let patch = RuleSetPatch::from_json(&text)?;
        let hash = content_hash(&text);

        if hash == self.current.load().metadata.hash {
            info!("parsing rules are up to date");
            return Ok(UpdateCheck::no_update());
        }

        self.storage.set(KEY_PENDING_RULES, &text)?;
        info!(hash = %hash, "new parsing rules pending");
        Ok(UpdateCheck {
            has_update: true,
            new_version: patch.version,
            hash: Some(hash),
        })
    }

    /// Apply the pending blob if its hash is `hash`. State is untouched on
    /// any failure.
    pub fn apply_remote_rules(&self, hash: &str) -> bool {
        match self.try_apply(hash) {
            Ok(applied) => applied,
            Err(e) => {
                warn!(error = %e, "failed to apply remote rules");
                false
            }
        }
    }

    fn try_apply(&self, hash: &str) -> Result<bool, RulesError> {
        let text = match self.storage.get(KEY_PENDING_RULES)? {
            Some(text) => text,
            None => {
                warn!("no pending rules to apply");
                return Ok(false);
            }
        };

        let pending_hash = content_hash(&text);
        if pending_hash != hash {
            warn!(expected = %hash, actual = %pending_hash, "pending rules hash mismatch");
            return Ok(false);
        }
        let patch = RuleSetPatch::from_json(&text)?;

        let merged = RuleSet::embedded().merge(&patch);
        let remote_url = self.remote_url();
        let last_updated = now_millis();
        let stored = StoredMetadata {
            last_updated,
            hash: pending_hash.clone(),
            remote_url: remote_url.clone(),
        };

        let meta_json = serde_json::to_string(&stored)?;
        let previous = self.storage.get(KEY_RULES_CACHE)?;
        self.storage.set(KEY_RULES_CACHE, &merged.to_json())?;
        if let Err(e) = self.storage.set(KEY_RULES_METADATA, &meta_json) {
            // a new cache next to old metadata would load under the wrong hash
            self.restore_cache(previous.as_deref());
            return Err(e.into());
        }

        self.current.store(Arc::new(RulesSnapshot {
            rules: CompiledRules::new(merged),
            metadata: RuleSetMetadata {
                source: RulesOrigin::Remote,
                hash: pending_hash,
                last_updated,
                remote_url,
            },
        }));

        if let Err(e) = self.storage.delete(KEY_PENDING_RULES) {
            warn!(error = %e, "failed to clear pending rules");
        }
        info!("remote parsing rules applied");
        Ok(true)
    }

    fn restore_cache(&self, previous: Option<&str>) {
        let restored = match previous {
            Some(text) => self.storage.set(KEY_RULES_CACHE, text),
            None => self.storage.delete(KEY_RULES_CACHE),
        };
        if let Err(e) = restored {
            warn!(error = %e, "failed to restore cached rules");
        }
    }

    pub fn dismiss_update(&self) -> Result<(), StorageError> {
        self.storage.delete(KEY_PENDING_RULES)?;
        info!("pending parsing rules dismissed");
        Ok(())
    }

    /// Drop cache, metadata and pending blobs and return to the embedded set
    pub fn reset_to_defaults(&self) -> Result<RuleSetMetadata, StorageError> {
        self.storage.delete(KEY_RULES_CACHE)?;
        self.storage.delete(KEY_RULES_METADATA)?;
        self.storage.delete(KEY_PENDING_RULES)?;

        let snapshot = Self::embedded_snapshot();
        let metadata = snapshot.metadata.clone();
        self.current.store(Arc::new(snapshot));
        info!("parsing rules reset to defaults");
        Ok(metadata)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    struct FakeSource {
        responses: Mutex<HashMap<String, Result<String, u16>>>,
    }

    impl FakeSource {
        fn new(entries: &[(&str, Result<&str, u16>)]) -> Self {
            Self {
                responses: Mutex::new(
                    entries
                        .iter()
                        .map(|(url, r)| (url.to_string(), r.map(str::to_string)))
                        .collect(),
                ),
            }
        }
    }

    impl RuleSource for FakeSource {
        fn fetch(&self, url: &str) -> Result<String, RulesError> {
            match self.responses.lock().unwrap().get(url) {
                Some(Ok(text)) => Ok(text.clone()),
                Some(Err(status)) => Err(RulesError::Status {
                    url: url.to_string(),
                    status: *status,
                }),
                None => Err(RulesError::Fetch {
                    url: url.to_string(),
                    message: "connection refused".to_string(),
                }),
            }
        }
    }

    const REMOTE: &str = r##"{"version": 2, "rules": {"#ShopName": {"domSelectors": [".Shop"]}}}"##;

    fn manager(entries: &[(&str, Result<&str, u16>)]) -> (RulesManager, Arc<MemoryStorage>) {
        let storage = Arc::new(MemoryStorage::new());
        let manager = RulesManager::load(storage.clone(), Arc::new(FakeSource::new(entries)));
        (manager, storage)
    }

    #[test]
    fn test_starts_with_embedded_rules() {
        let (manager, _) = manager(&[]);
        let meta = manager.metadata();
        assert_eq!(meta.source, RulesOrigin::Embedded);
        assert_eq!(meta.hash, RuleSet::embedded().content_hash());
        assert_eq!(manager.check_for_updates(None), UpdateCheck::no_update());
    }

    #[test]
    fn test_update_check_and_apply() {
        let (manager, storage) = manager(&[("https://rules.test/r.json", Ok(REMOTE))]);
        manager.set_remote_url("https://rules.test/r.json").unwrap();

        let check = manager.check_for_updates(None);
        assert!(check.has_update);
        assert_eq!(check.new_version, Some(2));
        let hash = check.hash.unwrap();
        assert_eq!(hash, content_hash(REMOTE));
        assert!(storage.get(KEY_PENDING_RULES).unwrap().is_some());

        assert!(!manager.apply_remote_rules("wrong"));
        assert_eq!(manager.metadata().source, RulesOrigin::Embedded);

        let before = manager.current();
        assert!(manager.apply_remote_rules(&hash));
        let after = manager.current();
        assert_eq!(after.metadata.source, RulesOrigin::Remote);
        assert_eq!(after.rules.rule_set().version, 2);
        assert_eq!(
            after.rules.rule("#ShopName").unwrap().dom_selectors,
            vec![".Shop"]
        );
        assert_eq!(before.metadata.source, RulesOrigin::Embedded);
        assert!(storage.get(KEY_PENDING_RULES).unwrap().is_none());

        // same blob again: nothing new
        assert!(!manager.check_for_updates(None).has_update);
        assert!(!manager.apply_remote_rules(&hash));
    }

    #[test]
    fn test_failures_collapse_to_no_update() {
        let (manager, storage) = manager(&[
            ("https://rules.test/404", Err(404)),
            ("https://rules.test/bad", Ok("{not json")),
        ]);
        assert_eq!(
            manager.check_for_updates(Some("https://rules.test/404")),
            UpdateCheck::no_update()
        );
        assert_eq!(
            manager.check_for_updates(Some("https://rules.test/bad")),
            UpdateCheck::no_update()
        );
        assert_eq!(
            manager.check_for_updates(Some("https://rules.test/offline")),
            UpdateCheck::no_update()
        );
        assert!(storage.get(KEY_PENDING_RULES).unwrap().is_none());
    }

    #[test]
    fn test_cached_rules_survive_reload_and_reset() {
        let storage = Arc::new(MemoryStorage::new());
        let source = Arc::new(FakeSource::new(&[("u", Ok(REMOTE))]));
        let manager = RulesManager::load(storage.clone(), source.clone());
        let hash = manager.check_for_updates(Some("u")).hash.unwrap();
        assert!(manager.apply_remote_rules(&hash));

        let reloaded = RulesManager::load(storage.clone(), source.clone());
        assert_eq!(reloaded.metadata().source, RulesOrigin::Cached);
        assert_eq!(reloaded.metadata().hash, hash);

        let meta = reloaded.reset_to_defaults().unwrap();
        assert_eq!(meta.source, RulesOrigin::Embedded);
        assert!(storage.get(KEY_RULES_CACHE).unwrap().is_none());
        assert_eq!(
            RulesManager::load(storage, source).metadata().source,
            RulesOrigin::Embedded
        );
    }

    /// Memory storage whose writes to one key fail
    struct FailingStorage {
        inner: MemoryStorage,
        failing_key: &'static str,
    }

    impl RuleStorage for FailingStorage {
        fn get(&self, key: &str) -> Result<Option<String>, StorageError> {
            self.inner.get(key)
        }

        fn set(&self, key: &str, value: &str) -> Result<(), StorageError> {
            if key == self.failing_key {
                return Err(StorageError::Io {
                    key: key.to_string(),
                    source: io::Error::new(io::ErrorKind::Other, "disk full"),
                });
            }
            self.inner.set(key, value)
        }

        fn delete(&self, key: &str) -> Result<(), StorageError> {
            self.inner.delete(key)
        }
    }

    #[test]
    fn test_failed_metadata_write_keeps_previous_cache() {
        let storage = Arc::new(FailingStorage {
            inner: MemoryStorage::new(),
            failing_key: KEY_RULES_METADATA,
        });
        let source = Arc::new(FakeSource::new(&[("u", Ok(REMOTE))]));
        let manager = RulesManager::load(storage.clone(), source.clone());
        let hash = manager.check_for_updates(Some("u")).hash.unwrap();

        assert!(!manager.apply_remote_rules(&hash));
        assert_eq!(storage.get(KEY_RULES_CACHE).unwrap(), None);
        assert_eq!(manager.metadata().source, RulesOrigin::Embedded);
        assert!(storage.get(KEY_PENDING_RULES).unwrap().is_some());

        // with a cache already in place the old blob is put back
        storage.inner.set(KEY_RULES_CACHE, "{\"version\": 1, \"rules\": {}}").unwrap();
        assert!(!manager.apply_remote_rules(&hash));
        assert_eq!(
            storage.get(KEY_RULES_CACHE).unwrap().as_deref(),
            Some("{\"version\": 1, \"rules\": {}}")
        );
        assert_eq!(
            RulesManager::load(storage, source).metadata().source,
            RulesOrigin::Embedded
        );
    }

    #[test]
    fn test_dismiss_update() {
        let (manager, storage) = manager(&[("u", Ok(REMOTE))]);
        let hash = manager.check_for_updates(Some("u")).hash.unwrap();
        manager.dismiss_update().unwrap();
        assert!(storage.get(KEY_PENDING_RULES).unwrap().is_none());
        assert!(!manager.apply_remote_rules(&hash));
    }

    #[test]
    fn test_file_storage() {
        let dir = tempfile::tempdir().unwrap();
        let storage = FileStorage::new(dir.path().join("rules")).unwrap();

        assert_eq!(storage.get("missing").unwrap(), None);
        storage.set(KEY_REMOTE_URL, "https://rules.test").unwrap();
        assert_eq!(
            storage.get(KEY_REMOTE_URL).unwrap().as_deref(),
            Some("https://rules.test")
        );
        storage.delete(KEY_REMOTE_URL).unwrap();
        storage.delete(KEY_REMOTE_URL).unwrap();
        assert_eq!(storage.get(KEY_REMOTE_URL).unwrap(), None);
    }
}
