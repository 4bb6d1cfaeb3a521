//! Preferences repository with explicit transactional scopes.
//!
//! Persisted settings live in one namespaced key-value store. The only way
//! to touch them is through a [`ReadScope`] or a [`WriteScope`]; a thread
//! that already holds a scope on a namespace cannot open a second one
//! ([`PrefsError::NestedScope`]). Write scopes stage their changes and apply
//! them in one backend call on [`WriteScope::commit`].
//!
//! Backends:
//! - [`MemoryBackend`] for tests and diskless runs
//! - [`JsonFileBackend`] for the host build
//! - NVS for ESP32 (in `beecounter-esp32`)

use std::cell::RefCell;
use std::collections::{BTreeMap, HashSet};
use std::marker::PhantomData;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

use thiserror::Error;
use tracing::{debug, info};

/// Default namespace for device settings.
pub const NAMESPACE: &str = "beecounter";

/// Preference keys.
pub mod keys {
    pub const DEVICE_NAME: &str = "deviceName";
    pub const ADMIN_PASS: &str = "adminPass";
    pub const IS_DEFAULT_PASS: &str = "isDefaultPass";
    pub const LOGIN_FAILS: &str = "loginFails";
    pub const LAST_FAIL_TIME: &str = "lastFailTime";
    pub const TIMEZONE: &str = "timezone";
    pub const CAM_RESOLUTION: &str = "cam_res";
    pub const CAM_QUALITY: &str = "cam_qlty";
    pub const EI_API_KEY: &str = "eiApiKey";
    pub const WIFI_SSID: &str = "ssid";
    pub const WIFI_PASSWORD: &str = "password";
}

pub const DEFAULT_DEVICE_NAME: &str = "BeeCounter";
pub const DEFAULT_TIMEZONE: &str = "EST5EDT,M3.2.0,M11.1.0";

#[derive(Debug, Error)]
pub enum PrefsError {
    #[error("Preferences scope already open on namespace '{0}'")]
    NestedScope(String),

    #[error("Invalid value for {key}: {value}")]
    InvalidValue { key: String, value: String },

    #[error("Preferences storage error: {0}")]
    Backend(String),

    #[error("Preferences I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Preferences file is corrupt: {0}")]
    Corrupt(#[from] serde_json::Error),
}

/// One staged change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Change {
    Set(String, String),
    Remove(String),
}

/// Raw string storage behind [`Preferences`].
pub trait KvBackend: Send + Sync {
    fn get(&self, namespace: &str, key: &str) -> Result<Option<String>, PrefsError>;

    /// Apply a batch of changes. `clear` wipes the namespace first.
    fn apply(&self, namespace: &str, clear: bool, changes: &[Change]) -> Result<(), PrefsError>;
}

type Namespaces = BTreeMap<String, BTreeMap<String, String>>;

fn apply_to(map: &mut Namespaces, namespace: &str, clear: bool, changes: &[Change]) {
    let entries = map.entry(namespace.to_string()).or_default();
    if clear {
        entries.clear();
    }
    for change in changes {
        match change {
            Change::Set(key, value) => {
                entries.insert(key.clone(), value.clone());
            }
            Change::Remove(key) => {
                entries.remove(key);
            }
        }
    }
}

#[derive(Default)]
pub struct MemoryBackend {
    data: Mutex<Namespaces>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

impl KvBackend for MemoryBackend {
    fn get(&self, namespace: &str, key: &str) -> Result<Option<String>, PrefsError> {
        let data = self
            .data
            .lock()
            .map_err(|_| PrefsError::Backend("lock poisoned".to_string()))?;
        Ok(data.get(namespace).and_then(|ns| ns.get(key)).cloned())
    }

    fn apply(&self, namespace: &str, clear: bool, changes: &[Change]) -> Result<(), PrefsError> {
        let mut data = self
            .data
            .lock()
            .map_err(|_| PrefsError::Backend("lock poisoned".to_string()))?;
        apply_to(&mut data, namespace, clear, changes);
        Ok(())
    }
}

/// JSON file backend: the whole store is one pretty-printed file, replaced
/// atomically (write to a sibling temp file, then rename) on every commit.
pub struct JsonFileBackend {
    path: PathBuf,
    data: Mutex<Namespaces>,
}

impl JsonFileBackend {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, PrefsError> {
        let path = path.as_ref().to_path_buf();
        let data = if path.exists() {
            let content = std::fs::read_to_string(&path)?;
            serde_json::from_str(&content)?
        } else {
            Namespaces::new()
        };
        info!(path = %path.display(), "preferences opened");
        Ok(Self {
            path,
            data: Mutex::new(data),
        })
    }

    fn persist(&self, data: &Namespaces) -> Result<(), PrefsError> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, serde_json::to_string_pretty(data)?)?;
        std::fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

impl KvBackend for JsonFileBackend {
    fn get(&self, namespace: &str, key: &str) -> Result<Option<String>, PrefsError> {
        let data = self
            .data
            .lock()
            .map_err(|_| PrefsError::Backend("lock poisoned".to_string()))?;
        Ok(data.get(namespace).and_then(|ns| ns.get(key)).cloned())
    }

    fn apply(&self, namespace: &str, clear: bool, changes: &[Change]) -> Result<(), PrefsError> {
        let mut data = self
            .data
            .lock()
            .map_err(|_| PrefsError::Backend("lock poisoned".to_string()))?;
        let mut next = data.clone();
        apply_to(&mut next, namespace, clear, changes);
        self.persist(&next)?;
        *data = next;
        Ok(())
    }
}

thread_local! {
    static OPEN_SCOPES: RefCell<HashSet<String>> = RefCell::new(HashSet::new());
}

/// Marks a namespace as open on the current thread for the marker's lifetime.
struct ScopeMarker {
    namespace: String,
    // Scopes are tied to the thread that opened them.
    _not_send: PhantomData<*const ()>,
}

impl ScopeMarker {
    fn enter(namespace: &str) -> Result<Self, PrefsError> {
        let inserted = OPEN_SCOPES.with(|open| open.borrow_mut().insert(namespace.to_string()));
        if !inserted {
            return Err(PrefsError::NestedScope(namespace.to_string()));
        }
        Ok(Self {
            namespace: namespace.to_string(),
            _not_send: PhantomData,
        })
    }
}

impl Drop for ScopeMarker {
    fn drop(&mut self) {
        OPEN_SCOPES.with(|open| {
            open.borrow_mut().remove(&self.namespace);
        });
    }
}

/// Typed reads shared by both scope kinds.
pub trait PrefsRead {
    fn get_raw(&self, key: &str) -> Result<Option<String>, PrefsError>;

    fn get_string(&self, key: &str) -> Result<Option<String>, PrefsError> {
        self.get_raw(key)
    }

    fn get_string_or(&self, key: &str, default: &str) -> Result<String, PrefsError> {
        Ok(self.get_raw(key)?.unwrap_or_else(|| default.to_string()))
    }

    fn get_bool_or(&self, key: &str, default: bool) -> Result<bool, PrefsError> {
        match self.get_raw(key)? {
            None => Ok(default),
            Some(v) => match v.as_str() {
                "true" | "1" => Ok(true),
                "false" | "0" => Ok(false),
                _ => Err(PrefsError::InvalidValue {
                    key: key.to_string(),
                    value: v,
                }),
            },
        }
    }

    fn get_u64_or(&self, key: &str, default: u64) -> Result<u64, PrefsError> {
        match self.get_raw(key)? {
            None => Ok(default),
            Some(v) => v.parse().map_err(|_| PrefsError::InvalidValue {
                key: key.to_string(),
                value: v,
            }),
        }
    }

    fn contains(&self, key: &str) -> Result<bool, PrefsError> {
        Ok(self.get_raw(key)?.is_some())
    }
}

/// Handle to one namespace of a [`KvBackend`].
#[derive(Clone)]
pub struct Preferences {
    backend: Arc<dyn KvBackend>,
    namespace: String,
    write_lock: Arc<Mutex<()>>,
}

impl Preferences {
    pub fn new(backend: Arc<dyn KvBackend>) -> Self {
        Self::with_namespace(backend, NAMESPACE)
    }

    pub fn with_namespace(backend: Arc<dyn KvBackend>, namespace: &str) -> Self {
        Self {
            backend,
            namespace: namespace.to_string(),
            write_lock: Arc::new(Mutex::new(())),
        }
    }

    /// In-memory preferences, mostly for tests.
    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemoryBackend::new()))
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn read(&self) -> Result<ReadScope<'_>, PrefsError> {
        let marker = ScopeMarker::enter(&self.namespace)?;
        Ok(ReadScope {
            prefs: self,
            _marker: marker,
        })
    }

    /// Open a write scope. Write scopes from different threads are
    /// serialized; each commit is applied as one batch.
    pub fn write(&self) -> Result<WriteScope<'_>, PrefsError> {
        let marker = ScopeMarker::enter(&self.namespace)?;
        let guard = self
            .write_lock
            .lock()
            .map_err(|_| PrefsError::Backend("write lock poisoned".to_string()))?;
        Ok(WriteScope {
            prefs: self,
            staged: BTreeMap::new(),
            clear: false,
            _guard: guard,
            _marker: marker,
        })
    }

    /// Seed first-boot defaults for keys that are missing.
    pub fn ensure_defaults(&self, device_name: &str) -> Result<(), PrefsError> {
        let mut scope = self.write()?;
        let mut seeded = 0;
        if !scope.contains(keys::DEVICE_NAME)? {
            scope.set_string(keys::DEVICE_NAME, device_name);
            seeded += 1;
        }
        if !scope.contains(keys::IS_DEFAULT_PASS)? {
            scope.set_bool(keys::IS_DEFAULT_PASS, true);
            scope.set_string(keys::ADMIN_PASS, "");
            seeded += 1;
        }
        if !scope.contains(keys::TIMEZONE)? {
            scope.set_string(keys::TIMEZONE, DEFAULT_TIMEZONE);
            seeded += 1;
        }
        if seeded > 0 {
            info!(namespace = %self.namespace, seeded, "seeding first-boot preferences");
        }
        scope.commit()
    }
}

pub struct ReadScope<'a> {
    prefs: &'a Preferences,
    _marker: ScopeMarker,
}

impl PrefsRead for ReadScope<'_> {
    fn get_raw(&self, key: &str) -> Result<Option<String>, PrefsError> {
        self.prefs.backend.get(&self.prefs.namespace, key)
    }
}

pub struct WriteScope<'a> {
    prefs: &'a Preferences,
    staged: BTreeMap<String, Option<String>>,
    clear: bool,
    _guard: MutexGuard<'a, ()>,
    _marker: ScopeMarker,
}

impl WriteScope<'_> {
    pub fn set_string(&mut self, key: &str, value: &str) {
        self.staged.insert(key.to_string(), Some(value.to_string()));
    }

    pub fn set_bool(&mut self, key: &str, value: bool) {
        self.set_string(key, if value { "true" } else { "false" });
    }

    pub fn set_u64(&mut self, key: &str, value: u64) {
        self.set_string(key, &value.to_string());
    }

    pub fn remove(&mut self, key: &str) {
        self.staged.insert(key.to_string(), None);
    }

    /// Wipe every key in the namespace on commit (factory reset).
    pub fn clear(&mut self) {
        self.clear = true;
        self.staged.clear();
    }

    /// Apply staged changes in one batch.
    pub fn commit(mut self) -> Result<(), PrefsError> {
        if self.staged.is_empty() && !self.clear {
            return Ok(());
        }
        let changes: Vec<Change> = std::mem::take(&mut self.staged)
            .into_iter()
            .map(|(key, value)| match value {
                Some(value) => Change::Set(key, value),
                None => Change::Remove(key),
            })
            .collect();
        debug!(
            namespace = %self.prefs.namespace,
            changes = changes.len(),
            clear = self.clear,
            "committing preferences"
        );
        self.prefs
            .backend
            .apply(&self.prefs.namespace, self.clear, &changes)
    }
}

impl PrefsRead for WriteScope<'_> {
    fn get_raw(&self, key: &str) -> Result<Option<String>, PrefsError> {
        if let Some(staged) = self.staged.get(key) {
            return Ok(staged.clone());
        }
        if self.clear {
            return Ok(None);
        }
        self.prefs.backend.get(&self.prefs.namespace, key)
    }
}

impl Drop for WriteScope<'_> {
    fn drop(&mut self) {
        if !self.staged.is_empty() {
            debug!(
                namespace = %self.prefs.namespace,
                discarded = self.staged.len(),
                "write scope dropped without commit"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_nested_scope_rejected() {
        let prefs = Preferences::in_memory();
        let outer = prefs.read().unwrap();
        assert!(matches!(prefs.read(), Err(PrefsError::NestedScope(_))));
        assert!(matches!(prefs.write(), Err(PrefsError::NestedScope(_))));
        drop(outer);
        assert!(prefs.write().is_ok());
    }

    #[test]
    fn test_other_namespace_not_nested() {
        let backend: Arc<dyn KvBackend> = Arc::new(MemoryBackend::new());
        let a = Preferences::with_namespace(backend.clone(), "a");
        let b = Preferences::with_namespace(backend, "b");
        let _ra = a.read().unwrap();
        assert!(b.read().is_ok());
    }

    #[test]
    fn test_uncommitted_changes_discarded() {
        let prefs = Preferences::in_memory();
        {
            let mut scope = prefs.write().unwrap();
            scope.set_string(keys::DEVICE_NAME, "Hive 7");
            assert_eq!(scope.get_string(keys::DEVICE_NAME).unwrap().as_deref(), Some("Hive 7"));
        }
        let scope = prefs.read().unwrap();
        assert_eq!(scope.get_string(keys::DEVICE_NAME).unwrap(), None);
    }

    #[test]
    fn test_commit_and_typed_reads() {
        let prefs = Preferences::in_memory();
        let mut scope = prefs.write().unwrap();
        scope.set_bool(keys::IS_DEFAULT_PASS, false);
        scope.set_u64(keys::LOGIN_FAILS, 3);
        scope.commit().unwrap();

        let scope = prefs.read().unwrap();
        assert!(!scope.get_bool_or(keys::IS_DEFAULT_PASS, true).unwrap());
        assert_eq!(scope.get_u64_or(keys::LOGIN_FAILS, 0).unwrap(), 3);
        assert_eq!(scope.get_u64_or(keys::LAST_FAIL_TIME, 9).unwrap(), 9);
    }

    #[test]
    fn test_invalid_value_reported() {
        let prefs = Preferences::in_memory();
        let mut scope = prefs.write().unwrap();
        scope.set_string(keys::LOGIN_FAILS, "many");
        assert!(matches!(
            scope.get_u64_or(keys::LOGIN_FAILS, 0),
            Err(PrefsError::InvalidValue { .. })
        ));
    }

    #[test]
    fn test_defaults_seeded_once() {
        let prefs = Preferences::in_memory();
        prefs.ensure_defaults(DEFAULT_DEVICE_NAME).unwrap();
        {
            let mut scope = prefs.write().unwrap();
            scope.set_string(keys::DEVICE_NAME, "Hive 7");
            scope.commit().unwrap();
        }
        prefs.ensure_defaults(DEFAULT_DEVICE_NAME).unwrap();

        let scope = prefs.read().unwrap();
        assert_eq!(scope.get_string_or(keys::DEVICE_NAME, "").unwrap(), "Hive 7");
        assert!(scope.get_bool_or(keys::IS_DEFAULT_PASS, false).unwrap());
        assert_eq!(
            scope.get_string_or(keys::TIMEZONE, "").unwrap(),
            DEFAULT_TIMEZONE
        );
    }

    #[test]
    fn test_clear_wipes_namespace() {
        let prefs = Preferences::in_memory();
        prefs.ensure_defaults(DEFAULT_DEVICE_NAME).unwrap();
        let mut scope = prefs.write().unwrap();
        scope.clear();
        assert_eq!(scope.get_raw(keys::TIMEZONE).unwrap(), None);
        scope.commit().unwrap();
        assert!(!prefs.read().unwrap().contains(keys::DEVICE_NAME).unwrap());
    }

    #[test]
    fn test_json_file_backend_persists() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("prefs.json");
        {
            let prefs = Preferences::new(Arc::new(JsonFileBackend::open(&path).unwrap()));
            let mut scope = prefs.write().unwrap();
            scope.set_string(keys::EI_API_KEY, "ei_123");
            scope.commit().unwrap();
        }
        let prefs = Preferences::new(Arc::new(JsonFileBackend::open(&path).unwrap()));
        let scope = prefs.read().unwrap();
        assert_eq!(scope.get_string(keys::EI_API_KEY).unwrap().as_deref(), Some("ei_123"));
    }
}
