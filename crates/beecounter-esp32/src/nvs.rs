//! Preferences in NVS flash.
//!
//! One `EspNvs` handle per namespace, opened on first use. A batch from
//! [`KvBackend::apply`] is written key by key and committed once.

use std::collections::HashMap;
use std::sync::Mutex;

use beecounter_core::prefs::{Change, KvBackend, PrefsError};
use esp_idf_svc::nvs::{EspDefaultNvsPartition, EspNvs, NvsDefault};
use esp_idf_svc::sys::{esp, nvs_commit, nvs_erase_all, EspError};

/// Longest value we read back; the longest stored value is a password hash.
const MAX_VALUE_LEN: usize = 256;

fn backend_error(err: EspError) -> PrefsError {
    PrefsError::Backend(err.to_string())
}

pub struct NvsBackend {
    partition: EspDefaultNvsPartition,
    handles: Mutex<HashMap<String, EspNvs<NvsDefault>>>,
}

impl NvsBackend {
    pub fn new(partition: EspDefaultNvsPartition) -> Self {
        Self {
            partition,
            handles: Mutex::new(HashMap::new()),
        }
    }

    fn with_handle<T>(
        &self,
        namespace: &str,
        f: impl FnOnce(&mut EspNvs<NvsDefault>) -> Result<T, PrefsError>,
    ) -> Result<T, PrefsError> {
        let mut handles = self
            .handles
            .lock()
            .map_err(|_| PrefsError::Backend("NVS handle table poisoned".into()))?;
        if !handles.contains_key(namespace) {
            let nvs = EspNvs::new(self.partition.clone(), namespace, true).map_err(backend_error)?;
            handles.insert(namespace.to_string(), nvs);
        }
        match handles.get_mut(namespace) {
            Some(nvs) => f(nvs),
            None => Err(PrefsError::Backend(format!("namespace {namespace} unavailable"))),
        }
    }
}

impl KvBackend for NvsBackend {
    fn get(&self, namespace: &str, key: &str) -> Result<Option<String>, PrefsError> {
        self.with_handle(namespace, |nvs| {
            let mut buf = [0u8; MAX_VALUE_LEN];
            let value = nvs.get_str(key, &mut buf).map_err(backend_error)?;
            Ok(value.map(str::to_string))
        })
    }

    fn apply(&self, namespace: &str, clear: bool, changes: &[Change]) -> Result<(), PrefsError> {
        self.with_handle(namespace, |nvs| {
            if clear {
                // SAFETY: the handle is open for writing and owned by `nvs`.
                esp!(unsafe { nvs_erase_all(nvs.handle()) }).map_err(backend_error)?;
            }
            for change in changes {
                match change {
                    Change::Set(key, value) => nvs.set_str(key, value).map_err(backend_error)?,
                    Change::Remove(key) => {
                        nvs.remove(key).map_err(backend_error)?;
                    }
                }
            }
            esp!(unsafe { nvs_commit(nvs.handle()) }).map_err(backend_error)?;
            log::debug!("NVS commit: {} changes to '{}'", changes.len(), namespace);
            Ok(())
        })
    }
}
