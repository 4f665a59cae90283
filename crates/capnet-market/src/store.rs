//! JSON snapshot persistence for the provider registry.
//!
//! The snapshot is rewritten after every write. Losing it is tolerable:
//! providers re-join after a broker restart and the registry is rebuilt.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::MarketError;
use crate::record::{ProviderId, ProviderRecord};
use crate::registry::{InMemoryRegistry, ProviderRegistry};

#[derive(Debug, Default, Serialize, Deserialize)]
struct Snapshot {
    providers: Vec<ProviderRecord>,
}

/// In-memory registry mirrored to a JSON file.
#[derive(Debug)]
pub struct JsonFileRegistry {
    inner: InMemoryRegistry,
    path: PathBuf,
    // Serializes write+persist so the file never lags behind a later write.
    write_lock: Mutex<()>,
}

impl JsonFileRegistry {
    /// Opens the snapshot at `path`, starting empty if it is missing or unreadable.
    pub fn open(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let records = load_snapshot(&path);
        debug!(path = %path.display(), count = records.len(), "loaded provider registry");
        Self {
            inner: InMemoryRegistry::with_records(records),
            path,
            write_lock: Mutex::new(()),
        }
    }

    /// Location of the snapshot file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn persist(&self) {
        if let Err(e) = self.try_persist() {
            warn!(path = %self.path.display(), error = %e, "failed to snapshot provider registry");
        }
    }

    fn try_persist(&self) -> Result<(), MarketError> {
        let snapshot = Snapshot {
            providers: self.inner.snapshot()?,
        };
        let json = serde_json::to_string_pretty(&snapshot)
            .map_err(|e| MarketError::Storage(e.to_string()))?;

        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).map_err(|e| MarketError::Storage(e.to_string()))?;
            }
        }

        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, json).map_err(|e| MarketError::Storage(e.to_string()))?;
        fs::rename(&tmp, &self.path).map_err(|e| MarketError::Storage(e.to_string()))?;
        Ok(())
    }
}

fn load_snapshot(path: &Path) -> Vec<ProviderRecord> {
    let content = match fs::read_to_string(path) {
        Ok(content) => content,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Vec::new(),
        Err(e) => {
            warn!(path = %path.display(), error = %e, "cannot read provider registry, starting empty");
            return Vec::new();
        }
    };

    match serde_json::from_str::<Snapshot>(&content) {
        Ok(snapshot) => snapshot.providers,
        Err(e) => {
            warn!(path = %path.display(), error = %e, "corrupt provider registry, starting empty");
            Vec::new()
        }
    }
}

impl ProviderRegistry for JsonFileRegistry {
    fn upsert(&self, record: ProviderRecord) -> Result<(), MarketError> {
        let _guard = self.write_lock.lock();
        self.inner.upsert(record)?;
        self.persist();
        Ok(())
    }

    fn get(&self, id: &ProviderId) -> Result<Option<ProviderRecord>, MarketError> {
        self.inner.get(id)
    }

    fn query_eligible(
        &self,
        required_units: u64,
        needed_by: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<Vec<ProviderRecord>, MarketError> {
        self.inner.query_eligible(required_units, needed_by, now)
    }

    fn modify(
        &self,
        id: &ProviderId,
        f: &mut dyn FnMut(&mut ProviderRecord) -> Result<(), MarketError>,
    ) -> Result<ProviderRecord, MarketError> {
        let _guard = self.write_lock.lock();
        let updated = self.inner.modify(id, f)?;
        self.persist();
        Ok(updated)
    }

    fn snapshot(&self) -> Result<Vec<ProviderRecord>, MarketError> {
        self.inner.snapshot()
    }
}
