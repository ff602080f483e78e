use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use dashmap::DashMap;

use crate::engine::Engine;
use crate::limits::*;
use crate::maintenance;

/// Per-studio engine registry. A studio is the database name a client
/// connected with; each one gets its own engine, WAL file, and background
/// compactor, created lazily on first use.
pub struct StudioManager {
    engines: DashMap<String, Arc<Engine>>,
    data_dir: PathBuf,
    compact_threshold: u64,
}

/// WAL file name for a studio. Anything path-like is stripped so a client
/// cannot escape the data directory through its database name.
fn wal_file_name(studio: &str) -> io::Result<String> {
    let safe: String = studio
        .chars()
        .filter(|c| c.is_alphanumeric() || *c == '_' || *c == '-')
        .collect();
    if safe.is_empty() {
        return Err(io::Error::new(io::ErrorKind::InvalidInput, "empty studio name"));
    }
    Ok(format!("{safe}.wal"))
}

impl StudioManager {
    pub fn new(data_dir: PathBuf, compact_threshold: u64) -> Self {
        Self {
            engines: DashMap::new(),
            data_dir,
            compact_threshold,
        }
    }

    /// Engine for `studio`, creating it on first reference.
    pub fn get_or_create(&self, studio: &str) -> io::Result<Arc<Engine>> {
        if let Some(engine) = self.engines.get(studio) {
            return Ok(engine.value().clone());
        }
        if studio.len() > MAX_STUDIO_NAME_LEN {
            return Err(io::Error::new(io::ErrorKind::InvalidInput, "studio name too long"));
        }
        if self.engines.len() >= MAX_STUDIOS {
            return Err(io::Error::other("too many studios"));
        }

        let wal_path = self.data_dir.join(wal_file_name(studio)?);
        let engine = Arc::new(Engine::new(wal_path)?);

        let compactor_engine = engine.clone();
        let threshold = self.compact_threshold;
        tokio::spawn(async move {
            maintenance::run_compactor(compactor_engine, threshold).await;
        });

        self.engines.insert(studio.to_string(), engine.clone());
        metrics::gauge!(crate::observability::STUDIOS_ACTIVE).set(self.engines.len() as f64);
        Ok(engine)
    }
}
