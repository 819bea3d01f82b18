// src/cache.rs

use log::{debug, info};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::fs;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use crate::empca::{EmpcaConfig, EmpcaSolver};
use crate::error::EmpcaError;
use crate::model::EmpcaModel;
use crate::weighted_matrix::{ResidualProvider, WeightedMatrix};

const KEY_DOMAIN: &[u8] = b"spectral_empca/model/v1";
const MODEL_EXTENSION: &str = "empca";

/// Content address of one fit: blake3 over the matrix and configuration.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CacheKey(String);

impl CacheKey {
    /// Hashes the shape, the values and weights (little-endian), and the
    /// bincode-encoded configuration.
    pub fn new(matrix: &WeightedMatrix, config: &EmpcaConfig) -> Result<Self, EmpcaError> {
        let mut hasher = blake3::Hasher::new();
        hasher.update(KEY_DOMAIN);
        let (n_rows, n_dims) = matrix.dim();
        hasher.update(&(n_rows as u64).to_le_bytes());
        hasher.update(&(n_dims as u64).to_le_bytes());
        for &v in matrix.values().iter() {
            hasher.update(&v.to_le_bytes());
        }
        for &w in matrix.weights().iter() {
            hasher.update(&w.to_le_bytes());
        }
        let config_bytes = bincode::serde::encode_to_vec(config, bincode::config::standard())?;
        hasher.update(&config_bytes);
        Ok(CacheKey(hasher.finalize().to_hex().to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Where fitted models are kept between runs.
pub trait ModelStore: Send + Sync {
    fn load(&self, key: &CacheKey) -> Result<Option<EmpcaModel>, EmpcaError>;
    fn store(&self, key: &CacheKey, model: &EmpcaModel) -> Result<(), EmpcaError>;
}

#[derive(Debug, Default)]
pub struct MemoryStore {
    models: RwLock<HashMap<CacheKey, EmpcaModel>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.models.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.models.read().is_empty()
    }
}

impl ModelStore for MemoryStore {
    fn load(&self, key: &CacheKey) -> Result<Option<EmpcaModel>, EmpcaError> {
        Ok(self.models.read().get(key).cloned())
    }

    fn store(&self, key: &CacheKey, model: &EmpcaModel) -> Result<(), EmpcaError> {
        self.models.write().insert(key.clone(), model.clone());
        Ok(())
    }
}

/// One bincode file per key in a directory. Writes go through a temporary
/// file in the same directory and are renamed into place.
#[derive(Debug, Clone)]
pub struct FileStore {
    directory: PathBuf,
}

impl FileStore {
    pub fn new<P: AsRef<Path>>(directory: P) -> Result<Self, EmpcaError> {
        fs::create_dir_all(directory.as_ref())?;
        Ok(Self { directory: directory.as_ref().to_path_buf() })
    }

    pub fn directory(&self) -> &Path {
        &self.directory
    }

    pub fn path_for(&self, key: &CacheKey) -> PathBuf {
        self.directory.join(format!("{}.{}", key, MODEL_EXTENSION))
    }
}

impl ModelStore for FileStore {
    fn load(&self, key: &CacheKey) -> Result<Option<EmpcaModel>, EmpcaError> {
        let path = self.path_for(key);
        if !path.is_file() {
            return Ok(None);
        }
        EmpcaModel::load_model(&path).map(Some)
    }

    fn store(&self, key: &CacheKey, model: &EmpcaModel) -> Result<(), EmpcaError> {
        let temp = tempfile::NamedTempFile::new_in(&self.directory)?;
        {
            let mut writer = BufWriter::new(temp.as_file());
            model.write_to(&mut writer)?;
            writer.flush()?;
        }
        temp.persist(self.path_for(key)).map_err(|e| EmpcaError::Io(e.error))?;
        debug!("Wrote EMPCA model {} to {:?}", key, self.directory);
        Ok(())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CacheStatus {
    Hit,
    Computed,
}

#[derive(Clone, Debug)]
pub struct CachedFit {
    pub key: CacheKey,
    pub status: CacheStatus,
    pub model: EmpcaModel,
}

/// Memoizes EMPCA fits in a [`ModelStore`]. Each key is computed at most once:
/// concurrent callers with the same key wait for the first one and then read
/// its result.
pub struct ModelCache<S: ModelStore> {
    store: S,
    key_locks: Mutex<HashMap<CacheKey, Arc<Mutex<()>>>>,
}

impl<S: ModelStore> ModelCache<S> {
    pub fn new(store: S) -> Self {
        Self { store, key_locks: Mutex::new(HashMap::new()) }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    fn lock_for(&self, key: &CacheKey) -> Arc<Mutex<()>> {
        let mut locks = self.key_locks.lock();
        Arc::clone(locks.entry(key.clone()).or_insert_with(|| Arc::new(Mutex::new(()))))
    }

    /// Drops the lock entry of `key` once no other caller holds or waits on it.
    fn release_lock(&self, key: &CacheKey, key_lock: Arc<Mutex<()>>) {
        let mut locks = self.key_locks.lock();
        // One reference lives in the map, one is `key_lock`.
        let unused = locks
            .get(key)
            .map_or(false, |current| Arc::ptr_eq(current, &key_lock) && Arc::strong_count(&key_lock) == 2);
        if unused {
            locks.remove(key);
        }
    }

    pub fn fit_cached(&self, matrix: WeightedMatrix, config: &EmpcaConfig) -> Result<CachedFit, EmpcaError> {
        let key = CacheKey::new(&matrix, config)?;
        let key_lock = self.lock_for(&key);
        let outcome = {
            let _guard = key_lock.lock();
            self.load_or_fit(&key, matrix, config)
        };
        self.release_lock(&key, key_lock);
        let (status, model) = outcome?;
        Ok(CachedFit { key, status, model })
    }

    fn load_or_fit(
        &self,
        key: &CacheKey,
        matrix: WeightedMatrix,
        config: &EmpcaConfig,
    ) -> Result<(CacheStatus, EmpcaModel), EmpcaError> {
        if let Some(model) = self.store.load(key)? {
            info!("EMPCA cache hit for {}", key);
            return Ok((CacheStatus::Hit, model));
        }
        let start_time = Instant::now();
        let model = EmpcaSolver::new(config.clone()).fit(matrix)?;
        self.store.store(key, &model)?;
        info!("EMPCA cache miss for {}; fitted and stored in {:?}", key, start_time.elapsed());
        Ok((CacheStatus::Computed, model))
    }

    pub fn fit_provider<P: ResidualProvider + ?Sized>(
        &self,
        provider: &P,
        config: &EmpcaConfig,
    ) -> Result<CachedFit, EmpcaError> {
        let matrix = provider.residuals()?;
        info!("Fitting residuals of `{}` ({} x {})", provider.label(), matrix.nrows(), matrix.ncols());
        self.fit_cached(matrix, config)
    }
}
