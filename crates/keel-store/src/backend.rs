//! Persistence backends for generations and the actual state.

use async_trait::async_trait;
use keel_core::config::StoreConfig;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::debug;

use crate::codec::{codec_for, ActualStateDocument, Codec, GenerationDocument};
use crate::error::StoreError;

/// Trait for generation persistence backends.
#[async_trait]
pub trait GenerationBackend: Send + Sync {
    /// Load every stored generation, in generation order.
    async fn load_all(&self) -> Result<Vec<GenerationDocument>, StoreError>;

    /// Persist one generation. Must fail rather than overwrite an existing generation.
    async fn save(&self, doc: &GenerationDocument) -> Result<(), StoreError>;

    /// Load the last saved actual state, if one was ever saved.
    async fn load_actual(&self) -> Result<Option<ActualStateDocument>, StoreError>;

    /// Replace the saved actual state.
    async fn save_actual(&self, doc: &ActualStateDocument) -> Result<(), StoreError>;
}

/// Create a backend based on configuration: file-backed when a directory is set.
pub fn create_backend(config: &StoreConfig) -> Result<Arc<dyn GenerationBackend>, StoreError> {
    match &config.directory {
        Some(dir) => Ok(Arc::new(FileBackend::new(dir, codec_for(config.codec))?)),
        None => Ok(Arc::new(MemoryBackend)),
    }
}

/// Keeps nothing; generations live only in the store's memory.
#[derive(Debug, Clone, Copy, Default)]
pub struct MemoryBackend;

#[async_trait]
impl GenerationBackend for MemoryBackend {
    async fn load_all(&self) -> Result<Vec<GenerationDocument>, StoreError> {
        Ok(Vec::new())
    }

    async fn save(&self, _doc: &GenerationDocument) -> Result<(), StoreError> {
        Ok(())
    }

    async fn load_actual(&self) -> Result<Option<ActualStateDocument>, StoreError> {
        Ok(None)
    }

    async fn save_actual(&self, _doc: &ActualStateDocument) -> Result<(), StoreError> {
        Ok(())
    }
}

/// One file per generation, `<dir>/gen-<number>.<ext>`, plus `<dir>/actual.<ext>` for the
/// deployed state.
pub struct FileBackend {
    dir: PathBuf,
    codec: Box<dyn Codec>,
}

impl FileBackend {
    /// Create the backend, creating the directory if needed.
    pub fn new(dir: impl AsRef<Path>, codec: Box<dyn Codec>) -> Result<Self, StoreError> {
        let dir = dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&dir)
            .map_err(|e| StoreError::io(format!("creating '{}'", dir.display()), e))?;
        Ok(Self { dir, codec })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, doc: &GenerationDocument) -> PathBuf {
        self.dir.join(format!(
            "gen-{:010}.{}",
            doc.data.generation.value(),
            self.codec.extension()
        ))
    }

    fn actual_path(&self) -> PathBuf {
        self.dir.join(format!("actual.{}", self.codec.extension()))
    }
}

/// Write then rename so a crash never leaves a truncated file behind.
fn write_atomically(path: &Path, bytes: Vec<u8>) -> Result<(), StoreError> {
    let tmp = path.with_extension("tmp");
    std::fs::write(&tmp, bytes)
        .map_err(|e| StoreError::io(format!("writing '{}'", tmp.display()), e))?;
    std::fs::rename(&tmp, path)
        .map_err(|e| StoreError::io(format!("renaming to '{}'", path.display()), e))
}

#[async_trait]
impl GenerationBackend for FileBackend {
    async fn load_all(&self) -> Result<Vec<GenerationDocument>, StoreError> {
        let entries = std::fs::read_dir(&self.dir)
            .map_err(|e| StoreError::io(format!("listing '{}'", self.dir.display()), e))?;

        let suffix = format!(".{}", self.codec.extension());
        let mut paths = Vec::new();
        for entry in entries {
            let entry =
                entry.map_err(|e| StoreError::io(format!("listing '{}'", self.dir.display()), e))?;
            let name = entry.file_name().to_string_lossy().into_owned();
            if name.starts_with("gen-") && name.ends_with(&suffix) {
                paths.push(entry.path());
            }
        }
        paths.sort();

        let mut docs = Vec::with_capacity(paths.len());
        for path in paths {
            let bytes = std::fs::read(&path)
                .map_err(|e| StoreError::io(format!("reading '{}'", path.display()), e))?;
            docs.push(self.codec.decode(&bytes, &path.display().to_string())?);
        }
        docs.sort_by_key(|d| d.data.generation);

        debug!(dir = %self.dir.display(), generations = docs.len(), "Loaded generations");
        Ok(docs)
    }

    async fn save(&self, doc: &GenerationDocument) -> Result<(), StoreError> {
        let path = self.path_for(doc);
        if path.exists() {
            return Err(StoreError::DuplicateGeneration(doc.data.generation));
        }
        write_atomically(&path, self.codec.encode(doc)?)?;

        debug!(path = %path.display(), generation = %doc.data.generation, "Saved generation");
        Ok(())
    }

    async fn load_actual(&self) -> Result<Option<ActualStateDocument>, StoreError> {
        let path = self.actual_path();
        let bytes = match std::fs::read(&path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(StoreError::io(format!("reading '{}'", path.display()), e)),
        };
        let doc = self
            .codec
            .decode_actual(&bytes, &path.display().to_string())?;
        debug!(path = %path.display(), instances = doc.instances.len(), "Loaded actual state");
        Ok(Some(doc))
    }

    async fn save_actual(&self, doc: &ActualStateDocument) -> Result<(), StoreError> {
        let path = self.actual_path();
        write_atomically(&path, self.codec.encode_actual(doc)?)?;
        debug!(path = %path.display(), instances = doc.instances.len(), "Saved actual state");
        Ok(())
    }
}
