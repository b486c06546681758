use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::Deserialize;
use sha2::{Digest, Sha256};
use tokio::sync::RwLock;
use tracing::{debug, error, info, warn};

use crate::error::PluginError;
use crate::registry::{Callback, CallbackRegistry};

/// One of the loading mechanisms `update_from_directory` dispatches to,
/// keyed by file extension. Rust cannot import arbitrary source at
/// runtime the way the original module loader does, so this trait is
/// the substitute seam: each implementation claims an extension and
/// knows how to turn a matching file into registrations.
#[async_trait::async_trait]
pub trait PluginSource: Send + Sync {
    /// Whether this source handles files with this extension (without the dot).
    fn handles_extension(&self, ext: &str) -> bool;

    /// Import (or reload) `path`, registering any callbacks it defines
    /// into `registry`.
    async fn load(&self, path: &Path, registry: &CallbackRegistry) -> Result<(), PluginError>;
}

/// One entry of a manifest file: a name to register under and the id of
/// a compiled-in callback constructor to bind it to.
#[derive(Debug, Deserialize)]
struct ManifestEntry {
    name: String,
    callable_id: String,
}

#[derive(Debug, Deserialize)]
struct Manifest {
    #[serde(default)]
    entries: Vec<ManifestEntry>,
}

/// The "pure-data configuration file" substitute: a TOML manifest that
/// binds names to entries of a fixed, compiled-in table of callback
/// constructors. Always available, and the default source used when no
/// extension-specific source claims a file.
pub struct ManifestPluginSource {
    constructors: HashMap<String, fn() -> Arc<dyn Callback>>,
}

impl ManifestPluginSource {
    pub fn new(constructors: HashMap<String, fn() -> Arc<dyn Callback>>) -> Self {
        ManifestPluginSource { constructors }
    }
}

#[async_trait::async_trait]
impl PluginSource for ManifestPluginSource {
    fn handles_extension(&self, ext: &str) -> bool {
        ext == "toml"
    }

    async fn load(&self, path: &Path, registry: &CallbackRegistry) -> Result<(), PluginError> {
        let content = std::fs::read_to_string(path).map_err(|source| PluginError::Load {
            path: path.display().to_string(),
            message: source.to_string(),
        })?;
        let manifest: Manifest = toml::from_str(&content).map_err(|source| PluginError::Load {
            path: path.display().to_string(),
            message: source.to_string(),
        })?;

        for entry in manifest.entries {
            let Some(constructor) = self.constructors.get(entry.callable_id.as_str()) else {
                return Err(PluginError::Load {
                    path: path.display().to_string(),
                    message: format!("unknown callable_id '{}'", entry.callable_id),
                });
            };
            registry.register(entry.name, constructor()).await;
        }
        Ok(())
    }
}

/// Loaded dylib state kept for change detection, mirroring
/// `PluginLoader`'s path -> hash cache.
struct LoadedDylib {
    hash: String,
}

/// Loads a `cdylib` exposing `_register_callbacks(registry: &CallbackRegistry)`
/// and reloads it when its content hash changes.
pub struct DylibPluginSource {
    loaded: RwLock<HashMap<PathBuf, LoadedDylib>>,
}

impl DylibPluginSource {
    pub fn new() -> Self {
        DylibPluginSource {
            loaded: RwLock::new(HashMap::new()),
        }
    }

    fn calculate_hash(path: &Path) -> Result<String, PluginError> {
        let contents = std::fs::read(path).map_err(|source| PluginError::Load {
            path: path.display().to_string(),
            message: source.to_string(),
        })?;
        let mut hasher = Sha256::new();
        hasher.update(&contents);
        Ok(format!("{:x}", hasher.finalize()))
    }
}

impl Default for DylibPluginSource {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl PluginSource for DylibPluginSource {
    fn handles_extension(&self, ext: &str) -> bool {
        ext == std::env::consts::DLL_EXTENSION
    }

    async fn load(&self, path: &Path, registry: &CallbackRegistry) -> Result<(), PluginError> {
        let hash = Self::calculate_hash(path)?;

        {
            let loaded = self.loaded.read().await;
            if let Some(existing) = loaded.get(path)
                && existing.hash == hash
            {
                debug!(path = %path.display(), "dylib unchanged, skipping reload");
                return Ok(());
            }
        }

        info!(path = %path.display(), "loading dylib plugin");

        // Safety: the library is expected to expose a `_register_callbacks`
        // symbol matching the signature below; a malformed library
        // produces a `PluginError`, not a crash, anywhere short of a
        // genuinely corrupt ABI.
        let register: Result<(), PluginError> = unsafe {
            let library = libloading::Library::new(path).map_err(|source| PluginError::Load {
                path: path.display().to_string(),
                message: source.to_string(),
            })?;
            let register_fn: libloading::Symbol<unsafe extern "C" fn(&CallbackRegistry)> = library
                .get(b"_register_callbacks")
                .map_err(|source| PluginError::Load {
                    path: path.display().to_string(),
                    message: source.to_string(),
                })?;
            register_fn(registry);
            Ok(())
        };
        register?;

        self.loaded.write().await.insert(path.to_path_buf(), LoadedDylib { hash });
        Ok(())
    }
}

impl CallbackRegistry {
    /// §4.3 `update_from_directory`: import or reload every non-hidden
    /// file in `path`, dispatching to whichever `PluginSource` claims its
    /// extension. Import errors are logged and do not abort the scan. If
    /// `module_name` is set, only the matching file is considered.
    pub async fn update_from_directory(
        &self,
        path: &Path,
        module_name: Option<&str>,
        sources: &[Box<dyn PluginSource>],
    ) -> Result<(), PluginError> {
        let entries = std::fs::read_dir(path).map_err(|source| PluginError::ReadDir {
            path: path.display().to_string(),
            source,
        })?;

        for entry in entries {
            let entry = match entry {
                Ok(e) => e,
                Err(err) => {
                    warn!(error = %err, "failed to read directory entry");
                    continue;
                }
            };
            let entry_path = entry.path();
            let Some(file_name) = entry_path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            if file_name.starts_with('_') {
                continue;
            }
            if let Some(module_name) = module_name {
                let stem = entry_path.file_stem().and_then(|s| s.to_str()).unwrap_or("");
                if stem != module_name {
                    continue;
                }
            }
            let Some(ext) = entry_path.extension().and_then(|e| e.to_str()) else {
                continue;
            };
            let Some(source) = sources.iter().find(|s| s.handles_extension(ext)) else {
                continue;
            };
            if let Err(err) = source.load(&entry_path, self).await {
                error!(path = %entry_path.display(), error = %err, "failed to import plugin module");
            }
        }
        Ok(())
    }
}
