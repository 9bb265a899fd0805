//! Process-wide lifespan state.
//!
//! [`Lifespan`] owns everything that lives as long as the server: the allowed
//! root list, the cache root, the materialised script library and the
//! execution bridge. Sessions and request contexts only ever see the shared,
//! read-only [`LifespanState`].
//!
//! Resources are acquired in a fixed order and released in reverse by
//! [`Lifespan::teardown`], which runs exactly once. `Drop` calls it as well,
//! so an early return or a panic in `main` still removes the script library.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use serde_json::{json, Value};
use tempfile::TempDir;

use crate::bridge::{ExecutionBridge, ResultCache, ScriptLibrary, ScriptSource};
use crate::config::Config;
use crate::error::LifespanError;

/// Shared state visible to every request.
#[derive(Debug)]
pub struct LifespanState {
    allowed_paths: Vec<PathBuf>,
    cache_root: Option<PathBuf>,
    read_only: bool,
    bridge: ExecutionBridge,
}

impl LifespanState {
    /// Allowed roots for dataset files, canonicalised where they exist.
    #[must_use]
    pub fn allowed_paths(&self) -> &[PathBuf] {
        &self.allowed_paths
    }

    /// The cache root, if configured.
    #[must_use]
    pub fn cache_root(&self) -> Option<&Path> {
        self.cache_root.as_deref()
    }

    /// Whether the server may write to disk.
    #[must_use]
    pub const fn read_only(&self) -> bool {
        self.read_only
    }

    /// The execution bridge.
    #[must_use]
    pub const fn bridge(&self) -> &ExecutionBridge {
        &self.bridge
    }

    /// Resolves a dataset path and checks it lies under an allowed root.
    ///
    /// # Errors
    ///
    /// Returns a message suitable for the client if the path does not exist,
    /// cannot be resolved, or lies outside every allowed root. The message
    /// never includes the allowed roots themselves.
    pub fn resolve_path(&self, file_path: &str) -> Result<PathBuf, String> {
        if self.allowed_paths.is_empty() {
            return Err("file access is disabled: no allowed_paths are configured".to_string());
        }

        let path = Path::new(file_path);
        let canonical = path
            .canonicalize()
            .map_err(|e| format!("cannot resolve '{}': {e}", path.display()))?;

        if self
            .allowed_paths
            .iter()
            .any(|root| canonical.starts_with(root))
        {
            Ok(canonical)
        } else {
            Err("access denied: path is outside the configured allowed directories".to_string())
        }
    }

    /// JSON summary served as the `stats://server/config` resource.
    #[must_use]
    pub fn summary(&self) -> Value {
        let stats = self.bridge.stats();
        json!({
            "allowedPaths": self.allowed_paths,
            "cacheRoot": self.cache_root,
            "readOnly": self.read_only,
            "runtime": {
                "command": self.bridge.command(),
                "timeoutSecs": self.bridge.timeout().as_secs_f64(),
                "cachesResults": self.bridge.caches_results(),
                "scripts": self.bridge.scripts().names().collect::<Vec<_>>(),
            },
            "processes": {
                "spawned": stats.spawned(),
                "reaped": stats.reaped(),
            },
        })
    }
}

/// A resource held by the lifespan, in acquisition order.
#[derive(Debug)]
enum Acquired {
    AllowedRoots,
    CacheRoot,
    ScriptLibrary(TempDir),
    Bridge,
}

impl Acquired {
    const fn name(&self) -> &'static str {
        match self {
            Self::AllowedRoots => "allowed_roots",
            Self::CacheRoot => "cache_root",
            Self::ScriptLibrary(_) => "script_library",
            Self::Bridge => "bridge",
        }
    }
}

/// Owner of the process-wide resources.
#[derive(Debug)]
pub struct Lifespan {
    state: Arc<LifespanState>,
    resources: Mutex<Vec<Acquired>>,
    torn_down: AtomicBool,
}

impl Lifespan {
    /// Acquires the lifespan resources.
    ///
    /// # Errors
    ///
    /// Returns an error if the cache root cannot be created or the script
    /// library cannot be written.
    pub fn create(config: &Config, scripts: &[ScriptSource]) -> Result<Self, LifespanError> {
        let mut resources = Vec::with_capacity(4);

        let allowed_paths: Vec<PathBuf> = config
            .allowed_paths
            .iter()
            .map(|root| root.canonicalize().unwrap_or_else(|_| root.clone()))
            .collect();
        for root in &allowed_paths {
            if !root.is_dir() {
                tracing::warn!(path = %root.display(), "Allowed path does not exist");
            }
        }
        resources.push(Acquired::AllowedRoots);

        let cache = match &config.cache_root {
            Some(root) => {
                let results = root.join("results");
                if !config.read_only {
                    std::fs::create_dir_all(&results).map_err(|source| {
                        LifespanError::CacheRoot {
                            path: root.clone(),
                            source,
                        }
                    })?;
                }
                resources.push(Acquired::CacheRoot);
                Some(ResultCache::new(results, !config.read_only))
            }
            None => None,
        };

        let script_dir = match (&config.cache_root, config.read_only) {
            (Some(root), false) => tempfile::Builder::new()
                .prefix("scripts-")
                .tempdir_in(root),
            _ => tempfile::Builder::new().prefix("rstats-mcp-").tempdir(),
        }
        .map_err(|source| LifespanError::ScriptLibrary {
            message: "cannot create script directory".to_string(),
            source,
        })?;
        let library = ScriptLibrary::materialise(script_dir.path(), scripts).map_err(|source| {
            LifespanError::ScriptLibrary {
                message: format!("cannot write scripts to {}", script_dir.path().display()),
                source,
            }
        })?;
        tracing::debug!(
            dir = %script_dir.path().display(),
            scripts = scripts.len(),
            "Script library materialised"
        );
        resources.push(Acquired::ScriptLibrary(script_dir));

        let bridge = ExecutionBridge::new(&config.runtime, library, cache);
        resources.push(Acquired::Bridge);

        let state = LifespanState {
            allowed_paths,
            cache_root: config.cache_root.clone(),
            read_only: config.read_only,
            bridge,
        };

        tracing::info!(
            command = %state.bridge.command().display(),
            read_only = state.read_only,
            "Lifespan started"
        );

        Ok(Self {
            state: Arc::new(state),
            resources: Mutex::new(resources),
            torn_down: AtomicBool::new(false),
        })
    }

    /// A shared handle to the state.
    #[must_use]
    pub fn state(&self) -> Arc<LifespanState> {
        Arc::clone(&self.state)
    }

    /// Releases all resources in reverse acquisition order.
    ///
    /// Returns the names of the released resources, or `None` if teardown
    /// already ran.
    pub fn teardown(&self) -> Option<Vec<&'static str>> {
        if self.torn_down.swap(true, Ordering::SeqCst) {
            return None;
        }

        let mut resources = self
            .resources
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let mut released = Vec::with_capacity(resources.len());

        while let Some(resource) = resources.pop() {
            let name = resource.name();
            match resource {
                Acquired::Bridge => self.state.bridge.close(),
                Acquired::ScriptLibrary(dir) => {
                    let path = dir.path().to_path_buf();
                    if let Err(e) = dir.close() {
                        tracing::warn!(path = %path.display(), error = %e, "Failed to remove script library");
                    }
                }
                Acquired::CacheRoot | Acquired::AllowedRoots => {}
            }
            tracing::debug!(resource = name, "Released");
            released.push(name);
        }

        let stats = self.state.bridge.stats();
        tracing::info!(
            spawned = stats.spawned(),
            reaped = stats.reaped(),
            "Lifespan torn down"
        );
        Some(released)
    }
}

impl Drop for Lifespan {
    fn drop(&mut self) {
        self.teardown();
    }
}
