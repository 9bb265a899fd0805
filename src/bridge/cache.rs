//! Content-addressed cache of successful runtime results.
//!
//! Entries live at `<dir>/<fingerprint>.json`. The fingerprint is the SHA-256
//! of the tool name, the script digest and the serialised arguments, so a
//! changed script or changed input never hits a stale entry. Argument objects
//! keep their key order (column order is meaningful to the scripts), so the
//! same columns in a different order are a different entry.
//! Cache failures are logged and otherwise ignored: the cache only ever saves
//! a subprocess, it never changes a result.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};

use super::ScriptOutput;

/// On-disk cache entry.
#[derive(Debug, Serialize, Deserialize)]
struct CacheEntry {
    tool: String,
    created_at: String,
    payload: Value,
    #[serde(default)]
    formatted: Option<String>,
}

/// A directory of cached results.
#[derive(Debug, Clone)]
pub struct ResultCache {
    dir: PathBuf,
    writable: bool,
}

impl ResultCache {
    /// Creates a cache rooted at `dir`. A read-only cache never stores.
    #[must_use]
    pub const fn new(dir: PathBuf, writable: bool) -> Self {
        Self { dir, writable }
    }

    /// Computes the fingerprint of a call.
    ///
    /// Arguments are hashed as serialised, keys in the order received, so
    /// reordered columns are a different call.
    #[must_use]
    pub fn fingerprint(tool: &str, script_digest: &str, arguments: &Value) -> String {
        let serialised = arguments.to_string();
        let mut hasher = Sha256::new();
        hasher.update(tool.as_bytes());
        hasher.update([0]);
        hasher.update(script_digest.as_bytes());
        hasher.update([0]);
        hasher.update(serialised.as_bytes());
        hex::encode(hasher.finalize())
    }

    fn entry_path(&self, fingerprint: &str) -> PathBuf {
        self.dir.join(format!("{fingerprint}.json"))
    }

    /// Loads a cached result.
    pub async fn load(&self, fingerprint: &str) -> Option<ScriptOutput> {
        let path = self.entry_path(fingerprint);
        let bytes = tokio::fs::read(&path).await.ok()?;
        match serde_json::from_slice::<CacheEntry>(&bytes) {
            Ok(entry) => Some(ScriptOutput {
                payload: entry.payload,
                formatted: entry.formatted,
            }),
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "Ignoring corrupt cache entry");
                None
            }
        }
    }

    /// Stores a result. No-op for a read-only cache.
    pub async fn store(&self, fingerprint: &str, tool: &str, output: &ScriptOutput) {
        if !self.writable {
            return;
        }

        let entry = CacheEntry {
            tool: tool.to_string(),
            created_at: chrono::Local::now().to_rfc3339(),
            payload: output.payload.clone(),
            formatted: output.formatted.clone(),
        };
        let bytes = match serde_json::to_vec_pretty(&entry) {
            Ok(bytes) => bytes,
            Err(e) => {
                tracing::warn!(error = %e, "Failed to serialise cache entry");
                return;
            }
        };

        let path = self.entry_path(fingerprint);
        let tmp = path.with_extension("json.tmp");
        let result = async {
            tokio::fs::create_dir_all(&self.dir).await?;
            tokio::fs::write(&tmp, &bytes).await?;
            tokio::fs::rename(&tmp, &path).await
        }
        .await;

        if let Err(e) = result {
            tracing::warn!(path = %path.display(), error = %e, "Failed to write cache entry");
        }
    }
}
