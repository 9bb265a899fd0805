//! The script library handed to the external runtime.
//!
//! Scripts are compiled into the binary and written to a directory at
//! startup, so every call runs a known file regardless of the working
//! directory the server was launched from.

use std::io;
use std::path::{Path, PathBuf};

use indexmap::IndexMap;
use sha2::{Digest, Sha256};

/// A script to be materialised into the library directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScriptSource {
    /// Name tools refer to the script by.
    pub name: String,
    /// File name inside the library directory.
    pub file_name: String,
    /// Script body.
    pub body: String,
}

impl ScriptSource {
    /// Creates a script with an explicit file name.
    #[must_use]
    pub fn new(
        name: impl Into<String>,
        file_name: impl Into<String>,
        body: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            file_name: file_name.into(),
            body: body.into(),
        }
    }

    /// Creates an R script stored as `<name>.R`.
    #[must_use]
    pub fn r(name: &str, body: &str) -> Self {
        Self::new(name, format!("{name}.R"), body)
    }
}

/// A materialised script.
#[derive(Debug, Clone)]
pub struct Script {
    /// Absolute path of the script file.
    pub path: PathBuf,
    /// SHA-256 of the script body, hex encoded.
    pub digest: String,
}

/// Scripts written to a directory, indexed by name.
#[derive(Debug, Clone)]
pub struct ScriptLibrary {
    dir: PathBuf,
    scripts: IndexMap<String, Script>,
}

impl ScriptLibrary {
    /// Writes `sources` into `dir` and indexes them.
    ///
    /// # Errors
    ///
    /// Returns an error if a file cannot be written or a file name would
    /// escape the directory.
    pub fn materialise(dir: &Path, sources: &[ScriptSource]) -> io::Result<Self> {
        let mut scripts = IndexMap::with_capacity(sources.len());
        for source in sources {
            let file_name = Path::new(&source.file_name);
            if file_name.components().count() != 1 || file_name.is_absolute() {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidInput,
                    format!("script file name '{}' must be a bare name", source.file_name),
                ));
            }

            let path = dir.join(file_name);
            std::fs::write(&path, &source.body)?;
            let digest = hex::encode(Sha256::digest(source.body.as_bytes()));
            scripts.insert(source.name.clone(), Script { path, digest });
        }

        Ok(Self {
            dir: dir.to_path_buf(),
            scripts,
        })
    }

    /// The library directory.
    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Looks up a script by name.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&Script> {
        self.scripts.get(name)
    }

    /// Script names in the order they were supplied.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.scripts.keys().map(String::as_str)
    }
}
