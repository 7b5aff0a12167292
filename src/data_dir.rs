use std::path::{Path, PathBuf};

use tracing::debug;

use crate::error::{Error, Result};

/// Environment variable overriding the XDG data directory.
pub const DATA_DIR_ENV_VAR: &str = "PROTOCOL_RETRIEVAL_DATA_DIR";

#[derive(Debug, Clone)]
pub struct DataDir {
    root: PathBuf,
}

impl DataDir {
    /// Resolve the data directory from, in order of priority:
    /// 1. An explicit path (from --data-dir)
    /// 2. The PROTOCOL_RETRIEVAL_DATA_DIR environment variable
    /// 3. The XDG data directory (~/.local/share/protocol-retrieval/)
    pub fn resolve(explicit: Option<&Path>) -> Result<Self> {
        let (root, source) = match explicit {
            Some(path) => (path.to_path_buf(), "flag"),
            None => match std::env::var_os(DATA_DIR_ENV_VAR) {
                Some(val) if !val.is_empty() => (PathBuf::from(val), "env"),
                _ => (xdg_data_home()?, "xdg"),
            },
        };

        std::fs::create_dir_all(&root)
            .map_err(|_| Error::DataDir(root.clone()))?;
        debug!(path = %root.display(), source, "using data directory");

        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Default corpus file, a JSON array of protocol chunks.
    pub fn corpus(&self) -> PathBuf {
        self.root.join("corpus.json")
    }

    /// Default policy file. Optional; built-in defaults apply when absent.
    pub fn config(&self) -> PathBuf {
        self.root.join("config.json")
    }

    /// The corpus to serve: `explicit` (from --corpus) or the default
    /// file. Unlike the policy file, a corpus is required.
    pub fn locate_corpus(&self, explicit: Option<&Path>) -> Result<PathBuf> {
        let path = explicit.map_or_else(|| self.corpus(), Path::to_path_buf);
        if !path.is_file() {
            return Err(Error::NotFound {
                kind: "corpus",
                name: path.display().to_string(),
            });
        }
        Ok(path)
    }
}

fn xdg_data_home() -> Result<PathBuf> {
    xdg::BaseDirectories::with_prefix("protocol-retrieval")
        .get_data_home()
        .ok_or_else(|| {
            Error::Config("could not determine XDG data home directory".into())
        })
}
