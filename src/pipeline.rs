//! The speech pipeline served by the bundled binaries.
//!
//! Loading the model weights is the slow part the server exists to pay once.
//! The weights travel as an opaque blob; nothing here interprets them.
//!
//! A freshly built pipeline can also be written to a snapshot file and read
//! back later, so a server can cold-start without the original weights path.

use std::fs;
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::codec::MsgPackCodec;
use crate::error::Result;

/// Default language code.
pub const DEFAULT_LANG_CODE: &str = "a";

/// Default model repository identifier.
pub const DEFAULT_REPO_ID: &str = "hexgrad/Kokoro-82M";

/// A constructed pipeline: identity plus loaded weights.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pipeline {
    pub lang_code: String,
    pub repo_id: String,
    pub weights: Bytes,
}

impl Pipeline {
    /// Size of the weights blob in bytes.
    pub fn weights_len(&self) -> usize {
        self.weights.len()
    }
}

/// Builds a [`Pipeline`] from a weights file.
#[derive(Debug, Clone)]
pub struct PipelineLoader {
    lang_code: String,
    repo_id: String,
    weights_path: PathBuf,
}

impl PipelineLoader {
    /// Loader with default language and repository.
    pub fn new(weights_path: impl Into<PathBuf>) -> Self {
        Self {
            lang_code: DEFAULT_LANG_CODE.to_string(),
            repo_id: DEFAULT_REPO_ID.to_string(),
            weights_path: weights_path.into(),
        }
    }

    /// Set the language code.
    pub fn lang_code(mut self, lang_code: impl Into<String>) -> Self {
        self.lang_code = lang_code.into();
        self
    }

    /// Set the repository identifier.
    pub fn repo_id(mut self, repo_id: impl Into<String>) -> Self {
        self.repo_id = repo_id.into();
        self
    }

    /// Read the weights and build the pipeline.
    pub fn load(&self) -> Result<Pipeline> {
        tracing::info!(
            "Loading pipeline {} (lang {}) from {}",
            self.repo_id,
            self.lang_code,
            self.weights_path.display()
        );
        let weights = fs::read(&self.weights_path)?;
        tracing::info!("Pipeline loaded ({} bytes of weights)", weights.len());

        Ok(Pipeline {
            lang_code: self.lang_code.clone(),
            repo_id: self.repo_id.clone(),
            weights: Bytes::from(weights),
        })
    }
}

/// Write a pipeline snapshot atomically (temp file in the same directory,
/// fsync, rename).
pub fn write_snapshot(path: &Path, pipeline: &Pipeline) -> Result<()> {
    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    };
    fs::create_dir_all(&dir)?;

    let temp = tempfile::NamedTempFile::new_in(&dir)?;
    {
        let mut out = BufWriter::new(temp.as_file());
        MsgPackCodec::encode_to(&mut out, pipeline)?;
        out.flush()?;
    }
    temp.as_file().sync_all()?;
    temp.persist(path).map_err(|e| e.error)?;

    tracing::info!("Pipeline snapshot written to {}", path.display());
    Ok(())
}

/// Read a pipeline snapshot written by [`write_snapshot`].
pub fn read_snapshot(path: &Path) -> Result<Pipeline> {
    let file = fs::File::open(path)?;
    let pipeline: Pipeline = MsgPackCodec::decode_from(BufReader::new(file))?;
    tracing::info!(
        "Pipeline {} restored from snapshot {}",
        pipeline.repo_id,
        path.display()
    );
    Ok(pipeline)
}
