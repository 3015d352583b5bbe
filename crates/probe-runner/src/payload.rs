use probe_core::{sha256_bytes, HarnessError};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::OnceCell;
use tracing::info;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentPayload {
    pub path: PathBuf,
    pub source: String,
    pub digest: String,
}

/// Agent source read once per process and shared read-only by every session.
#[derive(Debug)]
pub struct PayloadCache {
    path: PathBuf,
    cell: OnceCell<Arc<AgentPayload>>,
}

impl PayloadCache {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            cell: OnceCell::new(),
        }
    }

    pub fn is_loaded(&self) -> bool {
        self.cell.initialized()
    }

    /// Returns the cached payload, reading it on first use. A failed read is
    /// not cached, so a later call retries.
    pub async fn get(&self) -> Result<Arc<AgentPayload>, HarnessError> {
        let payload = self
            .cell
            .get_or_try_init(|| async {
                let bytes = tokio::fs::read(&self.path)
                    .await
                    .map_err(|e| self.load_error(e.to_string()))?;
                let digest = sha256_bytes(&bytes);
                let source = String::from_utf8(bytes)
                    .map_err(|_| self.load_error("payload is not valid UTF-8"))?;
                if source.trim().is_empty() {
                    return Err(self.load_error("payload is empty"));
                }
                info!(path = %self.path.display(), %digest, bytes = source.len(), "loaded agent payload");
                Ok(Arc::new(AgentPayload {
                    path: self.path.clone(),
                    source,
                    digest,
                }))
            })
            .await?;
        Ok(Arc::clone(payload))
    }

    fn load_error(&self, reason: impl Into<String>) -> HarnessError {
        HarnessError::PayloadLoad {
            path: self.path.clone(),
            reason: reason.into(),
        }
    }
}
