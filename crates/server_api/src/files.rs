use std::{collections::HashMap, sync::Arc};

use async_trait::async_trait;
use shared::{domain::FileId, protocol::FileDescriptor};
use tokio::sync::RwLock;

/// Resolves file ids issued by the external file service into attachment
/// pointers. `Ok(None)` means the service does not know the id.
#[async_trait]
pub trait FileDirectory: Send + Sync {
    async fn describe(&self, file_id: FileId) -> anyhow::Result<Option<FileDescriptor>>;
}

#[derive(Clone, Default)]
pub struct InMemoryFileDirectory {
    files: Arc<RwLock<HashMap<FileId, FileDescriptor>>>,
}

impl InMemoryFileDirectory {
    pub async fn insert(&self, file: FileDescriptor) {
        self.files.write().await.insert(file.file_id, file);
    }
}

#[async_trait]
impl FileDirectory for InMemoryFileDirectory {
    async fn describe(&self, file_id: FileId) -> anyhow::Result<Option<FileDescriptor>> {
        Ok(self.files.read().await.get(&file_id).cloned())
    }
}

/// Used when no file service is configured. No id resolves, so every
/// attachment is rejected as unknown.
pub struct MissingFileDirectory;

#[async_trait]
impl FileDirectory for MissingFileDirectory {
    async fn describe(&self, file_id: FileId) -> anyhow::Result<Option<FileDescriptor>> {
        tracing::debug!(%file_id, "file lookup without a configured file service");
        Ok(None)
    }
}
