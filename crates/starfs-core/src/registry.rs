//! In-memory file registry (hash -> content)

use crate::error::StarfsError;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use tokio::fs;

/// Hash and content of the file every node serves out of the box
pub const DEMO_FILE_HASH: &str = "1234";
pub const DEMO_FILE_CONTENT: &str = "0000111122223333444455556666777788889999";

/// Length in characters. File sizes and transfer windows are counted this way.
pub fn char_len(content: &str) -> u64 {
    content.chars().count() as u64
}

/// Files this node can serve
#[derive(Clone, Debug, Default)]
pub struct FileRegistry {
    files: Arc<RwLock<HashMap<String, Arc<String>>>>,
}

impl FileRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry holding only the demo file
    pub fn with_demo_file() -> Self {
        let registry = Self::new();
        registry.register(DEMO_FILE_HASH, DEMO_FILE_CONTENT);
        registry
    }

    pub fn register(&self, hash: impl Into<String>, content: impl Into<String>) {
        self.files
            .write()
            .insert(hash.into(), Arc::new(content.into()));
    }

    /// Register the UTF-8 file at `path` under `hash`; returns its length in characters
    pub async fn load(&self, hash: &str, path: &Path) -> Result<u64, StarfsError> {
        let content = fs::read_to_string(path).await?;
        let size = char_len(&content);
        self.register(hash, content);
        Ok(size)
    }

    pub fn get(&self, hash: &str) -> Option<Arc<String>> {
        self.files.read().get(hash).cloned()
    }

    pub fn len(&self) -> usize {
        self.files.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.read().is_empty()
    }
}
