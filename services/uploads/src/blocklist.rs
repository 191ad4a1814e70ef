use crate::catalog::Catalog;
use crate::error::StorageError;
use std::sync::Arc;

/// Result of a blocklist lookup
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BlockStatus {
    pub blocked: bool,
    /// Uploading this content bans the uploader
    pub auto_ban: bool,
}

/// Exact-match moderation gate keyed by content hash
#[derive(Clone)]
pub struct BlocklistGuard {
    catalog: Arc<dyn Catalog>,
}

impl BlocklistGuard {
    pub fn new(catalog: Arc<dyn Catalog>) -> Self {
        Self { catalog }
    }

    pub async fn check(&self, hash: &str) -> Result<BlockStatus, StorageError> {
        Ok(match self.catalog.block_status(hash).await? {
            Some(auto_ban) => BlockStatus {
                blocked: true,
                auto_ban,
            },
            None => BlockStatus::default(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryCatalog;

    #[tokio::test]
    async fn test_check() {
        let catalog = Arc::new(MemoryCatalog::new());
        catalog.block("flagged", false);
        catalog.block("banned", true);
        let guard = BlocklistGuard::new(catalog);

        assert_eq!(guard.check("clean").await.unwrap(), BlockStatus::default());
        assert_eq!(
            guard.check("flagged").await.unwrap(),
            BlockStatus { blocked: true, auto_ban: false }
        );
        assert_eq!(
            guard.check("banned").await.unwrap(),
            BlockStatus { blocked: true, auto_ban: true }
        );
    }
}
