//! Content change notifications for a search indexer.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::warn;

use crate::Result;

/// Receives content changes after they commit.
///
/// Calls are made from a spawned task; errors are logged and dropped.
#[async_trait]
pub trait ContentIndexer: Send + Sync {
    /// `text` is the file's content when it is small UTF-8 text, else empty.
    async fn on_content_changed(
        &self,
        file_id: i64,
        owner_id: i64,
        name: &str,
        text: &str,
    ) -> Result<()>;
}

/// Indexer that ignores every notification.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopIndexer;

#[async_trait]
impl ContentIndexer for NoopIndexer {
    async fn on_content_changed(
        &self,
        _file_id: i64,
        _owner_id: i64,
        _name: &str,
        _text: &str,
    ) -> Result<()> {
        Ok(())
    }
}

/// Text to hand to the indexer for captured content.
pub(crate) fn index_text(captured: Option<Vec<u8>>) -> String {
    captured
        .and_then(|bytes| String::from_utf8(bytes).ok())
        .unwrap_or_default()
}

/// Notify `indexer` in the background.
pub(crate) fn notify(
    indexer: &Arc<dyn ContentIndexer>,
    file_id: i64,
    owner_id: i64,
    name: String,
    text: String,
) {
    let indexer = Arc::clone(indexer);
    tokio::spawn(async move {
        if let Err(e) = indexer
            .on_content_changed(file_id, owner_id, &name, &text)
            .await
        {
            warn!(file_id, "content indexer failed: {}", e);
        }
    });
}
