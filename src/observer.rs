//! The completion callback contract.

use std::sync::Arc;

use async_trait::async_trait;

use crate::Dispatcher;

/// Notified exactly once per dispatcher, when its torrent reaches local
/// completion.
#[async_trait]
pub trait Observer: Send + Sync {
    async fn dispatcher_complete(&self, dispatcher: Arc<Dispatcher>);
}
