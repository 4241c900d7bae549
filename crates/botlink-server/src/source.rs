//! The host's configuration accessor.

use futures_util::future::{self, BoxFuture};
use serde_json::Value;
use std::future::Future;

/// Supplies the snapshot returned for `get_config`.
///
/// Implemented by the hosting process. Any error is reported to the
/// requesting client as a generic server error; the connection stays open.
pub trait ConfigSource: Send + Sync {
    fn snapshot(&self) -> BoxFuture<'_, anyhow::Result<Value>>;
}

impl<F, Fut> ConfigSource for F
where
    F: Fn() -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
{
    fn snapshot(&self) -> BoxFuture<'_, anyhow::Result<Value>> {
        Box::pin(self())
    }
}

/// A fixed snapshot.
#[derive(Debug, Clone)]
pub struct StaticSource(pub Value);

impl ConfigSource for StaticSource {
    fn snapshot(&self) -> BoxFuture<'_, anyhow::Result<Value>> {
        Box::pin(future::ready(Ok(self.0.clone())))
    }
}
