//! The resource source consumed by the informer.
//!
//! A source enumerates the current resource set and streams changes. The
//! stream may end at any time (network partition, server restart); the
//! informer then relists.

use async_trait::async_trait;
use futures_core::stream::BoxStream;

use crate::error::SourceError;
use crate::object::Resource;

/// A change notification.
#[derive(Debug, Clone, PartialEq)]
pub enum WatchEvent<R> {
    Added(R),
    Modified(R),
    /// Carries the last known state of the deleted resource.
    Deleted(R),
}

/// Stream of notifications from a source.
pub type WatchStream<R> = BoxStream<'static, WatchEvent<R>>;

/// Lists and watches resources of one kind.
#[async_trait]
pub trait Source<R: Resource>: Send + Sync + 'static {
    /// Enumerate every resource currently known.
    async fn list(&self) -> Result<Vec<R>, SourceError>;

    /// Open a stream of changes that follow the last list.
    async fn watch(&self) -> Result<WatchStream<R>, SourceError>;
}
