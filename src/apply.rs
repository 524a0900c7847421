// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Change parsing and apply-handler dispatch.
//!
//! A change payload's first byte is an action tag; [`Change::parse`] turns
//! tag plus payload into an enumerated change event, and [`dispatch`] maps
//! that event to exactly one method of the [`ApplyHandler`] trait. Parsing
//! is separated from dispatch so decode correctness is testable without a
//! live connection.
//!
//! The dispatcher is stateless. Transaction boundaries (what `begin` and
//! `commit` mean, atomicity of the changes in between) are owned entirely by
//! the handler implementation — the worker performs no unwind of in-flight
//! changes on shutdown and relies on the handler's own atomicity.

use crate::error::{ApplyError, Result};
use std::future::Future;
use std::pin::Pin;

/// Action tag: transaction begin.
pub const ACTION_BEGIN: u8 = b'B';
/// Action tag: transaction commit.
pub const ACTION_COMMIT: u8 = b'C';
/// Action tag: row insert.
pub const ACTION_INSERT: u8 = b'I';
/// Action tag: row update.
pub const ACTION_UPDATE: u8 = b'U';
/// Action tag: row delete.
pub const ACTION_DELETE: u8 = b'D';

/// One decoded change event; payload bytes stay opaque to the worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Change<'a> {
    Begin(&'a [u8]),
    Commit(&'a [u8]),
    Insert(&'a [u8]),
    Update(&'a [u8]),
    Delete(&'a [u8]),
}

impl<'a> Change<'a> {
    /// Parse a change payload: leading action tag, rest stays opaque.
    ///
    /// An unrecognized tag is a fatal protocol error; the stream is assumed
    /// corrupt or protocol-incompatible, and no handler is invoked for the
    /// message.
    pub fn parse(data: &'a [u8]) -> Result<Change<'a>> {
        let (&tag, rest) = data
            .split_first()
            .ok_or_else(|| ApplyError::Protocol("empty change payload".to_string()))?;
        match tag {
            ACTION_BEGIN => Ok(Change::Begin(rest)),
            ACTION_COMMIT => Ok(Change::Commit(rest)),
            ACTION_INSERT => Ok(Change::Insert(rest)),
            ACTION_UPDATE => Ok(Change::Update(rest)),
            ACTION_DELETE => Ok(Change::Delete(rest)),
            other => Err(ApplyError::UnknownAction(other as char)),
        }
    }

    /// Action name, for logs and metric labels.
    pub fn action(&self) -> &'static str {
        match self {
            Change::Begin(_) => "begin",
            Change::Commit(_) => "commit",
            Change::Insert(_) => "insert",
            Change::Update(_) => "update",
            Change::Delete(_) => "delete",
        }
    }

    /// Whether this change commits a transaction.
    pub fn is_commit(&self) -> bool {
        matches!(self, Change::Commit(_))
    }
}

/// Result type for apply-handler operations.
pub type HandlerResult<T> = std::result::Result<T, ApplyFault>;

/// Type alias for boxed async futures (reduces trait signature complexity).
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = HandlerResult<T>> + Send + 'a>>;

/// Simplified error for apply-handler operations.
#[derive(Debug, Clone)]
pub struct ApplyFault(pub String);

impl std::fmt::Display for ApplyFault {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::error::Error for ApplyFault {}

/// The local apply layer: five entry points, one per action kind.
///
/// Each receives the opaque payload that followed the action tag. The
/// handler owns all local-storage mutation semantics; the worker only
/// guarantees it invokes these strictly in stream arrival order.
pub trait ApplyHandler: Send + Sync + 'static {
    /// A remote transaction begins.
    fn begin<'a>(&'a self, payload: &'a [u8]) -> BoxFuture<'a, ()>;

    /// The current remote transaction commits.
    fn commit<'a>(&'a self, payload: &'a [u8]) -> BoxFuture<'a, ()>;

    /// Apply a row insert.
    fn insert<'a>(&'a self, payload: &'a [u8]) -> BoxFuture<'a, ()>;

    /// Apply a row update.
    fn update<'a>(&'a self, payload: &'a [u8]) -> BoxFuture<'a, ()>;

    /// Apply a row delete.
    fn delete<'a>(&'a self, payload: &'a [u8]) -> BoxFuture<'a, ()>;
}

/// Invoke exactly one handler entry point for a parsed change.
///
/// A handler failure is promoted to a fatal [`ApplyError::Apply`]; the
/// worker exits rather than skipping or retrying the change.
pub async fn dispatch<H: ApplyHandler + ?Sized>(handler: &H, change: Change<'_>) -> Result<()> {
    let result = match change {
        Change::Begin(payload) => handler.begin(payload).await,
        Change::Commit(payload) => handler.commit(payload).await,
        Change::Insert(payload) => handler.insert(payload).await,
        Change::Update(payload) => handler.update(payload).await,
        Change::Delete(payload) => handler.delete(payload).await,
    };
    result.map_err(|e| ApplyError::Apply(e.to_string()))
}

/// A no-op implementation for testing/standalone mode.
///
/// Logs each change but doesn't store anything.
#[derive(Clone)]
pub struct NoOpApply;

impl ApplyHandler for NoOpApply {
    fn begin<'a>(&'a self, payload: &'a [u8]) -> BoxFuture<'a, ()> {
        Box::pin(async move {
            tracing::debug!(len = payload.len(), "noop: would begin transaction");
            Ok(())
        })
    }

    fn commit<'a>(&'a self, payload: &'a [u8]) -> BoxFuture<'a, ()> {
        Box::pin(async move {
            tracing::debug!(len = payload.len(), "noop: would commit transaction");
            Ok(())
        })
    }

    fn insert<'a>(&'a self, payload: &'a [u8]) -> BoxFuture<'a, ()> {
        Box::pin(async move {
            tracing::debug!(len = payload.len(), "noop: would insert row");
            Ok(())
        })
    }

    fn update<'a>(&'a self, payload: &'a [u8]) -> BoxFuture<'a, ()> {
        Box::pin(async move {
            tracing::debug!(len = payload.len(), "noop: would update row");
            Ok(())
        })
    }

    fn delete<'a>(&'a self, payload: &'a [u8]) -> BoxFuture<'a, ()> {
        Box::pin(async move {
            tracing::debug!(len = payload.len(), "noop: would delete row");
            Ok(())
        })
    }
}
