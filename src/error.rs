// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Error types for the apply worker.
//!
//! # Error Categories
//!
//! | Error Type | Source | Description |
//! |------------|--------|-------------|
//! | `Connect` | negotiation | Could not open the replication connection |
//! | `Remote` | negotiation | Remote rejected a control command |
//! | `SelfConnection` | negotiation | Remote and local node identifiers match |
//! | `IdentityParse` | negotiation | Identification field did not parse |
//! | `Protocol` | any | Malformed frame or response shape |
//! | `UnknownAction` | dispatch | Change payload carried an unrecognized action tag |
//! | `Stream` | run loop | Read error on the duplex stream |
//! | `Feedback` | run loop | Progress acknowledgment could not be sent |
//! | `PositionStore` | position store | SQLite failure |
//! | `Apply` | dispatch | The apply handler reported a failure |
//! | `Config` | startup | Configuration invalid |
//! | `Io` | any | Underlying socket I/O failure |
//!
//! # Propagation Policy
//!
//! Every error that escapes [`negotiate`](crate::negotiate::negotiate) or
//! [`ApplyWorker::run`](crate::worker::ApplyWorker::run) is fatal: the worker
//! performs no in-process retry. The recovery mechanism is a restart by the
//! host process manager, which resumes replay from the last acknowledged
//! position. Conditions the worker absorbs without erroring — unrecognized
//! non-change message tags, duplicate feedback positions, would-block reads —
//! never reach this type.

use thiserror::Error;

/// Result type alias for apply-worker operations.
pub type Result<T> = std::result::Result<T, ApplyError>;

/// Errors that can occur while negotiating or consuming a change stream.
///
/// All variants are fatal when they escape the worker; see the module docs
/// for the propagation policy.
#[derive(Error, Debug)]
pub enum ApplyError {
    /// The replication connection could not be opened.
    #[error("could not connect to the upstream node ({addr}): {message}")]
    Connect { addr: String, message: String },

    /// The remote rejected a control command.
    ///
    /// `detail` carries the remote-supplied error text and, when present,
    /// the remote error code.
    #[error("could not send replication command \"{command}\": {detail}")]
    Remote { command: String, detail: String },

    /// The remote node identifier equals the local one.
    ///
    /// Streaming from ourselves would replay our own changes back into the
    /// local database. Raised before any slot or origin is created.
    #[error("node identifiers have to differ between the nodes (both are {node_id})")]
    SelfConnection { node_id: u64 },

    /// A textual identification field did not parse as its numeric type.
    #[error("could not parse remote {field} {value:?}")]
    IdentityParse { field: &'static str, value: String },

    /// A frame or control response had an unexpected shape.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// A change payload carried an action tag outside `B`/`C`/`I`/`U`/`D`.
    ///
    /// The stream is assumed corrupt or protocol-incompatible; no partial
    /// recovery is attempted.
    #[error("unknown action of type {0}")]
    UnknownAction(char),

    /// The duplex stream failed mid-read.
    #[error("stream error: {0}")]
    Stream(String),

    /// A progress acknowledgment could not be written or flushed.
    ///
    /// The worker cannot safely make progress without a live feedback
    /// channel, so it exits rather than silently drifting out of sync with
    /// the sender.
    #[error("could not send feedback packet: {0}")]
    Feedback(String),

    /// SQLite failure in the position store.
    #[error("position store error: {0}")]
    PositionStore(#[from] sqlx::Error),

    /// The apply handler reported a failure.
    #[error("apply handler error: {0}")]
    Apply(String),

    /// Invalid or missing configuration.
    #[error("configuration error: {0}")]
    Config(String),

    /// Socket-level I/O failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
