//! # Apply Engine
//!
//! A logical change-stream apply worker. Each worker holds one long-lived
//! duplex connection to a remote node, negotiates a durable origin identity
//! so replay resumes exactly where it left off after a restart, decodes the
//! framed change stream, hands each change to the local apply layer, and
//! periodically acknowledges progress back to the sender.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────────┐
//! │                            apply-engine                              │
//! │                                                                      │
//! │  ┌───────────┐   ┌─────────────────┐   ┌───────────────────────────┐ │
//! │  │ negotiate │──►│ ApplyWorker     │──►│ Change -> ApplyHandler    │ │
//! │  │ (startup) │   │ (wait / drain)  │   │ (begin/commit/ins/upd/del)│ │
//! │  └───────────┘   └─────────────────┘   └───────────────────────────┘ │
//! │        │                  │                                          │
//! │        ▼                  ▼                                          │
//! │  ┌───────────────┐  ┌──────────────────┐                             │
//! │  │ PositionStore │  │ FeedbackReporter │                             │
//! │  │ (SQLite)      │  │ (progress acks)  │                             │
//! │  └───────────────┘  └──────────────────┘                             │
//! └──────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! One worker runs per configured upstream; workers share nothing but the
//! position store. Fatal errors exit the worker — restart (and resume from
//! the last acknowledged position) is the host process manager's job.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use apply_engine::{
//!     negotiate, ApplyConfig, ApplyWorker, NoOpApply, ShutdownController,
//!     SqlitePositionStore, TcpLink,
//! };
//!
//! #[tokio::main]
//! async fn main() -> apply_engine::Result<()> {
//!     let config = ApplyConfig::default();
//!     let upstream = config.upstreams[0].clone();
//!
//!     let store = Arc::new(
//!         SqlitePositionStore::new(&config.positions, config.settings.commit_durability).await?,
//!     );
//!
//!     let shutdown = ShutdownController::new();
//!     shutdown.install_signal_handlers()?;
//!
//!     let mut link = TcpLink::connect(&upstream.addr, &upstream.database).await?;
//!     let negotiated = negotiate(&mut link, store.as_ref(), &config.local, &upstream).await?;
//!
//!     ApplyWorker::new(
//!         link,
//!         store,
//!         Arc::new(NoOpApply),
//!         upstream,
//!         negotiated,
//!         config.settings.clone(),
//!         shutdown,
//!     )
//!     .run()
//!     .await
//! }
//! ```

pub mod apply;
pub mod config;
pub mod error;
pub mod feedback;
pub mod link;
pub mod metrics;
pub mod negotiate;
pub mod position;
pub mod protocol;
pub mod shutdown;
pub mod worker;

// Re-exports for convenience
pub use apply::{dispatch, ApplyFault, ApplyHandler, Change, NoOpApply};
pub use config::{
    ApplyConfig, CommitDurability, LocalNodeConfig, PositionStoreConfig, UpstreamConfig,
    WorkerSettings,
};
pub use error::{ApplyError, Result};
pub use feedback::FeedbackReporter;
pub use link::{Polled, TcpLink, UpstreamLink};
pub use negotiate::{derive_slot_name, negotiate, NegotiatedUpstream, RemoteIdentity};
pub use position::{OriginId, OriginIdentity, PositionStore, SqlitePositionStore};
pub use protocol::{StreamPosition, INVALID_POSITION};
pub use shutdown::ShutdownController;
pub use worker::{ApplyWorker, WorkerState};
