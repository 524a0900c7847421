// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! The apply worker's run loop.
//!
//! One worker per upstream node, single-tasked and cooperative. After
//! negotiation the loop alternates between a bounded wait and a
//! non-blocking drain of buffered stream frames:
//!
//! ```text
//!          readable                      stream end
//! Waiting ──────────────► Draining ──────────────────► Done
//!    ▲  ▲                    │                          ▲
//!    │  └────────────────────┘                          │
//!    │     no more frames                               │
//!    │     (feedback if the position advanced)          │
//!    └── timeout / wake                                 │
//!                                                       │
//!  terminate flag observed / host death ────────────────┘
//! ```
//!
//! # Shutdown
//!
//! The terminate flag is checked before each wait entry and between drained
//! messages, so shutdown latency is bounded by one message-processing step
//! rather than one full wait timeout. Cancellation is cooperative: a slow
//! apply call delays shutdown until it returns. Host death (the host's
//! watch channel closing) exits immediately with no feedback or position
//! write.

use crate::apply::{dispatch, ApplyHandler, Change};
use crate::config::{UpstreamConfig, WorkerSettings};
use crate::error::Result;
use crate::feedback::FeedbackReporter;
use crate::link::{Polled, UpstreamLink};
use crate::metrics;
use crate::negotiate::NegotiatedUpstream;
use crate::position::PositionStore;
use crate::protocol::{StreamMessage, StreamPosition};
use crate::shutdown::ShutdownController;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{info, trace, warn};

/// Lifecycle state of the run loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    /// Blocked (bounded) waiting for input, a wake, or a timeout.
    Waiting,
    /// Draining buffered frames without blocking.
    Draining,
    /// Terminal: stream ended, terminate observed, or host died.
    Done,
}

impl std::fmt::Display for WorkerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WorkerState::Waiting => write!(f, "waiting"),
            WorkerState::Draining => write!(f, "draining"),
            WorkerState::Done => write!(f, "done"),
        }
    }
}

enum WakeReason {
    Readable,
    Woken,
    Timeout,
    HostGone,
}

/// Resolves when the host's watch channel closes; pends forever without one.
async fn host_death(host: &mut Option<watch::Receiver<()>>) {
    match host.as_mut() {
        // Sent values are irrelevant; only closure means the host is gone.
        Some(rx) => while rx.changed().await.is_ok() {},
        None => std::future::pending().await,
    }
}

/// The streaming consumer for one negotiated upstream.
///
/// Consumes the duplex stream, forwards decoded changes to the apply
/// handler in arrival order, tracks the highest position seen, and
/// acknowledges progress when it advances.
pub struct ApplyWorker<L, S: ?Sized, H: ?Sized> {
    link: L,
    store: Arc<S>,
    handler: Arc<H>,
    upstream: UpstreamConfig,
    negotiated: NegotiatedUpstream,
    settings: WorkerSettings,
    shutdown: ShutdownController,
    host: Option<watch::Receiver<()>>,
    feedback: FeedbackReporter,
    last_received: StreamPosition,
    state: WorkerState,
}

impl<L, S, H> ApplyWorker<L, S, H>
where
    L: UpstreamLink,
    S: PositionStore + ?Sized,
    H: ApplyHandler + ?Sized,
{
    /// Build a worker around a link that [`negotiate`](crate::negotiate::negotiate)
    /// already switched into stream mode.
    pub fn new(
        link: L,
        store: Arc<S>,
        handler: Arc<H>,
        upstream: UpstreamConfig,
        negotiated: NegotiatedUpstream,
        settings: WorkerSettings,
        shutdown: ShutdownController,
    ) -> Self {
        let feedback = FeedbackReporter::new(&upstream.name, settings.reply_requested);
        let last_received = negotiated.start_position;
        Self {
            link,
            store,
            handler,
            upstream,
            negotiated,
            settings,
            shutdown,
            host: None,
            feedback,
            last_received,
            state: WorkerState::Waiting,
        }
    }

    /// Attach the host process manager's liveness channel.
    ///
    /// When the sender side drops, the worker exits immediately with no
    /// further cleanup.
    pub fn with_host_watch(mut self, host: watch::Receiver<()>) -> Self {
        self.host = Some(host);
        self
    }

    /// Current lifecycle state.
    pub fn state(&self) -> WorkerState {
        self.state
    }

    /// Highest stream position seen this session.
    pub fn last_received(&self) -> StreamPosition {
        self.last_received
    }

    /// Run until the stream ends, terminate is observed, the host dies, or
    /// a fatal error occurs.
    pub async fn run(mut self) -> Result<()> {
        info!(
            upstream = %self.upstream.name,
            origin = %self.negotiated.origin_id,
            start = self.negotiated.start_position,
            "apply worker running"
        );
        metrics::set_worker_state(&self.upstream.name, "waiting");

        loop {
            // Checked before each wait entry.
            if self.shutdown.is_terminated() {
                break;
            }
            self.state = WorkerState::Waiting;

            let wait_timeout = self.settings.wait_timeout_duration();
            let reason = tokio::select! {
                biased;
                _ = host_death(&mut self.host) => WakeReason::HostGone,
                _ = self.shutdown.wait_wake() => WakeReason::Woken,
                ready = self.link.wait_readable() => {
                    ready?;
                    WakeReason::Readable
                }
                _ = tokio::time::sleep(wait_timeout) => WakeReason::Timeout,
            };

            match reason {
                WakeReason::HostGone => {
                    warn!(upstream = %self.upstream.name, "host is gone, exiting immediately");
                    self.state = WorkerState::Done;
                    metrics::set_worker_state(&self.upstream.name, "done");
                    return Ok(());
                }
                WakeReason::Readable => self.link.receive()?,
                // Drain on every wake: frames buffered during negotiation
                // would otherwise sit until the socket stirs again.
                WakeReason::Woken | WakeReason::Timeout => {}
            }

            self.state = WorkerState::Draining;

            let before = self.last_received;
            let ended = self.drain().await?;
            if ended {
                info!(upstream = %self.upstream.name, "data stream ended");
                self.state = WorkerState::Done;
                metrics::set_worker_state(&self.upstream.name, "done");
                return Ok(());
            }

            // Confirm the whole pass at once.
            if self.last_received > before {
                self.acknowledge().await?;
            }
        }

        info!(upstream = %self.upstream.name, "terminate requested, apply worker exiting");
        self.state = WorkerState::Done;
        metrics::set_worker_state(&self.upstream.name, "done");
        Ok(())
    }

    /// Drain buffered frames until the link would block.
    ///
    /// Returns whether the remote ended the stream.
    async fn drain(&mut self) -> Result<bool> {
        loop {
            // Honored between messages only: no torn records.
            if self.shutdown.is_terminated() {
                return Ok(false);
            }
            match self.link.try_next_frame()? {
                Polled::WouldBlock => return Ok(false),
                Polled::Ended => return Ok(true),
                Polled::Frame(frame) => self.handle_frame(&frame).await?,
            }
        }
    }

    async fn handle_frame(&mut self, frame: &[u8]) -> Result<()> {
        match StreamMessage::parse(frame)? {
            StreamMessage::Change { header, payload } => {
                if header.start > self.last_received {
                    self.last_received = header.start;
                }

                let change = Change::parse(payload)?;
                metrics::record_change_received(&self.upstream.name, change.action());

                if change.is_commit() {
                    let delay = self.upstream.apply_delay();
                    if !delay.is_zero() {
                        trace!(
                            upstream = %self.upstream.name,
                            delay_ms = delay.as_millis() as u64,
                            "delaying commit apply"
                        );
                        tokio::time::sleep(delay).await;
                    }
                }

                let handler = Arc::clone(&self.handler);
                dispatch(handler.as_ref(), change).await?;
                metrics::record_change_applied(&self.upstream.name, change.action());
            }
            StreamMessage::Other(tag) => {
                // Other message types are purposely ignored.
                trace!(tag, "ignoring message");
            }
        }
        Ok(())
    }

    /// Report the current position upstream and record it locally.
    async fn acknowledge(&mut self) -> Result<()> {
        let position = self.last_received;
        if self.feedback.report(&mut self.link, position).await? {
            self.store
                .set_position(self.negotiated.origin_id, position)
                .await?;
        }
        metrics::set_last_received(&self.upstream.name, position);
        Ok(())
    }
}
