//! Progress acknowledgment back upstream.
//!
//! The reporter sends one fixed-length feedback frame per position advance,
//! deduplicated by position: asking it to report the position it last sent
//! is a no-op, never an error. Send failures are fatal — without a live
//! feedback channel the worker would silently drift out of sync with the
//! sender, so it exits and lets the host restart it.
//!
//! The frame reports identical write/flush/apply positions; durability-tier
//! tracking is deliberately not inferred (see DESIGN.md).

use crate::error::{ApplyError, Result};
use crate::link::UpstreamLink;
use crate::metrics;
use crate::protocol::{FeedbackFrame, StreamPosition};
use tracing::{debug, info};

/// Encodes and sends progress-acknowledgment frames, deduplicated by
/// position.
pub struct FeedbackReporter {
    /// Upstream name, for logs and metric labels.
    upstream: String,
    /// Last position actually sent; `None` until the first send.
    last_sent: Option<StreamPosition>,
    /// Whether frames ask the remote for a reply.
    reply_requested: bool,
}

impl FeedbackReporter {
    /// Create a reporter for one upstream.
    pub fn new(upstream: &str, reply_requested: bool) -> Self {
        Self {
            upstream: upstream.to_string(),
            last_sent: None,
            reply_requested,
        }
    }

    /// The last position sent, if any.
    pub fn last_sent(&self) -> Option<StreamPosition> {
        self.last_sent
    }

    /// Send a feedback frame for `position` unless it was already sent.
    ///
    /// Returns whether a frame actually went out.
    pub async fn report<L: UpstreamLink>(
        &mut self,
        link: &mut L,
        position: StreamPosition,
    ) -> Result<bool> {
        if self.last_sent == Some(position) {
            debug!(upstream = %self.upstream, position, "feedback position unchanged, skipping");
            metrics::record_feedback_deduped(&self.upstream);
            return Ok(false);
        }

        let frame = FeedbackFrame {
            position,
            send_time_micros: chrono::Utc::now().timestamp_micros(),
            reply_requested: self.reply_requested,
        };

        info!(upstream = %self.upstream, position, "sending feedback");

        link.send(&frame.encode())
            .await
            .map_err(|e| ApplyError::Feedback(e.to_string()))?;

        self.last_sent = Some(position);
        metrics::record_feedback_sent(&self.upstream);
        Ok(true)
    }
}
