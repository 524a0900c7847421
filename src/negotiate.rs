//! Connection negotiation: identity checks, origin acquisition, stream start.
//!
//! Runs once per worker at startup. Produces the negotiated upstream state
//! (origin id, start position, slot name) or fails fatally — there is no
//! retry here; the host process manager restarts the worker.
//!
//! # Sequence
//!
//! 1. Identification request; the response must be exactly one row of four
//!    fields (node id, timeline, database name, database id).
//! 2. Self-loop refusal: identical remote/local node ids fail before any
//!    slot or origin is created.
//! 3. Slot-name derivation from the five-part key space.
//! 4. Origin lookup; on a miss, durable local create followed by the remote
//!    initialize-stream request, with a compensating delete when the remote
//!    side refuses.
//! 5. Start-stream request at the stored position; anything but the duplex
//!    acknowledgment is fatal.

use crate::config::{LocalNodeConfig, UpstreamConfig};
use crate::error::{ApplyError, Result};
use crate::link::UpstreamLink;
use crate::metrics;
use crate::position::{OriginId, OriginIdentity, PositionStore};
use crate::protocol::{ControlResponse, StreamPosition, IDENTIFY_SYSTEM};
use std::str::FromStr;
use tracing::info;

/// Maximum slot-name length in bytes; longer derivations are truncated.
pub const SLOT_NAME_MAX_BYTES: usize = 63;

/// The remote node's identity, as reported by the identification request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RemoteIdentity {
    pub node_id: u64,
    pub timeline: u32,
    pub database_id: u32,
}

/// Everything negotiation produces; immutable for the worker's lifetime.
#[derive(Debug, Clone)]
pub struct NegotiatedUpstream {
    /// Local origin id assigned to this remote change source.
    pub origin_id: OriginId,
    /// Position replay resumes from (0 for a fresh origin).
    pub start_position: StreamPosition,
    /// Name of the remote-side retained-log slot.
    pub slot_name: String,
    /// The verified remote identity.
    pub remote: RemoteIdentity,
}

/// Derive the slot name retained on the remote side for this origin.
///
/// Pure function of its five inputs. Truncation to [`SLOT_NAME_MAX_BYTES`]
/// is deterministic: identical inputs always yield the identical name. A
/// long origin name can push two distinct tuples past the cap into the same
/// name; keep origin names short.
pub fn derive_slot_name(
    remote_database_id: u32,
    local_node_id: u64,
    local_timeline: u32,
    local_database_id: u32,
    origin_name: &str,
) -> String {
    let mut name = format!(
        "apply:{}:{}-{}-{}:{}",
        remote_database_id, local_node_id, local_timeline, local_database_id, origin_name
    );
    if name.len() > SLOT_NAME_MAX_BYTES {
        let mut end = SLOT_NAME_MAX_BYTES;
        while !name.is_char_boundary(end) {
            end -= 1;
        }
        name.truncate(end);
    }
    name
}

fn parse_identity_field<T: FromStr>(field: &'static str, value: &str) -> Result<T> {
    value
        .trim()
        .parse()
        .map_err(|_| ApplyError::IdentityParse {
            field,
            value: value.to_string(),
        })
}

fn remote_detail(code: &str, message: &str) -> String {
    if code.is_empty() {
        message.to_string()
    } else {
        format!("{}, code: {}", message, code)
    }
}

/// Negotiate identity and start streaming on an open replication connection.
///
/// On success the link is in stream mode and the returned state names the
/// origin, slot and resume position. Every failure is fatal and leaves no
/// origin behind that the remote side doesn't know about — except the
/// documented window below.
///
/// Acquiring the identity really safely would need two-phase commit across
/// the local store and the remote node. Instead the origin is created
/// durably first and the remote initialize-stream request issued second,
/// with a best-effort compensating delete if the remote refuses. A crash
/// between the durable create and the remote request leaves an origin whose
/// slot never came to exist; start-stream then fails on every restart until
/// an operator drops the origin row or creates the slot by hand.
pub async fn negotiate<L, S>(
    link: &mut L,
    store: &S,
    local: &LocalNodeConfig,
    upstream: &UpstreamConfig,
) -> Result<NegotiatedUpstream>
where
    L: UpstreamLink,
    S: PositionStore + ?Sized,
{
    info!(
        upstream = %upstream.name,
        database = %local.database,
        addr = %upstream.addr,
        "apply worker initialized"
    );

    let remote = identify_remote(link, local).await?;

    let slot_name = derive_slot_name(
        remote.database_id,
        local.node_id,
        local.timeline,
        local.database_id,
        &upstream.origin_name,
    );

    let identity = OriginIdentity {
        remote_node_id: remote.node_id,
        remote_timeline: remote.timeline,
        remote_database_id: remote.database_id,
        origin_name: upstream.origin_name.clone(),
    };

    let origin_id = match store.lookup(&identity).await? {
        Some(origin) => {
            info!(origin = %origin, "found existing origin");
            origin
        }
        None => {
            info!("origin lookup failed, creating a new identity");
            acquire_origin(link, store, &identity, &slot_name).await?
        }
    };

    let start_position = store.start_position(origin_id).await?;

    info!(
        origin = %origin_id,
        position = start_position,
        slot = %slot_name,
        "starting up replication"
    );

    let command = format!("START_STREAM \"{}\" {}", slot_name, start_position);
    match link.exec(&command).await? {
        ControlResponse::StreamAck => {}
        ControlResponse::Error { code, message } => {
            return Err(ApplyError::Remote {
                command: "START_STREAM".to_string(),
                detail: remote_detail(&code, &message),
            });
        }
        ControlResponse::Tuples(_) => {
            return Err(ApplyError::Protocol(
                "expected duplex stream acknowledgment for START_STREAM".to_string(),
            ));
        }
    }

    metrics::record_negotiated(&upstream.name);

    Ok(NegotiatedUpstream {
        origin_id,
        start_position,
        slot_name,
        remote,
    })
}

/// Issue the identification request and verify the identities differ.
async fn identify_remote<L: UpstreamLink>(
    link: &mut L,
    local: &LocalNodeConfig,
) -> Result<RemoteIdentity> {
    let rows = match link.exec(IDENTIFY_SYSTEM).await? {
        ControlResponse::Tuples(rows) => rows,
        ControlResponse::Error { code, message } => {
            return Err(ApplyError::Remote {
                command: IDENTIFY_SYSTEM.to_string(),
                detail: remote_detail(&code, &message),
            });
        }
        ControlResponse::StreamAck => {
            return Err(ApplyError::Protocol(
                "unexpected duplex acknowledgment for IDENTIFY_SYSTEM".to_string(),
            ));
        }
    };

    if rows.len() != 1 || rows[0].len() != 4 {
        return Err(ApplyError::Protocol(format!(
            "could not identify system: got {} rows and {} fields, expected 1 rows and 4 fields",
            rows.len(),
            rows.first().map_or(0, |r| r.len())
        )));
    }

    let row = &rows[0];
    let node_id: u64 = parse_identity_field("node id", &row[0])?;
    let timeline: u32 = parse_identity_field("timeline id", &row[1])?;
    // row[2] is the remote database name; unused here.
    let database_id: u32 = parse_identity_field("database id", &row[3])?;

    // The self-loop check must precede any slot or origin creation.
    if node_id == local.node_id {
        return Err(ApplyError::SelfConnection {
            node_id: local.node_id,
        });
    }
    info!(local = local.node_id, remote = node_id, "node identities verified");

    Ok(RemoteIdentity {
        node_id,
        timeline,
        database_id,
    })
}

/// Durably create the origin, then ask the remote for its slot.
async fn acquire_origin<L, S>(
    link: &mut L,
    store: &S,
    identity: &OriginIdentity,
    slot_name: &str,
) -> Result<OriginId>
where
    L: UpstreamLink,
    S: PositionStore + ?Sized,
{
    let origin = store.create(identity).await?;

    let command = format!("INIT_STREAM \"{}\"", slot_name);
    let failure = match link.exec(&command).await {
        Ok(ControlResponse::Tuples(_)) => None,
        Ok(ControlResponse::Error { code, message }) => Some(ApplyError::Remote {
            command: "INIT_STREAM".to_string(),
            detail: remote_detail(&code, &message),
        }),
        Ok(ControlResponse::StreamAck) => Some(ApplyError::Protocol(
            "unexpected duplex acknowledgment for INIT_STREAM".to_string(),
        )),
        Err(e) => Some(e),
    };

    if let Some(err) = failure {
        // Undo the local create so the failed acquisition leaves nothing
        // behind; best effort, the error below is what matters.
        let _ = store.delete(origin).await;
        return Err(err);
    }

    info!(origin = %origin, slot = %slot_name, "created origin and remote slot");
    Ok(origin)
}
