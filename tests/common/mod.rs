// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Test doubles for the upstream node and the apply layer.
//!
//! [`MockUpstream`] is a scripted in-process TCP server speaking the real
//! wire protocol, so integration tests exercise `TcpLink` end to end.
//! [`ScriptedLink`] is an in-memory `UpstreamLink` for driving the worker
//! deterministically without sockets (used by the property tests).

#![allow(dead_code)]

use apply_engine::apply::{ApplyHandler, BoxFuture};
use apply_engine::link::{Polled, UpstreamLink};
use apply_engine::position::{OriginId, OriginIdentity, PositionStore};
use apply_engine::protocol::{
    self, ChangeHeader, ControlResponse, FeedbackFrame, StreamPosition, INVALID_POSITION,
    MSG_CHANGE, MSG_KEEPALIVE, MSG_STREAM_END,
};
use apply_engine::{ApplyError, Result};
use async_trait::async_trait;
use bytes::BytesMut;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

/// Build a change-data stream frame at `position`.
pub fn change_frame(position: u64, action: u8, payload: &[u8]) -> Vec<u8> {
    let header = ChangeHeader {
        start: position,
        end: position,
        send_time_micros: 0,
    };
    let mut frame = vec![MSG_CHANGE];
    frame.extend_from_slice(&header.encode());
    frame.push(action);
    frame.extend_from_slice(payload);
    frame
}

/// Build a keepalive stream frame.
pub fn keepalive_frame() -> Vec<u8> {
    vec![MSG_KEEPALIVE, 0, 0, 0]
}

/// One step of the mock's stream phase: send frames, then optionally block
/// until the client acknowledges.
pub struct Batch {
    pub frames: Vec<Vec<u8>>,
    pub expect_feedback: bool,
}

/// What the mock upstream answers and streams.
pub struct MockScript {
    /// Textual identification fields: node id, timeline, database name,
    /// database id.
    pub identify_rows: Vec<Vec<String>>,
    pub init_response: ControlResponse,
    pub start_response: ControlResponse,
    pub batches: Vec<Batch>,
    /// Send the end-of-stream frame after the last batch.
    pub end_stream: bool,
}

impl MockScript {
    /// A healthy remote with the given node id and nothing to stream.
    pub fn healthy(node_id: &str) -> Self {
        Self {
            identify_rows: vec![vec![
                node_id.to_string(),
                "1".to_string(),
                "appdb".to_string(),
                "16384".to_string(),
            ]],
            init_response: ControlResponse::Tuples(vec![]),
            start_response: ControlResponse::StreamAck,
            batches: Vec::new(),
            end_stream: true,
        }
    }
}

/// A scripted in-process upstream node.
pub struct MockUpstream {
    addr: String,
    /// Every control command received, in order.
    pub commands: Arc<Mutex<Vec<String>>>,
    /// Every feedback frame received, in order.
    pub feedbacks: Arc<Mutex<Vec<FeedbackFrame>>>,
    handle: tokio::task::JoinHandle<()>,
}

impl MockUpstream {
    /// Bind a listener, spawn the server task, and return the handle.
    pub async fn spawn(script: MockScript) -> MockUpstream {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let commands = Arc::new(Mutex::new(Vec::new()));
        let feedbacks = Arc::new(Mutex::new(Vec::new()));

        let task_commands = Arc::clone(&commands);
        let task_feedbacks = Arc::clone(&feedbacks);
        let handle = tokio::spawn(async move {
            let (stream, _) = match listener.accept().await {
                Ok(conn) => conn,
                Err(_) => return,
            };
            // Client dropping early just ends the task.
            let _ = serve(stream, script, task_commands, task_feedbacks).await;
        });

        MockUpstream {
            addr,
            commands,
            feedbacks,
            handle,
        }
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    pub fn commands(&self) -> Vec<String> {
        self.commands.lock().unwrap().clone()
    }

    pub fn feedbacks(&self) -> Vec<FeedbackFrame> {
        self.feedbacks.lock().unwrap().clone()
    }

    /// Wait for the server task to finish (client closed the connection).
    pub async fn finished(&mut self) {
        let _ = (&mut self.handle).await;
    }
}

async fn read_frame(stream: &mut TcpStream, buf: &mut BytesMut) -> std::io::Result<Vec<u8>> {
    loop {
        if let Ok(Some(frame)) = protocol::take_frame(buf) {
            return Ok(frame);
        }
        let n = stream.read_buf(buf).await?;
        if n == 0 {
            return Err(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "client closed",
            ));
        }
    }
}

async fn write_frame(stream: &mut TcpStream, payload: &[u8]) -> std::io::Result<()> {
    let mut out = BytesMut::new();
    protocol::write_frame(&mut out, payload);
    stream.write_all(&out).await?;
    stream.flush().await
}

async fn serve(
    mut stream: TcpStream,
    script: MockScript,
    commands: Arc<Mutex<Vec<String>>>,
    feedbacks: Arc<Mutex<Vec<FeedbackFrame>>>,
) -> std::io::Result<()> {
    let mut buf = BytesMut::new();

    // Control phase: answer commands until streaming starts.
    loop {
        let frame = read_frame(&mut stream, &mut buf).await?;
        let command = String::from_utf8_lossy(&frame).to_string();
        commands.lock().unwrap().push(command.clone());

        if command.starts_with("STARTUP") {
            write_frame(&mut stream, &ControlResponse::Tuples(vec![]).encode()).await?;
        } else if command == "IDENTIFY_SYSTEM" {
            let resp = ControlResponse::Tuples(script.identify_rows.clone());
            write_frame(&mut stream, &resp.encode()).await?;
        } else if command.starts_with("INIT_STREAM") {
            write_frame(&mut stream, &script.init_response.encode()).await?;
        } else if command.starts_with("START_STREAM") {
            write_frame(&mut stream, &script.start_response.encode()).await?;
            if script.start_response == ControlResponse::StreamAck {
                break;
            }
        } else {
            let resp = ControlResponse::Error {
                code: "42601".to_string(),
                message: format!("unknown command: {}", command),
            };
            write_frame(&mut stream, &resp.encode()).await?;
        }
    }

    // Stream phase.
    for batch in &script.batches {
        for frame in &batch.frames {
            write_frame(&mut stream, frame).await?;
        }
        if batch.expect_feedback {
            let frame = read_frame(&mut stream, &mut buf).await?;
            if let Ok(feedback) = FeedbackFrame::decode(&frame) {
                feedbacks.lock().unwrap().push(feedback);
            }
        }
    }

    if script.end_stream {
        write_frame(&mut stream, &[MSG_STREAM_END]).await?;
    }

    // Keep reading (late feedback) until the client hangs up.
    loop {
        let frame = read_frame(&mut stream, &mut buf).await?;
        if let Ok(feedback) = FeedbackFrame::decode(&frame) {
            feedbacks.lock().unwrap().push(feedback);
        }
    }
}

/// In-memory link delivering frames in batches, one batch per wait/drain
/// pass, then ending the stream cleanly.
pub struct ScriptedLink {
    batches: VecDeque<Vec<Vec<u8>>>,
    current: VecDeque<Vec<u8>>,
    end_armed: bool,
    /// Every frame the worker sent (feedback). Shared so it stays readable
    /// after the worker consumes the link.
    sent: Arc<Mutex<Vec<Vec<u8>>>>,
}

impl ScriptedLink {
    pub fn new(batches: Vec<Vec<Vec<u8>>>) -> Self {
        Self {
            batches: batches.into_iter().collect(),
            current: VecDeque::new(),
            end_armed: false,
            sent: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Handle onto the sent-frame log; clone before handing the link to a
    /// worker.
    pub fn sent_handle(&self) -> Arc<Mutex<Vec<Vec<u8>>>> {
        Arc::clone(&self.sent)
    }
}

/// Decode a sent-frame log into feedback frames.
pub fn decode_feedback(frames: &[Vec<u8>]) -> Vec<FeedbackFrame> {
    frames
        .iter()
        .map(|f| FeedbackFrame::decode(f).unwrap())
        .collect()
}

#[async_trait]
impl UpstreamLink for ScriptedLink {
    async fn exec(&mut self, _command: &str) -> Result<ControlResponse> {
        Err(ApplyError::Protocol(
            "scripted link is already in stream mode".to_string(),
        ))
    }

    async fn wait_readable(&mut self) -> Result<()> {
        Ok(())
    }

    fn receive(&mut self) -> Result<()> {
        if self.current.is_empty() {
            if let Some(batch) = self.batches.pop_front() {
                self.current = batch.into_iter().collect();
            }
        }
        Ok(())
    }

    fn try_next_frame(&mut self) -> Result<Polled> {
        if let Some(frame) = self.current.pop_front() {
            if frame.first() == Some(&MSG_STREAM_END) {
                return Ok(Polled::Ended);
            }
            return Ok(Polled::Frame(frame));
        }
        if self.batches.is_empty() {
            if self.end_armed {
                return Ok(Polled::Ended);
            }
            // One more pass so feedback for the final batch goes out first.
            self.end_armed = true;
            return Ok(Polled::WouldBlock);
        }
        Ok(Polled::WouldBlock)
    }

    async fn send(&mut self, payload: &[u8]) -> Result<()> {
        self.sent.lock().unwrap().push(payload.to_vec());
        Ok(())
    }
}

/// In-memory position store that logs every `set_position` call.
#[derive(Default)]
pub struct MemoryPositionStore {
    origins: Mutex<HashMap<OriginIdentity, OriginId>>,
    log: Mutex<Vec<(OriginId, StreamPosition)>>,
    next_id: AtomicU32,
}

impl MemoryPositionStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Positions recorded for an origin, in call order.
    pub fn position_log(&self, origin: OriginId) -> Vec<StreamPosition> {
        self.log
            .lock()
            .unwrap()
            .iter()
            .filter(|(id, _)| *id == origin)
            .map(|(_, p)| *p)
            .collect()
    }
}

#[async_trait]
impl PositionStore for MemoryPositionStore {
    async fn lookup(&self, identity: &OriginIdentity) -> Result<Option<OriginId>> {
        Ok(self.origins.lock().unwrap().get(identity).copied())
    }

    async fn create(&self, identity: &OriginIdentity) -> Result<OriginId> {
        let id = OriginId(self.next_id.fetch_add(1, Ordering::SeqCst) + 1);
        self.origins.lock().unwrap().insert(identity.clone(), id);
        Ok(id)
    }

    async fn delete(&self, origin: OriginId) -> Result<()> {
        self.origins.lock().unwrap().retain(|_, id| *id != origin);
        self.log.lock().unwrap().retain(|(id, _)| *id != origin);
        Ok(())
    }

    async fn start_position(&self, origin: OriginId) -> Result<StreamPosition> {
        Ok(self
            .position_log(origin)
            .last()
            .copied()
            .unwrap_or(INVALID_POSITION))
    }

    async fn set_position(&self, origin: OriginId, position: StreamPosition) -> Result<()> {
        self.log.lock().unwrap().push((origin, position));
        Ok(())
    }
}

/// Apply handler recording every call for ordering assertions.
#[derive(Default)]
pub struct RecordingApply {
    calls: Mutex<Vec<String>>,
}

impl RecordingApply {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    fn record(&self, call: String) {
        self.calls.lock().unwrap().push(call);
    }
}

impl ApplyHandler for RecordingApply {
    fn begin<'a>(&'a self, _payload: &'a [u8]) -> BoxFuture<'a, ()> {
        Box::pin(async move {
            self.record("begin".to_string());
            Ok(())
        })
    }

    fn commit<'a>(&'a self, _payload: &'a [u8]) -> BoxFuture<'a, ()> {
        Box::pin(async move {
            self.record("commit".to_string());
            Ok(())
        })
    }

    fn insert<'a>(&'a self, payload: &'a [u8]) -> BoxFuture<'a, ()> {
        Box::pin(async move {
            self.record(format!("insert({})", String::from_utf8_lossy(payload)));
            Ok(())
        })
    }

    fn update<'a>(&'a self, payload: &'a [u8]) -> BoxFuture<'a, ()> {
        Box::pin(async move {
            self.record(format!("update({})", String::from_utf8_lossy(payload)));
            Ok(())
        })
    }

    fn delete<'a>(&'a self, payload: &'a [u8]) -> BoxFuture<'a, ()> {
        Box::pin(async move {
            self.record(format!("delete({})", String::from_utf8_lossy(payload)));
            Ok(())
        })
    }
}
