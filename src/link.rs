//! The duplex connection to an upstream node.
//!
//! [`UpstreamLink`] is the seam between the protocol machinery and a live
//! socket: the negotiator issues control commands through it, the run loop
//! drains buffered stream frames and pushes feedback frames back. Decode
//! correctness is testable against a scripted implementation; [`TcpLink`]
//! is the production one over `tokio::net::TcpStream`.
//!
//! # Read model
//!
//! The run loop never blocks on a frame. It waits (bounded) for the socket
//! to become readable, slurps whatever bytes are available without blocking
//! ([`UpstreamLink::receive`]), then pops complete frames out of the buffer
//! one at a time ([`UpstreamLink::try_next_frame`]) until it runs dry.
//! Partial frames stay buffered across passes.

use crate::error::{ApplyError, Result};
use crate::protocol::{self, ControlResponse, MSG_STREAM_END};
use async_trait::async_trait;
use bytes::BytesMut;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::{debug, trace};

/// Result of a non-blocking request for the next buffered stream frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Polled {
    /// One complete frame payload.
    Frame(Vec<u8>),
    /// Nothing complete is buffered; wait for more input.
    WouldBlock,
    /// The remote ended the stream cleanly.
    Ended,
}

/// A duplex replication connection.
#[async_trait]
pub trait UpstreamLink: Send {
    /// Issue a control command and wait for its single response frame.
    ///
    /// Only valid before the stream acknowledgment; afterwards the
    /// connection speaks stream frames.
    async fn exec(&mut self, command: &str) -> Result<ControlResponse>;

    /// Wait until the connection may have readable data.
    async fn wait_readable(&mut self) -> Result<()>;

    /// Pull available bytes into the frame buffer without blocking.
    fn receive(&mut self) -> Result<()>;

    /// Pop the next buffered stream frame without blocking.
    fn try_next_frame(&mut self) -> Result<Polled>;

    /// Send one raw frame payload to the remote and flush it.
    async fn send(&mut self, payload: &[u8]) -> Result<()>;
}

/// Production link over a TCP socket.
pub struct TcpLink {
    stream: TcpStream,
    addr: String,
    buf: BytesMut,
    eof: bool,
}

impl TcpLink {
    /// Open a replication-mode connection to `addr`.
    ///
    /// Sends the startup command naming the target database; any startup
    /// failure is fatal for the worker.
    pub async fn connect(addr: &str, database: &str) -> Result<TcpLink> {
        let stream = TcpStream::connect(addr)
            .await
            .map_err(|e| ApplyError::Connect {
                addr: addr.to_string(),
                message: e.to_string(),
            })?;

        let mut link = TcpLink {
            stream,
            addr: addr.to_string(),
            buf: BytesMut::with_capacity(8 * 1024),
            eof: false,
        };

        let startup = format!(
            "STARTUP replication=true database=\"{}\" application_name=apply-engine",
            database
        );
        match link.exec(&startup).await? {
            ControlResponse::Tuples(_) => {
                debug!(addr = %link.addr, database, "replication connection established");
                Ok(link)
            }
            ControlResponse::Error { code, message } => Err(ApplyError::Connect {
                addr: link.addr.clone(),
                message: format!("{}, code: {}", message, code),
            }),
            ControlResponse::StreamAck => Err(ApplyError::Protocol(
                "unexpected duplex acknowledgment during startup".to_string(),
            )),
        }
    }

    /// The remote address this link is connected to.
    pub fn addr(&self) -> &str {
        &self.addr
    }

    /// Read until one complete frame is buffered (blocking).
    async fn read_frame(&mut self) -> Result<Vec<u8>> {
        loop {
            if let Some(frame) = protocol::take_frame(&mut self.buf)? {
                return Ok(frame);
            }
            if self.eof {
                return Err(ApplyError::Stream(
                    "connection to other side has died".to_string(),
                ));
            }
            let n = self.stream.read_buf(&mut self.buf).await?;
            if n == 0 {
                self.eof = true;
            }
        }
    }
}

#[async_trait]
impl UpstreamLink for TcpLink {
    async fn exec(&mut self, command: &str) -> Result<ControlResponse> {
        trace!(command, "sending control command");
        let mut out = BytesMut::new();
        protocol::write_frame(&mut out, command.as_bytes());
        self.stream.write_all(&out).await?;
        self.stream.flush().await?;

        let frame = self.read_frame().await?;
        ControlResponse::decode(&frame)
    }

    async fn wait_readable(&mut self) -> Result<()> {
        self.stream.readable().await.map_err(ApplyError::Io)
    }

    fn receive(&mut self) -> Result<()> {
        loop {
            match self.stream.try_read_buf(&mut self.buf) {
                Ok(0) => {
                    self.eof = true;
                    return Ok(());
                }
                Ok(_) => continue,
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => return Ok(()),
                Err(e) => {
                    return Err(ApplyError::Stream(format!("could not read stream data: {}", e)))
                }
            }
        }
    }

    fn try_next_frame(&mut self) -> Result<Polled> {
        if let Some(frame) = protocol::take_frame(&mut self.buf)? {
            if frame.first() == Some(&MSG_STREAM_END) {
                return Ok(Polled::Ended);
            }
            return Ok(Polled::Frame(frame));
        }
        if self.eof {
            // An abrupt close is not a clean stream end.
            return Err(ApplyError::Stream(
                "connection to other side has died".to_string(),
            ));
        }
        Ok(Polled::WouldBlock)
    }

    async fn send(&mut self, payload: &[u8]) -> Result<()> {
        let mut out = BytesMut::new();
        protocol::write_frame(&mut out, payload);
        self.stream.write_all(&out).await?;
        self.stream.flush().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    async fn read_one_frame(stream: &mut TcpStream) -> Vec<u8> {
        let mut buf = BytesMut::new();
        loop {
            if let Some(frame) = protocol::take_frame(&mut buf).unwrap() {
                return frame;
            }
            stream.read_buf(&mut buf).await.unwrap();
        }
    }

    async fn write_one_frame(stream: &mut TcpStream, payload: &[u8]) {
        let mut out = BytesMut::new();
        protocol::write_frame(&mut out, payload);
        stream.write_all(&out).await.unwrap();
    }

    #[tokio::test]
    async fn test_connect_sends_startup_and_execs_commands() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();

        let server = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();

            let startup = read_one_frame(&mut stream).await;
            let startup = String::from_utf8(startup).unwrap();
            assert!(startup.starts_with("STARTUP replication=true"));
            assert!(startup.contains("database=\"appdb\""));
            write_one_frame(&mut stream, &ControlResponse::Tuples(vec![]).encode()).await;

            let cmd = read_one_frame(&mut stream).await;
            assert_eq!(cmd, b"IDENTIFY_SYSTEM");
            let resp = ControlResponse::Error {
                code: "0A000".to_string(),
                message: "not supported".to_string(),
            };
            write_one_frame(&mut stream, &resp.encode()).await;
        });

        let mut link = TcpLink::connect(&addr, "appdb").await.unwrap();
        let resp = link.exec("IDENTIFY_SYSTEM").await.unwrap();
        assert_eq!(
            resp,
            ControlResponse::Error {
                code: "0A000".to_string(),
                message: "not supported".to_string(),
            }
        );

        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_connect_refused_is_fatal() {
        // Bind then drop to get an address nothing listens on.
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        drop(listener);

        let result = TcpLink::connect(&addr, "appdb").await;
        assert!(matches!(result, Err(ApplyError::Connect { .. })));
    }

    #[tokio::test]
    async fn test_stream_end_frame_yields_ended() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();

        let server = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let _startup = read_one_frame(&mut stream).await;
            write_one_frame(&mut stream, &ControlResponse::Tuples(vec![]).encode()).await;
            write_one_frame(&mut stream, &[MSG_STREAM_END]).await;
            stream.flush().await.unwrap();
            // Hold the socket open so EOF is not what the client observes.
            read_one_frame(&mut stream).await
        });

        let mut link = TcpLink::connect(&addr, "appdb").await.unwrap();

        // The end frame may already be buffered from the startup read, so
        // poll the buffer before waiting on the socket.
        let polled = loop {
            link.receive().unwrap();
            match link.try_next_frame().unwrap() {
                Polled::WouldBlock => link.wait_readable().await.unwrap(),
                other => break other,
            }
        };
        assert_eq!(polled, Polled::Ended);

        link.send(b"bye").await.unwrap();
        assert_eq!(server.await.unwrap(), b"bye");
    }

    #[tokio::test]
    async fn test_abrupt_close_is_a_stream_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();

        let server = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let _startup = read_one_frame(&mut stream).await;
            write_one_frame(&mut stream, &ControlResponse::Tuples(vec![]).encode()).await;
            // Drop without ending the stream.
        });

        let mut link = TcpLink::connect(&addr, "appdb").await.unwrap();
        server.await.unwrap();

        // Drain until the EOF surfaces as a fatal stream error.
        let err = loop {
            link.receive().unwrap();
            match link.try_next_frame() {
                Ok(Polled::WouldBlock) => link.wait_readable().await.unwrap(),
                Ok(other) => panic!("expected stream error, got {:?}", other),
                Err(e) => break e,
            }
        };
        assert!(matches!(err, ApplyError::Stream(_)));
    }
}
