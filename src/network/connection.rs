//! Connection handling for VNOC
//!
//! Manages one accepted socket, including:
//! - Frame reassembly from partial reads
//! - Dispatching decoded messages
//! - Ordered reply writes, including deferred replies
//! - Connection state management

use bytes::{Buf, Bytes};
use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::Arc;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::watch;

use crate::dispatch::{DeferredReply, Dispatcher, Reply};
use crate::protocol::{DecodeResult, FrameCodec, FrameReader, MalformedReason, Message, ReadMessage};

/// Connection errors
#[derive(Error, Debug)]
pub enum ConnectionError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Malformed frame: {0}")]
    Malformed(#[from] MalformedReason),

    #[error("Connection closed")]
    Closed,
}

pub type ConnectionResult<T> = Result<T, ConnectionError>;

/// State of a connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Socket accepted, event loop not yet running
    Connecting,
    /// Reading and writing independently
    Open,
    /// Tearing down; no further application data is written
    Closing,
    /// Socket released
    Closed,
}

/// Connection statistics
#[derive(Debug, Default, Clone)]
pub struct ConnectionStats {
    /// Frames decoded
    pub frames_received: u64,
    /// Reply frames fully written
    pub replies_sent: u64,
    /// Bytes sent
    pub bytes_sent: u64,
    /// Bytes received
    pub bytes_received: u64,
    /// Messages that were dropped by the dispatcher
    pub dispatch_errors: u64,
}

/// Replies a connection may hold before it stops reading
pub const DEFAULT_MAX_PENDING_REPLIES: usize = 64;

/// An entry in the write queue
enum Outbound {
    /// Encoded frame; partially written frames keep their unwritten tail
    Ready(Bytes),
    /// Reply still being produced by another task
    Pending(DeferredReply),
}

/// One peer connection driven by its own task
pub struct Connection<S> {
    /// Server-assigned identifier
    id: u64,
    /// Remote peer address
    remote_addr: SocketAddr,
    reader: ReadHalf<S>,
    writer: WriteHalf<S>,
    /// Read buffer and decoder
    frames: FrameReader,
    /// Encoder for replies
    codec: FrameCodec,
    /// Replies in dispatch order
    outbound: VecDeque<Outbound>,
    /// Reading and decoding pause while this many replies are queued
    max_pending_replies: usize,
    dispatcher: Arc<Dispatcher>,
    /// Connection state
    state: ConnectionState,
    /// Statistics
    stats: ConnectionStats,
}

impl<S> Connection<S>
where
    S: AsyncRead + AsyncWrite,
{
    /// Create a new connection from an established stream
    pub fn new(
        id: u64,
        stream: S,
        remote_addr: SocketAddr,
        dispatcher: Arc<Dispatcher>,
        codec: FrameCodec,
    ) -> Self {
        let (reader, writer) = tokio::io::split(stream);
        Self {
            id,
            remote_addr,
            reader,
            writer,
            frames: FrameReader::new(codec),
            codec,
            outbound: VecDeque::new(),
            max_pending_replies: DEFAULT_MAX_PENDING_REPLIES,
            dispatcher,
            state: ConnectionState::Connecting,
            stats: ConnectionStats::default(),
        }
    }

    /// Limit the write queue; at least one reply is always allowed
    pub fn with_max_pending_replies(mut self, limit: usize) -> Self {
        self.max_pending_replies = limit.max(1);
        self
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// Get the remote address
    pub fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }

    /// Get the current connection state
    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Get connection statistics
    pub fn stats(&self) -> &ConnectionStats {
        &self.stats
    }

    /// Drive the connection until the peer leaves, an error occurs, or
    /// `shutdown` is set. The connection is always `Closed` on return.
    pub async fn run(&mut self, mut shutdown: watch::Receiver<bool>) -> ConnectionResult<()> {
        self.state = ConnectionState::Open;
        tracing::debug!("Connection {} open ({})", self.id, self.remote_addr);

        let result = self.event_loop(&mut shutdown).await;
        if let Err(e) = &result {
            tracing::warn!("Connection {} ({}) failed: {}", self.id, self.remote_addr, e);
        }

        self.close().await;
        result
    }

    async fn event_loop(&mut self, shutdown: &mut watch::Receiver<bool>) -> ConnectionResult<()> {
        let mut reading = true;

        loop {
            if *shutdown.borrow() {
                tracing::debug!("Connection {} closing on server request", self.id);
                return Ok(());
            }

            // Peer finished sending and every reply has gone out
            if !reading && self.outbound.is_empty() {
                return Ok(());
            }

            let queue_full = self.outbound.len() >= self.max_pending_replies;

            tokio::select! {
                read = self.reader.read_buf(self.frames.buffer_mut()), if reading && !queue_full => {
                    match read? {
                        0 => {
                            self.frames.finish()?;
                            tracing::debug!("Connection {}: peer finished sending", self.id);
                            reading = false;
                        }
                        n => {
                            self.stats.bytes_received += n as u64;
                            self.process_frames()?;
                        }
                    }
                }
                written = drive_write(&mut self.writer, &mut self.outbound, &self.codec, &mut self.stats),
                    if !self.outbound.is_empty() => {
                    written?;
                    // Frames left buffered while the queue was full
                    self.process_frames()?;
                }
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        // Server dropped its side; treat as a close request
                        return Ok(());
                    }
                }
            }
        }
    }

    /// Decode buffered frames until the buffer runs dry or the write queue is full.
    ///
    /// Whenever the queue has room, no complete frame is left in the buffer.
    fn process_frames(&mut self) -> ConnectionResult<()> {
        while self.outbound.len() < self.max_pending_replies {
            match self.frames.next_message() {
                DecodeResult::Incomplete => return Ok(()),
                DecodeResult::Malformed(reason) => return Err(ConnectionError::Malformed(reason)),
                DecodeResult::Ok(message, consumed) => {
                    self.stats.frames_received += 1;
                    tracing::debug!(
                        "Connection {}: frame {:#04x} ({} bytes)",
                        self.id,
                        message.instruction(),
                        consumed
                    );
                    self.dispatch(message);
                }
            }
        }
        Ok(())
    }

    fn dispatch(&mut self, message: Message) {
        match self.dispatcher.dispatch(message) {
            Ok(Reply::None) => {}
            Ok(Reply::Now(reply)) => self.enqueue(reply),
            Ok(Reply::Later(deferred)) => self.outbound.push_back(Outbound::Pending(deferred)),
            Err(e) => {
                self.stats.dispatch_errors += 1;
                tracing::warn!("Connection {}: {}", self.id, e);
            }
        }
    }

    fn enqueue(&mut self, reply: Message) {
        match self.codec.encode(&reply) {
            Ok(bytes) => self.outbound.push_back(Outbound::Ready(bytes)),
            Err(e) => {
                self.stats.dispatch_errors += 1;
                tracing::error!(
                    "Connection {}: dropping reply {:#04x}: {}",
                    self.id,
                    reply.instruction(),
                    e
                );
            }
        }
    }

    /// Discard unwritten replies and release the socket
    async fn close(&mut self) {
        self.state = ConnectionState::Closing;

        if !self.outbound.is_empty() {
            tracing::debug!(
                "Connection {}: discarding {} queued replies",
                self.id,
                self.outbound.len()
            );
            self.outbound.clear();
        }

        if let Err(e) = self.writer.shutdown().await {
            tracing::debug!("Connection {}: shutdown error: {}", self.id, e);
        }

        self.state = ConnectionState::Closed;
        tracing::info!(
            "Connection {} closed ({}): {} frames in, {} replies out",
            self.id,
            self.remote_addr,
            self.stats.frames_received,
            self.stats.replies_sent
        );
    }
}

/// Make progress on the head of the write queue.
///
/// Cancel safe: a partial write leaves its remainder at the head and a
/// pending deferred reply stays pending.
async fn drive_write<W>(
    writer: &mut W,
    outbound: &mut VecDeque<Outbound>,
    codec: &FrameCodec,
    stats: &mut ConnectionStats,
) -> ConnectionResult<()>
where
    W: AsyncWrite + Unpin,
{
    let Some(front) = outbound.front_mut() else {
        return Ok(());
    };

    if let Outbound::Pending(deferred) = front {
        match deferred.wait().await {
            Some(reply) => match codec.encode(&reply) {
                Ok(bytes) => *front = Outbound::Ready(bytes),
                Err(e) => {
                    tracing::error!("Dropping deferred reply {:#04x}: {}", reply.instruction(), e);
                    stats.dispatch_errors += 1;
                    outbound.pop_front();
                    return Ok(());
                }
            },
            None => {
                tracing::warn!("Deferred reply abandoned by its handler");
                outbound.pop_front();
                return Ok(());
            }
        }
    }

    if let Some(Outbound::Ready(bytes)) = outbound.front_mut() {
        let n = writer.write(&bytes[..]).await?;
        if n == 0 {
            return Err(std::io::Error::from(std::io::ErrorKind::WriteZero).into());
        }
        bytes.advance(n);
        stats.bytes_sent += n as u64;

        if bytes.is_empty() {
            outbound.pop_front();
            stats.replies_sent += 1;
            writer.flush().await?;
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::HandlerResult;
    use std::time::Duration;
    use tokio::io::{duplex, AsyncReadExt, AsyncWriteExt};

    const ECHO: u8 = 0x03;
    const SLOW: u8 = 0x10;

    fn peer() -> SocketAddr {
        "127.0.0.1:4000".parse().unwrap()
    }

    fn dispatcher() -> Arc<Dispatcher> {
        let mut dispatcher = Dispatcher::new();
        dispatcher.register(ECHO, |request: Message| -> HandlerResult {
            Ok(Reply::Now(request.into_reply(ECHO + 1)))
        });
        dispatcher.register(SLOW, |request: Message| -> HandlerResult {
            let (tx, reply) = Reply::deferred();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(30)).await;
                let _ = tx.send(request.into_reply(SLOW + 1));
            });
            Ok(reply)
        });
        Arc::new(dispatcher)
    }

    fn frame(message: &Message) -> Bytes {
        FrameCodec::new().encode(message).unwrap()
    }

    /// Read frames from `stream` until `count` messages have arrived
    async fn read_messages<R: AsyncRead + Unpin>(stream: &mut R, count: usize) -> Vec<Message> {
        let mut reader = FrameReader::new(FrameCodec::new());
        let mut messages = Vec::new();
        while messages.len() < count {
            let n = stream.read_buf(reader.buffer_mut()).await.unwrap();
            assert!(n > 0, "stream closed early");
            while let DecodeResult::Ok(message, _) = reader.next_message() {
                messages.push(message);
            }
        }
        messages
    }

    #[tokio::test]
    async fn test_request_reply() {
        let request = Message::new(ECHO).with("user", "alice");
        let reply = request.clone().into_reply(ECHO + 1);

        let mock = tokio_test::io::Builder::new()
            .read(&frame(&request))
            .write(&frame(&reply))
            .build();

        let (_tx, rx) = watch::channel(false);
        let mut conn = Connection::new(1, mock, peer(), dispatcher(), FrameCodec::new());
        assert_eq!(conn.state(), ConnectionState::Connecting);

        conn.run(rx).await.unwrap();
        assert_eq!(conn.state(), ConnectionState::Closed);
        assert_eq!(conn.stats().frames_received, 1);
        assert_eq!(conn.stats().replies_sent, 1);
    }

    #[tokio::test]
    async fn test_frame_split_across_reads() {
        let request = Message::new(ECHO).with("data", vec![1u8, 2, 3, 4, 5]);
        let bytes = frame(&request);
        let reply = request.clone().into_reply(ECHO + 1);

        let mock = tokio_test::io::Builder::new()
            .read(&bytes[..2])
            .read(&bytes[2..9])
            .read(&bytes[9..])
            .write(&frame(&reply))
            .build();

        let (_tx, rx) = watch::channel(false);
        let mut conn = Connection::new(2, mock, peer(), dispatcher(), FrameCodec::new());
        conn.run(rx).await.unwrap();
        assert_eq!(conn.stats().frames_received, 1);
    }

    #[tokio::test]
    async fn test_unknown_instruction_is_skipped() {
        let unknown = Message::new(0x7F).with("x", 1u32);
        let request = Message::new(ECHO).with("y", 2u32);

        let mut input = frame(&unknown).to_vec();
        input.extend_from_slice(&frame(&request));

        let mock = tokio_test::io::Builder::new()
            .read(&input)
            .write(&frame(&request.clone().into_reply(ECHO + 1)))
            .build();

        let (_tx, rx) = watch::channel(false);
        let mut conn = Connection::new(3, mock, peer(), dispatcher(), FrameCodec::new());
        conn.run(rx).await.unwrap();
        assert_eq!(conn.stats().frames_received, 2);
        assert_eq!(conn.stats().dispatch_errors, 1);
        assert_eq!(conn.stats().replies_sent, 1);
    }

    #[tokio::test]
    async fn test_malformed_frame_closes() {
        let mock = tokio_test::io::Builder::new().read(b"XYZ").build();

        let (_tx, rx) = watch::channel(false);
        let mut conn = Connection::new(4, mock, peer(), dispatcher(), FrameCodec::new());
        let err = conn.run(rx).await.unwrap_err();
        assert!(matches!(err, ConnectionError::Malformed(MalformedReason::InvalidMagic)));
        assert_eq!(conn.state(), ConnectionState::Closed);
    }

    #[tokio::test]
    async fn test_eof_inside_frame() {
        let bytes = frame(&Message::new(ECHO).with("user", "alice"));
        let mock = tokio_test::io::Builder::new()
            .read(&bytes[..bytes.len() - 1])
            .build();

        let (_tx, rx) = watch::channel(false);
        let mut conn = Connection::new(5, mock, peer(), dispatcher(), FrameCodec::new());
        let err = conn.run(rx).await.unwrap_err();
        assert!(matches!(err, ConnectionError::Malformed(MalformedReason::Truncated(_))));
    }

    #[tokio::test]
    async fn test_deferred_reply_keeps_order() {
        let (mut client, server_side) = duplex(4096);
        let (_tx, rx) = watch::channel(false);
        let mut conn = Connection::new(6, server_side, peer(), dispatcher(), FrameCodec::new());
        let task = tokio::spawn(async move {
            let result = conn.run(rx).await;
            (result, conn.stats().clone())
        });

        let mut input = frame(&Message::new(SLOW).with("seq", 1u32)).to_vec();
        input.extend_from_slice(&frame(&Message::new(ECHO).with("seq", 2u32)));
        client.write_all(&input).await.unwrap();

        let replies = read_messages(&mut client, 2).await;
        assert_eq!(replies[0].instruction(), SLOW + 1);
        assert_eq!(replies[0].read_u32("seq").unwrap(), 1);
        assert_eq!(replies[1].instruction(), ECHO + 1);
        assert_eq!(replies[1].read_u32("seq").unwrap(), 2);

        drop(client);
        let (result, stats) = task.await.unwrap();
        result.unwrap();
        assert_eq!(stats.replies_sent, 2);
    }

    #[tokio::test]
    async fn test_shutdown_discards_pending_replies() {
        let (mut client, server_side) = duplex(4096);
        let (tx, rx) = watch::channel(false);
        let mut conn = Connection::new(7, server_side, peer(), dispatcher(), FrameCodec::new());
        let task = tokio::spawn(async move {
            let result = conn.run(rx).await;
            (result, conn.state())
        });

        client
            .write_all(&frame(&Message::new(SLOW).with("seq", 1u32)))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;
        tx.send(true).unwrap();

        let (result, state) = task.await.unwrap();
        result.unwrap();
        assert_eq!(state, ConnectionState::Closed);

        let mut rest = Vec::new();
        client.read_to_end(&mut rest).await.unwrap();
        assert!(rest.is_empty());
    }

    #[tokio::test]
    async fn test_peer_half_close_flushes_replies() {
        let (client, server_side) = duplex(4096);
        let (_tx, rx) = watch::channel(false);
        let mut conn = Connection::new(8, server_side, peer(), dispatcher(), FrameCodec::new());
        let task = tokio::spawn(async move { conn.run(rx).await });

        let (mut client_read, mut client_write) = tokio::io::split(client);
        client_write
            .write_all(&frame(&Message::new(SLOW).with("seq", 9u32)))
            .await
            .unwrap();
        client_write.shutdown().await.unwrap();

        let replies = read_messages(&mut client_read, 1).await;
        assert_eq!(replies[0].read_u32("seq").unwrap(), 9);
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_reader_pauses_while_replies_back_up() {
        const REQUESTS: u32 = 200;

        let (client, server_side) = duplex(64);
        let (_tx, rx) = watch::channel(false);
        let mut conn = Connection::new(9, server_side, peer(), dispatcher(), FrameCodec::new())
            .with_max_pending_replies(4);
        let conn_task = tokio::spawn(async move {
            let result = conn.run(rx).await;
            (result, conn.stats().clone())
        });

        let mut input = Vec::new();
        for seq in 0..REQUESTS {
            let request = Message::new(ECHO)
                .with("seq", seq)
                .with("pad", vec![0u8; 1024]);
            input.extend_from_slice(&frame(&request));
        }

        let (mut client_read, mut client_write) = tokio::io::split(client);
        let writer = tokio::spawn(async move {
            client_write.write_all(&input).await.unwrap();
            client_write
        });

        // Nobody reads the replies, so the server must stop taking requests
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!writer.is_finished());

        let replies = read_messages(&mut client_read, REQUESTS as usize).await;
        for (seq, reply) in replies.iter().enumerate() {
            assert_eq!(reply.read_u32("seq").unwrap(), seq as u32);
        }

        let mut client_write = writer.await.unwrap();
        client_write.shutdown().await.unwrap();
        drop(client_write);
        drop(client_read);

        let (result, stats) = conn_task.await.unwrap();
        result.unwrap();
        assert_eq!(stats.frames_received, REQUESTS as u64);
        assert_eq!(stats.replies_sent, REQUESTS as u64);
    }
}
