//! VNOC Client
//!
//! Connects to a VNOC server and exchanges request/reply messages.

use bytes::BytesMut;
use std::net::SocketAddr;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use super::NetworkConfig;
use crate::protocol::{CodecError, DecodeResult, FrameCodec, FrameReader, MalformedReason, Message};

/// Client errors
#[derive(Error, Debug)]
pub enum ClientError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Encode error: {0}")]
    Codec(#[from] CodecError),

    #[error("Malformed frame from server: {0}")]
    Malformed(#[from] MalformedReason),

    #[error("Connection closed")]
    Closed,

    #[error("Connection timeout")]
    Timeout,
}

pub type ClientResult<T> = Result<T, ClientError>;

/// VNOC Client
pub struct Client {
    /// Server address
    remote_addr: SocketAddr,
    /// The TCP stream
    stream: TcpStream,
    /// Protocol encoder
    codec: FrameCodec,
    /// Read buffer and decoder
    frames: FrameReader,
    /// Write buffer
    write_buf: BytesMut,
    /// How long `request` waits for a reply
    request_timeout: Duration,
    /// Set when a request timed out; its reply may still arrive and would
    /// be mistaken for the answer to the next request
    poisoned: bool,
}

impl Client {
    /// Connect to a server
    pub async fn connect(addr: SocketAddr, config: &NetworkConfig) -> ClientResult<Self> {
        let timeout = Duration::from_millis(config.connect_timeout_ms);
        let stream = tokio::time::timeout(timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| ClientError::Timeout)??;
        stream.set_nodelay(true)?;

        tracing::info!("Connected to {}", addr);

        let codec = config.codec();
        Ok(Self {
            remote_addr: addr,
            stream,
            codec,
            frames: FrameReader::new(codec),
            write_buf: BytesMut::with_capacity(4096),
            request_timeout: Duration::from_millis(config.request_timeout_ms),
            poisoned: false,
        })
    }

    /// Get the server address
    pub fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }

    /// Send a message
    pub async fn send(&mut self, message: &Message) -> ClientResult<()> {
        if self.poisoned {
            return Err(ClientError::Closed);
        }
        self.write_buf.clear();
        self.codec.encode_into(message, &mut self.write_buf)?;

        self.stream.write_all(&self.write_buf).await?;
        self.stream.flush().await?;
        Ok(())
    }

    /// Receive the next message; None when the server closed cleanly
    pub async fn recv(&mut self) -> ClientResult<Option<Message>> {
        if self.poisoned {
            return Err(ClientError::Closed);
        }
        loop {
            match self.frames.next_message() {
                DecodeResult::Ok(message, _) => return Ok(Some(message)),
                DecodeResult::Malformed(reason) => return Err(reason.into()),
                DecodeResult::Incomplete => {}
            }

            let n = self.stream.read_buf(self.frames.buffer_mut()).await?;
            if n == 0 {
                self.frames.finish()?;
                return Ok(None);
            }
        }
    }

    /// Send a request and wait for the next reply.
    ///
    /// After a timeout the client is unusable and every later call returns
    /// `ClientError::Closed`.
    pub async fn request(&mut self, message: &Message) -> ClientResult<Message> {
        self.send(message).await?;

        match tokio::time::timeout(self.request_timeout, self.recv()).await {
            Ok(result) => result?.ok_or(ClientError::Closed),
            Err(_) => {
                tracing::warn!("Request to {} timed out; client is no longer usable", self.remote_addr);
                self.poisoned = true;
                Err(ClientError::Timeout)
            }
        }
    }

    /// Whether a timed-out request left the connection out of step
    pub fn is_poisoned(&self) -> bool {
        self.poisoned
    }

    /// Close the connection gracefully
    pub async fn close(mut self) -> ClientResult<()> {
        self.stream.shutdown().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::{Dispatcher, HandlerResult, Reply};
    use crate::network::Server;
    use crate::protocol::ReadMessage;

    const SLOW: u8 = 0x10;
    const ECHO: u8 = 0x03;

    fn dispatcher() -> Dispatcher {
        let mut dispatcher = Dispatcher::new();
        dispatcher.register(SLOW, |request: Message| -> HandlerResult {
            let (tx, reply) = Reply::deferred();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(200)).await;
                let _ = tx.send(request.into_reply(SLOW + 1));
            });
            Ok(reply)
        });
        dispatcher.register(ECHO, |request: Message| -> HandlerResult {
            Ok(Reply::Now(request.into_reply(ECHO + 1)))
        });
        dispatcher
    }

    #[tokio::test]
    async fn test_late_reply_is_never_paired_with_next_request() {
        let mut config = NetworkConfig::new(0).with_bind_address("127.0.0.1");
        config.request_timeout_ms = 50;

        let mut server = Server::new(config.clone(), dispatcher());
        let addr = server.start().await.unwrap();

        let mut client = Client::connect(addr, &config).await.unwrap();
        let err = client.request(&Message::new(SLOW)).await.unwrap_err();
        assert!(matches!(err, ClientError::Timeout));
        assert!(client.is_poisoned());

        // Give the late reply time to land in the socket
        tokio::time::sleep(Duration::from_millis(300)).await;
        let err = client
            .request(&Message::new(ECHO).with("seq", 2u32))
            .await
            .unwrap_err();
        assert!(matches!(err, ClientError::Closed));
        assert!(matches!(client.recv().await, Err(ClientError::Closed)));

        // A fresh client is unaffected
        let mut fresh = Client::connect(addr, &config).await.unwrap();
        let reply = fresh
            .request(&Message::new(ECHO).with("seq", 3u32))
            .await
            .unwrap();
        assert_eq!(reply.read_u32("seq").unwrap(), 3);

        server.stop().await.unwrap();
    }
}
