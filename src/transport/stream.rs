//! Stream endpoints over TCP

use async_trait::async_trait;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{watch, Mutex};

use super::{Transport, TransportError, TransportKind, TransportResult};
use crate::protocol::LineDecoder;

/// Read side: socket half plus the bytes received but not yet split into lines
#[derive(Debug)]
struct StreamReader {
    half: OwnedReadHalf,
    decoder: LineDecoder,
}

/// A TCP connection carrying newline-terminated frames
#[derive(Debug)]
pub struct StreamEndpoint {
    peer: SocketAddr,
    reader: Mutex<StreamReader>,
    writer: Mutex<OwnedWriteHalf>,
    closed: watch::Sender<bool>,
}

impl StreamEndpoint {
    /// Wrap an established TCP stream
    pub fn new(stream: TcpStream, peer: SocketAddr) -> Self {
        let (read_half, write_half) = stream.into_split();
        let (closed, _) = watch::channel(false);
        Self {
            peer,
            reader: Mutex::new(StreamReader {
                half: read_half,
                decoder: LineDecoder::new(),
            }),
            writer: Mutex::new(write_half),
            closed,
        }
    }

    /// Connect to a stream listener
    pub async fn connect(addr: SocketAddr, timeout: Duration) -> TransportResult<Self> {
        let stream = tokio::time::timeout(timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| TransportError::ConnectTimeout(addr))??;
        stream.set_nodelay(true)?;
        tracing::debug!("Stream connected to {}", addr);
        Ok(Self::new(stream, addr))
    }
}

#[async_trait]
impl Transport for StreamEndpoint {
    async fn send_frame(&self, line: &str) -> TransportResult<()> {
        if self.is_closed() {
            return Err(TransportError::Closed);
        }
        let mut writer = self.writer.lock().await;
        writer.write_all(line.as_bytes()).await?;
        writer.flush().await?;
        Ok(())
    }

    async fn read_frame(&self) -> TransportResult<Option<String>> {
        let mut closed = self.closed.subscribe();
        if *closed.borrow() {
            return Ok(None);
        }

        let mut reader = self.reader.lock().await;
        let StreamReader { half, decoder } = &mut *reader;
        loop {
            if let Some(line) = decoder.decode()? {
                return Ok(Some(line));
            }

            tokio::select! {
                _ = closed.changed() => return Ok(None),
                read = half.read_buf(decoder.buffer_mut()) => {
                    if read? == 0 {
                        tracing::debug!("Stream from {} reached end of input", self.peer);
                        self.closed.send_replace(true);
                        return Ok(decoder.take_remainder());
                    }
                }
            }
        }
    }

    fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    fn kind(&self) -> TransportKind {
        TransportKind::Stream
    }

    fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }

    async fn close(&self) {
        if self.closed.send_replace(true) {
            return;
        }
        let mut writer = self.writer.lock().await;
        if let Err(e) = writer.shutdown().await {
            tracing::debug!("Error shutting down stream to {}: {}", self.peer, e);
        }
    }
}
