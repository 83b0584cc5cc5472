//! Framed Connection Module
//!
//! Wraps one socket in a pair of background tasks so the session layer can
//! poll it without ever blocking on the network:
//!
//! ```text
//!            ┌──────────────┐  Frame  ┌──────────────┐
//!  socket ──>│ reader task  │───────> │ incoming rx  │──> try_recv() ──> Message
//!            └──────────────┘ (mpsc)  └──────────────┘        (decrypt if Secure)
//!
//!            ┌──────────────┐  bytes  ┌──────────────┐
//!  socket <──│ writer task  │<─────── │ outgoing tx  │<── send(Message)
//!            └──────────────┘ (mpsc)  └──────────────┘        (encrypt if secure)
//! ```
//!
//! Dropping the outgoing sender lets the writer task flush what is queued and
//! shut down the write half. The reader task is aborted on drop.

use std::fmt;
use std::io;

use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::mpsc::{self, error::TryRecvError};
use tokio::task::JoinHandle;
use tracing::debug;

use crate::crypto::SymmetricProvider;
use crate::protocol::{Frame, Message, MessageCodec, ProtocolError};

/// Frames buffered ahead of the session layer before the reader waits
const INCOMING_QUEUE: usize = 64;

/// One peer connection
pub struct Connection {
    peer: String,
    codec: MessageCodec,
    cipher: Option<Box<dyn SymmetricProvider>>,
    secure: bool,
    incoming: mpsc::Receiver<Result<Frame, ProtocolError>>,
    outgoing: Option<mpsc::UnboundedSender<Vec<u8>>>,
    reader_task: JoinHandle<()>,
}

impl Connection {
    pub fn new<S>(stream: S, peer: impl Into<String>, codec: MessageCodec) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let peer = peer.into();
        let protocol = codec.protocol();
        let (read_half, mut write_half) = tokio::io::split(stream);

        let (frame_tx, incoming) = mpsc::channel(INCOMING_QUEUE);
        let reader_peer = peer.clone();
        let reader_task = tokio::spawn(async move {
            let mut reader = BufReader::new(read_half);
            loop {
                let result = Frame::read(&mut reader, protocol).await;
                let failed = result.is_err();
                if frame_tx.send(result).await.is_err() || failed {
                    break;
                }
            }
            debug!("Reader for {} stopped", reader_peer);
        });

        let (outgoing, mut bytes_rx) = mpsc::unbounded_channel::<Vec<u8>>();
        let writer_peer = peer.clone();
        tokio::spawn(async move {
            while let Some(bytes) = bytes_rx.recv().await {
                if let Err(e) = write_half.write_all(&bytes).await {
                    debug!("Write to {} failed: {}", writer_peer, e);
                    return;
                }
            }
            let _ = write_half.shutdown().await;
            debug!("Writer for {} stopped", writer_peer);
        });

        Self {
            peer,
            codec,
            cipher: None,
            secure: false,
            incoming,
            outgoing: Some(outgoing),
            reader_task,
        }
    }

    pub fn peer(&self) -> &str {
        &self.peer
    }

    /// Install the session cipher. Secure frames can be read from now on.
    pub fn set_cipher(&mut self, cipher: Box<dyn SymmetricProvider>) {
        self.cipher = Some(cipher);
    }

    pub fn cipher(&self) -> Option<&dyn SymmetricProvider> {
        self.cipher.as_deref()
    }

    /// Wrap every following send in a secure container
    pub fn set_secure(&mut self, secure: bool) {
        self.secure = secure;
    }

    pub fn is_secure(&self) -> bool {
        self.secure && self.cipher.is_some()
    }

    /// Encode and queue a message for the writer task
    pub fn send(&mut self, message: &Message) -> Result<(), ProtocolError> {
        let cipher = if self.secure {
            session_cipher(&mut self.cipher)
        } else {
            None
        };
        let frame = self.codec.encode(message, cipher)?;
        let bytes = frame.to_bytes(self.codec.protocol())?;

        let outgoing = self.outgoing.as_ref().ok_or_else(closed)?;
        outgoing.send(bytes).map_err(|_| closed())?;
        Ok(())
    }

    /// Next message if one has already arrived. A closed stream yields an
    /// `UnexpectedEof` error.
    pub fn try_recv(&mut self) -> Option<Result<Message, ProtocolError>> {
        match self.incoming.try_recv() {
            Ok(result) => Some(self.decode(result)),
            Err(TryRecvError::Empty) => None,
            Err(TryRecvError::Disconnected) => Some(Err(eof())),
        }
    }

    /// Wait for the next message
    pub async fn recv(&mut self) -> Result<Message, ProtocolError> {
        match self.incoming.recv().await {
            Some(result) => self.decode(result),
            None => Err(eof()),
        }
    }

    /// Stop reading and close the write half once queued bytes are flushed
    pub fn shutdown(&mut self) {
        self.outgoing = None;
        self.reader_task.abort();
    }

    fn decode(&mut self, result: Result<Frame, ProtocolError>) -> Result<Message, ProtocolError> {
        let frame = result?;
        self.codec.decode(&frame, session_cipher(&mut self.cipher))
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.reader_task.abort();
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("peer", &self.peer)
            .field("protocol", &self.codec.protocol())
            .field("secure", &self.is_secure())
            .finish()
    }
}

fn session_cipher(cipher: &mut Option<Box<dyn SymmetricProvider>>) -> Option<&mut dyn SymmetricProvider> {
    match cipher {
        Some(cipher) => {
            let cipher: &mut dyn SymmetricProvider = cipher.as_mut();
            Some(cipher)
        }
        None => None,
    }
}

fn closed() -> ProtocolError {
    ProtocolError::Io(io::Error::new(io::ErrorKind::BrokenPipe, "connection closed"))
}

fn eof() -> ProtocolError {
    ProtocolError::Io(io::Error::new(io::ErrorKind::UnexpectedEof, "connection closed by peer"))
}
