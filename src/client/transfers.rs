//! Client side of file transfers.
//!
//! An [`OutcomingFileTransfer`] is created when the user asks to send a file
//! and is known by its token until the server assigns a session id. An
//! [`IncomingFileTransfer`] is created from the server's request and is
//! always known by session id.

use std::fmt;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use crate::protocol::{ClFileTransferRequest, FileTransferId, SvFileTransferRequest, VerificationResult};
use crate::transfer::{
    digests_match, hash_file, BlockLayout, BlockReader, BlockWriter, TransferError, TransferState,
};

/// How the user refers to a transfer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransferRef {
    /// Sent by us, identified by the request token
    Outgoing(u64),
    /// Sent to us, identified by the server session id
    Incoming(FileTransferId),
}

impl fmt::Display for TransferRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransferRef::Outgoing(token) => write!(f, "outgoing transfer (token {})", token),
            TransferRef::Incoming(id) => write!(f, "incoming transfer {}", id),
        }
    }
}

pub struct OutcomingFileTransfer {
    pub token: u64,
    pub session_id: FileTransferId,
    pub receiver: String,
    pub path: PathBuf,
    pub file_name: String,
    pub file_size: u64,
    pub file_hash: Vec<u8>,
    pub block_size: u32,
    pub state: TransferState,
    reader: Option<BlockReader>,
    bytes_sent: u64,
}

impl OutcomingFileTransfer {
    /// Inspect and hash the local file
    pub async fn prepare(
        token: u64,
        receiver: &str,
        path: &Path,
        block_size: u32,
    ) -> Result<Self, TransferError> {
        let metadata = tokio::fs::metadata(path).await?;
        if !metadata.is_file() {
            return Err(TransferError::InvalidFileName(path.display().to_string()));
        }
        let file_name = path
            .file_name()
            .and_then(|name| name.to_str())
            .ok_or_else(|| TransferError::InvalidFileName(path.display().to_string()))?
            .to_string();
        BlockLayout::new(metadata.len(), block_size)?;

        let file_hash = hash_file(path).await?;
        debug!("Hashed {:?}: {}", path, hex::encode(&file_hash));

        Ok(Self {
            token,
            session_id: FileTransferId::INVALID,
            receiver: receiver.to_string(),
            path: path.to_path_buf(),
            file_name,
            file_size: metadata.len(),
            file_hash,
            block_size,
            state: TransferState::Waiting,
            reader: None,
            bytes_sent: 0,
        })
    }

    pub fn request(&self) -> ClFileTransferRequest {
        ClFileTransferRequest {
            receiver: self.receiver.clone(),
            file_name: self.file_name.clone(),
            file_size: self.file_size,
            file_hash: self.file_hash.clone(),
            block_size: self.block_size,
            token: self.token,
        }
    }

    /// The receiver accepted: open the file with the negotiated block size
    pub async fn start(&mut self, session_id: FileTransferId, block_size: u32) -> Result<(), TransferError> {
        if block_size > self.block_size {
            return Err(TransferError::InvalidBlockSize(block_size));
        }
        let layout = BlockLayout::new(self.file_size, block_size)?;
        let reader = BlockReader::open(&self.path, layout).await?;

        self.state.advance(TransferState::Working)?;
        self.session_id = session_id;
        self.block_size = block_size;
        self.reader = Some(reader);
        if layout.blocks_total() == 0 {
            self.state.advance(TransferState::Verification)?;
        }
        Ok(())
    }

    /// Read the next block. Returns `None` once everything has been read,
    /// at which point the transfer waits for the receiver's verdict.
    pub async fn next_block(&mut self) -> Result<Option<Vec<u8>>, TransferError> {
        if self.state != TransferState::Working {
            return Ok(None);
        }
        let reader = self
            .reader
            .as_mut()
            .ok_or(TransferError::UnexpectedState(self.state))?;

        let block = reader.read_next().await?;
        if let Some(block) = &block {
            self.bytes_sent += block.len() as u64;
        }
        if reader.is_finished() {
            self.reader = None;
            self.state.advance(TransferState::Verification)?;
        }
        Ok(block)
    }

    pub fn bytes_sent(&self) -> u64 {
        self.bytes_sent
    }

    /// Apply the receiver's verification result
    pub fn finish(&mut self, result: VerificationResult) -> Result<TransferState, TransferError> {
        let next = match result {
            VerificationResult::Success => TransferState::Success,
            VerificationResult::ChecksumMismatch => TransferState::Failure,
        };
        self.state.advance(next)?;
        Ok(next)
    }

    pub fn cancel(&mut self) -> Result<(), TransferError> {
        self.state.advance(TransferState::Cancelled)?;
        self.reader = None;
        Ok(())
    }
}

pub struct IncomingFileTransfer {
    pub session_id: FileTransferId,
    pub sender: String,
    pub file_name: String,
    pub file_size: u64,
    pub file_hash: Vec<u8>,
    pub block_size: u32,
    pub state: TransferState,
    destination: Option<PathBuf>,
    writer: Option<BlockWriter>,
    last_activity: Instant,
}

impl IncomingFileTransfer {
    pub fn from_request(request: &SvFileTransferRequest) -> Self {
        Self {
            session_id: request.session_id,
            sender: request.sender.clone(),
            file_name: request.file_name.clone(),
            file_size: request.file_size,
            file_hash: request.file_hash.clone(),
            block_size: request.block_size,
            state: TransferState::Waiting,
            destination: None,
            writer: None,
            last_activity: Instant::now(),
        }
    }

    pub fn destination(&self) -> Option<&Path> {
        self.destination.as_deref()
    }

    /// Create the destination file and settle the block size. Returns the
    /// block size to announce to the sender.
    pub async fn accept(&mut self, destination: PathBuf, max_block_size: u32) -> Result<u32, TransferError> {
        if self.state != TransferState::Waiting {
            return Err(TransferError::UnexpectedState(self.state));
        }
        let block_size = BlockLayout::negotiate(self.block_size, max_block_size);
        BlockLayout::new(self.file_size, block_size)?;

        let writer = BlockWriter::create(&destination, self.file_size).await?;
        self.state.advance(TransferState::Working)?;
        self.block_size = block_size;
        self.destination = Some(destination);
        self.writer = Some(writer);
        self.last_activity = Instant::now();
        Ok(block_size)
    }

    /// Append one block. Returns true once the whole file has arrived.
    pub async fn write_block(&mut self, data: &[u8]) -> Result<bool, TransferError> {
        if self.state != TransferState::Working {
            return Err(TransferError::UnexpectedState(self.state));
        }
        if data.len() > self.block_size as usize {
            return Err(TransferError::InvalidBlockSize(data.len() as u32));
        }
        let writer = self
            .writer
            .as_mut()
            .ok_or(TransferError::UnexpectedState(self.state))?;

        writer.write_block(data).await?;
        self.last_activity = Instant::now();
        Ok(writer.is_complete())
    }

    pub fn is_complete(&self) -> bool {
        self.writer.as_ref().is_some_and(|w| w.is_complete())
    }

    pub fn bytes_done(&self) -> u64 {
        self.writer.as_ref().map_or(0, |w| w.bytes_done())
    }

    /// Flush, rehash the received file and compare with the advertised hash
    pub async fn verify(&mut self) -> Result<VerificationResult, TransferError> {
        let mut writer = self
            .writer
            .take()
            .ok_or(TransferError::UnexpectedState(self.state))?;
        writer.finish().await?;
        drop(writer);
        self.state.advance(TransferState::Verification)?;

        let destination = self
            .destination
            .as_deref()
            .ok_or(TransferError::UnexpectedState(self.state))?;
        let actual = hash_file(destination).await?;

        if digests_match(&self.file_hash, &actual) {
            self.state.advance(TransferState::Success)?;
            Ok(VerificationResult::Success)
        } else {
            warn!(
                "Checksum mismatch for {:?}: expected {}, got {}",
                destination,
                hex::encode(&self.file_hash),
                hex::encode(&actual)
            );
            self.state.advance(TransferState::Failure)?;
            Ok(VerificationResult::ChecksumMismatch)
        }
    }

    /// No block has arrived for longer than `timeout`
    pub fn is_stalled(&self, timeout: Duration) -> bool {
        self.state == TransferState::Working && self.last_activity.elapsed() > timeout
    }

    pub fn cancel(&mut self) -> Result<(), TransferError> {
        self.state.advance(TransferState::Cancelled)
    }

    /// Close and delete the partially written file
    pub async fn discard(&mut self) {
        self.writer = None;
        if let Some(destination) = self.destination.take() {
            if let Err(e) = tokio::fs::remove_file(&destination).await {
                debug!("Could not remove {:?}: {}", destination, e);
            }
        }
    }
}
