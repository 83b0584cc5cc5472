//! File Transfer Engine building blocks
//!
//! Shared by the server's session table and the client's incoming/outgoing
//! transfers:
//! - the per-session state machine
//! - block accounting (how many blocks, how long each one is)
//! - SHA-256 content hashing
//! - block-aligned file reader and writer
//!
//! ## Session lifecycle
//!
//! ```text
//! Waiting ──accept──> Working ──last block──> Verification ──> Success
//!    │                   │                                 └──> Failure
//!    └──────cancel───────┴──> Cancelled
//! ```
//!
//! Transitions only move forward; a terminal session is never reactivated.

use std::io;
use std::path::Path;

use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt, BufReader, SeekFrom};

/// Default block size proposed by senders (8 KiB)
pub const DEFAULT_BLOCK_SIZE: u32 = 8 * 1024;

/// Largest block that still fits a secured JSON frame
pub const MAX_BLOCK_SIZE: u32 = 32 * 1024;

/// Read buffer for whole-file hashing (64 KB)
const HASH_CHUNK_SIZE: usize = 64 * 1024;

/// File transfer errors
#[derive(Error, Debug)]
pub enum TransferError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Transfer is {0:?}")]
    UnexpectedState(TransferState),

    #[error("Invalid transition from {from:?} to {to:?}")]
    InvalidTransition { from: TransferState, to: TransferState },

    #[error("Block of {len} bytes overflows transfer ({done}/{size} bytes done)")]
    BlockOverflow { len: usize, done: u64, size: u64 },

    #[error("Invalid block size: {0}")]
    InvalidBlockSize(u32),

    #[error("Invalid file name: {0}")]
    InvalidFileName(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransferState {
    Waiting,
    Working,
    Verification,
    Success,
    Failure,
    Cancelled,
}

impl TransferState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TransferState::Success | TransferState::Failure | TransferState::Cancelled
        )
    }

    pub fn can_transition_to(self, next: TransferState) -> bool {
        use TransferState::*;
        matches!(
            (self, next),
            (Waiting, Working)
                | (Waiting, Cancelled)
                | (Waiting, Failure)
                | (Working, Verification)
                | (Working, Cancelled)
                | (Working, Failure)
                | (Verification, Success)
                | (Verification, Failure)
        )
    }

    /// Move to `next`, refusing anything but a forward transition
    pub fn advance(&mut self, next: TransferState) -> Result<(), TransferError> {
        if !self.can_transition_to(next) {
            return Err(TransferError::InvalidTransition { from: *self, to: next });
        }
        *self = next;
        Ok(())
    }
}

/// Block accounting for one transfer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockLayout {
    pub size: u64,
    pub block_size: u32,
}

impl BlockLayout {
    pub fn new(size: u64, block_size: u32) -> Result<Self, TransferError> {
        if block_size == 0 || block_size > MAX_BLOCK_SIZE {
            return Err(TransferError::InvalidBlockSize(block_size));
        }
        Ok(Self { size, block_size })
    }

    /// The block size actually used: the smaller of the sender's proposal
    /// and what the receiver accepts
    pub fn negotiate(proposed: u32, receiver_max: u32) -> u32 {
        proposed.min(receiver_max).min(MAX_BLOCK_SIZE)
    }

    /// `ceil(size / block_size)`
    pub fn blocks_total(&self) -> u64 {
        self.size.div_ceil(u64::from(self.block_size))
    }

    /// Payload length of block `index`; the last one may be short
    pub fn block_len(&self, index: u64) -> usize {
        let total = self.blocks_total();
        if index >= total {
            return 0;
        }
        let block = u64::from(self.block_size);
        if index + 1 < total {
            return block as usize;
        }
        let remainder = self.size - block * (total - 1);
        remainder as usize
    }

    pub fn offset(&self, index: u64) -> u64 {
        index * u64::from(self.block_size)
    }
}

/// Streaming SHA-256 calculator for large files
pub struct StreamingHasher {
    hasher: Sha256,
    bytes_processed: u64,
}

impl StreamingHasher {
    pub fn new() -> Self {
        Self {
            hasher: Sha256::new(),
            bytes_processed: 0,
        }
    }

    pub fn update(&mut self, data: &[u8]) {
        self.hasher.update(data);
        self.bytes_processed += data.len() as u64;
    }

    pub fn finalize(self) -> Vec<u8> {
        self.hasher.finalize().to_vec()
    }

    pub fn bytes_processed(&self) -> u64 {
        self.bytes_processed
    }
}

impl Default for StreamingHasher {
    fn default() -> Self {
        Self::new()
    }
}

/// SHA-256 digest of a whole file
pub async fn hash_file(path: &Path) -> Result<Vec<u8>, TransferError> {
    let file = File::open(path).await?;
    let mut reader = BufReader::new(file);
    let mut hasher = StreamingHasher::new();
    let mut buffer = vec![0u8; HASH_CHUNK_SIZE];

    loop {
        let bytes_read = reader.read(&mut buffer).await?;
        if bytes_read == 0 {
            break;
        }
        hasher.update(&buffer[..bytes_read]);
    }

    Ok(hasher.finalize())
}

/// Byte-exact digest comparison
pub fn digests_match(expected: &[u8], actual: &[u8]) -> bool {
    expected == actual
}

/// Reduce a peer-supplied file name to a bare name safe to create locally
pub fn sanitize_file_name(name: &str) -> Result<String, TransferError> {
    let normalized = name.replace('\\', "/");
    let base = normalized
        .rsplit('/')
        .next()
        .unwrap_or_default()
        .trim();

    if base.is_empty() || base == "." || base == ".." {
        return Err(TransferError::InvalidFileName(name.to_string()));
    }

    if base.chars().any(|c| c.is_control()) {
        return Err(TransferError::InvalidFileName(name.to_string()));
    }

    Ok(base.to_string())
}

/// Reads a file one block at a time
pub struct BlockReader {
    file: File,
    layout: BlockLayout,
    next_block: u64,
}

impl BlockReader {
    pub async fn open(path: &Path, layout: BlockLayout) -> Result<Self, TransferError> {
        let file = File::open(path).await?;
        Ok(Self {
            file,
            layout,
            next_block: 0,
        })
    }

    pub fn blocks_done(&self) -> u64 {
        self.next_block
    }

    pub fn is_finished(&self) -> bool {
        self.next_block >= self.layout.blocks_total()
    }

    /// Next block, or `None` once every block has been read
    pub async fn read_next(&mut self) -> Result<Option<Vec<u8>>, TransferError> {
        if self.is_finished() {
            return Ok(None);
        }
        let len = self.layout.block_len(self.next_block);
        let mut block = vec![0u8; len];
        self.file
            .seek(SeekFrom::Start(self.layout.offset(self.next_block)))
            .await?;
        self.file.read_exact(&mut block).await?;
        self.next_block += 1;
        Ok(Some(block))
    }
}

/// Appends received blocks to a file pre-sized to the transfer size
pub struct BlockWriter {
    file: File,
    size: u64,
    bytes_done: u64,
}

impl BlockWriter {
    pub async fn create(path: &Path, size: u64) -> Result<Self, TransferError> {
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(path)
            .await?;
        file.set_len(size).await?;
        Ok(Self {
            file,
            size,
            bytes_done: 0,
        })
    }

    pub fn bytes_done(&self) -> u64 {
        self.bytes_done
    }

    pub fn is_complete(&self) -> bool {
        self.bytes_done >= self.size
    }

    pub async fn write_block(&mut self, data: &[u8]) -> Result<(), TransferError> {
        if self.bytes_done + data.len() as u64 > self.size {
            return Err(TransferError::BlockOverflow {
                len: data.len(),
                done: self.bytes_done,
                size: self.size,
            });
        }
        self.file.seek(SeekFrom::Start(self.bytes_done)).await?;
        self.file.write_all(data).await?;
        self.bytes_done += data.len() as u64;
        Ok(())
    }

    /// Flush everything to disk
    pub async fn finish(&mut self) -> Result<(), TransferError> {
        self.file.flush().await?;
        self.file.sync_all().await?;
        Ok(())
    }
}
