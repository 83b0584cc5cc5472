//! Server side of file transfers.
//!
//! The server never touches file contents. It assigns session ids, checks
//! that every message comes from the right participant in the right state,
//! and relays it to the other side.

use std::collections::{HashMap, HashSet};

use tracing::{debug, info, warn};

use super::{ClientId, Server};
use crate::protocol::{
    ClFileTransferRequest, ClFileTransferRespond, CsFileTransferData, CsFileTransferInterruption,
    CsFileTransferVerificationResult, FileTransferId, FileTransferResult, InterruptionKind,
    SvFileTransferRequest, SvFileTransferResult, VerificationResult,
};
use crate::transfer::{BlockLayout, TransferState};

#[derive(Debug, Clone)]
pub struct FileTransferSession {
    pub id: FileTransferId,
    /// Sender's correlator for the request
    pub token: u64,
    pub sender: ClientId,
    pub sender_name: String,
    pub receiver: ClientId,
    pub receiver_name: String,
    pub state: TransferState,
    pub file_name: String,
    pub file_hash: Vec<u8>,
    pub file_size: u64,
    pub block_size: u32,
    pub blocks_done: u64,
    pub bytes_done: u64,
}

impl FileTransferSession {
    fn peer_of(&self, id: ClientId) -> Option<ClientId> {
        if id == self.sender {
            Some(self.receiver)
        } else if id == self.receiver {
            Some(self.sender)
        } else {
            None
        }
    }
}

/// Live sessions, indexed by id and by participant login
#[derive(Debug)]
pub struct TransferTable {
    sessions: HashMap<FileTransferId, FileTransferSession>,
    by_user: HashMap<String, HashSet<FileTransferId>>,
    next_id: u32,
}

impl TransferTable {
    pub fn new() -> Self {
        Self {
            sessions: HashMap::new(),
            by_user: HashMap::new(),
            next_id: 1,
        }
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    pub fn get(&self, id: FileTransferId) -> Option<&FileTransferSession> {
        self.sessions.get(&id)
    }

    pub fn get_mut(&mut self, id: FileTransferId) -> Option<&mut FileTransferSession> {
        self.sessions.get_mut(&id)
    }

    /// Store a new session under a fresh id
    pub fn insert(&mut self, mut session: FileTransferSession) -> FileTransferId {
        let id = self.allocate_id();
        session.id = id;
        for login in [&session.sender_name, &session.receiver_name] {
            self.by_user.entry(login.clone()).or_default().insert(id);
        }
        self.sessions.insert(id, session);
        id
    }

    pub fn remove(&mut self, id: FileTransferId) -> Option<FileTransferSession> {
        let session = self.sessions.remove(&id)?;
        for login in [&session.sender_name, &session.receiver_name] {
            if let Some(ids) = self.by_user.get_mut(login) {
                ids.remove(&id);
                if ids.is_empty() {
                    self.by_user.remove(login);
                }
            }
        }
        Some(session)
    }

    /// Every session the user takes part in
    pub fn sessions_of(&self, login: &str) -> Vec<FileTransferId> {
        let mut ids: Vec<FileTransferId> = self
            .by_user
            .get(login)
            .map(|ids| ids.iter().copied().collect())
            .unwrap_or_default();
        ids.sort();
        ids
    }

    /// Session a sender still knows only by its token
    pub fn find_by_token(&self, sender: ClientId, token: u64) -> Option<FileTransferId> {
        self.sessions
            .values()
            .find(|s| s.sender == sender && s.token == token)
            .map(|s| s.id)
    }

    fn allocate_id(&mut self) -> FileTransferId {
        loop {
            let id = FileTransferId(self.next_id);
            self.next_id = self.next_id.wrapping_add(1).max(1);
            if id.is_valid() && !self.sessions.contains_key(&id) {
                return id;
            }
        }
    }
}

impl Default for TransferTable {
    fn default() -> Self {
        Self::new()
    }
}

impl Server {
    pub(super) fn on_transfer_request(&mut self, id: ClientId, request: ClFileTransferRequest) {
        let Some(sender_name) = self.login_of(id) else {
            return;
        };

        let receiver = self
            .find_user(&request.receiver)
            .filter(|&receiver| receiver != id);
        let Some(receiver) = receiver else {
            debug!("{} asked for unavailable receiver '{}'", sender_name, request.receiver);
            self.send_to(
                id,
                SvFileTransferResult {
                    result: FileTransferResult::ReceiverUnavailable,
                    session_id: FileTransferId::INVALID,
                    token: request.token,
                    block_size: 0,
                }
                .into(),
            );
            return;
        };

        if BlockLayout::new(request.file_size, request.block_size).is_err() {
            warn!("{} proposed invalid block size {}", sender_name, request.block_size);
            self.send_to(
                id,
                SvFileTransferResult {
                    result: FileTransferResult::Rejected,
                    session_id: FileTransferId::INVALID,
                    token: request.token,
                    block_size: 0,
                }
                .into(),
            );
            return;
        }

        let session_id = self.transfers.insert(FileTransferSession {
            id: FileTransferId::INVALID,
            token: request.token,
            sender: id,
            sender_name: sender_name.clone(),
            receiver,
            receiver_name: request.receiver.clone(),
            state: TransferState::Waiting,
            file_name: request.file_name.clone(),
            file_hash: request.file_hash.clone(),
            file_size: request.file_size,
            block_size: request.block_size,
            blocks_done: 0,
            bytes_done: 0,
        });

        info!(
            "📤 Transfer {}: {} -> {} '{}' ({} bytes)",
            session_id, sender_name, request.receiver, request.file_name, request.file_size
        );

        self.send_to(
            receiver,
            SvFileTransferRequest {
                sender: sender_name,
                file_name: request.file_name,
                file_size: request.file_size,
                file_hash: request.file_hash,
                block_size: request.block_size,
                session_id,
            }
            .into(),
        );
    }

    pub(super) fn on_transfer_respond(&mut self, id: ClientId, respond: ClFileTransferRespond) {
        let Some(session) = self.transfers.get_mut(respond.session_id) else {
            debug!("{} answered unknown transfer {}", id, respond.session_id);
            return;
        };
        if session.receiver != id || session.state != TransferState::Waiting {
            warn!("{} cannot answer transfer {} in {:?}", id, session.id, session.state);
            return;
        }

        let sender = session.sender;
        let token = session.token;

        if respond.result != FileTransferResult::Accepted {
            info!("Transfer {} rejected", respond.session_id);
            self.transfers.remove(respond.session_id);
            self.send_to(
                sender,
                SvFileTransferResult {
                    result: FileTransferResult::Rejected,
                    session_id: respond.session_id,
                    token,
                    block_size: 0,
                }
                .into(),
            );
            return;
        }

        let block_size = match respond.block_size {
            0 => session.block_size,
            offered => BlockLayout::negotiate(session.block_size, offered),
        };
        session.block_size = block_size;
        let _ = session.state.advance(TransferState::Working);
        if session.file_size == 0 {
            let _ = session.state.advance(TransferState::Verification);
        }

        info!("Transfer {} accepted, {} byte blocks", respond.session_id, block_size);
        self.send_to(
            sender,
            SvFileTransferResult {
                result: FileTransferResult::Accepted,
                session_id: respond.session_id,
                token,
                block_size,
            }
            .into(),
        );
    }

    pub(super) fn on_transfer_data(&mut self, id: ClientId, data: CsFileTransferData) {
        let Some(session) = self.transfers.get_mut(data.session_id) else {
            debug!("{} sent data for unknown transfer {}", id, data.session_id);
            return;
        };
        if session.sender != id || session.state != TransferState::Working {
            warn!("{} cannot send data for transfer {} in {:?}", id, session.id, session.state);
            return;
        }

        let len = data.data.len() as u64;
        if len == 0 || len > u64::from(session.block_size) || session.bytes_done + len > session.file_size {
            warn!(
                "Transfer {}: block of {} bytes does not fit ({}/{} bytes, {} byte blocks)",
                session.id, len, session.bytes_done, session.file_size, session.block_size
            );
            self.cancel_session(data.session_id);
            return;
        }

        session.blocks_done += 1;
        session.bytes_done += len;
        if session.bytes_done == session.file_size {
            let _ = session.state.advance(TransferState::Verification);
            debug!("Transfer {}: all {} blocks relayed", session.id, session.blocks_done);
        }

        let receiver = session.receiver;
        self.send_to(receiver, data.into());
    }

    pub(super) fn on_transfer_verification(&mut self, id: ClientId, verification: CsFileTransferVerificationResult) {
        let Some(session) = self.transfers.get(verification.session_id) else {
            debug!("{} verified unknown transfer {}", id, verification.session_id);
            return;
        };
        if session.receiver != id || session.state != TransferState::Verification {
            warn!("{} cannot verify transfer {} in {:?}", id, session.id, session.state);
            return;
        }

        let sender = session.sender;
        match verification.result {
            VerificationResult::Success => info!("✅ Transfer {} complete", verification.session_id),
            VerificationResult::ChecksumMismatch => {
                warn!("❌ Transfer {} failed: checksum mismatch", verification.session_id)
            }
        }
        self.transfers.remove(verification.session_id);
        self.send_to(sender, verification.into());
    }

    pub(super) fn on_transfer_interruption(&mut self, id: ClientId, interruption: CsFileTransferInterruption) {
        let session_id = if interruption.session_id.is_valid() {
            interruption.session_id
        } else {
            match self.transfers.find_by_token(id, interruption.token) {
                Some(session_id) => session_id,
                None => {
                    debug!("{} interrupted unknown request token {}", id, interruption.token);
                    return;
                }
            }
        };

        let Some(session) = self.transfers.get(session_id) else {
            debug!("{} interrupted unknown transfer {}", id, session_id);
            return;
        };
        let Some(peer) = session.peer_of(id) else {
            warn!("{} is not part of transfer {}", id, session_id);
            return;
        };
        if session.state.is_terminal() || session.state == TransferState::Verification {
            debug!("Transfer {} can no longer be interrupted", session_id);
            return;
        }

        let token = session.token;
        info!("Transfer {} cancelled by {}", session_id, id);
        self.transfers.remove(session_id);
        self.send_to(
            peer,
            CsFileTransferInterruption {
                kind: interruption.kind,
                session_id,
                token,
            }
            .into(),
        );
    }

    /// Abort a session and tell both sides
    fn cancel_session(&mut self, session_id: FileTransferId) {
        let Some(session) = self.transfers.remove(session_id) else {
            return;
        };
        for participant in [session.sender, session.receiver] {
            self.send_to(
                participant,
                CsFileTransferInterruption {
                    kind: InterruptionKind::Cancel,
                    session_id,
                    token: session.token,
                }
                .into(),
            );
        }
    }

    /// Tear down every session of a user who left
    pub(super) fn drop_transfers_of(&mut self, login: &str) {
        for session_id in self.transfers.sessions_of(login) {
            let Some(session) = self.transfers.remove(session_id) else {
                continue;
            };
            let peer = if session.sender_name == login {
                session.receiver
            } else {
                session.sender
            };
            debug!("Transfer {} dropped, {} left", session_id, login);
            self.send_to(
                peer,
                CsFileTransferInterruption {
                    kind: InterruptionKind::Disconnect,
                    session_id,
                    token: session.token,
                }
                .into(),
            );
        }
    }
}
