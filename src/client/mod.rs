//! Chat Client Session Module
//!
//! The client is driven by [`Client::update`], which never waits on the
//! network. Each call:
//! 1. finishes a pending connect if the socket is ready
//! 2. applies the commands staged through [`ClientHandle`]
//! 3. handles at most one received message
//! 4. sends one block for every running outgoing transfer
//! 5. cancels incoming transfers that have stalled
//!
//! and returns what happened as a list of [`ClientEvent`]s.
//!
//! ## Session states
//!
//! ```text
//! Disconnected ──connect()──> Waiting ──socket ready──> Connected
//!      ^                                                   │
//!      │               SvPublicKeyChallenge -> ClPublicKeyRespond
//!      │               SvAuthChallenge      -> ClAuthRespond
//!      │               SvAuthResult(Accepted)
//!      │                                                   │
//!      └──────── error / reject / SvDisconnect ─── Connected + authenticated
//! ```

pub mod transfers;

use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::connection::Connection;
use crate::crypto::{AsymmetricProvider, CryptoFactory};
use crate::protocol::{
    AuthResult, ClAuthRespond, ClDisconnect, ClFileTransferRespond, ClPublicKeyRespond,
    ClUserlistRequest, ConfigError, CsChatMessage, CsFileTransferData, CsFileTransferInterruption,
    CsFileTransferVerificationResult, FileTransferId, FileTransferResult, InterruptionKind, Message,
    MessageCatalog, MessageCodec, Protocol, SvAuthChallenge, SvAuthResult, SvFileTransferRequest,
    SvFileTransferResult, SvPublicKeyChallenge, VerificationResult,
};
use crate::transfer::{TransferState, DEFAULT_BLOCK_SIZE};

pub use transfers::{IncomingFileTransfer, OutcomingFileTransfer, TransferRef};

/// Client configuration
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Server address to connect to
    pub server_addr: SocketAddr,
    pub protocol: Protocol,
    pub login: String,
    pub password: String,
    pub asymmetric_algorithm: String,
    pub symmetric_algorithm: String,
    /// Largest block proposed when sending and accepted when receiving
    pub max_block_size: u32,
    pub tick_interval: Duration,
    /// Incoming transfers with no block for this long are cancelled
    pub stall_timeout: Duration,
    /// Send credentials inside a secure container instead of in the clear
    pub encrypt_credentials: bool,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server_addr: SocketAddr::from(([127, 0, 0, 1], 7070)),
            protocol: Protocol::Binary,
            login: String::new(),
            password: String::new(),
            asymmetric_algorithm: "RSA".to_string(),
            symmetric_algorithm: "AES".to_string(),
            max_block_size: DEFAULT_BLOCK_SIZE,
            tick_interval: Duration::from_millis(10),
            stall_timeout: Duration::from_secs(60),
            encrypt_credentials: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    Disconnected,
    /// Socket connect in flight
    Waiting,
    /// Socket established, handshake may still be running
    Connected,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Handshake {
    AwaitingChallenge,
    AwaitingSessionKey,
    AwaitingResult,
    Done,
}

/// Something the surrounding application should know about
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientEvent {
    Connected,
    ConnectionFailed(String),
    Authenticated {
        message: String,
    },
    AuthFailed {
        result: AuthResult,
        message: String,
    },
    Disconnected {
        reason: String,
    },
    Userlist(Vec<String>),
    UserlistUpdate {
        connected: Vec<String>,
        disconnected: Vec<String>,
    },
    Chat {
        username: String,
        message: String,
    },
    TransferRequested {
        session_id: FileTransferId,
        sender: String,
        file_name: String,
        file_size: u64,
    },
    TransferStarted {
        transfer: TransferRef,
        session_id: FileTransferId,
        block_size: u32,
    },
    TransferRejected {
        token: u64,
        result: FileTransferResult,
    },
    TransferProgress {
        transfer: TransferRef,
        bytes_done: u64,
        bytes_total: u64,
    },
    TransferFinished {
        transfer: TransferRef,
        state: TransferState,
        reason: String,
    },
}

#[derive(Debug)]
enum Command {
    Chat(String),
    RequestUserlist,
    SendFile {
        token: u64,
        receiver: String,
        path: PathBuf,
    },
    AcceptTransfer {
        session_id: FileTransferId,
        destination: PathBuf,
    },
    RejectTransfer(FileTransferId),
    CancelTransfer(TransferRef),
    Disconnect,
}

#[derive(Error, Debug)]
#[error("Client has been dropped")]
pub struct ClientClosed;

/// Cloneable command sender for the application side
#[derive(Clone)]
pub struct ClientHandle {
    commands: mpsc::UnboundedSender<Command>,
    next_token: Arc<AtomicU64>,
}

impl ClientHandle {
    fn send(&self, command: Command) -> Result<(), ClientClosed> {
        self.commands.send(command).map_err(|_| ClientClosed)
    }

    pub fn chat(&self, message: impl Into<String>) -> Result<(), ClientClosed> {
        self.send(Command::Chat(message.into()))
    }

    pub fn request_userlist(&self) -> Result<(), ClientClosed> {
        self.send(Command::RequestUserlist)
    }

    /// Queue a file for `receiver`. The returned token identifies the
    /// transfer in events until the server assigns a session id.
    pub fn send_file(&self, receiver: impl Into<String>, path: impl Into<PathBuf>) -> Result<u64, ClientClosed> {
        let token = self.next_token.fetch_add(1, Ordering::Relaxed);
        self.send(Command::SendFile {
            token,
            receiver: receiver.into(),
            path: path.into(),
        })?;
        Ok(token)
    }

    pub fn accept_transfer(&self, session_id: FileTransferId, destination: impl Into<PathBuf>) -> Result<(), ClientClosed> {
        self.send(Command::AcceptTransfer {
            session_id,
            destination: destination.into(),
        })
    }

    pub fn reject_transfer(&self, session_id: FileTransferId) -> Result<(), ClientClosed> {
        self.send(Command::RejectTransfer(session_id))
    }

    pub fn cancel_transfer(&self, transfer: TransferRef) -> Result<(), ClientClosed> {
        self.send(Command::CancelTransfer(transfer))
    }

    pub fn disconnect(&self) -> Result<(), ClientClosed> {
        self.send(Command::Disconnect)
    }
}

/// LAN chat client
pub struct Client {
    config: ClientConfig,
    codec: MessageCodec,
    factory: CryptoFactory,
    asymmetric: Box<dyn AsymmetricProvider>,
    state: ClientState,
    handshake: Handshake,
    connecting: Option<JoinHandle<std::io::Result<TcpStream>>>,
    connection: Option<Connection>,
    commands: mpsc::UnboundedReceiver<Command>,
    pending: VecDeque<Command>,
    handle: ClientHandle,
    outgoing: HashMap<u64, OutcomingFileTransfer>,
    incoming: HashMap<FileTransferId, IncomingFileTransfer>,
    events: Vec<ClientEvent>,
}

impl Client {
    /// Create a client. Algorithm names are checked here.
    pub fn new(config: ClientConfig) -> Result<Self, ConfigError> {
        let factory = CryptoFactory::new();
        let asymmetric = factory.create_asymmetric(&config.asymmetric_algorithm)?;
        factory.create_symmetric(&config.symmetric_algorithm)?;

        let codec = MessageCodec::new(Arc::new(MessageCatalog::standard()?), config.protocol);
        let (tx, commands) = mpsc::unbounded_channel();

        Ok(Self {
            config,
            codec,
            factory,
            asymmetric,
            state: ClientState::Disconnected,
            handshake: Handshake::AwaitingChallenge,
            connecting: None,
            connection: None,
            commands,
            pending: VecDeque::new(),
            handle: ClientHandle {
                commands: tx,
                next_token: Arc::new(AtomicU64::new(1)),
            },
            outgoing: HashMap::new(),
            incoming: HashMap::new(),
            events: Vec::new(),
        })
    }

    pub fn handle(&self) -> ClientHandle {
        self.handle.clone()
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn state(&self) -> ClientState {
        self.state
    }

    pub fn is_authenticated(&self) -> bool {
        self.state == ClientState::Connected && self.handshake == Handshake::Done
    }

    /// Raw session key once the server has sent it
    pub fn session_key(&self) -> Option<&[u8]> {
        self.connection
            .as_ref()
            .and_then(|c| c.cipher())
            .map(|cipher| cipher.key())
    }

    pub fn outgoing_transfer(&self, token: u64) -> Option<&OutcomingFileTransfer> {
        self.outgoing.get(&token)
    }

    pub fn incoming_transfer(&self, session_id: FileTransferId) -> Option<&IncomingFileTransfer> {
        self.incoming.get(&session_id)
    }

    /// Start connecting in the background. Completion is reported by
    /// [`update`](Self::update).
    pub fn connect(&mut self) {
        if self.state != ClientState::Disconnected {
            debug!("Connect ignored while {:?}", self.state);
            return;
        }
        info!("🔗 Connecting to {}...", self.config.server_addr);
        let addr = self.config.server_addr;
        self.connecting = Some(tokio::spawn(async move { TcpStream::connect(addr).await }));
        self.state = ClientState::Waiting;
    }

    /// Run one tick
    pub async fn update(&mut self) -> Vec<ClientEvent> {
        self.poll_connect().await;
        self.apply_commands().await;

        if self.state == ClientState::Connected {
            self.poll_message().await;
        }
        if self.is_authenticated() {
            self.pump_outgoing().await;
            self.check_stalled().await;
        }

        std::mem::take(&mut self.events)
    }

    async fn poll_connect(&mut self) {
        let Some(task) = self.connecting.as_ref() else {
            return;
        };
        if !task.is_finished() {
            return;
        }
        let Some(task) = self.connecting.take() else {
            return;
        };

        let result = match task.await {
            Ok(result) => result,
            Err(e) => Err(std::io::Error::new(std::io::ErrorKind::Other, e)),
        };

        match result {
            Ok(stream) => {
                if let Err(e) = stream.set_nodelay(true) {
                    debug!("Failed to set TCP_NODELAY: {}", e);
                }
                info!("Connected to {}", self.config.server_addr);
                self.connection = Some(Connection::new(
                    stream,
                    self.config.server_addr.to_string(),
                    self.codec.clone(),
                ));
                self.state = ClientState::Connected;
                self.handshake = Handshake::AwaitingChallenge;
                self.events.push(ClientEvent::Connected);
            }
            Err(e) => {
                warn!("Failed to connect to {}: {}", self.config.server_addr, e);
                self.state = ClientState::Disconnected;
                self.events.push(ClientEvent::ConnectionFailed(e.to_string()));
            }
        }
    }

    /// Commands wait in the queue while a handshake is running, except
    /// `Disconnect`, which abandons the handshake
    async fn apply_commands(&mut self) {
        while let Ok(command) = self.commands.try_recv() {
            self.pending.push_back(command);
        }

        if self.state != ClientState::Disconnected && !self.is_authenticated() {
            if !self.pending.iter().any(|c| matches!(c, Command::Disconnect)) {
                return;
            }
            info!("Disconnect requested during the handshake");
            self.pending.retain(|c| !matches!(c, Command::Disconnect));
            self.send(ClDisconnect {}.into());
            self.reset("disconnected by user").await;
        }

        while let Some(command) = self.pending.pop_front() {
            if self.state == ClientState::Disconnected {
                warn!("Not connected, dropping {:?}", command);
                if let Command::SendFile { token, .. } = command {
                    self.finish_transfer(TransferRef::Outgoing(token), TransferState::Failure, "not connected");
                }
                continue;
            }
            self.apply_command(command).await;
        }
    }

    async fn apply_command(&mut self, command: Command) {
        match command {
            Command::Chat(message) => self.send(
                CsChatMessage {
                    username: self.config.login.clone(),
                    message,
                }
                .into(),
            ),
            Command::RequestUserlist => self.send(ClUserlistRequest {}.into()),
            Command::SendFile { token, receiver, path } => self.start_send(token, receiver, path).await,
            Command::AcceptTransfer { session_id, destination } => {
                self.accept_incoming(session_id, destination).await
            }
            Command::RejectTransfer(session_id) => self.reject_incoming(session_id),
            Command::CancelTransfer(transfer) => self.cancel(transfer).await,
            Command::Disconnect => {
                self.send(ClDisconnect {}.into());
                self.reset("disconnected by user").await;
            }
        }
    }

    async fn poll_message(&mut self) {
        let Some(connection) = self.connection.as_mut() else {
            return;
        };
        match connection.try_recv() {
            None => {}
            Some(Ok(message)) => self.handle_message(message).await,
            Some(Err(e)) if e.is_connection_reset() => {
                info!("Server closed the connection");
                self.reset("connection closed by server").await;
            }
            Some(Err(e)) => {
                warn!("Bad message from server: {}", e);
                self.reset(&format!("protocol error: {}", e)).await;
            }
        }
    }

    async fn handle_message(&mut self, message: Message) {
        debug!("<- {}", message.name());
        match (self.handshake, message) {
            (_, Message::SvDisconnect(_)) => {
                info!("Server ended the session");
                self.reset("server closed the session").await;
            }
            (Handshake::AwaitingChallenge, Message::SvPublicKeyChallenge(m)) => self.on_key_challenge(m).await,
            (Handshake::AwaitingSessionKey, Message::SvAuthChallenge(m)) => self.on_auth_challenge(m).await,
            (Handshake::AwaitingResult, Message::SvAuthResult(m)) => self.on_auth_result(m).await,
            (Handshake::Done, Message::SvUserlistRespond(m)) => {
                self.events.push(ClientEvent::Userlist(m.users));
            }
            (Handshake::Done, Message::SvUserlistUpdate(m)) => {
                self.events.push(ClientEvent::UserlistUpdate {
                    connected: m.connected,
                    disconnected: m.disconnected,
                });
            }
            (Handshake::Done, Message::CsChatMessage(m)) => {
                self.events.push(ClientEvent::Chat {
                    username: m.username,
                    message: m.message,
                });
            }
            (Handshake::Done, Message::SvFileTransferRequest(m)) => self.on_transfer_request(m),
            (Handshake::Done, Message::SvFileTransferResult(m)) => self.on_transfer_result(m).await,
            (Handshake::Done, Message::CsFileTransferData(m)) => self.on_transfer_data(m).await,
            (Handshake::Done, Message::CsFileTransferVerificationResult(m)) => self.on_transfer_verification(m),
            (Handshake::Done, Message::CsFileTransferInterruption(m)) => self.on_transfer_interruption(m).await,
            (handshake, message) => {
                warn!("Unexpected {} while {:?}", message.name(), handshake);
                self.send(ClDisconnect {}.into());
                self.reset(&format!("unexpected {} from server", message.name())).await;
            }
        }
    }

    async fn on_key_challenge(&mut self, challenge: SvPublicKeyChallenge) {
        let key_size = challenge.key_size as usize;
        let exported = self
            .asymmetric
            .set_key_size(key_size)
            .and_then(|_| self.asymmetric.export_key(false));

        match exported {
            Ok(key) => {
                debug!("Generated {} bit {} key", key_size, self.asymmetric.name());
                self.handshake = Handshake::AwaitingSessionKey;
                self.send(ClPublicKeyRespond { key }.into());
            }
            Err(e) => {
                warn!("Cannot answer {} bit key challenge: {}", key_size, e);
                self.reset(&format!("key exchange failed: {}", e)).await;
            }
        }
    }

    async fn on_auth_challenge(&mut self, challenge: SvAuthChallenge) {
        let installed = self.install_session_key(&challenge.session_key);
        if let Err(e) = installed {
            warn!("Cannot recover session key: {:#}", e);
            self.reset(&format!("key exchange failed: {}", e)).await;
            return;
        }

        if self.config.encrypt_credentials {
            if let Some(connection) = self.connection.as_mut() {
                connection.set_secure(true);
            }
        }
        debug!("🔐 Session key established");

        self.handshake = Handshake::AwaitingResult;
        self.send(
            ClAuthRespond {
                login: self.config.login.clone(),
                password: self.config.password.clone(),
            }
            .into(),
        );
    }

    fn install_session_key(&mut self, wrapped: &[u8]) -> anyhow::Result<()> {
        let raw = self.asymmetric.decrypt(wrapped)?;
        let mut cipher = self.factory.create_symmetric(&self.config.symmetric_algorithm)?;
        cipher.set_key(&raw)?;
        let connection = self
            .connection
            .as_mut()
            .ok_or_else(|| anyhow::anyhow!("not connected"))?;
        connection.set_cipher(cipher);
        Ok(())
    }

    async fn on_auth_result(&mut self, result: SvAuthResult) {
        if result.result == AuthResult::Accepted {
            info!("✅ Logged in as '{}'", self.config.login);
            self.handshake = Handshake::Done;
            if let Some(connection) = self.connection.as_mut() {
                connection.set_secure(true);
            }
            self.events.push(ClientEvent::Authenticated {
                message: result.message,
            });
        } else {
            warn!("Login rejected: {} ({})", result.result, result.message);
            self.events.push(ClientEvent::AuthFailed {
                result: result.result,
                message: result.message.clone(),
            });
            self.reset(&result.message).await;
        }
    }

    fn on_transfer_request(&mut self, request: SvFileTransferRequest) {
        if !request.session_id.is_valid() || self.incoming.contains_key(&request.session_id) {
            warn!("Ignoring transfer request with session id {}", request.session_id);
            return;
        }
        info!(
            "📥 {} offers '{}' ({} bytes) as {}",
            request.sender, request.file_name, request.file_size, request.session_id
        );
        let transfer = IncomingFileTransfer::from_request(&request);
        self.incoming.insert(request.session_id, transfer);
        self.events.push(ClientEvent::TransferRequested {
            session_id: request.session_id,
            sender: request.sender,
            file_name: request.file_name,
            file_size: request.file_size,
        });
    }

    async fn on_transfer_result(&mut self, result: SvFileTransferResult) {
        let Some(transfer) = self.outgoing.get_mut(&result.token) else {
            debug!("Result for unknown token {}", result.token);
            return;
        };

        if result.result != FileTransferResult::Accepted {
            info!("Transfer of '{}' refused: {}", transfer.file_name, result.result);
            self.outgoing.remove(&result.token);
            self.events.push(ClientEvent::TransferRejected {
                token: result.token,
                result: result.result,
            });
            return;
        }

        match transfer.start(result.session_id, result.block_size).await {
            Ok(()) => {
                info!("📤 Sending '{}' as {}", transfer.file_name, result.session_id);
                self.events.push(ClientEvent::TransferStarted {
                    transfer: TransferRef::Outgoing(result.token),
                    session_id: result.session_id,
                    block_size: result.block_size,
                });
            }
            Err(e) => {
                warn!("Cannot start transfer {}: {}", result.session_id, e);
                self.send(
                    CsFileTransferInterruption {
                        kind: InterruptionKind::Cancel,
                        session_id: result.session_id,
                        token: result.token,
                    }
                    .into(),
                );
                self.outgoing.remove(&result.token);
                self.finish_transfer(TransferRef::Outgoing(result.token), TransferState::Failure, &e.to_string());
            }
        }
    }

    async fn on_transfer_data(&mut self, data: CsFileTransferData) {
        let session_id = data.session_id;
        let Some(transfer) = self.incoming.get_mut(&session_id) else {
            debug!("Data for unknown transfer {}", session_id);
            return;
        };

        match transfer.write_block(&data.data).await {
            Ok(complete) => {
                self.events.push(ClientEvent::TransferProgress {
                    transfer: TransferRef::Incoming(session_id),
                    bytes_done: transfer.bytes_done(),
                    bytes_total: transfer.file_size,
                });
                if complete {
                    self.complete_incoming(session_id).await;
                }
            }
            Err(e) => {
                warn!("Transfer {} failed: {}", session_id, e);
                self.abort_incoming(session_id, TransferState::Failure, &e.to_string()).await;
            }
        }
    }

    fn on_transfer_verification(&mut self, verification: CsFileTransferVerificationResult) {
        let Some(token) = self.token_of(verification.session_id) else {
            debug!("Verification for unknown transfer {}", verification.session_id);
            return;
        };
        let Some(mut transfer) = self.outgoing.remove(&token) else {
            return;
        };

        let reason = match verification.result {
            VerificationResult::Success => "delivered",
            VerificationResult::ChecksumMismatch => "checksum mismatch",
        };
        match transfer.finish(verification.result) {
            Ok(state) => {
                info!("Transfer {} of '{}': {}", verification.session_id, transfer.file_name, reason);
                self.finish_transfer(TransferRef::Outgoing(token), state, reason);
            }
            Err(e) => {
                warn!("Transfer {}: {}", verification.session_id, e);
                self.finish_transfer(TransferRef::Outgoing(token), TransferState::Failure, &e.to_string());
            }
        }
    }

    async fn on_transfer_interruption(&mut self, interruption: CsFileTransferInterruption) {
        let reason = match interruption.kind {
            InterruptionKind::Cancel => "cancelled by peer",
            InterruptionKind::Disconnect => "peer disconnected",
        };

        if let Some(mut transfer) = self.incoming.remove(&interruption.session_id) {
            let _ = transfer.cancel();
            transfer.discard().await;
            info!("Transfer {} {}", interruption.session_id, reason);
            self.finish_transfer(TransferRef::Incoming(interruption.session_id), TransferState::Cancelled, reason);
            return;
        }

        let token = self
            .token_of(interruption.session_id)
            .or_else(|| self.outgoing.contains_key(&interruption.token).then_some(interruption.token));
        if let Some(mut transfer) = token.and_then(|token| self.outgoing.remove(&token)) {
            let _ = transfer.cancel();
            info!("Transfer of '{}' {}", transfer.file_name, reason);
            self.finish_transfer(TransferRef::Outgoing(transfer.token), TransferState::Cancelled, reason);
            return;
        }

        debug!("Interruption for unknown transfer {}", interruption.session_id);
    }

    async fn start_send(&mut self, token: u64, receiver: String, path: PathBuf) {
        match OutcomingFileTransfer::prepare(token, &receiver, &path, self.config.max_block_size).await {
            Ok(transfer) => {
                info!("Offering {:?} ({} bytes) to {}", path, transfer.file_size, receiver);
                self.send(transfer.request().into());
                self.outgoing.insert(token, transfer);
            }
            Err(e) => {
                warn!("Cannot send {:?}: {}", path, e);
                self.finish_transfer(TransferRef::Outgoing(token), TransferState::Failure, &e.to_string());
            }
        }
    }

    async fn accept_incoming(&mut self, session_id: FileTransferId, destination: PathBuf) {
        let Some(transfer) = self.incoming.get_mut(&session_id) else {
            warn!("Cannot accept unknown transfer {}", session_id);
            return;
        };

        match transfer.accept(destination, self.config.max_block_size).await {
            Ok(block_size) => {
                info!("Receiving '{}' into {:?}", transfer.file_name, transfer.destination());
                let complete = transfer.is_complete();
                self.send(
                    ClFileTransferRespond {
                        result: FileTransferResult::Accepted,
                        session_id,
                        block_size,
                    }
                    .into(),
                );
                self.events.push(ClientEvent::TransferStarted {
                    transfer: TransferRef::Incoming(session_id),
                    session_id,
                    block_size,
                });
                if complete {
                    self.complete_incoming(session_id).await;
                }
            }
            Err(e) => {
                warn!("Cannot accept transfer {}: {}", session_id, e);
                self.send(
                    ClFileTransferRespond {
                        result: FileTransferResult::Rejected,
                        session_id,
                        block_size: 0,
                    }
                    .into(),
                );
                self.incoming.remove(&session_id);
                self.finish_transfer(TransferRef::Incoming(session_id), TransferState::Failure, &e.to_string());
            }
        }
    }

    fn reject_incoming(&mut self, session_id: FileTransferId) {
        let Some(mut transfer) = self.incoming.remove(&session_id) else {
            warn!("Cannot reject unknown transfer {}", session_id);
            return;
        };
        if transfer.state != TransferState::Waiting {
            warn!("Transfer {} is already {:?}", session_id, transfer.state);
            self.incoming.insert(session_id, transfer);
            return;
        }
        let _ = transfer.cancel();
        self.send(
            ClFileTransferRespond {
                result: FileTransferResult::Rejected,
                session_id,
                block_size: 0,
            }
            .into(),
        );
        self.finish_transfer(TransferRef::Incoming(session_id), TransferState::Cancelled, "rejected");
    }

    async fn cancel(&mut self, transfer: TransferRef) {
        match transfer {
            TransferRef::Incoming(session_id) => {
                let waiting = match self.incoming.get(&session_id) {
                    Some(t) => t.state == TransferState::Waiting,
                    None => {
                        warn!("Cannot cancel unknown {}", transfer);
                        return;
                    }
                };
                if waiting {
                    self.reject_incoming(session_id);
                } else {
                    self.abort_incoming(session_id, TransferState::Cancelled, "cancelled").await;
                }
            }
            TransferRef::Outgoing(token) => {
                let Some(outgoing) = self.outgoing.get_mut(&token) else {
                    warn!("Cannot cancel unknown {}", transfer);
                    return;
                };
                if let Err(e) = outgoing.cancel() {
                    warn!("Cannot cancel {}: {}", transfer, e);
                    return;
                }
                let session_id = outgoing.session_id;
                self.outgoing.remove(&token);
                self.send(
                    CsFileTransferInterruption {
                        kind: InterruptionKind::Cancel,
                        session_id,
                        token,
                    }
                    .into(),
                );
                self.finish_transfer(transfer, TransferState::Cancelled, "cancelled");
            }
        }
    }

    /// Every byte has arrived: verify and report to the sender
    async fn complete_incoming(&mut self, session_id: FileTransferId) {
        let Some(mut transfer) = self.incoming.remove(&session_id) else {
            return;
        };
        match transfer.verify().await {
            Ok(result) => {
                let (state, reason) = match result {
                    VerificationResult::Success => (TransferState::Success, "received"),
                    VerificationResult::ChecksumMismatch => (TransferState::Failure, "checksum mismatch"),
                };
                if state == TransferState::Failure {
                    transfer.discard().await;
                }
                info!("Transfer {} of '{}': {}", session_id, transfer.file_name, reason);
                self.send(CsFileTransferVerificationResult { result, session_id }.into());
                self.finish_transfer(TransferRef::Incoming(session_id), state, reason);
            }
            Err(e) => {
                warn!("Cannot verify transfer {}: {}", session_id, e);
                transfer.discard().await;
                self.send(
                    CsFileTransferVerificationResult {
                        result: VerificationResult::ChecksumMismatch,
                        session_id,
                    }
                    .into(),
                );
                self.finish_transfer(TransferRef::Incoming(session_id), TransferState::Failure, &e.to_string());
            }
        }
    }

    /// Stop a running incoming transfer, tell the sender, drop the file
    async fn abort_incoming(&mut self, session_id: FileTransferId, state: TransferState, reason: &str) {
        let Some(mut transfer) = self.incoming.remove(&session_id) else {
            return;
        };
        let _ = transfer.state.advance(state);
        transfer.discard().await;
        self.send(
            CsFileTransferInterruption {
                kind: InterruptionKind::Cancel,
                session_id,
                token: 0,
            }
            .into(),
        );
        self.finish_transfer(TransferRef::Incoming(session_id), state, reason);
    }

    /// One block per running outgoing transfer
    async fn pump_outgoing(&mut self) {
        let tokens: Vec<u64> = self
            .outgoing
            .values()
            .filter(|t| t.state == TransferState::Working)
            .map(|t| t.token)
            .collect();

        for token in tokens {
            let Some(transfer) = self.outgoing.get_mut(&token) else {
                continue;
            };
            let session_id = transfer.session_id;
            match transfer.next_block().await {
                Ok(Some(data)) => {
                    let progress = ClientEvent::TransferProgress {
                        transfer: TransferRef::Outgoing(token),
                        bytes_done: transfer.bytes_sent(),
                        bytes_total: transfer.file_size,
                    };
                    self.send(CsFileTransferData { session_id, data }.into());
                    self.events.push(progress);
                }
                Ok(None) => {}
                Err(e) => {
                    warn!("Reading {} failed: {}", session_id, e);
                    self.outgoing.remove(&token);
                    self.send(
                        CsFileTransferInterruption {
                            kind: InterruptionKind::Cancel,
                            session_id,
                            token,
                        }
                        .into(),
                    );
                    self.finish_transfer(TransferRef::Outgoing(token), TransferState::Failure, &e.to_string());
                }
            }
        }
    }

    async fn check_stalled(&mut self) {
        let timeout = self.config.stall_timeout;
        let stalled: Vec<FileTransferId> = self
            .incoming
            .values()
            .filter(|t| t.is_stalled(timeout))
            .map(|t| t.session_id)
            .collect();
        for session_id in stalled {
            warn!("⏱️ Transfer {} stalled for {:?}", session_id, timeout);
            self.abort_incoming(session_id, TransferState::Cancelled, "stalled").await;
        }
    }

    fn token_of(&self, session_id: FileTransferId) -> Option<u64> {
        if !session_id.is_valid() {
            return None;
        }
        self.outgoing
            .values()
            .find(|t| t.session_id == session_id)
            .map(|t| t.token)
    }

    fn finish_transfer(&mut self, transfer: TransferRef, state: TransferState, reason: &str) {
        self.events.push(ClientEvent::TransferFinished {
            transfer,
            state,
            reason: reason.to_string(),
        });
    }

    fn send(&mut self, message: Message) {
        let Some(connection) = self.connection.as_mut() else {
            debug!("Not connected, dropping {}", message.name());
            return;
        };
        if let Err(e) = connection.send(&message) {
            warn!("Failed to send {}: {}", message.name(), e);
        }
    }

    /// Drop the connection and every transfer
    async fn reset(&mut self, reason: &str) {
        if let Some(task) = self.connecting.take() {
            task.abort();
        }
        if let Some(mut connection) = self.connection.take() {
            connection.shutdown();
        }
        let was_connected = self.state != ClientState::Disconnected;
        self.state = ClientState::Disconnected;
        self.handshake = Handshake::AwaitingChallenge;

        for (token, mut transfer) in std::mem::take(&mut self.outgoing) {
            let _ = transfer.cancel();
            self.finish_transfer(TransferRef::Outgoing(token), TransferState::Cancelled, "connection lost");
        }
        for (session_id, mut transfer) in std::mem::take(&mut self.incoming) {
            let _ = transfer.cancel();
            transfer.discard().await;
            self.finish_transfer(TransferRef::Incoming(session_id), TransferState::Cancelled, "connection lost");
        }

        if was_connected {
            info!("Disconnected: {}", reason);
            self.events.push(ClientEvent::Disconnected {
                reason: reason.to_string(),
            });
        }
    }
}
