//! Chat Server Session Manager
//!
//! One accept task feeds new sockets into a queue; everything else runs on
//! the update tick, which is the only code that touches the client and
//! transfer tables:
//!
//! ```text
//! ┌──────────────┐  (stream, addr)  ┌──────────────────────────────────────┐
//! │ accept task  │ ───── mpsc ────> │ update tick                          │
//! └──────────────┘                  │  1. at most one message per client   │
//!                                   │  2. handshake timeouts               │
//!                                   │  3. drop clients queued for removal  │
//!                                   │  4. admit queued connections         │
//!                                   └──────────────────────────────────────┘
//! ```
//!
//! Each admitted client gets its own random session key and walks through
//! `AwaitingPublicKey -> AwaitingCredentials -> Authenticated`. Any message
//! outside that order is a protocol violation and costs the client its
//! connection.

pub mod accounts;
pub mod transfers;

use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::connection::Connection;
use crate::crypto::{CryptoFactory, DEFAULT_RSA_KEY_SIZE};
use crate::protocol::{
    AuthResult, ClAuthRespond, ClPublicKeyRespond, ConfigError, CsChatMessage, Message,
    MessageCatalog, MessageCodec, Protocol, SvAuthChallenge, SvAuthResult, SvDisconnect,
    SvPublicKeyChallenge, SvUserlistRespond, SvUserlistUpdate,
};

pub use accounts::{AccessFlags, AccountStore, MemoryAccountStore, PasswordHash, UserAccount};
pub use transfers::{FileTransferSession, TransferTable};

/// Maximum concurrent connections
const MAX_CLIENTS: usize = 100;

/// Per-connection identifier. Zero stands for the server itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ClientId(pub u32);

impl ClientId {
    pub const SERVER: ClientId = ClientId(0);
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "client {}", self.0)
    }
}

/// Server configuration
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: SocketAddr,
    /// Wire format every client must speak
    pub protocol: Protocol,
    pub asymmetric_algorithm: String,
    /// Key size requested from clients in the public key challenge
    pub asymmetric_key_size: usize,
    pub symmetric_algorithm: String,
    /// Session key size in bits
    pub symmetric_key_size: usize,
    /// Period of the update tick
    pub tick_interval: Duration,
    /// Clients that have not authenticated within this window are dropped
    pub handshake_timeout: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 7070)),
            protocol: Protocol::Binary,
            asymmetric_algorithm: "RSA".to_string(),
            asymmetric_key_size: DEFAULT_RSA_KEY_SIZE,
            symmetric_algorithm: "AES".to_string(),
            symmetric_key_size: 256,
            tick_interval: Duration::from_millis(10),
            handshake_timeout: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stage {
    AwaitingPublicKey,
    AwaitingCredentials,
    Authenticated,
}

struct ClientSession {
    connection: Connection,
    stage: Stage,
    login: Option<String>,
    connected_at: Instant,
    pending_disconnect: bool,
}

impl ClientSession {
    fn is_authenticated(&self) -> bool {
        self.stage == Stage::Authenticated
    }
}

/// LAN chat server
pub struct Server {
    config: ServerConfig,
    codec: MessageCodec,
    factory: CryptoFactory,
    accounts: Box<dyn AccountStore>,
    local_addr: SocketAddr,
    new_clients: mpsc::UnboundedReceiver<(TcpStream, SocketAddr)>,
    accept_task: JoinHandle<()>,
    clients: BTreeMap<ClientId, ClientSession>,
    removals: Vec<ClientId>,
    next_client_id: u32,
    transfers: TransferTable,
}

impl Server {
    /// Validate the configuration, bind the listener and start accepting
    pub async fn bind(config: ServerConfig, accounts: Box<dyn AccountStore>) -> Result<Self> {
        let factory = CryptoFactory::new();
        Self::check_algorithms(&factory, &config).context("Invalid server configuration")?;

        let catalog = MessageCatalog::standard().context("Failed to build message catalog")?;
        let codec = MessageCodec::new(Arc::new(catalog), config.protocol);

        let listener = TcpListener::bind(&config.bind_addr)
            .await
            .with_context(|| format!("Failed to bind to {}", config.bind_addr))?;
        let local_addr = listener.local_addr().context("Failed to read local address")?;

        info!("💬 Chat server listening on {} ({})", local_addr, config.protocol);

        let (tx, new_clients) = mpsc::unbounded_channel();
        let accept_task = tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok(conn) => {
                        if tx.send(conn).is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        error!("Failed to accept connection: {}", e);
                    }
                }
            }
        });

        Ok(Self {
            config,
            codec,
            factory,
            accounts,
            local_addr,
            new_clients,
            accept_task,
            clients: BTreeMap::new(),
            removals: Vec::new(),
            next_client_id: 1,
            transfers: TransferTable::new(),
        })
    }

    fn check_algorithms(factory: &CryptoFactory, config: &ServerConfig) -> Result<(), ConfigError> {
        let asymmetric = factory.create_asymmetric(&config.asymmetric_algorithm)?;
        if !asymmetric.legal_key_sizes().contains(config.asymmetric_key_size) {
            return Err(ConfigError::Invalid(format!(
                "{} key size {} is not supported",
                asymmetric.name(),
                config.asymmetric_key_size
            )));
        }
        let symmetric = factory.create_symmetric(&config.symmetric_algorithm)?;
        if !symmetric.legal_key_sizes().contains(config.symmetric_key_size) {
            return Err(ConfigError::Invalid(format!(
                "{} key size {} is not supported",
                symmetric.name(),
                config.symmetric_key_size
            )));
        }
        Ok(())
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn client_count(&self) -> usize {
        self.clients.len()
    }

    /// Logins of authenticated clients, sorted
    pub fn users(&self) -> Vec<String> {
        let mut users: Vec<String> = self
            .clients
            .values()
            .filter(|c| c.is_authenticated() && !c.pending_disconnect)
            .filter_map(|c| c.login.clone())
            .collect();
        users.sort();
        users
    }

    pub fn transfers(&self) -> &TransferTable {
        &self.transfers
    }

    /// Run the update tick until `shutdown` resolves
    pub async fn run_until<F>(mut self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        let mut interval = tokio::time::interval(self.config.tick_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                _ = interval.tick() => self.update(),
                _ = &mut shutdown => break,
            }
        }

        self.shutdown();
        Ok(())
    }

    /// Run until Ctrl-C
    pub async fn run(self) -> Result<()> {
        self.run_until(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!("Failed to listen for Ctrl-C: {}", e);
            }
        })
        .await
    }

    /// One update tick
    pub fn update(&mut self) {
        let ids: Vec<ClientId> = self.clients.keys().copied().collect();
        for id in ids {
            self.poll_client(id);
        }
        self.check_handshake_timeouts();
        self.drain_removals();
        self.admit_new_clients();
    }

    /// Say goodbye to every client and stop accepting
    pub fn shutdown(&mut self) {
        self.accept_task.abort();
        let ids: Vec<ClientId> = self.clients.keys().copied().collect();
        for id in ids {
            self.send_to(id, SvDisconnect {}.into());
            self.disconnect(id);
        }
        self.drain_removals();
        info!("Server on {} stopped", self.local_addr);
    }

    fn admit_new_clients(&mut self) {
        while let Ok((stream, peer_addr)) = self.new_clients.try_recv() {
            if self.clients.len() >= MAX_CLIENTS {
                warn!("Connection limit reached, rejecting {}", peer_addr);
                continue;
            }
            if let Err(e) = self.admit(stream, peer_addr) {
                warn!("Failed to set up {}: {:#}", peer_addr, e);
            }
        }
    }

    fn admit(&mut self, stream: TcpStream, peer_addr: SocketAddr) -> Result<()> {
        let id = self.allocate_client_id();

        let mut session_key = self
            .factory
            .create_symmetric(&self.config.symmetric_algorithm)?;
        session_key.set_key_size(self.config.symmetric_key_size)?;
        session_key.generate_key();

        let mut connection = Connection::new(stream, peer_addr.to_string(), self.codec.clone());
        connection.set_cipher(session_key);
        connection.send(
            &SvPublicKeyChallenge {
                key_size: self.config.asymmetric_key_size as u32,
            }
            .into(),
        )?;

        info!("📥 New connection from {} as {}", peer_addr, id);
        self.clients.insert(
            id,
            ClientSession {
                connection,
                stage: Stage::AwaitingPublicKey,
                login: None,
                connected_at: Instant::now(),
                pending_disconnect: false,
            },
        );
        Ok(())
    }

    fn allocate_client_id(&mut self) -> ClientId {
        loop {
            let id = ClientId(self.next_client_id);
            self.next_client_id = self.next_client_id.wrapping_add(1).max(1);
            if id != ClientId::SERVER && !self.clients.contains_key(&id) {
                return id;
            }
        }
    }

    fn poll_client(&mut self, id: ClientId) {
        let Some(client) = self.clients.get_mut(&id) else {
            return;
        };
        if client.pending_disconnect {
            return;
        }

        match client.connection.try_recv() {
            None => {}
            Some(Ok(message)) => self.handle_message(id, message),
            Some(Err(e)) if e.is_connection_reset() => {
                info!("{} disconnected", id);
                self.disconnect(id);
            }
            Some(Err(e)) => {
                warn!("Dropping {} after bad message: {}", id, e);
                self.disconnect(id);
            }
        }
    }

    fn handle_message(&mut self, id: ClientId, message: Message) {
        let Some(stage) = self.clients.get(&id).map(|c| c.stage) else {
            return;
        };
        debug!("{} -> {}", id, message.name());

        if stage != Stage::Authenticated && !message.is_handshake() {
            warn!("Protocol violation by {}: {} before authentication", id, message.name());
            self.disconnect(id);
            return;
        }

        match (stage, message) {
            (_, Message::ClDisconnect(_)) => {
                info!("{} disconnected", id);
                self.disconnect(id);
            }
            (Stage::AwaitingPublicKey, Message::ClPublicKeyRespond(m)) => self.on_public_key(id, m),
            (Stage::AwaitingCredentials, Message::ClAuthRespond(m)) => self.on_auth(id, m),
            (Stage::Authenticated, Message::ClUserlistRequest(_)) => {
                let users = self.users();
                self.send_to(id, SvUserlistRespond { users }.into());
            }
            (Stage::Authenticated, Message::CsChatMessage(m)) => self.on_chat(id, m),
            (Stage::Authenticated, Message::ClFileTransferRequest(m)) => self.on_transfer_request(id, m),
            (Stage::Authenticated, Message::ClFileTransferRespond(m)) => self.on_transfer_respond(id, m),
            (Stage::Authenticated, Message::CsFileTransferData(m)) => self.on_transfer_data(id, m),
            (Stage::Authenticated, Message::CsFileTransferVerificationResult(m)) => {
                self.on_transfer_verification(id, m)
            }
            (Stage::Authenticated, Message::CsFileTransferInterruption(m)) => {
                self.on_transfer_interruption(id, m)
            }
            (stage, message) => {
                warn!(
                    "Protocol violation by {}: {} while {:?}",
                    id,
                    message.name(),
                    stage
                );
                self.disconnect(id);
            }
        }
    }

    fn on_public_key(&mut self, id: ClientId, respond: ClPublicKeyRespond) {
        let wrapped = match self.wrap_session_key(id, &respond.key) {
            Ok(wrapped) => wrapped,
            Err(e) => {
                warn!("Key exchange with {} failed: {:#}", id, e);
                self.disconnect(id);
                return;
            }
        };

        self.send_to(id, SvAuthChallenge { session_key: wrapped }.into());
        if let Some(client) = self.clients.get_mut(&id) {
            client.connection.set_secure(true);
            client.stage = Stage::AwaitingCredentials;
            debug!("🔐 Session key sent to {}", id);
        }
    }

    /// Encrypt the client's session key under the public key it sent
    fn wrap_session_key(&self, id: ClientId, public_key: &str) -> Result<Vec<u8>> {
        let client = self.clients.get(&id).context("unknown client")?;
        let session_key = client
            .connection
            .cipher()
            .context("session key not generated")?;

        let mut asymmetric = self
            .factory
            .create_asymmetric(&self.config.asymmetric_algorithm)?;
        asymmetric
            .import_key(public_key)
            .context("Failed to import client public key")?;
        let wrapped = asymmetric
            .encrypt(session_key.key())
            .context("Failed to encrypt session key")?;
        Ok(wrapped)
    }

    fn on_auth(&mut self, id: ClientId, respond: ClAuthRespond) {
        let login = respond.login.trim().to_string();
        let (result, text) = self.check_credentials(&login, &respond.password);

        if result != AuthResult::Accepted {
            info!("🚫 {} failed to log in as '{}': {}", id, login, result);
            self.send_to(id, SvAuthResult { result, message: text }.into());
            self.send_to(id, SvDisconnect {}.into());
            self.disconnect(id);
            return;
        }

        if let Some(client) = self.clients.get_mut(&id) {
            client.stage = Stage::Authenticated;
            client.login = Some(login.clone());
        }
        info!("✅ {} logged in as '{}'", id, login);

        self.send_to(id, SvAuthResult { result, message: text }.into());
        self.broadcast(
            SvUserlistUpdate {
                connected: vec![login],
                disconnected: Vec::new(),
            }
            .into(),
            Some(id),
        );
    }

    fn check_credentials(&self, login: &str, password: &str) -> (AuthResult, String) {
        let account = match self.accounts.find(login) {
            Some(account) if self.accounts.verify(account, password) => account,
            _ => {
                return (
                    AuthResult::InvalidCredentials,
                    "Invalid login or password".to_string(),
                )
            }
        };

        if account.access.is_banned() {
            return (AuthResult::AccessDenied, "Access denied".to_string());
        }

        if self.find_user(login).is_some() {
            return (
                AuthResult::AlreadyLoggedIn,
                format!("User '{}' is already logged in", login),
            );
        }

        (AuthResult::Accepted, format!("Welcome, {}", login))
    }

    fn on_chat(&mut self, id: ClientId, chat: CsChatMessage) {
        let Some(login) = self.login_of(id) else {
            return;
        };
        debug!("💬 {}: {}", login, chat.message);
        self.broadcast(
            CsChatMessage {
                username: login,
                message: chat.message,
            }
            .into(),
            Some(id),
        );
    }

    fn check_handshake_timeouts(&mut self) {
        let timeout = self.config.handshake_timeout;
        let expired: Vec<ClientId> = self
            .clients
            .iter()
            .filter(|(_, c)| {
                !c.is_authenticated() && !c.pending_disconnect && c.connected_at.elapsed() > timeout
            })
            .map(|(&id, _)| id)
            .collect();

        for id in expired {
            info!("⏱️ {} did not authenticate within {:?}", id, timeout);
            self.send_to(id, SvDisconnect {}.into());
            self.disconnect(id);
        }
    }

    /// Authenticated client with the given login
    pub(crate) fn find_user(&self, login: &str) -> Option<ClientId> {
        self.clients
            .iter()
            .find(|(_, c)| {
                c.is_authenticated() && !c.pending_disconnect && c.login.as_deref() == Some(login)
            })
            .map(|(&id, _)| id)
    }

    pub(crate) fn login_of(&self, id: ClientId) -> Option<String> {
        self.clients.get(&id).and_then(|c| c.login.clone())
    }

    /// Send to one client. A client already queued for removal is skipped.
    pub(crate) fn send_to(&mut self, id: ClientId, message: Message) {
        let Some(client) = self.clients.get_mut(&id) else {
            debug!("Dropping {} for unknown {}", message.name(), id);
            return;
        };
        if client.pending_disconnect {
            debug!("Dropping {} for disconnecting {}", message.name(), id);
            return;
        }
        if let Err(e) = client.connection.send(&message) {
            warn!("Failed to send {} to {}: {}", message.name(), id, e);
            self.disconnect(id);
        }
    }

    /// Send to every authenticated client except `exclude`
    pub(crate) fn broadcast(&mut self, message: Message, exclude: Option<ClientId>) {
        let targets: Vec<ClientId> = self
            .clients
            .iter()
            .filter(|(id, c)| Some(**id) != exclude && c.is_authenticated() && !c.pending_disconnect)
            .map(|(&id, _)| id)
            .collect();
        for id in targets {
            self.send_to(id, message.clone());
        }
    }

    /// Close the socket now, remove the client on the next drain
    pub(crate) fn disconnect(&mut self, id: ClientId) {
        let Some(client) = self.clients.get_mut(&id) else {
            return;
        };
        if client.pending_disconnect {
            return;
        }
        client.pending_disconnect = true;
        client.connection.shutdown();
        self.removals.push(id);
    }

    fn drain_removals(&mut self) {
        for id in std::mem::take(&mut self.removals) {
            let Some(client) = self.clients.remove(&id) else {
                continue;
            };
            debug!("Removed {} ({})", id, client.connection.peer());

            if let (Stage::Authenticated, Some(login)) = (client.stage, client.login) {
                self.drop_transfers_of(&login);
                self.broadcast(
                    SvUserlistUpdate {
                        connected: Vec::new(),
                        disconnected: vec![login],
                    }
                    .into(),
                    None,
                );
            }
        }
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        self.accept_task.abort();
    }
}
