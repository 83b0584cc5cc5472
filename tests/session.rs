//! End-to-end sessions over loopback TCP.

use std::sync::Arc;
use std::time::{Duration, Instant};

use lanchat::client::{Client, ClientConfig, ClientEvent, TransferRef};
use lanchat::connection::Connection;
use lanchat::crypto::{AesProvider, AsymmetricProvider, RsaProvider, SymmetricProvider};
use lanchat::protocol::{
    AuthResult, CsChatMessage, FileTransferId, FileTransferResult, Message, MessageCatalog,
    MessageCodec, MessageId, Protocol, ProtocolError, SecureMessageContainer, SvAuthChallenge,
    SvAuthResult, SvPublicKeyChallenge,
};
use lanchat::server::{AccessFlags, MemoryAccountStore, Server, ServerConfig};
use lanchat::transfer::{hash_file, TransferState};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::oneshot;

const DEADLINE: Duration = Duration::from_secs(60);

struct Peer {
    client: Client,
    events: Vec<ClientEvent>,
}

impl Peer {
    fn new(config: ClientConfig) -> Self {
        let mut client = Client::new(config).unwrap();
        client.connect();
        Self {
            client,
            events: Vec::new(),
        }
    }

    fn saw(&self, f: impl Fn(&ClientEvent) -> bool) -> bool {
        self.events.iter().any(f)
    }
}

/// Tick every peer until `done` holds
async fn drive(peers: &mut [&mut Peer], done: impl Fn(&[&mut Peer]) -> bool) {
    let deadline = Instant::now() + DEADLINE;
    while !done(&*peers) {
        assert!(Instant::now() < deadline, "timed out waiting for peers");
        for peer in peers.iter_mut() {
            let events = peer.client.update().await;
            peer.events.extend(events);
        }
        tokio::time::sleep(Duration::from_millis(2)).await;
    }
}

fn server_config(protocol: Protocol) -> ServerConfig {
    ServerConfig {
        bind_addr: "127.0.0.1:0".parse().unwrap(),
        protocol,
        asymmetric_key_size: 1024,
        tick_interval: Duration::from_millis(2),
        ..ServerConfig::default()
    }
}

async fn start_server(protocol: Protocol) -> (std::net::SocketAddr, oneshot::Sender<()>) {
    start_server_with(server_config(protocol)).await
}

async fn start_server_with(config: ServerConfig) -> (std::net::SocketAddr, oneshot::Sender<()>) {
    let mut accounts = MemoryAccountStore::new();
    accounts.register("alice", "password1").unwrap();
    accounts.register("bob", "password2").unwrap();
    accounts.register("mallory", "password3").unwrap();
    accounts.set_access("mallory", AccessFlags::BANNED);
    accounts.register("dave", "  password4  ").unwrap();

    let server = Server::bind(config, Box::new(accounts)).await.unwrap();
    let addr = server.local_addr();

    let (stop, stopped) = oneshot::channel::<()>();
    tokio::spawn(server.run_until(async {
        let _ = stopped.await;
    }));
    (addr, stop)
}

fn client_config(addr: std::net::SocketAddr, protocol: Protocol, login: &str, password: &str) -> ClientConfig {
    ClientConfig {
        server_addr: addr,
        protocol,
        login: login.into(),
        password: password.into(),
        tick_interval: Duration::from_millis(2),
        ..ClientConfig::default()
    }
}

fn authenticated(peer: &Peer) -> bool {
    peer.saw(|e| matches!(e, ClientEvent::Authenticated { .. }))
}

async fn alice_and_bob(addr: std::net::SocketAddr) -> (Peer, Peer) {
    let mut alice = Peer::new(client_config(addr, Protocol::Binary, "alice", "password1"));
    let mut bob = Peer::new(client_config(addr, Protocol::Binary, "bob", "password2"));
    drive(&mut [&mut alice, &mut bob], |p| authenticated(p[0]) && authenticated(p[1])).await;
    (alice, bob)
}

/// Offer `path` from `sender` and wait until `receiver` sees the request
async fn offer(sender: &mut Peer, receiver: &mut Peer, to: &str, path: &std::path::Path) -> (u64, FileTransferId) {
    let token = sender.client.handle().send_file(to, path).unwrap();
    drive(&mut [&mut *sender, &mut *receiver], |p| {
        p[1].saw(|e| matches!(e, ClientEvent::TransferRequested { .. }))
    })
    .await;
    let session_id = receiver
        .events
        .iter()
        .rev()
        .find_map(|e| match e {
            ClientEvent::TransferRequested { session_id, .. } => Some(*session_id),
            _ => None,
        })
        .unwrap();
    (token, session_id)
}

/// Final state and reason of a transfer, once it has finished
fn outcome(peer: &Peer, transfer: TransferRef) -> Option<(TransferState, String)> {
    peer.events.iter().find_map(|e| match e {
        ClientEvent::TransferFinished { transfer: t, state, reason } if *t == transfer => {
            Some((*state, reason.clone()))
        }
        _ => None,
    })
}

fn incoming_progress(peer: &Peer, session_id: FileTransferId) -> bool {
    peer.saw(|e| {
        matches!(e, ClientEvent::TransferProgress { transfer: TransferRef::Incoming(id), .. } if *id == session_id)
    })
}

async fn write_pattern(path: &std::path::Path, len: u32) -> Vec<u8> {
    let data: Vec<u8> = (0..len).map(|i| (i * 31 % 251) as u8).collect();
    tokio::fs::write(path, &data).await.unwrap();
    data
}

/// A bare connection that has received the server's key challenge
async fn raw_connection(addr: std::net::SocketAddr) -> Connection {
    let stream = TcpStream::connect(addr).await.unwrap();
    let codec = MessageCodec::new(Arc::new(MessageCatalog::standard().unwrap()), Protocol::Binary);
    let mut connection = Connection::new(stream, "raw", codec);
    match recv_within(&mut connection).await {
        Ok(Message::SvPublicKeyChallenge(_)) => connection,
        other => panic!("expected key challenge, got {:?}", other),
    }
}

async fn recv_within(connection: &mut Connection) -> Result<Message, ProtocolError> {
    tokio::time::timeout(DEADLINE, connection.recv())
        .await
        .expect("timed out waiting for the server")
}

/// Tick the client until the scripted server side has a message
async fn next_from_client(peer: &mut Peer, server: &mut Connection) -> Message {
    let deadline = Instant::now() + DEADLINE;
    loop {
        assert!(Instant::now() < deadline, "timed out waiting for the client");
        let events = peer.client.update().await;
        peer.events.extend(events);
        if let Some(message) = server.try_recv() {
            return message.unwrap();
        }
        tokio::time::sleep(Duration::from_millis(2)).await;
    }
}

#[tokio::test]
async fn test_handshake_with_scripted_server() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let mut peer = Peer::new(client_config(addr, Protocol::Binary, "alice", "password1"));

    let (stream, _) = listener.accept().await.unwrap();
    let codec = MessageCodec::new(Arc::new(MessageCatalog::standard().unwrap()), Protocol::Binary);
    let mut server = Connection::new(stream, "alice", codec.clone());

    server.send(&SvPublicKeyChallenge { key_size: 2048 }.into()).unwrap();
    let public_key = match next_from_client(&mut peer, &mut server).await {
        Message::ClPublicKeyRespond(m) => m.key,
        other => panic!("expected public key, got {:?}", other),
    };
    assert!(peer.saw(|e| *e == ClientEvent::Connected));

    let mut rsa = RsaProvider::new();
    rsa.import_key(&public_key).unwrap();
    assert_eq!(rsa.key_size(), 2048);

    let session_key = AesProvider::new();
    let raw_key = session_key.key().to_vec();
    let wrapped = rsa.encrypt(&raw_key).unwrap();
    server.send(&SvAuthChallenge { session_key: wrapped }.into()).unwrap();

    // No cipher installed yet: a secured respond would fail to decode here
    match next_from_client(&mut peer, &mut server).await {
        Message::ClAuthRespond(m) => {
            assert_eq!(m.login, "alice");
            assert_eq!(m.password, "password1");
        }
        other => panic!("expected credentials, got {:?}", other),
    }
    assert_eq!(peer.client.session_key(), Some(raw_key.as_slice()));

    server.set_cipher(Box::new(session_key));
    server.set_secure(true);
    server
        .send(
            &SvAuthResult {
                result: AuthResult::Accepted,
                message: "Welcome, alice".into(),
            }
            .into(),
        )
        .unwrap();

    drive(&mut [&mut peer], |peers| authenticated(peers[0])).await;
    assert!(peer.client.is_authenticated());

    // The recovered key works for the secure container
    let mut sender = AesProvider::new();
    sender.set_key(peer.client.session_key().unwrap()).unwrap();
    let chat: Message = CsChatMessage {
        username: "alice".into(),
        message: "hello".into(),
    }
    .into();
    let container = SecureMessageContainer::store(&chat, &sender, Protocol::Binary).unwrap();
    let mut receiver = AesProvider::new();
    receiver.set_key(&raw_key).unwrap();
    let extracted = container
        .extract(MessageId::CsChatMessage, codec.catalog(), &mut receiver, Protocol::Binary)
        .unwrap();
    assert_eq!(extracted, chat);

    // And the client now sends secured
    peer.client.handle().chat("over the wire").unwrap();
    match next_from_client(&mut peer, &mut server).await {
        Message::CsChatMessage(m) => assert_eq!(m.message, "over the wire"),
        other => panic!("expected chat, got {:?}", other),
    }
}

#[tokio::test]
async fn test_chat_and_file_transfer() {
    let (addr, stop) = start_server(Protocol::Binary).await;
    let mut alice = Peer::new(client_config(addr, Protocol::Binary, "alice", "password1"));
    let mut bob = Peer::new(client_config(addr, Protocol::Binary, "bob", "password2"));

    drive(&mut [&mut alice], |p| authenticated(p[0])).await;
    drive(&mut [&mut alice, &mut bob], |p| {
        authenticated(p[1])
            && p[0].saw(|e| matches!(e, ClientEvent::UserlistUpdate { connected, .. } if connected == &["bob".to_string()]))
    })
    .await;

    // Userlist
    bob.client.handle().request_userlist().unwrap();
    drive(&mut [&mut bob], |p| {
        p[0].saw(|e| *e == ClientEvent::Userlist(vec!["alice".into(), "bob".into()]))
    })
    .await;

    // Chat is stamped with the sender's login and not echoed back
    alice.client.handle().chat("hi bob").unwrap();
    drive(&mut [&mut alice, &mut bob], |p| {
        p[1].saw(|e| {
            *e == ClientEvent::Chat {
                username: "alice".into(),
                message: "hi bob".into(),
            }
        })
    })
    .await;
    assert!(!alice.saw(|e| matches!(e, ClientEvent::Chat { .. })));

    // File transfer: 52 blocks of 8 KiB, last one 1290 bytes
    let dir = tempfile::tempdir().unwrap();
    let source = dir.path().join("report.bin");
    let data: Vec<u8> = (0..420042u32).map(|i| (i * 7 % 256) as u8).collect();
    tokio::fs::write(&source, &data).await.unwrap();
    let destination = dir.path().join("received.bin");

    let token = alice.client.handle().send_file("bob", &source).unwrap();
    drive(&mut [&mut alice, &mut bob], |p| {
        p[1].saw(|e| matches!(e, ClientEvent::TransferRequested { .. }))
    })
    .await;

    let session_id = bob
        .events
        .iter()
        .find_map(|e| match e {
            ClientEvent::TransferRequested {
                session_id,
                sender,
                file_name,
                file_size,
            } => {
                assert_eq!(sender, "alice");
                assert_eq!(file_name, "report.bin");
                assert_eq!(*file_size, 420042);
                Some(*session_id)
            }
            _ => None,
        })
        .unwrap();
    bob.client.handle().accept_transfer(session_id, &destination).unwrap();

    let finished = |transfer: TransferRef| {
        move |e: &ClientEvent| matches!(e, ClientEvent::TransferFinished { transfer: t, .. } if *t == transfer)
    };
    drive(&mut [&mut alice, &mut bob], |p| {
        p[0].saw(finished(TransferRef::Outgoing(token))) && p[1].saw(finished(TransferRef::Incoming(session_id)))
    })
    .await;

    assert!(alice.saw(|e| matches!(e,
        ClientEvent::TransferFinished { transfer: TransferRef::Outgoing(t), state: TransferState::Success, .. } if *t == token)));
    assert!(bob.saw(|e| matches!(e,
        ClientEvent::TransferFinished { state: TransferState::Success, .. })));

    let blocks = alice
        .events
        .iter()
        .filter(|e| matches!(e, ClientEvent::TransferProgress { transfer: TransferRef::Outgoing(_), .. }))
        .count();
    assert_eq!(blocks, 52);
    assert!(bob.saw(|e| *e
        == ClientEvent::TransferProgress {
            transfer: TransferRef::Incoming(session_id),
            bytes_done: 420042,
            bytes_total: 420042,
        }));

    assert_eq!(tokio::fs::read(&destination).await.unwrap(), data);
    assert_eq!(hash_file(&destination).await.unwrap(), hash_file(&source).await.unwrap());

    // Bob leaves, alice hears about it
    bob.client.handle().disconnect().unwrap();
    drive(&mut [&mut alice, &mut bob], |p| {
        p[0].saw(|e| matches!(e, ClientEvent::UserlistUpdate { disconnected, .. } if disconnected == &["bob".to_string()]))
    })
    .await;

    let _ = stop.send(());
}

#[tokio::test]
async fn test_transfer_to_offline_user_and_rejection() {
    let (addr, stop) = start_server(Protocol::Binary).await;
    let mut alice = Peer::new(client_config(addr, Protocol::Binary, "alice", "password1"));
    let mut bob = Peer::new(client_config(addr, Protocol::Binary, "bob", "password2"));
    drive(&mut [&mut alice, &mut bob], |p| authenticated(p[0]) && authenticated(p[1])).await;

    let dir = tempfile::tempdir().unwrap();
    let source = dir.path().join("note.txt");
    tokio::fs::write(&source, b"short note").await.unwrap();

    let offline = alice.client.handle().send_file("carol", &source).unwrap();
    drive(&mut [&mut alice, &mut bob], |p| {
        p[0].saw(|e| {
            *e == ClientEvent::TransferRejected {
                token: offline,
                result: FileTransferResult::ReceiverUnavailable,
            }
        })
    })
    .await;

    let refused = alice.client.handle().send_file("bob", &source).unwrap();
    drive(&mut [&mut alice, &mut bob], |p| {
        p[1].saw(|e| matches!(e, ClientEvent::TransferRequested { .. }))
    })
    .await;
    let session_id = bob
        .events
        .iter()
        .find_map(|e| match e {
            ClientEvent::TransferRequested { session_id, .. } => Some(*session_id),
            _ => None,
        })
        .unwrap();
    bob.client.handle().reject_transfer(session_id).unwrap();

    drive(&mut [&mut alice, &mut bob], |p| {
        p[0].saw(|e| {
            *e == ClientEvent::TransferRejected {
                token: refused,
                result: FileTransferResult::Rejected,
            }
        })
    })
    .await;
    assert!(alice.client.outgoing_transfer(refused).is_none());

    let _ = stop.send(());
}

#[tokio::test]
async fn test_login_failures() {
    let (addr, stop) = start_server(Protocol::Binary).await;

    let mut wrong = Peer::new(client_config(addr, Protocol::Binary, "alice", "not-her-password"));
    let mut banned = Peer::new(client_config(addr, Protocol::Binary, "mallory", "password3"));
    let failed = |peer: &Peer, expected: AuthResult| {
        peer.saw(|e| matches!(e, ClientEvent::AuthFailed { result, .. } if *result == expected))
    };
    drive(&mut [&mut wrong, &mut banned], |p| {
        failed(p[0], AuthResult::InvalidCredentials) && failed(p[1], AuthResult::AccessDenied)
    })
    .await;
    assert!(!wrong.client.is_authenticated());
    assert!(wrong.saw(|e| matches!(e, ClientEvent::Disconnected { .. })));

    let mut first = Peer::new(client_config(addr, Protocol::Binary, "bob", "password2"));
    drive(&mut [&mut first], |p| authenticated(p[0])).await;
    let mut second = Peer::new(client_config(addr, Protocol::Binary, "bob", "password2"));
    drive(&mut [&mut first, &mut second], |p| failed(p[1], AuthResult::AlreadyLoggedIn)).await;
    assert!(first.client.is_authenticated());

    // Registered with surrounding spaces, logs in with the same text
    let mut padded = Peer::new(client_config(addr, Protocol::Binary, "dave", "  password4  "));
    drive(&mut [&mut padded], |p| authenticated(p[0])).await;

    let _ = stop.send(());
}

#[tokio::test]
async fn test_json_protocol_with_encrypted_credentials() {
    let (addr, stop) = start_server(Protocol::Json).await;
    let mut alice = Peer::new(ClientConfig {
        encrypt_credentials: true,
        ..client_config(addr, Protocol::Json, "alice", "password1")
    });
    let mut bob = Peer::new(client_config(addr, Protocol::Json, "bob", "password2"));
    drive(&mut [&mut alice, &mut bob], |p| authenticated(p[0]) && authenticated(p[1])).await;

    bob.client.handle().chat("{\"not\": \"a header\"}").unwrap();
    drive(&mut [&mut alice, &mut bob], |p| {
        p[0].saw(|e| {
            *e == ClientEvent::Chat {
                username: "bob".into(),
                message: "{\"not\": \"a header\"}".into(),
            }
        })
    })
    .await;

    let _ = stop.send(());
    drive(&mut [&mut alice, &mut bob], |p| {
        p.iter().all(|peer| peer.saw(|e| matches!(e, ClientEvent::Disconnected { .. })))
    })
    .await;
}

#[tokio::test]
async fn test_cancel_pending_request_by_token() {
    let (addr, stop) = start_server(Protocol::Binary).await;
    let (mut alice, mut bob) = alice_and_bob(addr).await;

    let dir = tempfile::tempdir().unwrap();
    let source = dir.path().join("draft.txt");
    write_pattern(&source, 1000).await;

    // Not yet answered: the sender only knows its token
    let (token, session_id) = offer(&mut alice, &mut bob, "bob", &source).await;
    assert!(alice.client.outgoing_transfer(token).is_some());
    alice.client.handle().cancel_transfer(TransferRef::Outgoing(token)).unwrap();

    drive(&mut [&mut alice, &mut bob], |p| {
        outcome(p[1], TransferRef::Incoming(session_id)).is_some()
    })
    .await;
    assert_eq!(
        outcome(&alice, TransferRef::Outgoing(token)),
        Some((TransferState::Cancelled, "cancelled".into()))
    );
    assert_eq!(
        outcome(&bob, TransferRef::Incoming(session_id)),
        Some((TransferState::Cancelled, "cancelled by peer".into()))
    );
    assert!(bob.client.incoming_transfer(session_id).is_none());
    assert!(alice.client.outgoing_transfer(token).is_none());

    let _ = stop.send(());
}

#[tokio::test]
async fn test_cancel_running_transfer_from_either_side() {
    let (addr, stop) = start_server(Protocol::Binary).await;
    let (mut alice, mut bob) = alice_and_bob(addr).await;

    let dir = tempfile::tempdir().unwrap();
    let source = dir.path().join("video.bin");
    write_pattern(&source, 2 * 1024 * 1024).await;

    // Receiver cancels
    let destination = dir.path().join("by-receiver.bin");
    let (token, session_id) = offer(&mut alice, &mut bob, "bob", &source).await;
    bob.client.handle().accept_transfer(session_id, &destination).unwrap();
    drive(&mut [&mut alice, &mut bob], |p| incoming_progress(p[1], session_id)).await;
    assert!(destination.exists());

    bob.client.handle().cancel_transfer(TransferRef::Incoming(session_id)).unwrap();
    drive(&mut [&mut alice, &mut bob], |p| {
        outcome(p[0], TransferRef::Outgoing(token)).is_some()
    })
    .await;
    assert_eq!(
        outcome(&bob, TransferRef::Incoming(session_id)),
        Some((TransferState::Cancelled, "cancelled".into()))
    );
    assert_eq!(
        outcome(&alice, TransferRef::Outgoing(token)),
        Some((TransferState::Cancelled, "cancelled by peer".into()))
    );
    assert!(!destination.exists());

    // Sender cancels
    alice.events.clear();
    bob.events.clear();
    let destination = dir.path().join("by-sender.bin");
    let (token, session_id) = offer(&mut alice, &mut bob, "bob", &source).await;
    bob.client.handle().accept_transfer(session_id, &destination).unwrap();
    drive(&mut [&mut alice, &mut bob], |p| incoming_progress(p[1], session_id)).await;

    alice.client.handle().cancel_transfer(TransferRef::Outgoing(token)).unwrap();
    drive(&mut [&mut alice, &mut bob], |p| {
        outcome(p[1], TransferRef::Incoming(session_id)).is_some()
    })
    .await;
    assert_eq!(
        outcome(&alice, TransferRef::Outgoing(token)),
        Some((TransferState::Cancelled, "cancelled".into()))
    );
    assert_eq!(
        outcome(&bob, TransferRef::Incoming(session_id)),
        Some((TransferState::Cancelled, "cancelled by peer".into()))
    );
    assert!(!destination.exists());

    let _ = stop.send(());
}

#[tokio::test]
async fn test_sender_leaving_mid_transfer() {
    let (addr, stop) = start_server(Protocol::Binary).await;
    let (mut alice, mut bob) = alice_and_bob(addr).await;

    let dir = tempfile::tempdir().unwrap();
    let source = dir.path().join("archive.bin");
    write_pattern(&source, 2 * 1024 * 1024).await;
    let destination = dir.path().join("partial.bin");

    let (_, session_id) = offer(&mut alice, &mut bob, "bob", &source).await;
    bob.client.handle().accept_transfer(session_id, &destination).unwrap();
    drive(&mut [&mut alice, &mut bob], |p| incoming_progress(p[1], session_id)).await;

    // Gone without a goodbye
    drop(alice);
    drive(&mut [&mut bob], |p| {
        outcome(p[0], TransferRef::Incoming(session_id)).is_some()
            && p[0].saw(|e| {
                matches!(e, ClientEvent::UserlistUpdate { disconnected, .. } if disconnected == &["alice".to_string()])
            })
    })
    .await;

    assert_eq!(
        outcome(&bob, TransferRef::Incoming(session_id)),
        Some((TransferState::Cancelled, "peer disconnected".into()))
    );
    assert!(bob.client.incoming_transfer(session_id).is_none());
    assert!(!destination.exists());

    let _ = stop.send(());
}

#[tokio::test]
async fn test_checksum_mismatch_reaches_sender() {
    let (addr, stop) = start_server(Protocol::Binary).await;
    let (mut alice, mut bob) = alice_and_bob(addr).await;

    let dir = tempfile::tempdir().unwrap();
    let source = dir.path().join("ledger.bin");
    let original = write_pattern(&source, 50_000).await;
    let destination = dir.path().join("ledger-copy.bin");

    let (token, session_id) = offer(&mut alice, &mut bob, "bob", &source).await;

    // Same size, different bytes than the hash announced in the request
    let tampered: Vec<u8> = original.iter().map(|b| b ^ 0x5A).collect();
    tokio::fs::write(&source, &tampered).await.unwrap();

    bob.client.handle().accept_transfer(session_id, &destination).unwrap();
    drive(&mut [&mut alice, &mut bob], |p| {
        outcome(p[0], TransferRef::Outgoing(token)).is_some()
    })
    .await;

    assert_eq!(
        outcome(&bob, TransferRef::Incoming(session_id)),
        Some((TransferState::Failure, "checksum mismatch".into()))
    );
    assert_eq!(
        outcome(&alice, TransferRef::Outgoing(token)),
        Some((TransferState::Failure, "checksum mismatch".into()))
    );
    assert!(!destination.exists());

    let _ = stop.send(());
}

#[tokio::test]
async fn test_handshake_timeout_drops_silent_client() {
    let (addr, stop) = start_server_with(ServerConfig {
        handshake_timeout: Duration::from_millis(200),
        ..server_config(Protocol::Binary)
    })
    .await;

    let started = Instant::now();
    let mut raw = raw_connection(addr).await;
    assert!(matches!(recv_within(&mut raw).await, Ok(Message::SvDisconnect(_))));
    assert!(started.elapsed() >= Duration::from_millis(200));

    let closed = recv_within(&mut raw).await.unwrap_err();
    assert!(closed.is_connection_reset(), "unexpected error: {}", closed);

    let _ = stop.send(());
}

#[tokio::test]
async fn test_chat_before_authentication_disconnects() {
    let (addr, stop) = start_server(Protocol::Binary).await;
    let mut alice = Peer::new(client_config(addr, Protocol::Binary, "alice", "password1"));
    drive(&mut [&mut alice], |p| authenticated(p[0])).await;

    let mut raw = raw_connection(addr).await;
    raw.send(
        &CsChatMessage {
            username: "nobody".into(),
            message: "let me in".into(),
        }
        .into(),
    )
    .unwrap();
    let closed = recv_within(&mut raw).await.unwrap_err();
    assert!(closed.is_connection_reset(), "unexpected error: {}", closed);

    // Anything relayed would have been queued before this answer
    alice.client.handle().request_userlist().unwrap();
    drive(&mut [&mut alice], |p| p[0].saw(|e| matches!(e, ClientEvent::Userlist(_)))).await;
    assert!(alice.saw(|e| *e == ClientEvent::Userlist(vec!["alice".into()])));
    assert!(!alice.saw(|e| matches!(e, ClientEvent::Chat { .. })));

    let _ = stop.send(());
}
