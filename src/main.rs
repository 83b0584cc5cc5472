//! LAN Chat CLI - Main Entry Point
//!
//! # Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────┐
//! │                          CLI Application                             │
//! │   ┌─────────┐   ┌─────────┐   ┌─────────┐   ┌───────────────┐        │
//! │   │ server  │   │  chat   │   │  send   │   │ hash-password │        │
//! │   └─────────┘   └─────────┘   └─────────┘   └───────────────┘        │
//! │                               │                                      │
//! │   ┌──────────────────────────────────────────────────────────────┐   │
//! │   │  Session layer: handshake, chat relay, transfer engine       │   │
//! │   └──────────────────────────────────────────────────────────────┘   │
//! │                               │                                      │
//! │   ┌──────────────────────────────────────────────────────────────┐   │
//! │   │  Protocol layer: framing, binary/JSON codecs, secure box     │   │
//! │   └──────────────────────────────────────────────────────────────┘   │
//! │                               │                                      │
//! │   ┌──────────────────────────────────────────────────────────────┐   │
//! │   │  Network layer (tokio): TCP, reader/writer tasks             │   │
//! │   └──────────────────────────────────────────────────────────────┘   │
//! └─────────────────────────────────────────────────────────────────────┘
//! ```

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn, Level};
use tracing_subscriber::FmtSubscriber;

use lanchat::client::{Client, ClientConfig, ClientEvent, TransferRef};
use lanchat::protocol::Protocol;
use lanchat::server::{MemoryAccountStore, PasswordHash, Server, ServerConfig};
use lanchat::transfer::{sanitize_file_name, TransferState, DEFAULT_BLOCK_SIZE};
use lanchat::validation::validate_password;

/// LAN chat and file transfer
#[derive(Parser)]
#[command(name = "lanchat")]
#[command(version = "0.1.0")]
#[command(about = "LAN chat and file transfer over an encrypted message protocol", long_about = None)]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the chat server
    Server {
        /// Address to bind to
        #[arg(short, long, default_value = "0.0.0.0:7070")]
        bind: SocketAddr,

        /// Wire format (binary or json)
        #[arg(long, default_value = "binary")]
        protocol: Protocol,

        /// Account as login:password (repeatable)
        #[arg(short, long = "user", value_name = "LOGIN:PASSWORD")]
        users: Vec<String>,

        /// RSA key size requested from clients
        #[arg(long, default_value = "2048")]
        key_size: usize,

        /// Seconds a client may take to log in
        #[arg(long, default_value = "30")]
        handshake_timeout: u64,
    },

    /// Connect and chat; each stdin line is sent as a message
    Chat {
        #[command(flatten)]
        connection: ConnectionArgs,

        /// Accept offered files into this directory (offers are rejected otherwise)
        #[arg(long)]
        download_dir: Option<PathBuf>,
    },

    /// Send one file to a logged-in user
    Send {
        #[command(flatten)]
        connection: ConnectionArgs,

        /// Receiving user
        #[arg(long)]
        to: String,

        /// Block size in bytes
        #[arg(long, default_value_t = DEFAULT_BLOCK_SIZE)]
        block_size: u32,

        /// File to send
        file: PathBuf,
    },

    /// Print a salted password hash
    HashPassword {
        password: String,
    },
}

#[derive(clap::Args)]
struct ConnectionArgs {
    /// Server address
    #[arg(short, long, default_value = "127.0.0.1:7070")]
    server: SocketAddr,

    /// Wire format (binary or json)
    #[arg(long, default_value = "binary")]
    protocol: Protocol,

    #[arg(short, long)]
    login: String,

    #[arg(short, long)]
    password: String,

    /// Send credentials encrypted with the session key
    #[arg(long)]
    encrypt_credentials: bool,
}

impl ConnectionArgs {
    fn into_config(self) -> ClientConfig {
        ClientConfig {
            server_addr: self.server,
            protocol: self.protocol,
            login: self.login,
            password: self.password,
            encrypt_credentials: self.encrypt_credentials,
            ..ClientConfig::default()
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Set up logging
    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .without_time()
        .finish();

    tracing::subscriber::set_global_default(subscriber)?;

    match cli.command {
        Commands::Server {
            bind,
            protocol,
            users,
            key_size,
            handshake_timeout,
        } => {
            let config = ServerConfig {
                bind_addr: bind,
                protocol,
                asymmetric_key_size: key_size,
                handshake_timeout: Duration::from_secs(handshake_timeout),
                ..ServerConfig::default()
            };
            run_server(config, &users).await
        }

        Commands::Chat {
            connection,
            download_dir,
        } => run_chat(connection.into_config(), download_dir).await,

        Commands::Send {
            connection,
            to,
            block_size,
            file,
        } => {
            let mut config = connection.into_config();
            config.max_block_size = block_size;
            run_send(config, &to, file).await
        }

        Commands::HashPassword { password } => {
            let password = validate_password(&password)?;
            println!("{}", PasswordHash::new(password));
            Ok(())
        }
    }
}

async fn run_server(config: ServerConfig, users: &[String]) -> Result<()> {
    info!("🚀 Starting chat server...");

    let mut accounts = MemoryAccountStore::new();
    for user in users {
        let (login, password) = user
            .split_once(':')
            .with_context(|| format!("Expected LOGIN:PASSWORD, got '{}'", user))?;
        accounts
            .register(login, password)
            .with_context(|| format!("Invalid account '{}'", login))?;
    }
    if accounts.is_empty() {
        warn!("No accounts configured, nobody will be able to log in");
    }
    info!("👥 {} account(s) loaded", accounts.len());

    let server = Server::bind(config, Box::new(accounts)).await?;
    server.run().await
}

/// Connect and drive the client until it authenticates
async fn connect(config: ClientConfig) -> Result<Client> {
    let tick = config.tick_interval;
    let mut client = Client::new(config).context("Invalid client configuration")?;
    client.connect();

    let mut interval = tokio::time::interval(tick);
    loop {
        interval.tick().await;
        for event in client.update().await {
            match event {
                ClientEvent::Authenticated { message } => {
                    info!("🔐 {}", message);
                    return Ok(client);
                }
                ClientEvent::ConnectionFailed(reason) => bail!("Connection failed: {}", reason),
                ClientEvent::AuthFailed { result, message } => {
                    bail!("Login failed ({}): {}", result, message)
                }
                ClientEvent::Disconnected { reason } => bail!("Disconnected: {}", reason),
                _ => {}
            }
        }
    }
}

async fn run_chat(config: ClientConfig, download_dir: Option<PathBuf>) -> Result<()> {
    if let Some(dir) = &download_dir {
        tokio::fs::create_dir_all(dir)
            .await
            .with_context(|| format!("Failed to create download directory: {:?}", dir))?;
    }

    let tick = config.tick_interval;
    let mut client = connect(config).await?;
    let handle = client.handle();
    handle.request_userlist()?;

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdin_open = true;
    let mut interval = tokio::time::interval(tick);

    loop {
        tokio::select! {
            line = lines.next_line(), if stdin_open => {
                match line.context("Failed to read stdin")? {
                    Some(line) if line.trim().is_empty() => {}
                    Some(line) => handle.chat(line)?,
                    None => {
                        stdin_open = false;
                        handle.disconnect()?;
                    }
                }
            }
            _ = interval.tick() => {
                for event in client.update().await {
                    match event {
                        ClientEvent::Chat { username, message } => println!("<{}> {}", username, message),
                        ClientEvent::Userlist(users) => println!("* online: {}", users.join(", ")),
                        ClientEvent::UserlistUpdate { connected, disconnected } => {
                            for user in connected {
                                println!("* {} joined", user);
                            }
                            for user in disconnected {
                                println!("* {} left", user);
                            }
                        }
                        ClientEvent::TransferRequested { session_id, sender, file_name, file_size } => {
                            println!("* {} offers '{}' ({})", sender, file_name, format_size(file_size));
                            match (&download_dir, sanitize_file_name(&file_name)) {
                                (Some(dir), Ok(name)) => handle.accept_transfer(session_id, dir.join(name))?,
                                _ => handle.reject_transfer(session_id)?,
                            }
                        }
                        ClientEvent::TransferFinished { transfer, state, reason } => {
                            println!("* {} {:?}: {}", transfer, state, reason);
                        }
                        ClientEvent::Disconnected { reason } => {
                            info!("👋 {}", reason);
                            return Ok(());
                        }
                        _ => {}
                    }
                }
            }
        }
    }
}

async fn run_send(config: ClientConfig, receiver: &str, file: PathBuf) -> Result<()> {
    if !file.is_file() {
        bail!("File not found: {:?}", file);
    }

    let tick = config.tick_interval;
    let mut client = connect(config).await?;
    let handle = client.handle();

    info!("📊 Calculating file hash...");
    let token = handle.send_file(receiver, &file)?;
    let ours = TransferRef::Outgoing(token);

    let mut progress: Option<ProgressBar> = None;
    let mut interval = tokio::time::interval(tick);

    loop {
        interval.tick().await;
        for event in client.update().await {
            match event {
                ClientEvent::TransferStarted { transfer, session_id, block_size } if transfer == ours => {
                    info!("📤 {} accepted as {} ({} byte blocks)", receiver, session_id, block_size);
                    let total = client
                        .outgoing_transfer(token)
                        .map_or(0, |t| t.file_size);
                    progress = Some(create_progress_bar(total));
                }
                ClientEvent::TransferProgress { transfer, bytes_done, .. } if transfer == ours => {
                    if let Some(pb) = &progress {
                        pb.set_position(bytes_done);
                    }
                }
                ClientEvent::TransferRejected { token: rejected, result } if rejected == token => {
                    bail!("Transfer refused: {}", result);
                }
                ClientEvent::TransferFinished { transfer, state, reason } if transfer == ours => {
                    if let Some(pb) = progress.take() {
                        pb.finish_and_clear();
                    }
                    handle.disconnect()?;
                    client.update().await;
                    if state == TransferState::Success {
                        info!("✅ {:?} delivered to {}", file, receiver);
                        return Ok(());
                    }
                    bail!("Transfer {:?}: {}", state, reason);
                }
                ClientEvent::Disconnected { reason } => bail!("Disconnected: {}", reason),
                _ => {}
            }
        }
    }
}

fn create_progress_bar(total_size: u64) -> ProgressBar {
    let pb = ProgressBar::new(total_size);
    let style = ProgressStyle::default_bar()
        .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {bytes}/{total_bytes} ({bytes_per_sec}, {eta})")
        .map(|style| style.progress_chars("#>-"))
        .unwrap_or_else(|_| ProgressStyle::default_bar());
    pb.set_style(style);
    pb
}

/// Format file size for display
fn format_size(size: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;
    const GB: u64 = MB * 1024;

    if size >= GB {
        format!("{:.2} GB", size as f64 / GB as f64)
    } else if size >= MB {
        format!("{:.2} MB", size as f64 / MB as f64)
    } else if size >= KB {
        format!("{:.2} KB", size as f64 / KB as f64)
    } else {
        format!("{} B", size)
    }
}
