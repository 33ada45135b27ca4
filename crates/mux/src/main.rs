//! ptymux
//!
//! Command-line front end: an echo peer, a capture decoder and a minimal
//! line-oriented client.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use ptymux::config::Config;
use ptymux::echo::serve_echo;
use ptymux::inspect::{decode_capture, describe};
use ptymux::{serve_connection, split_connection, LoggingHandler, RouterOptions, Session, SessionEvent};
use ptymux_protocol::FrameCodec;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};

/// ptymux - multiplexed terminal sessions over one stream.
#[derive(Parser, Debug)]
#[command(name = "ptymux")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Path to configuration file
    #[arg(short, long, global = true, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Commands,
}

/// Available commands.
#[derive(Subcommand, Debug, Clone)]
pub enum Commands {
    /// Accept TCP connections and echo every session's input back as output
    Serve {
        /// Address to listen on (overrides the config file)
        #[arg(long, short)]
        listen: Option<String>,
    },

    /// Decode a captured stream of frames and print each envelope
    Dump {
        /// File holding raw frame bytes
        file: PathBuf,

        /// Output in JSON format
        #[arg(long)]
        json: bool,
    },

    /// Open one session to a peer, sending stdin lines as input
    Connect {
        /// Peer address
        addr: String,

        /// Session ID (defaults to a random UUID)
        #[arg(long, short)]
        session: Option<String>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut config = if let Some(config_path) = &cli.config {
        Config::load(config_path)?
    } else {
        Config::load_default()?
    };
    config.apply_env_overrides();

    // Initialize tracing
    let filter = if cli.verbose {
        "debug".to_string()
    } else {
        config.log.level.to_lowercase()
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    if let Commands::Serve {
        listen: Some(listen),
    } = &cli.command
    {
        config.connection.listen = listen.clone();
    }
    config.validate()?;

    match cli.command {
        Commands::Serve { .. } => run_serve(&config).await,
        Commands::Dump { file, json } => run_dump(&config, &file, json),
        Commands::Connect { addr, session } => {
            let session_id = session.unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
            run_connect(&config, &addr, session_id).await
        }
    }
}

async fn run_serve(config: &Config) -> anyhow::Result<()> {
    let addr = config.listen_addr()?;
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;
    tracing::info!("Echo peer listening on {}", addr);

    let options = RouterOptions::from_config(config);
    let read_buffer_size = config.connection.read_buffer_size;

    loop {
        tokio::select! {
            accepted = listener.accept() => {
                let (socket, peer) = accepted.context("Failed to accept connection")?;
                if let Err(e) = socket.set_nodelay(true) {
                    tracing::debug!(error = %e, "Failed to set TCP_NODELAY");
                }
                tracing::info!(peer = %peer, "Connection accepted");
                let options = options.clone();
                tokio::spawn(async move {
                    match serve_echo(socket, options, read_buffer_size).await {
                        Ok(()) => tracing::info!(peer = %peer, "Connection closed"),
                        Err(e) => tracing::warn!(peer = %peer, error = %e, "Connection ended with error"),
                    }
                });
            }
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Shutting down");
                return Ok(());
            }
        }
    }
}

fn run_dump(config: &Config, file: &Path, json: bool) -> anyhow::Result<()> {
    let data = std::fs::read(file)
        .with_context(|| format!("Failed to read capture: {}", file.display()))?;
    let codec = FrameCodec::with_max_frame_size(config.connection.max_frame_size);
    let capture = decode_capture(&data, codec);

    for envelope in &capture.envelopes {
        if json {
            println!("{}", serde_json::to_string(envelope)?);
        } else {
            println!("{}", describe(envelope));
        }
    }
    for note in &capture.notes {
        tracing::debug!(note = %note, "Decode note");
    }

    match capture.error {
        Some(e) => Err(anyhow::anyhow!(
            "Decoding stopped after {} envelopes: {}",
            capture.envelopes.len(),
            e
        )),
        None => Ok(()),
    }
}

async fn run_connect(config: &Config, addr: &str, session_id: String) -> anyhow::Result<()> {
    let socket = TcpStream::connect(addr)
        .await
        .with_context(|| format!("Failed to connect to {}", addr))?;
    let (router, stream) = split_connection(
        socket,
        RouterOptions::from_config(config),
        config.connection.read_buffer_size,
        Arc::new(LoggingHandler),
    );
    let inbound = tokio::spawn(serve_connection(stream, Arc::clone(&router)));

    let mut session = Session::open(&router, session_id)?;
    tracing::info!(session_id = %session.id(), "Session opened");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdout = tokio::io::stdout();
    let mut stdin_open = true;

    loop {
        tokio::select! {
            line = lines.next_line(), if stdin_open => {
                match line? {
                    Some(mut line) => {
                        line.push('\n');
                        session.send_input(line.into_bytes()).await?;
                    }
                    None => {
                        stdin_open = false;
                        session.close();
                    }
                }
            }
            event = session.recv() => {
                match event {
                    Some(SessionEvent::Output(bytes)) => {
                        stdout.write_all(&bytes).await?;
                        stdout.flush().await?;
                    }
                    Some(SessionEvent::Resize(geometry)) => {
                        tracing::debug!(columns = geometry.columns, rows = geometry.rows, "Peer resized");
                    }
                    Some(SessionEvent::Input(_)) => {}
                    Some(SessionEvent::Closed) | None => break,
                }
            }
        }
    }

    if let Err(e) = router.shutdown().await {
        tracing::debug!(error = %e, "Failed to shut down connection");
    }
    match inbound.await? {
        Ok(()) => Ok(()),
        Err(e) => Err(e.into()),
    }
}
