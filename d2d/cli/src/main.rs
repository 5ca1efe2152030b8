//! D2D Command Line
//!
//! Sends files to a paired device, or listens for framed messages from one.
//!
//! # Usage
//!
//! ```bash
//! # Send two files over a plain socket
//! d2d send --host 192.168.1.20 --port 5001 --sec-key paired-secret a.jpg b.png
//!
//! # Send over TLS using settings from a config file
//! d2d --config ~/.config/d2d/d2d.toml send --secured report.pdf
//!
//! # Accept one peer and store three files
//! d2d listen --port 5001 --count 3 --out ./inbox
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tokio::net::TcpListener;
use tracing::{error, info, warn};

use d2d_core::frame::{self, FrameLimits};
use d2d_core::{
    default_config_path, load_config_from_path, ConfigOverrides, ConnectionEvent, D2dMessage,
    D2dService, FileHeader, TlsTrust,
};

/// Slack added to the watchdog interval while waiting for the first event
const OPEN_GRACE: Duration = Duration::from_secs(5);

/// Device-to-device framed message transfer
#[derive(Parser, Debug)]
#[command(name = "d2d")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short = 'c', long, env = "D2D_CONFIG", value_name = "FILE", global = true)]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short = 'l', long, env = "D2D_LOG_LEVEL", default_value = "info", global = true)]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Send files to a peer
    Send {
        /// Peer host name or address
        #[arg(long)]
        host: Option<String>,

        /// Peer port
        #[arg(short = 'p', long)]
        port: Option<u16>,

        /// Use TLS
        #[arg(long)]
        secured: bool,

        /// Shared pairing key sent with every message
        #[arg(long, env = "D2D_SEC_KEY")]
        sec_key: Option<String>,

        /// Bundled peer certificate (PEM or DER)
        #[arg(long, value_name = "FILE")]
        cert: Option<PathBuf>,

        /// TLS trust mode (trust-on-first-use, pinned-certificate)
        #[arg(long)]
        trust: Option<TlsTrust>,

        /// Files to send, in order
        #[arg(required = true, value_name = "FILE")]
        files: Vec<PathBuf>,
    },

    /// Accept one peer and read framed messages
    Listen {
        /// Port to bind on all interfaces
        #[arg(short = 'p', long)]
        port: u16,

        /// Number of messages to read before exiting
        #[arg(short = 'n', long, default_value_t = 1)]
        count: usize,

        /// Directory to store received bodies under their fileName
        #[arg(short = 'o', long, value_name = "DIR")]
        out: Option<PathBuf>,
    },
}

/// Initialize tracing subscriber for logging
fn init_logging(level: &str) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        tracing_subscriber::EnvFilter::new(format!("d2d={level},d2d_core={level}"))
    });

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_line_number(true)
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(&args.log_level);

    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    let result = match args.command {
        Command::Send {
            host,
            port,
            secured,
            sec_key,
            cert,
            trust,
            files,
        } => {
            let mut overrides = ConfigOverrides::new();
            overrides.host = host;
            overrides.port = port;
            overrides.sec_key = sec_key;
            overrides.secured = secured.then_some(true);
            overrides.certificate = cert;
            overrides.trust = trust;
            send(args.config, &overrides, &files).await
        }
        Command::Listen { port, count, out } => listen(port, count, out.as_deref()).await,
    };

    if let Err(ref e) = result {
        error!(error = ?e, "d2d failed");
    }
    result
}

async fn send(config_path: Option<PathBuf>, overrides: &ConfigOverrides, files: &[PathBuf]) -> Result<()> {
    let mut config = load_config_from_path(config_path.or_else(default_config_path))
        .context("Failed to load configuration")?;
    overrides.apply(&mut config);
    config.validate().context("Invalid configuration")?;

    info!(
        endpoint = %config.connection.endpoint(),
        secured = config.connection.is_secured(),
        source = %config.source(),
        "Connecting"
    );

    let wait = config.connection.watchdog_interval() + OPEN_GRACE;
    let (service, mut events) = D2dService::new(config.connection)?;
    service.open()?;

    match tokio::time::timeout(wait, events.recv()).await {
        Ok(Some(ConnectionEvent::Opened)) => info!("Connection opened"),
        Ok(Some(ConnectionEvent::ConnectFailed)) => bail!("Connection failed"),
        Ok(Some(ConnectionEvent::Closed) | None) => bail!("Connection closed before opening"),
        Err(_) => bail!("Timed out waiting for the connection to open"),
    }

    let total = u32::try_from(files.len()).context("Too many files")?;
    for (index, path) in files.iter().enumerate() {
        let num = u32::try_from(index + 1).context("Too many files")?;
        let body = tokio::fs::read(path)
            .await
            .with_context(|| format!("Failed to read {}", path.display()))?;

        let header = FileHeader::new(num, total, file_name(path), file_type(path));
        let size = body.len();
        service
            .send(D2dMessage::file(&header, body))
            .await
            .with_context(|| format!("Failed to send {}", path.display()))?;

        info!(num, total, file = %header.file_name, size, "Sent file");
    }

    service.close();
    info!(count = files.len(), "All files sent");
    Ok(())
}

async fn listen(port: u16, count: usize, out: Option<&Path>) -> Result<()> {
    if let Some(dir) = out {
        tokio::fs::create_dir_all(dir)
            .await
            .with_context(|| format!("Failed to create {}", dir.display()))?;
    }

    let listener = TcpListener::bind(("0.0.0.0", port))
        .await
        .with_context(|| format!("Failed to bind port {port}"))?;
    info!(port, "Listening");

    let (mut stream, peer) = listener.accept().await.context("Failed to accept peer")?;
    info!(peer = %peer, "Peer connected");

    let limits = FrameLimits::default();
    for index in 0..count {
        let message = frame::read_message(&mut stream, &limits)
            .await
            .with_context(|| format!("Failed to read message {}", index + 1))?;

        info!(
            index = index + 1,
            header = ?message.header(),
            size = message.body_len(),
            "Received message"
        );

        if let Some(dir) = out {
            store(dir, &message).await?;
        }
    }

    info!(count, "Done");
    Ok(())
}

async fn store(dir: &Path, message: &D2dMessage) -> Result<()> {
    let Some(name) = message.header_value("fileName").and_then(safe_name) else {
        warn!("Message has no usable fileName, body not stored");
        return Ok(());
    };

    let path = dir.join(name);
    tokio::fs::write(&path, message.body())
        .await
        .with_context(|| format!("Failed to write {}", path.display()))?;
    info!(path = %path.display(), "Stored file");
    Ok(())
}

/// Last path component of a peer-supplied name
fn safe_name(name: &str) -> Option<&str> {
    Path::new(name)
        .file_name()
        .and_then(|n| n.to_str())
        .filter(|n| !n.is_empty())
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
}

fn file_type(path: &Path) -> String {
    path.extension()
        .map(|e| e.to_string_lossy().to_lowercase())
        .unwrap_or_default()
}
