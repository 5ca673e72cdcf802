//! dcnet
//!
//! Negotiates a WebRTC data channel over a TCP connection and exchanges a
//! greeting over it.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use dcnet::config::default_config_path;
use dcnet::{
    dial_timeout, Config, DataConn, DataTransport, EndpointFactory, Listener, MemoryEndpointFactory,
    MemoryNetwork, RwSignaler, Signaler, WebRtcEndpointFactory,
};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};

/// Message sent by each side once the connection is up.
const GREETING: &[u8] = b"Hello world!";

/// Bound on the whole self-test run.
const SELFTEST_TIMEOUT: Duration = Duration::from_secs(30);

/// dcnet - WebRTC data channel connections negotiated over any byte pipe.
#[derive(Parser, Debug)]
#[command(name = "dcnet")]
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
    /// Wait for one TCP connection and accept a data channel over it
    Listen {
        /// Address to listen on
        #[arg(long, default_value = "127.0.0.1:50000")]
        addr: String,
    },

    /// Connect over TCP and dial a data channel
    Dial {
        /// Address of the listening side
        #[arg(long, default_value = "127.0.0.1:50000")]
        addr: String,
    },

    /// Dial and accept in this process over an in-memory pipe
    Selftest {
        /// Use in-process endpoints instead of WebRTC
        #[arg(long)]
        memory: bool,
    },

    /// Print the effective configuration
    Config {
        /// Write it to the configuration file instead
        #[arg(long)]
        write: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config_path = cli.config.clone().unwrap_or_else(default_config_path);
    let mut config = Config::load(&config_path)?;
    config.apply_env_overrides();
    config.validate()?;

    let level = if cli.verbose { "debug" } else { config.log.level.as_str() };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    tracing::debug!("Using config file: {:?}", config_path);

    match cli.command {
        Commands::Listen { addr } => {
            let listener = TcpListener::bind(&addr)
                .await
                .with_context(|| format!("Failed to listen on {}", addr))?;
            tracing::info!("Waiting for a signaling connection on {}", addr);

            let (stream, peer) = listener.accept().await?;
            tracing::info!("Signaling connection from {}", peer);

            let factory = WebRtcEndpointFactory::new(config.webrtc_config());
            let signaler = RwSignaler::new(stream, factory, config.signaler_config())?;
            run_listener(signaler, &config).await?;
        }
        Commands::Dial { addr } => {
            let stream = TcpStream::connect(&addr)
                .await
                .with_context(|| format!("Failed to connect to {}", addr))?;
            tracing::info!("Signaling over {}", addr);

            let factory = WebRtcEndpointFactory::new(config.webrtc_config());
            let signaler = RwSignaler::new(stream, factory, config.signaler_config())?;
            run_dialer(signaler, &config).await?;
        }
        Commands::Selftest { memory } => {
            let result = if memory {
                let factory = MemoryEndpointFactory::new(MemoryNetwork::new());
                tokio::time::timeout(SELFTEST_TIMEOUT, selftest(factory, &config)).await
            } else {
                let factory = WebRtcEndpointFactory::new(config.webrtc_config());
                tokio::time::timeout(SELFTEST_TIMEOUT, selftest(factory, &config)).await
            };
            result.context("Self-test timed out")??;
            println!("All good!");
        }
        Commands::Config { write } => {
            if write {
                config.save(&config_path)?;
                println!("Configuration written to {}", config_path.display());
            } else {
                print!("{}", config.to_toml()?);
            }
        }
    }

    Ok(())
}

/// Dials and accepts over the two ends of an in-memory pipe.
async fn selftest<F>(factory: F, config: &Config) -> anyhow::Result<()>
where
    F: EndpointFactory + Clone,
{
    let (a, b) = tokio::io::duplex(64 * 1024);
    let dialer = RwSignaler::new(a, factory.clone(), config.signaler_config())?;
    let acceptor = RwSignaler::new(b, factory, config.signaler_config())?;

    let (dialed, accepted) = tokio::join!(run_dialer(dialer, config), run_listener(acceptor, config));
    dialed.context("dialing side failed")?;
    accepted.context("accepting side failed")?;
    Ok(())
}

async fn run_listener<S, F>(signaler: RwSignaler<S, F>, config: &Config) -> anyhow::Result<()>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
    F: EndpointFactory,
{
    let listener = Listener::new(signaler).with_open_timeout(config.open_timeout());
    let conn = listener.accept().await.context("Failed to accept")?;
    tracing::info!("Accepted connection on {}", listener.addr());

    let received = exchange(&conn).await?;
    println!("Received: {}", String::from_utf8_lossy(&received));

    conn.close().await?;
    listener.close().await?;
    Ok(())
}

async fn run_dialer<S, F>(signaler: RwSignaler<S, F>, config: &Config) -> anyhow::Result<()>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
    F: EndpointFactory,
{
    let conn = dial_timeout(&signaler, config.open_timeout())
        .await
        .context("Failed to dial")?;
    tracing::info!("Dialed connection to {}", conn.remote_addr());

    let received = exchange(&conn).await?;
    println!("Received: {}", String::from_utf8_lossy(&received));

    conn.close().await?;
    signaler.close().await?;
    Ok(())
}

/// Sends the greeting and reads the peer's.
async fn exchange<T: DataTransport>(conn: &DataConn<T>) -> anyhow::Result<Vec<u8>> {
    conn.write(GREETING).await?;

    let mut received = Vec::with_capacity(GREETING.len());
    let mut buf = [0u8; 64];
    while received.len() < GREETING.len() {
        let n = conn.read(&mut buf).await?;
        if n == 0 {
            anyhow::bail!("connection closed after {} bytes", received.len());
        }
        received.extend_from_slice(&buf[..n]);
    }
    Ok(received)
}
