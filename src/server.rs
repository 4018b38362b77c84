//! Listener and live-session registry
//!
//! Accepts proxy clients, hands each one to its own session task, and
//! tracks the live set so a shutdown can close everything that is still
//! in flight. Session failures are logged and never take the listener
//! down; only a failure to keep accepting does.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use tokio::net::{TcpListener, TcpSocket, TcpStream};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::ca::CertificateAuthority;
use crate::errors::{ProxyError, Result};
use crate::session::ProxyConnection;
use crate::sniffer::PasswordCollector;

pub struct ProxyServer {
    host: String,
    port: u16,
    backlog: u32,
    buffer_size: usize,
    ca: Arc<CertificateAuthority>,
    collector: Arc<PasswordCollector>,
    /// Live sessions by id; each holds the token that cancels it.
    sessions: Arc<DashMap<u64, CancellationToken>>,
    next_id: AtomicU64,
    shutdown: CancellationToken,
}

impl ProxyServer {
    pub fn new(
        host: &str,
        port: u16,
        backlog: u32,
        buffer_size: usize,
        ca: Arc<CertificateAuthority>,
        collector: Arc<PasswordCollector>,
    ) -> Self {
        Self {
            host: host.to_string(),
            port,
            backlog,
            buffer_size: buffer_size.max(1),
            ca,
            collector,
            sessions: Arc::new(DashMap::new()),
            next_id: AtomicU64::new(0),
            shutdown: CancellationToken::new(),
        }
    }

    /// Stops accepting and cancels every live session. `run` returns once
    /// all of them have finished their teardown.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    pub async fn run(&self) -> Result<()> {
        let listener = self.bind().await?;
        info!("serving on {}", listener.local_addr()?);
        self.serve(listener).await
    }

    async fn bind(&self) -> Result<TcpListener> {
        let mut addrs = tokio::net::lookup_host((self.host.as_str(), self.port)).await?;
        let addr = addrs.next().ok_or_else(|| {
            ProxyError::Io(std::io::Error::new(
                std::io::ErrorKind::AddrNotAvailable,
                format!("{} did not resolve", self.host),
            ))
        })?;
        let socket = match addr {
            SocketAddr::V4(_) => TcpSocket::new_v4()?,
            SocketAddr::V6(_) => TcpSocket::new_v6()?,
        };
        socket.set_reuseaddr(true)?;
        socket.bind(addr)?;
        Ok(socket.listen(self.backlog)?)
    }

    async fn serve(&self, listener: TcpListener) -> Result<()> {
        let mut tasks = JoinSet::new();
        let result = loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => {
                    warn!("cancellation requested, no longer accepting");
                    break Ok(());
                }
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => self.spawn_session(&mut tasks, stream, peer),
                    Err(e) => break Err(ProxyError::Io(e)),
                },
                // Reap finished session tasks as the server runs.
                Some(_) = tasks.join_next(), if !tasks.is_empty() => {}
            }
        };
        drop(listener);

        info!("closing live sessions (num={})", self.sessions.len());
        for entry in self.sessions.iter() {
            entry.value().cancel();
        }
        while tasks.join_next().await.is_some() {}
        info!("all sessions closed");
        result
    }

    fn spawn_session(&self, tasks: &mut JoinSet<()>, stream: TcpStream, peer: SocketAddr) {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        let token = self.shutdown.child_token();
        self.sessions.insert(id, token.clone());

        let registry = Arc::clone(&self.sessions);
        let close_hook = Box::new(move || {
            registry.remove(&id);
        });
        let mut session = ProxyConnection::new(
            id,
            stream,
            peer,
            self.buffer_size,
            Arc::clone(&self.ca),
            Arc::clone(&self.collector),
            close_hook,
        );

        tasks.spawn(async move {
            tokio::select! {
                _ = token.cancelled() => {
                    warn!("({id}) session cancelled");
                }
                result = session.run() => {
                    if let Err(e) = result {
                        warn!("({id}) {e}");
                    }
                }
            }
            session.close().await;
        });
    }

    #[cfg(test)]
    fn live_sessions(&self) -> usize {
        self.sessions.len()
    }
}
