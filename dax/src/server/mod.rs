//! The tag server: owns the tag database and accepts client sessions.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::net::TcpListener;

use crate::error::DaxResult;
use crate::tagbase::Tagbase;

mod session;

/// A running tag server. Clones are cheap and share the same database, so
/// an embedding can keep one while the accept loop owns another; there is
/// no process-wide singleton.
#[derive(Clone)]
pub struct Server {
    inner: Arc<ServerInner>,
}

struct ServerInner {
    tagbase: Tagbase,
    next_session: AtomicU64,
}

impl Server {
    /// Create a server with a fresh database holding only the reserved
    /// tags and types.
    pub fn new() -> Server {
        Server {
            inner: Arc::new(ServerInner {
                tagbase: Tagbase::new(),
                next_session: AtomicU64::new(1),
            }),
        }
    }

    /// Direct access to the database, for embeddings that register
    /// virtual tags or inspect state without a socket.
    pub fn tagbase(&self) -> &Tagbase {
        &self.inner.tagbase
    }

    /// Accept clients forever. Each session runs in its own task; a
    /// session failing never takes the server down.
    pub async fn serve(&self, listener: TcpListener) -> DaxResult<()> {
        log::info!(
            "tag server listening on {}",
            listener.local_addr().map(|a| a.to_string()).unwrap_or_default()
        );
        loop {
            let (socket, addr) = listener.accept().await?;
            log::info!("client connected from {addr}");
            let server = self.clone();
            tokio::spawn(async move {
                match session::run(server, socket).await {
                    Ok(()) => log::info!("client {addr} disconnected"),
                    Err(err) => log::info!("client {addr} dropped: {err}"),
                }
            });
        }
    }

    fn next_session_id(&self) -> u64 {
        self.inner.next_session.fetch_add(1, Ordering::Relaxed)
    }
}

impl Default for Server {
    fn default() -> Self {
        Server::new()
    }
}
