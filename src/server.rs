//! Listening for FastCGI connections and running them until shutdown.

use std::fmt;
use std::future::Future;
use std::io;
use std::path::PathBuf;
use std::pin::pin;
use std::sync::{Arc, Weak};
use std::task::Poll;

use async_lock::{Semaphore, SemaphoreGuardArc};
use compact_str::{CompactString, ToCompactString};
use futures_util::future::{self, Either};
use futures_util::task::AtomicWaker;
use tokio_util::compat::{TokioAsyncReadCompatExt, TokioAsyncWriteCompatExt};
use tracing::Instrument;

use crate::config::{Address, Config};
use crate::connection::{Connection, Shutdown};
use crate::engine::ScriptEngine;
use crate::request::Host;


/// A bound listening socket.
///
/// A Unix socket file is removed again when the [`Listener`] is dropped.
#[derive(Debug)]
pub enum Listener {
    /// A TCP socket.
    Tcp(tokio::net::TcpListener),
    /// A Unix domain socket and the path it is bound to.
    #[cfg(unix)]
    Unix(tokio::net::UnixListener, PathBuf),
}

enum Stream {
    Tcp(tokio::net::TcpStream),
    #[cfg(unix)]
    Unix(tokio::net::UnixStream),
}

impl Listener {
    /// Binds a socket at `address`.
    ///
    /// A file left over at a Unix socket path is removed first, and the
    /// new socket's permissions are set to `socket_mode`.
    ///
    /// # Errors
    /// Fails if the socket cannot be bound or its permissions cannot be set.
    pub async fn bind(address: &Address, socket_mode: u32) -> io::Result<Self> {
        match address {
            Address::Tcp(addr) => tokio::net::TcpListener::bind(addr.as_str()).await.map(Self::Tcp),
            #[cfg(unix)]
            Address::Unix(path) => {
                use std::os::unix::fs::PermissionsExt;
                match std::fs::remove_file(path) {
                    Ok(()) => tracing::info!(path = %path.display(), "stale socket file removed"),
                    Err(e) if e.kind() == io::ErrorKind::NotFound => (),
                    Err(e) => return Err(e),
                }
                let inner = tokio::net::UnixListener::bind(path)?;
                // Construct first, so the file is removed on failure
                let this = Self::Unix(inner, path.clone());
                std::fs::set_permissions(path, std::fs::Permissions::from_mode(socket_mode))?;
                Ok(this)
            },
            #[cfg(not(unix))]
            Address::Unix(_) => {
                let _ = socket_mode;
                Err(io::Error::new(io::ErrorKind::Unsupported, "Unix sockets are not supported"))
            },
        }
    }

    /// Returns the address this [`Listener`] is bound to.
    ///
    /// # Errors
    /// Fails if the local address of a TCP socket cannot be determined.
    pub fn local_addr(&self) -> io::Result<Address> {
        match self {
            Self::Tcp(l) => Ok(Address::Tcp(l.local_addr()?.to_string())),
            #[cfg(unix)]
            Self::Unix(_, path) => Ok(Address::Unix(path.clone())),
        }
    }

    fn protocol(&self) -> &'static str {
        match self {
            Self::Tcp(_) => "tcp",
            #[cfg(unix)]
            Self::Unix(..) => "unix",
        }
    }

    async fn accept(&self) -> io::Result<(Stream, CompactString)> {
        match self {
            Self::Tcp(l) => {
                let (s, remote) = l.accept().await?;
                Ok((Stream::Tcp(s), remote.to_compact_string()))
            },
            #[cfg(unix)]
            Self::Unix(l, _) => {
                let (s, remote) = l.accept().await?;
                let remote = remote.as_pathname()
                    .map_or(CompactString::const_new("(unnamed)"), |p| p.display().to_compact_string());
                Ok((Stream::Unix(s), remote))
            },
        }
    }
}

impl Drop for Listener {
    fn drop(&mut self) {
        #[cfg(unix)]
        if let Self::Unix(_, path) = self {
            if let Err(e) = std::fs::remove_file(&*path) {
                let error: &dyn std::error::Error = &e;
                tracing::warn!(path = %path.display(), error, "removing socket file failed");
            }
        }
    }
}


/// A FastCGI application server running scripts with a [`ScriptEngine`].
#[derive(Debug)]
pub struct Server {
    config: Config,
    host: Host,
    shutdown: Arc<Shutdown>,
    tasks: WaitGroup,
}

impl Server {
    /// Creates a [`Server`] running scripts with `engine`.
    pub fn new(config: Config, engine: impl ScriptEngine) -> Self {
        Self::with_host(config, Host::new(engine))
    }

    /// Creates a [`Server`] sharing `host` with other servers.
    #[must_use]
    pub fn with_host(config: Config, host: Host) -> Self {
        Self { config, host, shutdown: Arc::default(), tasks: WaitGroup::default() }
    }

    /// Returns the configuration of this [`Server`].
    #[inline]
    #[must_use]
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Returns the services shared by all connections.
    #[inline]
    #[must_use]
    pub fn host(&self) -> &Host {
        &self.host
    }

    /// Returns the number of connections currently being served.
    #[inline]
    #[must_use]
    pub fn active_connections(&self) -> usize {
        self.tasks.tasks()
    }

    /// Binds a [`Listener`] at the configured address.
    ///
    /// # Errors
    /// See [`Listener::bind`].
    pub async fn bind(&self) -> io::Result<Listener> {
        let listener = Listener::bind(&self.config.address, self.config.socket_mode).await?;
        tracing::info!(protocol = listener.protocol(), address = %self.config.address, "server created");
        Ok(listener)
    }

    /// Accepts connections on `listener` until [`Server::shutdown`] is
    /// called. Every connection is served on its own task.
    ///
    /// At most `max_conns` connections are served at once. Further clients
    /// wait in the listen backlog.
    pub async fn serve(&self, listener: &Listener) {
        let slots = Arc::new(Semaphore::new(self.config.max_conns.get()));
        let protocol = listener.protocol();
        let local = listener.local_addr().map_or_else(|_| self.config.address.to_compact_string(), |a| a.to_compact_string());

        loop {
            // A slot must be held before accepting to respect max_conns
            let Some(permit) = self.until_shutdown(slots.acquire_arc()).await else {
                break;
            };
            let (stream, remote) = match self.until_shutdown(listener.accept()).await {
                None => break,
                Some(Ok(c)) => c,
                Some(Err(e)) => {
                    let error: &dyn std::error::Error = &e;
                    tracing::info!(protocol, %local, error, "accept failed");
                    continue;
                },
            };

            let span = tracing::error_span!("fastcgi_connection", protocol, %local, %remote);
            match stream {
                Stream::Tcp(s) => {
                    let (r, w) = s.into_split();
                    self.spawn(r, w, permit, span);
                },
                #[cfg(unix)]
                Stream::Unix(s) => {
                    let (r, w) = s.into_split();
                    self.spawn(r, w, permit, span);
                },
            }
        }
        tracing::debug!(protocol, %local, "stopped accepting connections");
    }

    async fn until_shutdown<F: Future>(&self, fut: F) -> Option<F::Output> {
        if self.shutdown.is_triggered() {
            return None;
        }
        match future::select(pin!(fut), pin!(self.shutdown.wait())).await {
            Either::Left((out, _)) => Some(out),
            Either::Right(((), _)) => None,
        }
    }

    fn spawn<R, W>(&self, input: R, output: W, permit: SemaphoreGuardArc, span: tracing::Span)
    where
        R: tokio::io::AsyncRead + Send + Unpin + 'static,
        W: tokio::io::AsyncWrite + Send + Unpin + 'static,
    {
        let conn = Connection::new(input.compat(), output.compat_write(), self.host.clone(), &self.config);
        let shutdown = self.shutdown.clone();
        let token = self.tasks.add_task();
        tokio::spawn(async move {
            tracing::debug!("new connection accepted");
            if let Err(e) = conn.run(&shutdown).await {
                let error: &dyn std::error::Error = &e;
                tracing::warn!(error, "connection failed");
            }
            drop((permit, token));
        }.instrument(span));
    }

    /// Stops accepting connections and waits until all connections have
    /// finished their current message.
    pub async fn shutdown(self) {
        self.shutdown.trigger();
        tracing::info!(active = self.tasks.tasks(), "shutting down");
        self.tasks.wait().await;
        tracing::debug!(caches = self.host.caches().len(), "all connections closed");
    }
}


// Adapted from https://github.com/laizy/waitgroup-rs
#[derive(Debug, Default)]
struct WaitGroupInner {
    /// The task to wake when the last [`TaskToken`] is dropped.
    waker: AtomicWaker,
}

impl Drop for WaitGroupInner {
    fn drop(&mut self) {
        self.waker.wake();
    }
}

/// Marks a connection task as running until dropped.
#[must_use = "TaskToken must be kept alive until the end of the task"]
struct TaskToken {
    _group: Arc<WaitGroupInner>,
}

/// Counts running connection tasks.
#[derive(Default)]
struct WaitGroup(Arc<WaitGroupInner>);

impl WaitGroup {
    fn add_task(&self) -> TaskToken {
        TaskToken { _group: self.0.clone() }
    }

    fn tasks(&self) -> usize {
        Arc::strong_count(&self.0) - 1
    }

    /// Waits until every [`TaskToken`] is dropped.
    fn wait(self) -> impl Future<Output = ()> {
        let group: Weak<_> = Arc::downgrade(&self.0);
        drop(self);
        // Weak::upgrade fails iff all tokens are gone
        future::poll_fn(move |cx| match group.upgrade() {
            None => Poll::Ready(()),
            Some(inner) => {
                inner.waker.register(cx.waker());
                Poll::Pending
            },
        })
    }
}

impl fmt::Debug for WaitGroup {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("WaitGroup")
            .field("tasks", &self.tasks())
            .finish()
    }
}
