use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{Notify, OwnedSemaphorePermit, Semaphore};
use tokio::task::{self, JoinError, JoinHandle};
use tokio::time;
use tracing::{debug, info, trace, warn};

use crate::config::ServerConfig;
use crate::request::Request;
use crate::response::{ResponseWriter, StatusCode};

/// Upper bounds on discarding input after answering a malformed request.
const DRAIN_LIMIT: usize = 256 * 1024;
const DRAIN_TIMEOUT: Duration = Duration::from_millis(100);

/// Application code invoked once per parsed request.
///
/// The handler drives `writer` through status line, headers and body. The
/// server does not complete a response the handler left unfinished; the
/// connection is closed as soon as `call` returns.
#[async_trait]
pub trait Handler: Send + Sync + 'static {
    async fn call(&self, writer: &mut ResponseWriter<TcpStream>, request: &Request);
}

#[async_trait]
impl<H: Handler> Handler for Arc<H> {
    async fn call(&self, writer: &mut ResponseWriter<TcpStream>, request: &Request) {
        (**self).call(writer, request).await
    }
}

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: io::Error,
    },
}

/// A running server. Dropping it does not stop the accept loop, call
/// [`Server::close`] or [`Server::shutdown`].
pub struct Server {
    local_addr: SocketAddr,
    shared: Arc<Shared>,
    accept_task: JoinHandle<()>,
}

struct Shared {
    closed: AtomicBool,
    wake: Notify,
}

struct AcceptLoop<H> {
    listener: TcpListener,
    handler: Arc<H>,
    shared: Arc<Shared>,
    limit: Option<Arc<Semaphore>>,
    read_buffer_size: usize,
}

impl Server {
    /// Binds `0.0.0.0:port` and starts accepting in the background.
    pub async fn serve<H: Handler>(port: u16, handler: H) -> Result<Self, ServerError> {
        let config = ServerConfig {
            port,
            ..Default::default()
        };
        Self::serve_with_config(&config, handler).await
    }

    pub async fn serve_with_config<H: Handler>(
        config: &ServerConfig,
        handler: H,
    ) -> Result<Self, ServerError> {
        let addr = format!("{}:{}", config.host, config.port);
        let bind_error = |source| ServerError::Bind {
            addr: addr.clone(),
            source,
        };
        let listener = TcpListener::bind(&addr).await.map_err(bind_error)?;
        let local_addr = listener.local_addr().map_err(bind_error)?;
        info!(
            addr = %local_addr,
            max_connections = ?config.max_connections,
            "bound tcp server."
        );

        let shared = Arc::new(Shared {
            closed: AtomicBool::new(false),
            wake: Notify::new(),
        });
        let accept_loop = AcceptLoop {
            listener,
            handler: Arc::new(handler),
            shared: Arc::clone(&shared),
            limit: config.max_connections.map(|n| Arc::new(Semaphore::new(n))),
            read_buffer_size: config.read_buffer_size,
        };
        let accept_task = task::spawn(accept_loop.run());

        Ok(Self {
            local_addr,
            shared,
            accept_task,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::Acquire)
    }

    /// Stops accepting new connections and closes the listener.
    ///
    /// Connections already accepted keep running to completion. Calling this
    /// again is a no-op.
    pub fn close(&self) {
        if !self.shared.closed.swap(true, Ordering::AcqRel) {
            info!(addr = %self.local_addr, "closing server.");
            self.shared.wake.notify_one();
        }
    }

    /// Closes the server and waits for the accept loop to exit.
    pub async fn shutdown(self) -> Result<(), JoinError> {
        self.close();
        self.accept_task.await
    }
}

impl<H: Handler> AcceptLoop<H> {
    async fn run(self) {
        loop {
            if self.shared.closed.load(Ordering::Acquire) {
                break;
            }

            let permit = match &self.limit {
                Some(limit) => tokio::select! {
                    biased;
                    _ = self.shared.wake.notified() => break,
                    permit = Arc::clone(limit).acquire_owned() => permit.ok(),
                },
                None => None,
            };

            let accepted = tokio::select! {
                biased;
                _ = self.shared.wake.notified() => break,
                accepted = self.listener.accept() => accepted,
            };

            match accepted {
                Ok((stream, peer)) => {
                    debug!(%peer, "successfully accepted new tcp stream.");
                    task::spawn(handle_connection(
                        stream,
                        peer,
                        Arc::clone(&self.handler),
                        self.read_buffer_size,
                        permit,
                    ));
                }
                Err(e) => {
                    if self.shared.closed.load(Ordering::Acquire) || is_listener_closed(&e) {
                        break;
                    }
                    warn!(error = %e, "failed to accept tcp stream.");
                }
            }
        }
        info!("accept loop stopped.");
    }
}

/// The listening socket itself is gone (EBADF, or WSAENOTSOCK on windows).
///
/// Errors about a single pending connection, such as `ECONNABORTED`, leave the
/// listener usable and must not stop the loop.
fn is_listener_closed(err: &io::Error) -> bool {
    const EBADF: i32 = 9;
    const WSAENOTSOCK: i32 = 10038;

    match err.raw_os_error() {
        Some(code) if cfg!(windows) => code == WSAENOTSOCK,
        Some(code) => code == EBADF,
        None => false,
    }
}

#[tracing::instrument(skip_all, fields(%peer))]
async fn handle_connection<H: Handler>(
    mut stream: TcpStream,
    peer: SocketAddr,
    handler: Arc<H>,
    read_buffer_size: usize,
    permit: Option<OwnedSemaphorePermit>,
) {
    let _permit = permit;

    let request = match Request::from_reader_with_capacity(&mut stream, read_buffer_size).await {
        Ok(req) => {
            info!(
                method = req.method(),
                target = req.target(),
                "successfully parsed request."
            );
            req
        }
        Err(e) if e.is_malformed() => {
            warn!(error = %e, "malformed request. answering with 400.");
            let mut writer = ResponseWriter::new(stream);
            let body = format!("400 Bad Request: {}\n", e);
            if let Err(e) = writer
                .respond(StatusCode::BAD_REQUEST, "text/plain", body.as_bytes())
                .await
            {
                debug!(error = %e, "error writing response to stream.");
            }
            drain_and_close(writer.into_inner()).await;
            return;
        }
        Err(e) => {
            debug!(error = %e, "failed to read request. closing connection.");
            return;
        }
    };

    let mut writer = ResponseWriter::new(stream);
    handler.call(&mut writer, &request).await;
    if !writer.is_complete() {
        debug!(state = ?writer.state(), "handler left response unfinished.");
    }
    close_stream(writer.into_inner()).await;
}

async fn close_stream(mut stream: TcpStream) {
    if let Err(e) = stream.shutdown().await {
        trace!(error = %e, "error shutting down stream.");
    }
}

/// Closes the write side, then discards what the peer is still sending.
///
/// Dropping a socket with unread input makes the kernel answer with a reset,
/// which can destroy a response the peer has not read yet.
async fn drain_and_close(mut stream: TcpStream) {
    if let Err(e) = stream.shutdown().await {
        trace!(error = %e, "error shutting down stream.");
        return;
    }

    let mut buf = [0; 4096];
    let mut drained = 0;
    let drain = async {
        while drained < DRAIN_LIMIT {
            match stream.read(&mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(n) => drained += n,
            }
        }
    };
    if time::timeout(DRAIN_TIMEOUT, drain).await.is_err() {
        trace!("peer still sending after drain timeout.");
    }
    trace!(drained, "discarded unread request bytes.");
}
