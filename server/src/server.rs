//! Listening sockets with connection admission.
//!
//! [`AdmissionListener`] wraps a `TcpListener` and implements axum's
//! [`Listener`] trait. Every accepted socket must be admitted by the
//! [`AdmissionController`] before axum sees it; rejected sockets are closed
//! right away. Admitted sockets carry their [`AdmissionTicket`] inside the
//! [`AdmittedStream`] handed to hyper, so the slot is released exactly when
//! the connection is dropped.

use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use axum::serve::Listener;
use axum::Router;
use futures::future::try_join_all;
use socket2::{Domain, Protocol, Socket, Type};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::{lookup_host, TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::admission::{AdmissionController, AdmissionTicket};
use crate::error::ServerError;

/// A TCP stream that holds its admission slot for as long as it lives.
#[derive(Debug)]
pub struct AdmittedStream {
    stream: TcpStream,
    _ticket: AdmissionTicket,
}

impl AsyncRead for AdmittedStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().stream).poll_read(cx, buf)
    }
}

impl AsyncWrite for AdmittedStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.get_mut().stream).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().stream).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().stream).poll_shutdown(cx)
    }

    fn poll_write_vectored(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        bufs: &[io::IoSlice<'_>],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.get_mut().stream).poll_write_vectored(cx, bufs)
    }

    fn is_write_vectored(&self) -> bool {
        self.stream.is_write_vectored()
    }
}

/// `TcpListener` that only yields admitted connections.
pub struct AdmissionListener {
    inner: TcpListener,
    admission: AdmissionController,
}

impl AdmissionListener {
    pub fn new(inner: TcpListener, admission: AdmissionController) -> Self {
        Self { inner, admission }
    }
}

impl Listener for AdmissionListener {
    type Io = AdmittedStream;
    type Addr = SocketAddr;

    async fn accept(&mut self) -> (Self::Io, Self::Addr) {
        loop {
            let (stream, peer) = match self.inner.accept().await {
                Ok(accepted) => accepted,
                Err(e) if is_connection_error(&e) => continue,
                Err(e) => {
                    // Typically fd exhaustion; back off instead of spinning.
                    error!("Accept error: {e}");
                    tokio::time::sleep(Duration::from_secs(1)).await;
                    continue;
                }
            };

            match self.admission.try_admit(peer.ip()) {
                Ok(ticket) => {
                    debug!(
                        peer = %ticket.addr(),
                        active = self.admission.active(),
                        "Connection admitted"
                    );
                    return (
                        AdmittedStream {
                            stream,
                            _ticket: ticket,
                        },
                        peer,
                    )
                }
                Err(rejection) => {
                    warn!(%peer, "Connection rejected: {rejection}");
                    drop(stream);
                }
            }
        }
    }

    fn local_addr(&self) -> io::Result<Self::Addr> {
        self.inner.local_addr()
    }
}

fn is_connection_error(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::ConnectionRefused
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::ConnectionReset
    )
}

const LISTEN_BACKLOG: i32 = 1024;

async fn bind_listener(addr: &str) -> io::Result<TcpListener> {
    let addr = lookup_host(addr).await?.next().ok_or_else(|| {
        io::Error::new(io::ErrorKind::InvalidInput, "address resolved to nothing")
    })?;

    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
    if addr.is_ipv6() {
        socket.set_only_v6(true)?;
    }
    #[cfg(unix)]
    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(LISTEN_BACKLOG)?;
    TcpListener::from_std(socket.into())
}

/// Every bound listen address, sharing one admission controller.
pub struct Server {
    listeners: Vec<AdmissionListener>,
}

impl Server {
    /// Bind all of `addrs`. Fails on the first address that cannot be bound.
    ///
    /// IPv6 sockets are bound v6-only, so `0.0.0.0:P` and `[::]:P` can be
    /// listed together for dual stack.
    pub async fn bind(addrs: &[String], admission: AdmissionController) -> Result<Self, ServerError> {
        let mut listeners = Vec::with_capacity(addrs.len());
        for addr in addrs {
            let listener = bind_listener(addr)
                .await
                .map_err(|source| ServerError::Bind {
                    addr: addr.clone(),
                    source,
                })?;
            if let Ok(local) = listener.local_addr() {
                info!("Listening on {local}");
            }
            listeners.push(AdmissionListener::new(listener, admission.clone()));
        }
        Ok(Self { listeners })
    }

    /// Actual bound addresses (resolves port `0`).
    pub fn local_addrs(&self) -> Vec<SocketAddr> {
        self.listeners
            .iter()
            .filter_map(|l| l.local_addr().ok())
            .collect()
    }

    /// Serve `app` on every listener until `shutdown` is cancelled.
    ///
    /// After cancellation no new connections are accepted and in-flight
    /// requests are allowed to finish.
    pub async fn serve(self, app: Router, shutdown: CancellationToken) -> Result<(), ServerError> {
        let servers = self.listeners.into_iter().map(|listener| {
            let app = app.clone();
            let token = shutdown.clone();
            async move {
                axum::serve(listener, app)
                    .with_graceful_shutdown(async move { token.cancelled().await })
                    .await
            }
        });
        try_join_all(servers).await?;
        Ok(())
    }
}
