//! WebSocket server: TCP listener, connection registry and broadcast.

use std::{
    collections::HashMap,
    io,
    net::{SocketAddr, ToSocketAddrs},
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex, OnceLock,
    },
};

use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::TlsAcceptor;

use crate::{
    connection::{self, invoke, Callbacks, ConnectionHandle},
    frame::Message,
    options::Options,
    stream::MaybeTlsStream,
    Request, Result,
};

/// A WebSocket server.
///
/// Callbacks are registered builder-style before calling [`listen`].
/// Each accepted socket becomes one connection driven by its own task;
/// [`broadcast`] reaches every connection that is currently open.
///
/// [`listen`]: Server::listen
/// [`broadcast`]: Server::broadcast
///
/// ```no_run
/// use wavesock::{Options, Server};
///
/// # async fn run() -> wavesock::Result<()> {
/// let server = Server::new("127.0.0.1:8001", Options::default().with_deflate())
///     .on_connect(|conn| log::info!("connection {} open", conn.id()))
///     .on_message(|conn, msg| {
///         conn.send(msg);
///     })
///     .on_close(|id| log::info!("connection {id} closed"));
/// server.listen().await
/// # }
/// ```
pub struct Server {
    addr: String,
    options: Options,
    tls: Option<TlsAcceptor>,
    callbacks: Callbacks,
    listener: OnceLock<std::net::TcpListener>,
    connections: Arc<Mutex<HashMap<u64, ConnectionHandle>>>,
    next_id: AtomicU64,
}

impl Server {
    /// Creates a server that will listen on `addr` (a `host:port` string).
    pub fn new(addr: impl Into<String>, options: Options) -> Self {
        Self {
            addr: addr.into(),
            options,
            tls: None,
            callbacks: Callbacks::default(),
            listener: OnceLock::new(),
            connections: Arc::new(Mutex::new(HashMap::new())),
            next_id: AtomicU64::new(1),
        }
    }

    /// Serves `wss://` by wrapping every accepted socket in the given TLS
    /// acceptor before the handshake.
    pub fn with_tls(mut self, acceptor: TlsAcceptor) -> Self {
        self.tls = Some(acceptor);
        self
    }

    /// Called with the parsed Upgrade request before the 101 response goes
    /// out.
    pub fn on_request<F>(mut self, f: F) -> Self
    where
        F: Fn(&ConnectionHandle, &Request) + Send + Sync + 'static,
    {
        self.callbacks.on_request = Some(Arc::new(f));
        self
    }

    /// Called once a connection completes its handshake and opens.
    pub fn on_connect<F>(mut self, f: F) -> Self
    where
        F: Fn(&ConnectionHandle) + Send + Sync + 'static,
    {
        self.callbacks.on_connect = Some(Arc::new(f));
        self
    }

    /// Called for every complete text or binary message.
    pub fn on_message<F>(mut self, f: F) -> Self
    where
        F: Fn(&ConnectionHandle, Message) + Send + Sync + 'static,
    {
        self.callbacks.on_message = Some(Arc::new(f));
        self
    }

    /// Called exactly once per connection after it closes, with its id.
    pub fn on_close<F>(mut self, f: F) -> Self
    where
        F: Fn(u64) + Send + Sync + 'static,
    {
        self.callbacks.on_close = Some(Arc::new(f));
        self
    }

    /// Binds the listening socket, returning the bound address.
    ///
    /// Useful when listening on port 0; [`listen`](Server::listen) binds
    /// implicitly when this was not called.
    pub fn bind(&self) -> Result<SocketAddr> {
        if self.listener.get().is_none() {
            let listener = bind_listener(&self.addr)?;
            // a concurrent bind may have won the race; both sockets are
            // equivalent thanks to SO_REUSEPORT, keep the first
            let _ = self.listener.set(listener);
        }
        Ok(self.listener.get().expect("bound listener").local_addr()?)
    }

    /// Accepts connections forever.
    ///
    /// Every accepted socket gets `TCP_NODELAY` and `SO_KEEPALIVE`, then runs
    /// its handshake and frame loop on a dedicated task.
    pub async fn listen(&self) -> Result<()> {
        self.bind()?;
        let listener = TcpListener::from_std(
            self.listener.get().expect("bound listener").try_clone()?,
        )?;

        log::debug!("listening on {}", listener.local_addr()?);

        loop {
            let (stream, peer) = listener.accept().await?;
            self.accept(stream, peer);
        }
    }

    fn accept(&self, stream: TcpStream, peer: SocketAddr) {
        let _ = stream.set_nodelay(true);
        let _ = socket2::SockRef::from(&stream).set_keepalive(true);

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        log::debug!("accepted connection {id} from {peer}");

        let (handle, rx) = connection::connection_channel(id);
        self.connections
            .lock()
            .expect("connection registry")
            .insert(id, handle.clone());

        let tls = self.tls.clone();
        let options = self.options.clone();
        let callbacks = self.callbacks.clone();
        let connections = Arc::clone(&self.connections);

        tokio::spawn(async move {
            match wrap_tls(stream, tls).await {
                Ok(stream) => {
                    connection::serve(stream, handle, rx, options, callbacks.clone()).await;
                }
                Err(err) => {
                    log::debug!("tls accept failed for connection {id}: {err}");
                    if let Some(on_close) = &callbacks.on_close {
                        invoke("on_close", || on_close(id));
                    }
                }
            }
            connections.lock().expect("connection registry").remove(&id);
        });
    }

    /// Sends `message` to every open connection, returning how many accepted
    /// it.
    pub fn broadcast(&self, message: impl Into<Message>) -> usize {
        let message = message.into();
        let connections = self.connections.lock().expect("connection registry");
        connections
            .values()
            .filter(|handle| handle.send(message.clone()))
            .count()
    }
}

async fn wrap_tls(
    stream: TcpStream,
    tls: Option<TlsAcceptor>,
) -> io::Result<MaybeTlsStream<TcpStream>> {
    match tls {
        None => Ok(MaybeTlsStream::Plain(stream)),
        Some(acceptor) => Ok(MaybeTlsStream::ServerTls(Box::new(
            acceptor.accept(stream).await?,
        ))),
    }
}

/// Binds a nonblocking TCP listener with `SO_REUSEADDR`, `SO_REUSEPORT`
/// (where the platform has it) and `SO_KEEPALIVE`.
fn bind_listener(addr: &str) -> Result<std::net::TcpListener> {
    let addr = addr
        .to_socket_addrs()?
        .next()
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "address resolved to nothing"))?;

    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
    socket.set_reuse_address(true)?;
    #[cfg(all(unix, not(any(target_os = "solaris", target_os = "illumos"))))]
    socket.set_reuse_port(true)?;
    socket.set_keepalive(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(1024)?;

    Ok(socket.into())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bind_assigns_ephemeral_port() {
        let server = Server::new("127.0.0.1:0", Options::default());
        let addr = server.bind().unwrap();
        assert_ne!(addr.port(), 0);

        // idempotent
        assert_eq!(server.bind().unwrap(), addr);
    }

    #[test]
    fn bind_rejects_garbage_address() {
        let server = Server::new("not an address", Options::default());
        assert!(server.bind().is_err());
    }

    #[test]
    fn broadcast_without_connections_sends_nothing() {
        let server = Server::new("127.0.0.1:0", Options::default());
        assert_eq!(server.broadcast(Message::text("anyone?")), 0);
    }
}
