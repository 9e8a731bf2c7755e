//! WebSocket client: URL parsing, dialing and the client side of the
//! Upgrade exchange.

use std::{
    io,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

use bytes::BytesMut;
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::TcpStream,
    time::timeout,
};
use tokio_rustls::{
    rustls::{self, pki_types::ServerName},
    TlsConnector,
};
use url::Url;

use crate::{
    codec::Role,
    compression::DeflateExtension,
    connection::{self, invoke, Callbacks, ConnectionHandle, Negotiated},
    frame::Message,
    handshake,
    options::Options,
    stream::MaybeTlsStream,
    Result, WsError,
};

static NEXT_CLIENT_ID: AtomicU64 = AtomicU64::new(1);

/// A WebSocket client for one outbound connection.
///
/// Construction validates the URL synchronously; callbacks are registered
/// builder-style, then [`connect`](Client::connect) dials, performs the
/// Upgrade exchange and hands back a [`ConnectionHandle`] for `send` and
/// `close`.
///
/// ```no_run
/// use wavesock::{Client, Message, Options};
///
/// # async fn run() -> wavesock::Result<()> {
/// let client = Client::new("wss://echo.example.org/")?
///     .with_options(Options::default().with_deflate())
///     .on_open(|_conn| log::info!("open"))
///     .on_message(|_conn, msg| log::info!("got {:?}", msg.as_text()))
///     .on_error(|err| log::warn!("failed: {err}"))
///     .on_close(|| log::info!("closed"));
///
/// let conn = client.connect().await?;
/// conn.send(Message::text("hello"));
/// # Ok(())
/// # }
/// ```
pub struct Client {
    url: Url,
    options: Options,
    connector: Option<TlsConnector>,
    headers: Vec<(String, String)>,
    callbacks: Callbacks,
}

impl Client {
    /// Parses and validates `url`. Only the `ws` and `wss` schemes are
    /// accepted; a missing port defaults to 80 or 443 respectively.
    pub fn new(url: &str) -> Result<Self> {
        let url = Url::parse(url)?;
        if !matches!(url.scheme(), "ws" | "wss") {
            return Err(WsError::InvalidScheme);
        }
        if url.host_str().is_none() {
            return Err(WsError::MissingHost);
        }

        Ok(Self {
            url,
            options: Options::default(),
            connector: None,
            headers: Vec::new(),
            callbacks: Callbacks::default(),
        })
    }

    /// Replaces the connection options.
    pub fn with_options(mut self, options: Options) -> Self {
        self.options = options;
        self
    }

    /// Sets the dial + handshake deadline (default 10 seconds).
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.options.handshake_timeout = timeout;
        self
    }

    /// Supplies a TLS connector for `wss` URLs; without one a connector
    /// trusting the bundled webpki roots is built.
    pub fn with_connector(mut self, connector: TlsConnector) -> Self {
        self.connector = Some(connector);
        self
    }

    /// Adds a header to the Upgrade request.
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    /// Called once the handshake completes and the connection opens.
    pub fn on_open<F>(mut self, f: F) -> Self
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

    /// Called when the connection fails: dial errors, handshake rejection,
    /// protocol violations and transport errors all land here, each followed
    /// by `on_close`.
    pub fn on_error<F>(mut self, f: F) -> Self
    where
        F: Fn(&WsError) + Send + Sync + 'static,
    {
        self.callbacks.on_error = Some(Arc::new(f));
        self
    }

    /// Called exactly once when the connection is gone.
    pub fn on_close<F>(mut self, f: F) -> Self
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.callbacks.on_close = Some(Arc::new(move |_id| f()));
        self
    }

    /// Dials the server and performs the Upgrade exchange.
    ///
    /// On success the connection runs on its own task and the returned
    /// handle can `send` and `close`. On failure `on_error` and `on_close`
    /// fire before the error is returned.
    pub async fn connect(self) -> Result<ConnectionHandle> {
        let Client {
            url,
            options,
            connector,
            headers,
            callbacks,
        } = self;

        let id = NEXT_CLIENT_ID.fetch_add(1, Ordering::Relaxed);
        let (handle, rx) = connection::connection_channel(id);

        let result = match timeout(
            options.handshake_timeout,
            dial(&url, &options, connector, &headers),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(WsError::HandshakeTimeout),
        };

        match result {
            Ok((framed, negotiated)) => {
                handle.mark_open();
                if let Some(on_open) = &callbacks.on_connect {
                    invoke("on_open", || on_open(&handle));
                }

                tokio::spawn(connection::drive(
                    framed,
                    negotiated,
                    handle.clone(),
                    rx,
                    options,
                    callbacks,
                ));

                Ok(handle)
            }
            Err(err) => {
                log::debug!("connect to {url} failed: {err}");
                if let Some(on_error) = &callbacks.on_error {
                    invoke("on_error", || on_error(&err));
                }
                if let Some(on_close) = &callbacks.on_close {
                    invoke("on_close", || on_close(id));
                }
                Err(err)
            }
        }
    }
}

type ClientFramed = tokio_util::codec::Framed<MaybeTlsStream<TcpStream>, crate::codec::Codec>;

/// Opens the TCP (and possibly TLS) stream and runs the Upgrade exchange
/// over it.
async fn dial(
    url: &Url,
    options: &Options,
    connector: Option<TlsConnector>,
    headers: &[(String, String)],
) -> Result<(ClientFramed, Negotiated)> {
    let host = url.host_str().ok_or(WsError::MissingHost)?.to_string();
    let port = url.port_or_known_default().ok_or(WsError::MissingHost)?;

    let tcp = TcpStream::connect((host.as_str(), port)).await?;
    let _ = tcp.set_nodelay(true);

    let mut stream = match url.scheme() {
        "ws" => MaybeTlsStream::Plain(tcp),
        "wss" => {
            let connector = connector.unwrap_or_else(default_tls_connector);
            let domain = ServerName::try_from(host)
                .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "invalid dnsname"))?;
            MaybeTlsStream::ClientTls(Box::new(connector.connect(domain, tcp).await?))
        }
        _ => return Err(WsError::InvalidScheme),
    };

    let key = handshake::generate_key();
    let offer = options.deflate.as_ref().map(DeflateExtension::client_offer);
    let request = handshake::build_request(url, &key, headers, offer.as_ref())?;
    stream.write_all(request.as_bytes()).await?;

    let mut buf = BytesMut::with_capacity(1024);
    let (response, consumed) = loop {
        if let Some(parsed) = handshake::parse_response(&buf)? {
            break parsed;
        }
        if buf.len() > handshake::MAX_HANDSHAKE_SIZE {
            return Err(WsError::HandshakeTooLarge);
        }
        if stream.read_buf(&mut buf).await? == 0 {
            return Err(WsError::ConnectionClosed);
        }
    };

    let negotiated = match (
        &options.deflate,
        handshake::verify_response(&response, &key)?,
    ) {
        (Some(_), Some(ext)) => Negotiated::from_extension(Role::Client, options, &ext),
        _ => Negotiated::none(),
    };

    // frames the server pipelined behind the 101 stay in the buffer
    let _ = buf.split_to(consumed);
    let framed = connection::build_framed(stream, Role::Client, negotiated.enabled(), buf, options);

    Ok((framed, negotiated))
}

/// TLS connector trusting the bundled webpki root certificates.
fn default_tls_connector() -> TlsConnector {
    let mut roots = rustls::RootCertStore::empty();
    roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());

    let config = rustls::ClientConfig::builder()
        .with_root_certificates(roots)
        .with_no_client_auth();

    TlsConnector::from(Arc::new(config))
}
