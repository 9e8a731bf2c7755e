//! End-to-end tests over loopback sockets.
//!
//! Scenarios that need to observe exact wire behavior (ping replies, masking
//! violations, fragmentation) use a hand-rolled peer that speaks raw bytes;
//! everything else exercises the public `Server`/`Client` API.

use std::{
    net::SocketAddr,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use sha1::{Digest, Sha1};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{TcpListener, TcpStream},
    sync::mpsc,
    time::timeout,
};
use wavesock::{Client, Message, Options, Server, WsError};

const WAIT: Duration = Duration::from_secs(5);

fn accept_key(key: &str) -> String {
    let mut sha = Sha1::new();
    sha.update(key.as_bytes());
    sha.update(b"258EAFA5-E914-47DA-95CA-C5AB0DC85B11");
    BASE64.encode(sha.finalize())
}

/// Starts an echo server on an ephemeral port and returns its address.
fn spawn_echo_server(options: Options) -> SocketAddr {
    let server = Arc::new(
        Server::new("127.0.0.1:0", options).on_message(|conn, msg| {
            conn.send(msg);
        }),
    );
    let addr = server.bind().unwrap();
    tokio::spawn(async move {
        let _ = server.listen().await;
    });
    addr
}

/// Connects a raw TCP socket and completes a handshake with the server.
async fn raw_upgrade(addr: SocketAddr) -> TcpStream {
    let mut stream = TcpStream::connect(addr).await.unwrap();
    let key = "dGhlIHNhbXBsZSBub25jZQ==";
    let request = format!(
        "GET / HTTP/1.1\r\n\
         Host: 127.0.0.1\r\n\
         Upgrade: websocket\r\n\
         Connection: Upgrade\r\n\
         Sec-WebSocket-Key: {key}\r\n\
         Sec-WebSocket-Version: 13\r\n\r\n"
    );
    stream.write_all(request.as_bytes()).await.unwrap();

    let head = read_until_crlfcrlf(&mut stream).await;
    assert!(head.starts_with("HTTP/1.1 101"), "handshake failed: {head}");
    assert!(head.contains(&accept_key(key)));
    stream
}

async fn read_until_crlfcrlf(stream: &mut TcpStream) -> String {
    let mut buf = Vec::new();
    loop {
        let mut byte = [0u8; 1];
        let n = stream.read(&mut byte).await.unwrap();
        assert!(n > 0, "eof before header terminator");
        buf.push(byte[0]);
        if buf.ends_with(b"\r\n\r\n") {
            return String::from_utf8(buf).unwrap();
        }
    }
}

/// Serializes one frame, masking the payload when `mask` is set.
fn frame_bytes(fin: bool, opcode: u8, mask: Option<[u8; 4]>, payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(payload.len() + 14);
    out.push(((fin as u8) << 7) | opcode);

    let mask_bit = if mask.is_some() { 0x80 } else { 0 };
    match payload.len() {
        len if len < 126 => out.push(mask_bit | len as u8),
        len if len < 65536 => {
            out.push(mask_bit | 126);
            out.extend_from_slice(&(len as u16).to_be_bytes());
        }
        len => {
            out.push(mask_bit | 127);
            out.extend_from_slice(&(len as u64).to_be_bytes());
        }
    }

    match mask {
        Some(key) => {
            out.extend_from_slice(&key);
            out.extend(payload.iter().enumerate().map(|(i, b)| b ^ key[i % 4]));
        }
        None => out.extend_from_slice(payload),
    }
    out
}

/// Reads one unmasked frame off a raw stream, returning (fin, opcode,
/// payload).
async fn read_frame(stream: &mut TcpStream) -> (bool, u8, Vec<u8>) {
    let mut head = [0u8; 2];
    stream.read_exact(&mut head).await.unwrap();
    assert_eq!(head[1] & 0x80, 0, "server frames must be unmasked");

    let len = match head[1] & 0x7F {
        126 => {
            let mut ext = [0u8; 2];
            stream.read_exact(&mut ext).await.unwrap();
            u16::from_be_bytes(ext) as usize
        }
        127 => {
            let mut ext = [0u8; 8];
            stream.read_exact(&mut ext).await.unwrap();
            u64::from_be_bytes(ext) as usize
        }
        len => len as usize,
    };

    let mut payload = vec![0u8; len];
    stream.read_exact(&mut payload).await.unwrap();
    (head[0] & 0x80 != 0, head[0] & 0x0F, payload)
}

#[tokio::test]
async fn echo_round_trip() {
    let addr = spawn_echo_server(Options::default());

    let (tx, mut rx) = mpsc::unbounded_channel();
    let conn = Client::new(&format!("ws://{addr}/"))
        .unwrap()
        .on_message(move |_conn, msg| {
            tx.send(msg).unwrap();
        })
        .connect()
        .await
        .unwrap();

    let text = "d41d8cd98f00b204e9800998ecf8427e";
    assert!(conn.send(Message::text(text)));

    let echoed = timeout(WAIT, rx.recv()).await.unwrap().unwrap();
    assert_eq!(echoed.as_text(), Some(text));
}

#[tokio::test]
async fn ping_answered_with_pong() {
    let addr = spawn_echo_server(Options::default());
    let mut stream = raw_upgrade(addr).await;

    stream
        .write_all(&frame_bytes(true, 0x9, Some([1, 2, 3, 4]), b"hi"))
        .await
        .unwrap();

    let (fin, opcode, payload) = timeout(Duration::from_millis(100), read_frame(&mut stream))
        .await
        .expect("pong within 100ms");
    assert!(fin);
    assert_eq!(opcode, 0xA);
    assert_eq!(payload, b"hi");
}

#[tokio::test]
async fn disabled_ping_pong_drops_pings() {
    let addr = spawn_echo_server(Options::default().with_ping_pong(false));
    let mut stream = raw_upgrade(addr).await;

    stream
        .write_all(&frame_bytes(true, 0x9, Some([1, 2, 3, 4]), b"hi"))
        .await
        .unwrap();
    // a data frame following the ping is still echoed, the ping is not
    stream
        .write_all(&frame_bytes(true, 0x1, Some([5, 6, 7, 8]), b"after"))
        .await
        .unwrap();

    let (_, opcode, payload) = timeout(WAIT, read_frame(&mut stream)).await.unwrap();
    assert_eq!(opcode, 0x1);
    assert_eq!(payload, b"after");
}

#[tokio::test]
async fn parsing_continues_past_control_frames() {
    // ping and the following data frame arrive in one TCP segment; both must
    // be handled without waiting for more input
    let addr = spawn_echo_server(Options::default());
    let mut stream = raw_upgrade(addr).await;

    let mut burst = frame_bytes(true, 0x9, Some([1, 2, 3, 4]), b"ping");
    burst.extend(frame_bytes(true, 0x1, Some([5, 6, 7, 8]), b"data"));
    stream.write_all(&burst).await.unwrap();

    let (_, opcode, payload) = timeout(WAIT, read_frame(&mut stream)).await.unwrap();
    assert_eq!((opcode, payload.as_slice()), (0xA, &b"ping"[..]));

    let (_, opcode, payload) = timeout(WAIT, read_frame(&mut stream)).await.unwrap();
    assert_eq!((opcode, payload.as_slice()), (0x1, &b"data"[..]));
}

#[tokio::test]
async fn clean_close_fires_on_close_once_each_side() {
    let server_closes = Arc::new(AtomicUsize::new(0));
    let client_closes = Arc::new(AtomicUsize::new(0));

    let counter = Arc::clone(&server_closes);
    let server = Arc::new(Server::new("127.0.0.1:0", Options::default()).on_close(move |_id| {
        counter.fetch_add(1, Ordering::SeqCst);
    }));
    let addr = server.bind().unwrap();
    {
        let server = Arc::clone(&server);
        tokio::spawn(async move {
            let _ = server.listen().await;
        });
    }

    let counter = Arc::clone(&client_closes);
    let conn = Client::new(&format!("ws://{addr}/"))
        .unwrap()
        .on_close(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        })
        .connect()
        .await
        .unwrap();

    conn.close();
    // close on an already-closing connection stays a no-op
    conn.close();

    timeout(WAIT, async {
        loop {
            if server_closes.load(Ordering::SeqCst) == 1
                && client_closes.load(Ordering::SeqCst) == 1
            {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("both sides report close");

    // give any duplicate notification a chance to show up
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(server_closes.load(Ordering::SeqCst), 1);
    assert_eq!(client_closes.load(Ordering::SeqCst), 1);

    assert!(!conn.send(Message::text("after close")));
}

#[tokio::test]
async fn peer_receives_empty_close_reply() {
    let addr = spawn_echo_server(Options::default());
    let mut stream = raw_upgrade(addr).await;

    // close with code 1000; the answer is a close frame with an empty body
    stream
        .write_all(&frame_bytes(true, 0x8, Some([9, 9, 9, 9]), &1000u16.to_be_bytes()))
        .await
        .unwrap();

    let (fin, opcode, payload) = timeout(WAIT, read_frame(&mut stream)).await.unwrap();
    assert!(fin);
    assert_eq!(opcode, 0x8);
    assert!(payload.is_empty());
}

#[tokio::test]
async fn server_initiated_close_reports_closed_by_peer() {
    let server = Arc::new(
        Server::new("127.0.0.1:0", Options::default()).on_connect(|conn| {
            conn.close();
        }),
    );
    let addr = server.bind().unwrap();
    {
        let server = Arc::clone(&server);
        tokio::spawn(async move {
            let _ = server.listen().await;
        });
    }

    let peer_closes = Arc::new(AtomicUsize::new(0));
    let closes = Arc::new(AtomicUsize::new(0));

    let error_counter = Arc::clone(&peer_closes);
    let close_counter = Arc::clone(&closes);
    let _conn = Client::new(&format!("ws://{addr}/"))
        .unwrap()
        .on_error(move |err| {
            if matches!(err, WsError::ClosedByPeer) {
                error_counter.fetch_add(1, Ordering::SeqCst);
            }
        })
        .on_close(move || {
            close_counter.fetch_add(1, Ordering::SeqCst);
        })
        .connect()
        .await
        .unwrap();

    timeout(WAIT, async {
        loop {
            if closes.load(Ordering::SeqCst) == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("client reports close");

    assert_eq!(peer_closes.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn fragmented_message_reassembles() {
    // hand-rolled server sends one text message in three frames
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        let head = read_request(&mut stream).await;
        let key = head
            .lines()
            .find_map(|line| line.strip_prefix("Sec-WebSocket-Key: "))
            .unwrap()
            .trim();
        let response = format!(
            "HTTP/1.1 101 Switching Protocols\r\n\
             Upgrade: websocket\r\n\
             Connection: Upgrade\r\n\
             Sec-WebSocket-Accept: {}\r\n\r\n",
            accept_key(key)
        );
        stream.write_all(response.as_bytes()).await.unwrap();

        stream
            .write_all(&frame_bytes(false, 0x1, None, b"Hel"))
            .await
            .unwrap();
        stream
            .write_all(&frame_bytes(false, 0x0, None, b"lo "))
            .await
            .unwrap();
        stream
            .write_all(&frame_bytes(true, 0x0, None, b"World"))
            .await
            .unwrap();

        // hold the socket open until the test is done reading
        let mut sink = [0u8; 64];
        let _ = stream.read(&mut sink).await;
    });

    let (tx, mut rx) = mpsc::unbounded_channel();
    let _conn = Client::new(&format!("ws://{addr}/"))
        .unwrap()
        .on_message(move |_conn, msg| {
            tx.send(msg).unwrap();
        })
        .connect()
        .await
        .unwrap();

    let message = timeout(WAIT, rx.recv()).await.unwrap().unwrap();
    assert_eq!(message.as_text(), Some("Hello World"));
}

async fn read_request(stream: &mut TcpStream) -> String {
    let mut buf = Vec::new();
    loop {
        let mut byte = [0u8; 1];
        assert!(stream.read(&mut byte).await.unwrap() > 0);
        buf.push(byte[0]);
        if buf.ends_with(b"\r\n\r\n") {
            return String::from_utf8(buf).unwrap();
        }
    }
}

#[tokio::test]
async fn compressed_payload_round_trips() {
    let addr = spawn_echo_server(Options::default().with_deflate());

    let (tx, mut rx) = mpsc::unbounded_channel();
    let conn = Client::new(&format!("ws://{addr}/"))
        .unwrap()
        .with_options(Options::default().with_deflate())
        .on_message(move |_conn, msg| {
            tx.send(msg).unwrap();
        })
        .connect()
        .await
        .unwrap();

    let text = "Hello WebSocket Compression Test! ".repeat(1000);
    assert!(conn.send(Message::text(text.clone())));

    let echoed = timeout(WAIT, rx.recv()).await.unwrap().unwrap();
    assert_eq!(echoed.payload.len(), text.len());
    assert_eq!(echoed.as_text(), Some(text.as_str()));
}

#[tokio::test]
async fn compressed_messages_keep_flowing() {
    // several messages over one connection exercise the per-message reset on
    // the server and context takeover on the client
    let addr = spawn_echo_server(Options::default().with_deflate());

    let (tx, mut rx) = mpsc::unbounded_channel();
    let conn = Client::new(&format!("ws://{addr}/"))
        .unwrap()
        .with_options(Options::default().with_deflate())
        .on_message(move |_conn, msg| {
            tx.send(msg).unwrap();
        })
        .connect()
        .await
        .unwrap();

    for round in 0..10 {
        let text = format!("repetition helps compression, round {round}").repeat(20);
        assert!(conn.send(Message::text(text.clone())));

        let echoed = timeout(WAIT, rx.recv()).await.unwrap().unwrap();
        assert_eq!(echoed.as_text(), Some(text.as_str()));
    }
}

#[tokio::test]
async fn server_rejects_upgrade_without_key() {
    let addr = spawn_echo_server(Options::default());

    let mut stream = TcpStream::connect(addr).await.unwrap();
    let request = "GET / HTTP/1.1\r\n\
                   Host: 127.0.0.1\r\n\
                   Upgrade: websocket\r\n\
                   Connection: Upgrade\r\n\
                   Sec-WebSocket-Version: 13\r\n\r\n";
    stream.write_all(request.as_bytes()).await.unwrap();

    // the transport closes without any 101
    let mut buf = Vec::new();
    timeout(WAIT, stream.read_to_end(&mut buf)).await.unwrap().unwrap();
    assert!(buf.is_empty(), "server must not answer: {:?}", String::from_utf8_lossy(&buf));
}

#[tokio::test]
async fn client_reports_handshake_rejection() {
    // a server that answers 403 to everything
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        let _ = read_request(&mut stream).await;
        let _ = stream
            .write_all(b"HTTP/1.1 403 Forbidden\r\nContent-Length: 0\r\n\r\n")
            .await;
    });

    let errors = Arc::new(AtomicUsize::new(0));
    let closes = Arc::new(AtomicUsize::new(0));

    let error_counter = Arc::clone(&errors);
    let close_counter = Arc::clone(&closes);
    let result = Client::new(&format!("ws://{addr}/"))
        .unwrap()
        .on_error(move |_err| {
            error_counter.fetch_add(1, Ordering::SeqCst);
        })
        .on_close(move || {
            close_counter.fetch_add(1, Ordering::SeqCst);
        })
        .connect()
        .await;

    assert!(result.is_err());
    assert_eq!(errors.load(Ordering::SeqCst), 1);
    assert_eq!(closes.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn server_closes_on_unmasked_client_frame() {
    let addr = spawn_echo_server(Options::default());
    let mut stream = raw_upgrade(addr).await;

    stream
        .write_all(&frame_bytes(true, 0x1, None, b"unmasked"))
        .await
        .unwrap();

    // the failure close carries the protocol code 1002
    let (_, opcode, payload) = timeout(WAIT, read_frame(&mut stream)).await.unwrap();
    assert_eq!(opcode, 0x8);
    assert_eq!(&payload[..2], &1002u16.to_be_bytes());
}

#[tokio::test]
async fn server_rejects_oversized_control_frame() {
    let addr = spawn_echo_server(Options::default());
    let mut stream = raw_upgrade(addr).await;

    stream
        .write_all(&frame_bytes(true, 0x9, Some([1, 2, 3, 4]), &[0u8; 126]))
        .await
        .unwrap();

    let (_, opcode, payload) = timeout(WAIT, read_frame(&mut stream)).await.unwrap();
    assert_eq!(opcode, 0x8);
    assert_eq!(&payload[..2], &1002u16.to_be_bytes());
}

#[tokio::test]
async fn on_request_sees_path_and_query() {
    let (tx, mut rx) = mpsc::unbounded_channel();

    let server = Arc::new(
        Server::new("127.0.0.1:0", Options::default()).on_request(move |conn, request| {
            assert!(conn.is_handshake());
            tx.send((
                request.path().to_owned(),
                request.query().map(str::to_owned),
                request.header("user-agent").map(str::to_owned),
            ))
            .unwrap();
        }),
    );
    let addr = server.bind().unwrap();
    {
        let server = Arc::clone(&server);
        tokio::spawn(async move {
            let _ = server.listen().await;
        });
    }

    let _conn = Client::new(&format!("ws://{addr}/updates?since=42"))
        .unwrap()
        .header("User-Agent", "wavesock-test")
        .connect()
        .await
        .unwrap();

    let (path, query, agent) = timeout(WAIT, rx.recv()).await.unwrap().unwrap();
    assert_eq!(path, "/updates");
    assert_eq!(query.as_deref(), Some("since=42"));
    assert_eq!(agent.as_deref(), Some("wavesock-test"));
}

#[tokio::test]
async fn broadcast_reaches_every_open_connection() {
    let server = Arc::new(Server::new("127.0.0.1:0", Options::default()));
    let addr = server.bind().unwrap();
    {
        let server = Arc::clone(&server);
        tokio::spawn(async move {
            let _ = server.listen().await;
        });
    }

    let (tx, mut rx) = mpsc::unbounded_channel();
    let mut conns = Vec::new();
    for _ in 0..3 {
        let tx = tx.clone();
        let conn = Client::new(&format!("ws://{addr}/"))
            .unwrap()
            .on_message(move |_conn, msg| {
                tx.send(msg).unwrap();
            })
            .connect()
            .await
            .unwrap();
        conns.push(conn);
    }

    // wait for the server side of every connection to open
    timeout(WAIT, async {
        loop {
            if server.broadcast(Message::text("probe")) == 3 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("all connections open");

    let mut received = 0;
    while received < 3 {
        let msg = timeout(WAIT, rx.recv()).await.unwrap().unwrap();
        if msg.as_text() == Some("probe") {
            received += 1;
        }
    }
}

#[tokio::test]
async fn connection_ids_are_distinct() {
    let ids = Arc::new(std::sync::Mutex::new(Vec::new()));

    let seen = Arc::clone(&ids);
    let server = Arc::new(
        Server::new("127.0.0.1:0", Options::default()).on_connect(move |conn| {
            seen.lock().unwrap().push(conn.id());
        }),
    );
    let addr = server.bind().unwrap();
    {
        let server = Arc::clone(&server);
        tokio::spawn(async move {
            let _ = server.listen().await;
        });
    }

    let mut conns = Vec::new();
    for _ in 0..3 {
        conns.push(
            Client::new(&format!("ws://{addr}/"))
                .unwrap()
                .connect()
                .await
                .unwrap(),
        );
    }

    timeout(WAIT, async {
        loop {
            if ids.lock().unwrap().len() == 3 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("three connections");

    let mut seen = ids.lock().unwrap().clone();
    seen.sort_unstable();
    seen.dedup();
    assert_eq!(seen.len(), 3);
}
