//! Shared utilities for integration tests.
//!
//! Every server binds `127.0.0.1:0` so tests can run in parallel.

#![allow(dead_code)]

use std::net::SocketAddr;
use std::time::Duration;

use ship_proxy::config::ProxyConfig;
use ship_proxy::net::{ConnectionTracker, Listener};
use ship_proxy::{OffshoreServer, ProxyError, Shutdown, ShipServer};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

/// A running ship and offshore pair.
pub struct Proxies {
    pub ship: SocketAddr,
    pub offshore: SocketAddr,
    pub shutdown: Shutdown,
    pub ship_task: JoinHandle<Result<(), ProxyError>>,
    /// Client connections currently held by the ship.
    pub ship_connections: ConnectionTracker,
}

/// Start an offshore proxy and a ship proxy linked to it.
pub async fn start_proxies(configure: impl FnOnce(&mut ProxyConfig)) -> Proxies {
    let mut config = ProxyConfig::default();
    config.timeouts.connect_secs = 2;
    config.timeouts.request_secs = 5;
    config.timeouts.idle_secs = 5;
    config.reconnect.base_delay_ms = 10;
    config.reconnect.max_delay_ms = 100;
    configure(&mut config);

    let shutdown = Shutdown::new();
    let offshore = start_offshore(&config, &shutdown).await;

    config.ship.offshore_address = offshore.to_string();
    let (ship, ship_task, ship_connections) = spawn_ship(&config, &shutdown).await;

    Proxies {
        ship,
        offshore,
        shutdown,
        ship_task,
        ship_connections,
    }
}

pub async fn start_offshore(config: &ProxyConfig, shutdown: &Shutdown) -> SocketAddr {
    let listener = Listener::bind("127.0.0.1:0", config.offshore.max_connections)
        .await
        .unwrap();
    let addr = listener.local_addr().unwrap();
    let server = OffshoreServer::new(config);
    let rx = shutdown.subscribe();
    tokio::spawn(async move {
        let _ = server.run(listener, rx).await;
    });
    addr
}

pub async fn start_ship(
    config: &ProxyConfig,
    shutdown: &Shutdown,
) -> (SocketAddr, JoinHandle<Result<(), ProxyError>>) {
    let (addr, task, _) = spawn_ship(config, shutdown).await;
    (addr, task)
}

async fn spawn_ship(
    config: &ProxyConfig,
    shutdown: &Shutdown,
) -> (SocketAddr, JoinHandle<Result<(), ProxyError>>, ConnectionTracker) {
    let listener = Listener::bind("127.0.0.1:0", config.ship.max_connections)
        .await
        .unwrap();
    let addr = listener.local_addr().unwrap();
    let server = ShipServer::connect(config).await.unwrap();
    let tracker = server.tracker();
    let rx = shutdown.subscribe();
    let task = tokio::spawn(server.run(listener, rx));
    (addr, task, tracker)
}

/// Read one request head plus a Content-Length body, if any.
pub async fn read_http_request(socket: &mut TcpStream) -> Vec<u8> {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 4096];
    loop {
        if let Some(end) = find_head_end(&buf) {
            let body_len = content_length(&buf[..end]);
            if buf.len() >= end + body_len {
                return buf;
            }
        }
        let n = socket.read(&mut chunk).await.unwrap();
        if n == 0 {
            return buf;
        }
        buf.extend_from_slice(&chunk[..n]);
    }
}

fn find_head_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n").map(|p| p + 4)
}

fn content_length(head: &[u8]) -> usize {
    String::from_utf8_lossy(head)
        .lines()
        .find_map(|line| {
            let (name, value) = line.split_once(':')?;
            name.eq_ignore_ascii_case("content-length")
                .then(|| value.trim().parse().ok())
                .flatten()
        })
        .unwrap_or(0)
}

/// Start an origin that answers every request with `response` verbatim and
/// reports each request it received.
pub async fn start_recording_origin(
    response: &'static [u8],
) -> (SocketAddr, mpsc::UnboundedReceiver<Vec<u8>>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (tx, rx) = mpsc::unbounded_channel();

    tokio::spawn(async move {
        while let Ok((mut socket, _)) = listener.accept().await {
            let tx = tx.clone();
            tokio::spawn(async move {
                let request = read_http_request(&mut socket).await;
                let _ = tx.send(request);
                let _ = socket.write_all(response).await;
                let _ = socket.shutdown().await;
            });
        }
    });
    (addr, rx)
}

/// Start an origin that answers one request with `response` and reports
/// once the proxy has closed its side of the connection.
pub async fn start_origin_watching_close(
    response: &'static [u8],
) -> (SocketAddr, oneshot::Receiver<()>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (tx, rx) = oneshot::channel();

    tokio::spawn(async move {
        let (mut socket, _) = listener.accept().await.unwrap();
        read_http_request(&mut socket).await;
        socket.write_all(response).await.unwrap();
        wait_for_eof(&mut socket).await;
        let _ = tx.send(());
    });
    (addr, rx)
}

/// Start a one-connection echo server that reports once its peer closes.
pub async fn start_echo_watching_close() -> (SocketAddr, oneshot::Receiver<()>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (tx, rx) = oneshot::channel();

    tokio::spawn(async move {
        let (mut socket, _) = listener.accept().await.unwrap();
        let (mut reader, mut writer) = socket.split();
        let _ = tokio::io::copy(&mut reader, &mut writer).await;
        let _ = tx.send(());
    });
    (addr, rx)
}

async fn wait_for_eof(socket: &mut TcpStream) {
    let mut chunk = [0u8; 1024];
    while let Ok(n) = socket.read(&mut chunk).await {
        if n == 0 {
            break;
        }
    }
}

/// Start an origin that returns a fixed 200 response with `body`.
pub async fn start_mock_origin(body: &'static str) -> SocketAddr {
    let response = format!(
        "HTTP/1.1 200 OK\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
        body.len(),
        body
    );
    let response: &'static [u8] = Box::leak(response.into_bytes().into_boxed_slice());
    start_recording_origin(response).await.0
}

/// Start a TCP server that echoes every byte back until the peer closes.
pub async fn start_echo_server() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        while let Ok((mut socket, _)) = listener.accept().await {
            tokio::spawn(async move {
                let (mut reader, mut writer) = socket.split();
                let _ = tokio::io::copy(&mut reader, &mut writer).await;
                let _ = writer.shutdown().await;
            });
        }
    });
    addr
}

/// An address nothing listens on.
pub async fn dead_addr() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);
    addr
}

/// Send `request` through the proxy and read until it closes the connection.
pub async fn send_raw(proxy: SocketAddr, request: &[u8]) -> Vec<u8> {
    let mut stream = TcpStream::connect(proxy).await.unwrap();
    stream.write_all(request).await.unwrap();
    let mut response = Vec::new();
    tokio::time::timeout(Duration::from_secs(10), stream.read_to_end(&mut response))
        .await
        .expect("proxy response timed out")
        .unwrap();
    response
}

/// Open a CONNECT tunnel to `target` and return the stream after the 200.
pub async fn open_tunnel(proxy: SocketAddr, target: SocketAddr) -> TcpStream {
    let mut stream = TcpStream::connect(proxy).await.unwrap();
    let request = format!("CONNECT {target} HTTP/1.1\r\nHost: {target}\r\n\r\n");
    stream.write_all(request.as_bytes()).await.unwrap();

    let mut reply = vec![0u8; b"HTTP/1.1 200 Connection Established\r\n\r\n".len()];
    stream.read_exact(&mut reply).await.unwrap();
    assert_eq!(reply, b"HTTP/1.1 200 Connection Established\r\n\r\n");
    stream
}
