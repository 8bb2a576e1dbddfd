//! Inter-proxy link behaviour seen from outside the ship.

use std::time::Duration;

use ship_proxy::config::ProxyConfig;
use ship_proxy::protocol::FrameCodec;
use ship_proxy::{ProxyError, Shutdown};
use tokio::io::AsyncReadExt;
use tokio::net::TcpListener;

mod common;

fn ship_config(offshore: std::net::SocketAddr) -> ProxyConfig {
    let mut config = ProxyConfig::default();
    config.ship.offshore_address = offshore.to_string();
    config.reconnect.base_delay_ms = 10;
    config.reconnect.max_delay_ms = 50;
    config
}

#[tokio::test]
async fn request_travels_as_one_length_prefixed_frame() {
    let offshore = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let config = ship_config(offshore.local_addr().unwrap());
    let shutdown = Shutdown::new();

    let capture = tokio::spawn(async move {
        let (mut link, _) = offshore.accept().await.unwrap();
        let mut prefix = [0u8; 4];
        link.read_exact(&mut prefix).await.unwrap();
        let mut payload = vec![0u8; u32::from_be_bytes(prefix) as usize];
        link.read_exact(&mut payload).await.unwrap();

        FrameCodec::default()
            .write_frame(&mut link, b"HTTP/1.1 204 No Content\r\n\r\n")
            .await
            .unwrap();
        (prefix, payload)
    });

    let (ship, _task) = common::start_ship(&config, &shutdown).await;
    let request: &[u8] = b"GET http://a.test/ HTTP/1.1\r\nHost: a.test\r\n\r\n";
    let reply = common::send_raw(ship, request).await;
    assert_eq!(reply, b"HTTP/1.1 204 No Content\r\n\r\n");

    let (prefix, payload) = capture.await.unwrap();
    assert_eq!(prefix, (request.len() as u32).to_be_bytes());
    assert_eq!(payload, request);
}

#[tokio::test]
async fn concurrent_requests_are_serialised_as_whole_frames() {
    let offshore = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let config = ship_config(offshore.local_addr().unwrap());
    let shutdown = Shutdown::new();

    // Answers each frame with its request path, and checks that nothing
    // else arrives on the link until that answer has been written.
    let capture = tokio::spawn(async move {
        let (mut link, _) = offshore.accept().await.unwrap();
        let mut frames = Vec::new();
        for _ in 0..3 {
            let mut prefix = [0u8; 4];
            link.read_exact(&mut prefix).await.unwrap();
            let mut payload = vec![0u8; u32::from_be_bytes(prefix) as usize];
            link.read_exact(&mut payload).await.unwrap();

            tokio::time::sleep(Duration::from_millis(20)).await;
            let mut stray = [0u8; 1];
            let pending = link.try_read(&mut stray);
            assert!(
                matches!(&pending, Err(e) if e.kind() == std::io::ErrorKind::WouldBlock),
                "next frame was written before this one was answered"
            );

            let text = String::from_utf8(payload.clone()).unwrap();
            let path = text.split(' ').nth(1).unwrap().to_string();
            let response = format!("HTTP/1.1 200 OK\r\nContent-Length: {}\r\n\r\n{path}", path.len());
            FrameCodec::default()
                .write_frame(&mut link, response.as_bytes())
                .await
                .unwrap();
            frames.push(payload);
        }
        frames
    });

    let (ship, _task) = common::start_ship(&config, &shutdown).await;
    let clients: Vec<_> = ["/alpha", "/bravo", "/charlie"]
        .into_iter()
        .map(|path| {
            tokio::spawn(async move {
                let request = format!("GET {path} HTTP/1.1\r\nHost: a.test\r\n\r\n");
                let reply = common::send_raw(ship, request.as_bytes()).await;
                (path, String::from_utf8(reply).unwrap())
            })
        })
        .collect();

    for client in clients {
        let (path, reply) = client.await.unwrap();
        assert!(reply.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(reply.ends_with(path), "{path} got {reply}");
    }

    let mut frames = capture.await.unwrap();
    frames.sort();
    let expected: Vec<Vec<u8>> = ["/alpha", "/bravo", "/charlie"]
        .iter()
        .map(|path| format!("GET {path} HTTP/1.1\r\nHost: a.test\r\n\r\n").into_bytes())
        .collect();
    assert_eq!(frames, expected);
}

#[tokio::test]
async fn link_closed_while_idle_is_redialled_for_next_client() {
    let offshore = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let config = ship_config(offshore.local_addr().unwrap());
    let shutdown = Shutdown::new();
    let (closed_tx, closed_rx) = tokio::sync::oneshot::channel();

    tokio::spawn(async move {
        // First link dies while idle; the second one answers.
        let (first, _) = offshore.accept().await.unwrap();
        drop(first);
        let _ = closed_tx.send(());
        let (mut second, _) = offshore.accept().await.unwrap();
        let codec = FrameCodec::default();
        while codec.read_frame(&mut second).await.is_ok() {
            codec
                .write_frame(&mut second, b"HTTP/1.1 200 OK\r\nContent-Length: 0\r\n\r\n")
                .await
                .unwrap();
        }
    });

    let (ship, _task) = common::start_ship(&config, &shutdown).await;
    closed_rx.await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    let request: &[u8] = b"GET / HTTP/1.1\r\nHost: a.test\r\n\r\n";
    let reply = common::send_raw(ship, request).await;
    assert!(reply.starts_with(b"HTTP/1.1 200 OK\r\n"));
}

#[tokio::test]
async fn link_lost_mid_exchange_is_redialled_with_backoff() {
    let offshore = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let config = ship_config(offshore.local_addr().unwrap());
    let shutdown = Shutdown::new();

    tokio::spawn(async move {
        // First link takes the request and dies without answering.
        let (mut first, _) = offshore.accept().await.unwrap();
        let codec = FrameCodec::default();
        let _ = codec.read_frame(&mut first).await;
        drop(first);
        let (mut second, _) = offshore.accept().await.unwrap();
        while codec.read_frame(&mut second).await.is_ok() {
            codec
                .write_frame(&mut second, b"HTTP/1.1 200 OK\r\nContent-Length: 0\r\n\r\n")
                .await
                .unwrap();
        }
    });

    let (ship, _task) = common::start_ship(&config, &shutdown).await;
    let request: &[u8] = b"GET / HTTP/1.1\r\nHost: a.test\r\n\r\n";

    // The exchange in flight fails and that client is dropped.
    let reply = common::send_raw(ship, request).await;
    assert!(reply.is_empty());

    let reply = common::send_raw(ship, request).await;
    assert!(reply.starts_with(b"HTTP/1.1 200 OK\r\n"));
}

#[tokio::test]
async fn exhausted_reconnect_stops_the_ship() {
    let offshore = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let mut config = ship_config(offshore.local_addr().unwrap());
    config.reconnect.max_attempts = 2;
    let shutdown = Shutdown::new();

    let (ship, task) = {
        let accept = tokio::spawn(async move {
            let (link, _) = offshore.accept().await.unwrap();
            // Close both the link and the listener.
            drop(link);
        });
        let started = common::start_ship(&config, &shutdown).await;
        accept.await.unwrap();
        started
    };
    tokio::time::sleep(Duration::from_millis(50)).await;

    // The client finds the link closed and the re-dials cannot succeed.
    let reply = common::send_raw(ship, b"GET / HTTP/1.1\r\nHost: a.test\r\n\r\n").await;
    assert!(reply.is_empty());

    let result = tokio::time::timeout(Duration::from_secs(5), task)
        .await
        .expect("ship kept running")
        .unwrap();
    assert!(matches!(result, Err(ProxyError::Link(_))));
}

#[tokio::test]
async fn shutdown_stops_accepting() {
    let proxies = common::start_proxies(|_| {}).await;

    proxies.shutdown.trigger();
    let result = tokio::time::timeout(Duration::from_secs(5), proxies.ship_task)
        .await
        .expect("ship ignored shutdown")
        .unwrap();
    assert!(result.is_ok());
}
