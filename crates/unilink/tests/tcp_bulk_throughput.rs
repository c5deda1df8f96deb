//! Scenario B: client sends 50 chunks of 64 KiB with a small gap between
//! chunks; server receives exactly 3,276,800 bytes within 10 s.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use unilink::config::{TcpClientConfig, TcpServerConfig};
use unilink::{Channel, ChannelCallbacks, TcpClient, TcpServer, TcpServerCallbacks};

#[test]
fn fifty_chunks_of_64kib_arrive_intact() {
    let port = 24_802;
    const CHUNK: usize = 64 * 1024;
    const CHUNKS: usize = 50;

    let total_received = Arc::new(AtomicUsize::new(0));
    let total_received_cb = Arc::clone(&total_received);

    let server_callbacks = TcpServerCallbacks {
        on_multi_data: Some(Box::new(move |_id, data| {
            total_received_cb.fetch_add(data.len(), Ordering::SeqCst);
        })),
        ..Default::default()
    };
    let server = TcpServer::new(
        TcpServerConfig {
            port,
            backpressure_threshold: 4 * 1024 * 1024,
            enable_port_retry: true,
            max_port_retries: 5,
            port_retry_interval_ms: 100,
            client_limit: None,
        },
        server_callbacks,
        true,
    );

    std::thread::sleep(Duration::from_millis(100));

    let client = TcpClient::new(
        TcpClientConfig {
            host: "127.0.0.1".into(),
            port,
            retry_interval_ms: 100,
            max_retries: 0,
            connection_timeout_ms: 2000,
            backpressure_threshold: 4 * 1024 * 1024,
        },
        ChannelCallbacks::default(),
        true,
    );

    std::thread::sleep(Duration::from_millis(300));

    let chunk_str: String = "A".repeat(CHUNK);
    for _ in 0..CHUNKS {
        client.send(&chunk_str);
        std::thread::sleep(Duration::from_micros(500));
    }

    let deadline = Instant::now() + Duration::from_secs(10);
    while total_received.load(Ordering::SeqCst) < CHUNK * CHUNKS && Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(20));
    }

    assert_eq!(total_received.load(Ordering::SeqCst), CHUNK * CHUNKS);

    client.stop();
    server.stop();
}
