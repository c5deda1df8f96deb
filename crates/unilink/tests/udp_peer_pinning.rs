//! Scenario G: channel with no configured remote learns its peer from the
//! first inbound datagram and pins to it; a second peer's datagrams are
//! still processed but replies keep going to the first peer.

use std::net::UdpSocket;
use std::sync::mpsc;
use std::time::Duration;

use unilink::config::UdpConfig;
use unilink::{Channel, ChannelCallbacks, UdpChannel};

#[test]
fn channel_pins_first_peer_and_keeps_replying_to_it() {
    let channel_port = 24_804;

    let (tx, rx) = mpsc::channel::<Vec<u8>>();
    let callbacks = ChannelCallbacks {
        on_bytes: Some(Box::new(move |data| {
            let _ = tx.send(data.to_vec());
        })),
        ..Default::default()
    };

    let channel = UdpChannel::new(
        UdpConfig {
            local_address: "127.0.0.1".into(),
            local_port: channel_port,
            remote_address: None,
            remote_port: None,
            backpressure_threshold: 1024 * 1024,
            enable_memory_pool: true,
            stop_on_callback_exception: false,
        },
        callbacks,
        true,
    );

    std::thread::sleep(Duration::from_millis(100));

    let peer_a = UdpSocket::bind("127.0.0.1:0").unwrap();
    peer_a.set_read_timeout(Some(Duration::from_secs(2))).unwrap();
    let peer_b = UdpSocket::bind("127.0.0.1:0").unwrap();
    peer_b.set_read_timeout(Some(Duration::from_millis(500))).unwrap();

    let channel_addr: std::net::SocketAddr = format!("127.0.0.1:{channel_port}").parse().unwrap();

    peer_a.send_to(b"ping", channel_addr).unwrap();
    let received = rx.recv_timeout(Duration::from_secs(2)).expect("channel never received peer A's datagram");
    assert_eq!(received, b"ping");
    assert!(channel.is_connected());

    channel.send("pong");
    let mut buf = [0u8; 16];
    let (n, from) = peer_a.recv_from(&mut buf).expect("peer A never received the reply");
    assert_eq!(&buf[..n], b"pong");
    assert_eq!(from, channel_addr);

    peer_b.send_to(b"peer2", channel_addr).unwrap();
    // Second peer's datagram is still delivered to the bytes callback...
    let received = rx.recv_timeout(Duration::from_secs(2)).expect("channel never received peer B's datagram");
    assert_eq!(received, b"peer2");

    // ...but replies still go to the pinned peer A, not B.
    channel.send("still-a");
    let mut b_buf = [0u8; 16];
    assert!(peer_b.recv_from(&mut b_buf).is_err(), "peer B should not have received anything");

    channel.stop();
}
