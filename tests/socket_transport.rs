use std::time::Duration;

use millstream::communication::socket::backoff_delay;
use millstream::communication::{Frame, SocketTransport, Transport, TransportEvent, event_channel};
use millstream::config::ReconnectConfig;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::time::timeout;
use tokio_test::assert_ok;

fn no_jitter(base: u64, max: u64) -> ReconnectConfig {
    ReconnectConfig { max_attempts: 5, base_delay_ms: base, max_delay_ms: max, jitter: false }
}

#[test]
fn backoff_doubles_up_to_the_cap() {
    let config = no_jitter(500, 8000);
    let delays: Vec<u64> = (1..=7).map(|a| backoff_delay(&config, a).as_millis() as u64).collect();
    assert_eq!(delays, vec![500, 1000, 2000, 4000, 8000, 8000, 8000]);
}

#[test]
fn jitter_stays_within_half_to_full_delay() {
    let config = ReconnectConfig { jitter: true, ..no_jitter(1000, 1000) };
    for _ in 0..100 {
        let delay = backoff_delay(&config, 1).as_millis();
        assert!((500..1000).contains(&delay), "delay {delay} out of range");
    }
}

async fn next_event(events: &mut millstream::communication::EventReceiver) -> TransportEvent {
    timeout(Duration::from_secs(5), events.recv()).await.expect("event in time").expect("channel open")
}

#[tokio::test]
async fn reconnects_after_an_unexpected_close() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let mut transport = SocketTransport::new("127.0.0.1".to_string(), port, no_jitter(10, 50), true);
    let (tx, mut events) = event_channel();

    assert_ok!(transport.connect(tx).await);
    let (mut server, _) = listener.accept().await.unwrap();
    assert_eq!(next_event(&mut events).await, TransportEvent::Connected);

    server.write_all(b"Grbl 1.1h ['$' for help]\r\nok\r\n").await.unwrap();
    assert_eq!(next_event(&mut events).await, TransportEvent::Line("Grbl 1.1h ['$' for help]".into()));
    assert_eq!(next_event(&mut events).await, TransportEvent::Line("ok".into()));

    drop(server);
    assert!(matches!(next_event(&mut events).await, TransportEvent::Disconnected { .. }));
    let (mut server, _) = listener.accept().await.unwrap();
    assert_eq!(next_event(&mut events).await, TransportEvent::Connected);
    assert!(transport.is_connected());

    assert_ok!(transport.send(Frame::Line("G0 X1".into())).await);
    let mut buf = [0u8; 16];
    let n = server.read(&mut buf).await.unwrap();
    assert_eq!(&buf[..n], b"G0 X1\n");

    assert_ok!(transport.disconnect().await);
    assert_eq!(
        next_event(&mut events).await,
        TransportEvent::Disconnected { reason: "closed by host".into() }
    );
    assert!(!transport.is_connected());
}

#[tokio::test]
async fn send_before_connect_fails() {
    let mut transport = SocketTransport::new("127.0.0.1".to_string(), 1, no_jitter(10, 50), true);
    assert!(transport.send(Frame::Line("$G".into())).await.is_err());
}

#[tokio::test]
async fn reconnect_gives_up_after_max_attempts() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let reconnect = ReconnectConfig { max_attempts: 2, ..no_jitter(10, 20) };
    let mut transport = SocketTransport::new("127.0.0.1".to_string(), port, reconnect, true);
    let (tx, mut events) = event_channel();

    assert_ok!(transport.connect(tx).await);
    let (server, _) = listener.accept().await.unwrap();
    assert_eq!(next_event(&mut events).await, TransportEvent::Connected);

    // Nothing listens on the port any more, so every attempt is refused.
    drop(listener);
    drop(server);
    assert!(matches!(next_event(&mut events).await, TransportEvent::Disconnected { .. }));
    match next_event(&mut events).await {
        TransportEvent::Error(message) => assert!(message.contains("2 attempts"), "{message}"),
        other => panic!("expected the reconnect to give up, got {other:?}"),
    }
    assert!(!transport.is_connected());
}
