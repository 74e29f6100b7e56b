use super::WireProtocolBroker;
use super::codec::{self, Packet};
use crate::utils::error::DecodeError;
use bytes::{Bytes, BytesMut};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

const WAIT: Duration = Duration::from_secs(2);

async fn start_broker() -> WireProtocolBroker {
    WireProtocolBroker::start("127.0.0.1:0", Duration::from_secs(1))
        .await
        .expect("broker should bind an ephemeral port")
}

async fn read_n(stream: &mut TcpStream, n: usize) -> Vec<u8> {
    let mut buf = vec![0u8; n];
    tokio::time::timeout(WAIT, stream.read_exact(&mut buf))
        .await
        .expect("timed out reading from broker")
        .expect("read failed");
    buf
}

async fn connect(broker: &WireProtocolBroker) -> TcpStream {
    let mut stream = TcpStream::connect(broker.local_addr()).await.unwrap();
    stream.write_all(&[0x10, 0x00]).await.unwrap();
    assert_eq!(read_n(&mut stream, 4).await, vec![0x20, 0x02, 0x00, 0x00]);
    stream
}

async fn subscribe(stream: &mut TcpStream, packet_id: u16, filter: &str) {
    stream
        .write_all(&codec::encode_subscribe(packet_id, filter))
        .await
        .unwrap();
    let [hi, lo] = packet_id.to_be_bytes();
    assert_eq!(read_n(stream, 5).await, vec![0x90, 0x03, hi, lo, 0x00]);
}

async fn assert_closed(stream: &mut TcpStream) {
    let mut buf = [0u8; 16];
    let read = tokio::time::timeout(WAIT, stream.read(&mut buf))
        .await
        .expect("socket was not closed");
    assert!(matches!(read, Ok(0) | Err(_)), "expected EOF, got {read:?}");
}

async fn wait_until(mut cond: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + WAIT;
    while !cond() {
        assert!(tokio::time::Instant::now() < deadline, "condition not reached");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

#[test]
fn test_remaining_length_encoding() {
    for (len, expected) in [
        (0usize, vec![0x00]),
        (127, vec![0x7F]),
        (128, vec![0x80, 0x01]),
        (16_383, vec![0xFF, 0x7F]),
        (16_384, vec![0x80, 0x80, 0x01]),
    ] {
        let mut buf = BytesMut::new();
        codec::encode_remaining_length(len, &mut buf);
        assert_eq!(buf.to_vec(), expected);
        assert_eq!(
            codec::decode_remaining_length(&buf).unwrap(),
            Some((len, expected.len()))
        );
    }
}

#[test]
fn test_remaining_length_overflow() {
    assert_eq!(
        codec::decode_remaining_length(&[0xFF, 0xFF, 0xFF, 0xFF, 0x01]),
        Err(DecodeError::LengthOverflow)
    );
    assert_eq!(codec::decode_remaining_length(&[0xFF, 0xFF]), Ok(None));
}

#[test]
fn test_split_frame_waits_for_whole_frame() {
    let frame = codec::encode_publish("a/b", b"hello", false);
    let mut buf = BytesMut::from(&frame[..4]);
    assert_eq!(codec::split_frame(&mut buf).unwrap(), None);

    buf.extend_from_slice(&frame[4..]);
    buf.extend_from_slice(&codec::PINGREQ_FRAME);
    let first = codec::split_frame(&mut buf).unwrap().unwrap();
    assert_eq!(first.raw, frame);
    assert_eq!(first.packet_type(), codec::PUBLISH);
    let second = codec::split_frame(&mut buf).unwrap().unwrap();
    assert_eq!(second.packet_type(), codec::PINGREQ);
    assert!(buf.is_empty());
}

#[test]
fn test_publish_layout() {
    let frame = codec::encode_publish("t", b"xy", true);
    assert_eq!(frame.to_vec(), vec![0x31, 0x05, 0x00, 0x01, b't', b'x', b'y']);

    let mut buf = BytesMut::from(&frame[..]);
    let decoded = codec::decode_packet(&codec::split_frame(&mut buf).unwrap().unwrap()).unwrap();
    assert_eq!(
        decoded,
        Packet::Publish {
            topic: "t".to_string(),
            payload: Bytes::from_static(b"xy"),
            retain: true,
        }
    );
}

#[test]
fn test_publish_with_packet_id_skips_it() {
    // QoS 1 publish: control 0x32, packet id 0x0001 after the topic
    let mut buf = BytesMut::from(&[0x32, 0x06, 0x00, 0x01, b't', 0x00, 0x01, b'p'][..]);
    let frame = codec::split_frame(&mut buf).unwrap().unwrap();
    match codec::decode_packet(&frame).unwrap() {
        Packet::Publish { payload, .. } => assert_eq!(payload, Bytes::from_static(b"p")),
        other => panic!("expected publish, got {other:?}"),
    }
}

#[test]
fn test_subscribe_without_qos_byte() {
    let mut buf = BytesMut::from(&[0x80, 0x05, 0x00, 0x07, 0x00, 0x01, b'a'][..]);
    let frame = codec::split_frame(&mut buf).unwrap().unwrap();
    assert_eq!(
        codec::decode_packet(&frame).unwrap(),
        Packet::Subscribe {
            packet_id: 7,
            filter: "a".to_string(),
        }
    );
}

#[test]
fn test_truncated_bodies_are_rejected() {
    let mut buf = BytesMut::from(&[0x30, 0x03, 0x00, 0x09, b'a'][..]);
    let frame = codec::split_frame(&mut buf).unwrap().unwrap();
    assert!(matches!(
        codec::decode_packet(&frame),
        Err(DecodeError::Truncated { .. })
    ));

    let mut buf = BytesMut::from(&[0x82, 0x01, 0x00][..]);
    let frame = codec::split_frame(&mut buf).unwrap().unwrap();
    assert!(codec::decode_packet(&frame).is_err());

    let mut buf = BytesMut::from(&[0x30, 0x03, 0x00, 0x01, 0xFF][..]);
    let frame = codec::split_frame(&mut buf).unwrap().unwrap();
    assert_eq!(codec::decode_packet(&frame), Err(DecodeError::InvalidUtf8));
}

#[test]
fn test_fixed_frames() {
    assert_eq!(codec::encode_suback(0x0102).to_vec(), vec![0x90, 0x03, 0x01, 0x02, 0x00]);
    let connect = codec::encode_connect("id", 60);
    assert_eq!(
        connect.to_vec(),
        vec![0x10, 0x0E, 0x00, 0x04, b'M', b'Q', b'T', b'T', 0x04, 0x02, 0x00, 0x3C, 0x00, 0x02, b'i', b'd']
    );
    assert_eq!(
        codec::encode_subscribe(1, "a").to_vec(),
        vec![0x82, 0x06, 0x00, 0x01, 0x00, 0x01, b'a', 0x00]
    );
}

#[tokio::test]
async fn test_connect_and_ping() {
    let broker = start_broker().await;
    let mut client = connect(&broker).await;
    client.write_all(&[0xC0, 0x00]).await.unwrap();
    assert_eq!(read_n(&mut client, 2).await, vec![0xD0, 0x00]);
    assert_eq!(broker.session_count(), 1);
    broker.stop().await;
}

#[tokio::test]
async fn test_publish_forwards_raw_frame_except_to_sender() {
    let broker = start_broker().await;
    let mut publisher = connect(&broker).await;
    let mut subscriber = connect(&broker).await;
    subscribe(&mut publisher, 1, "sensor/#").await;
    subscribe(&mut subscriber, 2, "sensor/#").await;

    let frame = codec::encode_publish("sensor/temp", b"21.5", true);
    publisher.write_all(&frame).await.unwrap();
    assert_eq!(read_n(&mut subscriber, frame.len()).await, frame.to_vec());

    // The publisher's next bytes are its own PINGRESP, not its publish.
    publisher.write_all(&[0xC0, 0x00]).await.unwrap();
    assert_eq!(read_n(&mut publisher, 2).await, vec![0xD0, 0x00]);
    assert_eq!(broker.retained("sensor/temp"), Some(Bytes::from_static(b"21.5")));
    broker.stop().await;
}

#[tokio::test]
async fn test_subscribe_replays_retained_entry() {
    let broker = start_broker().await;
    let mut publisher = connect(&broker).await;
    publisher
        .write_all(&codec::encode_publish("a/b", b"X", false))
        .await
        .unwrap();
    wait_until(|| broker.retained("a/b").is_some()).await;

    let mut late = connect(&broker).await;
    subscribe(&mut late, 9, "a/b").await;
    assert_eq!(
        read_n(&mut late, 8).await,
        vec![0x30, 0x06, 0x00, 0x03, b'a', b'/', b'b', b'X']
    );
    broker.stop().await;
}

#[tokio::test]
async fn test_disconnect_removes_session_and_subscriptions() {
    let broker = start_broker().await;
    let mut publisher = connect(&broker).await;
    let mut leaving = connect(&broker).await;
    subscribe(&mut leaving, 1, "spectrometer/status").await;
    assert_eq!(broker.subscriber_count("spectrometer/status"), 1);

    leaving.write_all(&[0xE0, 0x00]).await.unwrap();
    assert_closed(&mut leaving).await;
    wait_until(|| broker.session_count() == 1).await;
    assert_eq!(broker.subscriber_count("spectrometer/status"), 0);

    publisher
        .write_all(&codec::encode_publish("spectrometer/status", b"ONLINE", true))
        .await
        .unwrap();
    broker.publish("spectrometer/status", "OFFLINE").unwrap();
    publisher.write_all(&[0xC0, 0x00]).await.unwrap();
    assert_eq!(read_n(&mut publisher, 2).await, vec![0xD0, 0x00]);
    broker.stop().await;
}

#[tokio::test]
async fn test_socket_close_tears_down_session() {
    let broker = start_broker().await;
    let mut client = connect(&broker).await;
    subscribe(&mut client, 1, "a").await;
    drop(client);
    wait_until(|| broker.session_count() == 0).await;
    assert_eq!(broker.subscriber_count("a"), 0);
    broker.publish("a", "nobody listening").unwrap();
    broker.stop().await;
}

#[tokio::test]
async fn test_decode_failure_closes_only_that_session() {
    let broker = start_broker().await;
    let mut healthy = connect(&broker).await;
    let mut broken = connect(&broker).await;

    broken.write_all(&[0x30, 0x03, 0x00, 0x09, b'a']).await.unwrap();
    assert_closed(&mut broken).await;
    wait_until(|| broker.session_count() == 1).await;

    healthy.write_all(&[0xC0, 0x00]).await.unwrap();
    assert_eq!(read_n(&mut healthy, 2).await, vec![0xD0, 0x00]);
    let _again = connect(&broker).await;
    broker.stop().await;
}

#[tokio::test]
async fn test_server_publish_reaches_subscribers() {
    let broker = start_broker().await;
    let mut client = connect(&broker).await;
    subscribe(&mut client, 3, "#").await;

    let payload = "r".repeat(300);
    broker.publish("spectrometer/data/reading", payload.clone()).unwrap();
    let expected = codec::encode_publish("spectrometer/data/reading", payload.as_bytes(), false);
    assert_eq!(expected[1] & 0x80, 0x80, "length should need two bytes");
    assert_eq!(read_n(&mut client, expected.len()).await, expected.to_vec());
    broker.stop().await;
}

#[tokio::test]
async fn test_fragmented_frames_are_reassembled() {
    let broker = start_broker().await;
    let mut publisher = connect(&broker).await;
    let mut subscriber = connect(&broker).await;
    subscribe(&mut subscriber, 1, "frag").await;

    let frame = codec::encode_publish("frag", b"pieces", false);
    publisher.write_all(&frame[..3]).await.unwrap();
    publisher.flush().await.unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;
    publisher.write_all(&frame[3..]).await.unwrap();

    assert_eq!(read_n(&mut subscriber, frame.len()).await, frame.to_vec());
    broker.stop().await;
}

#[tokio::test]
async fn test_stop_closes_sessions_and_is_idempotent() {
    let broker = start_broker().await;
    let mut client = connect(&broker).await;
    broker.stop().await;
    broker.stop().await;
    assert!(!broker.is_running());
    assert_closed(&mut client).await;
    assert_eq!(broker.session_count(), 0);
    assert!(broker.publish("a", "late").is_err());
    assert!(TcpStream::connect(broker.local_addr()).await.is_err());
}

#[tokio::test]
async fn test_bind_failure_is_connect_failure() {
    let first = start_broker().await;
    let addr = first.local_addr().to_string();
    let second = WireProtocolBroker::start(&addr, Duration::from_secs(1)).await;
    assert!(matches!(
        second,
        Err(crate::utils::error::BrokerError::ConnectFailure(_))
    ));
    first.stop().await;
}

#[test]
fn test_string_length_limit() {
    assert!(codec::check_string_len(&"f".repeat(u16::MAX as usize)).is_ok());
    assert_eq!(
        codec::check_string_len(&"f".repeat(u16::MAX as usize + 1)),
        Err(DecodeError::LengthOverflow)
    );
    assert_eq!(
        codec::check_frame_size(&"t".repeat(70_000), b""),
        Err(DecodeError::LengthOverflow)
    );
}

#[tokio::test]
async fn test_session_becomes_active_after_connect() {
    let broker = start_broker().await;
    let mut raw = TcpStream::connect(broker.local_addr()).await.unwrap();
    wait_until(|| broker.session_count() == 1).await;
    assert_eq!(broker.active_session_count(), 0);

    raw.write_all(&[0x10, 0x00]).await.unwrap();
    assert_eq!(read_n(&mut raw, 4).await, vec![0x20, 0x02, 0x00, 0x00]);
    assert_eq!(broker.active_session_count(), 1);
    broker.stop().await;
}

#[tokio::test]
async fn test_session_watch_follows_open_sessions() {
    let broker = start_broker().await;
    let mut sessions = broker.watch_sessions();
    assert_eq!(*sessions.borrow_and_update(), 0);

    let mut client = connect(&broker).await;
    tokio::time::timeout(WAIT, sessions.wait_for(|&open| open == 1))
        .await
        .expect("session open not signalled")
        .unwrap();

    client.write_all(&[0xE0, 0x00]).await.unwrap();
    tokio::time::timeout(WAIT, sessions.wait_for(|&open| open == 0))
        .await
        .expect("session close not signalled")
        .unwrap();
    broker.stop().await;
}
