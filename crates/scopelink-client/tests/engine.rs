use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::mpsc;
use std::thread;
use std::time::{Duration, Instant};

use bytes::BytesMut;
use scopelink_client::{ClientConfig, ClientError, CommandClient, ReaderConfig, ReaderState, Reply};
use scopelink_frame::codes::{STAGE_MOTION_STOPPED, STAGE_POSITION_GET, SYSTEM_STATE_CHANGED, SYSTEM_STATE_GET};
use scopelink_frame::{decode_frame, encode_command, encode_message, Message, FRAME_SIZE};

/// Server side of both instrument channels.
struct Instrument {
    command: TcpStream,
    live: TcpStream,
}

impl Instrument {
    fn read_request(&mut self) -> Message {
        let mut buf = [0u8; FRAME_SIZE];
        self.command
            .read_exact(&mut buf)
            .expect("request frame should arrive");
        decode_frame(&buf).expect("request is one frame")
    }

    fn send(&mut self, message: &Message) {
        let mut buf = BytesMut::new();
        encode_message(message, &mut buf);
        self.send_raw(&buf);
    }

    fn send_raw(&mut self, bytes: &[u8]) {
        self.command.write_all(bytes).expect("instrument write should succeed");
    }
}

fn listener_pair() -> (TcpListener, TcpListener, u16) {
    for _ in 0..64 {
        let first = TcpListener::bind("127.0.0.1:0").expect("loopback bind should succeed");
        let port = first.local_addr().expect("bound listener has addr").port();
        if port == u16::MAX {
            continue;
        }
        if let Ok(second) = TcpListener::bind(("127.0.0.1", port + 1)) {
            return (first, second, port);
        }
    }
    panic!("no consecutive loopback port pair available");
}

fn test_config() -> ClientConfig {
    ClientConfig::default()
        .with_pause_timeout(Duration::from_secs(1))
        .with_reader(ReaderConfig::default().with_poll_interval(Duration::from_millis(50)))
}

fn connected() -> (CommandClient, Instrument) {
    let (command_listener, live_listener, port) = listener_pair();
    let client = CommandClient::with_config(test_config());
    client
        .connect("127.0.0.1", port)
        .expect("client should connect to loopback pair");

    let (command, _) = command_listener.accept().expect("command channel accepted");
    let (live, _) = live_listener.accept().expect("live channel accepted");
    (client, Instrument { command, live })
}

fn wait_until(mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(3);
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(10));
    }
    condition()
}

#[test]
fn request_receives_matching_reply() {
    let (client, mut instrument) = connected();
    assert_eq!(client.reader_state(), ReaderState::Running);

    let server = thread::spawn(move || {
        let request = instrument.read_request();
        assert!(request.valid);
        assert!(request.has_callback_flag());
        assert_eq!(request.int_data[0], 2);
        instrument.send(&Message::new(request.command_code).with_value(42.5));
        instrument
    });

    let reply = client
        .request(STAGE_POSITION_GET, &[2], 0.0, &[], Duration::from_secs(2))
        .expect("request should be sent");
    let message = reply.message().expect("instrument replied");
    assert_eq!(message.command_code, STAGE_POSITION_GET);
    assert!(message.is_ok());
    assert_eq!(message.value(), 42.5);

    let _instrument = server.join().expect("instrument thread");
    assert_eq!(client.dispatcher_stats().responses_dispatched, 1);
}

#[test]
fn concurrent_requests_are_correlated_by_code() {
    let (client, mut instrument) = connected();
    let client = std::sync::Arc::new(client);

    let server = thread::spawn(move || {
        let first = instrument.read_request();
        let second = instrument.read_request();
        // answer in reverse order
        for request in [second, first] {
            let value = f64::from(request.command_code);
            instrument.send(&Message::new(request.command_code).with_value(value));
        }
        instrument
    });

    let callers: Vec<_> = [STAGE_POSITION_GET, SYSTEM_STATE_GET]
        .into_iter()
        .map(|code| {
            let client = std::sync::Arc::clone(&client);
            thread::spawn(move || {
                client
                    .request(code, &[], 0.0, &[], Duration::from_secs(3))
                    .expect("request sent")
                    .into_result()
                    .expect("reply received")
            })
        })
        .collect();

    for (caller, code) in callers.into_iter().zip([STAGE_POSITION_GET, SYSTEM_STATE_GET]) {
        let reply = caller.join().expect("caller thread");
        assert_eq!(reply.command_code, code);
        assert_eq!(reply.value(), f64::from(code));
    }
    let _instrument = server.join().expect("instrument thread");
}

#[test]
fn notification_during_request_is_queued() {
    let (client, mut instrument) = connected();

    let server = thread::spawn(move || {
        let request = instrument.read_request();
        instrument.send(&Message::new(SYSTEM_STATE_CHANGED).with_payload(b"Busy"));
        instrument.send(&Message::new(request.command_code).with_payload(b"Busy"));
        instrument
    });

    let reply = client
        .request(SYSTEM_STATE_GET, &[], 0.0, &[], Duration::from_secs(2))
        .expect("request sent");
    assert_eq!(reply.message().map(|m| m.payload_str()), Some("Busy".to_string()));

    let notification = client
        .recv_unsolicited(Duration::from_secs(2))
        .expect("notification queued");
    assert_eq!(notification.command_code, SYSTEM_STATE_CHANGED);

    let stats = client.dispatcher_stats();
    assert_eq!(stats.messages_received, 2);
    assert_eq!(stats.accounted(), stats.messages_received);
    let _instrument = server.join().expect("instrument thread");
}

#[test]
fn unsolicited_notification_reaches_callback() {
    let (client, mut instrument) = connected();
    let (tx, rx) = mpsc::channel();
    client.register_callback(STAGE_MOTION_STOPPED, move |message| {
        let _ = tx.send(message.axis_values());
    });

    instrument.send(&Message::new(STAGE_MOTION_STOPPED).with_payload(b"X=1.5\nY=-2"));

    let axes = rx
        .recv_timeout(Duration::from_secs(2))
        .expect("callback should fire");
    assert_eq!(axes, vec![("X".to_string(), 1.5), ("Y".to_string(), -2.0)]);
    assert_eq!(client.dispatcher().unsolicited_len(), 0);
}

#[test]
fn timed_out_request_leaves_no_registration() {
    let (client, mut instrument) = connected();
    let frame = encode_command(SYSTEM_STATE_GET, &[], 0.0, &[]).expect("valid command");

    let started = Instant::now();
    let reply = client
        .send_command(&frame, SYSTEM_STATE_GET, Duration::from_millis(150))
        .expect("request sent");
    assert!(matches!(reply, Reply::TimedOut { code: SYSTEM_STATE_GET, after } if after >= Duration::from_millis(150)));
    let waited = started.elapsed();
    assert!(waited >= Duration::from_millis(150));
    assert!(waited < Duration::from_millis(650), "timed out late: {waited:?}");
    assert!(!client.dispatcher().has_pending(SYSTEM_STATE_GET));

    // a late answer is not delivered to anyone
    let _ = instrument.read_request();
    instrument.send(&Message::new(SYSTEM_STATE_GET));
    assert!(wait_until(|| client.dispatcher_stats().messages_received == 1));
    assert_eq!(client.dispatcher_stats().messages_dropped, 1);
}

#[test]
fn recovers_from_corrupted_stream() {
    let (client, mut instrument) = connected();
    let (tx, rx) = mpsc::channel();
    client.register_callback(SYSTEM_STATE_CHANGED, move |message| {
        let _ = tx.send(message.payload_str());
    });

    let mut corrupted = vec![0x5Au8; 5 * FRAME_SIZE + 11];
    let mut tail = BytesMut::new();
    encode_message(&Message::new(SYSTEM_STATE_CHANGED).with_payload(b"Ready"), &mut tail);
    corrupted.extend_from_slice(&tail);
    instrument.send_raw(&corrupted);

    let state = rx
        .recv_timeout(Duration::from_secs(3))
        .expect("frame after corruption should be delivered");
    assert_eq!(state, "Ready");

    let stats = client.reader_stats();
    assert!(stats.invalid_frames >= 5);
    assert!(stats.resync_attempts >= 1);
}

#[test]
fn additional_data_is_consumed_before_next_frame() {
    let (client, mut instrument) = connected();
    let (tx, rx) = mpsc::channel();
    client.register_callback(SYSTEM_STATE_CHANGED, move |message| {
        let _ = tx.send(message.additional_data.as_ref().map(|d| d.to_vec()));
    });

    let blob: Vec<u8> = (0..2000u32).map(|i| (i % 251) as u8).collect();
    instrument.send(&Message::new(SYSTEM_STATE_CHANGED).with_additional_data(blob.clone()));
    instrument.send(&Message::new(SYSTEM_STATE_CHANGED));

    let first = rx.recv_timeout(Duration::from_secs(2)).expect("first frame");
    let second = rx.recv_timeout(Duration::from_secs(2)).expect("second frame");
    assert_eq!(first, Some(blob));
    assert_eq!(second, None);
    assert_eq!(client.reader_stats().invalid_frames, 0);
}

#[test]
fn exchange_blocking_borrows_command_channel() {
    let (client, mut instrument) = connected();

    let server = thread::spawn(move || {
        let request = instrument.read_request();
        instrument.send(&Message::new(request.command_code).with_additional_data(vec![3u8; 64]));
        instrument
    });

    let frame = encode_command(SYSTEM_STATE_GET, &[], 0.0, &[]).expect("valid command");
    let reply = client
        .exchange_blocking(&frame, Duration::from_secs(2))
        .expect("synchronous exchange");
    assert_eq!(reply.command_code, SYSTEM_STATE_GET);
    assert_eq!(reply.additional_data.map(|d| d.len()), Some(64));

    // the reader never saw the reply and is reading again
    let mut instrument = server.join().expect("instrument thread");
    assert_eq!(client.dispatcher_stats().messages_received, 0);
    assert!(wait_until(|| client.reader_state() == ReaderState::Running));

    instrument.send(&Message::new(SYSTEM_STATE_CHANGED));
    assert!(client.recv_unsolicited(Duration::from_secs(2)).is_some());
}

#[test]
fn exchange_completes_frame_reader_had_started() {
    let (client, mut instrument) = connected();
    let mut notification = BytesMut::new();
    encode_message(&Message::new(SYSTEM_STATE_CHANGED).with_payload(b"Busy"), &mut notification);

    instrument.send_raw(&notification[..50]);
    assert!(wait_until(|| client.reader_stats().bytes_read == 50));

    let rest = notification[50..].to_vec();
    let server = thread::spawn(move || {
        let request = instrument.read_request();
        instrument.send_raw(&rest);
        instrument.send(&Message::new(request.command_code).with_payload(b"Idle"));
        instrument
    });

    let frame = encode_command(SYSTEM_STATE_GET, &[], 0.0, &[]).expect("valid command");
    let reply = client
        .exchange_blocking(&frame, Duration::from_secs(2))
        .expect("synchronous exchange");
    assert_eq!(reply.command_code, SYSTEM_STATE_GET);
    assert_eq!(reply.payload_str(), "Idle");

    let earlier = client
        .recv_unsolicited(Duration::from_secs(1))
        .expect("started notification is dispatched");
    assert_eq!(earlier.payload_str(), "Busy");

    // the reader resumes on a frame boundary
    let mut instrument = server.join().expect("instrument thread");
    instrument.send(&Message::new(SYSTEM_STATE_CHANGED).with_payload(b"Idle"));
    let next = client
        .recv_unsolicited(Duration::from_secs(2))
        .expect("reader still aligned");
    assert_eq!(next.payload_str(), "Idle");
    assert_eq!(client.reader_stats().invalid_frames, 0);
}

#[test]
fn live_channel_reads_raw_bytes() {
    let (client, mut instrument) = connected();
    instrument
        .live
        .write_all(b"\x01\x02\x03\x04\x05")
        .expect("live write");

    let data = client
        .read_live(5, Duration::from_secs(2))
        .expect("live bytes should arrive");
    assert_eq!(&data[..], b"\x01\x02\x03\x04\x05");

    let err = client
        .read_live(1, Duration::from_millis(50))
        .expect_err("no more live data");
    assert!(err.is_timeout());
    assert!(client.is_connected());

    let err = client
        .read_live(4, Duration::ZERO)
        .expect_err("nothing to poll");
    assert!(err.is_timeout());
    assert!(client.is_connected());
    assert_eq!(client.reader_state(), ReaderState::Running);
}

#[test]
fn instrument_close_stops_reader() {
    let (client, instrument) = connected();
    drop(instrument);

    assert!(wait_until(|| client.reader_state() == ReaderState::Stopped));
    assert_eq!(client.reader_stats().socket_errors, 1);

    let frame = encode_command(SYSTEM_STATE_GET, &[], 0.0, &[]).expect("valid command");
    let err = client
        .send_command(&frame, SYSTEM_STATE_GET, Duration::from_millis(50))
        .expect_err("no reader to deliver replies");
    assert!(matches!(err, ClientError::ReaderStopped));
}

#[test]
fn disconnect_and_reconnect() {
    let (command_listener, live_listener, port) = listener_pair();
    let client = CommandClient::with_config(test_config());

    for _ in 0..2 {
        client.connect("127.0.0.1", port).expect("connect");
        let (mut command, _) = command_listener.accept().expect("command accepted");
        let (_live, _) = live_listener.accept().expect("live accepted");
        assert!(client.is_connected());
        assert_eq!(client.reader_state(), ReaderState::Running);

        let mut frame = BytesMut::new();
        encode_message(&Message::new(SYSTEM_STATE_CHANGED), &mut frame);
        command.write_all(&frame).expect("notification write");
        assert!(client.recv_unsolicited(Duration::from_secs(2)).is_some());

        client.disconnect();
        assert!(!client.is_connected());
        assert_eq!(client.reader_state(), ReaderState::Stopped);
    }
}
