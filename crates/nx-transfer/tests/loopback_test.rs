/// Integration tests: real sockets on loopback, real files in a temp dir.

use std::fs;
use std::io::{Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream, UdpSocket};
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, Instant};

use nx_transfer::{
    CancelToken, NullObserver, ProgressEvent, ReceiveReport, Receiver, ReceiverConfig,
    SenderConfig, SessionState, TransferError, TransferMetadata, TransportKind, compute_digest,
    send_file,
};

fn loopback() -> SocketAddr {
    "127.0.0.1:0".parse().unwrap()
}

fn write_pattern(path: &Path, size: usize) {
    let mut data = vec![0u8; size];
    for (i, byte) in data.iter_mut().enumerate() {
        *byte = (i % 251) as u8; // prime modulus so chunk boundaries do not align
    }
    fs::write(path, data).unwrap();
}

fn assert_monotonic_to(events: &[ProgressEvent], total: u64) {
    assert!(!events.is_empty(), "no progress events");
    for pair in events.windows(2) {
        assert!(pair[0].bytes_transferred <= pair[1].bytes_transferred);
    }
    let last = events.last().unwrap();
    assert_eq!(last.bytes_transferred, total);
    assert_eq!(last.total_bytes, total);
}

fn spawn_sender(
    path: PathBuf,
    dest: SocketAddr,
    config: SenderConfig,
) -> thread::JoinHandle<(Result<nx_transfer::SendReport, TransferError>, Vec<ProgressEvent>)> {
    thread::spawn(move || {
        let (tx, rx) = crossbeam_channel::unbounded();
        let result = send_file(&path, dest, &config, &tx, &CancelToken::new());
        drop(tx);
        (result, rx.iter().collect())
    })
}

#[test]
fn stream_ten_megabytes_in_4k_chunks() {
    let dir = tempfile::tempdir().unwrap();
    let src = dir.path().join("big.bin");
    let out_dir = dir.path().join("received");
    let size = 10 * 1024 * 1024;
    write_pattern(&src, size);

    let mut config = ReceiverConfig::new(TransportKind::Stream, loopback(), &out_dir);
    config.chunk_size = 4096;
    let mut receiver = Receiver::new(config).unwrap();
    let listening = receiver.listen().unwrap();

    let sender_config = SenderConfig {
        chunk_size: 4096,
        ack_timeout: Some(Duration::from_secs(5)),
        write_timeout: Some(Duration::from_secs(5)),
        ..SenderConfig::new(TransportKind::Stream)
    };
    let sender = spawn_sender(src.clone(), listening.local_addr(), sender_config);

    let (tx, rx) = crossbeam_channel::unbounded();
    let received = listening.accept_transfer(&tx, &CancelToken::new()).unwrap();
    let report = received.validate().unwrap();
    drop(tx);
    let recv_events: Vec<ProgressEvent> = rx.iter().collect();

    let (send_result, send_events) = sender.join().expect("sender panicked");
    let send_report = send_result.expect("sender failed");

    assert_eq!(send_report.bytes_sent, size as u64);
    assert_eq!(report.bytes_received, size as u64);
    assert_eq!(report.path, out_dir.join("big.bin"));
    assert_eq!(report.metadata.digest, compute_digest(&src).unwrap());
    assert_eq!(fs::read(&src).unwrap(), fs::read(&report.path).unwrap());

    assert_monotonic_to(&send_events, size as u64);
    assert_eq!(send_events.len(), size / 4096);
    assert_monotonic_to(&recv_events, size as u64);
}

#[test]
fn datagram_transfer_small_file() {
    let dir = tempfile::tempdir().unwrap();
    let src = dir.path().join("small.bin");
    let size = 64 * 1024 + 37;
    write_pattern(&src, size);

    let config = ReceiverConfig::new(TransportKind::Datagram, loopback(), dir.path().join("out"));
    let mut receiver = Receiver::new(config).unwrap();
    let listening = receiver.listen().unwrap();

    // Default config: 1024-byte chunks, 0.5 s handshake window.
    let sender = spawn_sender(src.clone(), listening.local_addr(), SenderConfig::default());

    let (tx, rx) = crossbeam_channel::unbounded();
    let report = listening
        .accept_transfer(&tx, &CancelToken::new())
        .unwrap()
        .validate()
        .unwrap();
    drop(tx);

    let (send_result, send_events) = sender.join().unwrap();
    let send_report = send_result.unwrap();
    assert_eq!(send_report.kind, TransportKind::Datagram);
    assert_eq!(send_events.len(), size.div_ceil(1024));
    assert_monotonic_to(&rx.iter().collect::<Vec<_>>(), size as u64);
    assert_eq!(fs::read(&src).unwrap(), fs::read(&report.path).unwrap());
    assert!(report.peer.is_some());
}

#[test]
fn datagram_handshake_timeout_sends_nothing_else() {
    let dir = tempfile::tempdir().unwrap();
    let src = dir.path().join("a.bin");
    write_pattern(&src, 4096);

    let silent = UdpSocket::bind(loopback()).unwrap();
    let dest = silent.local_addr().unwrap();

    let started = Instant::now();
    let err = send_file(
        &src,
        dest,
        &SenderConfig::default(),
        &NullObserver,
        &CancelToken::new(),
    )
    .unwrap_err();
    let waited = started.elapsed();

    assert!(matches!(err, TransferError::HandshakeTimeout(_)), "got {err}");
    assert!(err.is_retryable());
    assert!(waited >= Duration::from_millis(400), "returned after {waited:?}");
    assert!(waited < Duration::from_secs(3), "returned after {waited:?}");

    silent.set_read_timeout(Some(Duration::from_millis(200))).unwrap();
    let mut buf = [0u8; 2048];
    let (n, _) = silent.recv_from(&mut buf).unwrap();
    assert_eq!(&buf[..n], b"handshake");
    assert!(silent.recv_from(&mut buf).is_err(), "traffic after failed handshake");
}

#[test]
fn datagram_non_handshake_first_payload_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let config = ReceiverConfig::new(TransportKind::Datagram, loopback(), dir.path());
    let mut receiver = Receiver::new(config).unwrap();
    let listening = receiver.listen().unwrap();

    let stranger = UdpSocket::bind(loopback()).unwrap();
    stranger.send_to(b"hello?", listening.local_addr()).unwrap();

    let err = listening
        .accept_transfer(&NullObserver, &CancelToken::new())
        .err()
        .unwrap();
    assert!(matches!(err, TransferError::HandshakeRejected { .. }), "got {err}");
}

/// Hand-rolled stream sender for protocol edge cases.
fn raw_stream_sender(dest: SocketAddr, metadata: &[u8]) -> (TcpStream, Vec<u8>) {
    let mut stream = TcpStream::connect(dest).unwrap();
    stream
        .set_read_timeout(Some(Duration::from_secs(5)))
        .unwrap();
    stream.write_all(metadata).unwrap();
    let mut reply = vec![0u8; 16];
    let n = stream.read(&mut reply).unwrap_or(0);
    reply.truncate(n);
    (stream, reply)
}

#[test]
fn stream_truncation_is_not_success() {
    let dir = tempfile::tempdir().unwrap();
    let config = ReceiverConfig::new(TransportKind::Stream, loopback(), dir.path());
    let mut receiver = Receiver::new(config).unwrap();
    let listening = receiver.listen().unwrap();
    let dest = listening.local_addr();

    let client = thread::spawn(move || {
        let meta = TransferMetadata::new("half.bin", 1000, "00000000000000000000000000000000");
        let (mut stream, reply) = raw_stream_sender(dest, &meta.encode().unwrap());
        assert_eq!(reply, b"ACK");
        stream.write_all(&[5u8; 500]).unwrap();
        // Dropping closes the connection halfway through.
    });

    let err = listening
        .accept_transfer(&NullObserver, &CancelToken::new())
        .err()
        .unwrap();
    client.join().unwrap();

    match err {
        TransferError::Truncated {
            received, expected, ..
        } => {
            assert_eq!(received, 500);
            assert_eq!(expected, 1000);
        }
        other => panic!("expected truncation, got {other}"),
    }
    assert_eq!(fs::read(dir.path().join("half.bin")).unwrap().len(), 500);
}

#[test]
fn stream_bad_metadata_gets_no_ack_and_no_file() {
    let dir = tempfile::tempdir().unwrap();
    let out = dir.path().join("out");
    let config = ReceiverConfig::new(TransportKind::Stream, loopback(), &out);
    let mut receiver = Receiver::new(config).unwrap();
    let listening = receiver.listen().unwrap();
    let dest = listening.local_addr();

    let client = thread::spawn(move || raw_stream_sender(dest, br#"{"name":"x.bin","size":3}"#).1);

    let err = listening
        .accept_transfer(&NullObserver, &CancelToken::new())
        .err()
        .unwrap();
    assert!(matches!(err, TransferError::MetadataDecode { .. }), "got {err}");
    assert!(client.join().unwrap().is_empty(), "receiver acknowledged bad metadata");
    assert!(!out.exists());
}

#[test]
fn strict_names_refuse_traversal_before_ack() {
    let dir = tempfile::tempdir().unwrap();
    let out = dir.path().join("out");
    let mut config = ReceiverConfig::new(TransportKind::Stream, loopback(), &out);
    config.reject_unsafe_names = true;
    let mut receiver = Receiver::new(config).unwrap();
    let listening = receiver.listen().unwrap();
    let dest = listening.local_addr();

    let client = thread::spawn(move || {
        let meta = TransferMetadata::new("../escape.bin", 3, "ff");
        raw_stream_sender(dest, &meta.encode().unwrap()).1
    });

    let err = listening
        .accept_transfer(&NullObserver, &CancelToken::new())
        .err()
        .unwrap();
    assert!(matches!(err, TransferError::UnsafeName(ref n) if n == "../escape.bin"));
    assert!(client.join().unwrap().is_empty());
    assert!(!dir.path().join("escape.bin").exists());
}

#[test]
fn stream_sender_refuses_wrong_ack() {
    let dir = tempfile::tempdir().unwrap();
    let src = dir.path().join("a.bin");
    write_pattern(&src, 10_000);

    let listener = TcpListener::bind(loopback()).unwrap();
    let dest = listener.local_addr().unwrap();
    let fake = thread::spawn(move || {
        let (mut stream, _) = listener.accept().unwrap();
        stream
            .set_read_timeout(Some(Duration::from_secs(5)))
            .unwrap();
        let mut buf = [0u8; 1024];
        let n = stream.read(&mut buf).unwrap();
        TransferMetadata::decode(&buf[..n]).unwrap();
        stream.write_all(b"NAK").unwrap();
        // Anything after the bad reply would be payload.
        let mut rest = Vec::new();
        stream.read_to_end(&mut rest).unwrap();
        rest.len()
    });

    let config = SenderConfig {
        ack_timeout: Some(Duration::from_secs(5)),
        ..SenderConfig::new(TransportKind::Stream)
    };
    let err = send_file(&src, dest, &config, &NullObserver, &CancelToken::new()).unwrap_err();
    assert!(matches!(err, TransferError::Acknowledgment(_)), "got {err}");
    assert_eq!(fake.join().unwrap(), 0, "payload sent without ACK");
}

#[test]
fn tampered_file_fails_validation_with_both_digests() {
    let dir = tempfile::tempdir().unwrap();
    let src = dir.path().join("doc.bin");
    write_pattern(&src, 20_000);
    let expected = compute_digest(&src).unwrap();

    let config = ReceiverConfig::new(TransportKind::Stream, loopback(), dir.path().join("out"));
    let mut receiver = Receiver::new(config).unwrap();
    let listening = receiver.listen().unwrap();
    let sender = spawn_sender(
        src.clone(),
        listening.local_addr(),
        SenderConfig::new(TransportKind::Stream),
    );

    let received = listening
        .accept_transfer(&NullObserver, &CancelToken::new())
        .unwrap();
    sender.join().unwrap().0.unwrap();
    assert_eq!(received.session().state(), SessionState::Streaming);
    let declared = received.metadata().expect("metadata recorded");
    assert_eq!(declared.name, "doc.bin");
    assert_eq!(declared.size, 20_000);
    assert_eq!(declared.digest, expected);

    let path = received.path().to_path_buf();
    let mut bytes = fs::read(&path).unwrap();
    bytes[1234] ^= 0xFF;
    fs::write(&path, &bytes).unwrap();
    let tampered = compute_digest(&path).unwrap();

    match received.validate() {
        Err(TransferError::ValidationMismatch {
            expected: e,
            computed: c,
            path: p,
        }) => {
            assert_eq!(e, expected);
            assert_eq!(c, tampered);
            assert_ne!(e, c);
            assert!(p.exists(), "mismatched file must be kept");
        }
        other => panic!("expected mismatch, got {other:?}"),
    }
}

#[test]
fn repeating_receiver_accepts_successive_transfers() {
    let dir = tempfile::tempdir().unwrap();
    let first = dir.path().join("first.bin");
    let second = dir.path().join("second.bin");
    write_pattern(&first, 30_000);
    write_pattern(&second, 12_345);
    let out = dir.path().join("inbox");

    // Find a free port, then release it for the receiver.
    let free_port = TcpListener::bind(loopback()).unwrap();
    let addr = free_port.local_addr().unwrap();
    drop(free_port);

    let config = ReceiverConfig::new(TransportKind::Stream, addr, &out);
    let mut receiver = Receiver::new(config).unwrap();
    let cancel = CancelToken::new();
    let loop_cancel = cancel.clone();
    let (report_tx, report_rx) = crossbeam_channel::unbounded::<ReceiveReport>();

    let receiver_loop = thread::spawn(move || {
        receiver.run_repeating(&NullObserver, &loop_cancel, |result| {
            if let Ok(report) = result {
                let _ = report_tx.send(report.clone());
            }
        })
    });

    let send_with_retry = |path: &Path| {
        let config = SenderConfig::new(TransportKind::Stream);
        for _ in 0..100 {
            match send_file(path, addr, &config, &NullObserver, &CancelToken::new()) {
                Ok(report) => return report,
                Err(TransferError::Transport(_)) => thread::sleep(Duration::from_millis(20)),
                Err(e) => panic!("send failed: {e}"),
            }
        }
        panic!("receiver never came up");
    };

    send_with_retry(&first);
    let r1 = report_rx.recv_timeout(Duration::from_secs(10)).unwrap();
    send_with_retry(&second);
    let r2 = report_rx.recv_timeout(Duration::from_secs(10)).unwrap();

    cancel.cancel();
    let summary = receiver_loop.join().unwrap().unwrap();

    assert_ne!(r1.session, r2.session);
    assert_eq!(r1.metadata.name, "first.bin");
    assert_eq!(r2.metadata.name, "second.bin");
    assert_eq!(fs::read(&first).unwrap(), fs::read(out.join("first.bin")).unwrap());
    assert_eq!(fs::read(&second).unwrap(), fs::read(out.join("second.bin")).unwrap());
    assert_eq!(summary.completed, 2);
    assert_eq!(summary.failed, 0);
}

#[test]
fn repeating_receiver_stops_on_bind_failure() {
    let dir = tempfile::tempdir().unwrap();
    let busy = UdpSocket::bind(loopback()).unwrap();
    let config = ReceiverConfig::new(TransportKind::Datagram, busy.local_addr().unwrap(), dir.path());
    let mut receiver = Receiver::new(config).unwrap();
    assert_eq!(receiver.config().kind, TransportKind::Datagram);

    let mut seen = 0;
    let err = receiver
        .run_repeating(&NullObserver, &CancelToken::new(), |_| seen += 1)
        .unwrap_err();
    assert!(matches!(err, TransferError::Bind { .. }), "got {err}");
    assert_eq!(seen, 1);
}

#[test]
fn repeating_receiver_continues_after_failed_session() {
    let dir = tempfile::tempdir().unwrap();
    let src = dir.path().join("good.bin");
    write_pattern(&src, 5000);
    let out = dir.path().join("inbox");

    let free_port = TcpListener::bind(loopback()).unwrap();
    let addr = free_port.local_addr().unwrap();
    drop(free_port);

    let mut receiver =
        Receiver::new(ReceiverConfig::new(TransportKind::Stream, addr, &out)).unwrap();
    let cancel = CancelToken::new();
    let loop_cancel = cancel.clone();
    let (outcome_tx, outcome_rx) = crossbeam_channel::unbounded::<Result<u64, String>>();

    let receiver_loop = thread::spawn(move || {
        receiver.run_repeating(&NullObserver, &loop_cancel, |result| {
            let outcome = match result {
                Ok(report) => Ok(report.bytes_received),
                Err(e) => Err(e.to_string()),
            };
            let _ = outcome_tx.send(outcome);
        })
    });

    // First session: garbage instead of metadata.
    let mut bad = None;
    for _ in 0..100 {
        match TcpStream::connect(addr) {
            Ok(stream) => {
                bad = Some(stream);
                break;
            }
            Err(_) => thread::sleep(Duration::from_millis(20)),
        }
    }
    let mut bad = bad.expect("receiver never came up");
    bad.write_all(b"definitely not json").unwrap();
    let first = outcome_rx.recv_timeout(Duration::from_secs(10)).unwrap();
    assert!(first.is_err(), "bad metadata accepted: {first:?}");
    drop(bad);

    // Second session: a real file on the same port.
    let config = SenderConfig::new(TransportKind::Stream);
    let mut sent = None;
    for _ in 0..100 {
        match send_file(&src, addr, &config, &NullObserver, &CancelToken::new()) {
            Ok(report) => {
                sent = Some(report);
                break;
            }
            Err(TransferError::Transport(_)) => thread::sleep(Duration::from_millis(20)),
            Err(e) => panic!("send failed: {e}"),
        }
    }
    assert_eq!(sent.expect("second session never started").bytes_sent, 5000);
    let second = outcome_rx.recv_timeout(Duration::from_secs(10)).unwrap();
    assert_eq!(second, Ok(5000));

    cancel.cancel();
    let summary = receiver_loop.join().unwrap().unwrap();
    assert_eq!(summary.completed, 1);
    assert_eq!(summary.failed, 1);
    assert_eq!(summary.mismatched, 0);
    assert_eq!(fs::read(&src).unwrap(), fs::read(out.join("good.bin")).unwrap());
}
