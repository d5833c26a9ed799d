//! End-to-end tests for the transfer engine over in-memory channels.
//!
//! These tests drive the encoder and decoder together and check the
//! reassembly, flow-control and fan-out guarantees.

mod common;

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use roomdrop_core::channel::{Channel, MemoryChannel};
use roomdrop_core::protocol::{encode_tagged_chunk, ChunkFraming, ControlMessage, FileMeta, Message};
use roomdrop_core::transfer::{
    Decoder, DecoderEvent, DestinationOutcome, Encoder, FileSource, FlowStrategy, TransferConfig,
};
use roomdrop_core::Error;

use common::{channel_pairs, random_bytes, spawn_receiver, within, ProbeChannel};

fn header(file_id: Option<&str>, name: &str, size: u64) -> Message {
    ControlMessage::Header {
        file_id: file_id.map(str::to_string),
        meta: FileMeta::new(name, size),
    }
    .to_message()
    .unwrap()
}

fn done(file_id: Option<&str>) -> Message {
    ControlMessage::Done {
        file_id: file_id.map(str::to_string),
    }
    .to_message()
    .unwrap()
}

fn chunk(file_id: &str, data: &[u8]) -> Message {
    Message::Binary(encode_tagged_chunk(file_id, data).unwrap())
}

fn completed(events: &[DecoderEvent]) -> Vec<&roomdrop_core::transfer::ReceivedFile> {
    events
        .iter()
        .filter_map(|e| match e {
            DecoderEvent::Completed(file) => Some(file),
            _ => None,
        })
        .collect()
}

/// 500000 bytes at 65536 per chunk is 8 full chunks plus 11072 bytes.
#[tokio::test]
async fn test_chunk_count_for_half_megabyte_file() {
    let data = random_bytes(500_000);
    let (tx, rx) = MemoryChannel::pair();
    let tx = Arc::new(tx);

    let encoder = Encoder::new(TransferConfig::default());
    let report = within(
        10,
        encoder.send_file(
            FileSource::from_bytes("a.bin", data.clone()),
            vec![Arc::clone(&tx)],
            CancellationToken::new(),
        ),
    )
    .await;
    assert!(report.all_succeeded());
    drop(tx);

    let mut decoder = Decoder::new(ChunkFraming::Untagged, None);
    let mut binary_sizes = Vec::new();
    let mut files = Vec::new();
    while let Some(message) = rx.recv().await {
        if let Message::Binary(data) = &message {
            binary_sizes.push(data.len());
        }
        for event in decoder.on_message(message) {
            if let DecoderEvent::Completed(file) = event {
                files.push(file);
            }
        }
    }

    assert_eq!(binary_sizes.len(), 9);
    assert!(binary_sizes[..8].iter().all(|&len| len == 65536));
    assert_eq!(binary_sizes[8], 11072);

    assert_eq!(files.len(), 1);
    assert_eq!(files[0].meta.filename, "a.bin");
    assert_eq!(files[0].data.len(), 500_000);
    assert_eq!(files[0].chunks, 9);
    assert_eq!(files[0].data, data);
}

#[tokio::test]
async fn test_zero_size_file() {
    let (tx, rx) = MemoryChannel::pair();
    let tx = Arc::new(tx);

    let report = Encoder::new(TransferConfig::default())
        .send_file(
            FileSource::from_bytes("empty.txt", Vec::new()),
            vec![Arc::clone(&tx)],
            CancellationToken::new(),
        )
        .await;
    assert!(report.all_succeeded());
    drop(tx);

    let mut messages = Vec::new();
    while let Some(message) = rx.recv().await {
        messages.push(message);
    }
    assert_eq!(messages.len(), 2, "header then done, no chunks");

    let mut decoder = Decoder::new(ChunkFraming::Untagged, None);
    assert!(completed(&decoder.on_message(messages[0].clone())).is_empty());
    let events = decoder.on_message(messages[1].clone());
    let files = completed(&events);
    assert_eq!(files.len(), 1);
    assert!(files[0].data.is_empty());
    assert_eq!(files[0].chunks, 0);
}

/// A file finalizes only once both `done` and exactly its size are in.
#[tokio::test]
async fn test_finalize_needs_done_and_full_size() {
    let mut decoder = Decoder::new(ChunkFraming::Tagged, None);

    let events = decoder.on_message(header(Some("f"), "f.bin", 6));
    assert!(completed(&events).is_empty());
    assert!(completed(&decoder.on_message(chunk("f", &[1, 2, 3]))).is_empty());
    assert!(completed(&decoder.on_message(chunk("f", &[4, 5, 6]))).is_empty());
    assert_eq!(decoder.open_count(), 1);

    let events = decoder.on_message(done(Some("f")));
    assert_eq!(completed(&events)[0].data, vec![1, 2, 3, 4, 5, 6]);

    // done first, bytes later
    decoder.on_message(header(Some("g"), "g.bin", 4));
    decoder.on_message(chunk("g", &[9, 9]));
    assert!(completed(&decoder.on_message(done(Some("g")))).is_empty());
    let events = decoder.on_message(chunk("g", &[8, 8]));
    assert_eq!(completed(&events)[0].data, vec![9, 9, 8, 8]);

    // overflow abandons the file instead of finalizing it
    decoder.on_message(header(Some("h"), "h.bin", 2));
    let events = decoder.on_message(chunk("h", &[1, 2, 3]));
    assert!(events.iter().any(|e| matches!(
        e,
        DecoderEvent::Failed {
            error: Error::SizeMismatch { .. },
            ..
        }
    )));
    assert!(completed(&decoder.on_message(done(Some("h")))).is_empty());
    assert_eq!(decoder.completed_count(), 2);
}

/// Early chunks and `done` wait for their header, among unrelated traffic.
#[tokio::test]
async fn test_early_messages_replay_in_order() {
    let a = random_bytes(30);
    let b = random_bytes(20);
    let mut decoder = Decoder::new(ChunkFraming::Tagged, None);

    let sequence = vec![
        chunk("a", &a[..10]),
        header(Some("b"), "b.bin", 20),
        chunk("a", &a[10..20]),
        chunk("b", &b[..10]),
        chunk("a", &a[20..]),
        done(Some("a")),
        chunk("b", &b[10..]),
        header(Some("a"), "a.bin", 30),
        done(Some("b")),
    ];

    let mut files = Vec::new();
    for message in sequence {
        for event in decoder.on_message(message) {
            if let DecoderEvent::Completed(file) = event {
                files.push(file);
            }
        }
    }

    assert_eq!(files.len(), 2);
    assert_eq!(files[0].file_id.as_deref(), Some("a"));
    assert_eq!(files[0].data, a);
    assert_eq!(files[1].file_id.as_deref(), Some("b"));
    assert_eq!(files[1].data, b);
    assert_eq!(decoder.pending_count(), 0);
}

#[tokio::test]
async fn test_pipelined_and_interleaved_files() {
    let a = random_bytes(100_000);
    let b = random_bytes(70_000);

    for inflight in [1, 2] {
        let config = TransferConfig {
            chunk_size: 8192,
            ..TransferConfig::default()
        }
        .pipelined(inflight);

        let (senders, receivers) = channel_pairs(1);
        let receiver = spawn_receiver(
            Arc::clone(&receivers[0]),
            Decoder::from_config(&config),
        );

        let files = vec![
            FileSource::from_bytes("a.bin", a.clone()),
            FileSource::from_bytes("b.bin", b.clone()),
        ];
        let report = within(
            10,
            Encoder::new(config).send_files(files, senders, CancellationToken::new()),
        )
        .await;
        assert!(report.all_succeeded(), "inflight {inflight}");

        let received = within(10, receiver).await.unwrap();
        assert_eq!(received.len(), 2);
        let by_name = |name: &str| {
            received
                .iter()
                .find(|f| f.meta.filename == name)
                .map(|f| f.data.clone())
        };
        assert_eq!(by_name("a.bin"), Some(a.clone()));
        assert_eq!(by_name("b.bin"), Some(b.clone()));
    }
}

#[tokio::test]
async fn test_explicit_interleaving() {
    let a = random_bytes(12);
    let b = random_bytes(9);
    let mut decoder = Decoder::new(ChunkFraming::Tagged, None);

    let sequence = vec![
        header(Some("A"), "a", 12),
        chunk("A", &a[..6]),
        header(Some("B"), "b", 9),
        chunk("B", &b[..3]),
        chunk("A", &a[6..]),
        chunk("B", &b[3..]),
        done(Some("A")),
        done(Some("B")),
    ];
    let mut files = Vec::new();
    for message in sequence {
        for event in decoder.on_message(message) {
            if let DecoderEvent::Completed(file) = event {
                files.push(file);
            }
        }
    }
    assert_eq!(files.len(), 2);
    assert_eq!(files[0].data, a);
    assert_eq!(files[1].data, b);
}

#[tokio::test]
async fn test_threshold_never_exceeds_high_water_by_more_than_a_chunk() {
    let high_water = 64 * 1024;
    let chunk_size = 16 * 1024;
    let config = TransferConfig {
        chunk_size,
        flow: FlowStrategy::Threshold {
            high_water,
            low_water: 16 * 1024,
        },
        ..TransferConfig::default()
    };

    let (local, remote) = MemoryChannel::pair();
    let probe = Arc::new(ProbeChannel::new(local));
    let remote = Arc::new(remote);

    // a slow reader keeps the gate busy
    let reader = {
        let remote = Arc::clone(&remote);
        tokio::spawn(async move {
            let mut total = 0usize;
            while let Some(message) = remote.recv().await {
                if let Message::Binary(data) = message {
                    total += data.len();
                    tokio::time::sleep(Duration::from_millis(1)).await;
                }
            }
            total
        })
    };

    let data = random_bytes(1024 * 1024);
    let report = within(
        30,
        Encoder::new(config).send_file(
            FileSource::from_bytes("big.bin", data),
            vec![Arc::clone(&probe)],
            CancellationToken::new(),
        ),
    )
    .await;
    assert!(report.all_succeeded());

    assert!(
        probe.peak_buffered() <= high_water + chunk_size as u64,
        "peak {} above bound",
        probe.peak_buffered()
    );
    assert_eq!(probe.largest_binary(), chunk_size as u64);

    probe.close();
    assert_eq!(within(10, reader).await.unwrap(), 1024 * 1024);
}

#[tokio::test]
async fn test_window_bounds_unacknowledged_chunks() {
    let window = 4;
    let config = TransferConfig {
        chunk_size: 1000,
        ..TransferConfig::default()
    }
    .windowed(window, 2);

    let (senders, receivers) = channel_pairs(1);
    let remote = Arc::clone(&receivers[0]);
    let data = random_bytes(20_000);

    let send = {
        let data = data.clone();
        let config = config.clone();
        tokio::spawn(async move {
            Encoder::new(config)
                .send_file(
                    FileSource::from_bytes("w.bin", data),
                    senders,
                    CancellationToken::new(),
                )
                .await
        })
    };

    // read without acking: exactly `window` chunks may arrive
    let mut withheld = Vec::new();
    let mut chunks = 0;
    while chunks < window {
        let message = within(5, remote.recv()).await.unwrap();
        if matches!(message, Message::Binary(_)) {
            chunks += 1;
        }
        withheld.push(message);
    }
    let extra = tokio::time::timeout(Duration::from_millis(200), remote.recv()).await;
    assert!(extra.is_err(), "sender exceeded its window");

    // now decode normally, acks flowing back
    let mut decoder = Decoder::from_config(&config);
    let mut files = Vec::new();
    let mut handle = |message: Message, files: &mut Vec<_>| {
        for event in decoder.on_message(message) {
            match event {
                DecoderEvent::SendAck(ack) => {
                    remote.send(ack.to_message().unwrap()).unwrap();
                }
                DecoderEvent::Completed(file) => files.push(file),
                _ => {}
            }
        }
    };
    for message in withheld {
        handle(message, &mut files);
    }
    while files.is_empty() {
        let message = within(5, remote.recv()).await.unwrap();
        handle(message, &mut files);
    }

    let report = within(10, send).await.unwrap();
    assert!(report.all_succeeded());
    assert_eq!(files[0].data, data);
    assert_eq!(files[0].chunks, 20);
}

#[tokio::test]
async fn test_windowed_fan_out_completes() {
    let config = TransferConfig {
        chunk_size: 4096,
        ..TransferConfig::default()
    }
    .windowed(8, 3)
    .pipelined(2);

    let (senders, receivers) = channel_pairs(3);
    let handles: Vec<_> = receivers
        .iter()
        .map(|r| spawn_receiver(Arc::clone(r), Decoder::from_config(&config)))
        .collect();

    let files: Vec<_> = (0..4)
        .map(|i| FileSource::from_bytes(format!("f{i}.bin"), random_bytes(10_000 + i * 3000)))
        .collect();
    let report = within(
        20,
        Encoder::new(config).send_files(files, senders, CancellationToken::new()),
    )
    .await;
    assert_eq!(report.succeeded_count(), 3);

    for receiver in &receivers {
        receiver.close();
    }
    for handle in handles {
        assert_eq!(within(10, handle).await.unwrap().len(), 4);
    }
}

/// A receiver that drops mid-transfer fails alone.
#[tokio::test]
async fn test_disconnect_mid_transfer_spares_survivors() {
    let config = TransferConfig {
        chunk_size: 16 * 1024,
        flow: FlowStrategy::Threshold {
            high_water: 64 * 1024,
            low_water: 16 * 1024,
        },
        ..TransferConfig::default()
    };

    let (senders, mut receivers) = channel_pairs(2);
    let quitter = receivers.pop().unwrap();
    let survivor = spawn_receiver(Arc::clone(&receivers[0]), Decoder::from_config(&config));

    let quit = tokio::spawn(async move {
        for _ in 0..3 {
            quitter.recv().await;
        }
        quitter.close();
    });

    let data = random_bytes(2 * 1024 * 1024);
    let report = within(
        30,
        Encoder::new(config).send_file(
            FileSource::from_bytes("shared.bin", data.clone()),
            senders,
            CancellationToken::new(),
        ),
    )
    .await;
    quit.await.unwrap();

    assert!(report.outcomes[0].is_success());
    assert!(matches!(
        &report.outcomes[1],
        DestinationOutcome::Failed {
            reason: Error::ChannelClosedMidTransfer
        }
    ));
    assert_eq!(report.succeeded_count(), 1);
    assert_eq!(report.failed_count(), 1);

    receivers[0].close();
    let files = within(10, survivor).await.unwrap();
    assert_eq!(files.len(), 1);
    assert_eq!(files[0].data, data);
}

/// R2 never reads; R1 must still finish and R2 must time out.
#[tokio::test]
async fn test_stalled_receiver_times_out() {
    let config = TransferConfig {
        chunk_size: 16 * 1024,
        flow: FlowStrategy::Threshold {
            high_water: 64 * 1024,
            low_water: 16 * 1024,
        },
        flow_timeout: Some(Duration::from_millis(300)),
        ..TransferConfig::default()
    };

    let (senders, receivers) = channel_pairs(2);
    let r1 = spawn_receiver(Arc::clone(&receivers[0]), Decoder::from_config(&config));
    let stalled = Arc::clone(&receivers[1]);

    let data = random_bytes(1024 * 1024);
    let report = within(
        10,
        Encoder::new(config).send_file(
            FileSource::from_bytes("a.bin", data.clone()),
            senders,
            CancellationToken::new(),
        ),
    )
    .await;

    assert!(report.outcomes[0].is_success());
    assert!(matches!(
        report.outcomes[1],
        DestinationOutcome::Failed {
            reason: Error::FlowControlTimeout(_)
        }
    ));
    assert!(!stalled.is_open(), "timed-out destination is closed");

    receivers[0].close();
    let files = within(10, r1).await.unwrap();
    assert_eq!(files[0].data, data);
}

#[tokio::test]
async fn test_cancel_mid_transfer() {
    let config = TransferConfig {
        chunk_size: 1024,
        flow: FlowStrategy::Threshold {
            high_water: 4096,
            low_water: 1024,
        },
        ..TransferConfig::default()
    };
    let (senders, _receivers) = channel_pairs(1);
    let cancel = CancellationToken::new();

    let send = {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            Encoder::new(config)
                .send_file(
                    FileSource::from_bytes("c.bin", random_bytes(1024 * 1024)),
                    senders,
                    cancel,
                )
                .await
        })
    };

    tokio::time::sleep(Duration::from_millis(50)).await;
    cancel.cancel();

    let report = within(5, send).await.unwrap();
    assert_eq!(report.cancelled_count(), 1);
}

#[tokio::test]
async fn test_send_from_disk() {
    let dir = common::create_temp_dir();
    let path = dir.path().join("photo.png");
    let data = random_bytes(150_000);
    std::fs::write(&path, &data).unwrap();

    let source = FileSource::from_path(&path).await.unwrap();
    let config = TransferConfig {
        chunk_size: 32 * 1024,
        ..TransferConfig::default()
    };
    let (senders, receivers) = channel_pairs(1);
    let receiver = spawn_receiver(Arc::clone(&receivers[0]), Decoder::from_config(&config));

    let report = Encoder::new(config)
        .send_file(source, senders, CancellationToken::new())
        .await;
    assert!(report.all_succeeded());

    receivers[0].close();
    let files = within(10, receiver).await.unwrap();
    assert_eq!(files[0].meta.mime_type, "image/png");

    let out = common::create_temp_dir();
    let saved = files[0].save_to(out.path()).await.unwrap();
    assert_eq!(std::fs::read(saved).unwrap(), data);
}
