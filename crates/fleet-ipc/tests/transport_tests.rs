//! Transport tests over in-memory pipes.
//!
//! A `tokio::io::duplex` pair stands in for a worker's stdin/stdout.

#![allow(clippy::unwrap_used)]
#![allow(clippy::expect_used)]
#![allow(clippy::panic)]

use fleet_core::{IngestionMode, MutableSettings};
use fleet_ipc::{
    ControllerMessage, FrameReader, FrameWriter, LogLevel, MAX_PAYLOAD_SIZE, RequestKind,
    TransportError, WorkerMessage, decode_frame,
};
use proptest::prelude::*;

#[tokio::test]
async fn given_worker_session_when_messages_exchanged_then_order_is_preserved() {
    let (controller_end, worker_end) = tokio::io::duplex(64 * 1024);
    let (controller_read, controller_write) = tokio::io::split(controller_end);
    let (worker_read, worker_write) = tokio::io::split(worker_end);

    let mut to_worker = FrameWriter::new(controller_write);
    let mut from_controller = FrameReader::new(worker_read);
    let mut to_controller = FrameWriter::new(worker_write);
    let mut from_worker = FrameReader::new(controller_read);

    to_controller.send(&WorkerMessage::Ready { pid: 4242 }).await.unwrap();
    to_controller
        .send(&WorkerMessage::Log {
            level: LogLevel::Info,
            line: "connected to platform".to_string(),
        })
        .await
        .unwrap();

    let first: WorkerMessage = from_worker.recv().await.unwrap();
    let second: WorkerMessage = from_worker.recv().await.unwrap();
    assert_eq!(first, WorkerMessage::Ready { pid: 4242 });
    assert!(matches!(second, WorkerMessage::Log { level: LogLevel::Info, .. }));

    let reload = ControllerMessage::HotReload {
        revision: 3,
        settings: MutableSettings {
            prompt: "You are terse.".to_string(),
            model: "gpt-4o".to_string(),
            display_name: "Terse Bot".to_string(),
        },
    };
    to_worker.send(&reload).await.unwrap();
    to_worker
        .send(&ControllerMessage::SetMode {
            mode: IngestionMode::Webhook,
        })
        .await
        .unwrap();

    let got_reload: ControllerMessage = from_controller.recv().await.unwrap();
    let got_mode: ControllerMessage = from_controller.recv().await.unwrap();
    assert_eq!(got_reload, reload);
    assert_eq!(
        got_mode,
        ControllerMessage::SetMode {
            mode: IngestionMode::Webhook
        }
    );
}

#[tokio::test]
async fn given_oversized_webhook_payload_when_sent_then_rejected_before_write() {
    let (controller_end, _worker_end) = tokio::io::duplex(1024);
    let mut writer = FrameWriter::new(controller_end);

    let result = writer
        .send(&ControllerMessage::WebhookUpdate {
            payload: "x".repeat(MAX_PAYLOAD_SIZE + 1),
        })
        .await;

    assert!(matches!(result, Err(TransportError::FrameTooLarge { .. })));
}

#[tokio::test]
async fn given_worker_exits_mid_frame_when_reading_then_truncation_is_not_a_clean_close() {
    use tokio::io::AsyncWriteExt;

    let (mut raw_worker, controller_end) = tokio::io::duplex(1024);
    raw_worker.write_all(&[0, 0, 0, 10, 1, 2]).await.unwrap();
    drop(raw_worker);

    let mut reader = FrameReader::new(controller_end);
    let err = reader.recv::<WorkerMessage>().await.unwrap_err();
    assert!(matches!(err, TransportError::Truncated { read: 4, expected: 14 }));
    assert!(!err.is_closed());
}

#[tokio::test]
async fn given_request_when_response_sent_then_ids_match() {
    let (a, b) = tokio::io::duplex(4096);
    let mut writer = FrameWriter::new(a);
    let mut reader = FrameReader::new(b);

    writer
        .send(&WorkerMessage::Request {
            request_id: 9,
            kind: RequestKind::AssistantMetadata,
        })
        .await
        .unwrap();

    match reader.recv::<WorkerMessage>().await.unwrap() {
        WorkerMessage::Request { request_id, kind } => {
            assert_eq!(request_id, 9);
            assert_eq!(kind, RequestKind::AssistantMetadata);
        }
        other => panic!("unexpected message {other:?}"),
    }
}

proptest! {
    #[test]
    fn arbitrary_bytes_never_panic_the_decoder(bytes in proptest::collection::vec(any::<u8>(), 0..64)) {
        let _ = decode_frame::<WorkerMessage>(&bytes);
    }
}
