//! Capture scheduler against a wiremock analysis backend

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use neoguard::{
    CaptureHandle, CaptureSettings, HttpAnalysisClient, PatientId, ReadingSource, ScoredReading,
};
use tokio::sync::{mpsc, watch};
use wiremock::matchers::{body_partial_json, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use crate::helpers::*;

fn settings() -> CaptureSettings {
    CaptureSettings {
        interval: Duration::from_millis(50),
        request_timeout: Duration::from_secs(2),
        degraded_after: 3,
    }
}

fn spawn(
    server: &MockServer,
    settings: CaptureSettings,
    active: bool,
) -> (
    CaptureHandle,
    mpsc::UnboundedReceiver<ScoredReading>,
    watch::Sender<bool>,
) {
    let client = HttpAnalysisClient::new(&server.uri(), settings.request_timeout).unwrap();
    let (active_tx, active_rx) = watch::channel(active);
    let (reading_tx, reading_rx) = mpsc::unbounded_channel();

    let handle = CaptureHandle::spawn(
        PatientId(12),
        settings,
        Arc::new(client),
        Box::new(StaticFrames),
        active_rx,
        reading_tx,
    );

    (handle, reading_rx, active_tx)
}

#[tokio::test]
async fn test_capture_posts_frames_and_emits_readings() {
    let mock_server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/api/analyze/frame"))
        .and(body_partial_json(serde_json::json!({ "patient_id": 12 })))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "face_detected": true,
            "facial_score": 3.2,
            "audio_score": null,
            "composite_score": 3.2,
            "alert_level": "low",
            "cry_detected": false,
            "cry_type": "no_cry",
            "features": {"brow_furrow": 0.4, "eye_squeeze": 0.1},
            "timestamp": "2025-03-01T08:30:00.000001"
        })))
        .mount(&mock_server)
        .await;

    let (handle, mut readings, _active) = spawn(&mock_server, settings(), true);
    handle.start().await.unwrap();

    for _ in 0..2 {
        let reading = tokio::time::timeout(Duration::from_secs(5), readings.recv())
            .await
            .unwrap()
            .unwrap();

        assert_eq!(reading.composite_score, 3.2);
        assert_eq!(reading.audio_score, None);
        assert_eq!(reading.source, ReadingSource::Capture);
        assert_eq!(reading.cry_type, "none");
        assert_eq!(
            reading.features.as_ref().and_then(|f| f.get("brow_furrow")).copied(),
            Some(0.4)
        );
    }

    handle.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_slow_backend_limits_request_rate() {
    let mock_server = MockServer::start().await;
    let received = Arc::new(AtomicUsize::new(0));
    let counter = received.clone();

    Mock::given(method("POST"))
        .and(path("/api/analyze/frame"))
        .respond_with(move |_req: &wiremock::Request| {
            counter.fetch_add(1, Ordering::SeqCst);
            ResponseTemplate::new(200)
                .set_body_json(serde_json::json!({"composite_score": 1.0}))
                .set_delay(Duration::from_millis(400))
        })
        .mount(&mock_server)
        .await;

    let (handle, _readings, _active) = spawn(&mock_server, settings(), true);
    handle.start().await.unwrap();

    tokio::time::sleep(Duration::from_millis(1_000)).await;
    handle.stop().await.unwrap();

    // 50ms ticks for one second, but each request holds the slot for 400ms
    let requests = received.load(Ordering::SeqCst);
    assert!((2..=3).contains(&requests), "{requests} requests");
    assert!(handle.health().skipped_ticks > 0);
}

#[tokio::test]
async fn test_server_errors_degrade_capture() {
    let mock_server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/api/analyze/frame"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&mock_server)
        .await;

    let (handle, mut readings, _active) = spawn(&mock_server, settings(), true);
    let mut health = handle.watch_health();
    handle.start().await.unwrap();

    tokio::time::timeout(Duration::from_secs(5), health.wait_for(|h| h.degraded))
        .await
        .unwrap()
        .unwrap();

    assert!(readings.try_recv().is_err());
    assert!(handle.health().consecutive_failures >= 3);

    handle.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_inactive_capture_sends_nothing() {
    let mock_server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/api/analyze/frame"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"composite_score": 1.0})))
        .expect(0)
        .mount(&mock_server)
        .await;

    let (handle, _readings, _active) = spawn(&mock_server, settings(), false);
    handle.start().await.unwrap();

    tokio::time::sleep(Duration::from_millis(300)).await;

    assert!(!handle.health().running);
    handle.shutdown().await.unwrap();
}
