//! End-to-end session tests
//!
//! A session is wired to a scripted connector, a scripted analysis endpoint
//! and an in-memory frame source:
//! - Capture readings reach history and alerts
//! - Channel updates are filtered by patient
//! - Capture follows the channel's open state
//! - Patient switches start from an empty state

use std::sync::Arc;
use std::time::Duration;

use neoguard::{
    Config, ConnectionState, FrameSource, MonitorView, MonitoringSession, PatientId, PatientMonitor,
    ReadingSource, SessionDeps, Severity,
};
use pretty_assertions::assert_eq;
use tokio::time::sleep;

use crate::helpers::*;

fn deps(
    connector: Arc<ScriptedConnector>,
    endpoint: Arc<ScriptedEndpoint>,
    source: Box<dyn FrameSource>,
) -> SessionDeps {
    SessionDeps {
        connector,
        endpoint,
        source,
    }
}

#[tokio::test(start_paused = true)]
async fn test_capture_readings_feed_history_and_alerts() {
    let connector = ScriptedConnector::new();
    let _peer = connector.accept();
    let endpoint = ScriptedEndpoint::new(vec![Some(2.0), Some(5.0), Some(8.0)]);

    let session = MonitoringSession::start(
        PatientId(1),
        &Config::default(),
        deps(connector, endpoint.clone(), Box::new(StaticFrames)),
    )
    .await
    .unwrap();

    let mut views = session.watch_view();
    let view = wait_for_view(&mut views, |v| v.history.len() == 3).await;

    let scores: Vec<f64> = view.history.iter().map(|r| r.composite_score).collect();
    assert_eq!(scores, vec![2.0, 5.0, 8.0]);
    assert!(view.history.iter().all(|r| r.source == ReadingSource::Capture));
    assert_eq!(view.latest_reading.map(|r| r.composite_score), Some(8.0));

    // 8.0 lands inside the debounce window opened by 5.0
    assert_eq!(view.active_alerts.len(), 1);
    assert_eq!(view.active_alerts[0].score, 5.0);
    assert_eq!(view.active_alerts[0].severity(), Severity::Moderate);
    assert_eq!(view.connection_state, ConnectionState::Open);

    session.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_failures_surface_as_degraded() {
    let connector = ScriptedConnector::new();
    let _peer = connector.accept();
    let endpoint = ScriptedEndpoint::new(vec![]);

    let session = MonitoringSession::start(
        PatientId(1),
        &Config::default(),
        deps(connector, endpoint.clone(), Box::new(StaticFrames)),
    )
    .await
    .unwrap();

    let mut views = session.watch_view();
    let view = wait_for_view(&mut views, |v| v.analysis_degraded).await;

    assert!(view.history.is_empty());
    assert!(endpoint.calls() >= 3);

    session.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_capture_waits_for_open_channel() {
    let connector = ScriptedConnector::new();
    connector.hang();
    let endpoint = ScriptedEndpoint::constant(3.0);

    let session = MonitoringSession::start(
        PatientId(1),
        &Config::default(),
        deps(connector, endpoint.clone(), Box::new(StaticFrames)),
    )
    .await
    .unwrap();

    sleep(Duration::from_secs(5)).await;

    let view = session.view();
    assert_eq!(view.connection_state, ConnectionState::Connecting);
    assert!(view.history.is_empty());
    assert_eq!(endpoint.calls(), 0);

    session.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_capture_ignores_channel_when_not_required() {
    let connector = ScriptedConnector::new();
    connector.hang();
    let endpoint = ScriptedEndpoint::constant(3.0);

    let mut config = Config::default();
    config.capture.require_channel = false;

    let session = MonitoringSession::start(
        PatientId(1),
        &config,
        deps(connector, endpoint.clone(), Box::new(StaticFrames)),
    )
    .await
    .unwrap();

    let mut views = session.watch_view();
    let view = wait_for_view(&mut views, |v| v.history.len() >= 2).await;

    assert_eq!(view.connection_state, ConnectionState::Connecting);
    assert!(endpoint.calls() >= 2);

    session.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_channel_updates_are_filtered_by_patient() {
    let connector = ScriptedConnector::new();
    let peer = connector.accept();
    let endpoint = ScriptedEndpoint::constant(1.0);

    let session = MonitoringSession::start(
        PatientId(1),
        &Config::default(),
        deps(connector, endpoint, Box::new(NoFrames)),
    )
    .await
    .unwrap();

    let mut views = session.watch_view();
    wait_for_view(&mut views, |v| v.connection_state == ConnectionState::Open).await;

    peer.send_json(pain_update(2, 9.5));
    peer.send_json(pain_update(1, 7.5));

    let view = wait_for_view(&mut views, |v| !v.history.is_empty()).await;

    assert_eq!(view.history.len(), 1);
    let reading = &view.history[0];
    assert_eq!(reading.composite_score, 7.5);
    assert_eq!(reading.source, ReadingSource::Channel);
    assert_eq!(reading.cry_type, "none");

    assert_eq!(view.active_alerts.len(), 1);
    assert_eq!(view.active_alerts[0].patient, PatientId(1));
    assert_eq!(view.active_alerts[0].severity(), Severity::Urgent);

    session.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_dismiss_alert_is_idempotent() {
    let connector = ScriptedConnector::new();
    let peer = connector.accept();
    let endpoint = ScriptedEndpoint::constant(1.0);

    let session = MonitoringSession::start(
        PatientId(3),
        &Config::default(),
        deps(connector, endpoint, Box::new(NoFrames)),
    )
    .await
    .unwrap();

    let mut views = session.watch_view();
    wait_for_view(&mut views, |v| v.connection_state == ConnectionState::Open).await;

    peer.send_json(pain_update(3, 6.0));
    let view = wait_for_view(&mut views, |v| !v.active_alerts.is_empty()).await;
    let id = view.active_alerts[0].id;

    assert!(session.dismiss_alert(id).await);
    assert!(!session.dismiss_alert(id).await);
    assert!(!session.dismiss_alert(id + 1_000).await);
    assert!(session.view().active_alerts.is_empty());
    assert_eq!(session.view().history.len(), 1);

    session.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_freezes_last_view() {
    let connector = ScriptedConnector::new();
    let peer = connector.accept();
    let endpoint = ScriptedEndpoint::constant(1.0);

    let session = MonitoringSession::start(
        PatientId(5),
        &Config::default(),
        deps(connector.clone(), endpoint, Box::new(NoFrames)),
    )
    .await
    .unwrap();

    let mut views = session.watch_view();
    wait_for_view(&mut views, |v| v.connection_state == ConnectionState::Open).await;
    peer.send_json(pain_update(5, 2.0));
    wait_for_view(&mut views, |v| v.history.len() == 1).await;

    session.shutdown().await;

    let view = session.view();
    assert_eq!(view.connection_state, ConnectionState::Closing);
    assert_eq!(view.history.len(), 1);
    assert!(peer.is_closed());

    // Nothing reconnects or ingests after shutdown
    peer.send_json(pain_update(5, 9.0));
    sleep(Duration::from_secs(60)).await;
    assert_eq!(session.view().history.len(), 1);
    assert_eq!(connector.attempts().len(), 1);

    session.shutdown().await;
    assert!(!session.dismiss_alert(1).await);
}

#[tokio::test(start_paused = true)]
async fn test_patient_switch_starts_empty() {
    let connector = ScriptedConnector::new();
    let first_peer = connector.accept();
    let second_peer = connector.accept();
    let endpoint = ScriptedEndpoint::constant(1.0);

    let mut monitor = PatientMonitor::new(Config::default(), connector.clone(), endpoint);
    assert!(matches!(monitor.view(), MonitorView::NoPatientSelected));

    monitor
        .select_patient(PatientId(1), Box::new(NoFrames))
        .await
        .unwrap();

    let mut views = monitor.session().unwrap().watch_view();
    wait_for_view(&mut views, |v| v.connection_state == ConnectionState::Open).await;
    first_peer.send_json(pain_update(1, 8.0));
    wait_for_view(&mut views, |v| !v.active_alerts.is_empty()).await;

    monitor
        .select_patient(PatientId(2), Box::new(NoFrames))
        .await
        .unwrap();

    assert!(first_peer.is_closed());

    let MonitorView::Monitoring(view) = monitor.view() else {
        panic!("expected an active session");
    };
    assert_eq!(view.patient, PatientId(2));
    assert!(view.history.is_empty());
    assert!(view.active_alerts.is_empty());
    assert!(view.latest_reading.is_none());

    let mut views = monitor.session().unwrap().watch_view();
    wait_for_view(&mut views, |v| v.connection_state == ConnectionState::Open).await;

    // Updates for the previous patient no longer count
    second_peer.send_json(pain_update(1, 9.0));
    second_peer.send_json(pain_update(2, 4.5));
    let view = wait_for_view(&mut views, |v| !v.history.is_empty()).await;
    assert_eq!(view.history.len(), 1);
    assert_eq!(view.history[0].composite_score, 4.5);

    monitor.clear_selection().await;
    assert!(matches!(monitor.view(), MonitorView::NoPatientSelected));
    assert!(second_peer.is_closed());
}
