//! MonitoringSession - Composition root for one monitored patient
//!
//! ## Message Flow
//!
//! ```text
//! FrameCaptureScheduler ──readings──┐
//!                                   ├──▶ SessionActor ──▶ TelemetryHistoryBuffer
//! ReconnectingChannel ──messages────┘        │       └──▶ AlertAggregator
//!         │                                  │
//!         └── state ──▶ capture active flag  └──▶ SessionView (watch)
//! ```
//!
//! The actor task is the only writer of the buffer and the aggregator.

use std::sync::Arc;

use anyhow::Result;
use chrono::Utc;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, info, instrument, trace, warn};

use crate::alerts::{AlertAggregator, AlertId, AlertPolicy, AlertRecord, Severity};
use crate::analysis::AnalysisEndpoint;
use crate::capture::{CaptureHandle, CaptureHealth, CaptureSettings};
use crate::channel::{ChannelHandle, ChannelSettings, ConnectionState, Connector, Subscription};
use crate::config::Config;
use crate::frames::FrameSource;
use crate::history::TelemetryHistoryBuffer;
use crate::protocol::ChannelMessage;
use crate::reading::{PatientId, ReadingSource, ScoredReading};

/// What a session needs from the outside world
pub struct SessionDeps {
    pub connector: Arc<dyn Connector>,
    pub endpoint: Arc<dyn AnalysisEndpoint>,
    pub source: Box<dyn FrameSource>,
}

/// Derived state for presentation
#[derive(Debug, Clone)]
pub struct SessionView {
    pub patient: PatientId,
    pub latest_reading: Option<ScoredReading>,
    pub history: Arc<[ScoredReading]>,

    /// Oldest first
    pub active_alerts: Vec<AlertRecord>,

    pub connection_state: ConnectionState,
    pub analysis_degraded: bool,
}

impl SessionView {
    fn empty(patient: PatientId, connection_state: ConnectionState) -> Self {
        Self {
            patient,
            latest_reading: None,
            history: Arc::from(Vec::new()),
            active_alerts: Vec::new(),
            connection_state,
            analysis_degraded: false,
        }
    }
}

#[derive(Debug)]
enum SessionCommand {
    DismissAlert {
        id: AlertId,
        respond_to: oneshot::Sender<bool>,
    },
    Shutdown {
        respond_to: oneshot::Sender<()>,
    },
}

/// Buffer, aggregator and view for one patient
struct SessionState {
    patient: PatientId,
    history: TelemetryHistoryBuffer,
    alerts: AlertAggregator,
    connection_state: ConnectionState,
    analysis_degraded: bool,
}

impl SessionState {
    fn new(patient: PatientId, config: &Config, connection_state: ConnectionState) -> Self {
        Self {
            patient,
            history: TelemetryHistoryBuffer::new(config.history.capacity),
            alerts: AlertAggregator::new(AlertPolicy::from(&config.alerts)),
            connection_state,
            analysis_degraded: false,
        }
    }

    fn ingest(&mut self, reading: ScoredReading) -> Option<AlertRecord> {
        let alert = self.alerts.evaluate(&reading, self.patient);
        self.history.push(reading);

        if let Some(alert) = &alert {
            match alert.severity() {
                Severity::Urgent => warn!(
                    "patient {}: urgent pain alert (score {:.1})",
                    self.patient, alert.score
                ),
                Severity::Moderate => info!(
                    "patient {}: moderate pain alert (score {:.1})",
                    self.patient, alert.score
                ),
            }
        }

        alert
    }

    /// Turn a channel message addressed to this patient into a reading
    fn reading_from_message(&self, message: &ChannelMessage) -> Option<ScoredReading> {
        if !message.carries_score() {
            trace!("ignoring {} message", message.kind);
            return None;
        }

        if message.patient_id() != Some(self.patient) {
            trace!("ignoring {} message for another patient", message.kind);
            return None;
        }

        let result = match message.analysis() {
            Ok(result) => result,
            Err(e) => {
                warn!("dropping malformed {} message: {e}", message.kind);
                return None;
            }
        };

        match ScoredReading::from_analysis(result, ReadingSource::Channel, Utc::now()) {
            Ok(reading) => Some(reading),
            Err(e) => {
                warn!("dropping {} message: {e}", message.kind);
                None
            }
        }
    }

    fn view(&self) -> SessionView {
        SessionView {
            patient: self.patient,
            latest_reading: self.history.latest().cloned(),
            history: self.history.snapshot(),
            active_alerts: self.alerts.active(),
            connection_state: self.connection_state,
            analysis_degraded: self.analysis_degraded,
        }
    }
}

/// Actor task owning a [`SessionState`]
struct SessionActor {
    state: SessionState,
    require_channel: bool,

    reading_rx: mpsc::UnboundedReceiver<ScoredReading>,
    subscription: Subscription,
    connection_rx: watch::Receiver<ConnectionState>,
    health_rx: watch::Receiver<CaptureHealth>,
    command_rx: mpsc::Receiver<SessionCommand>,

    active_tx: watch::Sender<bool>,
    view_tx: watch::Sender<SessionView>,
}

impl SessionActor {
    #[instrument(skip(self), fields(patient = %self.state.patient))]
    async fn run(mut self) {
        debug!("starting monitoring session");

        let mut readings_closed = false;
        let mut messages_closed = false;
        let mut connection_closed = false;
        let mut health_closed = false;

        loop {
            tokio::select! {
                reading = self.reading_rx.recv(), if !readings_closed => {
                    match reading {
                        Some(reading) => {
                            self.state.ingest(reading);
                            self.publish();
                        }
                        None => readings_closed = true,
                    }
                }

                message = self.subscription.recv(), if !messages_closed => {
                    match message {
                        Some(message) => {
                            if let Some(reading) = self.state.reading_from_message(&message) {
                                self.state.ingest(reading);
                                self.publish();
                            }
                        }
                        None => messages_closed = true,
                    }
                }

                changed = self.connection_rx.changed(), if !connection_closed => {
                    if changed.is_err() {
                        connection_closed = true;
                        continue;
                    }

                    let state = *self.connection_rx.borrow_and_update();
                    self.state.connection_state = state;
                    self.update_active(state);
                    self.publish();
                }

                changed = self.health_rx.changed(), if !health_closed => {
                    if changed.is_err() {
                        health_closed = true;
                        continue;
                    }

                    let degraded = self.health_rx.borrow_and_update().degraded;
                    if degraded != self.state.analysis_degraded {
                        if degraded {
                            warn!("analysis endpoint degraded");
                        } else {
                            info!("analysis endpoint recovered");
                        }
                        self.state.analysis_degraded = degraded;
                        self.publish();
                    }
                }

                cmd = self.command_rx.recv() => {
                    match cmd {
                        Some(SessionCommand::DismissAlert { id, respond_to }) => {
                            let removed = self.state.alerts.dismiss(id);
                            if removed {
                                self.publish();
                            }
                            let _ = respond_to.send(removed);
                        }
                        Some(SessionCommand::Shutdown { respond_to }) => {
                            self.state.connection_state = *self.connection_rx.borrow();
                            self.publish();
                            debug!("monitoring session ended");
                            let _ = respond_to.send(());
                            break;
                        }
                        None => {
                            debug!("all session handles dropped");
                            break;
                        }
                    }
                }
            }
        }
    }

    fn update_active(&self, state: ConnectionState) {
        let active = !self.require_channel || state == ConnectionState::Open;
        self.active_tx.send_if_modified(|current| {
            if *current == active {
                false
            } else {
                *current = active;
                true
            }
        });
    }

    fn publish(&self) {
        self.view_tx.send_replace(self.state.view());
    }
}

/// Handle for one patient's monitoring pipeline
pub struct MonitoringSession {
    patient: PatientId,
    channel: ChannelHandle,
    capture: CaptureHandle,
    sender: mpsc::Sender<SessionCommand>,
    view_rx: watch::Receiver<SessionView>,
}

impl MonitoringSession {
    /// Wire up the channel and the scheduler and start capturing
    pub async fn start(patient: PatientId, config: &Config, deps: SessionDeps) -> Result<Self> {
        let url = config.ws_endpoint();
        info!("starting monitoring for patient {patient} via {url}");

        let channel = ChannelHandle::spawn(
            ChannelSettings::from_config(url, &config.channel),
            deps.connector,
        );
        let subscription = channel.subscribe();
        let connection_rx = channel.watch_state();
        let initial_state = *connection_rx.borrow();

        let require_channel = config.capture.require_channel;
        let (active_tx, active_rx) =
            watch::channel(!require_channel || initial_state == ConnectionState::Open);

        let (reading_tx, reading_rx) = mpsc::unbounded_channel();
        let capture = CaptureHandle::spawn(
            patient,
            CaptureSettings::from(&config.capture),
            deps.endpoint,
            deps.source,
            active_rx,
            reading_tx,
        );

        let state = SessionState::new(patient, config, initial_state);
        let (view_tx, view_rx) = watch::channel(SessionView::empty(patient, initial_state));
        let (cmd_tx, cmd_rx) = mpsc::channel(32);

        let actor = SessionActor {
            state,
            require_channel,
            reading_rx,
            subscription,
            connection_rx,
            health_rx: capture.watch_health(),
            command_rx: cmd_rx,
            active_tx,
            view_tx,
        };

        tokio::spawn(actor.run());

        capture.start().await?;

        Ok(Self {
            patient,
            channel,
            capture,
            sender: cmd_tx,
            view_rx,
        })
    }

    pub fn patient(&self) -> PatientId {
        self.patient
    }

    /// Latest published view
    pub fn view(&self) -> SessionView {
        self.view_rx.borrow().clone()
    }

    pub fn watch_view(&self) -> watch::Receiver<SessionView> {
        self.view_rx.clone()
    }

    pub fn channel(&self) -> &ChannelHandle {
        &self.channel
    }

    pub fn capture(&self) -> &CaptureHandle {
        &self.capture
    }

    /// Remove an active alert. Unknown ids and ended sessions return `false`.
    pub async fn dismiss_alert(&self, id: AlertId) -> bool {
        let (tx, rx) = oneshot::channel();
        if self
            .sender
            .send(SessionCommand::DismissAlert { id, respond_to: tx })
            .await
            .is_err()
        {
            return false;
        }

        rx.await.unwrap_or(false)
    }

    /// Disconnect the channel, stop the scheduler, then end the session task
    ///
    /// The last view stays readable afterwards. Calling it twice is harmless.
    pub async fn shutdown(&self) {
        self.channel.disconnect().await;

        if let Err(e) = self.capture.stop().await {
            trace!("capture already stopped: {e:#}");
        }
        if let Err(e) = self.capture.shutdown().await {
            trace!("capture already shut down: {e:#}");
        }

        let (tx, rx) = oneshot::channel();
        if self
            .sender
            .send(SessionCommand::Shutdown { respond_to: tx })
            .await
            .is_ok()
        {
            let _ = rx.await;
        }

        info!("stopped monitoring for patient {}", self.patient);
    }
}

/// What presentation should show
#[derive(Debug, Clone)]
pub enum MonitorView {
    NoPatientSelected,
    Monitoring(SessionView),
}

/// Owns at most one session and switches between patients
pub struct PatientMonitor {
    config: Config,
    connector: Arc<dyn Connector>,
    endpoint: Arc<dyn AnalysisEndpoint>,
    session: Option<MonitoringSession>,
}

impl PatientMonitor {
    pub fn new(
        config: Config,
        connector: Arc<dyn Connector>,
        endpoint: Arc<dyn AnalysisEndpoint>,
    ) -> Self {
        Self {
            config,
            connector,
            endpoint,
            session: None,
        }
    }

    /// Replace the current session
    ///
    /// The previous session is fully shut down before the new one starts, so
    /// no reading or alert carries over.
    pub async fn select_patient(
        &mut self,
        patient: PatientId,
        source: Box<dyn FrameSource>,
    ) -> Result<()> {
        self.clear_selection().await;

        let deps = SessionDeps {
            connector: self.connector.clone(),
            endpoint: self.endpoint.clone(),
            source,
        };
        self.session = Some(MonitoringSession::start(patient, &self.config, deps).await?);

        Ok(())
    }

    pub async fn clear_selection(&mut self) {
        if let Some(session) = self.session.take() {
            session.shutdown().await;
        }
    }

    pub fn session(&self) -> Option<&MonitoringSession> {
        self.session.as_ref()
    }

    pub fn view(&self) -> MonitorView {
        match &self.session {
            Some(session) => MonitorView::Monitoring(session.view()),
            None => MonitorView::NoPatientSelected,
        }
    }
}
