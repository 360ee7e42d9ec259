//! FrameCaptureScheduler - Periodic frame submission to the analysis endpoint
//!
//! ## Message Flow
//!
//! ```text
//! Timer tick → slot free? → acquire frame → spawn request ─┐
//!     │            │                                        │
//!     │            └─ slot busy → skip tick                 │
//!     │                                                     ▼
//!     │                          Outcome{generation} → ScoredReading → session
//!     └─── Commands (Start, Stop, Shutdown), active condition (watch)
//! ```
//!
//! ## At-Most-One-In-Flight
//!
//! The capture slot is owned by the actor loop and is only checked and set
//! between two `select!` iterations, so no lock is required. A tick that
//! finds the slot occupied is dropped, not queued.
//!
//! Every request carries a generation number. Stopping (or losing the active
//! condition) aborts the request task and frees the slot, so any outcome that
//! still arrives no longer matches the slot and is discarded.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{Interval, MissedTickBehavior, interval};
use tracing::{debug, info, instrument, trace, warn};

use crate::analysis::AnalysisEndpoint;
use crate::config::CaptureConfig;
use crate::error::AnalysisError;
use crate::frames::FrameSource;
use crate::reading::{AnalysisResult, PatientId, ReadingSource, ScoredReading};

/// Timing and failure policy for the scheduler
#[derive(Debug, Clone)]
pub struct CaptureSettings {
    pub interval: Duration,
    pub request_timeout: Duration,
    pub degraded_after: u32,
}

impl From<&CaptureConfig> for CaptureSettings {
    fn from(config: &CaptureConfig) -> Self {
        Self {
            interval: config.interval().max(Duration::from_millis(1)),
            request_timeout: config.request_timeout(),
            degraded_after: config.degraded_after.max(1),
        }
    }
}

impl Default for CaptureSettings {
    fn default() -> Self {
        Self::from(&CaptureConfig::default())
    }
}

/// Observable state of a scheduler
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CaptureHealth {
    /// Started and the active condition holds
    pub running: bool,

    /// Raised after `degraded_after` consecutive failures, cleared on success
    pub degraded: bool,

    pub consecutive_failures: u32,

    /// Requests submitted
    pub requests: u64,

    /// Ticks dropped because a request was still in flight
    pub skipped_ticks: u64,

    /// Failed requests
    pub failures: u64,
}

/// Commands that can be sent to the scheduler
#[derive(Debug)]
enum CaptureCommand {
    Start { respond_to: oneshot::Sender<()> },
    Stop { respond_to: oneshot::Sender<()> },
    Shutdown,
}

/// Result of one request, tagged with the generation that issued it
struct Outcome {
    generation: u64,
    captured_at: DateTime<Utc>,
    result: Result<AnalysisResult, AnalysisError>,
}

/// The single capture slot
struct InFlight {
    generation: u64,
    task: JoinHandle<()>,
}

/// Actor driving the capture cadence for one patient
pub struct FrameCaptureScheduler {
    patient: PatientId,
    settings: CaptureSettings,
    endpoint: Arc<dyn AnalysisEndpoint>,
    source: Box<dyn FrameSource>,

    command_rx: mpsc::Receiver<CaptureCommand>,

    /// Externally supplied "active" condition
    active_rx: watch::Receiver<bool>,
    active: bool,
    active_closed: bool,

    reading_tx: mpsc::UnboundedSender<ScoredReading>,
    health_tx: watch::Sender<CaptureHealth>,
    health: CaptureHealth,

    outcome_tx: mpsc::UnboundedSender<Outcome>,
    outcome_rx: mpsc::UnboundedReceiver<Outcome>,

    slot: Option<InFlight>,
    generation: u64,
    started: bool,
}

impl FrameCaptureScheduler {
    fn new(
        patient: PatientId,
        settings: CaptureSettings,
        endpoint: Arc<dyn AnalysisEndpoint>,
        source: Box<dyn FrameSource>,
        command_rx: mpsc::Receiver<CaptureCommand>,
        mut active_rx: watch::Receiver<bool>,
        reading_tx: mpsc::UnboundedSender<ScoredReading>,
        health_tx: watch::Sender<CaptureHealth>,
    ) -> Self {
        let (outcome_tx, outcome_rx) = mpsc::unbounded_channel();
        let active = *active_rx.borrow_and_update();

        Self {
            patient,
            settings,
            endpoint,
            source,
            command_rx,
            active_rx,
            active,
            active_closed: false,
            reading_tx,
            health_tx,
            health: CaptureHealth::default(),
            outcome_tx,
            outcome_rx,
            slot: None,
            generation: 0,
            started: false,
        }
    }

    fn is_running(&self) -> bool {
        self.started && self.active
    }

    fn new_ticker(&self) -> Interval {
        let period = self.settings.interval.max(Duration::from_millis(1));
        let mut ticker = interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        ticker
    }

    /// Run the actor's main loop until Shutdown or until the handle is dropped
    #[instrument(skip(self), fields(patient = %self.patient))]
    async fn run(mut self) {
        debug!("starting capture scheduler");

        let mut ticker = self.new_ticker();

        loop {
            let running = self.is_running();

            tokio::select! {
                _ = ticker.tick(), if running => {
                    self.on_tick().await;
                }

                Some(outcome) = self.outcome_rx.recv() => {
                    self.on_outcome(outcome);
                }

                changed = self.active_rx.changed(), if !self.active_closed => {
                    if changed.is_err() {
                        debug!("active condition dropped, pausing capture");
                        self.active_closed = true;
                        self.active = false;
                    } else {
                        self.active = *self.active_rx.borrow_and_update();
                        trace!("active condition changed to {}", self.active);
                    }
                    self.apply_transition(running, &mut ticker);
                }

                cmd = self.command_rx.recv() => {
                    match cmd {
                        Some(CaptureCommand::Start { respond_to }) => {
                            debug!("received Start command");
                            self.started = true;
                            self.apply_transition(running, &mut ticker);
                            let _ = respond_to.send(());
                        }

                        Some(CaptureCommand::Stop { respond_to }) => {
                            debug!("received Stop command");
                            self.started = false;
                            self.apply_transition(running, &mut ticker);
                            let _ = respond_to.send(());
                        }

                        Some(CaptureCommand::Shutdown) => {
                            debug!("received shutdown command");
                            break;
                        }

                        None => {
                            debug!("command channel closed, shutting down");
                            break;
                        }
                    }
                }
            }
        }

        self.cancel_in_flight();
        self.health.running = false;
        self.publish_health();

        debug!("capture scheduler stopped");
    }

    /// React to a change of `is_running()` since the start of the iteration
    fn apply_transition(&mut self, was_running: bool, ticker: &mut Interval) {
        let running = self.is_running();

        if running && !was_running {
            debug!("capture running every {:?}", self.settings.interval);
            // Fresh interval so the first tick fires immediately
            *ticker = self.new_ticker();
        } else if !running && was_running {
            debug!("capture paused");
            self.cancel_in_flight();
        }

        if self.health.running != running {
            self.health.running = running;
            self.publish_health();
        }
    }

    async fn on_tick(&mut self) {
        if self.slot.is_some() {
            self.health.skipped_ticks += 1;
            trace!("previous analysis still in flight, skipping tick");
            self.publish_health();
            return;
        }

        let Some(frame) = self.source.next_frame().await else {
            trace!("no frame available, skipping tick");
            return;
        };

        self.generation += 1;
        let generation = self.generation;
        let captured_at = frame.captured_at;

        let endpoint = self.endpoint.clone();
        let outcome_tx = self.outcome_tx.clone();
        let patient = self.patient;
        let timeout = self.settings.request_timeout;

        let task = tokio::spawn(async move {
            let result = match tokio::time::timeout(timeout, endpoint.analyze(frame, patient)).await
            {
                Ok(result) => result,
                Err(_) => Err(AnalysisError::Timeout),
            };

            // Receiver gone means the scheduler has shut down
            let _ = outcome_tx.send(Outcome {
                generation,
                captured_at,
                result,
            });
        });

        trace!("submitted frame (generation {generation})");

        self.slot = Some(InFlight { generation, task });
        self.health.requests += 1;
        self.publish_health();
    }

    fn on_outcome(&mut self, outcome: Outcome) {
        let current = self.slot.as_ref().map(|slot| slot.generation);
        if current != Some(outcome.generation) {
            trace!(
                "discarding stale analysis response (generation {})",
                outcome.generation
            );
            return;
        }

        self.slot = None;

        // Backend timestamp wins, otherwise the frame's capture time
        let captured_at = outcome.captured_at;
        let reading = outcome.result.and_then(|result| {
            ScoredReading::from_analysis(result, ReadingSource::Capture, captured_at)
                .map_err(AnalysisError::from)
        });

        match reading {
            Ok(reading) => {
                if self.health.degraded {
                    info!("analysis recovered");
                }
                self.health.consecutive_failures = 0;
                self.health.degraded = false;

                if self.reading_tx.send(reading).is_err() {
                    trace!("no receiver for capture reading");
                }
            }

            Err(e) => {
                self.health.failures += 1;
                self.health.consecutive_failures += 1;
                debug!("analysis failed: {e}");

                if !self.health.degraded
                    && self.health.consecutive_failures >= self.settings.degraded_after
                {
                    self.health.degraded = true;
                    warn!(
                        "analysis degraded after {} consecutive failures",
                        self.health.consecutive_failures
                    );
                }
            }
        }

        self.publish_health();
    }

    fn cancel_in_flight(&mut self) {
        if let Some(in_flight) = self.slot.take() {
            trace!("aborting in-flight request (generation {})", in_flight.generation);
            in_flight.task.abort();
        }
    }

    fn publish_health(&self) {
        self.health_tx.send_replace(self.health.clone());
    }
}

/// Handle for controlling a FrameCaptureScheduler
#[derive(Clone)]
pub struct CaptureHandle {
    sender: mpsc::Sender<CaptureCommand>,
    health_rx: watch::Receiver<CaptureHealth>,
}

impl CaptureHandle {
    /// Spawn a scheduler. It stays idle until [`CaptureHandle::start`].
    pub fn spawn(
        patient: PatientId,
        settings: CaptureSettings,
        endpoint: Arc<dyn AnalysisEndpoint>,
        source: Box<dyn FrameSource>,
        active_rx: watch::Receiver<bool>,
        reading_tx: mpsc::UnboundedSender<ScoredReading>,
    ) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::channel(32);
        let (health_tx, health_rx) = watch::channel(CaptureHealth::default());

        let actor = FrameCaptureScheduler::new(
            patient, settings, endpoint, source, cmd_rx, active_rx, reading_tx, health_tx,
        );

        tokio::spawn(actor.run());

        Self {
            sender: cmd_tx,
            health_rx,
        }
    }

    /// Begin the cadence. Ticks only fire while the active condition holds.
    pub async fn start(&self) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(CaptureCommand::Start { respond_to: tx })
            .await
            .context("failed to send Start command")?;
        rx.await.context("failed to receive Start acknowledgement")
    }

    /// Cancel the timer and abort any in-flight request
    ///
    /// Returns once the scheduler has applied the stop.
    pub async fn stop(&self) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(CaptureCommand::Stop { respond_to: tx })
            .await
            .context("failed to send Stop command")?;
        rx.await.context("failed to receive Stop acknowledgement")
    }

    /// Stop and end the actor task
    pub async fn shutdown(&self) -> Result<()> {
        self.sender
            .send(CaptureCommand::Shutdown)
            .await
            .context("failed to send Shutdown command")?;
        Ok(())
    }

    pub fn health(&self) -> CaptureHealth {
        self.health_rx.borrow().clone()
    }

    pub fn watch_health(&self) -> watch::Receiver<CaptureHealth> {
        self.health_rx.clone()
    }
}
