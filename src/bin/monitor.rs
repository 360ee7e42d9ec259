//! Headless patient monitor
//!
//! Runs one monitoring session against the backend and logs the derived view
//! whenever it changes.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use neoguard::{
    Config, DirectoryFrameSource, HttpAnalysisClient, MonitorView, PatientId, PatientMonitor,
    SessionView, WsConnector,
};
use tracing::{debug, info, level_filters::LevelFilter, trace, warn};
use tracing_subscriber::{filter, layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "neoguard-monitor")]
#[command(about = "Real-time pain monitoring client for one NICU patient", long_about = None)]
struct Args {
    /// Patient to monitor
    #[arg(short, long)]
    patient: PatientId,

    /// Configuration file path
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Backend API URL (overrides config file and environment)
    #[arg(short, long, value_name = "URL")]
    url: Option<String>,

    /// Directory of JPEG/PNG frames to submit in a loop
    #[arg(short, long, value_name = "DIR")]
    frames: PathBuf,

    /// Log at trace level
    #[arg(short, long)]
    verbose: bool,
}

fn init(verbose: bool) {
    let level = if verbose {
        LevelFilter::TRACE
    } else {
        LevelFilter::INFO
    };

    let filter = filter::Targets::new().with_targets(vec![
        ("neoguard", level),
        ("neoguard_monitor", level),
        ("monitor", level),
    ]);
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .compact()
                .with_ansi(false),
        )
        .with(filter)
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();

    let args = Args::parse();
    init(args.verbose);
    trace!("started with args: {args:?}");

    let config = Config::load(args.config.as_deref())?.with_env_overrides();

    // Override with CLI args if provided
    let config = Config {
        api_url: args.url.unwrap_or(config.api_url),
        ..config
    };
    debug!("using backend {}", config.api_url);

    let source = DirectoryFrameSource::open(&args.frames)?;
    info!("loaded {} frames from {}", source.len(), args.frames.display());

    let endpoint = HttpAnalysisClient::new(&config.api_url, config.capture.request_timeout())?;

    let mut monitor = PatientMonitor::new(config, Arc::new(WsConnector::new()), Arc::new(endpoint));
    monitor
        .select_patient(args.patient, Box::new(source))
        .await
        .with_context(|| format!("Failed to start monitoring patient {}", args.patient))?;

    let Some(session) = monitor.session() else {
        anyhow::bail!("no session after selecting patient {}", args.patient);
    };
    let mut views = session.watch_view();

    loop {
        tokio::select! {
            changed = views.changed() => {
                if changed.is_err() {
                    warn!("session ended unexpectedly");
                    break;
                }
                let view = views.borrow_and_update().clone();
                log_view(&view);
            }

            signal = tokio::signal::ctrl_c() => {
                if let Err(e) = signal {
                    warn!("failed to listen for Ctrl-C: {e}");
                }
                info!("shutting down");
                break;
            }
        }
    }

    monitor.clear_selection().await;

    if let MonitorView::NoPatientSelected = monitor.view() {
        debug!("monitor idle");
    }

    Ok(())
}

fn log_view(view: &SessionView) {
    match &view.latest_reading {
        Some(reading) => info!(
            "patient {} [{}] score {:.1} ({}) face={} cry={} history={} alerts={}{}",
            view.patient,
            view.connection_state,
            reading.composite_score,
            reading.pain_level().label(),
            reading.face_detected,
            reading.cry_type,
            view.history.len(),
            view.active_alerts.len(),
            if view.analysis_degraded { " DEGRADED" } else { "" },
        ),
        None => info!(
            "patient {} [{}] waiting for readings{}",
            view.patient,
            view.connection_state,
            if view.analysis_degraded { " DEGRADED" } else { "" },
        ),
    }
}
