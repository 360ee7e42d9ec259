pub mod alerts;
pub mod analysis;
pub mod capture;
pub mod channel;
pub mod config;
pub mod error;
pub mod frames;
pub mod history;
pub mod protocol;
pub mod reading;
pub mod session;

pub use alerts::{AlertAggregator, AlertId, AlertPolicy, AlertRecord, Severity};
pub use analysis::{AnalysisEndpoint, HttpAnalysisClient};
pub use capture::{CaptureHandle, CaptureHealth, CaptureSettings};
pub use channel::{
    Backoff, ChannelHandle, ChannelSettings, ConnectionState, Connector, Subscription, Transport,
    WsConnector,
};
pub use config::Config;
pub use error::AnalysisError;
pub use frames::{DirectoryFrameSource, Frame, FrameSource};
pub use history::TelemetryHistoryBuffer;
pub use protocol::ChannelMessage;
pub use reading::{AnalysisResult, PainLevel, PatientId, ReadingSource, ScoredReading};
pub use session::{MonitorView, MonitoringSession, PatientMonitor, SessionDeps, SessionView};
