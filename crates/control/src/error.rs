use thiserror::Error;

/// Errors surfaced by the control core.
#[derive(Debug, Error)]
pub enum Error {
    /// A PWM request mapped outside the actuator's duty range.
    #[error("duty {requested} outside valid range 0..={max}")]
    DutyOutOfRange { requested: i64, max: u16 },

    /// A single sensor sample could not be taken.
    #[error("sensor read failed: {0}")]
    SensorRead(String),

    /// A sensor probe never appeared during startup discovery.
    #[error("no sensor probe found after {attempts} attempts")]
    ProbeNotFound { attempts: u32 },

    /// Any other failure reported by a hardware backend.
    #[error("hardware error: {0}")]
    Hardware(String),

    /// The telemetry sink refused a connect or publish.
    #[error("telemetry sink error: {0}")]
    Sink(String),

    /// A configured UTC offset is out of range.
    #[error("invalid clock offset: {0}")]
    ClockOffset(#[from] time::error::ComponentRange),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
