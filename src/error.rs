use thiserror::Error;

/// Errors raised while recording or reading execution traces.
///
/// `Protocol` and `Classification` are fatal by nature: the event stream and
/// the recorder disagree, or the automation suite is mis-tagged. Callers are
/// expected to abort the current keyword when they see one.
#[derive(Debug, Error)]
pub enum TraceError {
    /// The execution stack was used in a way the event stream should never
    /// produce (empty stack, wrong step variant at the top, ...).
    #[error("protocol violation: {0}")]
    Protocol(String),

    /// A keyword could not be classified (for example tagged both `task` and
    /// `action`) or an unknown action kind was requested.
    #[error("classification error: {0}")]
    Classification(String),

    #[error("step with id {0} not found")]
    StepNotFound(u64),

    /// The driven surface (browser, desktop) failed to answer.
    #[error("surface error: {0}")]
    Surface(String),

    /// The inference service was unreachable or answered garbage.
    #[error("inference error: {0}")]
    Inference(String),

    #[error("parse error: {0}")]
    Parse(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("binary encoding error: {0}")]
    Binary(#[from] postcard::Error),
}

impl TraceError {
    pub(crate) fn protocol(message: impl Into<String>) -> Self {
        Self::Protocol(message.into())
    }
}

pub type Result<T> = std::result::Result<T, TraceError>;
