use gefyra_operator_k8s_api::pod::ExecError;
use std::time::Duration;

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Delay before a transient failure is retried when it names none.
pub const DEFAULT_RETRY: Duration = Duration::from_secs(5);

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The current state has no edge for the requested transition.
    #[error("transition {transition} is not allowed from {from}")]
    InvalidTransition {
        transition: &'static str,
        from: &'static str,
    },

    /// A condition that is expected to resolve on its own.
    #[error("{message}")]
    Temporary { message: String, delay: Duration },

    /// A failure that retrying the same step will not fix.
    #[error("{0}")]
    Permanent(String),

    #[error("conflicting update: {0}")]
    Conflict(#[source] kube::Error),

    #[error("kubernetes API error: {0}")]
    Kube(#[source] kube::Error),

    #[error(transparent)]
    Exec(#[from] ExecError),

    #[error("invalid JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid YAML: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

// === impl Error ===

impl Error {
    pub fn temporary(message: impl Into<String>) -> Self {
        Self::Temporary {
            message: message.into(),
            delay: DEFAULT_RETRY,
        }
    }

    pub fn temporary_after(message: impl Into<String>, delay: Duration) -> Self {
        Self::Temporary {
            message: message.into(),
            delay,
        }
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        Self::Permanent(message.into())
    }

    /// Transient errors are retried without changing state.
    pub fn is_transient(&self) -> bool {
        !matches!(
            self,
            Self::Permanent(_) | Self::InvalidTransition { .. } | Self::Json(_) | Self::Yaml(_)
        )
    }

    pub fn retry_after(&self) -> Duration {
        match self {
            Self::Temporary { delay, .. } => *delay,
            _ => DEFAULT_RETRY,
        }
    }

    /// Whether the error is an API response with the given status code.
    pub fn is_api_status(&self, code: u16) -> bool {
        match self {
            Self::Kube(kube::Error::Api(rsp)) | Self::Conflict(kube::Error::Api(rsp)) => {
                rsp.code == code
            }
            _ => false,
        }
    }

    pub fn is_not_found(&self) -> bool {
        self.is_api_status(404)
    }
}

impl From<kube::Error> for Error {
    fn from(error: kube::Error) -> Self {
        match &error {
            kube::Error::Api(rsp) if rsp.code == 409 => Self::Conflict(error),
            _ => Self::Kube(error),
        }
    }
}
