use std::fmt;
use std::time::Duration;

/// Events emitted while evaluating admission.
///
/// Client ids are carried as given; sinks that export events off-host should hash or drop
/// them if they are sensitive (e.g. raw IP addresses).
#[derive(Debug, Clone, PartialEq)]
pub enum LimiterEvent {
    /// A request consumed a token.
    Admitted {
        client_id: String,
        /// Tokens left after this request.
        remaining: f64,
    },
    /// A request found less than one token.
    Denied {
        client_id: String,
        /// Estimated wait until a token is available.
        retry_after: Duration,
    },
    /// The atomic update committed, but only after losing one or more races.
    Contended {
        client_id: String,
        /// Attempts used, including the successful one.
        attempts: usize,
    },
    /// The store could not complete the update; the caller decides fail-open or fail-closed.
    StoreFailure {
        client_id: String,
        error: String,
    },
}

impl LimiterEvent {
    /// Stable short name, suitable as a metric label.
    pub fn kind(&self) -> &'static str {
        match self {
            LimiterEvent::Admitted { .. } => "admitted",
            LimiterEvent::Denied { .. } => "denied",
            LimiterEvent::Contended { .. } => "contended",
            LimiterEvent::StoreFailure { .. } => "store_failure",
        }
    }

    pub fn client_id(&self) -> &str {
        match self {
            LimiterEvent::Admitted { client_id, .. }
            | LimiterEvent::Denied { client_id, .. }
            | LimiterEvent::Contended { client_id, .. }
            | LimiterEvent::StoreFailure { client_id, .. } => client_id,
        }
    }
}

impl fmt::Display for LimiterEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LimiterEvent::Admitted { client_id, remaining } => {
                write!(f, "Admitted(client={}, remaining={:.3})", client_id, remaining)
            }
            LimiterEvent::Denied { client_id, retry_after } => {
                write!(f, "Denied(client={}, retry_after={:?})", client_id, retry_after)
            }
            LimiterEvent::Contended { client_id, attempts } => {
                write!(f, "Contended(client={}, attempts={})", client_id, attempts)
            }
            LimiterEvent::StoreFailure { client_id, error } => {
                write!(f, "StoreFailure(client={}, error={})", client_id, error)
            }
        }
    }
}
