use std::fmt;

/// Externally visible lifecycle of a session, tracked independently per endpoint.
///
/// A session is created `Disconnected`, moves to `Connecting` on an attempt and to
/// `Connected` or `Failed` with its outcome. `Failed` is never terminal: the owner retries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Failed,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Failed => "failed",
        };
        f.write_str(s)
    }
}
