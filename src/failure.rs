use std::fmt;

/// Failure classes shared by the request executor and the stream connection.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum FailureKind {
    /// Transport-level failure, no response was received.
    Network,
    /// A response arrived with a non-success status.
    HttpStatus,
    /// The response body could not be decoded.
    Parse,
    /// No bearer credential was available before opening a stream.
    MissingCredential,
    /// Automatic stream recovery gave up.
    ReconnectExhausted,
    /// Client configuration was rejected before any I/O happened.
    Config,
}

impl FailureKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Network => "network",
            Self::HttpStatus => "http_status",
            Self::Parse => "parse",
            Self::MissingCredential => "missing_credential",
            Self::ReconnectExhausted => "reconnect_exhausted",
            Self::Config => "config",
        }
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
