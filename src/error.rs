use std::io;

use thiserror::Error;

/// Transport-layer error types
#[derive(Error, Debug)]
pub enum Error {
    #[error("configuration error: {message}")]
    Config {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    #[error("network error: {message}")]
    Network {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    #[error("DNS error: {message}")]
    Dns {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    #[error("parse error: {message}")]
    Parse {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    #[error("timeout: {message}")]
    Timeout { message: String },

    #[error("proxy error: {message}")]
    Proxy { message: String },

    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// The bind (or its underlying connection) has been closed. Also the
    /// outcome of closing an already-closed bind, so callers can detect
    /// double-teardown bugs.
    #[error("bind closed")]
    Closed,

    #[error("bind already open")]
    AlreadyOpen,

    #[error("address family not supported")]
    AfNotSupported,
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Create a new configuration error
    pub fn config<S: Into<String>>(message: S) -> Self {
        Self::Config {
            message: message.into(),
            source: None,
        }
    }

    /// Create a new configuration error with source
    pub fn config_with_source<S: Into<String>, E: std::error::Error + Send + Sync + 'static>(
        message: S,
        source: E,
    ) -> Self {
        Self::Config {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Create a new network error
    pub fn network<S: Into<String>>(message: S) -> Self {
        Self::Network {
            message: message.into(),
            source: None,
        }
    }

    /// Create a new network error with source
    pub fn network_with_source<S: Into<String>, E: std::error::Error + Send + Sync + 'static>(
        message: S,
        source: E,
    ) -> Self {
        Self::Network {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Create a new DNS error
    pub fn dns<S: Into<String>>(message: S) -> Self {
        Self::Dns {
            message: message.into(),
            source: None,
        }
    }

    /// Create a new DNS error with source
    pub fn dns_with_source<S: Into<String>, E: std::error::Error + Send + Sync + 'static>(
        message: S,
        source: E,
    ) -> Self {
        Self::Dns {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Create a new parse error
    pub fn parse<S: Into<String>>(message: S) -> Self {
        Self::Parse {
            message: message.into(),
            source: None,
        }
    }

    /// Create a new parse error with source
    pub fn parse_with_source<S: Into<String>, E: std::error::Error + Send + Sync + 'static>(
        message: S,
        source: E,
    ) -> Self {
        Self::Parse {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Create a new timeout error
    pub fn timeout<S: Into<String>>(message: S) -> Self {
        Self::Timeout {
            message: message.into(),
        }
    }

    /// Create a new proxy error
    pub fn proxy<S: Into<String>>(message: S) -> Self {
        Self::Proxy {
            message: message.into(),
        }
    }

    fn io_source(&self) -> Option<&io::Error> {
        match self {
            Self::Io(e) => Some(e),
            Self::Config { source, .. }
            | Self::Network { source, .. }
            | Self::Dns { source, .. }
            | Self::Parse { source, .. } => source
                .as_ref()
                .and_then(|s| s.downcast_ref::<io::Error>()),
            _ => None,
        }
    }

    /// Whether this error indicates a timed-out operation
    pub fn is_timeout(&self) -> bool {
        match self {
            Self::Timeout { .. } => true,
            _ => self
                .io_source()
                .map(|e| e.kind() == io::ErrorKind::TimedOut)
                .unwrap_or(false),
        }
    }

    /// Whether the underlying cause is an unreachable network. The relayed
    /// bind backs off on this instead of redialing in a tight loop.
    pub fn is_network_unreachable(&self) -> bool {
        self.io_source()
            .map(|e| e.kind() == io::ErrorKind::NetworkUnreachable)
            .unwrap_or(false)
    }

    /// Check if this is a recoverable error
    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::Network { .. } | Self::Timeout { .. } | Self::Io(_) => true,
            Self::Config { .. } | Self::Parse { .. } | Self::AlreadyOpen | Self::Closed => false,
            _ => true,
        }
    }
}
