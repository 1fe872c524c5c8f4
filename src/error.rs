pub type Result<T, E = BackendError> = std::result::Result<T, E>;

pub(crate) type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    /// Missing or invalid backend arguments. Fatal at construction time.
    #[error("invalid backend configuration: {0}")]
    Configuration(String),

    /// The client factory could not produce a handle for the calling thread.
    #[error("could not connect to {endpoints:?}")]
    Connection {
        endpoints: Vec<String>,
        #[source]
        source: BoxError,
    },

    /// An operation failed on an already established handle.
    #[error("remote operation failed")]
    Remote(#[source] BoxError),

    #[error("value serialization failed: {0}")]
    Serialization(String),
}

impl BackendError {
    pub fn configuration(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }

    pub fn remote<E>(err: E) -> Self
    where
        E: Into<BoxError>,
    {
        Self::Remote(err.into())
    }

    #[must_use]
    pub fn is_connection(&self) -> bool {
        matches!(self, Self::Connection { .. })
    }
}
