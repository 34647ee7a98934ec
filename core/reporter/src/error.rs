use ide_mocha_protocol::{AddressError, Endpoint};

#[derive(Debug, thiserror::Error)]
pub enum ReporterError {
    #[error(transparent)]
    Address(#[from] AddressError),

    #[error("Failed to resolve working directory: {0}")]
    CurrentDir(#[source] std::io::Error),

    #[error("Failed to connect to hub at {endpoint}: {source}")]
    Connect {
        endpoint: Endpoint,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to read test events: {0}")]
    Read(#[source] std::io::Error),

    #[error("Failed to forward event to hub: {0}")]
    Write(#[source] std::io::Error),

    #[error("Failed to encode event: {0}")]
    Encode(#[from] serde_json::Error),
}
