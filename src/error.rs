// Typed errors for each collaborator seam

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("{endpoint} returned status {status}")]
    Status {
        endpoint: &'static str,
        status: reqwest::StatusCode,
    },

    #[error("error decoding wireguard peers: {0}")]
    Decode(#[from] serde_json::Error),
}

#[derive(Debug, Error)]
pub enum CommandError {
    #[error("failed to run {command}: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{command} exited with {status}: {stderr}")]
    Failed {
        command: String,
        status: String,
        stderr: String,
    },
}

#[derive(Debug, Error)]
pub enum DeviceError {
    #[error(transparent)]
    Command(#[from] CommandError),

    #[error("unexpected output from wg on {interface}: {line}")]
    Parse { interface: String, line: String },
}

#[derive(Debug, Error)]
pub enum FirewallError {
    #[error(transparent)]
    Command(#[from] CommandError),

    #[error("chain {chain} not found in {table}")]
    MissingChain { chain: String, table: &'static str },
}

#[derive(Debug, Error)]
pub enum SubscribeError {
    #[error("invalid message-queue url: {0}")]
    Url(String),

    #[error("websocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
}

#[derive(Debug, Error)]
pub enum SampleError {
    #[error("no physical network interface found")]
    NoInterface,

    #[error("interface {interface} not observed within {timeout_ms} ms")]
    Timeout { interface: String, timeout_ms: u64 },

    #[error("sampler task join: {0}")]
    Join(#[from] tokio::task::JoinError),
}
