use thiserror::Error;

#[derive(Error, Debug)]
pub enum NetworkError {
    #[error("Unknown peer: {0}")]
    UnknownPeer(String),

    #[error("Peer {0} is unreachable")]
    Unreachable(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Codec error: {0}")]
    Codec(String),

    #[error("Frame of {size} bytes exceeds the {max} byte limit")]
    FrameTooLarge { size: usize, max: usize },

    #[error("Timeout error")]
    Timeout,

    #[error("Remote error: {0}")]
    Remote(String),

    #[error("Unexpected response: {0}")]
    UnexpectedResponse(String),

    #[error("Connection closed")]
    ConnectionClosed,
}
