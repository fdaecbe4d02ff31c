use thiserror::Error;

#[derive(Debug, Error)]
pub enum JobError {
    #[error("failed to listen on job socket `{path}`: {source}")]
    SocketListen {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to spawn transcoder process: {0}")]
    Spawn(#[from] std::io::Error),

    #[error("malformed progress line `{line}`")]
    ParseProgress { line: String },
}
