use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum CompressionError {
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("failed to create file {path}: {source}")]
    FileCreate {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to open file {path}: {source}")]
    FileOpen {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to rename {from} to {to}: {source}")]
    FileRename {
        from: PathBuf,
        to: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("collector error: {0}")]
    Collector(String),

    #[error("compression cancelled")]
    Cancelled,

    #[error("compression worker panicked")]
    WorkerPanicked,

    #[error("compress() was already called")]
    AlreadyCompressed,

    #[error("invariant violated: {0}")]
    Invariant(String),
}

#[derive(Error, Debug)]
pub enum DecompressionError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to open file {path}: {source}")]
    FileOpen {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("compressed file {path} is too short: {size} bytes")]
    FileTooShort { path: PathBuf, size: u64 },

    #[error("invalid format: {0}")]
    InvalidFormat(String),

    #[error("{tree} tree depth {depth} exceeds the maximum of {max}")]
    DepthExceeded {
        tree: &'static str,
        depth: u64,
        max: u64,
    },

    #[error("corrupt data at offset {offset}: {reason}")]
    Corrupt { offset: u64, reason: String },
}

pub type Result<T, E = CompressionError> = std::result::Result<T, E>;
