use thiserror::Error;

#[derive(Error, Debug)]
pub enum GridError {
    #[error("No compute capacity available ({strategy}): {reason}")]
    NoCapacityAvailable { strategy: String, reason: String },

    #[error("Batch not found: {0}")]
    BatchNotFound(uuid::Uuid),

    #[error("Node not found: {0}")]
    NodeNotFound(String),

    #[error("Node already registered: {0}")]
    DuplicateNode(String),

    #[error("Probe failed for node {node_id}: {reason}")]
    ProbeFailed { node_id: String, reason: String },

    #[error("Dispatch rejected by node {node_id}: {reason}")]
    DispatchRejected { node_id: String, reason: String },

    #[error("Stream input channel closed")]
    ChannelClosed,

    #[error("Internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, GridError>;
