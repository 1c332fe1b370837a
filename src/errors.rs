use super::{
    codec::CapturedFailure,
    model::{ChannelId, ContextId, WorkerId},
};
use thiserror::Error;


pub type TaskResult<T> = Result<T, PoolError>;

/// Ошибки пула, привязанные к конкретной задаче или к конструированию пула
#[derive(Debug, Clone, PartialEq, Error)]
pub enum PoolError {
    #[error("invalid configuration: {0}")]
    Configuration(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    /// Контекст воркера сломан навсегда, повторного создания нет
    #[error("pool broken on {worker}: {reason}")]
    Broken { worker: WorkerId, reason: String },

    #[error("pool is closed")]
    Closed,

    #[error("task failed: {0}")]
    Failed(CapturedFailure),

    #[error("task cancelled before start")]
    Cancelled,

    #[error("timed out waiting for task result")]
    Timeout,

    #[error("worker dropped the task without a result")]
    Abandoned,
}

impl PoolError {
    #[inline]
    pub fn is_broken(&self) -> bool {
        matches!(self, PoolError::Broken { .. })
    }

    /// Захваченная ошибка пользовательского кода, если она есть
    pub fn failure(&self) -> Option<&CapturedFailure> {
        match self {
            PoolError::Failed(failure) => Some(failure),
            _ => None,
        }
    }
}


/// Ошибки процессного рантайма изолированных контекстов
#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("context {0} not found")]
    ContextNotFound(ContextId),

    #[error("channel {0} not found")]
    ChannelNotFound(ChannelId),

    #[error("context {0} is still running")]
    ContextRunning(ContextId),

    #[error("context {0} is gone")]
    ContextGone(ContextId),

    #[error("failed to spawn context thread: {0}")]
    Spawn(#[from] std::io::Error),
}


/// Ошибки транспортного кодека
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("failed to encode payload: {0}")]
    Encode(#[from] bincode::error::EncodeError),

    #[error("failed to decode payload: {0}")]
    Decode(#[from] bincode::error::DecodeError),

    #[error("{0} trailing bytes after payload")]
    TrailingBytes(usize),
}

impl From<CodecError> for PoolError {
    fn from(err: CodecError) -> Self {
        PoolError::Serialization(err.to_string())
    }
}
