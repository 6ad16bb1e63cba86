use async_trait::async_trait;
use std::future::Future;
use std::marker::PhantomData;

use super::transport::LeasedMessage;
use crate::storage::ResourceError;

#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, message: &LeasedMessage) -> Result<(), HandlerError>;
}

/// Any failure raised by a handler. The message is left on the queue and is
/// redelivered once its lease expires.
#[derive(Debug, thiserror::Error)]
pub enum HandlerError {
    #[error("Invalid message payload: {0}")]
    InvalidPayload(String),

    #[error("Storage operation failed: {0}")]
    Storage(#[from] ResourceError),

    #[error("Handler failed: {0}")]
    Failed(String),

    #[error("Handler panicked: {0}")]
    Panicked(String),
}

impl HandlerError {
    pub fn error_type(&self) -> &'static str {
        match self {
            Self::InvalidPayload(_) => "invalid_payload",
            Self::Storage(ResourceError::RetryExhausted { .. }) => "retry_exhausted",
            Self::Storage(_) => "storage",
            Self::Failed(_) => "failed",
            Self::Panicked(_) => "panicked",
        }
    }
}

/// Adapts an async closure over an owned message into a [`MessageHandler`].
pub struct FnHandler<F, Fut> {
    f: F,
    _marker: PhantomData<fn() -> Fut>,
}

pub fn handler_fn<F, Fut>(f: F) -> FnHandler<F, Fut>
where
    F: Fn(LeasedMessage) -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), HandlerError>> + Send,
{
    FnHandler {
        f,
        _marker: PhantomData,
    }
}

#[async_trait]
impl<F, Fut> MessageHandler for FnHandler<F, Fut>
where
    F: Fn(LeasedMessage) -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), HandlerError>> + Send,
{
    async fn handle(&self, message: &LeasedMessage) -> Result<(), HandlerError> {
        (self.f)(message.clone()).await
    }
}
