use super::{
    errors::{PoolError, TaskResult},
    value::Value,
};
use std::{
    future::Future,
    pin::Pin,
    task::{Context, Poll}
};
use tokio::{
    sync::oneshot,
    sync::oneshot::error::TryRecvError,
    time::Duration,
};
use tokio_util::sync::CancellationToken;


/// Handle на задачу в изолированном контексте, с отменой до старта и timeout.
///
/// Timeout лишь прекращает ожидание: контекст не умеет прерывать задачу,
/// она доработает до конца.
pub struct TaskHandle {
    id: u64,
    cancel_token: CancellationToken,
    receiver: oneshot::Receiver<TaskResult<Value>>,
}

impl TaskHandle {

    pub(crate) fn new
    (
        id: u64,
        cancel_token: CancellationToken,
        receiver: oneshot::Receiver<TaskResult<Value>>,
    ) -> Self {
        Self {
            id,
            cancel_token,
            receiver
        }
    }

    #[inline]
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Отменяет задачу, если воркер ещё не взял её в работу
    #[inline]
    pub fn cancel(&self) {
        self.cancel_token.cancel();
    }

    #[inline]
    pub fn is_cancelled(&self) -> bool {
        self.cancel_token.is_cancelled()
    }

    /// Блокирующее ожидание результата.
    ///
    /// Нельзя вызывать изнутри async-контекста tokio: там используйте `.await`.
    pub fn wait(self) -> TaskResult<Value> {
        self.receiver.blocking_recv().unwrap_or(Err(PoolError::Abandoned))
    }

    /// Неблокирующая проверка готовности
    pub fn try_result(&mut self) -> Option<TaskResult<Value>> {
        match self.receiver.try_recv() {
            Ok(result) => Some(result),
            Err(TryRecvError::Empty) => None,
            Err(TryRecvError::Closed) => Some(Err(PoolError::Abandoned)),
        }
    }

    pub async fn await_timeout(self, timeout: Duration) -> TaskResult<Value> {
        match tokio::time::timeout(timeout, self.receiver).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(PoolError::Abandoned),
            Err(_) => Err(PoolError::Timeout),
        }
    }
}

impl Future for TaskHandle {
    type Output = TaskResult<Value>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        match Pin::new(&mut this.receiver).poll(cx) {
            Poll::Ready(res) => Poll::Ready(res.unwrap_or(Err(PoolError::Abandoned))),
            Poll::Pending => Poll::Pending,
        }
    }
}
