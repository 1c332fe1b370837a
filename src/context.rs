use super::{
    codec::{self, Outcome, Task},
    errors::{PoolError, TaskResult},
    model::{ChannelId, ContextId, ContextState, WorkerId},
    pool::Initializer,
    registry::Registry,
    runtime::{runtime, Script},
    value::Value,
};
use std::sync::{
    atomic::{AtomicU8, Ordering},
    Arc, OnceLock,
};
use tracing::{debug, error, warn};


/// Что сделал менеджер жизненного цикла с контекстом при shutdown
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Reclaim {
    Destroyed,
    Orphaned,
    AlreadyGone,
}

/// Привязка воркера к его изолированному контексту и выделенному каналу результатов.
///
/// Переходы состояния только через CAS: воркер (`Ready -> Executing`) и менеджер
/// (`Ready -> Destroyed`, `Executing -> Orphaned`) не могут выиграть оба.
#[derive(Debug)]
pub struct ContextHandle {
    worker: WorkerId,
    context: ContextId,
    channel: ChannelId,
    state: AtomicU8,
    broken: OnceLock<String>,
}

impl ContextHandle {
    /// Создаёт контекст и его канал; состояние `Initializing`
    pub(crate) fn create(worker: WorkerId) -> TaskResult<Self> {
        let rt = runtime();
        let context = rt.create().map_err(|err| PoolError::Broken {
            worker,
            reason: format!("failed to create context: {}", err),
        })?;
        let channel = rt.channel_create();
        debug!(%worker, %context, %channel, "context bound to worker");

        Ok(Self {
            worker,
            context,
            channel,
            state: AtomicU8::new(ContextState::Initializing as u8),
            broken: OnceLock::new(),
        })
    }

    #[inline]
    pub fn worker(&self) -> WorkerId {
        self.worker
    }

    #[inline]
    pub fn context_id(&self) -> ContextId {
        self.context
    }

    #[inline]
    pub fn channel_id(&self) -> ChannelId {
        self.channel
    }

    #[inline]
    pub fn state(&self) -> ContextState {
        ContextState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn broken_reason(&self) -> Option<&str> {
        self.broken.get().map(String::as_str)
    }

    #[inline]
    fn transition(&self, from: ContextState, to: ContextState) -> Result<(), ContextState> {
        self.state
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .map(|_| ())
            .map_err(ContextState::from_u8)
    }

    /// Протокол инициализации: bootstrap, затем пользовательский инициализатор.
    ///
    /// Ошибка ломает контекст навсегда.
    pub(crate) fn initialize(
        &self,
        registry: &Arc<Registry>,
        initializer: Option<&Initializer>,
    ) -> TaskResult<()> {
        let rt = runtime();
        rt.run(self.context, Script::Bootstrap { registry: registry.clone(), reply: self.channel })
            .and_then(|_| rt.channel_recv(self.channel, self.context))
            .map_err(|err| self.fail(ContextState::Initializing, format!("bootstrap failed: {}", err)))?;

        if let Some(init) = initializer {
            let payload = codec::encode(&init.as_task()).map_err(|err| {
                self.fail(ContextState::Initializing, format!("initializer arguments: {}", err))
            })?;
            let bytes = rt
                .run(self.context, Script::Initialize { payload, reply: self.channel })
                .and_then(|_| rt.channel_recv(self.channel, self.context))
                .map_err(|err| self.fail(ContextState::Initializing, format!("initializer injection failed: {}", err)))?;

            match codec::decode::<Outcome>(&bytes) {
                Ok(Outcome::Success(_)) => {}
                Ok(Outcome::Failure(failure)) => {
                    return Err(self.fail(ContextState::Initializing, format!("initializer failed: {}", failure)));
                }
                Ok(Outcome::Untransportable(reason)) => {
                    return Err(self.fail(ContextState::Initializing, format!("initializer result: {}", reason)));
                }
                Err(err) => {
                    return Err(self.fail(ContextState::Initializing, format!("initializer reply: {}", err)));
                }
            }
        }

        if self.settle(ContextState::Initializing) {
            debug!(worker = %self.worker, context = %self.context, "context ready");
            Ok(())
        } else {
            Err(PoolError::Closed)
        }
    }

    /// Протокол диспетчеризации одной задачи. Вызывается только потоком-владельцем.
    pub(crate) fn dispatch(&self, task: &Task) -> TaskResult<Value> {
        // сломанный воркер отвечает Broken раньше любой сериализации
        self.begin()?;
        let payload = match codec::encode(task) {
            Ok(payload) => payload,
            Err(err) => {
                // в контекст ничего не ушло, возвращаем его в Ready
                self.settle(ContextState::Executing);
                return Err(err.into());
            }
        };

        let rt = runtime();
        let reply = rt
            .run(self.context, Script::Execute { payload, reply: self.channel })
            .and_then(|_| rt.channel_recv(self.channel, self.context));
        let bytes = match reply {
            Ok(bytes) => bytes,
            Err(err) => {
                return Err(self.fail(ContextState::Executing, format!("context injection failed: {}", err)));
            }
        };
        self.settle(ContextState::Executing);

        match codec::decode::<Outcome>(&bytes)? {
            Outcome::Success(value) => Ok(value),
            Outcome::Failure(failure) => Err(PoolError::Failed(failure)),
            Outcome::Untransportable(reason) => Err(PoolError::Serialization(reason)),
        }
    }

    fn begin(&self) -> TaskResult<()> {
        match self.transition(ContextState::Ready, ContextState::Executing) {
            Ok(()) => Ok(()),
            Err(ContextState::Broken) => Err(self.broken_error()),
            Err(_) => Err(PoolError::Closed),
        }
    }

    /// Возвращает контекст в `Ready`. Если менеджер пометил его сиротой,
    /// выполняет отложенный teardown и возвращает `false`.
    fn settle(&self, from: ContextState) -> bool {
        match self.transition(from, ContextState::Ready) {
            Ok(()) => true,
            Err(ContextState::Orphaned) => {
                self.destroy_orphan();
                false
            }
            Err(other) => {
                warn!(context = %self.context, state = ?other, "unexpected context state");
                false
            }
        }
    }

    fn fail(&self, from: ContextState, reason: String) -> PoolError {
        error!(worker = %self.worker, context = %self.context, %reason, "context broken");
        let _ = self.broken.set(reason);
        if let Err(ContextState::Orphaned) = self.transition(from, ContextState::Broken) {
            self.destroy_orphan();
        }
        self.broken_error()
    }

    fn broken_error(&self) -> PoolError {
        PoolError::Broken {
            worker: self.worker,
            reason: format!(
                "{}: {}",
                self.context,
                self.broken_reason().unwrap_or("context is broken")
            ),
        }
    }

    fn destroy_orphan(&self) {
        if self.transition(ContextState::Orphaned, ContextState::Destroyed).is_ok() {
            debug!(context = %self.context, "deferred teardown of orphaned context");
            self.teardown();
        }
    }

    /// Вызывается менеджером при shutdown
    pub(crate) fn reclaim(&self) -> Reclaim {
        loop {
            let current = self.state();
            match current {
                ContextState::Ready | ContextState::Broken => {
                    if self.transition(current, ContextState::Destroyed).is_ok() {
                        self.teardown();
                        return Reclaim::Destroyed;
                    }
                }
                ContextState::Initializing | ContextState::Executing => {
                    if self.transition(current, ContextState::Orphaned).is_ok() {
                        warn!(worker = %self.worker, context = %self.context, "leaving orphaned context");
                        return Reclaim::Orphaned;
                    }
                }
                ContextState::Orphaned | ContextState::Destroyed => return Reclaim::AlreadyGone,
            }
        }
    }

    /// Уничтожение простаивающего контекста его же воркером при выходе
    pub(crate) fn release_idle(&self) -> bool {
        let released = [ContextState::Ready, ContextState::Broken]
            .into_iter()
            .any(|from| self.transition(from, ContextState::Destroyed).is_ok());
        if released {
            self.teardown();
        }
        released
    }

    /// Сначала канал, потом контекст. Вызывает только тот, кто перевёл состояние в `Destroyed`.
    fn teardown(&self) {
        let rt = runtime();
        if let Err(err) = rt.channel_destroy(self.channel) {
            debug!(channel = %self.channel, error = %err, "channel already gone");
        }
        if let Err(err) = rt.destroy(self.context) {
            warn!(context = %self.context, error = %err, "failed to destroy context");
        }
    }
}
