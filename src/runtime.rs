//! Процессный рантайм изолированных контекстов.
//!
//! Каждый контекст живёт на собственном OS-потоке и владеет своими глобалами.
//! Внутрь передаются только скрипты с байтовыми payload, наружу только байты
//! через каналы рантайма. Создание и уничтожение явные, глобального состояния,
//! доступного коду задач, нет.

use super::{
    codec::{self, CapturedFailure, Outcome, Task},
    errors::RuntimeError,
    model::{ChannelId, ContextId},
    registry::{Args, Globals, Registry},
    value::Value,
};
use crossbeam::channel::{self, Receiver, RecvTimeoutError, Sender};
use std::{
    any::Any,
    collections::HashMap,
    panic::{self, AssertUnwindSafe},
    sync::{
        atomic::{AtomicU64, AtomicUsize, Ordering},
        Arc, Mutex, MutexGuard, OnceLock, PoisonError,
    },
    thread::JoinHandle,
    time::Duration,
};
use tracing::{debug, trace, warn};


/// Как часто ожидающий на канале проверяет, жив ли контекст-владелец
const LIVENESS_POLL: Duration = Duration::from_millis(50);

/// Код, который внедряется в контекст
pub enum Script {
    /// Делает кодек и таблицу функций доступными внутри контекста; подтверждение уходит в `reply`
    Bootstrap { registry: Arc<Registry>, reply: ChannelId },
    /// Пользовательский инициализатор; исход отправляется в `reply`
    Initialize { payload: Vec<u8>, reply: ChannelId },
    /// Задача; исход отправляется в `reply`
    Execute { payload: Vec<u8>, reply: ChannelId },
}

struct ContextEntry {
    scripts: Sender<Script>,
    pending: Arc<AtomicUsize>,
    thread: JoinHandle<()>,
}

struct ChannelEntry {
    tx: Sender<Vec<u8>>,
    rx: Receiver<Vec<u8>>,
}

pub struct ContextRuntime {
    next_id: AtomicU64,
    contexts: Mutex<HashMap<ContextId, ContextEntry>>,
    channels: Mutex<HashMap<ChannelId, ChannelEntry>>,
}

static RUNTIME: OnceLock<ContextRuntime> = OnceLock::new();

/// Единственный экземпляр рантайма на процесс
pub fn runtime() -> &'static ContextRuntime {
    RUNTIME.get_or_init(ContextRuntime::new)
}

#[inline]
fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl ContextRuntime {
    fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            contexts: Mutex::new(HashMap::new()),
            channels: Mutex::new(HashMap::new()),
        }
    }

    pub fn create(&self) -> Result<ContextId, RuntimeError> {
        let id = ContextId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let (scripts, inbox) = channel::unbounded::<Script>();
        let pending = Arc::new(AtomicUsize::new(0));

        let thread = std::thread::Builder::new()
            .name(format!("isolate-ctx-{}", id.0))
            .spawn({
                let pending = pending.clone();
                move || context_main(id, inbox, pending)
            })?;

        lock(&self.contexts).insert(id, ContextEntry { scripts, pending, thread });
        debug!(context = %id, "context created");
        Ok(id)
    }

    /// Ставит скрипт в очередь контекста и сразу возвращается.
    /// Скрипты одного контекста выполняются строго по одному, в порядке постановки.
    pub fn run(&self, id: ContextId, script: Script) -> Result<(), RuntimeError> {
        let contexts = lock(&self.contexts);
        let entry = contexts.get(&id).ok_or(RuntimeError::ContextNotFound(id))?;
        if entry.thread.is_finished() {
            return Err(RuntimeError::ContextGone(id));
        }

        entry.pending.fetch_add(1, Ordering::AcqRel);
        if entry.scripts.send(script).is_err() {
            entry.pending.fetch_sub(1, Ordering::AcqRel);
            return Err(RuntimeError::ContextGone(id));
        }
        Ok(())
    }

    pub fn is_running(&self, id: ContextId) -> bool {
        lock(&self.contexts)
            .get(&id)
            .is_some_and(|entry| entry.pending.load(Ordering::Acquire) > 0)
    }

    pub fn is_alive(&self, id: ContextId) -> bool {
        lock(&self.contexts)
            .get(&id)
            .is_some_and(|entry| !entry.thread.is_finished())
    }

    pub fn contains_context(&self, id: ContextId) -> bool {
        lock(&self.contexts).contains_key(&id)
    }

    /// Уничтожает контекст. Контекст, который ещё выполняет скрипт, не трогаем.
    pub fn destroy(&self, id: ContextId) -> Result<(), RuntimeError> {
        let entry = {
            let mut contexts = lock(&self.contexts);
            match contexts.get(&id) {
                None => return Err(RuntimeError::ContextNotFound(id)),
                Some(entry) if entry.pending.load(Ordering::Acquire) > 0 => {
                    return Err(RuntimeError::ContextRunning(id));
                }
                Some(_) => contexts.remove(&id),
            }
        };

        if let Some(ContextEntry { scripts, thread, .. }) = entry {
            // закрытие очереди завершает цикл потока
            drop(scripts);
            if thread.join().is_err() {
                warn!(context = %id, "context thread panicked during teardown");
            }
            debug!(context = %id, "context destroyed");
        }
        Ok(())
    }

    pub fn channel_create(&self) -> ChannelId {
        let id = ChannelId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let (tx, rx) = channel::unbounded();
        lock(&self.channels).insert(id, ChannelEntry { tx, rx });
        trace!(channel = %id, "channel created");
        id
    }

    pub fn channel_send(&self, id: ChannelId, bytes: Vec<u8>) -> Result<(), RuntimeError> {
        let tx = lock(&self.channels)
            .get(&id)
            .map(|entry| entry.tx.clone())
            .ok_or(RuntimeError::ChannelNotFound(id))?;
        tx.send(bytes).map_err(|_| RuntimeError::ChannelNotFound(id))
    }

    /// Блокирующее чтение из канала.
    ///
    /// Не зависает навсегда: если канал уничтожен или поток `owner` умер,
    /// возвращает `ContextGone`.
    pub fn channel_recv(&self, id: ChannelId, owner: ContextId) -> Result<Vec<u8>, RuntimeError> {
        let rx = lock(&self.channels)
            .get(&id)
            .map(|entry| entry.rx.clone())
            .ok_or(RuntimeError::ChannelNotFound(id))?;

        loop {
            match rx.recv_timeout(LIVENESS_POLL) {
                Ok(bytes) => return Ok(bytes),
                Err(RecvTimeoutError::Disconnected) => return Err(RuntimeError::ContextGone(owner)),
                Err(RecvTimeoutError::Timeout) => {
                    if !self.is_alive(owner) {
                        // ответ мог успеть прийти перед смертью потока
                        return rx.try_recv().map_err(|_| RuntimeError::ContextGone(owner));
                    }
                }
            }
        }
    }

    pub fn channel_destroy(&self, id: ChannelId) -> Result<(), RuntimeError> {
        lock(&self.channels)
            .remove(&id)
            .map(|_| trace!(channel = %id, "channel destroyed"))
            .ok_or(RuntimeError::ChannelNotFound(id))
    }

    pub fn contains_channel(&self, id: ChannelId) -> bool {
        lock(&self.channels).contains_key(&id)
    }
}


/// Состояние, которое существует только на потоке контекста
struct Isolate {
    id: ContextId,
    registry: Option<Arc<Registry>>,
    globals: Globals,
}

fn context_main(id: ContextId, inbox: Receiver<Script>, pending: Arc<AtomicUsize>) {
    let mut isolate = Isolate {
        id,
        registry: None,
        globals: Globals::new(id),
    };

    for script in inbox.iter() {
        let reply = isolate.run(script);
        pending.fetch_sub(1, Ordering::AcqRel);

        if let Some((channel, bytes)) = reply {
            if let Err(err) = runtime().channel_send(channel, bytes) {
                warn!(context = %id, error = %err, "dropping reply");
            }
        }
    }
    trace!(context = %id, "context thread exiting");
}

impl Isolate {
    fn run(&mut self, script: Script) -> Option<(ChannelId, Vec<u8>)> {
        match script {
            Script::Bootstrap { registry, reply } => {
                trace!(context = %self.id, functions = registry.len(), "bootstrap");
                self.registry = Some(registry);
                Some((reply, Outcome::Success(Value::None).encode_or_report()))
            }
            Script::Initialize { payload, reply } | Script::Execute { payload, reply } => {
                Some((reply, self.invoke(&payload).encode_or_report()))
            }
        }
    }

    fn invoke(&mut self, payload: &[u8]) -> Outcome {
        let task: Task = match codec::decode(payload) {
            Ok(task) => task,
            Err(err) => return Outcome::Untransportable(format!("task payload: {}", err)),
        };
        let Task { function: name, args, kwargs } = task;

        let Some(registry) = self.registry.clone() else {
            return Outcome::Failure(CapturedFailure::new(
                "RuntimeError",
                "context was not bootstrapped",
                name,
            ));
        };
        let function = match registry.resolve(&name) {
            Ok(function) => function.clone(),
            Err(raised) => {
                return Outcome::Failure(CapturedFailure::new(raised.kind(), raised.message(), name));
            }
        };

        let globals = &mut self.globals;
        match panic::catch_unwind(AssertUnwindSafe(|| function(globals, Args::new(args, kwargs)))) {
            Ok(Ok(value)) => Outcome::Success(value),
            Ok(Err(err)) => Outcome::Failure(CapturedFailure::capture(&err, &name)),
            Err(panic) => Outcome::Failure(CapturedFailure::new("Panic", panic_message(panic.as_ref()), name)),
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(msg) = panic.downcast_ref::<&str>() {
        msg.to_string()
    } else if let Some(msg) = panic.downcast_ref::<String>() {
        msg.clone()
    } else {
        "panic with non-string payload".to_string()
    }
}
