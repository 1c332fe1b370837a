use super::{
    codec::Task,
    context::{ContextHandle, Reclaim},
    errors::{PoolError, TaskResult},
    handle::TaskHandle,
    model::{ContextState, PoolMetrics, ShutdownReport, WorkerId},
    registry::Registry,
    value::Value,
};
use std::{
    sync::{
        atomic::{AtomicU64, AtomicUsize, Ordering},
        Arc, Mutex, MutexGuard, OnceLock, PoisonError,
    },
    thread::JoinHandle,
};
use crossbeam::channel::{self, Receiver, Sender};
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};


/// Пользовательский инициализатор, который выполняется внутри каждого нового контекста
#[derive(Debug, Clone, PartialEq)]
pub struct Initializer {
    pub function: String,
    pub args: Vec<Value>,
}

impl Initializer {
    pub fn new<I, V>(function: impl Into<String>, args: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: Into<Value>,
    {
        Self {
            function: function.into(),
            args: args.into_iter().map(Into::into).collect(),
        }
    }

    pub(crate) fn as_task(&self) -> Task {
        Task {
            function: self.function.clone(),
            args: self.args.clone(),
            kwargs: Default::default(),
        }
    }
}


/// Конфигурация пула
#[derive(Debug, Clone)]
pub struct Config {
    /// `None` означает число ядер хоста
    pub max_workers: Option<usize>,
    pub thread_name_prefix: String,
    pub initializer: Option<Initializer>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_workers: None,
            thread_name_prefix: "isolate-pool".to_string(),
            initializer: None,
        }
    }
}

impl Config {
    /// По одному контексту на ядро
    pub fn cpu_bound() -> Self {
        Self {
            max_workers: Some(num_cpus::get()),
            ..Default::default()
        }
    }

    pub fn with_workers(mut self, max_workers: usize) -> Self {
        self.max_workers = Some(max_workers);
        self
    }

    pub fn with_initializer(mut self, initializer: Initializer) -> Self {
        self.initializer = Some(initializer);
        self
    }

    pub fn with_thread_name_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.thread_name_prefix = prefix.into();
        self
    }

    /// Проверяет параметры и возвращает итоговое число воркеров
    pub fn validate(&self, registry: &Registry) -> TaskResult<usize> {
        let workers = self.max_workers.unwrap_or_else(num_cpus::get);
        if workers == 0 {
            return Err(PoolError::Configuration("max_workers must be greater than 0".into()));
        }
        if self.thread_name_prefix.is_empty() {
            return Err(PoolError::Configuration("thread_name_prefix must not be empty".into()));
        }
        if let Some(init) = &self.initializer {
            if !registry.contains(&init.function) {
                return Err(PoolError::Configuration(format!(
                    "initializer `{}` is not registered",
                    init.function
                )));
            }
        }
        Ok(workers)
    }
}


struct Job {
    task: Task,
    cancel: CancellationToken,
    reply: oneshot::Sender<TaskResult<Value>>,
}

/// Состояние, общее для фасада и воркеров.
///
/// Слот воркера заполняется один раз самим воркером, менеджер читает слоты только при shutdown.
struct Shared {
    registry: Arc<Registry>,
    initializer: Option<Initializer>,
    slots: Box<[OnceLock<ContextHandle>]>,
    drop_pending: CancellationToken,
    next_task_id: AtomicU64,
    active_tasks: AtomicUsize,
    queued_tasks: AtomicUsize,
    total_submitted: AtomicUsize,
    completed_tasks: AtomicUsize,
    failed_tasks: AtomicUsize,
}

#[inline]
fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}


/// Executor, исполняющий зарегистрированные функции в изолированных контекстах.
///
/// Каждый из `max_workers` потоков лениво создаёт собственный контекст на первой задаче
/// и использует его до shutdown. Все данные пересекают границу только в сериализованном виде.
pub struct IsolatedExecutor {
    shared: Arc<Shared>,
    queue: Mutex<Option<Sender<Job>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl IsolatedExecutor {
    pub fn new(registry: Registry, max_workers: usize) -> TaskResult<Self> {
        Self::with_config(registry, Config::default().with_workers(max_workers))
    }

    pub fn with_config(registry: Registry, config: Config) -> TaskResult<Self> {
        let num_workers = config.validate(&registry)?;

        let shared = Arc::new(Shared {
            registry: Arc::new(registry),
            initializer: config.initializer,
            slots: (0..num_workers).map(|_| OnceLock::new()).collect(),
            drop_pending: CancellationToken::new(),
            next_task_id: AtomicU64::new(0),
            active_tasks: AtomicUsize::new(0),
            queued_tasks: AtomicUsize::new(0),
            total_submitted: AtomicUsize::new(0),
            completed_tasks: AtomicUsize::new(0),
            failed_tasks: AtomicUsize::new(0),
        });

        let (tx, rx) = channel::unbounded::<Job>();
        let mut workers = Vec::with_capacity(num_workers);

        // Запускаем воркеры
        for index in 0..num_workers {
            let shared = shared.clone();
            let jobs = rx.clone();
            let worker = WorkerId(index);
            let spawned = std::thread::Builder::new()
                .name(format!("{}-worker-{}", config.thread_name_prefix, index))
                .spawn(move || shared.worker_loop(worker, jobs));

            match spawned {
                Ok(thread) => workers.push(thread),
                Err(err) => {
                    // закрываем очередь, уже запущенные воркеры выйдут сами
                    drop(tx);
                    for thread in workers {
                        let _ = thread.join();
                    }
                    return Err(PoolError::Configuration(format!(
                        "failed to spawn worker thread: {}",
                        err
                    )));
                }
            }
        }

        info!(workers = num_workers, functions = shared.registry.len(), "isolated executor started");

        Ok(Self {
            shared,
            queue: Mutex::new(Some(tx)),
            workers: Mutex::new(workers),
        })
    }

    #[inline]
    pub fn max_workers(&self) -> usize {
        self.shared.slots.len()
    }

    /// Ставит задачу в общую FIFO-очередь. После shutdown возвращает `PoolError::Closed`.
    pub fn submit(&self, task: Task) -> TaskResult<TaskHandle> {
        let (tx, rx) = oneshot::channel();
        let cancel = CancellationToken::new();
        let id = self.shared.next_task_id.fetch_add(1, Ordering::Relaxed);

        let job = Job {
            task,
            cancel: cancel.clone(),
            reply: tx,
        };

        let queue = lock(&self.queue);
        let sender = queue.as_ref().ok_or(PoolError::Closed)?;
        self.shared.queued_tasks.fetch_add(1, Ordering::Relaxed);
        self.shared.total_submitted.fetch_add(1, Ordering::Relaxed);
        if sender.send(job).is_err() {
            self.shared.queued_tasks.fetch_sub(1, Ordering::Relaxed);
            return Err(PoolError::Closed);
        }

        Ok(TaskHandle::new(id, cancel, rx))
    }

    /// Сокращение для вызова без именованных аргументов
    pub fn call<I, V>(&self, function: &str, args: I) -> TaskResult<TaskHandle>
    where
        I: IntoIterator<Item = V>,
        V: Into<Value>,
    {
        self.submit(Task::with_args(function, args))
    }

    /// Один вызов `function` на каждый набор аргументов, handles в порядке входа
    pub fn map<I>(&self, function: &str, arg_lists: I) -> TaskResult<Vec<TaskHandle>>
    where
        I: IntoIterator<Item = Vec<Value>>,
    {
        arg_lists
            .into_iter()
            .map(|args| self.call(function, args))
            .collect()
    }

    /// Ожидает все handles, результаты в порядке handles
    pub async fn join_handles(handles: Vec<TaskHandle>) -> Vec<TaskResult<Value>> {
        futures::future::join_all(handles).await
    }

    /// Останавливает приём задач и разбирает контексты.
    ///
    /// `wait = true`: дожидается выполнения всех задач очереди, затем уничтожает все контексты.
    /// `wait = false`: невзятые задачи получают `Closed`, простаивающие контексты уничтожаются,
    /// занятые помечаются сиротами и уничтожаются своим воркером по завершении задачи.
    pub fn shutdown(&self, wait: bool) -> ShutdownReport {
        let was_open = lock(&self.queue).take().is_some();
        if !wait {
            self.shared.drop_pending.cancel();
        }

        if wait {
            let workers: Vec<_> = lock(&self.workers).drain(..).collect();
            for thread in workers {
                if thread.join().is_err() {
                    warn!("worker thread panicked");
                }
            }
        }

        let report = self.shared.reclaim_all();
        if was_open || !report.destroyed.is_empty() || !report.orphaned.is_empty() {
            info!(
                wait,
                destroyed = report.destroyed.len(),
                orphaned = report.orphaned.len(),
                "isolated executor shut down"
            );
        }
        report
    }

    #[inline]
    pub fn is_shutdown(&self) -> bool {
        lock(&self.queue).is_none()
    }

    /// Привязанный к воркеру контекст, если он уже создан
    pub fn context(&self, worker: WorkerId) -> Option<&ContextHandle> {
        self.shared.slots.get(worker.0).and_then(OnceLock::get)
    }

    pub fn contexts(&self) -> impl Iterator<Item = &ContextHandle> {
        self.shared.slots.iter().filter_map(OnceLock::get)
    }

    #[inline]
    pub fn metrics(&self) -> PoolMetrics {
        let shared = &self.shared;
        let (live, broken) = self.contexts().fold((0, 0), |(live, broken), handle| {
            let state = handle.state();
            (
                live + usize::from(state.is_live()),
                broken + usize::from(state == ContextState::Broken),
            )
        });

        PoolMetrics {
            workers: shared.slots.len(),
            live_contexts: live,
            broken_contexts: broken,
            active_tasks: shared.active_tasks.load(Ordering::Relaxed),
            queued_tasks: shared.queued_tasks.load(Ordering::Relaxed),
            total_submitted: shared.total_submitted.load(Ordering::Relaxed),
            completed_tasks: shared.completed_tasks.load(Ordering::Relaxed),
            failed_tasks: shared.failed_tasks.load(Ordering::Relaxed),
        }
    }
}

impl Drop for IsolatedExecutor {
    fn drop(&mut self) {
        if !self.is_shutdown() {
            self.shutdown(true);
        }
    }
}


impl Shared {
    fn worker_loop(&self, worker: WorkerId, jobs: Receiver<Job>) {
        // ошибка создания контекста запоминается: повторных попыток нет
        let mut spawn_failure: Option<PoolError> = None;

        for job in jobs.iter() {
            self.queued_tasks.fetch_sub(1, Ordering::Relaxed);

            if self.drop_pending.is_cancelled() {
                self.finish(job.reply, Err(PoolError::Closed));
                continue;
            }
            if job.cancel.is_cancelled() {
                self.finish(job.reply, Err(PoolError::Cancelled));
                continue;
            }

            self.active_tasks.fetch_add(1, Ordering::Relaxed);
            let result = self.execute(worker, &job.task, &mut spawn_failure);
            self.active_tasks.fetch_sub(1, Ordering::Relaxed);
            self.finish(job.reply, result);
        }

        // контекст мог появиться уже после обхода менеджером при shutdown(wait = false)
        if self.drop_pending.is_cancelled() {
            if let Some(handle) = self.slots[worker.0].get() {
                if handle.release_idle() {
                    debug!(%worker, context = %handle.context_id(), "released context on worker exit");
                }
            }
        }
        debug!(%worker, "worker exiting");
    }

    fn execute(
        &self,
        worker: WorkerId,
        task: &Task,
        spawn_failure: &mut Option<PoolError>,
    ) -> TaskResult<Value> {
        if let Some(err) = spawn_failure {
            return Err(err.clone());
        }

        let slot = &self.slots[worker.0];
        let handle = match slot.get() {
            Some(handle) => handle,
            None => {
                if self.drop_pending.is_cancelled() {
                    return Err(PoolError::Closed);
                }
                let handle = match ContextHandle::create(worker) {
                    Ok(handle) => handle,
                    Err(err) => {
                        *spawn_failure = Some(err.clone());
                        return Err(err);
                    }
                };
                // слот пишет только этот воркер, значит он ещё пуст
                let handle = slot.get_or_init(|| handle);
                handle.initialize(&self.registry, self.initializer.as_ref())?;
                // менеджер мог обойти слоты, пока контекст создавался
                if self.drop_pending.is_cancelled() {
                    warn!(%worker, context = %handle.context_id(), "context created during shutdown, releasing on worker exit");
                    return Err(PoolError::Closed);
                }
                handle
            }
        };

        debug!(%worker, context = %handle.context_id(), function = %task.function, "dispatching task");
        handle.dispatch(task)
    }

    fn finish(&self, reply: oneshot::Sender<TaskResult<Value>>, result: TaskResult<Value>) {
        if result.is_ok() {
            self.completed_tasks.fetch_add(1, Ordering::Relaxed);
        } else {
            self.failed_tasks.fetch_add(1, Ordering::Relaxed);
        }
        // вызывающий мог уже бросить handle
        let _ = reply.send(result);
    }

    fn reclaim_all(&self) -> ShutdownReport {
        let mut report = ShutdownReport::default();
        for handle in self.slots.iter().filter_map(OnceLock::get) {
            match handle.reclaim() {
                Reclaim::Destroyed => report.destroyed.push(handle.context_id()),
                Reclaim::Orphaned => report.orphaned.push(handle.context_id()),
                Reclaim::AlreadyGone => {}
            }
        }
        report
    }
}
