//! Пул потоков, где каждый воркер исполняет задачи в собственном изолированном контексте
//!
//! # Features
//! - Ленивое создание контекста на воркер, стоимость создания платится один раз
//! - Пользовательский инициализатор контекста; его ошибка ломает воркер навсегда
//! - Задачи и результаты пересекают границу только в сериализованном виде
//! - Future-handles с отменой до старта и timeout ожидания
//! - Shutdown с ожиданием или без, с отчётом о контекстах-сиротах
//!
//! ```no_run
//! use isolate_pool::{IsolatedExecutor, Registry, Task, Value};
//!
//! let registry = Registry::new().with("add", |_, args| {
//!     Ok(Value::Int(args.get::<i64>(0)? + args.get::<i64>(1)?))
//! });
//! let pool = IsolatedExecutor::new(registry, 2).unwrap();
//! let handle = pool.submit(Task::new("add").arg(2).arg(3)).unwrap();
//! assert_eq!(handle.wait().unwrap(), Value::Int(5));
//! pool.shutdown(true);
//! ```

pub mod codec;
pub mod context;
pub mod errors;
pub mod handle;
pub mod model;
pub mod pool;
pub mod registry;
pub mod runtime;
pub mod value;

pub use codec::{CapturedFailure, Raised, Task};
pub use errors::{PoolError, TaskResult};
pub use handle::TaskHandle;
pub use model::{ContextId, ContextState, PoolMetrics, ShutdownReport, WorkerId};
pub use pool::{Config, Initializer, IsolatedExecutor};
pub use registry::{Args, Globals, Registry};
pub use value::{ResourceHandle, Value};
