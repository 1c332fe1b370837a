#[cfg(test)]
mod tests {
    use isolate_pool::{
        errors::PoolError,
        model::ContextState,
        pool::{
            Config,
            Initializer,
            IsolatedExecutor,
        },
        runtime::runtime,
        Raised,
        Registry,
        ResourceHandle,
        Task,
        Value,
    };
    use std::{
        sync::{
            atomic::{AtomicUsize, Ordering},
            Arc,
        },
        time::{Duration, Instant},
    };

    fn init_tracing() {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    }

    fn fib(n: i64) -> i64 {
        if n < 2 { n } else { fib(n - 1) + fib(n - 2) }
    }

    fn registry() -> Registry {
        Registry::new()
            .with("add", |_, args| Ok(Value::Int(args.get::<i64>(0)? + args.get::<i64>(1)?)))
            .with("raise_value_error", |_, _| Err(Raised::value_error("bad value").into()))
            .with("fib", |_, args| Ok(Value::Int(fib(args.get::<i64>(0)?))))
            .with("set_global", |globals, args| {
                globals.set("value", args.get::<i64>(0)?);
                Ok(Value::None)
            })
            .with("read_global", |globals, _| Ok(globals.get("value").cloned().unwrap_or(Value::None)))
            .with("record", |globals, args| {
                let mut seen = match globals.remove("seen") {
                    Some(Value::List(items)) => items,
                    _ => Vec::new(),
                };
                seen.push(args.positional()[0].clone());
                globals.set("seen", Value::List(seen.clone()));
                Ok(Value::List(seen))
            })
            .with("sleep", |_, args| {
                std::thread::sleep(Duration::from_millis(args.get::<i64>(0)? as u64));
                Ok(Value::from("done"))
            })
            .with("leak_handle", |_, _| Ok(ResourceHandle::new("socket", 42u16).into()))
            .with("greet", |_, args| {
                let name: String = args.get(0)?;
                let punct = args.kwarg::<String>("punct")?.unwrap_or_else(|| "!".into());
                Ok(Value::Str(format!("hello, {}{}", name, punct)))
            })
    }

    fn wait_for_state(pool: &IsolatedExecutor, state: ContextState, count: usize) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while pool.contexts().filter(|h| h.state() == state).count() < count {
            assert!(Instant::now() < deadline, "контексты не дошли до {:?}", state);
            std::thread::sleep(Duration::from_millis(2));
        }
    }

    #[test]
    fn test_success_and_captured_failure() {
        init_tracing();
        println!("\n=== TEST: Успех и захваченная ошибка ===");
        let pool = IsolatedExecutor::new(registry(), 2).unwrap();

        let f1 = pool.call("add", [2, 3]).unwrap();
        let f2 = pool.submit(Task::new("raise_value_error")).unwrap();

        let err = f2.wait().unwrap_err();
        let failure = err.failure().expect("ожидали CapturedFailure");
        assert!(failure.is_kind("ValueError"));
        assert_eq!(failure.message, "bad value");
        assert_eq!(failure.function, "raise_value_error");

        assert_eq!(f1.wait().unwrap(), Value::Int(5));
        println!("  ✓ f1 = 5, f2 = {}", failure);
    }

    #[test]
    fn test_matches_direct_invocation() {
        println!("\n=== TEST: Совпадение с прямым вызовом ===");
        let pool = IsolatedExecutor::new(registry(), 4).unwrap();

        let inputs: Vec<i64> = (0..20).collect();
        let handles = pool
            .map("fib", inputs.iter().map(|n| vec![Value::Int(*n)]))
            .unwrap();

        for (n, handle) in inputs.iter().zip(handles) {
            assert_eq!(handle.wait().unwrap(), Value::Int(fib(*n)));
        }

        let greeting = pool
            .submit(Task::new("greet").arg("world").kwarg("punct", "?"))
            .unwrap()
            .wait()
            .unwrap();
        assert_eq!(greeting, Value::from("hello, world?"));
        println!("  ✓ 20 вызовов fib совпали");
    }

    #[test]
    fn test_initializer_state_is_per_context() {
        println!("\n=== TEST: Инициализатор и глобалы контекста ===");
        let config = Config::default()
            .with_workers(1)
            .with_initializer(Initializer::new("set_global", [7]));
        let pool = IsolatedExecutor::with_config(registry(), config).unwrap();

        for _ in 0..3 {
            assert_eq!(pool.call("read_global", Vec::<Value>::new()).unwrap().wait().unwrap(), Value::Int(7));
        }

        // второй пул без инициализатора не видит чужих глобалов
        let other = IsolatedExecutor::new(registry(), 1).unwrap();
        let seen = other.call("read_global", Vec::<Value>::new()).unwrap().wait().unwrap();
        assert_eq!(seen, Value::None);
        println!("  ✓ Глобалы живут только в своём контексте");
    }

    #[test]
    fn test_single_worker_preserves_order() {
        println!("\n=== TEST: Порядок при max_workers = 1 ===");
        let pool = IsolatedExecutor::new(registry(), 1).unwrap();

        let handles: Vec<_> = (0..25).map(|i| pool.call("record", [i]).unwrap()).collect();
        let last = handles.into_iter().map(|h| h.wait().unwrap()).last().unwrap();

        let expected: Vec<Value> = (0..25).map(Value::Int).collect();
        assert_eq!(last, Value::List(expected));
        println!("  ✓ Задачи выполнены строго в порядке отправки");
    }

    #[test]
    fn test_broken_initializer_poisons_only_its_worker() {
        println!("\n=== TEST: Сломанный инициализатор ===");
        let created = Arc::new(AtomicUsize::new(0));
        let mut registry = registry();
        let counter = created.clone();
        registry.register("flaky_init", move |_, _| {
            if counter.fetch_add(1, Ordering::SeqCst) == 1 {
                anyhow::bail!("second context refuses to start");
            }
            Ok(Value::None)
        });

        let config = Config::default()
            .with_workers(2)
            .with_initializer(Initializer::new("flaky_init", Vec::<Value>::new()));
        let pool = IsolatedExecutor::with_config(registry, config).unwrap();

        // первый воркер занят, следующая задача уходит второму
        let slow = pool.call("sleep", [300]).unwrap();
        wait_for_state(&pool, ContextState::Executing, 1);

        let trigger = pool.call("add", [1, 1]).unwrap().wait();
        assert!(matches!(trigger, Err(PoolError::Broken { .. })), "получили {:?}", trigger);

        let broken = pool
            .contexts()
            .find(|h| h.state() == ContextState::Broken)
            .expect("сломанный контекст")
            .worker();

        assert_eq!(slow.wait().unwrap(), Value::from("done"));

        let mut ok = 0;
        for _ in 0..10 {
            match pool.call("add", [2, 3]).unwrap().wait() {
                Ok(v) => {
                    assert_eq!(v, Value::Int(5));
                    ok += 1;
                }
                Err(PoolError::Broken { worker, .. }) => assert_eq!(worker, broken),
                Err(other) => panic!("неожиданная ошибка {:?}", other),
            }
        }
        assert_eq!(created.load(Ordering::SeqCst), 2, "повторного создания быть не должно");
        assert_eq!(pool.metrics().broken_contexts, 1);
        println!("  ✓ Успешных после поломки: {}/10", ok);
    }

    #[test]
    fn test_shutdown_wait_destroys_everything() {
        init_tracing();
        println!("\n=== TEST: shutdown(wait = true) ===");
        let pool = IsolatedExecutor::new(registry(), 3).unwrap();

        let handles: Vec<_> = (0..6).map(|_| pool.call("sleep", [50]).unwrap()).collect();
        let started = Instant::now();
        let report = pool.shutdown(true);
        assert!(started.elapsed() >= Duration::from_millis(50));

        for handle in handles {
            assert_eq!(handle.wait().unwrap(), Value::from("done"));
        }
        assert!(report.is_clean());
        assert!(!report.destroyed.is_empty());
        for handle in pool.contexts() {
            assert_eq!(handle.state(), ContextState::Destroyed);
            assert!(!runtime().contains_context(handle.context_id()));
            assert!(!runtime().contains_channel(handle.channel_id()));
        }

        assert!(matches!(pool.call("add", [1, 2]), Err(PoolError::Closed)));
        assert_eq!(pool.shutdown(true), Default::default());
        println!("  ✓ Уничтожено контекстов: {}", report.destroyed.len());
    }

    #[test]
    fn test_shutdown_nowait_reports_orphans() {
        init_tracing();
        println!("\n=== TEST: shutdown(wait = false) ===");
        let pool = IsolatedExecutor::new(registry(), 2).unwrap();

        // прогреваем оба контекста
        let warm: Vec<_> = (0..2).map(|_| pool.call("sleep", [100]).unwrap()).collect();
        for handle in warm {
            handle.wait().unwrap();
        }
        assert_eq!(pool.metrics().live_contexts, 2);

        let long = pool.call("sleep", [400]).unwrap();
        wait_for_state(&pool, ContextState::Executing, 1);
        let busy = pool
            .contexts()
            .find(|h| h.state() == ContextState::Executing)
            .unwrap()
            .context_id();

        let started = Instant::now();
        let report = pool.shutdown(false);
        assert!(started.elapsed() < Duration::from_millis(200), "shutdown должен вернуться сразу");

        assert_eq!(report.orphaned, vec![busy]);
        assert_eq!(report.destroyed.len(), 1);
        assert!(!runtime().contains_context(report.destroyed[0]));

        // сирота доработал задачу, затем уничтожен своим воркером
        assert_eq!(long.wait().unwrap(), Value::from("done"));

        let deadline = Instant::now() + Duration::from_secs(2);
        while runtime().contains_context(busy) {
            assert!(Instant::now() < deadline, "сирота не был уничтожен");
            std::thread::sleep(Duration::from_millis(5));
        }
        assert!(matches!(pool.call("add", [1, 2]), Err(PoolError::Closed)));
        println!("  ✓ Сирота: {}", busy);
    }

    #[test]
    fn test_shutdown_nowait_fails_pending_tasks() {
        println!("\n=== TEST: shutdown(wait = false) с очередью ===");
        let pool = IsolatedExecutor::new(registry(), 1).unwrap();

        let running = pool.call("sleep", [200]).unwrap();
        wait_for_state(&pool, ContextState::Executing, 1);
        let pending: Vec<_> = (0..3).map(|i| pool.call("add", [i, i]).unwrap()).collect();

        let report = pool.shutdown(false);
        assert_eq!(report.orphaned.len(), 1);
        assert!(report.destroyed.is_empty());

        assert!(running.wait().is_ok());
        for handle in pending {
            assert_eq!(handle.wait(), Err(PoolError::Closed));
        }
        let metrics = pool.metrics();
        assert_eq!(metrics.queued_tasks, 0);
        assert_eq!(metrics.failed_tasks, 3);
        println!("  ✓ Невзятые задачи получили PoolClosed");
    }

    #[test]
    fn test_serialization_errors_stay_local() {
        println!("\n=== TEST: Ошибки сериализации ===");
        let pool = IsolatedExecutor::new(registry(), 1).unwrap();

        let bad_args = pool
            .submit(Task::new("add").arg(ResourceHandle::new("file", ())).arg(1))
            .unwrap()
            .wait();
        assert!(matches!(bad_args, Err(PoolError::Serialization(_))));

        let bad_return = pool.call("leak_handle", Vec::<Value>::new()).unwrap().wait();
        assert!(matches!(bad_return, Err(PoolError::Serialization(_))));

        // контекст продолжает работать
        assert_eq!(pool.call("add", [20, 22]).unwrap().wait().unwrap(), Value::Int(42));
        assert_eq!(pool.metrics().broken_contexts, 0);
        println!("  ✓ Контекст пережил обе ошибки");
    }

    #[test]
    fn test_unknown_function_and_type_errors() {
        let pool = IsolatedExecutor::new(registry(), 1).unwrap();

        let missing = pool.call("nope", [1]).unwrap().wait().unwrap_err();
        assert!(missing.failure().unwrap().is_kind("LookupError"));

        let mistyped = pool.call("add", ["a", "b"]).unwrap().wait().unwrap_err();
        assert!(mistyped.failure().unwrap().is_kind("TypeError"));
    }

    #[test]
    fn test_invalid_configuration() {
        println!("\n=== TEST: Неверная конфигурация ===");
        assert!(matches!(
            IsolatedExecutor::new(registry(), 0),
            Err(PoolError::Configuration(_))
        ));

        let config = Config::default().with_initializer(Initializer::new("missing", [1]));
        assert!(matches!(
            IsolatedExecutor::with_config(registry(), config),
            Err(PoolError::Configuration(_))
        ));

        let config = Config::default().with_workers(1).with_thread_name_prefix("");
        assert!(matches!(
            IsolatedExecutor::with_config(registry(), config),
            Err(PoolError::Configuration(_))
        ));

        let pool = IsolatedExecutor::with_config(registry(), Config::default()).unwrap();
        assert_eq!(pool.max_workers(), num_cpus::get());
        println!("  ✓ ConfigurationError на некорректных параметрах");
    }

    #[test]
    fn test_cancel_before_start() {
        println!("\n=== TEST: Отмена задачи до старта ===");
        let pool = IsolatedExecutor::new(registry(), 1).unwrap();

        let blocker = pool.call("sleep", [150]).unwrap();
        let victim = pool.call("add", [1, 1]).unwrap();
        victim.cancel();
        assert!(victim.is_cancelled());

        assert_eq!(victim.wait(), Err(PoolError::Cancelled));
        assert!(blocker.wait().is_ok());
        println!("  ✓ Отменённая задача не выполнялась");
    }

    #[tokio::test]
    async fn test_timeout_abandons_wait_only() {
        println!("\n=== TEST: Timeout ожидания ===");
        let pool = IsolatedExecutor::new(registry(), 1).unwrap();

        let slow = pool.call("sleep", [300]).unwrap();
        let result = slow.await_timeout(Duration::from_millis(50)).await;
        assert_eq!(result, Err(PoolError::Timeout));

        // контекст продолжает выполнять брошенную задачу, следующая ждёт её
        let next = pool.call("add", [1, 2]).unwrap();
        assert_eq!(next.await, Ok(Value::Int(3)));
        println!("  ✓ Timeout не прерывает задачу в контексте");

        tokio::task::spawn_blocking(move || pool.shutdown(true)).await.unwrap();
    }

    #[tokio::test]
    async fn test_join_handles_keeps_order() {
        let pool = IsolatedExecutor::new(registry(), 4).unwrap();
        let handles: Vec<_> = (0..16).map(|i| pool.call("add", [i, 100]).unwrap()).collect();

        let results = IsolatedExecutor::join_handles(handles).await;
        let values: Vec<_> = results.into_iter().map(Result::unwrap).collect();
        let expected: Vec<_> = (0..16).map(|i| Value::Int(i + 100)).collect();
        assert_eq!(values, expected);

        tokio::task::spawn_blocking(move || drop(pool)).await.unwrap();
    }
}
