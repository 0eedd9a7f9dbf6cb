//! End-to-end dispatch behavior

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use task_dispatch::{
    handler_fn, Config, DispatchError, Dispatcher, EnqueueOptions, ResultQuery, ResultStatus,
    SlotFate, TaskClient, TaskContext, TaskId, WorkerId,
};
use tokio_test::{assert_err, assert_ok};

fn config(pool: usize, max_tasks: u32) -> Config {
    Config {
        worker_pool_size: pool,
        worker_max_tasks_per_child: max_tasks,
        dispatch_poll_interval_ms: 10,
        ..Config::default()
    }
}

async fn echo_dispatcher(config: Config) -> Arc<Dispatcher> {
    let dispatcher = Arc::new(assert_ok!(Dispatcher::in_memory(config)));
    dispatcher
        .register_handler(
            "app.tasks.echo",
            handler_fn(|ctx: TaskContext| async move { Ok(ctx.payload.to_vec()) }),
        )
        .await;
    dispatcher
}

#[tokio::test]
async fn routes_follow_overrides_and_default() {
    let dispatcher = assert_ok!(Dispatcher::in_memory(Config::default()));
    let router = dispatcher.router();

    for (task, queue) in &Config::default().task_routes {
        assert_eq!(router.route(task), queue.queue);
    }
    for task in ["app.tasks.other", "task_generate_embeddings", "APP.TASKS.X"] {
        assert_eq!(router.route(task), "default");
    }
}

#[tokio::test]
async fn fifo_within_one_queue() {
    let dispatcher = echo_dispatcher(config(1, 100)).await;
    let a = assert_ok!(dispatcher.enqueue("app.tasks.echo", b"A".to_vec(), EnqueueOptions::new()).await);
    let b = assert_ok!(dispatcher.enqueue("app.tasks.echo", b"B".to_vec(), EnqueueOptions::new()).await);
    let c = assert_ok!(dispatcher.enqueue("app.tasks.echo", b"C".to_vec(), EnqueueOptions::new()).await);

    let order: Vec<TaskId> = assert_ok!(dispatcher.run_until_idle().await)
        .into_iter()
        .map(|report| report.task_id)
        .collect();
    assert_eq!(order, [a, b, c]);
}

#[tokio::test]
async fn workers_recycle_after_task_budget() {
    let dispatcher = echo_dispatcher(config(1, 3)).await;
    for _ in 0..7 {
        assert_ok!(dispatcher.enqueue("app.tasks.echo", Vec::new(), EnqueueOptions::new()).await);
    }

    let reports = assert_ok!(dispatcher.run_until_idle().await);
    let workers: Vec<WorkerId> = reports.iter().map(|r| r.worker_id).collect();
    let fates: Vec<SlotFate> = reports.iter().map(|r| r.slot_fate).collect();

    assert_eq!(workers[0], workers[1]);
    assert_eq!(workers[1], workers[2]);
    assert_ne!(workers[2], workers[3]);
    assert_eq!(workers[3], workers[5]);
    assert_ne!(workers[5], workers[6]);
    assert_ne!(workers[6], workers[0]);
    assert_eq!(fates[2], SlotFate::Recycled);
    assert_eq!(fates[5], SlotFate::Recycled);
    assert_eq!(fates[6], SlotFate::Returned);

    let stats = dispatcher.stats().await;
    assert_eq!(stats.workers.recycled, 2);
    assert_eq!(stats.succeeded, 7);
}

#[tokio::test]
async fn soft_limit_is_cooperative_and_hard_limit_is_not() {
    let dispatcher = Arc::new(assert_ok!(Dispatcher::in_memory(config(1, 100))));
    dispatcher
        .register_handler(
            "app.tasks.cooperative",
            handler_fn(|mut ctx: TaskContext| async move {
                ctx.soft_limit.raised().await;
                Ok(b"saved partial work".to_vec())
            }),
        )
        .await;
    dispatcher
        .register_handler(
            "app.tasks.gives_up",
            handler_fn(|mut ctx: TaskContext| async move {
                ctx.soft_limit.raised().await;
                Err::<Vec<u8>, _>(anyhow::anyhow!("soft time limit exceeded"))
            }),
        )
        .await;
    dispatcher
        .register_handler(
            "app.tasks.stubborn",
            handler_fn(|_ctx: TaskContext| async move {
                tokio::time::sleep(Duration::from_secs(30)).await;
                Ok(Vec::new())
            }),
        )
        .await;

    let limits = EnqueueOptions::new()
        .soft_limit(Duration::from_millis(40))
        .hard_limit(Duration::from_millis(400));
    let cooperative = assert_ok!(
        dispatcher
            .enqueue("app.tasks.cooperative", Vec::new(), limits.clone())
            .await
    );
    let gives_up = assert_ok!(
        dispatcher
            .enqueue("app.tasks.gives_up", Vec::new(), limits.clone())
            .await
    );
    let stubborn = assert_ok!(
        dispatcher
            .enqueue("app.tasks.stubborn", Vec::new(), limits)
            .await
    );

    let reports = assert_ok!(dispatcher.run_until_idle().await);
    let by_id: HashMap<TaskId, _> = reports.iter().map(|r| (r.task_id, r)).collect();

    assert_eq!(by_id[&cooperative].status, ResultStatus::Success);
    assert!(by_id[&cooperative].soft_limit_hit);
    assert_eq!(by_id[&cooperative].slot_fate, SlotFate::Returned);

    assert_eq!(by_id[&gives_up].status, ResultStatus::Failure);

    let timed_out = by_id[&stubborn];
    assert_eq!(timed_out.status, ResultStatus::Timeout);
    assert_eq!(timed_out.slot_fate, SlotFate::Terminated);
    assert!(timed_out.elapsed < Duration::from_secs(5));

    match assert_ok!(dispatcher.get_result(stubborn).await) {
        ResultQuery::Ready(record) => {
            assert_eq!(record.status, ResultStatus::Timeout);
            assert!(record.error.is_some());
        }
        other => panic!("expected timeout record, got {:?}", other),
    }
    assert_eq!(dispatcher.stats().await.timed_out, 1);
}

#[tokio::test]
async fn results_expire_into_not_found() {
    let dispatcher = echo_dispatcher(Config {
        result_expires: 1,
        ..config(1, 100)
    })
    .await;
    let id = assert_ok!(dispatcher.enqueue("app.tasks.echo", b"v".to_vec(), EnqueueOptions::new()).await);
    assert_ok!(dispatcher.run_until_idle().await);

    match assert_ok!(dispatcher.get_result(id).await) {
        ResultQuery::Ready(record) => {
            assert_eq!(record.status, ResultStatus::Success);
            assert_eq!(record.value.as_deref(), Some(&b"v"[..]));
        }
        other => panic!("expected ready result, got {:?}", other),
    }

    tokio::time::sleep(Duration::from_millis(1100)).await;
    assert_eq!(assert_ok!(dispatcher.get_result(id).await), ResultQuery::NotFound);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn a_worker_never_runs_two_tasks_at_once() {
    let in_flight: Arc<Mutex<HashMap<WorkerId, usize>>> = Arc::default();
    let max_seen: Arc<Mutex<usize>> = Arc::default();

    let dispatcher = Arc::new(assert_ok!(Dispatcher::in_memory(config(3, 4))));
    {
        let in_flight = in_flight.clone();
        let max_seen = max_seen.clone();
        dispatcher
            .register_handler(
                "app.tasks.track",
                handler_fn(move |ctx: TaskContext| {
                    let in_flight = in_flight.clone();
                    let max_seen = max_seen.clone();
                    async move {
                        {
                            let mut map = in_flight.lock().unwrap();
                            let count = map.entry(ctx.worker_id).or_insert(0);
                            *count += 1;
                            let mut max = max_seen.lock().unwrap();
                            *max = (*max).max(*count);
                        }
                        tokio::time::sleep(Duration::from_millis(5)).await;
                        *in_flight.lock().unwrap().get_mut(&ctx.worker_id).unwrap() -= 1;
                        Ok(Vec::new())
                    }
                }),
            )
            .await;
    }

    let client = TaskClient::new(dispatcher.clone());
    let runner = tokio::spawn(dispatcher.clone().run());

    let mut ids = Vec::new();
    for i in 0..30 {
        let queue = ["default", "high_priority", "low_priority"][i % 3];
        ids.push(assert_ok!(client.submit_to_queue("app.tasks.track", &i, queue).await));
    }
    for id in ids {
        assert_ok!(client.wait_for_result(id, Some(Duration::from_secs(10))).await);
    }

    assert_eq!(*max_seen.lock().unwrap(), 1);
    let stats = dispatcher.stats().await;
    assert_eq!(stats.succeeded, 30);
    assert!(stats.workers.live_workers <= 3);
    assert!(stats.workers.recycled >= 1);

    dispatcher.shutdown();
    assert_ok!(assert_ok!(runner.await));
}

#[tokio::test]
async fn panicking_task_is_isolated() {
    let dispatcher = echo_dispatcher(config(2, 100)).await;
    dispatcher
        .register_handler(
            "app.tasks.panics",
            handler_fn(|_ctx: TaskContext| async move {
                if true {
                    panic!("corrupt document");
                }
                Ok(Vec::new())
            }),
        )
        .await;

    let bad = assert_ok!(dispatcher.enqueue("app.tasks.panics", Vec::new(), EnqueueOptions::new()).await);
    let good = assert_ok!(dispatcher.enqueue("app.tasks.echo", b"ok".to_vec(), EnqueueOptions::new()).await);
    let reports = assert_ok!(dispatcher.run_until_idle().await);
    assert_eq!(reports.len(), 2);

    let client = TaskClient::new(dispatcher);
    let err = assert_err!(client.wait_for_result(bad, None).await);
    assert!(matches!(err, DispatchError::TaskFailure { .. }));
    assert_eq!(assert_ok!(client.wait_for_result(good, None).await), b"ok".to_vec());
}

#[tokio::test]
async fn shutdown_stops_an_idle_dispatcher() {
    let dispatcher = echo_dispatcher(config(2, 100)).await;
    let runner = tokio::spawn(dispatcher.clone().run());
    tokio::time::sleep(Duration::from_millis(30)).await;

    dispatcher.shutdown();
    let stopped = tokio::time::timeout(Duration::from_secs(2), runner).await;
    assert!(stopped.is_ok());
    assert!(dispatcher.is_shutting_down());
}
