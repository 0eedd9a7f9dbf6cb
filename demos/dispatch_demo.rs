//! Dispatch demo
//!
//! This example demonstrates how to:
//! 1. Register task handlers on an in-process dispatcher
//! 2. Submit tasks that land on different priority queues
//! 3. Watch soft and hard time limits fire
//! 4. Trigger a task periodically with the beat scheduler
//!
//! Run: cargo run --example dispatch_demo

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use task_dispatch::logging::init_tracing;
use task_dispatch::{
    handler_fn, BeatEntry, BeatScheduler, Config, Dispatcher, EnqueueOptions, ScheduleExpression,
    TaskClient, TaskContext,
};
use tracing::{info, warn};

#[derive(Debug, Serialize, Deserialize)]
struct ProcessDocument {
    document_id: u64,
    pages: u32,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config = Config {
        worker_pool_size: 2,
        worker_max_tasks_per_child: 3,
        dispatch_poll_interval_ms: 50,
        ..Config::default()
    }
    .with_env_overrides();
    init_tracing(&config.logging)?;

    let dispatcher = Arc::new(Dispatcher::in_memory(config)?);

    dispatcher
        .register_handler(
            "app.tasks.document_tasks.task_process_document",
            handler_fn(|ctx: TaskContext| async move {
                let doc: ProcessDocument = serde_json::from_slice(&ctx.payload)?;
                tokio::time::sleep(Duration::from_millis(20 * u64::from(doc.pages))).await;
                info!("Processed document {} ({} pages)", doc.document_id, doc.pages);
                Ok::<_, anyhow::Error>(serde_json::to_vec(&doc.pages)?)
            }),
        )
        .await;

    dispatcher
        .register_handler(
            "app.tasks.document_tasks.task_generate_embeddings",
            handler_fn(|mut ctx: TaskContext| async move {
                // works in chunks until asked to stop
                let mut chunks = 0u32;
                loop {
                    tokio::select! {
                        _ = ctx.soft_limit.raised() => {
                            warn!("Soft limit reached after {} chunks, returning partial result", chunks);
                            return Ok::<_, anyhow::Error>(serde_json::to_vec(&chunks)?);
                        }
                        _ = tokio::time::sleep(Duration::from_millis(25)) => chunks += 1,
                    }
                }
            }),
        )
        .await;

    dispatcher
        .register_handler(
            "app.tasks.maintenance.runaway",
            handler_fn(|_ctx: TaskContext| async move {
                tokio::time::sleep(Duration::from_secs(60)).await;
                Ok(Vec::new())
            }),
        )
        .await;

    let client = TaskClient::new(dispatcher.clone());
    let runner = tokio::spawn(dispatcher.clone().run());

    info!("Submitting tasks...");
    let mut documents = Vec::new();
    for i in 0..5 {
        let doc = ProcessDocument {
            document_id: i,
            pages: (i as u32 % 3) + 1,
        };
        documents.push(
            client
                .submit("app.tasks.document_tasks.task_process_document", &doc)
                .await?,
        );
    }

    let embeddings = client
        .submit_with_options(
            "app.tasks.document_tasks.task_generate_embeddings",
            &serde_json::json!({ "document_id": 1 }),
            EnqueueOptions::new()
                .soft_limit(Duration::from_millis(300))
                .hard_limit(Duration::from_secs(2)),
        )
        .await?;

    let runaway = client
        .enqueue(
            "app.tasks.maintenance.runaway",
            Vec::new(),
            EnqueueOptions::new()
                .queue("low_priority")
                .hard_limit(Duration::from_millis(500)),
        )
        .await?;

    let beat = Arc::new(
        BeatScheduler::new(Arc::new(client.clone())).with_tick(Duration::from_millis(250)),
    );
    let mut entry = BeatEntry::new(
        "reprocess-sample",
        "app.tasks.document_tasks.task_process_document",
        ScheduleExpression::EverySeconds(1),
    );
    entry.payload = serde_json::json!({ "document_id": 99, "pages": 1 });
    beat.add_entry(entry).await;
    let beat_runner = {
        let beat = beat.clone();
        tokio::spawn(async move { beat.start().await })
    };

    for id in documents {
        let pages: u32 = client.wait_for_json(id, Some(Duration::from_secs(10))).await?;
        info!("Document task {} returned {} pages", id, pages);
    }

    let chunks: u32 = client
        .wait_for_json(embeddings, Some(Duration::from_secs(10)))
        .await?;
    info!("Embeddings finished {} chunks before the soft limit", chunks);

    match client.wait_for_result(runaway, Some(Duration::from_secs(10))).await {
        Ok(_) => warn!("Runaway task unexpectedly finished"),
        Err(e) => info!("Runaway task stopped: {}", e),
    }

    tokio::time::sleep(Duration::from_secs(2)).await;
    info!("Scheduler stats: {:?}", beat.get_stats().await);
    info!("Dispatcher stats: {:?}", client.stats().await);

    beat.shutdown();
    dispatcher.shutdown();
    beat_runner.await??;
    runner.await??;

    Ok(())
}
