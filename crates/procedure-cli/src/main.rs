use async_trait::async_trait;
use serde::Deserialize;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use tokio::time::Duration;

use procedure_core::procedure::BlockObserver;
use procedure_core::repeat::payloads_from_fn;
use procedure_core::{
    Condition, GroupProcedure, Procedure, ProcedureContext, ProcedureError, ProcedureQueue,
    QueueConfig, RetryProcedure, WaitStrategy, Work,
};

const CONFIG_ENV: &str = "PROCEDURE_QUEUE_CONFIG";

#[derive(Debug, Deserialize)]
struct HelloPayload {
    name: String,
}

/// Says hello, after failing a configured number of times.
struct HelloWork {
    payload: Vec<u8>,
    remaining_failures: Arc<AtomicU32>,
}

#[async_trait]
impl Work for HelloWork {
    async fn execute(&self, _ctx: ProcedureContext) -> Result<(), ProcedureError> {
        let p: HelloPayload = serde_json::from_slice(&self.payload).map_err(ProcedureError::custom)?;

        let left = self.remaining_failures.load(Ordering::Relaxed);
        if left > 0 {
            self.remaining_failures.fetch_sub(1, Ordering::Relaxed);
            return Err(ProcedureError::failed(format!(
                "intentional failure (left={left})"
            )));
        }

        println!("Hello, {}!", p.name);
        Ok(())
    }
}

fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .try_init();
}

/// Queue settings from `PROCEDURE_QUEUE_CONFIG` (JSON), defaults otherwise.
fn load_config() -> QueueConfig {
    match std::env::var(CONFIG_ENV) {
        Ok(json) => QueueConfig::from_json(&json).unwrap_or_else(|err| {
            tracing::warn!(%err, "ignoring invalid {CONFIG_ENV}");
            QueueConfig::default()
        }),
        Err(_) => QueueConfig::named("main"),
    }
}

fn report(label: &str, procedure: &Procedure) {
    println!(
        "{label}: status={:?} errors={:?}",
        procedure.status(),
        procedure
            .errors()
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
    );
}

#[tokio::main]
async fn main() -> Result<(), ProcedureError> {
    init_tracing();

    // (A) queue
    let queue = ProcedureQueue::with_config(load_config());

    // (B) retry: hello fails twice, then succeeds on the third attempt
    let failures = Arc::new(AtomicU32::new(2));
    let payload = serde_json::to_vec(&serde_json::json!({ "name": "procedures" }))
        .map_err(ProcedureError::custom)?;
    let retry = RetryProcedure::new(
        "hello",
        payloads_from_fn(
            WaitStrategy::Exponential {
                period: Duration::from_millis(50),
                max: Duration::from_millis(400),
            },
            move || {
                Procedure::new(
                    "hello.attempt",
                    HelloWork {
                        payload: payload.clone(),
                        remaining_failures: Arc::clone(&failures),
                    },
                )
            },
        ),
    )
    .max(5);

    // (C) group: two writers sharing a category run one at a time
    let writer = |name: &'static str| {
        let procedure = Procedure::block(name, move |_ctx| async move {
            println!("{name}: writing");
            tokio::time::sleep(Duration::from_millis(20)).await;
            Ok(())
        });
        procedure.add_condition(Condition::mutually_exclusive("journal"))?;
        Ok::<_, ProcedureError>(procedure)
    };
    let group = GroupProcedure::new("writers", vec![writer("writer-a")?, writer("writer-b")?]);
    group.procedure().add_dependency(retry.procedure())?;
    group
        .procedure()
        .add_observer(BlockObserver::new().on_did_add(|group, child| {
            println!("{} started {}", group.name(), child.name());
        }));

    // (D) a procedure whose condition is never met is cancelled
    let skipped = Procedure::block("skipped", |_ctx| async { Ok(()) });
    skipped.add_condition(Condition::always_false())?;

    queue.add_all([
        retry.procedure().clone(),
        group.procedure().clone(),
        skipped.clone(),
    ])?;

    // (E) wait for everything
    queue.wait_until_empty().await;

    println!("retry attempts: {}", retry.count());
    report("hello", retry.procedure());
    report("writers", group.procedure());
    report("skipped", &skipped);
    Ok(())
}
