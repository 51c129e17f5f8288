//! Fieldsync agent - runs the standard client services headless.

use std::error::Error;

use serde_json::json;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use fieldsync_runtime::sync::LocalStore;
use fieldsync_runtime::{Config, Runtime, RuntimeContext};

fn main() -> Result<(), Box<dyn Error>> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "fieldsync_runtime=debug,fieldsync_agent=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    dotenvy::dotenv().ok();
    let config = Config::from_env()?;

    // Network calls run on their own runtime so slow requests never stall
    // the service graph.
    let net = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(2)
        .thread_name("fieldsync-net")
        .enable_all()
        .build()?;
    let main = tokio::runtime::Builder::new_multi_thread()
        .thread_name("fieldsync-main")
        .enable_all()
        .build()?;

    let ctx = RuntimeContext::new(config, net.handle().clone());
    let outcome = main.block_on(run(ctx));
    net.shutdown_background();
    outcome
}

async fn run(ctx: RuntimeContext) -> Result<(), Box<dyn Error>> {
    tracing::info!(
        backend = %ctx.config().backend.base_url(),
        device = %ctx.config().device_id,
        "starting fieldsync agent"
    );

    let survey = LocalStore::with_layers("survey", ["plots", "trees"]);
    let runtime = Runtime::builder(ctx).store(survey).build().await?;
    runtime.start().await?;

    if let Some(store) = runtime.data.store("survey") {
        let plot = store
            .insert("plots", json!({ "name": "agent heartbeat", "source": "fieldsync-agent" }))
            .await?;
        tracing::info!(key = %plot.key, "recorded startup feature");
    }

    tokio::signal::ctrl_c().await?;
    tracing::info!("shutting down");
    runtime.shutdown().await?;
    Ok(())
}
