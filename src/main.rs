use anyhow::Context;
use metagraph_store::config::AppConfig;
use metagraph_store::logic::{hook_channel, HookConsumer};
use metagraph_store::seed;
use metagraph_store::{EntityStore, HookMessage, InMemoryGraph};
use std::io::{BufRead, BufReader};
use std::sync::Arc;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables from .env file if it exists
    dotenvy::dotenv().ok();

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config = AppConfig::load()?;
    println!(
        "Configuration loaded: delete_mode={:?} max_retries={}",
        config.repository.delete_mode, config.consumer.max_retries
    );

    let registry = Arc::new(seed::catalog_registry()?);
    let graph = Arc::new(InMemoryGraph::new());
    let store = Arc::new(EntityStore::new(graph.clone(), registry, config.clone()));
    let consumer = Arc::new(HookConsumer::new(store, config.consumer.clone()));

    let (sender, receiver) = hook_channel(&config.consumer);
    let driver = tokio::spawn(consumer.run(receiver));

    // Messages come from the file named by the first argument, or stdin
    let input: Box<dyn BufRead + Send> = match std::env::args().nth(1) {
        Some(path) => {
            let file = std::fs::File::open(&path).with_context(|| format!("opening {}", path))?;
            Box::new(BufReader::new(file))
        }
        None => Box::new(BufReader::new(std::io::stdin())),
    };

    let mut received = 0usize;
    let mut unparsable = 0usize;
    for (number, line) in input.lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<HookMessage>(&line) {
            Ok(message) => {
                received += 1;
                sender.send(message).await.context("hook consumer stopped")?;
            }
            Err(e) => {
                unparsable += 1;
                log::warn!("line {}: not a hook message: {}", number + 1, e);
            }
        }
    }
    drop(sender);

    let processed = driver.await?;
    println!(
        "Ingested {} of {} messages ({} unparsable, {} dropped); graph has {} vertices and {} edges",
        processed,
        received,
        unparsable,
        received - processed,
        graph.vertex_count(),
        graph.edge_count()
    );

    Ok(())
}
