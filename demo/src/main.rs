use anyhow::{anyhow, Result};
use std::sync::Arc;
use std::thread;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

use liaison::manager::ManagerCall;
use liaison::{
    AccessIntent, CoordinatorConfig, InMemoryManager, Locale, PortableToken, Retention, ScopeExit,
    TransactionCoordinator,
};

const WORKERS: usize = 4;

fn main() -> Result<()> {
    // Set up logging
    let subscriber = FmtSubscriber::builder()
        .with_max_level(Level::INFO)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let manager = Arc::new(InMemoryManager::new());
    let coordinator = TransactionCoordinator::with_config(manager.clone(), CoordinatorConfig::compact())?;

    let ctx = coordinator
        .create_context()?
        .with_access(AccessIntent::Write)
        .with_retention(Retention::PersistentHint)
        .with_locale(Locale::new("locale:publish").with_field("shot", "sh010"));
    info!("Host context: {}", ctx);

    // Several publishes coalesced into one manager transaction
    info!("=== Nested action group ===");
    coordinator.scoped(&ctx, |_| -> liaison::Result<()> {
        for layer in ["geo", "lookdev", "lighting"] {
            coordinator.scoped(&ctx, |scope| -> liaison::Result<()> {
                info!("Publishing {} at depth {}", layer, scope.depth());
                Ok(())
            })?;
        }
        Ok(())
    })?;

    // Hand the context to farm workers as bytes
    info!("=== Distributed workers ===");
    let frozen = coordinator.freeze(&ctx)?.into_bytes();
    info!("Frozen context is {} bytes", frozen.len());

    thread::scope(|s| -> Result<()> {
        let workers: Vec<_> = (0..WORKERS)
            .map(|worker| {
                let manager = manager.clone();
                let frozen = frozen.clone();
                s.spawn(move || -> Result<()> {
                    let local = TransactionCoordinator::new(manager);
                    let ctx = local.thaw(&PortableToken::from_bytes(frozen))?;
                    let output = local.create_child_context(&ctx)?;
                    info!("Worker {} rendering into {}", worker, output.state_token());

                    // one worker drives the follow-up transaction on the shared token
                    if worker == 0 {
                        let scope = local.scoped_enter(&ctx)?;
                        if scope.release()? != ScopeExit::Finished {
                            return Err(anyhow!("follow-up action group did not finish"));
                        }
                    }
                    Ok(())
                })
            })
            .collect();
        for handle in workers {
            handle.join().map_err(|_| anyhow!("worker panicked"))??;
        }
        Ok(())
    })?;

    info!("=== Manager call log ===");
    for call in manager.calls() {
        match call {
            ManagerCall::CreateState { parent: Some(parent) } => info!("create state (child of {})", parent),
            ManagerCall::CreateState { parent: None } => info!("create state"),
            other => info!("{} {:?}", other.boundary(), other),
        }
    }
    info!("Coordinator stats: {:?}", coordinator.stats());

    Ok(())
}
