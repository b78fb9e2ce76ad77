//! Bounded fan-out / fan-in for initialization tasks.

use std::future::Future;
use std::sync::Arc;

use tokio::sync::Semaphore;
use tokio::task::JoinSet;

/// Maximum number of provider initializations in flight, shared by every phase.
pub const CONCURRENT_LOAD_LIMIT: usize = 5;

/// Run every task with at most `limit` in flight and return once all have finished.
///
/// A failing or panicking task never cancels the others.
pub async fn run_bounded<I, F>(tasks: I, limit: usize)
where
    I: IntoIterator<Item = F>,
    F: Future<Output = ()> + Send + 'static,
{
    let permits = Arc::new(Semaphore::new(limit.max(1)));
    let mut set = JoinSet::new();

    for task in tasks {
        // Acquire before spawning so at most `limit` tasks exist at once
        let Ok(permit) = permits.clone().acquire_owned().await else {
            break;
        };
        set.spawn(async move {
            let _permit = permit;
            task.await;
        });
    }

    while let Some(res) = set.join_next().await {
        if let Err(e) = res {
            tracing::error!(error = %e, "Initialization task aborted");
        }
    }
}
