//! Concurrent setup of node groups for test and demo topologies.

use std::future::Future;
use std::panic::AssertUnwindSafe;

use futures::FutureExt;
use thiserror::Error;
use tokio::task::JoinSet;
use tracing::{debug, warn};

use crate::context::Context;

/// Anything with a lifetime context. A value whose context has already
/// ended is treated as a failed instance.
pub trait Live {
    fn context(&self) -> &Context;

    fn is_live(&self) -> bool {
        !self.context().is_done()
    }
}

/// Errors that abort a [`setup_group`] call. The first one observed wins.
#[derive(Debug, Error)]
pub enum SetupError {
    #[error("Group member {index} failed to start: {reason}")]
    Failed { index: usize, reason: String },

    #[error("Group member {index} panicked during setup")]
    Panicked { index: usize },

    #[error("Group member {index} started with an already ended context")]
    NotLive { index: usize },
}

/// Invoke `factory` `n` times concurrently and wait for every instance.
///
/// Instances are returned in completion order. On the first failure the
/// remaining setups are aborted and the error is returned. A panic, whether
/// in `factory` itself or in the future it returns, is a failure too.
pub async fn setup_group<N, F, Fut>(n: usize, factory: F) -> Result<Vec<N>, SetupError>
where
    N: Live + Send + 'static,
    F: Fn() -> Fut,
    Fut: Future<Output = anyhow::Result<N>> + Send + 'static,
{
    let mut tasks = JoinSet::new();
    for index in 0..n {
        let setup = match std::panic::catch_unwind(AssertUnwindSafe(&factory)) {
            Ok(setup) => AssertUnwindSafe(setup).catch_unwind(),
            Err(_panic) => {
                let err = SetupError::Panicked { index };
                warn!(error = %err, "group setup failed, aborting remaining members");
                tasks.abort_all();
                return Err(err);
            }
        };
        tasks.spawn(async move { (index, setup.await) });
    }

    let mut nodes = Vec::with_capacity(n);
    while let Some(joined) = tasks.join_next().await {
        let err = match joined {
            Ok((index, Ok(Ok(node)))) => {
                if node.is_live() {
                    debug!(index, "group member ready");
                    nodes.push(node);
                    continue;
                }
                SetupError::NotLive { index }
            }
            Ok((index, Ok(Err(e)))) => SetupError::Failed {
                index,
                reason: format!("{e:#}"),
            },
            Ok((index, Err(_panic))) => SetupError::Panicked { index },
            // Members catch their own panics, so only an external abort lands here.
            Err(e) => SetupError::Failed {
                index: nodes.len(),
                reason: e.to_string(),
            },
        };
        warn!(error = %err, "group setup failed, aborting remaining members");
        tasks.abort_all();
        return Err(err);
    }
    Ok(nodes)
}
