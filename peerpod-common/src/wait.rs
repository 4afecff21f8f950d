use crate::error::ProviderError;
use std::future::Future;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Poll `judgement` until it reports done, fails, the budget runs out, or `ctx` is cancelled.
///
/// - `Ok(true)` finishes the wait
/// - `Ok(false)` retries after `interval`
/// - `Err(_)` aborts immediately with that error
///
/// Running out of budget yields `ProviderError::Timeout`, cancellation yields
/// `ProviderError::Cancelled`.
pub async fn wait_until<F, Fut>(
    ctx: &CancellationToken,
    what: &str,
    timeout: Duration,
    interval: Duration,
    mut judgement: F,
) -> anyhow::Result<()>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = anyhow::Result<bool>>,
{
    wait_for(ctx, what, timeout, interval, || {
        let poll = judgement();
        async move { Ok(poll.await?.then_some(())) }
    })
    .await
}

/// Like [`wait_until`], but the judgement hands back the value it was waiting for.
pub async fn wait_for<T, F, Fut>(
    ctx: &CancellationToken,
    what: &str,
    timeout: Duration,
    interval: Duration,
    mut judgement: F,
) -> anyhow::Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = anyhow::Result<Option<T>>>,
{
    if timeout.is_zero() {
        return Err(ProviderError::ConfigInvalid(format!(
            "wait budget for {} must be greater than zero",
            what
        ))
        .into());
    }

    let started = Instant::now();
    loop {
        if ctx.is_cancelled() {
            return Err(ProviderError::Cancelled.into());
        }
        if let Some(value) = judgement().await? {
            return Ok(value);
        }

        let elapsed = started.elapsed();
        if elapsed >= timeout {
            return Err(ProviderError::Timeout {
                what: what.to_string(),
                timeout,
            }
            .into());
        }

        let nap = interval.min(timeout - elapsed);
        tokio::select! {
            _ = tokio::time::sleep(nap) => {}
            _ = ctx.cancelled() => return Err(ProviderError::Cancelled.into()),
        }
    }
}
