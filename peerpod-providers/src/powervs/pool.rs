//! Pre-warmed idle VMs handed out ahead of cold creates.

use anyhow::{anyhow, Result};
use backoff::backoff::Backoff;
use peerpod_common::{Instance, ProviderError};
use std::collections::VecDeque;
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Cap on one connection attempt to a pooled VM's user-data daemon.
pub const PUD_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
pub struct PooledInstance {
    pub instance: Instance,
    pub alive: bool,
}

/// FIFO of idle VMs. Only the create path and the sweeper touch it.
pub struct WarmPool {
    target: usize,
    entries: Mutex<VecDeque<PooledInstance>>,
}

impl WarmPool {
    pub fn new(target: usize) -> Self {
        Self {
            target,
            entries: Mutex::new(VecDeque::new()),
        }
    }

    pub fn target(&self) -> usize {
        self.target
    }

    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.lock().await.is_empty()
    }

    /// How many VMs the pool is short of its target.
    pub async fn deficit(&self) -> usize {
        self.target.saturating_sub(self.len().await)
    }

    pub async fn push(&self, instance: Instance) {
        self.entries.lock().await.push_back(PooledInstance {
            instance,
            alive: true,
        });
    }

    pub async fn take(&self) -> Option<Instance> {
        self.entries.lock().await.pop_front().map(|p| p.instance)
    }

    pub async fn ids(&self) -> Vec<String> {
        self.entries
            .lock()
            .await
            .iter()
            .map(|p| p.instance.id.clone())
            .collect()
    }

    /// Flag `dead` entries and drop them; returns what was removed.
    pub async fn evict(&self, dead: &[String]) -> Vec<Instance> {
        let mut entries = self.entries.lock().await;
        for entry in entries.iter_mut() {
            if dead.contains(&entry.instance.id) {
                entry.alive = false;
            }
        }
        let (keep, gone): (VecDeque<_>, VecDeque<_>) = entries.drain(..).partition(|p| p.alive);
        *entries = keep;
        gone.into_iter().map(|p| p.instance).collect()
    }

    pub async fn drain(&self) -> Vec<Instance> {
        self.entries.lock().await.drain(..).map(|p| p.instance).collect()
    }
}

/// Stream `data` to the user-data daemon at `ip:port`, retrying with backoff until it
/// lands or `ctx` is cancelled.
pub async fn deliver_user_data(ctx: &CancellationToken, ip: IpAddr, port: u16, data: &[u8]) -> Result<()> {
    let addr = SocketAddr::new(ip, port);
    let mut backoff = backoff::ExponentialBackoffBuilder::new()
        .with_initial_interval(Duration::from_millis(100))
        .with_max_interval(PUD_CONNECT_TIMEOUT)
        .with_max_elapsed_time(None)
        .build();

    let mut attempt = 0u32;
    loop {
        if ctx.is_cancelled() {
            return Err(ProviderError::Cancelled.into());
        }
        attempt += 1;
        match send_once(addr, data).await {
            Ok(()) => {
                info!("user data delivered to {} ({} bytes)", addr, data.len());
                return Ok(());
            }
            Err(e) => debug!("user data delivery to {} failed (attempt {}): {:#}", addr, attempt, e),
        }
        let delay = backoff.next_backoff().unwrap_or(PUD_CONNECT_TIMEOUT);
        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = ctx.cancelled() => return Err(ProviderError::Cancelled.into()),
        }
    }
}

async fn send_once(addr: SocketAddr, data: &[u8]) -> Result<()> {
    let mut stream = tokio::time::timeout(PUD_CONNECT_TIMEOUT, TcpStream::connect(addr))
        .await
        .map_err(|_| anyhow!("no answer within {:?}", PUD_CONNECT_TIMEOUT))??;
    stream.write_all(data).await?;
    stream.shutdown().await?;
    Ok(())
}
