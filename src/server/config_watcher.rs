use crate::server::runner::Reloader;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::time::{interval, Instant};
use tokio_util::sync::CancellationToken;

const POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Quiet period after the last observed change before a reload fires, so a
/// burst of writes (or a rename-and-rewrite) triggers a single reload
const DEBOUNCE: Duration = Duration::from_secs(2);

/// Watches the config file for writes and renames and applies a debounced
/// reload. Both kinds of edit surface as a metadata change of the path.
pub struct ConfigWatcher {
    reloader: Arc<Reloader>,
    path: PathBuf,
    token: CancellationToken,
}

impl ConfigWatcher {
    pub fn new(reloader: Arc<Reloader>, path: PathBuf, token: CancellationToken) -> Self {
        Self {
            reloader,
            path,
            token,
        }
    }

    pub fn spawn(self) {
        tokio::spawn(async move {
            self.run().await;
        });
    }

    async fn run(self) {
        tracing::debug!("watch config => {}", self.path.display());
        let mut ticker = interval(POLL_INTERVAL);
        let mut last_seen = fingerprint(&self.path);
        let mut pending: Option<Instant> = None;

        loop {
            tokio::select! {
                _ = self.token.cancelled() => break,
                _ = ticker.tick() => {}
            }

            let current = fingerprint(&self.path);
            if current != last_seen {
                tracing::debug!("config file changed => {}", self.path.display());
                last_seen = current;
                pending = Some(Instant::now());
            }

            if let Some(since) = pending {
                if since.elapsed() >= DEBOUNCE {
                    pending = None;
                    self.reloader.apply().await;
                }
            }
        }
        tracing::debug!("config watcher stopped");
    }
}

fn fingerprint(path: &PathBuf) -> Option<(SystemTime, u64)> {
    let meta = std::fs::metadata(path).ok()?;
    Some((meta.modified().ok()?, meta.len()))
}
