//! Per-language registry of language-server clients.
//!
//! Clients are created lazily on first use of a language and cached; a
//! per-language slot mutex guarantees at most one live client per language
//! even under concurrent first-uses. Start failures are cached for a short
//! cooldown so enrichment does not re-spawn a broken server on every node.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{anyhow, Result};
use dashmap::DashMap;
use tokio::sync::Mutex;
use tokio::time::{timeout, Duration, Instant};
use tracing::{debug, info, warn};

use crate::language::{self, Language};
use crate::lsp_client::LspClient;
use crate::toolchain::ExecutableResolver;

const START_FAILURE_COOLDOWN: Duration = Duration::from_secs(60);
const CLOSE_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Default)]
struct Slot {
    client: Option<Arc<LspClient>>,
    failed_at: Option<Instant>,
}

pub struct LspFleet {
    workspace_root: PathBuf,
    resolver: Arc<dyn ExecutableResolver>,
    slots: DashMap<Language, Arc<Mutex<Slot>>>,
}

impl LspFleet {
    pub fn new(workspace_root: &Path, resolver: Arc<dyn ExecutableResolver>) -> Self {
        Self {
            workspace_root: workspace_root.to_path_buf(),
            resolver,
            slots: DashMap::new(),
        }
    }

    /// The started, initialized client for `language`, creating it on first
    /// use. Errors when no server executable is available or the server
    /// recently failed to start (cooldown).
    pub async fn client(&self, language: Language) -> Result<Arc<LspClient>> {
        let slot = self
            .slots
            .entry(language)
            .or_insert_with(|| Arc::new(Mutex::new(Slot::default())))
            .clone();
        let mut slot = slot.lock().await;

        if let Some(client) = &slot.client {
            if !client.is_closed() {
                return Ok(client.clone());
            }
            debug!("{language} client died, dropping it from the fleet");
            slot.client = None;
        }

        if let Some(failed_at) = slot.failed_at {
            if failed_at.elapsed() < START_FAILURE_COOLDOWN {
                return Err(anyhow!(
                    "{language} language server is unavailable (retry in {:?})",
                    START_FAILURE_COOLDOWN - failed_at.elapsed()
                ));
            }
            slot.failed_at = None;
        }

        match self.start(language).await {
            Ok(client) => {
                let client = Arc::new(client);
                slot.client = Some(client.clone());
                Ok(client)
            }
            Err(e) => {
                warn!("failed to start {language} language server: {e:#}");
                slot.failed_at = Some(Instant::now());
                Err(e)
            }
        }
    }

    async fn start(&self, language: Language) -> Result<LspClient> {
        let spec = language::spec_for(language)
            .ok_or_else(|| anyhow!("no language server configured for {language}"))?;
        let command = self.resolver.resolve(spec)?;
        let client = LspClient::spawn(spec, &command, &self.workspace_root)?;
        client.initialize(&self.workspace_root).await?;
        Ok(client)
    }

    /// Shut down every cached client in parallel, bounded by a timeout.
    pub async fn close(&self) {
        let clients: Vec<Arc<LspClient>> = self
            .slots
            .iter()
            .filter_map(|entry| entry.value().try_lock().ok().and_then(|s| s.client.clone()))
            .collect();
        if clients.is_empty() {
            return;
        }
        info!("shutting down {} language server(s)", clients.len());
        let shutdowns = clients.iter().map(|client| client.shutdown());
        if timeout(CLOSE_TIMEOUT, futures::future::join_all(shutdowns))
            .await
            .is_err()
        {
            warn!("language server shutdown timed out after {CLOSE_TIMEOUT:?}");
        }
        self.slots.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::language::LanguageSpec;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct FailingResolver {
        calls: AtomicUsize,
    }

    impl ExecutableResolver for FailingResolver {
        fn resolve(&self, spec: &LanguageSpec) -> Result<PathBuf> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Err(anyhow!("no executable for {}", spec.language))
        }
    }

    #[tokio::test]
    async fn start_failure_is_cached_for_cooldown() {
        let resolver = Arc::new(FailingResolver {
            calls: AtomicUsize::new(0),
        });
        let fleet = LspFleet::new(Path::new("/tmp"), resolver.clone());

        assert!(fleet.client(Language::Go).await.is_err());
        assert!(fleet.client(Language::Go).await.is_err());
        assert!(fleet.client(Language::Go).await.is_err());
        // Only the first attempt hits the resolver; the rest are cooled down.
        assert_eq!(resolver.calls.load(Ordering::SeqCst), 1);

        // A different language gets its own slot and its own attempt.
        assert!(fleet.client(Language::Python).await.is_err());
        assert_eq!(resolver.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn close_with_no_clients_is_a_no_op() {
        let resolver = Arc::new(FailingResolver {
            calls: AtomicUsize::new(0),
        });
        let fleet = LspFleet::new(Path::new("/tmp"), resolver);
        fleet.close().await;
    }
}
