//! Backend selection and wiring.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Args;
use miette::Result;
use tracing::info;

use ideaforge_engine::{Actor, Backend, LocalBackend, MutationCoordinator, RemoteBackend};
use ideaforge_store::{CacheConfig, DataAccess, ExecutorConfig, RestRowStore};

#[derive(Args, Debug, Clone)]
pub struct Config {
    /// Base URL of the remote row store. Without it a local file is used.
    #[arg(long, global = true, env = "IDEAFORGE_STORE_URL")]
    pub store_url: Option<String>,

    /// API key for the remote row store
    #[arg(long, global = true, env = "IDEAFORGE_API_KEY", hide_env_values = true)]
    pub api_key: Option<String>,

    /// Signed-in user's access token for the remote row store
    #[arg(long, global = true, env = "IDEAFORGE_ACCESS_TOKEN", hide_env_values = true)]
    pub access_token: Option<String>,

    /// Local data file [default: <data dir>/ideaforge/data.json]
    #[arg(long, global = true, env = "IDEAFORGE_DATA_FILE")]
    pub data_file: Option<PathBuf>,

    /// Id of the acting user
    #[arg(long, global = true, env = "IDEAFORGE_USER", default_value = "local")]
    pub user: String,

    /// Display name of the acting user [default: the user id]
    #[arg(long, global = true, env = "IDEAFORGE_USER_NAME")]
    pub user_name: Option<String>,

    /// Per-attempt deadline for remote calls, in seconds
    #[arg(long, global = true, default_value = "12")]
    pub timeout_secs: u64,

    /// Lifetime of cached remote reads, in milliseconds
    #[arg(long, global = true, default_value = "5000")]
    pub cache_ms: u64,
}

impl Config {
    fn actor(&self) -> Actor {
        let name = self.user_name.clone().unwrap_or_else(|| self.user.clone());
        Actor::new(self.user.clone(), name)
    }
}

pub struct App {
    pub coordinator: MutationCoordinator,
    /// Present when talking to the remote store.
    access: Option<Arc<DataAccess>>,
}

impl App {
    pub async fn connect(config: &Config) -> Result<Self> {
        let actor = config.actor();

        let (backend, access) = match &config.store_url {
            Some(url) => {
                let api_key = config
                    .api_key
                    .as_deref()
                    .ok_or_else(|| miette::miette!("--api-key is required with --store-url"))?;
                let store = RestRowStore::new(url.as_str(), api_key)
                    .map_err(|e| miette::miette!("failed to create store client: {}", e))?;
                if let Some(token) = &config.access_token {
                    store.set_access_token(Some(token.clone())).await;
                }

                let access = Arc::new(
                    DataAccess::builder(Arc::new(store))
                        .executor_config(ExecutorConfig {
                            timeout: Duration::from_secs(config.timeout_secs),
                            ..ExecutorConfig::default()
                        })
                        .cache_config(CacheConfig {
                            default_ttl: Duration::from_millis(config.cache_ms),
                        })
                        .build(),
                );
                info!(url = %url, user = %actor.id, "using remote store");
                let backend: Arc<dyn Backend> = Arc::new(RemoteBackend::new(Arc::clone(&access)));
                (backend, Some(access))
            }
            None => {
                let path = config
                    .data_file
                    .clone()
                    .unwrap_or_else(crate::default_data_file);
                let backend = LocalBackend::open(path)
                    .await
                    .map_err(|e| miette::miette!("{}", e))?;
                let backend: Arc<dyn Backend> = Arc::new(backend);
                (backend, None)
            }
        };

        Ok(Self {
            coordinator: MutationCoordinator::new(backend, actor),
            access,
        })
    }

    pub fn backend(&self) -> &Arc<dyn Backend> {
        self.coordinator.backend()
    }

    pub fn actor(&self) -> &Actor {
        self.coordinator.actor()
    }

    /// Print the remote store's recent failures and cache counters.
    pub fn report_diagnostics(&self) {
        let Some(access) = &self.access else {
            eprintln!("diagnostics: local backend, nothing to report");
            return;
        };

        let stats = access.cache_stats();
        eprintln!(
            "cache: {} hits, {} misses, {} coalesced, {} forced",
            stats.hits, stats.misses, stats.coalesced, stats.forced
        );
        let recent = access.diagnostics().recent(10);
        if recent.is_empty() {
            eprintln!("no store failures");
        }
        for record in recent {
            eprintln!(
                "{} {:?} {}: {}{}",
                record.timestamp.to_rfc3339(),
                record.stage,
                record.table,
                record.message,
                record
                    .hint
                    .map(|h| format!(" (hint: {})", h))
                    .unwrap_or_default()
            );
        }
    }
}
