use anyhow::{Context, Result};
use axum::Router;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::api::{self, ApiState};
use crate::bus::{Bus, Fanout, PgBus};
use crate::config::{BusBackend, Config};
use crate::crypto::{TokenAuthenticator, UserTokenVerifier};
use crate::db::{self, PgOfflineQueue, PgRecordStore};
use crate::hub::{Hub, HubConfig};
use crate::jobs;
use crate::offline_queue::{OfflineQueue, DEFAULT_QUEUE_CAPACITY};
use crate::presence::PresenceTracker;
use crate::processor::ActionProcessor;
use crate::status_cache::StatusCache;
use crate::store::RecordStore;

/// Per-user broadcast capacity. A connection this far behind is dropped.
const BUS_CAPACITY: usize = 1024;

/// Every server-side service, wired together and owned in one place.
pub struct App {
    pub config: Config,
    pub store: RecordStore,
    pub presence: PresenceTracker,
    pub offline: OfflineQueue,
    pub bus: Bus,
    pub processor: ActionProcessor,
    pub authenticator: TokenAuthenticator,
    pub user_tokens: UserTokenVerifier,
    pub hub: Arc<Hub>,
    shutdown_tx: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

impl App {
    pub async fn build(config: Config) -> Result<Self> {
        let (store, offline, bus) = match &config.database_url {
            Some(url) => {
                let pool = db::init_db_pool(url)
                    .await
                    .context("Failed to initialize database")?;
                let bus = match config.bus_backend {
                    BusBackend::Local => Bus::local(BUS_CAPACITY),
                    BusBackend::Postgres => Bus::Postgres(PgBus::new(pool.clone(), BUS_CAPACITY)),
                };
                (
                    RecordStore::Postgres(PgRecordStore::new(pool.clone())),
                    OfflineQueue::Postgres(PgOfflineQueue::new(pool, DEFAULT_QUEUE_CAPACITY)),
                    bus,
                )
            }
            None => {
                warn!("DATABASE_URL not set, running with in-memory storage");
                (
                    RecordStore::memory(),
                    OfflineQueue::memory(DEFAULT_QUEUE_CAPACITY),
                    Bus::local(BUS_CAPACITY),
                )
            }
        };

        let presence = PresenceTracker::new(config.presence_window, config.presence_ttl);
        let devices = store
            .list_devices()
            .await
            .context("Failed to load registered devices")?;
        presence.seed(&devices).await;

        let fanout = Fanout::new(bus.clone(), presence.clone(), offline.clone());
        let processor = ActionProcessor::new(
            store.clone(),
            StatusCache::default(),
            fanout,
            offline.clone(),
        );
        let authenticator = TokenAuthenticator::new(store.clone());
        let user_tokens = UserTokenVerifier::new(config.user_token_secret.as_deref());
        if config.user_token_secret.is_none() {
            warn!("USER_TOKEN_SECRET not set, new devices can only be enrolled by existing ones");
        }

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let hub = Arc::new(Hub::new(
            processor.clone(),
            authenticator.clone(),
            presence.clone(),
            bus.clone(),
            offline.clone(),
            HubConfig::from(&config),
            shutdown_rx.clone(),
        ));

        let mut tasks = Vec::new();
        if let Bus::Postgres(pg_bus) = &bus {
            tasks.push(tokio::spawn(pg_bus.clone().run_listener(shutdown_rx)));
        }

        Ok(Self {
            config,
            store,
            presence,
            offline,
            bus,
            processor,
            authenticator,
            user_tokens,
            hub,
            shutdown_tx,
            tasks,
        })
    }

    pub fn router(&self) -> Router {
        api::create_api_router(Arc::new(ApiState {
            processor: self.processor.clone(),
            authenticator: self.authenticator.clone(),
            user_tokens: self.user_tokens.clone(),
            presence: self.presence.clone(),
            hub: self.hub.clone(),
        }))
    }

    pub fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.shutdown_tx.subscribe()
    }

    pub fn start_jobs(&mut self) {
        self.tasks.push(jobs::spawn_cleanup(
            self.processor.clone(),
            self.config.cleanup_interval,
            self.shutdown_tx.subscribe(),
        ));
        self.tasks.push(jobs::spawn_presence_sweep(
            self.presence.clone(),
            self.config.presence_window,
            self.shutdown_tx.subscribe(),
        ));
    }

    /// Signals every task and connection to stop and waits for the
    /// background tasks.
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(true);
        for task in self.tasks {
            if tokio::time::timeout(Duration::from_secs(10), task).await.is_err() {
                warn!("Background task did not stop in time");
            }
        }
        info!("Services stopped");
    }
}
