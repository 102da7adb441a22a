//! buildd - build pipeline daemon
//!
//! Library components for the daemon process: collaborator backends, the
//! session registry, the event publisher, stage executors, the pipeline
//! controller and its HTTP surface.

pub mod agent;
pub mod backend;
pub mod controller;
pub mod files;
pub mod local;
pub mod publisher;
pub mod registry;
pub mod server;
pub mod stages;
pub mod storage;
#[cfg(any(test, feature = "testing"))]
pub mod testing;

use std::path::PathBuf;
use std::sync::Arc;

use agent::{AgentConfig, CliAgent};
use backend::{ExecutionBackend, ReasoningBackend};
use build_core::retry::RetryPolicy;
use build_core::Config;
use controller::{Controller, ControllerConfig};
use local::LocalExecution;
use publisher::EventPublisher;
use registry::{RegistryConfig, SessionRegistry};
use stages::Stages;
use storage::Storage;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Daemon configuration.
#[derive(Debug, Clone)]
pub struct DaemonConfig {
    /// Path to the SQLite database.
    pub db_path: PathBuf,
    /// HTTP server port (default: 7800).
    pub port: u16,
    /// Bearer token required on every route but /health (optional).
    pub auth_token: Option<String>,
    /// Root directory for local execution sessions.
    pub sessions_dir: PathBuf,
    /// Template directories copied into new sessions, keyed by template name.
    pub templates_dir: Option<PathBuf>,
    /// Pipeline tunables.
    pub config: Config,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        let data_dir = data_dir();
        Self {
            db_path: data_dir.join("buildd.db"),
            port: 7800,
            auth_token: std::env::var("BUILDD_AUTH_TOKEN").ok(),
            sessions_dir: data_dir.join("sessions"),
            templates_dir: None,
            config: Config::default(),
        }
    }
}

/// Data directory (~/.local/share/buildd).
fn data_dir() -> PathBuf {
    let data_dir = std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            dirs::home_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join(".local/share")
        });
    data_dir.join("buildd")
}

/// Daemon state.
#[derive(Debug)]
pub struct Daemon {
    config: DaemonConfig,
    storage: Arc<Storage>,
    controller: Arc<Controller>,
    shutdown: CancellationToken,
}

impl Daemon {
    /// Create a new daemon with the given configuration.
    pub async fn new(config: DaemonConfig) -> Result<Self, Box<dyn std::error::Error>> {
        let storage = Storage::new(&config.db_path).await?;
        storage.migrate_embedded().await?;
        let storage = Arc::new(storage);

        let interrupted = storage.fail_interrupted_runs().await?;
        if interrupted > 0 {
            warn!("marked {} interrupted run(s) as failed", interrupted);
        }

        let mut local = LocalExecution::new(&config.sessions_dir);
        if let Some(templates) = &config.templates_dir {
            local = local.with_templates(templates);
        }
        let backend: Arc<dyn ExecutionBackend> = Arc::new(local);
        let agent: Arc<dyn ReasoningBackend> =
            Arc::new(CliAgent::new(AgentConfig::from_config(&config.config)));

        let controller = Arc::new(build_controller(
            &config.config,
            Arc::clone(&storage),
            backend,
            agent,
        ));

        Ok(Self {
            config,
            storage,
            controller,
            shutdown: CancellationToken::new(),
        })
    }

    /// Get a reference to the storage backend.
    pub fn storage(&self) -> &Arc<Storage> {
        &self.storage
    }

    /// Get a reference to the pipeline controller.
    pub fn controller(&self) -> &Arc<Controller> {
        &self.controller
    }

    /// Serve the control surface until shutdown is requested.
    pub async fn run(&self) -> Result<(), Box<dyn std::error::Error>> {
        info!("buildd starting on port {}", self.config.port);
        info!("database: {}", self.config.db_path.display());
        info!("sessions: {}", self.config.sessions_dir.display());
        if self.config.auth_token.is_some() {
            info!("auth token: enabled");
        }

        let shutdown = self.shutdown.clone();
        let result = server::start_server(
            Arc::clone(&self.controller),
            self.config.port,
            self.config.auth_token.clone(),
            async move { shutdown.cancelled().await },
        )
        .await;

        if let Err(e) = result {
            error!("HTTP server error: {}", e);
            let e: Box<dyn std::error::Error> = e;
            return Err(e);
        }
        info!("buildd stopped");
        Ok(())
    }

    /// Signal the daemon to shut down gracefully.
    pub fn shutdown(&self) {
        info!("shutdown requested");
        self.shutdown.cancel();
    }
}

/// Wire the pipeline together from its collaborators.
pub fn build_controller(
    config: &Config,
    storage: Arc<Storage>,
    backend: Arc<dyn ExecutionBackend>,
    agent: Arc<dyn ReasoningBackend>,
) -> Controller {
    let registry = Arc::new(SessionRegistry::new(
        Arc::clone(&backend),
        Arc::clone(&storage),
        RegistryConfig::from_config(config),
    ));
    let publisher = Arc::new(EventPublisher::from_config(config));
    let stages = Stages::standard(agent, Arc::clone(&backend), config);

    Controller::new(
        registry,
        publisher,
        storage,
        backend,
        stages,
        RetryPolicy::from_config(config),
        ControllerConfig::from_config(config),
    )
}
