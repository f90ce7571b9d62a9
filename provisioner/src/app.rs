//! Application context and engine wiring.
//!
//! `AppContext` carries the cross-cutting CLI state (output mode, loaded
//! config). `Engine` assembles the services over a set of ports; commands
//! build it from production adapters and tests from in-memory fakes.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::task::JoinHandle;
use vdi_common::ProvisionerConfig;

use crate::application::ports::{
    Clock, InfraProvider, NetworkProbe, ProjectDirectory, ProvisioningStore, RemoteHost,
};
use crate::application::services::automation::AutomationExecutor;
use crate::application::services::decommission::Decommission;
use crate::application::services::event_listener::InfraEventListener;
use crate::application::services::infra_tasks::InfraTaskStore;
use crate::application::services::orchestrator::{Orchestrator, OrchestratorParts};
use crate::application::services::port_allocator::PortAllocator;
use crate::application::services::signal_bus::SignalBus;
use crate::application::services::timeout_tracker::TimeoutTracker;
use crate::infra::clock::SystemClock;
use crate::infra::command_runner::TokioCommandRunner;
use crate::infra::config::YamlConfigStore;
use crate::infra::event_stream::InfraEventStream;
use crate::infra::http_infra::HttpInfraProvider;
use crate::infra::memory_store::MemoryStore;
use crate::infra::network::TokioNetworkProbe;
use crate::infra::ssh_host::SshRemoteHost;
use crate::infra::valkey_store::ValkeyStore;
use crate::output::{HumanRenderer, JsonRenderer, OutputContext, Renderer};

/// Output rendering mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputMode {
    /// Human-readable terminal output (default).
    Human,
    /// Machine-readable JSON output.
    Json,
}

/// Flags passed from the top-level CLI to `AppContext::new`.
pub struct AppFlags {
    pub no_color: bool,
    pub quiet: bool,
    pub json: bool,
    pub config: Option<PathBuf>,
}

/// Unified application context passed to every command handler.
pub struct AppContext {
    pub output: OutputContext,
    pub mode: OutputMode,
    pub config: ProvisionerConfig,
}

impl AppContext {
    /// # Errors
    ///
    /// Returns an error if the configuration cannot be loaded.
    pub fn new(flags: AppFlags) -> Result<Self> {
        let config = YamlConfigStore::new(flags.config).load()?;
        let mode = if flags.json {
            OutputMode::Json
        } else {
            OutputMode::Human
        };
        Ok(Self {
            output: OutputContext::new(flags.no_color, flags.quiet),
            mode,
            config,
        })
    }

    #[must_use]
    pub fn is_json(&self) -> bool {
        self.mode == OutputMode::Json
    }

    #[must_use]
    pub fn renderer(&self) -> Renderer<'_> {
        match self.mode {
            OutputMode::Human => Renderer::Human(HumanRenderer::new(&self.output)),
            OutputMode::Json => Renderer::Json(JsonRenderer),
        }
    }
}

// ── Engine ────────────────────────────────────────────────────────────────────

/// Ports the engine is assembled over.
pub struct EnginePorts {
    pub store: Arc<dyn ProvisioningStore>,
    pub directory: Arc<dyn ProjectDirectory>,
    pub infra: Arc<dyn InfraProvider>,
    pub remote: Arc<dyn RemoteHost>,
    pub probe: Arc<dyn NetworkProbe>,
    pub clock: Arc<dyn Clock>,
}

pub struct Engine {
    pub config: Arc<ProvisionerConfig>,
    pub orchestrator: Arc<Orchestrator>,
    pub decommission: Decommission,
    pub automation: Arc<AutomationExecutor>,
    pub tasks: Arc<InfraTaskStore>,
    pub listener: Arc<InfraEventListener>,
}

impl Engine {
    #[must_use]
    pub fn assemble(config: ProvisionerConfig, ports: EnginePorts) -> Self {
        let EnginePorts {
            store,
            directory,
            infra,
            remote,
            probe,
            clock,
        } = ports;
        let config = Arc::new(config);

        let automation = Arc::new(automation_executor(remote, Arc::clone(&clock), &config));
        let tracker = Arc::new(TimeoutTracker::new(config.infra.per_instance_allowance()));
        let tasks = Arc::new(InfraTaskStore::new(
            Arc::clone(&store),
            directory,
            Arc::clone(&automation),
            Arc::new(SignalBus::new()),
            tracker,
            Arc::clone(&clock),
        ));
        let ports = Arc::new(PortAllocator::new(
            Arc::clone(&store),
            config.network.port_min,
            config.network.port_max,
            config.network.random_port_attempts,
        ));
        let orchestrator = Arc::new(Orchestrator::new(OrchestratorParts {
            store: Arc::clone(&store),
            infra: Arc::clone(&infra),
            tasks: Arc::clone(&tasks),
            automation: Arc::clone(&automation),
            ports,
            probe,
            clock,
            config: Arc::clone(&config),
        }));
        let decommission =
            Decommission::new(store, infra, Arc::clone(&tasks), config.infra.clone());
        let listener = Arc::new(InfraEventListener::new(Arc::clone(&tasks)));

        Self {
            config,
            orchestrator,
            decommission,
            automation,
            tasks,
            listener,
        }
    }

    /// Engine over the production adapters. `ephemeral` keeps all state in
    /// process memory instead of Valkey.
    ///
    /// # Errors
    ///
    /// Returns an error if Valkey or the HTTP client cannot be set up.
    pub async fn connect(config: ProvisionerConfig, ephemeral: bool) -> Result<Self> {
        let (store, directory): (Arc<dyn ProvisioningStore>, Arc<dyn ProjectDirectory>) =
            if ephemeral {
                let memory = Arc::new(MemoryStore::new());
                (Arc::clone(&memory) as _, memory as _)
            } else {
                let valkey = Arc::new(
                    ValkeyStore::connect(&config.valkey.url)
                        .await
                        .context("cannot open the provisioning store")?,
                );
                (Arc::clone(&valkey) as _, valkey as _)
            };
        let infra = Arc::new(HttpInfraProvider::new(&config.infra)?);
        let remote = Arc::new(SshRemoteHost::new(
            Arc::new(TokioCommandRunner::new()),
            &config.automation,
        ));
        Ok(Self::assemble(
            config,
            EnginePorts {
                store,
                directory,
                infra,
                remote,
                probe: Arc::new(TokioNetworkProbe),
                clock: Arc::new(SystemClock),
            },
        ))
    }

    /// Start the timeout sweeper and the event consumer.
    ///
    /// # Errors
    ///
    /// Returns an error if the event stream cannot be opened.
    pub async fn start_background(&self) -> Result<Background> {
        let sweeper = self.tasks.spawn_sweeper(self.config.infra.sweep_interval());
        let stream = InfraEventStream::connect(&self.config.valkey)
            .await
            .context("cannot subscribe to infra events")?;
        let consumer = stream.spawn(Arc::clone(&self.listener));
        Ok(Background {
            handles: vec![sweeper, consumer],
        })
    }
}

/// Background tasks of a running engine; aborted on drop.
pub struct Background {
    handles: Vec<JoinHandle<()>>,
}

impl Drop for Background {
    fn drop(&mut self) {
        for handle in &self.handles {
            handle.abort();
        }
    }
}

fn automation_executor(
    remote: Arc<dyn RemoteHost>,
    clock: Arc<dyn Clock>,
    config: &ProvisionerConfig,
) -> AutomationExecutor {
    AutomationExecutor::new(remote, clock, config.automation.clone())
}

/// Executor alone, for commands that only talk to the automation host.
#[must_use]
pub fn standalone_automation(config: &ProvisionerConfig) -> Arc<AutomationExecutor> {
    let remote = Arc::new(SshRemoteHost::new(
        Arc::new(TokioCommandRunner::new()),
        &config.automation,
    ));
    Arc::new(automation_executor(remote, Arc::new(SystemClock), config))
}
