//! JSON-described simulations over an in-process network.
//!
//! A scenario lists the hosts, the creators and allocators in each host's
//! container, and the root to configure. Providers are named in the file and
//! get fresh identifiers when the network is built; reuse hints refer to
//! providers and hosts by those names.

use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use plexus_contract::Contract;
use plexus_id::{ApplicationId, Pointer, ProviderId, SystemId};
use serde::Deserialize;
use tracing::{info, warn};

use crate::assembler::Assembler;
use crate::config::Config;
use crate::container::StaticContainer;
use crate::model::{AssemblyState, AssemblyTree};
use crate::network::LocalNetwork;
use crate::peer::Peer;

#[derive(Debug, Clone, Deserialize)]
pub struct Scenario {
    /// The first host is the master.
    pub hosts: Vec<HostSpec>,
    pub root: RootSpec,
    /// Reuse hints below the root.
    #[serde(default)]
    pub hints: Vec<HintSpec>,
    /// Fixes the order in which hosts are tried for children.
    #[serde(default)]
    pub seed: Option<u64>,
    #[serde(default = "default_timeout_secs")]
    pub configure_timeout_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct HostSpec {
    pub name: String,
    #[serde(default)]
    pub creators: Vec<CreatorSpec>,
    #[serde(default)]
    pub allocators: Vec<AllocatorSpec>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CreatorSpec {
    pub name: String,
    pub templates: Vec<Contract>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AllocatorSpec {
    pub name: String,
    pub templates: Vec<Contract>,
    pub capacity: Vec<i64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RootSpec {
    pub name: String,
    /// Creator of the root component.
    pub creator: String,
    pub templates: Vec<Contract>,
    /// Host that held each root child last time.
    #[serde(default)]
    pub children: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct HintSpec {
    pub pointer: Pointer,
    #[serde(default)]
    pub creator: Option<String>,
    #[serde(default)]
    pub templates: Vec<Contract>,
    #[serde(default)]
    pub children: BTreeMap<String, String>,
}

fn default_timeout_secs() -> u64 {
    30
}

impl Scenario {
    pub fn from_path(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read scenario {}", path.display()))?;
        Self::from_json(&raw).with_context(|| format!("invalid scenario {}", path.display()))
    }

    pub fn from_json(raw: &str) -> Result<Self> {
        let scenario: Self = serde_json::from_str(raw)?;
        scenario.validate()?;
        Ok(scenario)
    }

    fn validate(&self) -> Result<()> {
        if self.hosts.is_empty() {
            bail!("scenario has no hosts");
        }

        let mut hosts = Vec::new();
        let mut providers = Vec::new();
        for host in &self.hosts {
            if hosts.contains(&&host.name) {
                bail!("duplicate host '{}'", host.name);
            }
            hosts.push(&host.name);

            let contracts = host
                .creators
                .iter()
                .flat_map(|c| c.templates.iter())
                .chain(host.allocators.iter().flat_map(|a| a.templates.iter()));
            for contract in contracts {
                contract
                    .validate()
                    .with_context(|| format!("host '{}'", host.name))?;
            }

            let names = host
                .creators
                .iter()
                .map(|c| &c.name)
                .chain(host.allocators.iter().map(|a| &a.name));
            for name in names {
                if providers.contains(&name) {
                    bail!("duplicate provider '{}'", name);
                }
                providers.push(name);
            }
        }

        for template in &self.root.templates {
            template.validate().context("root template")?;
        }
        if !providers.contains(&&self.root.creator) {
            bail!("unknown root creator '{}'", self.root.creator);
        }
        Ok(())
    }
}

/// A running simulation.
pub struct Simulation {
    network: LocalNetwork,
    hosts: Vec<(String, Arc<Assembler>)>,
    providers: HashMap<String, ProviderId>,
    app: ApplicationId,
}

impl Simulation {
    /// Starts one assembler per host.
    pub fn build(scenario: &Scenario) -> Self {
        let network = LocalNetwork::new();
        let mut providers = HashMap::new();
        let mut hosts = Vec::with_capacity(scenario.hosts.len());

        for spec in &scenario.hosts {
            let mut container = StaticContainer::new();
            for creator in &spec.creators {
                let id = ProviderId::new();
                providers.insert(creator.name.clone(), id);
                container = container.with_creator(id, creator.templates.clone());
            }
            for allocator in &spec.allocators {
                let id = ProviderId::new();
                providers.insert(allocator.name.clone(), id);
                container = container.with_allocator(
                    id,
                    allocator.templates.clone(),
                    allocator.capacity.clone(),
                );
            }

            let mut config = Config::for_system(SystemId::new());
            config.binding_seed = scenario.seed;
            config.configure_timeout = Duration::from_secs(scenario.configure_timeout_secs);

            let assembler = network.host(config, Arc::new(container));
            hosts.push((spec.name.clone(), assembler));
        }

        Self {
            network,
            hosts,
            providers,
            app: ApplicationId::new(),
        }
    }

    pub fn application_id(&self) -> ApplicationId {
        self.app
    }

    pub fn network(&self) -> &LocalNetwork {
        &self.network
    }

    pub fn master(&self) -> Option<&Arc<Assembler>> {
        self.hosts.first().map(|(_, assembler)| assembler)
    }

    pub fn host(&self, name: &str) -> Option<&Arc<Assembler>> {
        self.hosts
            .iter()
            .find(|(host, _)| host == name)
            .map(|(_, assembler)| assembler)
    }

    fn system(&self, name: &str) -> Result<SystemId> {
        self.host(name)
            .map(|assembler| assembler.system_id())
            .with_context(|| format!("unknown host '{}'", name))
    }

    fn provider(&self, name: &str) -> Result<ProviderId> {
        self.providers
            .get(name)
            .copied()
            .with_context(|| format!("unknown provider '{}'", name))
    }

    /// Reuse hints keyed by pointer, names resolved to identifiers.
    fn states(&self, scenario: &Scenario) -> Result<HashMap<Pointer, AssemblyState>> {
        let mut states = HashMap::new();
        states.insert(
            Pointer::root(scenario.root.name.clone()),
            AssemblyState {
                creator_id: Some(self.provider(&scenario.root.creator)?),
                element_id: None,
                templates: scenario.root.templates.clone(),
                children: self.children(&scenario.root.children)?,
            },
        );

        for hint in &scenario.hints {
            let creator_id = hint
                .creator
                .as_deref()
                .map(|name| self.provider(name))
                .transpose()?;
            states.insert(
                hint.pointer.clone(),
                AssemblyState {
                    creator_id,
                    element_id: None,
                    templates: hint.templates.clone(),
                    children: self.children(&hint.children)?,
                },
            );
        }
        Ok(states)
    }

    fn children(&self, names: &BTreeMap<String, String>) -> Result<BTreeMap<String, SystemId>> {
        names
            .iter()
            .map(|(child, host)| Ok((child.clone(), self.system(host)?)))
            .collect()
    }

    /// Prepares the application, seeds the hints, optionally cuts `remove`
    /// off the network and configures the root. Returns the assembled tree,
    /// or `None` when configuration failed.
    pub async fn run(
        &self,
        scenario: &Scenario,
        remove: Option<&str>,
    ) -> Result<Option<AssemblyTree>> {
        let master = self.master().context("scenario has no hosts")?.clone();
        let app = self.app;

        let lease = master.prepare(app).await?;
        let keeper = {
            let master = master.clone();
            let period = (lease.duration / 3).max(Duration::from_millis(1));
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(period);
                loop {
                    ticker.tick().await;
                    if master.renew(lease.id).await.is_err() {
                        break;
                    }
                }
            })
        };

        let root = Pointer::root(scenario.root.name.clone());
        let seeded = master
            .setup_tree(app, &self.states(scenario)?, root.clone())
            .await?;
        info!(app = %app, seeded, "Reuse hints recorded");

        if let Some(name) = remove {
            let system = self.system(name)?;
            if system == master.system_id() {
                warn!(host = name, "Removing the master; configuration will fail");
            }
            self.network.disconnect(system);
        }

        let result = match master.configure(app).await? {
            Some(_) => Some(master.retrieve_tree(app, root).await?),
            None => None,
        };

        keeper.abort();
        Ok(result)
    }

    /// Stops every host.
    pub async fn shutdown(self) {
        self.network.shutdown();
        for (_, assembler) in &self.hosts {
            assembler.shutdown().await;
        }
    }
}

/// Runs `scenario` from start to finish.
pub async fn simulate(scenario: &Scenario, remove: Option<&str>) -> Result<Option<AssemblyTree>> {
    let simulation = Simulation::build(scenario);
    let result = simulation.run(scenario, remove).await;
    simulation.shutdown().await;
    result
}
