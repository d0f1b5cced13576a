//! Local container port and a static implementation.
//!
//! The container is the per-host store of component creators and resource
//! allocators. The assembler asks it for templates matching a demand and for
//! a snapshot of free resources; it never talks to creators directly.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::RwLock;

use plexus_contract::Contract;
use plexus_id::{ContainerId, ProviderId};
use thiserror::Error;
use tracing::debug;

/// Free capacity per allocator, one entry per resource dimension.
pub type ResourceSnapshot = HashMap<ProviderId, Vec<i64>>;

/// A provider able to satisfy a demand, with the templates it offers for it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Candidate {
    pub provider_id: ProviderId,
    pub templates: Vec<Contract>,
}

#[derive(Debug, Error)]
pub enum ContainerError {
    #[error("container unreachable")]
    Unreachable,
}

/// Per-host container of creators and allocators.
pub trait Container: Send + Sync {
    fn container_id(&self) -> ContainerId;

    /// Candidates for each demand, keyed by the demand itself. Demands with
    /// no candidate map to an empty list.
    fn get_templates(
        &self,
        demands: &[Contract],
    ) -> Result<HashMap<Contract, Vec<Candidate>>, ContainerError>;

    /// Free capacity of every allocator.
    fn get_resources(&self) -> Result<ResourceSnapshot, ContainerError>;
}

struct Provider {
    id: ProviderId,
    templates: Vec<Contract>,
}

/// Container backed by a fixed provider list.
pub struct StaticContainer {
    id: ContainerId,
    providers: Vec<Provider>,
    capacity: RwLock<ResourceSnapshot>,
    reachable: AtomicBool,
}

impl StaticContainer {
    pub fn new() -> Self {
        Self {
            id: ContainerId::new(),
            providers: Vec::new(),
            capacity: RwLock::new(HashMap::new()),
            reachable: AtomicBool::new(true),
        }
    }

    /// Registers a component creator offering `templates`.
    #[must_use]
    pub fn with_creator(mut self, id: ProviderId, templates: Vec<Contract>) -> Self {
        self.providers.push(Provider { id, templates });
        self
    }

    /// Registers a resource allocator offering `templates` with `capacity`
    /// free units per dimension.
    #[must_use]
    pub fn with_allocator(
        mut self,
        id: ProviderId,
        templates: Vec<Contract>,
        capacity: Vec<i64>,
    ) -> Self {
        self.providers.push(Provider { id, templates });
        if let Ok(mut table) = self.capacity.write() {
            table.insert(id, capacity);
        }
        self
    }

    /// Replaces the free capacity reported for `id`.
    pub fn set_capacity(&self, id: ProviderId, capacity: Vec<i64>) {
        if let Ok(mut table) = self.capacity.write() {
            table.insert(id, capacity);
        }
    }

    /// Makes every call fail with [`ContainerError::Unreachable`].
    pub fn set_reachable(&self, reachable: bool) {
        self.reachable.store(reachable, Ordering::SeqCst);
    }

    fn check(&self) -> Result<(), ContainerError> {
        if self.reachable.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(ContainerError::Unreachable)
        }
    }
}

impl Default for StaticContainer {
    fn default() -> Self {
        Self::new()
    }
}

impl Container for StaticContainer {
    fn container_id(&self) -> ContainerId {
        self.id
    }

    fn get_templates(
        &self,
        demands: &[Contract],
    ) -> Result<HashMap<Contract, Vec<Candidate>>, ContainerError> {
        self.check()?;

        let mut found = HashMap::with_capacity(demands.len());
        for demand in demands {
            let candidates: Vec<Candidate> = self
                .providers
                .iter()
                .filter_map(|provider| {
                    let templates: Vec<Contract> = provider
                        .templates
                        .iter()
                        .filter(|t| t.matches(demand, false))
                        .cloned()
                        .collect();
                    (!templates.is_empty()).then(|| Candidate {
                        provider_id: provider.id,
                        templates,
                    })
                })
                .collect();

            debug!(demand = %demand, candidates = candidates.len(), "Looked up templates");
            found.insert(demand.clone(), candidates);
        }

        Ok(found)
    }

    fn get_resources(&self) -> Result<ResourceSnapshot, ContainerError> {
        self.check()?;
        Ok(self
            .capacity
            .read()
            .map(|table| table.clone())
            .unwrap_or_default())
    }
}
