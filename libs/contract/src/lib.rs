//! # plexus-contract
//!
//! Demand and provision contracts.
//!
//! A contract describes either what a component needs (a *demand*) or what a
//! creator/allocator can offer (a *provision* or a *template*). Templates are
//! the alternatives a provider can instantiate: their children list the
//! instance and resource demands the instantiated element will itself need,
//! and resource templates carry a numeric `estimate` vector that is reserved
//! against an allocator's free capacity.
//!
//! The assembler treats contracts as opaque values: it only asks whether one
//! matches another and walks template children. It never mutates a contract
//! it did not build.

mod error;

pub use error::ContractError;

use serde::{Deserialize, Serialize};

/// What a contract describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContractKind {
    InstanceDemand,
    InstanceProvision,
    InstanceTemplate,
    ResourceDemand,
    ResourceProvision,
    ResourceTemplate,
}

impl ContractKind {
    /// Returns true for the two demand kinds.
    pub fn is_demand(&self) -> bool {
        matches!(self, Self::InstanceDemand | Self::ResourceDemand)
    }

    /// Returns true for the instance-side kinds.
    pub fn is_instance(&self) -> bool {
        matches!(
            self,
            Self::InstanceDemand | Self::InstanceProvision | Self::InstanceTemplate
        )
    }

    /// Returns true if a contract of this kind can satisfy a demand of `demand` kind.
    fn satisfies(&self, demand: ContractKind) -> bool {
        match demand {
            Self::InstanceDemand => {
                matches!(self, Self::InstanceProvision | Self::InstanceTemplate)
            }
            Self::ResourceDemand => {
                matches!(self, Self::ResourceProvision | Self::ResourceTemplate)
            }
            _ => false,
        }
    }
}

impl std::fmt::Display for ContractKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::InstanceDemand => "instance_demand",
            Self::InstanceProvision => "instance_provision",
            Self::InstanceTemplate => "instance_template",
            Self::ResourceDemand => "resource_demand",
            Self::ResourceProvision => "resource_provision",
            Self::ResourceTemplate => "resource_template",
        };
        write!(f, "{}", s)
    }
}

/// A demand, provision or template.
///
/// `Clone` is a deep value copy.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Contract {
    pub kind: ContractKind,

    pub name: String,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub children: Vec<Contract>,

    /// Resource estimate, one entry per allocator dimension.
    /// Only meaningful on resource templates.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub estimate: Vec<i64>,
}

impl Contract {
    pub fn new(kind: ContractKind, name: impl Into<String>) -> Self {
        Self {
            kind,
            name: name.into(),
            children: Vec::new(),
            estimate: Vec::new(),
        }
    }

    pub fn instance_demand(name: impl Into<String>) -> Self {
        Self::new(ContractKind::InstanceDemand, name)
    }

    pub fn instance_template(name: impl Into<String>) -> Self {
        Self::new(ContractKind::InstanceTemplate, name)
    }

    pub fn instance_provision(name: impl Into<String>) -> Self {
        Self::new(ContractKind::InstanceProvision, name)
    }

    pub fn resource_demand(name: impl Into<String>) -> Self {
        Self::new(ContractKind::ResourceDemand, name)
    }

    pub fn resource_template(name: impl Into<String>, estimate: Vec<i64>) -> Self {
        Self {
            estimate,
            ..Self::new(ContractKind::ResourceTemplate, name)
        }
    }

    pub fn resource_provision(name: impl Into<String>) -> Self {
        Self::new(ContractKind::ResourceProvision, name)
    }

    /// Appends a child contract.
    #[must_use]
    pub fn with_child(mut self, child: Contract) -> Self {
        self.children.push(child);
        self
    }

    /// Instance demands among the children, in declaration order.
    pub fn instance_demands(&self) -> impl Iterator<Item = &Contract> {
        self.children
            .iter()
            .filter(|c| c.kind == ContractKind::InstanceDemand)
    }

    /// Resource demands among the children, in declaration order.
    pub fn resource_demands(&self) -> impl Iterator<Item = &Contract> {
        self.children
            .iter()
            .filter(|c| c.kind == ContractKind::ResourceDemand)
    }

    fn provisions(&self) -> impl Iterator<Item = &Contract> {
        self.children.iter().filter(|c| {
            matches!(
                c.kind,
                ContractKind::InstanceProvision | ContractKind::ResourceProvision
            )
        })
    }

    /// Whether `self` can satisfy `other`.
    ///
    /// The predicate is one-directional: `self` must be a provision or
    /// template of the category `other` demands. Names must be equal; when
    /// `strict` is false a demand with an empty name accepts any name. Every
    /// provision listed by the demand must be matched by one of `self`'s own
    /// provisions, recursively and with the same strictness.
    pub fn matches(&self, other: &Contract, strict: bool) -> bool {
        if !self.kind.satisfies(other.kind) && !(self.kind == other.kind && !self.kind.is_demand())
        {
            return false;
        }

        if !names_match(&self.name, &other.name, strict) {
            return false;
        }

        other.provisions().all(|required| {
            self.provisions()
                .any(|offered| offered.kind == required.kind && offered.matches(required, strict))
        })
    }

    /// Checks the structural rules the assembler relies on.
    pub fn validate(&self) -> Result<(), ContractError> {
        if !self.estimate.is_empty() && self.kind != ContractKind::ResourceTemplate {
            return Err(ContractError::UnexpectedEstimate {
                name: self.name.clone(),
                kind: self.kind,
            });
        }

        if let Some(value) = self.estimate.iter().find(|v| **v < 0) {
            return Err(ContractError::NegativeEstimate {
                name: self.name.clone(),
                value: *value,
            });
        }

        // Child demand names become pointer segments.
        let mut seen = std::collections::HashSet::new();
        for child in self.children.iter().filter(|c| c.kind.is_demand()) {
            if child.name.is_empty() {
                return Err(ContractError::UnnamedDemand);
            }
            if !seen.insert((child.kind.is_instance(), child.name.as_str())) {
                return Err(ContractError::DuplicateDemand(child.name.clone()));
            }
        }

        self.children.iter().try_for_each(Contract::validate)
    }
}

impl std::fmt::Display for Contract {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.kind, self.name)
    }
}

fn names_match(offered: &str, wanted: &str, strict: bool) -> bool {
    offered == wanted || (!strict && wanted.is_empty())
}
