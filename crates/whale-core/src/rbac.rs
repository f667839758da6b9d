//! The verbs the job's Role grants, checked before any call leaves the process.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use crate::error::{Result, WhaleError};
use crate::run::ResourceKind;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Verb {
    Create,
    Get,
    List,
    Watch,
    Update,
    Patch,
    Delete,
}

impl fmt::Display for Verb {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Verb::Create => "create",
            Verb::Get => "get",
            Verb::List => "list",
            Verb::Watch => "watch",
            Verb::Update => "update",
            Verb::Patch => "patch",
            Verb::Delete => "delete",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Role {
    rules: BTreeMap<ResourceKind, BTreeSet<Verb>>,
}

impl Role {
    /// deployments: create/get/list/watch/delete, services: create/delete
    pub fn job_role() -> Self {
        Role::default()
            .grant(
                ResourceKind::Deployment,
                &[Verb::Create, Verb::Get, Verb::List, Verb::Watch, Verb::Delete],
            )
            .grant(ResourceKind::Service, &[Verb::Create, Verb::Delete])
    }

    pub fn grant(mut self, kind: ResourceKind, verbs: &[Verb]) -> Self {
        self.rules.entry(kind).or_default().extend(verbs.iter().copied());
        self
    }

    pub fn allows(&self, verb: Verb, kind: ResourceKind) -> bool {
        self.rules.get(&kind).is_some_and(|verbs| verbs.contains(&verb))
    }

    pub fn check(&self, verb: Verb, kind: ResourceKind) -> Result<()> {
        if self.allows(verb, kind) {
            Ok(())
        } else {
            Err(WhaleError::PermissionDenied(format!(
                "verb '{}' on {} is not granted by the job role",
                verb, kind
            )))
        }
    }
}

impl Default for Role {
    fn default() -> Self {
        Role {
            rules: BTreeMap::new(),
        }
    }
}
