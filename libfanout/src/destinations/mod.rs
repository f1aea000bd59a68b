//! Destination adapters
//!
//! A destination is one external publishing target. The engine only needs
//! to ask an adapter to post a submission and learn whether it worked; how
//! the content is reformatted, authenticated and transmitted stays inside
//! the adapter.
//!
//! Adapters are looked up by destination name through a
//! [`DestinationRegistry`], once per posting pass.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use libfanout::destinations::{mock::MockDestination, DestinationRegistry};
//!
//! let mut registry = DestinationRegistry::new();
//! registry.register(Arc::new(MockDestination::success("weasyl")));
//! assert!(registry.get("weasyl").is_some());
//! ```

use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use crate::config::Config;
use crate::error::DestinationError;
use crate::types::Submission;

pub mod command;

// Available outside tests so integration tests can build registries
pub mod mock;

#[async_trait]
pub trait Destination: Send + Sync {
    /// Destination identifier, as used in `pending_destinations`
    fn name(&self) -> &str;

    /// Publish the submission.
    ///
    /// Returns the identifier the destination gave the new post (may be
    /// empty when the destination does not report one). Timeouts are the
    /// adapter's business; the engine waits for whatever this returns.
    async fn post(&self, submission: &Submission) -> Result<String, DestinationError>;
}

/// Maps destination identifiers to adapters
#[derive(Clone, Default)]
pub struct DestinationRegistry {
    adapters: HashMap<String, Arc<dyn Destination>>,
}

impl DestinationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a registry of command adapters from `[destinations.*]`
    pub fn from_config(config: &Config) -> Self {
        let mut registry = Self::new();
        for (name, destination) in &config.destinations {
            registry.register(Arc::new(command::CommandDestination::new(
                name.clone(),
                destination.clone(),
            )));
        }
        registry
    }

    /// Register an adapter under its own name, replacing any previous one
    pub fn register(&mut self, adapter: Arc<dyn Destination>) {
        self.adapters.insert(adapter.name().to_string(), adapter);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Destination>> {
        self.adapters.get(name).cloned()
    }

    /// Resolve a destination list up front; unknown names map to `None`
    pub fn resolve(&self, names: &[String]) -> BTreeMap<String, Option<Arc<dyn Destination>>> {
        names
            .iter()
            .map(|name| (name.clone(), self.get(name)))
            .collect()
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.adapters.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn is_empty(&self) -> bool {
        self.adapters.is_empty()
    }
}
