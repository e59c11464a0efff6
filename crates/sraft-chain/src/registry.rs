//! # registry
//!
//! why: let the node pick its ordering engine by name from configuration
//! relations: builds Chain from chain.rs behind the ConsensusChain contract
//! what: CONTRACT_VERSION, ConsensusChain trait, ChainContext, ConsenterRegistry

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use sraft_core::Config;
use sraft_storage::Storage;

use crate::chain::{Chain, ChainOptions};
use crate::error::{ChainError, Result};
use crate::server::ZoneRouter;
use crate::support::ChainSupport;
use crate::transport::Connector;

/// Version of the [`ConsensusChain`] contract this build provides
pub const CONTRACT_VERSION: u32 = 1;

/// Name the built-in engine is registered under
pub const SRAFT: &str = "sraft";

/// What the front end needs from an ordering engine
#[async_trait]
pub trait ConsensusChain: Send + Sync {
    /// Order one transaction, returning its log index once committed
    async fn order(&self, payload: Vec<u8>, config_seq: u64) -> Result<u64>;

    async fn start(&self) -> Result<()>;

    async fn stop(&self);
}

#[async_trait]
impl ConsensusChain for Chain {
    async fn order(&self, payload: Vec<u8>, config_seq: u64) -> Result<u64> {
        Chain::order(self, payload, config_seq).await
    }

    async fn start(&self) -> Result<()> {
        Chain::start(self)
    }

    async fn stop(&self) {
        Chain::stop(self)
    }
}

/// Everything a factory needs to build one zone's chain
pub struct ChainContext {
    pub options: ChainOptions,
    pub config: Arc<Config>,
    pub support: Arc<dyn ChainSupport>,
    pub storage: Box<dyn Storage>,
    pub connector: Arc<dyn Connector>,
    /// Inbound calls for the new chain's zone are routed here
    pub router: Arc<ZoneRouter>,
}

pub type ConsenterFactory =
    Box<dyn Fn(ChainContext) -> Result<Arc<dyn ConsensusChain>> + Send + Sync>;

struct Consenter {
    version: u32,
    factory: ConsenterFactory,
}

/// Ordering engines known to this node, by name
#[derive(Default)]
pub struct ConsenterRegistry {
    consenters: HashMap<String, Consenter>,
}

impl fmt::Debug for ConsenterRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConsenterRegistry")
            .field("consenters", &self.names())
            .finish()
    }
}

impl ConsenterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the built-in engine under [`SRAFT`]
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register(SRAFT, CONTRACT_VERSION, Box::new(build_sraft));
        registry
    }

    /// Add or replace the engine called `name`, built against contract `version`
    pub fn register(&mut self, name: impl Into<String>, version: u32, factory: ConsenterFactory) {
        self.consenters
            .insert(name.into(), Consenter { version, factory });
    }

    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.consenters.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    /// Build a chain with the engine called `name`, which must implement
    /// contract `version`
    pub fn create(
        &self,
        name: &str,
        version: u32,
        context: ChainContext,
    ) -> Result<Arc<dyn ConsensusChain>> {
        let consenter = self
            .consenters
            .get(name)
            .ok_or_else(|| ChainError::UnknownConsenter {
                name: name.to_string(),
            })?;
        if consenter.version != version {
            return Err(ChainError::IncompatibleContract {
                requested: version,
                supported: consenter.version,
            });
        }
        (consenter.factory)(context)
    }
}

fn build_sraft(context: ChainContext) -> Result<Arc<dyn ConsensusChain>> {
    let ChainContext {
        options,
        config,
        support,
        storage,
        connector,
        router,
    } = context;
    let zone_id = options.zone_id.clone();
    let chain = Chain::new(options, config, support, storage, connector.as_ref())?;
    router.register(zone_id, chain.clone());
    Ok(chain)
}
