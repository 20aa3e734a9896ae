pub mod admin;
pub mod ado;
pub mod balancer;
pub mod config;
pub mod db;
pub mod host;
pub mod owners;
pub mod reconcile;
pub mod selection;
pub mod store;
pub mod triggers;

use std::sync::Arc;

pub use config::Config;
pub use host::{IdentityDirectory, SourceHost};
pub use store::Store;

use balancer::Balancer;
use triggers::ReviewerTrigger;

pub struct AppState {
    pub host: Arc<dyn SourceHost>,
    pub identity: Arc<dyn IdentityDirectory>,
    pub store: Store,
    pub balancer: Balancer,
    pub config: Config,
}

impl AppState {
    pub fn new(
        host: Arc<dyn SourceHost>,
        identity: Arc<dyn IdentityDirectory>,
        store: Store,
        triggers: Vec<Arc<dyn ReviewerTrigger>>,
        config: Config,
    ) -> Self {
        let balancer = Balancer::new(
            host.clone(),
            store.clone(),
            config.bot_identifier.clone(),
            balancer::default_filters(&config.default_target_branch),
            triggers,
            config.exclude_pr_author,
        );

        Self {
            host,
            identity,
            store,
            balancer,
            config,
        }
    }
}
