//! Process-wide shared state, built once by the Supervisor and handed by reference into
//! every router handler: explicit init/teardown, no module-level mutable state.

use crate::backend::BackendInfo;
use crate::cache::CacheResolver;
use crate::catalog::Catalog;
use crate::config::Config;
use crate::options_store::OptionsStore;
use crate::scheduler::ModelScheduler;
use parking_lot::Mutex;
use std::sync::Arc;

pub struct AppState {
    pub config: Config,
    pub backend: BackendInfo,
    pub catalog: Mutex<Catalog>,
    pub resolver: CacheResolver,
    pub options: OptionsStore,
    pub scheduler: ModelScheduler,
}

pub type SharedState = Arc<AppState>;

impl AppState {
    pub fn new(config: Config, backend: BackendInfo, catalog: Catalog, options: OptionsStore) -> Self {
        let resolver = CacheResolver::new(config.cache_dir.clone());
        let scheduler = ModelScheduler::new(config.clone());
        Self {
            config,
            backend,
            catalog: Mutex::new(catalog),
            resolver,
            options,
            scheduler,
        }
    }
}
