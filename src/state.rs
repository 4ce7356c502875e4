use std::sync::Arc;

use crate::auth::SessionResolver;
use crate::config::RaceConfig;
use crate::registry::RoomRegistry;
use crate::room::RoomSettings;
use crate::store::RaceStore;

/// Shared application state, one per process
#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<RoomRegistry>,
    pub store: Arc<dyn RaceStore>,
    pub resolver: Arc<dyn SessionResolver>,
    pub config: Arc<RaceConfig>,
}

impl AppState {
    pub fn new(
        config: RaceConfig,
        store: Arc<dyn RaceStore>,
        resolver: Arc<dyn SessionResolver>,
    ) -> Self {
        let registry = Arc::new(RoomRegistry::new(
            store.clone(),
            config.start_policy(),
            RoomSettings::from(&config),
        ));
        Self {
            registry,
            store,
            resolver,
            config: Arc::new(config),
        }
    }
}
