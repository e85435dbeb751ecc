use parking_lot::Mutex;
use std::sync::Arc;
use tracing::{debug, info};

use super::ConnectionManager;
use crate::config::DatabaseConfig;
use crate::engine::Connector;

/// Process-wide slot for a single manager.
///
/// The first `get_or_init` installs the manager; later calls get that same
/// instance back and their arguments are dropped unused. `dispose` empties
/// the slot so a different configuration can be installed afterwards.
pub struct ManagerCell<C: Connector> {
    slot: Mutex<Option<Arc<ConnectionManager<C>>>>,
}

impl<C: Connector> ManagerCell<C> {
    pub const fn new() -> Self {
        Self {
            slot: parking_lot::const_mutex(None),
        }
    }

    pub fn get_or_init(&self, config: DatabaseConfig, connector: C) -> Arc<ConnectionManager<C>> {
        let mut slot = self.slot.lock();
        if let Some(manager) = slot.as_ref() {
            debug!("manager already installed; ignoring new configuration");
            return manager.clone();
        }

        let manager = Arc::new(ConnectionManager::new(config, connector));
        *slot = Some(manager.clone());
        manager
    }

    pub fn get(&self) -> Option<Arc<ConnectionManager<C>>> {
        self.slot.lock().clone()
    }

    pub async fn dispose(&self) {
        let manager = self.slot.lock().take();
        if let Some(manager) = manager {
            manager.dispose().await;
            info!("managed connection slot cleared");
        }
    }
}

impl<C: Connector> Default for ManagerCell<C> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::scripted::ScriptedConnector;

    static CELL: ManagerCell<ScriptedConnector> = ManagerCell::new();

    #[tokio::test]
    async fn first_construction_wins_until_disposed() {
        let first = CELL.get_or_init(DatabaseConfig::default(), ScriptedConnector::new());

        let ignored = DatabaseConfig {
            pool_size: 42,
            ..Default::default()
        };
        let second = CELL.get_or_init(ignored, ScriptedConnector::new());

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(second.config().pool_size, DatabaseConfig::default().pool_size);

        first.get_engine().await.unwrap();
        CELL.dispose().await;
        assert!(CELL.get().is_none());
        assert!(!first.health_check().await);

        let replacement = DatabaseConfig {
            pool_size: 7,
            ..Default::default()
        };
        let third = CELL.get_or_init(replacement, ScriptedConnector::new());
        assert_eq!(third.config().pool_size, 7);
        CELL.dispose().await;
    }
}
