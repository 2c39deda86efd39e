//! Shared handles every controller needs: the store connection and its change feed.

use crate::events::EventBus;
use sea_orm::DatabaseConnection;

/// Central application state shared by the lecturer and student controllers.
///
/// This includes:
/// - A cloned, thread-safe database connection for use with SeaORM.
/// - An `EventBus` standing in for the store's change notifications.
#[derive(Clone)]
pub struct AppState {
    db: DatabaseConnection,
    bus: EventBus,
}

impl AppState {
    /// Creates a new `AppState` with the given database connection and event bus.
    pub fn new(db: DatabaseConnection, bus: EventBus) -> Self {
        Self { db, bus }
    }

    /// Returns a shared reference to the internal `DatabaseConnection`.
    pub fn db(&self) -> &DatabaseConnection {
        &self.db
    }

    /// Returns a shared reference to the internal `EventBus`.
    pub fn bus(&self) -> &EventBus {
        &self.bus
    }
}
