//! SQLite binding for lembed.
//!
//! [`Session::open`] installs the scalar functions and the `lembed_models`,
//! `lembed_chunks` and `lembed_batch` table-valued modules on a connection,
//! all sharing one [`ModelRegistry`] for that connection.

mod chunks_table;
mod functions;
mod models_table;


use std::sync::{Arc, Mutex, MutexGuard};

use lembed_core::config::LembedConfig;
use lembed_core::{EmbedError, Model, ModelRegistry};
use rusqlite::Connection;

/// Registry shared by every function and module of one connection.
pub type SharedRegistry = Arc<Mutex<ModelRegistry>>;

pub const VERSION: &str = concat!("v", env!("CARGO_PKG_VERSION"));

/// The four `lembed_debug()` lines.
pub fn debug_info() -> String {
    let profile = if cfg!(debug_assertions) { "debug" } else { "release" };
    format!(
        "Version: {VERSION}\nBackends: fastembed, hashing\nBuild: profile={profile} target={}-{}\nPooling: none, mean, cls",
        std::env::consts::ARCH,
        std::env::consts::OS
    )
}

/// One connection's lembed state.
pub struct Session {
    registry: SharedRegistry,
}

impl Session {
    /// Build the configured registry and install everything on `conn`.
    pub fn open(conn: &Connection, config: &LembedConfig) -> Result<Self, String> {
        let registry = config
            .build_registry()
            .map_err(|e| format!("failed to open lembed session: {e}"))?;
        let registry = Arc::new(Mutex::new(registry));

        functions::register(conn, &registry)
            .map_err(|e| format!("failed to register lembed functions: {e}"))?;
        models_table::register(conn, &registry)
            .map_err(|e| format!("failed to register lembed_models: {e}"))?;
        chunks_table::register(conn, &registry)
            .map_err(|e| format!("failed to register lembed_chunks: {e}"))?;

        log::info!("lembed {VERSION} session opened");
        Ok(Self { registry })
    }

    pub fn registry(&self) -> &SharedRegistry {
        &self.registry
    }

    /// Evict every model now instead of when the connection closes.
    pub fn close(self) {
        match self.registry.lock() {
            Ok(mut registry) => registry.clear(),
            Err(_) => log::warn!("lembed registry lock poisoned during close"),
        }
        log::info!("lembed session closed");
    }
}

/// Open a session with the default configuration.
pub fn register(conn: &Connection) -> Result<Session, String> {
    Session::open(conn, &LembedConfig::default())
}

fn lock(registry: &SharedRegistry) -> Result<MutexGuard<'_, ModelRegistry>, String> {
    registry
        .lock()
        .map_err(|_| "model registry is unavailable".to_string())
}

/// Resolve a name or handle without holding the lock while the caller embeds.
fn resolve(registry: &SharedRegistry, reference: Option<&str>) -> Result<Arc<Model>, String> {
    lock(registry)?
        .resolve_reference(reference)
        .map_err(|e: EmbedError| e.to_string())
}
