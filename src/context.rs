//! Run context (spec §5) — the shared handles a `Monitor`/`Replay` run
//! passes down to every component, replacing the original's pair of
//! process-wide mutexes with ownership the type system can check. The
//! database pool already serializes access per connection (spec §5); the
//! planet client is wrapped in its own `Mutex` only for the lifetime of one
//! fetch-scheduler chunk, not held for the whole run.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use geo::MultiPolygon;
use r2d2_postgres::PostgresConnectionManager;
use r2d2_postgres::postgres::NoTls;

use crate::catalog::{PgPool, PostgresCatalog};
use crate::conflate::ConflationEngine;
use crate::error::Result;
use crate::planet::PlanetClient;
use crate::store::PostgresStore;

/// Everything a run needs that outlives a single fetch/apply cycle: the
/// pooled database connection, the remote host/port to fetch from, and an
/// optional priority-area boundary restricting which modified nodes
/// trigger a synthetic way re-derivation (spec §4.G).
pub struct Context {
    pool: PgPool,
    planet_host: String,
    planet_port: u16,
    boundary: Option<MultiPolygon<f64>>,
    shutdown: AtomicBool,
}

impl Context {
    pub fn new(pool: PgPool, planet_host: impl Into<String>, planet_port: u16) -> Self {
        Self {
            pool,
            planet_host: planet_host.into(),
            planet_port,
            boundary: None,
            shutdown: AtomicBool::new(false),
        }
    }

    pub fn pool(&self) -> PgPool {
        self.pool.clone()
    }

    pub fn with_boundary(mut self, boundary: MultiPolygon<f64>) -> Self {
        self.boundary = Some(boundary);
        self
    }

    pub fn boundary(&self) -> Option<&MultiPolygon<f64>> {
        self.boundary.as_ref()
    }

    pub fn catalog(&self) -> PostgresCatalog {
        PostgresCatalog::new(self.pool.clone())
    }

    pub fn store(&self) -> PostgresStore {
        PostgresStore::new(self.pool.clone())
    }

    pub fn conflation(&self) -> ConflationEngine {
        ConflationEngine::new(self.pool.clone())
    }

    /// A fresh, unconnected client. Scoped to the caller's chunk — never
    /// shared across an entire `Monitor` run (spec §5 design note).
    pub fn new_planet_client(&self) -> Mutex<PlanetClient> {
        Mutex::new(PlanetClient::new(self.planet_host.clone(), self.planet_port))
    }

    /// Cooperative cancellation: `Monitor`'s poll loop checks this between
    /// iterations and a Ctrl-C handler sets it, rather than the process
    /// being killed mid-write.
    pub fn request_shutdown(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }
}

pub fn connect_pool(database_url: &str) -> Result<PgPool> {
    let manager = PostgresConnectionManager::new(database_url.parse()?, NoTls);
    Ok(r2d2::Pool::new(manager)?)
}
