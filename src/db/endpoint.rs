//! One lazily opened driver handle.
//!
//! An `Endpoint` owns the handle slot of one role (master or slave). The open
//! handle lives behind its own `Arc`'d tokio mutex, and callers lock it with
//! `lock_owned()`. The resulting `HandleGuard` borrows nothing from the
//! connection, so it can be held across `.await` inside `Send` futures.

use super::factory::{CreatedHandle, HandleFactory};
use super::handle::DriverHandle;
use super::lock_unpoisoned;
use crate::config::ServerConfig;
use crate::error::{DbError, DbResult};
use crate::models::{ConnectionOptions, masked_dsn};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;
use tokio::sync::OwnedMutexGuard;
use tracing::{Instrument, debug, info, info_span, warn};

/// Exclusive access to a live driver handle.
pub type HandleGuard = OwnedMutexGuard<Box<dyn DriverHandle>>;

type SharedHandle = Arc<tokio::sync::Mutex<Box<dyn DriverHandle>>>;

#[derive(Debug, Default)]
struct EndpointInfo {
    config: Option<ServerConfig>,
    server_version: Option<String>,
}

pub(crate) struct Endpoint {
    label: &'static str,
    factory: Arc<dyn HandleFactory>,
    handle: tokio::sync::Mutex<Option<SharedHandle>>,
    active: AtomicBool,
    info: Mutex<EndpointInfo>,
}

impl std::fmt::Debug for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Endpoint")
            .field("label", &self.label)
            .field("active", &self.is_active())
            .field("dsn", &self.active_dsn().as_deref().map(masked_dsn))
            .finish_non_exhaustive()
    }
}

impl Endpoint {
    pub(crate) fn new(label: &'static str, factory: Arc<dyn HandleFactory>) -> Self {
        Self {
            label,
            factory,
            handle: tokio::sync::Mutex::new(None),
            active: AtomicBool::new(false),
            info: Mutex::new(EndpointInfo::default()),
        }
    }

    /// A closed endpoint sharing this one's factory.
    pub(crate) fn duplicate(&self) -> Self {
        Self::new(self.label, Arc::clone(&self.factory))
    }

    pub(crate) fn set_factory(&mut self, factory: Arc<dyn HandleFactory>) {
        self.factory = factory;
    }

    pub(crate) fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    /// The handle, opened through the factory on first use.
    pub(crate) async fn handle(&self, options: &ConnectionOptions) -> DbResult<HandleGuard> {
        let mut slot = self.handle.lock().await;
        if slot.is_none() {
            let created = self.open(options).await?;
            *slot = Some(Arc::new(tokio::sync::Mutex::new(created.handle)));
            lock_unpoisoned(&self.info).config = Some(created.config);
            self.active.store(true, Ordering::Release);
        }
        let shared = slot
            .clone()
            .ok_or_else(|| DbError::internal(format!("{} handle vanished while locked", self.label)))?;
        drop(slot);
        Ok(shared.lock_owned().await)
    }

    /// The handle if one is open; never connects.
    pub(crate) async fn existing_handle(&self) -> Option<HandleGuard> {
        let shared = self.handle.lock().await.clone()?;
        Some(shared.lock_owned().await)
    }

    async fn open(&self, options: &ConnectionOptions) -> DbResult<CreatedHandle> {
        if options.enable_logging {
            info!(connection = %options.id, endpoint = self.label, "Opening DB connection");
        }

        let result = if options.enable_profiling {
            let start = Instant::now();
            let result = self
                .factory
                .create_handle()
                .instrument(info_span!("db.connect", connection = %options.id, endpoint = self.label))
                .await;
            debug!(
                endpoint = self.label,
                elapsed_ms = start.elapsed().as_millis() as u64,
                "Connection attempt finished"
            );
            result
        } else {
            self.factory.create_handle().await
        };

        match &result {
            Ok(created) if options.enable_logging => {
                info!(
                    connection = %options.id,
                    endpoint = self.label,
                    dsn = %created.config.dsn.as_deref().map(masked_dsn).unwrap_or_default(),
                    "DB connection opened"
                );
            }
            Err(e) if options.enable_logging => {
                warn!(connection = %options.id, endpoint = self.label, error = %e, "Failed to open DB connection");
            }
            _ => {}
        }
        result
    }

    /// Close and discard the handle. Returns whether one was open.
    pub(crate) async fn close(&self, options: &ConnectionOptions) -> bool {
        let mut slot = self.handle.lock().await;
        let Some(shared) = slot.take() else {
            return false;
        };

        if options.enable_logging {
            info!(
                connection = %options.id,
                endpoint = self.label,
                dsn = %self.active_dsn().as_deref().map(masked_dsn).unwrap_or_default(),
                "Closing DB connection"
            );
        }
        let mut handle = shared.lock_owned().await;
        if let Err(e) = handle.close().await {
            warn!(endpoint = self.label, error = %e, "Error while closing DB connection");
        }

        self.active.store(false, Ordering::Release);
        *lock_unpoisoned(&self.info) = EndpointInfo::default();
        true
    }

    /// Server version, queried once per opened handle.
    pub(crate) async fn server_version(&self, options: &ConnectionOptions) -> DbResult<String> {
        let cached = lock_unpoisoned(&self.info).server_version.clone();
        if let Some(version) = cached {
            return Ok(version);
        }
        let version = self.handle(options).await?.server_version().await?;
        lock_unpoisoned(&self.info).server_version = Some(version.clone());
        Ok(version)
    }

    /// Effective config of the open handle.
    pub(crate) fn active_config(&self) -> Option<ServerConfig> {
        lock_unpoisoned(&self.info).config.clone()
    }

    pub(crate) fn active_dsn(&self) -> Option<String> {
        lock_unpoisoned(&self.info)
            .config
            .as_ref()
            .and_then(|config| config.dsn.clone())
    }

    /// DSN of the open handle, or the one the factory would use.
    pub(crate) fn dsn(&self) -> Option<String> {
        self.active_dsn().or_else(|| self.configured_dsn())
    }

    pub(crate) fn configured_dsn(&self) -> Option<String> {
        self.factory.configured_dsn()
    }
}
