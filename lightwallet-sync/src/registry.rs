//! At most one processor per (network, alias).
//!
//! Two processors over the same wallet storage would race each other's
//! rewinds, so construction goes through a registry that either refuses or
//! waits until the previous holder has shut down.

use std::collections::HashMap;
use std::sync::Arc;

use lightwallet_params::NetworkType;
use once_cell::sync::Lazy;
use parking_lot::Mutex;
use tokio::sync::Notify;

use crate::error::{Error, Result};

static GLOBAL_REGISTRY: Lazy<ProcessorRegistry> = Lazy::new(ProcessorRegistry::new);

/// Identity of a processor
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ProcessorKey {
    /// Network the wallet lives on
    pub network: NetworkType,
    /// Wallet alias
    pub alias: String,
}

impl ProcessorKey {
    /// Create a key
    pub fn new(network: NetworkType, alias: impl Into<String>) -> Self {
        Self {
            network,
            alias: alias.into(),
        }
    }
}

impl std::fmt::Display for ProcessorKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.network, self.alias)
    }
}

/// Lifecycle of a registered processor
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lifecycle {
    /// Running or ready to run
    Active,
    /// Shutting down; the key frees up when its registration drops
    Stopping,
}

#[derive(Debug)]
struct Entry {
    lifecycle: Lifecycle,
    released: Arc<Notify>,
}

/// Registry of live processors
#[derive(Debug, Clone, Default)]
pub struct ProcessorRegistry {
    entries: Arc<Mutex<HashMap<ProcessorKey, Entry>>>,
}

impl ProcessorRegistry {
    /// Empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Process-wide registry
    pub fn global() -> &'static ProcessorRegistry {
        &GLOBAL_REGISTRY
    }

    /// Claim `key`, failing if another processor holds it
    pub fn try_register(&self, key: ProcessorKey) -> Result<Registration> {
        let mut entries = self.entries.lock();
        if entries.contains_key(&key) {
            return Err(Error::ProcessorAlreadyRunning(key.to_string()));
        }
        entries.insert(
            key.clone(),
            Entry {
                lifecycle: Lifecycle::Active,
                released: Arc::new(Notify::new()),
            },
        );
        tracing::debug!("Registered processor {}", key);
        Ok(Registration {
            key,
            entries: self.entries.clone(),
        })
    }

    /// Claim `key`, waiting for the current holder to release it
    pub async fn register(&self, key: ProcessorKey) -> Registration {
        loop {
            let released = {
                let entries = self.entries.lock();
                match entries.get(&key) {
                    Some(entry) => entry.released.clone(),
                    None => {
                        drop(entries);
                        match self.try_register(key.clone()) {
                            Ok(registration) => return registration,
                            Err(_) => continue,
                        }
                    }
                }
            };

            let notified = released.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            // The holder may have released between the lookup and `enable`.
            if self.lifecycle(&key).is_none() {
                continue;
            }
            tracing::debug!("Waiting for processor {} to shut down", key);
            notified.await;
        }
    }

    /// Lifecycle of `key`, `None` when free
    pub fn lifecycle(&self, key: &ProcessorKey) -> Option<Lifecycle> {
        self.entries.lock().get(key).map(|entry| entry.lifecycle)
    }

    /// Number of registered processors
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    /// True when no processor is registered
    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

/// Claim on a processor identity; released on drop
#[derive(Debug)]
pub struct Registration {
    key: ProcessorKey,
    entries: Arc<Mutex<HashMap<ProcessorKey, Entry>>>,
}

impl Registration {
    /// Claimed identity
    pub fn key(&self) -> &ProcessorKey {
        &self.key
    }

    /// Mark the processor as shutting down
    pub fn mark_stopping(&self) {
        if let Some(entry) = self.entries.lock().get_mut(&self.key) {
            entry.lifecycle = Lifecycle::Stopping;
        }
    }
}

impl Drop for Registration {
    fn drop(&mut self) {
        if let Some(entry) = self.entries.lock().remove(&self.key) {
            entry.released.notify_waiters();
            tracing::debug!("Released processor {}", self.key);
        }
    }
}
