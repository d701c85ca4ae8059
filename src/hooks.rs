//! Pre-shutdown hook registry
//!
//! Hooks are registered during startup and executed exactly once, after the
//! shutdown signal but before the listener stops accepting. The registry is
//! written only at startup and read only at shutdown, so a plain mutex is
//! enough.

use std::sync::Mutex;

use tracing::{info, warn};

type Hook = Box<dyn FnOnce() + Send>;

/// Registry of callbacks to run before the listener shuts down
#[derive(Default)]
pub struct PreShutdownHooks {
    hooks: Mutex<Vec<(String, Hook)>>,
}

impl PreShutdownHooks {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a named hook. Names are only used for logging.
    pub fn register(&self, name: impl Into<String>, hook: impl FnOnce() + Send + 'static) {
        let name = name.into();
        match self.hooks.lock() {
            Ok(mut hooks) => hooks.push((name, Box::new(hook))),
            Err(_) => warn!(hook = %name, "hook registry poisoned, dropping hook"),
        }
    }

    /// Run all registered hooks in registration order.
    ///
    /// Draining the registry makes a second call a no-op.
    pub fn run(&self) {
        let hooks = match self.hooks.lock() {
            Ok(mut hooks) => std::mem::take(&mut *hooks),
            Err(_) => {
                warn!("hook registry poisoned, skipping pre-shutdown hooks");
                return;
            }
        };

        for (name, hook) in hooks {
            info!(hook = %name, "running pre-shutdown hook");
            hook();
        }
    }
}
