//! RefContext: the explicit root for policy shared by a group of objects.
//!
//! Objects created with `RefPtr::new_in` take their thread-safety default
//! and delete handler from their context. They refer to it weakly: dropping
//! the last `Arc<RefContext>` drops its handler, which destroys whatever it
//! still holds, and later releases destroy in place. `RefPtr::new`
//! uses the process-wide context, built from the environment on first use.

use crate::config::RefConfig;
use crate::delete_handler::DeleteHandler;
use core::fmt;
use parking_lot::RwLock;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};

static GLOBAL: OnceLock<RefContext> = OnceLock::new();

pub struct RefContext {
    default_thread_safe: AtomicBool,
    delete_handler: RwLock<Option<Arc<dyn DeleteHandler>>>,
}

impl RefContext {
    pub fn new(config: RefConfig) -> Self {
        Self {
            default_thread_safe: AtomicBool::new(config.default_thread_safe),
            delete_handler: RwLock::new(None),
        }
    }

    /// The process-wide context.
    ///
    /// Initialized once from `RefConfig::from_env`; an unreadable
    /// environment is logged and the defaults are used.
    pub fn global() -> &'static RefContext {
        GLOBAL.get_or_init(|| {
            let config = RefConfig::from_env().unwrap_or_else(|err| {
                log::warn!("{err}; using default reference counting configuration");
                RefConfig::default()
            });
            RefContext::new(config)
        })
    }

    pub fn default_thread_safe(&self) -> bool {
        self.default_thread_safe.load(Ordering::Acquire)
    }

    /// Change the default for objects constructed from now on. Existing
    /// objects keep their setting.
    pub fn set_default_thread_safe(&self, thread_safe: bool) {
        self.default_thread_safe
            .store(thread_safe, Ordering::Release);
    }

    /// Replace the delete handler. The previous handler is dropped here,
    /// or once the last in-flight `request_delete` on it returns.
    pub fn install_delete_handler(&self, handler: Arc<dyn DeleteHandler>) {
        let previous = self.delete_handler.write().replace(handler);
        drop(previous);
    }

    /// Remove the delete handler; later destructions happen in place.
    pub fn take_delete_handler(&self) -> Option<Arc<dyn DeleteHandler>> {
        self.delete_handler.write().take()
    }

    pub fn delete_handler(&self) -> Option<Arc<dyn DeleteHandler>> {
        self.delete_handler.read().clone()
    }
}

impl Default for RefContext {
    fn default() -> Self {
        Self::new(RefConfig::default())
    }
}

impl fmt::Debug for RefContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RefContext")
            .field("default_thread_safe", &self.default_thread_safe())
            .field("delete_handler", &self.delete_handler.read().is_some())
            .finish()
    }
}
