//! Explicit owner of the process manager slot

use super::manager::ProcessManager;
use crate::config::EngineConfig;
use crate::error::Result;
use crate::reactor::Reactor;
use std::cell::{Cell, RefCell};
use std::rc::Rc;
use tracing::debug;

/// Process-wide context injected into every controller.
///
/// Holds the reactor, the engine configuration, and the lazily created
/// [`ProcessManager`]. The manager is created on the first launch and torn
/// down once its handle list is empty, but only after a deferred recheck
/// confirms no new launch happened in between. The recheck runs from the
/// reactor, never from inside the manager's own callback.
#[derive(Clone)]
pub struct ProcessContext {
    inner: Rc<ContextInner>,
}

struct ContextInner {
    reactor: Reactor,
    config: EngineConfig,
    manager: RefCell<Option<ProcessManager>>,
    launches: Cell<u64>,
}

impl ProcessContext {
    pub fn new(reactor: Reactor, config: EngineConfig) -> Self {
        Self {
            inner: Rc::new(ContextInner {
                reactor,
                config,
                manager: RefCell::new(None),
                launches: Cell::new(0),
            }),
        }
    }

    pub fn with_defaults(reactor: Reactor) -> Self {
        Self::new(reactor, EngineConfig::default())
    }

    pub fn reactor(&self) -> &Reactor {
        &self.inner.reactor
    }

    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    /// The manager, if one is currently alive
    pub fn manager(&self) -> Option<ProcessManager> {
        self.inner.manager.borrow().clone()
    }

    /// Children started through this context and not yet reaped
    pub fn live_children(&self) -> usize {
        self.inner
            .manager
            .borrow()
            .as_ref()
            .map_or(0, ProcessManager::live_handles)
    }

    /// Get the manager for a new launch, creating it if needed
    pub(crate) fn acquire_manager(&self) -> Result<ProcessManager> {
        self.inner.launches.set(self.inner.launches.get() + 1);

        if let Some(manager) = self.manager() {
            return Ok(manager);
        }

        let manager = ProcessManager::create(&self.inner.reactor, self.inner.config.read_block_size)?;
        let weak = Rc::downgrade(&self.inner);
        manager.set_on_idle(move || {
            if let Some(inner) = weak.upgrade() {
                ContextInner::schedule_release(&inner);
            }
        });
        *self.inner.manager.borrow_mut() = Some(manager.clone());
        Ok(manager)
    }

    /// Let an unused manager go after a launch that never registered a child
    pub(crate) fn release_if_idle(&self) {
        ContextInner::schedule_release(&self.inner);
    }

    /// Tear the manager down now, whatever it still tracks
    pub fn shutdown(&self) {
        let manager = self.inner.manager.borrow_mut().take();
        if let Some(manager) = manager {
            manager.shutdown();
        }
    }
}

impl ContextInner {
    fn schedule_release(this: &Rc<Self>) {
        let generation = this.launches.get();
        let weak = Rc::downgrade(this);
        this.reactor.defer(move || {
            if let Some(inner) = weak.upgrade() {
                inner.release_if_unused(generation);
            }
        });
    }

    fn release_if_unused(&self, generation: u64) {
        if self.launches.get() != generation {
            return;
        }
        let idle = self
            .manager
            .borrow()
            .as_ref()
            .is_some_and(|m| m.live_handles() == 0);
        if !idle {
            return;
        }

        let manager = self.manager.borrow_mut().take();
        if let Some(manager) = manager {
            debug!("no children left, releasing process manager");
            manager.shutdown();
        }
    }
}

impl Drop for ContextInner {
    fn drop(&mut self) {
        if let Some(manager) = self.manager.get_mut().take() {
            manager.shutdown();
        }
    }
}
