//! Teardown contract between the event bus and the context that owns a client.
//!
//! The bus does not know what a "component" is. It only needs somewhere to
//! register a cleanup callback that runs exactly once when the owning
//! context ends. [`LifecycleHost`] is that contract and [`Scope`] is the
//! host this crate ships with.

use std::sync::{Arc, Mutex};

use crate::sync::lock;

/// Cleanup callback registered with a [`LifecycleHost`].
pub type Teardown = Box<dyn FnOnce() + Send>;

/// A context that runs registered cleanup callbacks when it ends.
///
/// Implementations must invoke every registered callback exactly once.
pub trait LifecycleHost: Send + Sync {
    /// Register `cleanup` to run when this context ends.
    fn on_teardown(&self, cleanup: Teardown);
}

#[derive(Default)]
struct ScopeState {
    ended: bool,
    cleanups: Vec<Teardown>,
}

impl Drop for ScopeState {
    fn drop(&mut self) {
        for cleanup in self.cleanups.drain(..) {
            cleanup();
        }
    }
}

/// A simple lifecycle host.
///
/// Cloning a `Scope` creates another handle to the same context. The scope
/// ends on an explicit [`end`](Scope::end) or when the last handle drops.
///
/// # Example
///
/// ```
/// use reactive_kit::{LifecycleHost, Scope};
///
/// let scope = Scope::new();
/// scope.on_teardown(Box::new(|| println!("released")));
/// scope.end(); // prints "released"
/// scope.end(); // no-op
/// ```
#[derive(Clone, Default)]
pub struct Scope {
    state: Arc<Mutex<ScopeState>>,
}

impl Scope {
    /// Create a new, live scope.
    pub fn new() -> Self {
        Self::default()
    }

    /// End the scope, running every registered cleanup in registration order.
    ///
    /// Calling `end` again does nothing.
    pub fn end(&self) {
        let cleanups = {
            let mut state = lock(&self.state);
            if state.ended {
                return;
            }
            state.ended = true;
            std::mem::take(&mut state.cleanups)
        };
        for cleanup in cleanups {
            cleanup();
        }
    }

    /// Returns true once the scope has ended.
    pub fn is_ended(&self) -> bool {
        lock(&self.state).ended
    }

    /// Number of cleanups still waiting for the scope to end.
    pub fn pending_cleanups(&self) -> usize {
        lock(&self.state).cleanups.len()
    }
}

impl LifecycleHost for Scope {
    /// Cleanups registered after the scope ended run immediately.
    fn on_teardown(&self, cleanup: Teardown) {
        let mut state = lock(&self.state);
        if state.ended {
            drop(state);
            cleanup();
            return;
        }
        state.cleanups.push(cleanup);
    }
}

impl std::fmt::Debug for Scope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = lock(&self.state);
        f.debug_struct("Scope")
            .field("ended", &state.ended)
            .field("pending_cleanups", &state.cleanups.len())
            .finish()
    }
}
