//! Observer registry for policy hooks, notification hooks and change
//! listeners.
//!
//! Hooks are externally supplied callables (scripted filters, plugin
//! callbacks) invoked at defined pipeline points. The registry holds ordered
//! lists per hook kind so multiple listeners can coexist without the
//! orchestrator depending on concrete hook types. All invocations are
//! serialized by a single registry-wide lock: the runtimes backing real hooks
//! (embedded interpreters, plugin ABIs) are not reentrant, so at most one
//! hook executes at a time process-wide. Hooks are expected to be fast and
//! side-effect-light.

use crate::{CoreError, CoreResult, InstanceDataset};
use opal_types::{ChangeEvent, Origin, PublicId};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

/// Simplified attribute map handed to hooks.
pub type SimplifiedTags = BTreeMap<String, String>;

/// Policy hook consulted before an instance is persisted. Returning `false`
/// rejects the instance; nothing is persisted.
pub trait ReceivedInstanceFilter: Send + Sync {
    fn filter(&self, simplified: &SimplifiedTags, origin: &Origin) -> CoreResult<bool>;
}

/// Hook allowed to alter instance metadata before persistence.
pub trait InstanceModifier: Send + Sync {
    fn modify(&self, dataset: &mut InstanceDataset, origin: &Origin) -> CoreResult<()>;
}

/// Notification hook invoked after an instance has been committed. Runs
/// outside the store critical section; failures never affect the store
/// outcome.
pub trait OnStoredHook: Send + Sync {
    fn on_stored(
        &self,
        instance: &PublicId,
        simplified: &SimplifiedTags,
        origin: &Origin,
    ) -> CoreResult<()>;
}

/// Sink receiving every committed change event. May be absent.
pub trait ChangeListener: Send + Sync {
    fn signal(&self, event: &ChangeEvent);
}

#[derive(Default)]
struct HookSet {
    filters: Vec<Arc<dyn ReceivedInstanceFilter>>,
    modifiers: Vec<Arc<dyn InstanceModifier>>,
    on_stored: Vec<Arc<dyn OnStoredHook>>,
    listeners: Vec<Arc<dyn ChangeListener>>,
}

/// Registry of hooks and listeners, with serialized invocation.
#[derive(Default)]
pub struct HookRegistry {
    hooks: Mutex<HookSet>,
}

impl HookRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_filter(&self, hook: Arc<dyn ReceivedInstanceFilter>) {
        self.locked().filters.push(hook);
    }

    pub fn register_modifier(&self, hook: Arc<dyn InstanceModifier>) {
        self.locked().modifiers.push(hook);
    }

    pub fn register_on_stored(&self, hook: Arc<dyn OnStoredHook>) {
        self.locked().on_stored.push(hook);
    }

    pub fn register_change_listener(&self, listener: Arc<dyn ChangeListener>) {
        self.locked().listeners.push(listener);
    }

    /// Runs the registered filters in registration order, short-circuiting on
    /// the first rejection.
    ///
    /// # Errors
    ///
    /// A filter failure is surfaced as [`CoreError::Hook`]; the caller treats
    /// it as a failed store, not a rejection.
    pub fn apply_filters(&self, simplified: &SimplifiedTags, origin: &Origin) -> CoreResult<bool> {
        let hooks = self.locked();
        for (i, filter) in hooks.filters.iter().enumerate() {
            let accepted = filter.filter(simplified, origin).map_err(|e| CoreError::Hook {
                name: format!("filter #{i}"),
                detail: e.to_string(),
            })?;
            if !accepted {
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// Runs the registered modify hooks in registration order.
    pub fn apply_modifiers(&self, dataset: &mut InstanceDataset, origin: &Origin) -> CoreResult<()> {
        let hooks = self.locked();
        for (i, modifier) in hooks.modifiers.iter().enumerate() {
            modifier.modify(dataset, origin).map_err(|e| CoreError::Hook {
                name: format!("modifier #{i}"),
                detail: e.to_string(),
            })?;
        }
        Ok(())
    }

    /// Runs every registered on-stored hook. A failing hook is logged and the
    /// remaining hooks still run; the first failure is returned so the
    /// scheduler job carrying this invocation can record it.
    pub fn invoke_on_stored(
        &self,
        instance: &PublicId,
        simplified: &SimplifiedTags,
        origin: &Origin,
    ) -> CoreResult<()> {
        let hooks = self.locked();
        let mut first_failure = None;
        for (i, hook) in hooks.on_stored.iter().enumerate() {
            if let Err(e) = hook.on_stored(instance, simplified, origin) {
                tracing::error!("on-stored hook #{} failed for {}: {}", i, instance, e);
                first_failure.get_or_insert(CoreError::Hook {
                    name: format!("on-stored #{i}"),
                    detail: e.to_string(),
                });
            }
        }
        match first_failure {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Delivers a committed change event to every registered listener.
    pub fn notify_change(&self, event: &ChangeEvent) {
        let hooks = self.locked();
        for listener in &hooks.listeners {
            listener.signal(event);
        }
    }

    fn locked(&self) -> std::sync::MutexGuard<'_, HookSet> {
        // Hook state is append-only registration lists; a panic mid-hook
        // cannot leave them half-updated, so a poisoned lock is recovered.
        self.hooks
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

impl std::fmt::Debug for HookRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let hooks = self.locked();
        f.debug_struct("HookRegistry")
            .field("filters", &hooks.filters.len())
            .field("modifiers", &hooks.modifiers.len())
            .field("on_stored", &hooks.on_stored.len())
            .field("listeners", &hooks.listeners.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingFilter {
        accept: bool,
        calls: AtomicUsize,
    }

    impl ReceivedInstanceFilter for CountingFilter {
        fn filter(&self, _simplified: &SimplifiedTags, _origin: &Origin) -> CoreResult<bool> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(self.accept)
        }
    }

    #[test]
    fn test_filters_short_circuit_on_rejection() {
        let registry = HookRegistry::new();
        let rejecting = Arc::new(CountingFilter {
            accept: false,
            calls: AtomicUsize::new(0),
        });
        let unreached = Arc::new(CountingFilter {
            accept: true,
            calls: AtomicUsize::new(0),
        });
        registry.register_filter(rejecting.clone());
        registry.register_filter(unreached.clone());

        let accepted = registry
            .apply_filters(&SimplifiedTags::new(), &Origin::internal())
            .unwrap();

        assert!(!accepted);
        assert_eq!(rejecting.calls.load(Ordering::SeqCst), 1);
        assert_eq!(unreached.calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_no_filters_accepts() {
        let registry = HookRegistry::new();
        assert!(registry
            .apply_filters(&SimplifiedTags::new(), &Origin::internal())
            .unwrap());
    }

    struct FailingHook;

    impl OnStoredHook for FailingHook {
        fn on_stored(
            &self,
            _instance: &PublicId,
            _simplified: &SimplifiedTags,
            _origin: &Origin,
        ) -> CoreResult<()> {
            Err(CoreError::Internal("boom".into()))
        }
    }

    struct RecordingHook {
        calls: AtomicUsize,
    }

    impl OnStoredHook for RecordingHook {
        fn on_stored(
            &self,
            _instance: &PublicId,
            _simplified: &SimplifiedTags,
            _origin: &Origin,
        ) -> CoreResult<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[test]
    fn test_on_stored_failure_does_not_stop_later_hooks() {
        let registry = HookRegistry::new();
        let recording = Arc::new(RecordingHook {
            calls: AtomicUsize::new(0),
        });
        registry.register_on_stored(Arc::new(FailingHook));
        registry.register_on_stored(recording.clone());

        let id = PublicId::derive(&["p", "st", "se", "i"]);
        let result =
            registry.invoke_on_stored(&id, &SimplifiedTags::new(), &Origin::internal());

        assert!(matches!(result, Err(CoreError::Hook { .. })));
        assert_eq!(recording.calls.load(Ordering::SeqCst), 1);
    }
}
