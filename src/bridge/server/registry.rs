use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use dashmap::{DashMap, Entry};
use tracing::{debug, info};

use crate::bridge::call::{CallId, CallMeta};
use crate::bridge::error::{CallError, RouterError};
use crate::bridge::propagate::CallAbort;
use crate::bridge::shape::CallShape;

pub struct CallEntry {
    pub method: Arc<str>,
    pub shape: CallShape,
    abort: Option<Weak<dyn CallAbort>>,
}

impl std::fmt::Debug for CallEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallEntry")
            .field("method", &self.method)
            .field("shape", &self.shape)
            .finish()
    }
}

/// Calls currently served by a router, optionally capped.
#[derive(Debug)]
pub struct CallRegistry {
    calls: DashMap<CallId, CallEntry, ahash::RandomState>,
    limit: Option<usize>,
    /// Slots held by registered calls and by registrations in progress.
    reserved: AtomicUsize,
}

impl CallRegistry {
    pub fn new() -> Self {
        Self::with_limit(None)
    }

    pub fn with_limit(limit: Option<usize>) -> Self {
        Self {
            calls: DashMap::default(),
            limit,
            reserved: AtomicUsize::new(0),
        }
    }

    pub fn limit(&self) -> Option<usize> {
        self.limit
    }

    fn reserve(&self) -> Result<(), RouterError> {
        let Some(limit) = self.limit else {
            self.reserved.fetch_add(1, Ordering::AcqRel);
            return Ok(());
        };
        self.reserved
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |held| {
                (held < limit).then_some(held + 1)
            })
            .map(|_| ())
            .map_err(|_| RouterError::TooManyCalls(limit))
    }

    fn release(&self) {
        self.reserved.fetch_sub(1, Ordering::AcqRel);
    }

    /// Track a call until the returned guard is dropped. Fails once the limit is reached.
    pub fn try_register(self: &Arc<Self>, meta: &CallMeta) -> Result<CallGuard, RouterError> {
        self.reserve()?;
        match self.calls.entry(meta.id.clone()) {
            Entry::Occupied(_) => {
                self.release();
                Err(RouterError::CallAlreadyActive(meta.id.clone()))
            }
            Entry::Vacant(slot) => {
                slot.insert(CallEntry {
                    method: Arc::clone(&meta.method),
                    shape: meta.shape,
                    abort: None,
                });
                Ok(CallGuard {
                    registry: Arc::clone(self),
                    id: meta.id.clone(),
                })
            }
        }
    }

    pub fn contains(&self, id: &CallId) -> bool {
        self.calls.contains_key(id)
    }

    pub fn method_of(&self, id: &CallId) -> Option<Arc<str>> {
        self.calls.get(id).map(|entry| Arc::clone(&entry.method))
    }

    pub fn len(&self) -> usize {
        self.calls.len()
    }

    pub fn is_empty(&self) -> bool {
        self.calls.is_empty()
    }

    /// Cancel every tracked call. Returns how many were still alive.
    pub fn cancel_all(&self, reason: &str) -> usize {
        let aborts: Vec<_> = self
            .calls
            .iter()
            .filter_map(|entry| entry.abort.as_ref().and_then(Weak::upgrade))
            .collect();

        info!(calls = aborts.len(), reason, "Cancelling active calls");
        for abort in &aborts {
            abort.abort(CallError::Cancelled(reason.to_string()));
        }
        aborts.len()
    }
}

impl Default for CallRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Removes its call from the registry when dropped.
pub struct CallGuard {
    registry: Arc<CallRegistry>,
    id: CallId,
}

impl CallGuard {
    pub fn id(&self) -> &CallId {
        &self.id
    }

    pub(crate) fn attach(&self, abort: Weak<dyn CallAbort>) {
        if let Some(mut entry) = self.registry.calls.get_mut(&self.id) {
            entry.abort = Some(abort);
        }
    }
}

impl Drop for CallGuard {
    fn drop(&mut self) {
        self.registry.calls.remove(&self.id);
        self.registry.release();
        debug!(call_id = %self.id, "Call removed from registry");
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;
    use crate::bridge::call::Side;

    fn meta() -> CallMeta {
        CallMeta::new("greeter.Greeter/SayHello", CallShape::SingleSingle, Side::Server)
    }

    #[derive(Default)]
    struct AbortLog(Mutex<Vec<CallError>>);

    impl CallAbort for AbortLog {
        fn abort(&self, error: CallError) {
            self.0.lock().unwrap().push(error);
        }
    }

    #[test]
    fn test_register_call() {
        let registry = Arc::new(CallRegistry::new());
        let meta = meta();

        let guard = registry.try_register(&meta).unwrap();
        assert!(registry.contains(guard.id()));
        assert_eq!(registry.len(), 1);
        assert_eq!(
            registry.method_of(&meta.id).as_deref(),
            Some("greeter.Greeter/SayHello")
        );
    }

    #[test]
    fn test_duplicate_call_error() {
        let registry = Arc::new(CallRegistry::new());
        let meta = meta();

        let _guard = registry.try_register(&meta).unwrap();

        // Second attempt should fail
        let result = registry.try_register(&meta);
        assert!(matches!(result, Err(RouterError::CallAlreadyActive(_))));
    }

    #[test]
    fn test_guard_drop_removes_call() {
        let registry = Arc::new(CallRegistry::new());
        let meta = meta();

        let guard = registry.try_register(&meta).unwrap();
        drop(guard);
        assert!(!registry.contains(&meta.id));
        assert!(registry.is_empty());

        // Registering again should succeed
        assert!(registry.try_register(&meta).is_ok());
    }

    #[test]
    fn test_limit_frees_slot_on_drop() {
        let registry = Arc::new(CallRegistry::with_limit(Some(1)));

        let guard = registry.try_register(&meta()).unwrap();
        let result = registry.try_register(&meta());
        assert!(matches!(result, Err(RouterError::TooManyCalls(1))));

        drop(guard);
        assert!(registry.try_register(&meta()).is_ok());
    }

    #[test]
    fn test_duplicate_does_not_hold_a_slot() {
        let registry = Arc::new(CallRegistry::with_limit(Some(2)));
        let active = meta();

        let _guard = registry.try_register(&active).unwrap();
        for _ in 0..3 {
            let result = registry.try_register(&active);
            assert!(matches!(result, Err(RouterError::CallAlreadyActive(_))));
        }
        assert!(registry.try_register(&meta()).is_ok());
    }

    #[test]
    fn test_concurrent_registrations_respect_limit() {
        let registry = Arc::new(CallRegistry::with_limit(Some(3)));
        let guards = Mutex::new(Vec::new());

        std::thread::scope(|scope| {
            for _ in 0..8 {
                scope.spawn(|| {
                    if let Ok(guard) = registry.try_register(&meta()) {
                        guards.lock().unwrap().push(guard);
                    }
                });
            }
        });

        assert_eq!(guards.lock().unwrap().len(), 3);
        assert_eq!(registry.len(), 3);
    }

    #[test]
    fn test_cancel_all_reaches_live_calls() {
        let registry = Arc::new(CallRegistry::new());
        let live = Arc::new(AbortLog::default());
        let gone = Arc::new(AbortLog::default());

        let first = registry.try_register(&meta()).unwrap();
        let live_dyn: Arc<dyn CallAbort> = live.clone();
        first.attach(Arc::downgrade(&live_dyn));

        let second = registry.try_register(&meta()).unwrap();
        let gone_dyn: Arc<dyn CallAbort> = gone.clone();
        second.attach(Arc::downgrade(&gone_dyn));
        drop(gone_dyn);
        drop(gone);

        assert_eq!(registry.cancel_all("shutting down"), 1);
        let errors = live.0.lock().unwrap();
        assert!(matches!(errors.as_slice(), [CallError::Cancelled(r)] if r == "shutting down"));
    }
}
