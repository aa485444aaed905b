//! Cancellable operation handles (C7) and the shared cancellation flag
//! used by the cache-query sub-operation (C4) underneath them.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};

/// A cancellable flag shared between the issuer of an async unit of work
/// and whatever polls it for cancellation at its check-in points (spec
/// §5: "observable ... at the next check-in point").
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self(Arc::new(AtomicBool::new(false)))
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// A lightweight cancellable reference to in-flight work. Cancellation
/// is idempotent and, for a bare `Operation`, only flips the shared flag
/// --- composition with a cancel hook is [`CombinedOperation`]'s job.
#[derive(Debug, Clone)]
pub struct Operation {
    flag: CancelFlag,
}

impl Operation {
    pub fn new() -> Self {
        Self { flag: CancelFlag::new() }
    }

    pub fn from_flag(flag: CancelFlag) -> Self {
        Self { flag }
    }

    pub fn cancel(&self) {
        self.flag.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.is_cancelled()
    }

    pub fn flag(&self) -> CancelFlag {
        self.flag.clone()
    }
}

impl Default for Operation {
    fn default() -> Self {
        Self::new()
    }
}

/// A thunk invoked exactly once, either immediately (if set after
/// cancellation) or at `cancel()` time.
type CancelHook = Box<dyn FnOnce() + Send + 'static>;

/// Combines a cache-query sub-operation with a download sub-operation
/// under one cancellable identity (C7, spec §4.6).
///
/// The cancel hook captures only a [`Weak`] back-reference to this
/// struct's cancellation machinery, never the struct itself: a strong
/// capture would create `Arc` cycle (hook -> operation -> hook) that
/// never frees until explicitly cancelled. See spec §9 "Cyclic lifetime
/// between a combined operation and its own cancel hook".
pub struct CombinedOperation {
    inner: Arc<Inner>,
}

struct Inner {
    cancelled: AtomicBool,
    cache_operation: Mutex<Option<Operation>>,
    cancel_hook: Mutex<Option<CancelHook>>,
}

impl CombinedOperation {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                cancelled: AtomicBool::new(false),
                cache_operation: Mutex::new(None),
                cancel_hook: Mutex::new(None),
            }),
        }
    }

    /// A weak handle suitable for capture inside a cancel hook without
    /// creating a reference cycle.
    pub fn downgrade(&self) -> WeakCombinedOperation {
        WeakCombinedOperation { inner: Arc::downgrade(&self.inner) }
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::SeqCst)
    }

    /// Identity comparison --- two clones of the same handle compare
    /// equal; two distinct operations never do, even if both are
    /// cancelled.
    pub fn is_same_as(&self, other: &CombinedOperation) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    pub fn set_cache_operation(&self, operation: Operation) {
        *self.inner.cache_operation.lock().unwrap() = Some(operation);
    }

    /// Sets the cancel hook; if this operation is already cancelled, the
    /// hook runs immediately instead of being stored (spec §4.6).
    pub fn set_cancel_hook(&self, hook: impl FnOnce() + Send + 'static) {
        if self.is_cancelled() {
            hook();
            return;
        }
        *self.inner.cancel_hook.lock().unwrap() = Some(Box::new(hook));
    }

    /// Cancels the operation: flips the flag, cancels and clears the
    /// cache sub-operation, then invokes and clears the cancel hook.
    /// Idempotent --- a second call is a no-op.
    pub fn cancel(&self) {
        if self.inner.cancelled.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(op) = self.inner.cache_operation.lock().unwrap().take() {
            op.cancel();
        }
        let hook = self.inner.cancel_hook.lock().unwrap().take();
        if let Some(hook) = hook {
            hook();
        }
    }
}

impl Default for CombinedOperation {
    fn default() -> Self {
        Self::new()
    }
}

impl Clone for CombinedOperation {
    fn clone(&self) -> Self {
        Self { inner: Arc::clone(&self.inner) }
    }
}

/// Weak back-reference to a [`CombinedOperation`]; upgraded on
/// invocation, a no-op if the operation has already been dropped.
#[derive(Clone)]
pub struct WeakCombinedOperation {
    inner: Weak<Inner>,
}

impl WeakCombinedOperation {
    pub fn upgrade(&self) -> Option<CombinedOperation> {
        self.inner.upgrade().map(|inner| CombinedOperation { inner })
    }
}
