//! Ambient configuration carried alongside every subscription.
//!
//! A [`Context`] is an immutable, cheaply cloned type map. Every scope owns
//! one, every attach captures the subscriber's context at subscribe time, and
//! every sink call receives the context of the subscriber it is delivering to.
//! Nothing is read from thread-locals.

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, OnceLock};

use crate::config::RillConfig;
use crate::time::{Clock, TokioClock};

type Entries = HashMap<TypeId, Arc<dyn Any + Send + Sync>>;

/// Immutable type map of ambient services and settings.
#[derive(Clone, Default)]
pub struct Context {
    entries: Arc<Entries>,
}

/// Context entry holding the clock used for delays and logical ticks.
#[derive(Clone)]
pub struct ClockHandle(pub Arc<dyn Clock>);

impl Context {
    /// An empty context.
    pub fn new() -> Self {
        Self::default()
    }

    /// Return a copy of this context with `value` added (replacing any value
    /// of the same type).
    pub fn with<T: Any + Send + Sync>(&self, value: T) -> Self {
        let mut next = self.clone();
        next.insert(value);
        next
    }

    /// Add `value` in place. Other clones of this context are unaffected.
    pub fn insert<T: Any + Send + Sync>(&mut self, value: T) {
        Arc::make_mut(&mut self.entries).insert(TypeId::of::<T>(), Arc::new(value));
    }

    /// Look up the value of type `T`.
    pub fn get<T: Any + Send + Sync>(&self) -> Option<Arc<T>> {
        self.entries
            .get(&TypeId::of::<T>())
            .cloned()
            .and_then(|entry| entry.downcast::<T>().ok())
    }

    /// Whether a value of type `T` is present.
    pub fn contains<T: Any + Send + Sync>(&self) -> bool {
        self.entries.contains_key(&TypeId::of::<T>())
    }

    /// Layer `other` on top of this context; entries in `other` win.
    pub fn merge(&self, other: &Context) -> Context {
        if other.is_empty() {
            return self.clone();
        }
        if self.is_empty() {
            return other.clone();
        }
        let mut entries = (*self.entries).clone();
        entries.extend(other.entries.iter().map(|(k, v)| (*k, v.clone())));
        Context {
            entries: Arc::new(entries),
        }
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the context has no entries.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Active configuration, falling back to defaults.
    pub fn config(&self) -> Arc<RillConfig> {
        self.get::<RillConfig>()
            .unwrap_or_else(|| default_config().clone())
    }

    /// Active clock, falling back to the shared Tokio clock.
    pub fn clock(&self) -> Arc<dyn Clock> {
        match self.get::<ClockHandle>() {
            Some(handle) => handle.0.clone(),
            None => default_clock().clone(),
        }
    }

    /// Return a copy of this context using `clock`.
    pub fn with_clock(&self, clock: Arc<dyn Clock>) -> Self {
        self.with(ClockHandle(clock))
    }
}

fn default_config() -> &'static Arc<RillConfig> {
    static CONFIG: OnceLock<Arc<RillConfig>> = OnceLock::new();
    CONFIG.get_or_init(|| Arc::new(RillConfig::default()))
}

fn default_clock() -> &'static Arc<dyn Clock> {
    static CLOCK: OnceLock<Arc<dyn Clock>> = OnceLock::new();
    CLOCK.get_or_init(|| Arc::new(TokioClock::new()))
}

impl fmt::Debug for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Context")
            .field("entries", &self.entries.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, PartialEq)]
    struct Tenant(&'static str);

    #[test]
    fn test_with_does_not_mutate_original() {
        let base = Context::new();
        let extended = base.with(Tenant("a"));

        assert!(base.get::<Tenant>().is_none());
        assert_eq!(*extended.get::<Tenant>().unwrap(), Tenant("a"));
    }

    #[test]
    fn test_merge_prefers_right_hand_side() {
        let left = Context::new().with(Tenant("left")).with(7u32);
        let right = Context::new().with(Tenant("right"));
        let merged = left.merge(&right);

        assert_eq!(*merged.get::<Tenant>().unwrap(), Tenant("right"));
        assert_eq!(*merged.get::<u32>().unwrap(), 7);
        assert_eq!(merged.len(), 2);
    }

    #[test]
    fn test_config_falls_back_to_default() {
        let cx = Context::new();
        assert_eq!(*cx.config(), RillConfig::default());

        let custom = RillConfig {
            keyed_debounce_ms: 25,
            ..RillConfig::default()
        };
        let cx = cx.with(custom.clone());
        assert_eq!(*cx.config(), custom);
    }
}
