//! Weft context projector.
//!
//! A view is a pure function of a [`Context`]: [`project`] folds the context's
//! events through a [`ViewSpec`] and never stores anything. [`Projector`] adds
//! an optional cache of fold states keyed by context length, so a reader that
//! asks for the same view over a growing log only folds the new suffix. Cached
//! and uncached results are identical.

mod fold;
pub mod view;

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};

use tracing::trace;
use weft_types::{Context, EventId};

use crate::fold::Accumulator;
pub use view::{NamedMeasure, NamedPredicate, Take, View, ViewSpec};

/// Compute `spec` over `context`. Pure: same inputs, same output.
pub fn project(context: &Context, spec: &ViewSpec) -> View {
    let mut acc = Accumulator::start(spec);
    for event in context.iter() {
        acc.push(spec, event);
    }
    acc.finish()
}

/// Cached views kept by a [`Projector`] unless configured otherwise.
pub const DEFAULT_CACHE_CAPACITY: usize = 256;

struct CachedFold {
    len: usize,
    last_id: Option<EventId>,
    acc: Accumulator,
    used: u64,
}

struct FoldCache {
    folds: HashMap<String, CachedFold>,
    tick: u64,
}

/// Projection with incremental folds.
///
/// A cached fold is reused only when it was built over a prefix of the
/// requested context, checked by the id of the last folded event. Anything
/// else recomputes from scratch. At most `capacity` views are cached; the
/// least recently used one is evicted first.
pub struct Projector {
    cache: Mutex<FoldCache>,
    capacity: usize,
}

impl Default for Projector {
    fn default() -> Self {
        Self::with_capacity(DEFAULT_CACHE_CAPACITY)
    }
}

impl Projector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            cache: Mutex::new(FoldCache {
                folds: HashMap::new(),
                tick: 0,
            }),
            capacity,
        }
    }

    pub fn project(&self, context: &Context, spec: &ViewSpec) -> View {
        let key = spec.key();
        let mut cache = self.cache.lock().unwrap_or_else(PoisonError::into_inner);
        cache.tick += 1;
        let tick = cache.tick;

        let reusable = cache.folds.remove(&key).filter(|cached| {
            cached.len <= context.len()
                && match cached.last_id {
                    None => true,
                    Some(id) => context
                        .get(cached.len - 1)
                        .is_some_and(|event| event.id == id),
                }
        });

        let (mut acc, start) = match reusable {
            Some(cached) => (cached.acc, cached.len),
            None => (Accumulator::start(spec), 0),
        };

        for event in &context.events()[start..] {
            acc.push(spec, event);
        }
        trace!(view = %key, reused = start, folded = context.len() - start, "View projected");

        let view = acc.finish();
        if self.capacity == 0 {
            return view;
        }
        if cache.folds.len() >= self.capacity {
            let stale = cache
                .folds
                .iter()
                .min_by_key(|(_, fold)| fold.used)
                .map(|(key, _)| key.clone());
            if let Some(stale) = stale {
                cache.folds.remove(&stale);
            }
        }
        cache.folds.insert(
            key,
            CachedFold {
                len: context.len(),
                last_id: context.last().map(|e| e.id),
                acc,
                used: tick,
            },
        );
        view
    }

    /// Number of cached views.
    pub fn cached(&self) -> usize {
        self.cache
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .folds
            .len()
    }

    /// Drop the cached fold of one view.
    pub fn forget(&self, spec: &ViewSpec) {
        self.cache
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .folds
            .remove(&spec.key());
    }

    pub fn clear(&self) {
        self.cache
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .folds
            .clear();
    }
}
