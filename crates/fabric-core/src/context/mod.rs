//! Observable store of typed subsystem contexts
//!
//! Each [`ContextType`] has at most one current [`Context`], loaded by a
//! registered [`ContextLoader`]. Subscribers are called with the new
//! snapshot after every change, in the order the changes were written.
//! Callbacks run outside the store lock, so a callback may read or write the
//! store or drop its own subscription.

mod loaders;
mod types;

pub use loaders::{
    ConfigurationLoader, ContextLoader, DeploymentLoader, IdentityLoader, OperationsLoader,
    RemoteDiscoveryLoader,
};
pub use types::{
    ConfigurationContext, Context, ContextPayload, ContextStatus, ContextType, IdentityContext,
    OperationsContext, RemoteDiscoveryContext,
};

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use crate::collaborators::ProgressFn;
use crate::Error;

/// Callback invoked with each new context snapshot.
pub type ContextCallback = dyn Fn(&Context) + Send + Sync;

#[derive(Default)]
struct StoreState {
    contexts: HashMap<ContextType, Arc<Context>>,
    subscribers: HashMap<ContextType, Vec<(u64, Arc<ContextCallback>)>>,
    loaders: HashMap<ContextType, Arc<dyn ContextLoader>>,
    /// Bumped on every write, so a load can tell whether it was overtaken.
    revisions: HashMap<ContextType, u64>,
    /// Snapshots waiting to be delivered, in write order
    pending: VecDeque<(Arc<Context>, Vec<Arc<ContextCallback>>)>,
    delivering: bool,
    next_subscriber: u64,
}

impl StoreState {
    /// Install a snapshot and queue it for the current subscribers.
    fn install(&mut self, context: Context) -> u64 {
        let context_type = context.context_type;
        let context = Arc::new(context);
        self.contexts.insert(context_type, Arc::clone(&context));
        let revision = self.revisions.entry(context_type).or_default();
        *revision += 1;
        let revision = *revision;
        let callbacks = self
            .subscribers
            .get(&context_type)
            .map(|list| list.iter().map(|(_, cb)| Arc::clone(cb)).collect())
            .unwrap_or_default();
        self.pending.push_back((context, callbacks));
        revision
    }
}

#[derive(Default)]
struct StoreInner {
    state: Mutex<StoreState>,
}

impl StoreInner {
    fn lock(&self) -> MutexGuard<'_, StoreState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Drain queued snapshots to their subscribers.
    ///
    /// One thread drains at a time. Writes made meanwhile, including from
    /// inside a callback, are delivered by the draining thread.
    fn deliver(&self) {
        {
            let mut state = self.lock();
            if state.delivering {
                return;
            }
            state.delivering = true;
        }
        let mut draining = Draining {
            inner: self,
            armed: true,
        };
        loop {
            let next = {
                let mut state = self.lock();
                let next = state.pending.pop_front();
                if next.is_none() {
                    state.delivering = false;
                    draining.armed = false;
                }
                next
            };
            let Some((context, callbacks)) = next else {
                return;
            };
            for callback in callbacks {
                callback(&context);
            }
        }
    }

    fn remove_subscriber(&self, context_type: ContextType, id: u64) {
        let mut state = self.lock();
        if let Some(list) = state.subscribers.get_mut(&context_type) {
            list.retain(|(sub_id, _)| *sub_id != id);
        }
    }
}

/// Releases the drain if a callback panics.
struct Draining<'a> {
    inner: &'a StoreInner,
    armed: bool,
}

impl Drop for Draining<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.inner.lock().delivering = false;
        }
    }
}

/// Shared context store. Cloning yields another handle to the same store.
#[derive(Clone, Default)]
pub struct ContextStore {
    inner: Arc<StoreInner>,
}

impl std::fmt::Debug for ContextStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.inner.lock();
        let mut loaded: Vec<_> = state.contexts.keys().copied().collect();
        loaded.sort();
        f.debug_struct("ContextStore")
            .field("contexts", &loaded)
            .finish_non_exhaustive()
    }
}

impl ContextStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register (or replace) the loader for its context type.
    pub fn register(&self, loader: Arc<dyn ContextLoader>) {
        let context_type = loader.context_type();
        self.inner.lock().loaders.insert(context_type, loader);
    }

    pub fn with_loader(self, loader: Arc<dyn ContextLoader>) -> Self {
        self.register(loader);
        self
    }

    /// Current snapshot for a type, if one was ever set.
    pub fn get(&self, context_type: ContextType) -> Option<Arc<Context>> {
        self.inner.lock().contexts.get(&context_type).cloned()
    }

    /// Current status; [`ContextStatus::Pending`] until first set.
    pub fn status(&self, context_type: ContextType) -> ContextStatus {
        self.get(context_type)
            .map_or(ContextStatus::Pending, |ctx| ctx.status)
    }

    /// Load a context through its registered loader.
    ///
    /// Subscribers see the loading state first, then either the loaded
    /// payload or the error together with the previous payload. A type
    /// without a registered loader ends in the error state like any other
    /// failed load.
    ///
    /// While a deployment run owns the deployment context the load is a
    /// no-op. If anything else writes the context while the loader runs,
    /// the newer snapshot wins and the load result is dropped.
    pub async fn load(&self, context_type: ContextType, on_progress: Option<&ProgressFn>) {
        let (revision, previous, loader) = {
            let mut state = self.inner.lock();
            let current = state.contexts.get(&context_type).and_then(|ctx| ctx.payload.clone());
            if current.as_ref().is_some_and(ContextPayload::is_live_run) {
                tracing::debug!(context = %context_type, "Skipping load while a run owns the context");
                return;
            }
            let revision = state.install(Context::new(context_type, ContextStatus::Loading, current.clone()));
            (revision, current, state.loaders.get(&context_type).cloned())
        };
        self.inner.deliver();

        let result = match loader {
            Some(loader) => loader.load(self, on_progress).await,
            None => Err(Error::NoLoader {
                context: context_type,
            }),
        };

        let settled = match result {
            Ok(payload) if payload.context_type() == context_type => {
                tracing::debug!(context = %context_type, "Context loaded");
                Context::loaded(payload)
            }
            Ok(payload) => {
                tracing::error!(
                    context = %context_type,
                    produced = %payload.context_type(),
                    "Loader produced a payload of the wrong type"
                );
                Context::failed(
                    context_type,
                    format!("loader produced a {} payload", payload.context_type()),
                )
            }
            Err(err) => {
                tracing::warn!(context = %context_type, error = %err, "Context load failed");
                // Keep the last good payload visible alongside the error
                Context {
                    payload: previous,
                    ..Context::failed(context_type, err.to_string())
                }
            }
        };
        if !self.replace_if_current(settled, revision) {
            tracing::debug!(context = %context_type, "Dropping load result overtaken by a newer write");
        }
    }

    pub async fn refresh(&self, context_type: ContextType) {
        self.load(context_type, None).await;
    }

    /// Reload every type in dependency order.
    pub async fn refresh_all(&self) {
        for context_type in ContextType::LOAD_ORDER {
            self.load(context_type, None).await;
        }
    }

    /// Observe a context type.
    ///
    /// The callback receives the current snapshot immediately, if there is
    /// one, and every later update until the returned handle is dropped.
    #[must_use = "dropping the subscription detaches the callback"]
    pub fn subscribe<F>(&self, context_type: ContextType, callback: F) -> Subscription
    where
        F: Fn(&Context) + Send + Sync + 'static,
    {
        let callback: Arc<ContextCallback> = Arc::new(callback);
        let (id, current) = {
            let mut state = self.inner.lock();
            let id = state.next_subscriber;
            state.next_subscriber += 1;
            state
                .subscribers
                .entry(context_type)
                .or_default()
                .push((id, Arc::clone(&callback)));
            (id, state.contexts.get(&context_type).cloned())
        };

        if let Some(ctx) = current {
            callback(&ctx);
        }

        Subscription {
            store: Arc::downgrade(&self.inner),
            context_type,
            id: Some(id),
        }
    }

    /// Swap in a new snapshot and notify subscribers.
    pub(crate) fn replace(&self, context: Context) {
        self.inner.lock().install(context);
        self.inner.deliver();
    }

    /// Swap in a snapshot only if the type is still at `revision`.
    fn replace_if_current(&self, context: Context, revision: u64) -> bool {
        {
            let mut state = self.inner.lock();
            let current = state.revisions.get(&context.context_type).copied().unwrap_or_default();
            if current != revision {
                return false;
            }
            state.install(context);
        }
        self.inner.deliver();
        true
    }

    /// Publish a loaded payload produced outside a loader.
    pub(crate) fn publish(&self, payload: ContextPayload) {
        self.replace(Context::loaded(payload));
    }
}

/// Handle for one subscription. Dropping it unsubscribes.
#[derive(Debug)]
pub struct Subscription {
    store: Weak<StoreInner>,
    context_type: ContextType,
    id: Option<u64>,
}

impl Subscription {
    pub fn context_type(&self) -> ContextType {
        self.context_type
    }

    pub fn unsubscribe(mut self) {
        self.detach();
    }

    fn detach(&mut self) {
        if let (Some(id), Some(store)) = (self.id.take(), self.store.upgrade()) {
            store.remove_subscriber(self.context_type, id);
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.detach();
    }
}
