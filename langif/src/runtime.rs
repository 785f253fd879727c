use std::sync::{
    Arc,
    atomic::{AtomicU64, Ordering},
};

use crate::{
    Dispatch, DispatchSummary, OutputSink, Record, Result, StoreCreateInfo, TaskId, ValueStore,
};

#[derive(Debug, Clone, Default)]
pub struct RuntimeCreateInfo {
    pub store: StoreCreateInfo,
}

pub struct RuntimeShared {
    store: ValueStore,
    sink: Arc<dyn OutputSink>,
    next_task: AtomicU64,
}

/// Owns the value store and hands out one [`Dispatch`] per box invocation.
#[derive(Clone)]
pub struct Runtime {
    inner: Arc<RuntimeShared>,
}

impl Runtime {
    pub fn new(info: RuntimeCreateInfo, sink: Arc<dyn OutputSink>) -> Self {
        let shared = RuntimeShared {
            store: ValueStore::new(info.store),
            sink,
            next_task: AtomicU64::new(1),
        };
        Self {
            inner: Arc::new(shared),
        }
    }

    pub fn store(&self) -> &ValueStore {
        &self.inner.store
    }

    /// Start an invocation. The dispatch owns the fields of `input` until the
    /// box binds them.
    pub fn dispatch(&self, input: Record) -> Dispatch {
        let task = TaskId(self.inner.next_task.fetch_add(1, Ordering::Relaxed));
        log::trace!("{task}: dispatching variant {}", input.variant);
        Dispatch::open(
            task,
            self.inner.store.clone(),
            self.inner.sink.clone(),
            input,
        )
    }

    pub fn run<F>(&self, input: Record, body: F) -> Result<DispatchSummary>
    where
        F: FnOnce(&mut Dispatch) -> Result<()>,
    {
        let mut dispatch = self.dispatch(input);
        if let Err(err) = body(&mut dispatch) {
            log::error!("{}: box failed: {err}", dispatch.task());
            return Err(err);
        }
        let summary = dispatch.finish();
        log::debug!("{}: done, {} records out", summary.task, summary.emitted);
        Ok(summary)
    }
}

impl std::fmt::Debug for Runtime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Runtime")
            .field("store", &self.inner.store)
            .field("next_task", &self.inner.next_task)
            .finish()
    }
}
