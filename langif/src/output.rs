use std::collections::VecDeque;

use parking_lot::Mutex;

use crate::{Record, TaskId};

/// Receives every record a box emits. Implementations must accept calls from
/// any task.
pub trait OutputSink: Send + Sync {
    fn emit(&self, task: TaskId, record: Record);
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Emitted {
    pub task: TaskId,
    pub record: Record,
}

/// Keeps emitted records in arrival order.
#[derive(Debug, Default)]
pub struct CollectingSink {
    records: Mutex<VecDeque<Emitted>>,
}

impl CollectingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.records.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.lock().is_empty()
    }

    pub fn pop(&self) -> Option<Emitted> {
        self.records.lock().pop_front()
    }

    pub fn drain(&self) -> Vec<Emitted> {
        self.records.lock().drain(..).collect()
    }
}

impl OutputSink for CollectingSink {
    fn emit(&self, task: TaskId, record: Record) {
        self.records.lock().push_back(Emitted { task, record });
    }
}
