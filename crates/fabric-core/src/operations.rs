//! Operation registry for long-running runs
//!
//! Tracks each run's progress and terminal state. Operations move from the
//! active map to the terminal history exactly once and are frozen there;
//! updates addressed to a frozen operation are ignored.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{Error, Result};

/// Terminal operations kept for display.
const MAX_HISTORY: usize = 50;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationKind {
    Deploy,
    Discover,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl OperationStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

/// A tracked long-running operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Operation {
    pub id: String,
    pub kind: OperationKind,
    pub status: OperationStatus,
    /// 0-100, never decreases while running
    pub progress: u8,
    pub message: Option<String>,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub cancelable: bool,
    pub error: Option<String>,
}

/// Cooperative cancellation flag shared between the registry and a run.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }

    fn set(&self) {
        self.0.store(true, Ordering::Release);
    }
}

/// Point-in-time copy of the registry.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperationsSnapshot {
    pub active: Vec<Operation>,
    /// Most recent last
    pub completed: Vec<Operation>,
}

#[derive(Debug)]
struct ActiveOperation {
    operation: Operation,
    cancel: CancelFlag,
}

#[derive(Debug, Default)]
struct RegistryInner {
    active: BTreeMap<String, ActiveOperation>,
    completed: Vec<Operation>,
}

impl RegistryInner {
    fn finish(&mut self, id: &str, status: OperationStatus, error: Option<String>) -> Option<Operation> {
        let ActiveOperation { mut operation, .. } = self.active.remove(id)?;
        operation.status = status;
        operation.ended_at = Some(Utc::now());
        operation.error = error;
        if status == OperationStatus::Completed {
            operation.progress = 100;
        }
        self.completed.push(operation.clone());
        if self.completed.len() > MAX_HISTORY {
            let excess = self.completed.len() - MAX_HISTORY;
            self.completed.drain(..excess);
        }
        Some(operation)
    }
}

/// Shared registry of operations. Cloning yields another handle to the
/// same registry.
#[derive(Debug, Clone, Default)]
pub struct OperationRegistry {
    inner: Arc<Mutex<RegistryInner>>,
}

impl OperationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, RegistryInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register a new pending operation.
    pub fn create(&self, kind: OperationKind, cancelable: bool) -> (String, CancelFlag) {
        let id = Uuid::new_v4().to_string();
        let cancel = CancelFlag::default();
        let operation = Operation {
            id: id.clone(),
            kind,
            status: OperationStatus::Pending,
            progress: 0,
            message: None,
            started_at: Utc::now(),
            ended_at: None,
            cancelable,
            error: None,
        };
        self.lock().active.insert(
            id.clone(),
            ActiveOperation {
                operation,
                cancel: cancel.clone(),
            },
        );
        tracing::debug!(operation_id = %id, ?kind, "Operation created");
        (id, cancel)
    }

    /// Move a pending operation to running.
    pub fn start(&self, id: &str) -> bool {
        let mut inner = self.lock();
        match inner.active.get_mut(id) {
            Some(entry) => {
                entry.operation.status = OperationStatus::Running;
                true
            }
            None => false,
        }
    }

    /// Raise the progress of an active operation.
    ///
    /// Progress is clamped to 100 and never lowered. Returns `false` when
    /// the operation is no longer active.
    pub fn set_progress(&self, id: &str, progress: u8, message: Option<&str>) -> bool {
        let mut inner = self.lock();
        let Some(entry) = inner.active.get_mut(id) else {
            return false;
        };
        entry.operation.progress = entry.operation.progress.max(progress.min(100));
        if let Some(message) = message {
            entry.operation.message = Some(message.to_string());
        }
        true
    }

    /// Finish an active operation successfully.
    pub fn complete(&self, id: &str) -> Option<Operation> {
        let operation = self.lock().finish(id, OperationStatus::Completed, None)?;
        tracing::info!(operation_id = %id, "Operation completed");
        Some(operation)
    }

    /// Finish an active operation with an error.
    pub fn fail(&self, id: &str, error: impl Into<String>) -> Option<Operation> {
        let error = error.into();
        let operation = self
            .lock()
            .finish(id, OperationStatus::Failed, Some(error.clone()))?;
        tracing::warn!(operation_id = %id, %error, "Operation failed");
        Some(operation)
    }

    /// Request cancellation of an active, cancelable operation.
    ///
    /// The run observes the flag before submitting new work; the operation
    /// itself becomes terminal immediately.
    ///
    /// # Errors
    ///
    /// [`Error::OperationNotFound`] for an unknown id and
    /// [`Error::NotCancelable`] for an operation that is not cancelable or
    /// has already finished. Neither case changes any state.
    pub fn cancel(&self, id: &str) -> Result<Operation> {
        let mut inner = self.lock();
        match inner.active.get(id) {
            Some(entry) if entry.operation.cancelable => entry.cancel.set(),
            Some(_) => return Err(Error::NotCancelable { id: id.to_string() }),
            None if inner.completed.iter().any(|op| op.id == id) => {
                return Err(Error::NotCancelable { id: id.to_string() });
            }
            None => return Err(Error::OperationNotFound { id: id.to_string() }),
        }
        let operation = inner
            .finish(id, OperationStatus::Cancelled, None)
            .ok_or_else(|| Error::OperationNotFound { id: id.to_string() })?;
        tracing::info!(operation_id = %id, "Operation cancelled");
        Ok(operation)
    }

    /// Look up an operation, active or terminal.
    pub fn get(&self, id: &str) -> Option<Operation> {
        let inner = self.lock();
        inner
            .active
            .get(id)
            .map(|entry| entry.operation.clone())
            .or_else(|| inner.completed.iter().rev().find(|op| op.id == id).cloned())
    }

    pub fn is_active(&self, id: &str) -> bool {
        self.lock().active.contains_key(id)
    }

    pub fn snapshot(&self) -> OperationsSnapshot {
        let inner = self.lock();
        OperationsSnapshot {
            active: inner.active.values().map(|e| e.operation.clone()).collect(),
            completed: inner.completed.clone(),
        }
    }
}
