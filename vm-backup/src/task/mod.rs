//! Hierarchical task tracking.
//!
//! A task is a bookkeeping wrapper around an async operation: it records
//! timing, captures the outcome, emits lifecycle events and hands the
//! original result back to the caller unchanged. Tasks run in the caller's
//! own flow, nothing is spawned.
//!
//! ```no_run
//! use vm_backup::task::{Task, TaskDescriptor, TaskLog};
//!
//! # async fn demo() -> Result<(), std::io::Error> {
//! let log = TaskLog::new();
//! Task::run(&log, TaskDescriptor::new("backup"), |task| async move {
//!     task.run_child(TaskDescriptor::new("export"), |_export| async move {
//!         Ok::<_, std::io::Error>(())
//!     })
//!     .await
//! })
//! .await
//! # }
//! ```

pub mod events;

pub use events::{TaskEvent, TaskLog};

use chrono::{DateTime, Utc};
use futures_util::future::BoxFuture;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use tracing::{info, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Pending,
    Running,
    Success,
    Failure,
    Warning,
}

impl TaskStatus {
    pub fn is_finished(&self) -> bool {
        matches!(self, Self::Success | Self::Failure | Self::Warning)
    }
}

/// What a task is about. The data is frozen once the task starts.
#[derive(Debug, Clone)]
pub struct TaskDescriptor {
    pub name: String,
    pub data: Value,
    /// A failed required child marks its parent failed
    pub required: bool,
}

impl TaskDescriptor {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            data: Value::Null,
            required: true,
        }
    }

    pub fn with_data(mut self, data: Value) -> Self {
        self.data = data;
        self
    }

    /// Failure of this task is reported but does not fail its parent
    pub fn optional(mut self) -> Self {
        self.required = false;
        self
    }
}

struct TaskNode {
    id: Uuid,
    parent: Option<Weak<TaskNode>>,
    name: String,
    data: Value,
    required: bool,
    state: Mutex<NodeState>,
}

struct NodeState {
    status: TaskStatus,
    started_at: Option<DateTime<Utc>>,
    ended_at: Option<DateTime<Utc>>,
    result: Option<Value>,
    error: Option<String>,
    warnings: Vec<String>,
    failed_children: usize,
    children: Vec<Arc<TaskNode>>,
}

impl TaskNode {
    fn new(descriptor: TaskDescriptor, parent: Option<Weak<TaskNode>>) -> Arc<Self> {
        Arc::new(Self {
            id: Uuid::new_v4(),
            parent,
            name: descriptor.name,
            data: descriptor.data,
            required: descriptor.required,
            state: Mutex::new(NodeState {
                status: TaskStatus::Pending,
                started_at: None,
                ended_at: None,
                result: None,
                error: None,
                warnings: Vec::new(),
                failed_children: 0,
                children: Vec::new(),
            }),
        })
    }

    fn state(&self) -> MutexGuard<'_, NodeState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn parent_id(&self) -> Option<Uuid> {
        self.parent.as_ref().and_then(Weak::upgrade).map(|p| p.id)
    }

    fn snapshot(&self) -> TaskSnapshot {
        let state = self.state();
        TaskSnapshot {
            id: self.id,
            name: self.name.clone(),
            status: state.status,
            data: self.data.clone(),
            start: state.started_at,
            end: state.ended_at,
            duration_ms: match (state.started_at, state.ended_at) {
                (Some(start), Some(end)) => Some((end - start).num_milliseconds()),
                _ => None,
            },
            result: state.result.clone(),
            error: state.error.clone(),
            warnings: state.warnings.clone(),
            children: state.children.iter().map(|c| c.snapshot()).collect(),
        }
    }
}

/// Handle on a running task, passed to the wrapped operation
#[derive(Clone)]
pub struct Task {
    node: Arc<TaskNode>,
    log: TaskLog,
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("id", &self.node.id)
            .field("name", &self.node.name)
            .field("status", &self.status())
            .finish()
    }
}

impl Task {
    /// Run `f` as a new root task
    pub async fn run<T, E, F, Fut>(log: &TaskLog, descriptor: TaskDescriptor, f: F) -> Result<T, E>
    where
        F: FnOnce(Task) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: fmt::Display,
    {
        let task = Task {
            node: TaskNode::new(descriptor, None),
            log: log.clone(),
        };
        task.execute(f).await
    }

    /// Run `f` as a sub-task of this task
    pub async fn run_child<T, E, F, Fut>(&self, descriptor: TaskDescriptor, f: F) -> Result<T, E>
    where
        F: FnOnce(Task) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: fmt::Display,
    {
        let node = TaskNode::new(descriptor, Some(Arc::downgrade(&self.node)));
        self.node.state().children.push(Arc::clone(&node));
        let child = Task {
            node,
            log: self.log.clone(),
        };
        child.execute(f).await
    }

    /// Wrap `f` so that every invocation runs as its own root task,
    /// described from the invocation's argument.
    pub fn wrap_fn<A, T, E, D, F, Fut>(
        log: TaskLog,
        describe: D,
        f: F,
    ) -> impl Fn(A) -> BoxFuture<'static, Result<T, E>>
    where
        A: Send + 'static,
        T: Send + 'static,
        E: fmt::Display + Send + 'static,
        D: Fn(&A) -> TaskDescriptor,
        F: Fn(Task, A) -> Fut + Clone + Send + Sync + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
    {
        move |arg: A| {
            let descriptor = describe(&arg);
            let log = log.clone();
            let f = f.clone();
            Box::pin(async move { Task::run(&log, descriptor, move |task| f(task, arg)).await })
        }
    }

    async fn execute<T, E, F, Fut>(self, f: F) -> Result<T, E>
    where
        F: FnOnce(Task) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: fmt::Display,
    {
        self.start();
        let outcome = f(self.clone()).await;
        match &outcome {
            Ok(_) => self.end(None),
            Err(e) => self.end(Some(e.to_string())),
        }
        outcome
    }

    fn start(&self) {
        let now = Utc::now();
        {
            let mut state = self.node.state();
            state.status = TaskStatus::Running;
            state.started_at = Some(now);
        }
        info!(task = %self.node.name, task_id = %self.node.id, data = %self.node.data, "Task started");
        self.log.emit(TaskEvent::Start {
            task_id: self.node.id,
            parent_id: self.node.parent_id(),
            name: self.node.name.clone(),
            data: self.node.data.clone(),
            timestamp: now,
        });
    }

    fn end(&self, error: Option<String>) {
        let now = Utc::now();
        let (status, result, error, duration_ms) = {
            let mut state = self.node.state();
            let error = error.or_else(|| {
                (state.failed_children > 0)
                    .then(|| format!("{} required sub-task(s) failed", state.failed_children))
            });
            state.status = if error.is_some() {
                TaskStatus::Failure
            } else if !state.warnings.is_empty() {
                TaskStatus::Warning
            } else {
                TaskStatus::Success
            };
            state.error = error.clone();
            state.ended_at = Some(now);
            let duration_ms = state
                .started_at
                .map(|s| (now - s).num_milliseconds())
                .unwrap_or(0);
            (state.status, state.result.clone(), error, duration_ms)
        };

        match &error {
            Some(e) => warn!(task = %self.node.name, task_id = %self.node.id, duration_ms, error = %e, "Task failed"),
            None => info!(task = %self.node.name, task_id = %self.node.id, duration_ms, ?status, "Task finished"),
        }

        if status == TaskStatus::Failure && self.node.required {
            if let Some(parent) = self.node.parent.as_ref().and_then(Weak::upgrade) {
                parent.state().failed_children += 1;
            }
        }

        self.log.emit(TaskEvent::End {
            task_id: self.node.id,
            status,
            result,
            error,
            timestamp: now,
            duration_ms,
        });
    }

    pub fn id(&self) -> Uuid {
        self.node.id
    }

    pub fn name(&self) -> &str {
        &self.node.name
    }

    pub fn data(&self) -> &Value {
        &self.node.data
    }

    pub fn status(&self) -> TaskStatus {
        self.node.state().status
    }

    /// Attach the value reported in the end event
    pub fn set_result(&self, result: Value) {
        self.node.state().result = Some(result);
    }

    pub fn info(&self, message: impl Into<String>, data: Value) {
        let message = message.into();
        tracing::debug!(task = %self.node.name, task_id = %self.node.id, %data, "{}", message);
        self.log.emit(TaskEvent::Info {
            task_id: self.node.id,
            message,
            data,
            timestamp: Utc::now(),
        });
    }

    /// Record a non-fatal problem; a task that otherwise succeeds ends as `warning`
    pub fn warn(&self, message: impl Into<String>, data: Value) {
        let message = message.into();
        warn!(task = %self.node.name, task_id = %self.node.id, %data, "{}", message);
        self.node.state().warnings.push(message.clone());
        self.log.emit(TaskEvent::Warning {
            task_id: self.node.id,
            message,
            data,
            timestamp: Utc::now(),
        });
    }

    /// Serializable view of this task and its descendants
    pub fn snapshot(&self) -> TaskSnapshot {
        self.node.snapshot()
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskSnapshot {
    pub id: Uuid,
    pub name: String,
    pub status: TaskStatus,
    pub data: Value,
    pub start: Option<DateTime<Utc>>,
    pub end: Option<DateTime<Utc>>,
    pub duration_ms: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub children: Vec<TaskSnapshot>,
}

impl TaskSnapshot {
    /// Depth-first search by task name
    pub fn find(&self, name: &str) -> Option<&TaskSnapshot> {
        if self.name == name {
            return Some(self);
        }
        self.children.iter().find_map(|c| c.find(name))
    }
}
