//! Task queues
//!
//! A queue runs its items in order. Items are tasks or nested queues. The
//! queue emits `queue_started`/`queue_completed` around its own run and
//! forwards the same signals of nested queues, together with the
//! `started`/`completed` signals of every task, so a single connection to the
//! outer queue observes the whole tree.
//!
//! Failing tasks are offered to the error handler of the outermost queue
//! that has one.

use super::error::TaskError;
use super::error_handler::{ErrorAction, ErrorHandler};
use super::task::{start_task, Task, TaskBase};
use crate::bus::Signal;
use log::{info, warn};
use std::fmt::Write as _;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// Signals observing a queue tree. Each carries a task or queue name.
#[derive(Debug, Default)]
pub struct QueueSignals {
    pub queue_started: Signal<String>,
    pub queue_completed: Signal<String>,
    pub task_started: Signal<String>,
    pub task_completed: Signal<String>,
}

pub struct TaskQueue {
    base: TaskBase,
    status_message: Option<String>,
    category: Option<String>,
    items: Mutex<Vec<Arc<dyn Task>>>,
    signals: Arc<QueueSignals>,
    error_handler: Mutex<Option<Arc<dyn ErrorHandler>>>,
}

impl std::fmt::Debug for TaskQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskQueue")
            .field("name", &self.base.name())
            .field("items", &self.items().len())
            .finish()
    }
}

impl TaskQueue {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            base: TaskBase::new(name),
            status_message: None,
            category: None,
            items: Mutex::new(Vec::new()),
            signals: Arc::new(QueueSignals::default()),
            error_handler: Mutex::new(None),
        }
    }

    /// User-facing text shown while the queue runs.
    pub fn with_status_message(mut self, message: impl Into<String>) -> Self {
        self.status_message = Some(message.into());
        self
    }

    pub fn with_category(mut self, category: impl Into<String>) -> Self {
        self.category = Some(category.into());
        self
    }

    pub fn status_message(&self) -> Option<&str> {
        self.status_message.as_deref()
    }

    pub fn category(&self) -> Option<&str> {
        self.category.as_deref()
    }

    pub fn signals(&self) -> &QueueSignals {
        &self.signals
    }

    pub fn set_error_handler(&self, handler: Arc<dyn ErrorHandler>) {
        *self
            .error_handler
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(handler);
    }

    fn error_handler(&self) -> Option<Arc<dyn ErrorHandler>> {
        self.error_handler
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn items(&self) -> MutexGuard<'_, Vec<Arc<dyn Task>>> {
        self.items.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Append a task or a queue and forward its signals.
    pub fn append(&self, item: Arc<dyn Task>) {
        match item.as_queue() {
            Some(queue) => {
                let inner = &queue.signals;
                forward(&inner.queue_started, &self.signals, |s| &s.queue_started);
                forward(&inner.queue_completed, &self.signals, |s| &s.queue_completed);
                forward(&inner.task_started, &self.signals, |s| &s.task_started);
                forward(&inner.task_completed, &self.signals, |s| &s.task_completed);
            }
            None => {
                forward(&item.base().started, &self.signals, |s| &s.task_started);
                forward(&item.base().completed, &self.signals, |s| &s.task_completed);
            }
        }
        self.items().push(item);
    }

    pub fn len(&self) -> usize {
        self.items().len()
    }

    pub fn is_empty(&self) -> bool {
        self.items().is_empty()
    }

    /// Direct items, in order.
    pub fn items_snapshot(&self) -> Vec<Arc<dyn Task>> {
        self.items().clone()
    }

    /// Every descendant in pre-order.
    pub fn nested_items(&self) -> Vec<Arc<dyn Task>> {
        let mut nested = Vec::new();
        for item in self.items_snapshot() {
            let children = item.as_queue().map(TaskQueue::nested_items);
            nested.push(item);
            nested.extend(children.into_iter().flatten());
        }
        nested
    }

    /// Number of tasks in the tree, queues not counted.
    pub fn task_count(&self) -> usize {
        self.nested_items()
            .iter()
            .filter(|item| item.as_queue().is_none())
            .count()
    }

    /// Number of nested queues, this one not counted.
    pub fn queue_count(&self) -> usize {
        self.nested_items()
            .iter()
            .filter(|item| item.as_queue().is_some())
            .count()
    }

    /// An indented listing of the tree.
    pub fn summary(&self) -> String {
        let mut summary = format!(
            "Top-level task queue: {}\nNumber of task queues: {}\nNumber of tasks: {}\n",
            self.name(),
            self.queue_count(),
            self.task_count()
        );
        self.write_items(&mut summary, 0);
        summary
    }

    fn write_items(&self, out: &mut String, depth: usize) {
        let indent = " ".repeat(depth * 2);
        for (index, item) in self.items_snapshot().iter().enumerate() {
            match item.as_queue() {
                Some(queue) => {
                    let _ = writeln!(out, "{}Task queue #{}: {}", indent, index + 1, queue.name());
                    queue.write_items(out, depth + 1);
                }
                None => {
                    let _ = writeln!(out, "{}Task #{}: {}", indent, index + 1, item.name());
                }
            }
        }
    }

    /// Run the queue, handling failures with `handler`.
    fn execute(&self, handler: Option<Arc<dyn ErrorHandler>>) -> Result<(), TaskError> {
        start_task(&self.base, || {
            let name = self.name().to_string();
            if let Some(message) = &self.status_message {
                info!("{}", message);
            }
            self.signals.queue_started.emit(&name);
            self.run_items(handler.as_ref())?;
            self.signals.queue_completed.emit(&name);
            Ok(())
        })
    }

    fn run_items(&self, handler: Option<&Arc<dyn ErrorHandler>>) -> Result<(), TaskError> {
        for item in self.items_snapshot() {
            if let Some(queue) = item.as_queue() {
                let inherited = handler.cloned().or_else(|| queue.error_handler());
                queue.execute(inherited)?;
                continue;
            }

            loop {
                let error = match item.start() {
                    Ok(()) => break,
                    Err(e) => e,
                };
                let action = match handler {
                    Some(handler) => handler.handle(item.name(), &error),
                    None => ErrorAction::Raise,
                };
                match action {
                    ErrorAction::Raise => return Err(error),
                    ErrorAction::Continue => {
                        warn!("Ignoring the failure of {}: {}", item.name(), error);
                        break;
                    }
                    ErrorAction::Retry => {
                        warn!("Retrying {} after: {}", item.name(), error);
                    }
                }
            }
        }
        Ok(())
    }
}

impl Task for TaskQueue {
    fn base(&self) -> &TaskBase {
        &self.base
    }

    fn run(&self) -> Result<(), TaskError> {
        self.run_items(self.error_handler().as_ref())
    }

    fn as_queue(&self) -> Option<&TaskQueue> {
        Some(self)
    }

    fn start(&self) -> Result<(), TaskError> {
        self.execute(self.error_handler())
    }
}

fn forward(
    from: &Signal<String>,
    to: &Arc<QueueSignals>,
    pick: fn(&QueueSignals) -> &Signal<String>,
) {
    let to = Arc::clone(to);
    from.connect(move |name| pick(&to).emit(name));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tasks::task::FnTask;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn ok(name: &str) -> Arc<dyn Task> {
        Arc::new(FnTask::new(name, |_| Ok(())))
    }

    fn tree() -> TaskQueue {
        let q1 = TaskQueue::new("q1");
        q1.append(ok("t1"));
        let q2 = TaskQueue::new("q2");
        q2.append(ok("t2"));
        let outer = TaskQueue::new("outer");
        outer.append(Arc::new(q1));
        outer.append(Arc::new(q2));
        outer.append(ok("t3"));
        outer
    }

    struct Fixed(ErrorAction, AtomicUsize);

    impl ErrorHandler for Fixed {
        fn handle(&self, _task: &str, _error: &TaskError) -> ErrorAction {
            self.1.fetch_add(1, Ordering::SeqCst);
            self.0
        }
    }

    #[test]
    fn test_counts_and_nested_items() {
        let outer = tree();
        let names: Vec<String> = outer
            .nested_items()
            .iter()
            .map(|item| item.name().to_string())
            .collect();
        assert_eq!(names, vec!["q1", "t1", "q2", "t2", "t3"]);
        assert_eq!(outer.task_count(), 3);
        assert_eq!(outer.queue_count(), 2);
        assert_eq!(outer.len(), 3);
    }

    #[test]
    fn test_summary_lists_the_tree() {
        let summary = tree().summary();
        assert!(summary.starts_with("Top-level task queue: outer\n"));
        assert!(summary.contains("Number of task queues: 2\n"));
        assert!(summary.contains("Task queue #1: q1\n  Task #1: t1\n"));
        assert!(summary.contains("Task #3: t3\n"));
    }

    #[test]
    fn test_failure_without_handler_stops_the_queue() {
        let queue = TaskQueue::new("queue");
        queue.append(Arc::new(FnTask::new("bad", |_| {
            Err(TaskError::failed("bad", "boom"))
        })));
        let ran = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&ran);
        queue.append(Arc::new(FnTask::new("after", move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })));

        assert!(queue.start().is_err());
        assert_eq!(ran.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_continue_skips_the_failed_task() {
        let queue = TaskQueue::new("queue");
        queue.append(Arc::new(FnTask::new("bad", |_| {
            Err(TaskError::failed("bad", "boom"))
        })));
        queue.append(ok("good"));
        let handler = Arc::new(Fixed(ErrorAction::Continue, AtomicUsize::new(0)));
        queue.set_error_handler(handler.clone());

        let completed = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&completed);
        queue
            .signals()
            .task_completed
            .connect(move |name| sink.lock().unwrap().push(name.clone()));

        queue.start().unwrap();
        assert_eq!(handler.1.load(Ordering::SeqCst), 1);
        assert_eq!(*completed.lock().unwrap(), vec!["good"]);
    }

    #[test]
    fn test_retry_runs_the_task_again() {
        let attempts = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&attempts);
        let flaky = FnTask::new("flaky", move |_| {
            if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                Err(TaskError::failed("flaky", "first try"))
            } else {
                Ok(())
            }
        });

        let inner = TaskQueue::new("inner");
        inner.append(Arc::new(flaky));
        let outer = TaskQueue::new("outer");
        outer.append(Arc::new(inner));
        outer.set_error_handler(Arc::new(Fixed(ErrorAction::Retry, AtomicUsize::new(0))));

        outer.start().unwrap();
        assert_eq!(attempts.load(Ordering::SeqCst), 2);
    }
}
