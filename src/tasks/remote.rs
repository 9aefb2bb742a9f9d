//! Tasks on the bus
//!
//! [`publish_task`] puts a local task on the bus as an
//! `org.quarry.Installer.Task` object; [`DBusTask`] is the local stand-in of
//! such an object in another process. Running a [`DBusTask`] calls the
//! remote `Run` and relays `ProgressChanged` while the call is in flight.

use super::error::TaskError;
use super::task::{Task, TaskBase};
use crate::bus::{
    BusError, BusSignal, ClientObjectProxy, FromValue, Interface, IntoValue, MessageBus,
    ObjectPath, ObjectTable, Value,
};
use crate::constants::{task_path, TASK_INTERFACE};
use log::{debug, error};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;

static NEXT_TASK: AtomicU64 = AtomicU64::new(1);

/// Publish `task` and return its object path.
///
/// `Run` is answered from a dedicated thread once the task has finished, so
/// the bus loop keeps serving while the task runs.
pub fn publish_task(bus: &Arc<MessageBus>, task: Arc<dyn Task>) -> Result<ObjectPath, BusError> {
    let path = task_path(NEXT_TASK.fetch_add(1, Ordering::SeqCst));

    let started = Arc::new(BusSignal::new());
    let stopped = Arc::new(BusSignal::new());
    let progress = Arc::new(BusSignal::new());
    {
        let started = Arc::clone(&started);
        task.base().started.connect(move |_| started.emit(&Vec::new()));
        let stopped = Arc::clone(&stopped);
        task.base().completed.connect(move |_| stopped.emit(&Vec::new()));
        let progress = Arc::clone(&progress);
        task.base().progress_changed.connect(move |(step, message)| {
            progress.emit(&vec![Value::UInt32(*step), Value::from(message.as_str())])
        });
    }

    let name = Arc::clone(&task);
    let steps = Arc::clone(&task);
    let current = Arc::clone(&task);
    let runner = Arc::clone(&task);
    let interface = Interface::new(TASK_INTERFACE)
        .read_property("Name", "s", move || Ok(Value::from(name.name())))
        .read_property("Steps", "u", move || Ok(Value::UInt32(steps.base().steps())))
        .read_property("Progress", "(us)", move || {
            Ok(current.base().progress().into_value())
        })
        .deferred_method("Run", "", "", move |_, responder| {
            let task = Arc::clone(&runner);
            thread::spawn(move || {
                let result = task.start();
                if let Err(e) = &result {
                    error!("Task {} failed: {}", task.name(), e);
                }
                responder.send(result.map(|()| Vec::new()).map_err(TaskError::into_method_error));
            });
        })
        .signal("Started", "", started)
        .signal("Stopped", "", stopped)
        .signal("ProgressChanged", "us", progress);

    bus.publish_object(&path, ObjectTable::new().interface(interface))?;
    debug!("Published task {} at {}", task.name(), path);
    Ok(ObjectPath::new(path))
}

/// A remote task run as a local one.
pub struct DBusTask {
    base: Arc<TaskBase>,
    proxy: ClientObjectProxy,
}

impl std::fmt::Debug for DBusTask {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DBusTask")
            .field("name", &self.base.name())
            .field("service", &self.proxy.service())
            .field("path", &self.proxy.path())
            .finish()
    }
}

impl DBusTask {
    /// Wrap the task object at `path` of `service`. Reads its name and
    /// number of steps.
    pub fn new(bus: &MessageBus, service: &str, path: &str) -> Result<Self, BusError> {
        let proxy = bus.get_proxy_for_interface(service, path, TASK_INTERFACE)?;
        let name = String::from_value(proxy.get("Name")?)?;
        let steps = u32::from_value(proxy.get("Steps")?)?;
        Ok(Self {
            base: Arc::new(TaskBase::with_steps(name, steps)),
            proxy,
        })
    }

    pub fn service(&self) -> &str {
        self.proxy.service()
    }

    pub fn path(&self) -> &str {
        self.proxy.path()
    }
}

impl Task for DBusTask {
    fn base(&self) -> &TaskBase {
        &self.base
    }

    fn run(&self) -> Result<(), TaskError> {
        let base = Arc::clone(&self.base);
        self.proxy.connect_signal("ProgressChanged", move |args| {
            let step = args.first().and_then(Value::as_u32);
            let message = args.get(1).and_then(Value::as_str);
            if let (Some(step), Some(message)) = (step, message) {
                base.report_progress(step, message);
            }
        })?;

        let result = self.proxy.call("Run", Vec::new());
        self.proxy.delete_member("ProgressChanged");
        result.map(|_| ()).map_err(TaskError::from_bus)
    }
}
