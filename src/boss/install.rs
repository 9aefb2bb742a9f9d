//! Collecting installation tasks from the modules.

use crate::bus::{BusError, ObjectPath};
use crate::constants::{CONFIGURE_RUNTIME_QUEUE_NAME, INSTALL_QUEUE_NAME};
use crate::modules::{KickstartModuleProxy, ModuleManager, ModuleObserver};
use crate::tasks::{DBusTask, Task, TaskQueue};
use log::{debug, info};
use std::sync::Arc;

type Collect = fn(&KickstartModuleProxy) -> Result<Vec<ObjectPath>, BusError>;

#[derive(Debug)]
pub struct InstallManager {
    modules: Arc<ModuleManager>,
}

impl InstallManager {
    pub fn new(modules: Arc<ModuleManager>) -> Self {
        Self { modules }
    }

    /// A queue with the installation tasks of every available module.
    pub fn install_system_with_task(&self) -> Result<TaskQueue, BusError> {
        self.collect(
            TaskQueue::new(INSTALL_QUEUE_NAME)
                .with_status_message("Installing the system")
                .with_category("installation"),
            self.modules.get_available_observers(),
            KickstartModuleProxy::install_with_tasks,
        )
    }

    /// A queue with the runtime configuration tasks of the available
    /// addons. Regular modules configure the runtime themselves.
    pub fn configure_runtime_with_task(&self) -> Result<TaskQueue, BusError> {
        let addons = self
            .modules
            .get_available_observers()
            .into_iter()
            .filter(|observer| observer.is_addon())
            .collect();
        self.collect(
            TaskQueue::new(CONFIGURE_RUNTIME_QUEUE_NAME)
                .with_status_message("Configuring the runtime")
                .with_category("configuration"),
            addons,
            KickstartModuleProxy::configure_with_tasks,
        )
    }

    fn collect(
        &self,
        queue: TaskQueue,
        observers: Vec<Arc<ModuleObserver>>,
        tasks_of: Collect,
    ) -> Result<TaskQueue, BusError> {
        let bus = self.modules.bus();
        for observer in observers {
            let paths = tasks_of(&observer.kickstart()?)?;
            debug!("{} provides {} task(s)", observer.service_name(), paths.len());
            for path in paths {
                let task = DBusTask::new(bus, observer.service_name(), path.as_str())?;
                queue.append(Arc::new(task));
            }
        }
        info!("{} has {} task(s)", queue.name(), queue.task_count());
        Ok(queue)
    }
}
