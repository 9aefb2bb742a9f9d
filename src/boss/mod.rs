//! The Boss
//!
//! The Boss is the service that coordinates an installation. It starts the
//! modules, distributes the kickstart, regenerates it, and collects the
//! installation tasks of the modules into queues. Each queue and the start
//! task are published as remote task objects; the client runs them.

pub mod install;

pub use install::InstallManager;

use crate::bus::names::request_flags;
use crate::bus::{
    arg, BusError, Interface, IntoValue, MessageBus, MethodError, ObjectTable,
    ServerObjectHandler, Value,
};
use crate::constants::{BOSS_INTERFACE, BOSS_NAME, BOSS_PATH};
use crate::kickstart::KickstartManager;
use crate::modules::{ModuleManager, ModuleStartConfig, StartModulesTask};
use crate::tasks::{publish_task, Task, TaskQueue};
use log::{error, info};
use std::path::Path;
use std::sync::{Arc, Weak};

#[derive(Debug)]
pub struct Boss {
    modules: Arc<ModuleManager>,
    kickstart: Arc<KickstartManager>,
    install: InstallManager,
    start_config: ModuleStartConfig,
}

impl Boss {
    pub fn new<S: AsRef<str>>(
        modules: Arc<ModuleManager>,
        start_config: ModuleStartConfig,
        kickstart_sections: &[S],
    ) -> Self {
        Self {
            kickstart: Arc::new(KickstartManager::new(Arc::clone(&modules), kickstart_sections)),
            install: InstallManager::new(Arc::clone(&modules)),
            modules,
            start_config,
        }
    }

    pub fn modules(&self) -> &Arc<ModuleManager> {
        &self.modules
    }

    pub fn kickstart(&self) -> &Arc<KickstartManager> {
        &self.kickstart
    }

    fn bus(&self) -> &Arc<MessageBus> {
        self.modules.bus()
    }

    /// A task starting the configured modules. The started modules become
    /// the Boss's modules when it completes; a failed start leaves none.
    pub fn start_modules_with_task(&self) -> Arc<StartModulesTask> {
        let task = Arc::new(self.modules.start_modules_with_task(self.start_config.clone()));
        let weak: Weak<StartModulesTask> = Arc::downgrade(&task);
        let modules = Arc::clone(&self.modules);
        task.base().completed.connect(move |_| {
            if let Some(task) = weak.upgrade() {
                modules.set_module_observers(task.observers());
            }
        });
        task
    }

    pub fn read_kickstart_file(&self, path: &Path) -> crate::kickstart::KickstartReport {
        self.kickstart.read_kickstart_file(path)
    }

    pub fn generate_kickstart(&self) -> Result<String, BusError> {
        self.kickstart.generate_kickstart()
    }

    pub fn install_system_with_task(&self) -> Result<TaskQueue, BusError> {
        self.install.install_system_with_task()
    }

    pub fn configure_runtime_with_task(&self) -> Result<TaskQueue, BusError> {
        self.install.configure_runtime_with_task()
    }

    /// Stop the modules, then disconnect and stop the loop once the
    /// current call was answered.
    pub fn quit(&self) {
        self.modules.stop_modules();
        self.modules.disconnect();
        let bus = Arc::clone(self.bus());
        self.bus().event_loop().schedule(move || {
            info!("The Boss is quitting");
            bus.disconnect();
            bus.event_loop().quit();
        });
    }

    fn publish(&self, task: Arc<dyn Task>) -> Result<Vec<Value>, MethodError> {
        let path = publish_task(self.bus(), task).map_err(MethodError::new)?;
        Ok(vec![path.into_value()])
    }

    /// The `org.quarry.Installer.Boss` interface of `boss`.
    pub fn interface(boss: &Arc<Self>) -> Interface {
        let starter = Arc::clone(boss);
        let reader = Arc::clone(boss);
        let generator = Arc::clone(boss);
        let localizer = Arc::clone(boss);
        let lister = Arc::clone(boss);
        let installer = Arc::clone(boss);
        let configurer = Arc::clone(boss);
        let quitter = Arc::clone(boss);

        Interface::new(BOSS_INTERFACE)
            .method("StartModulesWithTask", "", "o", move |_| {
                starter.publish(starter.start_modules_with_task())
            })
            .method("ReadKickstartFile", "s", "(a(ssus)a(ssus))", move |args| {
                let path: String = arg(&args, 0).map_err(MethodError::new)?;
                Ok(vec![reader.read_kickstart_file(Path::new(&path)).into_value()])
            })
            .method("GenerateKickstart", "", "s", move |_| {
                let text = generator.generate_kickstart().map_err(MethodError::new)?;
                Ok(vec![Value::from(text)])
            })
            .method("SetLocale", "s", "", move |args| {
                let locale: String = arg(&args, 0).map_err(MethodError::new)?;
                localizer.modules.set_modules_locale(&locale);
                Ok(Vec::new())
            })
            .method("GetModules", "", "as", move |_| {
                Ok(vec![lister.modules.get_service_names().into_value()])
            })
            .method("InstallSystemWithTask", "", "o", move |_| {
                let queue = installer.install_system_with_task().map_err(|e| {
                    error!("Failed to collect the installation tasks: {}", e);
                    MethodError::new(e)
                })?;
                installer.publish(Arc::new(queue))
            })
            .method("ConfigureRuntimeWithTask", "", "o", move |_| {
                let queue = configurer.configure_runtime_with_task().map_err(|e| {
                    error!("Failed to collect the configuration tasks: {}", e);
                    MethodError::new(e)
                })?;
                configurer.publish(Arc::new(queue))
            })
            .method("Quit", "", "", move |_| {
                quitter.quit();
                Ok(Vec::new())
            })
    }
}

/// Publish `boss` and claim the Boss name on its bus.
pub fn publish_boss(boss: &Arc<Boss>) -> Result<Arc<ServerObjectHandler>, BusError> {
    let bus = boss.bus();
    let handler = bus.publish_object(BOSS_PATH, ObjectTable::new().interface(Boss::interface(boss)))?;
    bus.register_service(BOSS_NAME, request_flags::DO_NOT_QUEUE)?;
    Ok(handler)
}
