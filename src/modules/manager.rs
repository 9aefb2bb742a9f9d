//! The module manager owns the observers of the running modules.

use super::observer::ModuleObserver;
use super::start::{ModuleStartConfig, StartModulesTask};
use crate::bus::{MessageBus, Signal};
use log::{error, info};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

pub struct ModuleManager {
    bus: Arc<MessageBus>,
    observers: Mutex<Vec<Arc<ModuleObserver>>>,
    /// Emitted with the service names after the observers were replaced.
    pub module_observers_changed: Signal<Vec<String>>,
}

impl std::fmt::Debug for ModuleManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModuleManager")
            .field("modules", &self.lock().len())
            .finish()
    }
}

impl ModuleManager {
    pub fn new(bus: Arc<MessageBus>) -> Self {
        Self {
            bus,
            observers: Mutex::new(Vec::new()),
            module_observers_changed: Signal::new(),
        }
    }

    pub fn bus(&self) -> &Arc<MessageBus> {
        &self.bus
    }

    fn lock(&self) -> MutexGuard<'_, Vec<Arc<ModuleObserver>>> {
        self.observers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// A task starting the configured modules. Its result is not applied
    /// here; pass [`StartModulesTask::observers`] to
    /// [`ModuleManager::set_module_observers`] once it finished.
    pub fn start_modules_with_task(&self, config: ModuleStartConfig) -> StartModulesTask {
        StartModulesTask::new(Arc::clone(&self.bus), config)
    }

    pub fn set_module_observers(&self, observers: Vec<Arc<ModuleObserver>>) {
        let names: Vec<String> = observers
            .iter()
            .map(|o| o.service_name().to_string())
            .collect();
        *self.lock() = observers;
        info!("Module observers: {}", names.join(", "));
        self.module_observers_changed.emit(&names);
    }

    pub fn get_module_observers(&self) -> Vec<Arc<ModuleObserver>> {
        self.lock().clone()
    }

    /// Observers of the modules that are on the bus now.
    pub fn get_available_observers(&self) -> Vec<Arc<ModuleObserver>> {
        self.lock()
            .iter()
            .filter(|o| o.is_service_available())
            .cloned()
            .collect()
    }

    /// Service names of the available modules, in declaration order.
    pub fn get_service_names(&self) -> Vec<String> {
        self.get_available_observers()
            .iter()
            .map(|o| o.service_name().to_string())
            .collect()
    }

    /// Ask every available module to use `locale`. Failures are logged.
    pub fn set_modules_locale(&self, locale: &str) {
        for observer in self.get_available_observers() {
            let result = observer.kickstart().and_then(|proxy| proxy.set_locale(locale));
            if let Err(e) = result {
                error!("Failed to set the locale of {}: {}", observer.service_name(), e);
            }
        }
    }

    /// Tell every available module to quit and wait for each answer.
    pub fn stop_modules(&self) {
        for observer in self.get_available_observers() {
            info!("Stopping module {}", observer.service_name());
            let result = observer.kickstart().and_then(|proxy| proxy.quit());
            if let Err(e) = result {
                error!("Failed to stop {}: {}", observer.service_name(), e);
            }
        }
    }

    /// Stop watching every module.
    pub fn disconnect(&self) {
        for observer in self.lock().drain(..) {
            observer.disconnect();
        }
    }
}
