//! Helpers shared by the integration tests.

#![allow(dead_code)]

use quarry::bus::{Activator, AddressSource, Broker, BusAddress, ErrorMapper, EventLoop, MessageBus};
use quarry::constants::{ADDONS_NAMESPACE, MODULES_NAMESPACE};
use quarry::error::installer_error_mapper;
use quarry::kickstart::{publish_module, KickstartMessage, KickstartReport, KickstartService};
use quarry::modules::{ModuleManager, ModuleObserver, ModuleStartConfig};
use quarry::tasks::{Task, TaskError};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

/// A bus on the memory broker `broker`, served by its own running loop.
pub fn memory_bus(broker: &str, loop_name: &str, mapper: ErrorMapper) -> (EventLoop, Arc<MessageBus>) {
    let event_loop = EventLoop::spawn(loop_name).expect("event loop should start");
    let bus = MessageBus::new(
        AddressSource::Address(BusAddress::memory(broker)),
        event_loop.clone(),
        mapper,
    );
    (event_loop, bus)
}

/// Poll `condition` until it holds or five seconds pass.
pub fn wait_until(mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(10));
    }
    condition()
}

pub fn shut_down(event_loop: EventLoop, bus: Arc<MessageBus>) {
    bus.disconnect();
    event_loop.shutdown();
}

/// A module that records what it was given.
#[derive(Default)]
pub struct FakeModule {
    pub commands: Vec<String>,
    pub sections: Vec<String>,
    pub addons: Vec<String>,
    /// Errors to report as `(line of the slice, message)`.
    pub errors: Vec<(u32, String)>,
    pub output: String,
    pub tasks: Vec<Arc<dyn Task>>,
    pub received: Mutex<Vec<String>>,
    pub locale: Mutex<Option<String>>,
}

impl FakeModule {
    pub fn owning(commands: &[&str], sections: &[&str]) -> Self {
        Self {
            commands: commands.iter().map(|c| c.to_string()).collect(),
            sections: sections.iter().map(|s| s.to_string()).collect(),
            ..Self::default()
        }
    }

    pub fn last_received(&self) -> Option<String> {
        self.received.lock().unwrap().last().cloned()
    }
}

impl KickstartService for FakeModule {
    fn kickstart_commands(&self) -> Vec<String> {
        self.commands.clone()
    }

    fn kickstart_sections(&self) -> Vec<String> {
        self.sections.clone()
    }

    fn kickstart_addons(&self) -> Vec<String> {
        self.addons.clone()
    }

    fn read_kickstart(&self, text: &str) -> KickstartReport {
        self.received.lock().unwrap().push(text.to_string());
        let mut report = KickstartReport::new();
        for (line, message) in &self.errors {
            report.add_error(KickstartMessage::at_line(*line, message.clone()));
        }
        report
    }

    fn generate_kickstart(&self) -> String {
        self.output.clone()
    }

    fn set_locale(&self, locale: &str) {
        *self.locale.lock().unwrap() = Some(locale.to_string());
    }

    fn install_with_tasks(&self) -> Vec<Arc<dyn Task>> {
        self.tasks.clone()
    }

    fn configure_with_tasks(&self) -> Vec<Arc<dyn Task>> {
        self.tasks.clone()
    }
}

type Hosted = Arc<Mutex<Vec<(EventLoop, Arc<MessageBus>)>>>;

/// Activation runs the module in this process, on its own loop.
struct InProcessModule {
    service: Arc<dyn KickstartService>,
    hosted: Hosted,
}

impl Activator for InProcessModule {
    fn activate(&self, name: &str, address: &BusAddress) -> Result<(), String> {
        let name = name.to_string();
        let address = address.clone();
        let service = Arc::clone(&self.service);
        let hosted = Arc::clone(&self.hosted);
        thread::Builder::new()
            .name(format!("activate {}", name))
            .spawn(move || {
                let event_loop = EventLoop::spawn(format!("module {}", name)).unwrap();
                let bus = MessageBus::new(
                    AddressSource::Address(address),
                    event_loop.clone(),
                    installer_error_mapper(),
                );
                publish_module(&bus, &name, service).unwrap();
                hosted.lock().unwrap().push((event_loop, bus));
            })
            .map(|_| ())
            .map_err(|e| e.to_string())
    }
}

/// Activation that cannot start anything.
struct BrokenModule;

impl Activator for BrokenModule {
    fn activate(&self, name: &str, _address: &BusAddress) -> Result<(), String> {
        Err(format!("no program for {}", name))
    }
}

/// A memory broker with in-process modules and a Boss-side bus.
pub struct TestInstaller {
    pub broker_name: String,
    pub broker: Arc<Broker>,
    pub event_loop: EventLoop,
    pub bus: Arc<MessageBus>,
    pub modules: Arc<ModuleManager>,
    hosted: Hosted,
}

impl TestInstaller {
    pub fn new(broker_name: &str) -> Self {
        let broker = quarry::bus::start_memory_broker(broker_name);
        let event_loop = EventLoop::spawn(format!("{} boss", broker_name)).unwrap();
        let bus = MessageBus::new(
            AddressSource::Address(BusAddress::memory(broker_name)),
            event_loop.clone(),
            installer_error_mapper(),
        );
        Self {
            broker_name: broker_name.to_string(),
            broker,
            event_loop,
            modules: Arc::new(ModuleManager::new(Arc::clone(&bus))),
            bus,
            hosted: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Make `name` activatable as an in-process module.
    pub fn add_module(&self, name: &str, service: Arc<dyn KickstartService>) {
        self.broker.register_activatable(
            name,
            Arc::new(InProcessModule {
                service,
                hosted: Arc::clone(&self.hosted),
            }),
        );
    }

    /// Make `name` activatable with an activation that always fails.
    pub fn add_broken_module(&self, name: &str) {
        self.broker.register_activatable(name, Arc::new(BrokenModule));
    }

    /// Start every module and addon; addons are optional.
    pub fn start_config() -> ModuleStartConfig {
        ModuleStartConfig {
            activatable: vec![
                format!("{}.*", MODULES_NAMESPACE),
                format!("{}.*", ADDONS_NAMESPACE),
            ],
            forbidden: Vec::new(),
            optional: vec![ADDONS_NAMESPACE.to_string()],
            timeout: Duration::from_secs(10),
        }
    }

    /// Run the start task and hand its observers to the manager.
    pub fn start(&self, config: ModuleStartConfig) -> Result<Vec<Arc<ModuleObserver>>, TaskError> {
        let task = self.modules.start_modules_with_task(config);
        task.start()?;
        let observers = task.observers();
        self.modules.set_module_observers(observers.clone());
        Ok(observers)
    }

    pub fn shutdown(self) {
        self.modules.stop_modules();
        self.modules.disconnect();
        self.bus.disconnect();
        self.event_loop.shutdown();
        let hosted: Vec<_> = self.hosted.lock().unwrap().drain(..).collect();
        for (event_loop, bus) in hosted {
            bus.disconnect();
            event_loop.shutdown();
        }
        quarry::bus::stop_memory_broker(&self.broker_name);
    }
}
