//! The module side of the kickstart interface
//!
//! A module implements [`KickstartService`] and calls [`publish_module`] to
//! put it on the bus under its well-known name.

use super::report::KickstartReport;
use crate::bus::names::request_flags;
use crate::bus::{
    arg, BusError, Interface, IntoValue, MessageBus, MethodError, ObjectPath, ObjectTable,
    ServerObjectHandler, Value,
};
use crate::constants::{module_path, KICKSTART_INTERFACE};
use crate::tasks::{publish_task, Task};
use log::{debug, info};
use std::sync::{Arc, Weak};

/// What a module does with its part of the kickstart.
pub trait KickstartService: Send + Sync + 'static {
    /// Kickstart commands the module handles.
    fn kickstart_commands(&self) -> Vec<String>;

    fn kickstart_sections(&self) -> Vec<String> {
        Vec::new()
    }

    fn kickstart_addons(&self) -> Vec<String> {
        Vec::new()
    }

    /// Read the module's slice of the kickstart. Line numbers in the report
    /// count from 1 within `text`.
    fn read_kickstart(&self, text: &str) -> KickstartReport;

    fn generate_kickstart(&self) -> String;

    fn set_locale(&self, _locale: &str) {}

    fn install_with_tasks(&self) -> Vec<Arc<dyn Task>> {
        Vec::new()
    }

    fn configure_with_tasks(&self) -> Vec<Arc<dyn Task>> {
        Vec::new()
    }
}

fn strings(values: Vec<String>) -> Value {
    values.into_value()
}

fn publish_all(bus: &Weak<MessageBus>, tasks: Vec<Arc<dyn Task>>) -> Result<Vec<Value>, MethodError> {
    let bus = bus
        .upgrade()
        .ok_or_else(|| MethodError::failed("the module is shutting down"))?;
    let paths = tasks
        .into_iter()
        .map(|task| publish_task(&bus, task))
        .collect::<Result<Vec<ObjectPath>, BusError>>()
        .map_err(MethodError::new)?;
    Ok(vec![paths.into_value()])
}

/// The kickstart interface of `service`. Tasks are published on `bus`.
pub fn kickstart_interface(bus: &Arc<MessageBus>, service: Arc<dyn KickstartService>) -> Interface {
    let commands = Arc::clone(&service);
    let sections = Arc::clone(&service);
    let addons = Arc::clone(&service);
    let reader = Arc::clone(&service);
    let generator = Arc::clone(&service);
    let localizer = Arc::clone(&service);
    let installer = Arc::clone(&service);
    let configurer = Arc::clone(&service);
    let install_bus = Arc::downgrade(bus);
    let configure_bus = Arc::downgrade(bus);
    let quit_bus = Arc::downgrade(bus);

    Interface::new(KICKSTART_INTERFACE)
        .read_property("KickstartCommands", "as", move || {
            Ok(strings(commands.kickstart_commands()))
        })
        .read_property("KickstartSections", "as", move || {
            Ok(strings(sections.kickstart_sections()))
        })
        .read_property("KickstartAddons", "as", move || {
            Ok(strings(addons.kickstart_addons()))
        })
        .method("ReadKickstart", "s", "(a(ssus)a(ssus))", move |args| {
            let text: String = arg(&args, 0).map_err(MethodError::new)?;
            Ok(vec![reader.read_kickstart(&text).into_value()])
        })
        .method("GenerateKickstart", "", "s", move |_| {
            Ok(vec![Value::from(generator.generate_kickstart())])
        })
        .method("SetLocale", "s", "", move |args| {
            let locale: String = arg(&args, 0).map_err(MethodError::new)?;
            localizer.set_locale(&locale);
            Ok(Vec::new())
        })
        .method("InstallWithTasks", "", "ao", move |_| {
            publish_all(&install_bus, installer.install_with_tasks())
        })
        .method("ConfigureWithTasks", "", "ao", move |_| {
            publish_all(&configure_bus, configurer.configure_with_tasks())
        })
        .method("Quit", "", "", move |_| {
            if let Some(bus) = quit_bus.upgrade() {
                schedule_quit(bus);
            }
            Ok(Vec::new())
        })
}

/// Disconnect `bus` and stop its loop once the current call was answered.
fn schedule_quit(bus: Arc<MessageBus>) {
    let event_loop = bus.event_loop().clone();
    event_loop.schedule(move || {
        info!("Quitting");
        bus.disconnect();
        bus.event_loop().quit();
    });
}

/// Publish `service` at the object path of `service_name` and claim the name.
///
/// The object goes first so that a caller woken by the name appearing finds
/// it in place.
pub fn publish_module(
    bus: &Arc<MessageBus>,
    service_name: &str,
    service: Arc<dyn KickstartService>,
) -> Result<Arc<ServerObjectHandler>, BusError> {
    let table = ObjectTable::new().interface(kickstart_interface(bus, service));
    let handler = bus.publish_object(&module_path(service_name), table)?;
    bus.register_service(service_name, request_flags::DO_NOT_QUEUE)?;
    debug!("Module {} is published", service_name);
    Ok(handler)
}
