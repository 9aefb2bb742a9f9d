//! Observers of installer modules.

use super::proxy::KickstartModuleProxy;
use crate::bus::names::in_namespace;
use crate::bus::{BusError, ClientObjectProxy, DBusObjectObserver, DBusObserver, MessageBus};
use crate::constants::{module_path, ADDONS_NAMESPACE};
use std::sync::Arc;

/// Watches one module and hands out proxies of its main object.
#[derive(Debug)]
pub struct ModuleObserver {
    inner: DBusObjectObserver,
    is_addon: bool,
}

impl ModuleObserver {
    pub fn new(bus: &Arc<MessageBus>, service_name: &str) -> Arc<Self> {
        Arc::new(Self {
            inner: DBusObjectObserver::new(bus, service_name, &module_path(service_name)),
            is_addon: in_namespace(ADDONS_NAMESPACE, service_name),
        })
    }

    pub fn service_name(&self) -> &str {
        self.inner.service_name()
    }

    pub fn object_path(&self) -> &str {
        self.inner.object_path()
    }

    /// Addons live in the addons namespace.
    pub fn is_addon(&self) -> bool {
        self.is_addon
    }

    pub fn is_service_available(&self) -> bool {
        self.inner.is_service_available()
    }

    /// The name watch, with its availability signals.
    pub fn observer(&self) -> &Arc<DBusObserver> {
        self.inner.observer()
    }

    pub fn connect_once_available(&self) -> Result<(), BusError> {
        self.inner.connect_once_available()
    }

    pub fn proxy(&self) -> Result<Arc<ClientObjectProxy>, BusError> {
        self.inner.proxy()
    }

    /// The kickstart interface of the module.
    pub fn kickstart(&self) -> Result<KickstartModuleProxy, BusError> {
        Ok(KickstartModuleProxy::new(self.proxy()?))
    }

    pub fn disconnect(&self) {
        self.inner.disconnect();
    }
}
