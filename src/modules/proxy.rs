//! Typed access to the kickstart interface of a module.

use crate::bus::{BusError, ClientObjectProxy, FromValue, ObjectPath, Value};
use crate::kickstart::KickstartReport;
use std::sync::Arc;

#[derive(Debug, Clone)]
pub struct KickstartModuleProxy {
    proxy: Arc<ClientObjectProxy>,
}

impl KickstartModuleProxy {
    pub fn new(proxy: Arc<ClientObjectProxy>) -> Self {
        Self { proxy }
    }

    pub fn service(&self) -> &str {
        self.proxy.service()
    }

    fn strings(&self, property: &str) -> Result<Vec<String>, BusError> {
        Ok(Vec::<String>::from_value(self.proxy.get(property)?)?)
    }

    pub fn kickstart_commands(&self) -> Result<Vec<String>, BusError> {
        self.strings("KickstartCommands")
    }

    pub fn kickstart_sections(&self) -> Result<Vec<String>, BusError> {
        self.strings("KickstartSections")
    }

    pub fn kickstart_addons(&self) -> Result<Vec<String>, BusError> {
        self.strings("KickstartAddons")
    }

    /// Hand the module its slice of the kickstart.
    pub fn read_kickstart(&self, text: &str) -> Result<KickstartReport, BusError> {
        Ok(self
            .proxy
            .call("ReadKickstart", vec![Value::from(text)])?
            .get::<KickstartReport>()?)
    }

    pub fn generate_kickstart(&self) -> Result<String, BusError> {
        Ok(self.proxy.call("GenerateKickstart", Vec::new())?.get::<String>()?)
    }

    pub fn set_locale(&self, locale: &str) -> Result<(), BusError> {
        self.proxy.call("SetLocale", vec![Value::from(locale)])?;
        Ok(())
    }

    pub fn quit(&self) -> Result<(), BusError> {
        self.proxy.call("Quit", Vec::new())?;
        Ok(())
    }

    /// Object paths of the installation tasks of the module.
    pub fn install_with_tasks(&self) -> Result<Vec<ObjectPath>, BusError> {
        Ok(self.proxy.call("InstallWithTasks", Vec::new())?.get::<Vec<ObjectPath>>()?)
    }

    /// Object paths of the runtime configuration tasks of the module.
    pub fn configure_with_tasks(&self) -> Result<Vec<ObjectPath>, BusError> {
        Ok(self
            .proxy
            .call("ConfigureWithTasks", Vec::new())?
            .get::<Vec<ObjectPath>>()?)
    }
}
