//! Module manager
//!
//! Starts the installer modules by bus activation, watches them and
//! talks to their kickstart interface.

pub mod manager;
pub mod observer;
pub mod proxy;
pub mod start;

pub use manager::ModuleManager;
pub use observer::ModuleObserver;
pub use proxy::KickstartModuleProxy;
pub use start::{resolve_service_names, ModuleStartConfig, StartModulesTask};

use crate::bus::BusError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ModuleError {
    /// A required module did not start or did not answer.
    #[error("module {name} is unavailable: {reason}")]
    UnavailableModule { name: String, reason: String },

    #[error(transparent)]
    Bus(#[from] BusError),
}
