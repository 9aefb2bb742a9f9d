//! Quarry installer core
//!
//! This library provides the orchestration core of the Quarry installer: the
//! typed message bus, the module manager, the kickstart dispatcher and the
//! installation dispatcher with its task queues.

pub mod boss;
pub mod bus;
pub mod cli;
pub mod config;
pub mod constants;
pub mod dispatch;
pub mod error;
pub mod kickstart;
pub mod modules;
pub mod presentation;
pub mod process_guard;
pub mod tasks;

// Re-export main types for convenience
pub use boss::{publish_boss, Boss, InstallManager};
pub use bus::{AddressSource, BusAddress, BusError, EventLoop, MessageBus};
pub use config::{BossConfig, ServiceEntry};
pub use dispatch::{default_steps, Direction, DispatchError, Dispatcher, InstallContext, Step};
pub use error::{installer_error_mapper, QuarryError};
pub use kickstart::{
    publish_module, KickstartManager, KickstartReport, KickstartService, SplitKickstartParser,
};
pub use modules::{ModuleManager, ModuleObserver, ModuleStartConfig, StartModulesTask};
pub use presentation::{ConsolePresentation, Presentation};
pub use process_guard::{ChildRegistry, CommandProcessGroup, ProcessGuard, ServiceActivator};
pub use tasks::{ErrorHandler, InstallErrorHandler, Task, TaskError, TaskQueue};
