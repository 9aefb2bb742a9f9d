//! Names, paths and defaults shared by the Boss, the modules and the tools.

use crate::bus::names::{dotted, object_path_for};

/// Root namespace of every installer service.
pub const INSTALLER_NAMESPACE: &str = "org.quarry.Installer";

/// The Boss service.
pub const BOSS_NAME: &str = "org.quarry.Installer.Boss";
pub const BOSS_PATH: &str = "/org/quarry/Installer/Boss";
pub const BOSS_INTERFACE: &str = "org.quarry.Installer.Boss";

/// Namespace of the regular installation modules.
pub const MODULES_NAMESPACE: &str = "org.quarry.Installer.Modules";

/// Namespace of the addon modules.
pub const ADDONS_NAMESPACE: &str = "org.quarry.Installer.Addons";

/// Namespace used to name errors sent over the bus.
pub const ERROR_NAMESPACE: &str = "org.quarry.Installer.Error";

/// Interface every module implements for kickstart handling.
pub const KICKSTART_INTERFACE: &str = "org.quarry.Installer.Modules.Kickstart";

/// Interface of remote task objects.
pub const TASK_INTERFACE: &str = "org.quarry.Installer.Task";

/// Parent path of published task objects.
pub const TASK_PATH_PREFIX: &str = "/org/quarry/Installer/Task";

/// Boss configuration file.
pub const DEFAULT_CONFIG_PATH: &str = "/etc/quarry/boss.json";

/// Seconds to wait for the modules to appear on the bus.
pub const DEFAULT_START_TIMEOUT_SECS: u64 = 600;

/// Sections a kickstart may contain besides addons.
pub const DEFAULT_KICKSTART_SECTIONS: &[&str] = &[
    "pre",
    "pre-install",
    "post",
    "onerror",
    "traceback",
    "packages",
    "anaconda",
];

/// Name of the queue that installs the system.
pub const INSTALL_QUEUE_NAME: &str = "Install the system";

/// Name of the queue that configures the runtime environment.
pub const CONFIGURE_RUNTIME_QUEUE_NAME: &str = "Configure the runtime";

/// Object path of the `index`th published task.
pub fn task_path(index: u64) -> String {
    format!("{}/{}", TASK_PATH_PREFIX, index)
}

/// Well-known name of a regular module, e.g. `Network`.
pub fn module_name(short: &str) -> String {
    dotted(&[MODULES_NAMESPACE, short])
}

/// Well-known name of an addon.
pub fn addon_name(short: &str) -> String {
    dotted(&[ADDONS_NAMESPACE, short])
}

/// Object path a module publishes its kickstart interface at.
pub fn module_path(service_name: &str) -> String {
    object_path_for(service_name)
}
