//! Well-known names, interfaces, flags, and naming conventions.

/// The bus daemon itself.
pub const DBUS_NAME: &str = "org.freedesktop.DBus";
pub const DBUS_PATH: &str = "/org/freedesktop/DBus";
pub const DBUS_INTERFACE: &str = "org.freedesktop.DBus";

pub const PROPERTIES_INTERFACE: &str = "org.freedesktop.DBus.Properties";
pub const INTROSPECTABLE_INTERFACE: &str = "org.freedesktop.DBus.Introspectable";
pub const PEER_INTERFACE: &str = "org.freedesktop.DBus.Peer";

/// Error names produced by the runtime and the broker.
pub mod errors {
    pub const FAILED: &str = "org.freedesktop.DBus.Error.Failed";
    pub const SERVICE_UNKNOWN: &str = "org.freedesktop.DBus.Error.ServiceUnknown";
    pub const NAME_HAS_NO_OWNER: &str = "org.freedesktop.DBus.Error.NameHasNoOwner";
    pub const UNKNOWN_OBJECT: &str = "org.freedesktop.DBus.Error.UnknownObject";
    pub const UNKNOWN_INTERFACE: &str = "org.freedesktop.DBus.Error.UnknownInterface";
    pub const UNKNOWN_METHOD: &str = "org.freedesktop.DBus.Error.UnknownMethod";
    pub const UNKNOWN_PROPERTY: &str = "org.freedesktop.DBus.Error.UnknownProperty";
    pub const PROPERTY_READ_ONLY: &str = "org.freedesktop.DBus.Error.PropertyReadOnly";
    pub const INVALID_ARGS: &str = "org.freedesktop.DBus.Error.InvalidArgs";
    pub const SPAWN_FAILED: &str = "org.freedesktop.DBus.Error.Spawn.Failed";
    pub const NO_REPLY: &str = "org.freedesktop.DBus.Error.NoReply";
    pub const DISCONNECTED: &str = "org.freedesktop.DBus.Error.Disconnected";
}

/// `RequestName` flags.
pub mod request_flags {
    pub const ALLOW_REPLACEMENT: u32 = 0x1;
    pub const REPLACE_EXISTING: u32 = 0x2;
    pub const DO_NOT_QUEUE: u32 = 0x4;
}

/// `RequestName` replies.
pub mod request_reply {
    pub const PRIMARY_OWNER: u32 = 1;
    pub const IN_QUEUE: u32 = 2;
    pub const EXISTS: u32 = 3;
    pub const ALREADY_OWNER: u32 = 4;
}

/// `ReleaseName` replies.
pub mod release_reply {
    pub const RELEASED: u32 = 1;
    pub const NON_EXISTENT: u32 = 2;
    pub const NOT_OWNER: u32 = 3;
}

/// `StartServiceByName` replies.
pub mod start_reply {
    pub const SUCCESS: u32 = 1;
    pub const ALREADY_RUNNING: u32 = 2;
}

/// Suffix that turns a namespace into a wildcard pattern.
pub const WILDCARD_SUFFIX: &str = ".*";

/// Build the conventional object path of a dotted service name.
///
/// `org.quarry.Installer.Boss` becomes `/org/quarry/Installer/Boss`.
pub fn object_path_for(service_name: &str) -> String {
    format!("/{}", service_name.replace('.', "/"))
}

/// Join namespace components into a dotted name.
pub fn dotted(parts: &[&str]) -> String {
    parts.join(".")
}

/// Returns true if the pattern is a namespace wildcard (`<namespace>.*`).
pub fn is_wildcard(pattern: &str) -> bool {
    pattern.ends_with(WILDCARD_SUFFIX)
}

/// Match a service name against an exact name or a namespace wildcard.
pub fn matches_pattern(pattern: &str, name: &str) -> bool {
    match pattern.strip_suffix('*') {
        Some(prefix) if prefix.ends_with('.') => name.starts_with(prefix) && name.len() > prefix.len(),
        _ => pattern == name,
    }
}

/// Returns true if the name lives in the given namespace.
pub fn in_namespace(namespace: &str, name: &str) -> bool {
    name.len() > namespace.len()
        && name.starts_with(namespace)
        && name[namespace.len()..].starts_with('.')
}

/// Validate a well-known bus name: at least two non-empty dotted elements
/// made of `[A-Za-z0-9_-]`, none starting with a digit.
pub fn is_valid_bus_name(name: &str) -> bool {
    let elements: Vec<&str> = name.split('.').collect();
    elements.len() >= 2
        && elements.iter().all(|element| {
            !element.is_empty()
                && !element.starts_with(|c: char| c.is_ascii_digit())
                && element
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
        })
}

/// Returns true for connection-unique names such as `:1.7`.
pub fn is_unique_name(name: &str) -> bool {
    name.starts_with(':')
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_object_path_for() {
        assert_eq!(
            object_path_for("org.quarry.Installer.Boss"),
            "/org/quarry/Installer/Boss"
        );
    }

    #[test]
    fn test_matches_pattern() {
        assert!(matches_pattern("org.a.Modules.*", "org.a.Modules.Storage"));
        assert!(!matches_pattern("org.a.Modules.*", "org.a.Modules"));
        assert!(!matches_pattern("org.a.Modules.*", "org.a.ModulesX.Storage"));
        assert!(matches_pattern("org.a.Modules.B", "org.a.Modules.B"));
        assert!(!matches_pattern("org.a.Modules.B", "org.a.Modules.Bx"));
    }

    #[test]
    fn test_in_namespace() {
        assert!(in_namespace("org.a.Addons", "org.a.Addons.Kdump"));
        assert!(!in_namespace("org.a.Addons", "org.a.AddonsX"));
        assert!(!in_namespace("org.a.Addons", "org.a.Addons"));
    }

    #[test]
    fn test_bus_name_validation() {
        assert!(is_valid_bus_name("org.quarry.Installer"));
        assert!(is_valid_bus_name("my.test-name_1"));
        assert!(!is_valid_bus_name("single"));
        assert!(!is_valid_bus_name("org..x"));
        assert!(!is_valid_bus_name("org.1x"));
    }
}
