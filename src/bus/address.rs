//! Bus addresses and how the installer finds its bus.

use super::error::BusError;
use log::debug;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

/// Environment variable that carries the installer bus address.
pub const SESSION_ADDRESS_ENV: &str = "QUARRY_SESSION_ADDRESS";

/// Environment variable set for services started by bus activation.
pub const STARTER_ADDRESS_ENV: &str = "DBUS_STARTER_ADDRESS";

/// D-Bus transports that only a standard bus daemon serves.
const FOREIGN_TRANSPORTS: &[&str] = &[
    "tcp",
    "nonce-tcp",
    "unixexec",
    "launchd",
    "autolaunch",
    "systemd",
    "vsock",
];

/// File the bus launcher writes the installer bus address to.
pub const DEFAULT_ADDRESS_FILE: &str = "/run/quarry/bus.address";

/// Where a bus broker can be reached.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum BusAddress {
    /// A broker living in this process, registered under a name.
    Memory { name: String },
    /// A broker listening on a unix stream socket.
    Unix { path: PathBuf },
}

impl BusAddress {
    pub fn memory(name: impl Into<String>) -> Self {
        BusAddress::Memory { name: name.into() }
    }

    pub fn unix(path: impl Into<PathBuf>) -> Self {
        BusAddress::Unix { path: path.into() }
    }
}

impl fmt::Display for BusAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BusAddress::Memory { name } => write!(f, "memory:name={}", name),
            BusAddress::Unix { path } => write!(f, "unix:path={}", path.display()),
        }
    }
}

impl FromStr for BusAddress {
    type Err = BusError;

    /// Parse an address list separated by `;`. The first entry we can
    /// reach wins.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut unsupported = Vec::new();
        for entry in s.split(';').map(str::trim).filter(|entry| !entry.is_empty()) {
            match parse_entry(entry)? {
                Some(address) => return Ok(address),
                None => unsupported.push(entry),
            }
        }
        if unsupported.is_empty() {
            return Err(BusError::InvalidAddress(s.to_string()));
        }
        Err(BusError::ConnectionUnavailable(format!(
            "{} needs a standard bus daemon, only memory:name= and unix:path= are served",
            unsupported.join(";")
        )))
    }
}

/// `Ok(None)` for well-formed addresses of transports we do not speak.
fn parse_entry(entry: &str) -> Result<Option<BusAddress>, BusError> {
    let invalid = || BusError::InvalidAddress(entry.to_string());
    let (transport, params) = entry.split_once(':').ok_or_else(invalid)?;
    let pairs: Vec<(&str, &str)> = params
        .split(',')
        .filter_map(|pair| pair.split_once('='))
        .collect();
    let value_of = |wanted: &str| {
        pairs
            .iter()
            .find(|(key, _)| *key == wanted)
            .map(|(_, value)| *value)
            .filter(|value| !value.is_empty())
    };

    match transport {
        "memory" => value_of("name").map(|name| Some(BusAddress::memory(name))).ok_or_else(invalid),
        "unix" => match value_of("path") {
            Some(path) => Ok(Some(BusAddress::unix(path))),
            // abstract=, dir=, tmpdir= and runtime= are daemon-only.
            None if !pairs.is_empty() => Ok(None),
            None => Err(invalid()),
        },
        _ if FOREIGN_TRANSPORTS.contains(&transport) => Ok(None),
        _ => Err(invalid()),
    }
}

/// How a [`super::MessageBus`] finds its address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AddressSource {
    /// A fixed address.
    Address(BusAddress),
    /// The installer bus: the session variable, then the address file,
    /// then the starter variable.
    Installer { address_file: PathBuf },
    /// Only the address of the bus that activated us.
    Starter,
}

impl AddressSource {
    pub fn installer() -> Self {
        AddressSource::Installer {
            address_file: PathBuf::from(DEFAULT_ADDRESS_FILE),
        }
    }

    /// Resolve against the process environment.
    pub fn resolve(&self) -> Result<BusAddress, BusError> {
        self.resolve_with(|key| std::env::var(key).ok())
    }

    /// Resolve with an explicit environment lookup.
    pub fn resolve_with(
        &self,
        env: impl Fn(&str) -> Option<String>,
    ) -> Result<BusAddress, BusError> {
        match self {
            AddressSource::Address(address) => Ok(address.clone()),
            AddressSource::Installer { address_file } => {
                if let Some(address) = non_empty(env(SESSION_ADDRESS_ENV)) {
                    debug!("Using bus address from {}", SESSION_ADDRESS_ENV);
                    return address.parse();
                }
                if let Some(address) = read_address_file(address_file) {
                    debug!("Using bus address from {}", address_file.display());
                    return address.parse();
                }
                if let Some(address) = non_empty(env(STARTER_ADDRESS_ENV)) {
                    debug!("Using bus address from {}", STARTER_ADDRESS_ENV);
                    return address.parse();
                }
                Err(BusError::ConnectionUnavailable(format!(
                    "neither {}, {} nor {} provide a bus address",
                    SESSION_ADDRESS_ENV,
                    address_file.display(),
                    STARTER_ADDRESS_ENV
                )))
            }
            AddressSource::Starter => non_empty(env(STARTER_ADDRESS_ENV))
                .ok_or_else(|| {
                    BusError::ConnectionUnavailable(format!("{} is not set", STARTER_ADDRESS_ENV))
                })?
                .parse(),
        }
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}

/// First line of the address file, stripped.
fn read_address_file(path: &Path) -> Option<String> {
    let content = std::fs::read_to_string(path).ok()?;
    non_empty(content.lines().next().map(|line| line.trim().to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env_of(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_parse_and_display() {
        let address: BusAddress = "unix:path=/run/quarry/bus".parse().unwrap();
        assert_eq!(address, BusAddress::unix("/run/quarry/bus"));
        assert_eq!(address.to_string(), "unix:path=/run/quarry/bus");

        let address: BusAddress = "memory:name=test-1".parse().unwrap();
        assert_eq!(address.to_string(), "memory:name=test-1");

        assert!("unix:path=".parse::<BusAddress>().is_err());
        assert!("garbage".parse::<BusAddress>().is_err());
        assert!(matches!(
            "bogus:x=1".parse::<BusAddress>(),
            Err(BusError::InvalidAddress(_))
        ));
    }

    #[test]
    fn test_standard_bus_addresses_are_unavailable() {
        for address in [
            "unix:abstract=/tmp/dbus-XXXXXX,guid=0123",
            "unix:runtime=yes",
            "tcp:host=localhost,port=12345",
            "autolaunch:",
            "unix:abstract=/tmp/a;tcp:host=x,port=1",
        ] {
            match address.parse::<BusAddress>() {
                Err(BusError::ConnectionUnavailable(message)) => {
                    assert!(message.contains("standard bus daemon"), "{}", message)
                }
                other => panic!("{} parsed to {:?}", address, other),
            }
        }
    }

    #[test]
    fn test_address_list_takes_first_served_entry() {
        let address: BusAddress = "unix:abstract=/tmp/dbus-1;unix:path=/run/quarry/bus;memory:name=x"
            .parse()
            .unwrap();
        assert_eq!(address, BusAddress::unix("/run/quarry/bus"));
    }

    #[test]
    fn test_session_variable_wins() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("bus.address");
        std::fs::write(&file, "memory:name=from-file\n").unwrap();

        let source = AddressSource::Installer { address_file: file };
        let env = env_of(&[
            (SESSION_ADDRESS_ENV, "memory:name=from-env"),
            (STARTER_ADDRESS_ENV, "memory:name=from-starter"),
        ]);
        assert_eq!(source.resolve_with(env).unwrap(), BusAddress::memory("from-env"));
    }

    #[test]
    fn test_address_file_before_starter() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("bus.address");
        std::fs::write(&file, "  memory:name=from-file  \nsecond line\n").unwrap();

        let source = AddressSource::Installer { address_file: file };
        let env = env_of(&[(STARTER_ADDRESS_ENV, "memory:name=from-starter")]);
        assert_eq!(source.resolve_with(env).unwrap(), BusAddress::memory("from-file"));
    }

    #[test]
    fn test_starter_fallback_and_unavailable() {
        let dir = tempfile::tempdir().unwrap();
        let source = AddressSource::Installer {
            address_file: dir.path().join("missing"),
        };
        let env = env_of(&[(STARTER_ADDRESS_ENV, "memory:name=from-starter")]);
        assert_eq!(
            source.resolve_with(env).unwrap(),
            BusAddress::memory("from-starter")
        );

        let err = source.resolve_with(env_of(&[])).unwrap_err();
        assert!(matches!(err, BusError::ConnectionUnavailable(_)));
        assert!(AddressSource::Starter.resolve_with(env_of(&[])).is_err());
    }
}
