//! Starting the modules
//!
//! The modules are started by bus activation. The task asks the broker for
//! every activatable name, keeps the ones the configuration activates and
//! does not forbid, starts them all at once and waits until each of them
//! owns its name and answers a ping. Failures of optional modules only
//! remove them from the result.

use super::observer::ModuleObserver;
use super::ModuleError;
use crate::bus::names::{
    in_namespace, is_wildcard, matches_pattern, DBUS_INTERFACE, DBUS_NAME, DBUS_PATH,
    PEER_INTERFACE,
};
use crate::bus::{BusError, Connection, FromValue, Message, MessageBus, Type, Value};
use crate::tasks::{Task, TaskBase, TaskError};
use log::{debug, info, warn};
use std::collections::HashSet;
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::time::{Duration, Instant};

/// Which modules to start and how long to wait for them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModuleStartConfig {
    /// Service names or `<namespace>.*` wildcards.
    pub activatable: Vec<String>,
    /// Names or wildcards never to start.
    pub forbidden: Vec<String>,
    /// Namespaces whose modules may fail.
    pub optional: Vec<String>,
    pub timeout: Duration,
}

impl ModuleStartConfig {
    pub fn is_optional(&self, name: &str) -> bool {
        self.optional
            .iter()
            .any(|namespace| in_namespace(namespace.trim_end_matches(".*"), name))
    }
}

/// Expand `activatable` against the names the broker can activate and drop
/// the forbidden ones.
///
/// Wildcard matches keep the order of `broker_names`. Exact names the broker
/// does not list are kept at the end; starting them will fail.
pub fn resolve_service_names(
    activatable: &[String],
    forbidden: &[String],
    broker_names: &[String],
) -> Vec<String> {
    let mut names: Vec<String> = broker_names
        .iter()
        .filter(|name| activatable.iter().any(|pattern| matches_pattern(pattern, name)))
        .cloned()
        .collect();

    for pattern in activatable.iter().filter(|pattern| !is_wildcard(pattern)) {
        if !names.contains(pattern) {
            names.push(pattern.clone());
        }
    }

    names.retain(|name| {
        let is_forbidden = forbidden.iter().any(|pattern| matches_pattern(pattern, name));
        if is_forbidden {
            debug!("Skipping forbidden module {}", name);
        }
        !is_forbidden
    });
    names
}

#[derive(Debug, Default)]
struct Progress {
    waiting: HashSet<String>,
    dropped: HashSet<String>,
    failure: Option<ModuleError>,
}

type Shared = Arc<(Mutex<Progress>, Condvar)>;

fn update(shared: &Shared, f: impl FnOnce(&mut Progress)) {
    let (lock, condvar) = &**shared;
    f(&mut lock.lock().unwrap_or_else(PoisonError::into_inner));
    condvar.notify_all();
}

fn fail(shared: &Shared, name: &str, optional: bool, reason: String) {
    update(shared, |progress| {
        if optional {
            warn!("Optional module {} is not available: {}", name, reason);
            progress.waiting.remove(name);
            progress.dropped.insert(name.to_string());
        } else if progress.failure.is_none() {
            progress.failure = Some(ModuleError::UnavailableModule {
                name: name.to_string(),
                reason,
            });
        }
    });
}

fn ping(connection: &Connection, name: String, path: String, optional: bool, shared: Shared) {
    let message = Message::method_call(&name, &path, Some(PEER_INTERFACE), "Ping", Vec::new());
    connection.call_async(message, move |result| match result {
        Ok(_) => update(&shared, |progress| {
            if progress.waiting.remove(&name) {
                info!("Module {} is available", name);
            }
        }),
        Err(e) => fail(&shared, &name, optional, format!("ping failed: {}", e)),
    });
}

/// Starts the modules; the result is the list of their observers.
pub struct StartModulesTask {
    base: TaskBase,
    bus: Arc<MessageBus>,
    config: ModuleStartConfig,
    observers: Mutex<Vec<Arc<ModuleObserver>>>,
}

impl std::fmt::Debug for StartModulesTask {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StartModulesTask")
            .field("config", &self.config)
            .finish()
    }
}

impl StartModulesTask {
    pub fn new(bus: Arc<MessageBus>, config: ModuleStartConfig) -> Self {
        Self {
            base: TaskBase::new("Start the modules"),
            bus,
            config,
            observers: Mutex::new(Vec::new()),
        }
    }

    /// Observers of the started modules, in start order. Empty until the
    /// task succeeded.
    pub fn observers(&self) -> Vec<Arc<ModuleObserver>> {
        self.observers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn activatable_names(&self, connection: &Connection) -> Result<Vec<String>, TaskError> {
        let reply = connection.call_daemon("ListActivatableNames", Vec::new())?;
        let value = reply.into_iter().next().unwrap_or(Value::Array {
            element: Type::Str,
            items: Vec::new(),
        });
        Ok(Vec::<String>::from_value(value).map_err(BusError::from)?)
    }

    fn start_one(&self, connection: &Arc<Connection>, observer: &Arc<ModuleObserver>, shared: &Shared) {
        let name = observer.service_name().to_string();
        let optional = self.config.is_optional(&name);

        // The first appearance of the name triggers the ping.
        {
            let connection = Arc::clone(connection);
            let shared = Arc::clone(shared);
            let name = name.clone();
            let path = observer.object_path().to_string();
            observer.observer().service_available.connect(move |_| {
                let waiting = {
                    let (lock, _) = &*shared;
                    lock.lock()
                        .unwrap_or_else(PoisonError::into_inner)
                        .waiting
                        .contains(&name)
                };
                if waiting {
                    ping(&connection, name.clone(), path.clone(), optional, Arc::clone(&shared));
                }
            });
        }

        let message = Message::method_call(
            DBUS_NAME,
            DBUS_PATH,
            Some(DBUS_INTERFACE),
            "StartServiceByName",
            vec![Value::from(name.as_str()), Value::UInt32(0)],
        );
        let observer = Arc::clone(observer);
        let shared = Arc::clone(shared);
        debug!("Starting module {}", name);
        connection.call_async(message, move |result| match result {
            Ok(_) => {
                debug!("Module {} was started", name);
                if let Err(e) = observer.connect_once_available() {
                    fail(&shared, &name, optional, e.to_string());
                }
            }
            Err(e) => fail(&shared, &name, optional, e.to_string()),
        });
    }

    fn wait(&self, shared: &Shared) -> Result<HashSet<String>, ModuleError> {
        let deadline = Instant::now() + self.config.timeout;
        let (lock, condvar) = &**shared;
        let mut progress = lock.lock().unwrap_or_else(PoisonError::into_inner);

        loop {
            if let Some(failure) = progress.failure.take() {
                return Err(failure);
            }
            if progress.waiting.is_empty() {
                return Ok(std::mem::take(&mut progress.dropped));
            }

            let now = Instant::now();
            if now >= deadline {
                let (optional, mut missing): (Vec<String>, Vec<String>) = progress
                    .waiting
                    .drain()
                    .partition(|name| self.config.is_optional(name));
                for name in optional {
                    warn!("Optional module {} did not start in time", name);
                    progress.dropped.insert(name);
                }
                if missing.is_empty() {
                    return Ok(std::mem::take(&mut progress.dropped));
                }
                missing.sort();
                return Err(ModuleError::UnavailableModule {
                    name: missing.join(", "),
                    reason: format!("not available after {}s", self.config.timeout.as_secs()),
                });
            }

            progress = condvar
                .wait_timeout(progress, deadline - now)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
    }
}

impl Task for StartModulesTask {
    fn base(&self) -> &TaskBase {
        &self.base
    }

    fn run(&self) -> Result<(), TaskError> {
        if self.bus.event_loop().is_loop_thread() {
            return Err(TaskError::failed(
                self.name(),
                "the modules cannot be awaited from the bus loop thread",
            ));
        }

        let connection = self.bus.connection()?;
        let broker_names = self.activatable_names(&connection)?;
        let names = resolve_service_names(
            &self.config.activatable,
            &self.config.forbidden,
            &broker_names,
        );
        info!("Starting modules: {}", names.join(", "));

        let shared: Shared = Arc::new((
            Mutex::new(Progress {
                waiting: names.iter().cloned().collect(),
                ..Progress::default()
            }),
            Condvar::new(),
        ));
        let observers: Vec<Arc<ModuleObserver>> = names
            .iter()
            .map(|name| ModuleObserver::new(&self.bus, name))
            .collect();
        for observer in &observers {
            self.start_one(&connection, observer, &shared);
        }

        let dropped = match self.wait(&shared) {
            Ok(dropped) => dropped,
            Err(e) => {
                for observer in &observers {
                    observer.disconnect();
                }
                return Err(e.into());
            }
        };

        let mut started = Vec::new();
        for observer in observers {
            if dropped.contains(observer.service_name()) {
                observer.disconnect();
            } else {
                started.push(observer);
            }
        }
        info!("{} module(s) are running", started.len());
        *self.observers.lock().unwrap_or_else(PoisonError::into_inner) = started;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn strings(values: &[&str]) -> Vec<String> {
        values.iter().map(|v| v.to_string()).collect()
    }

    #[test]
    fn test_resolve_keeps_broker_order_minus_forbidden() {
        let broker = strings(&[
            "org.test.Modules.A",
            "org.test.Addons.X",
            "org.test.Modules.B",
            "org.test.Other.Z",
            "org.test.Modules.C",
        ]);
        let names = resolve_service_names(
            &strings(&["org.test.Modules.*", "org.test.Addons.*"]),
            &strings(&["org.test.Modules.B"]),
            &broker,
        );
        assert_eq!(
            names,
            strings(&["org.test.Modules.A", "org.test.Addons.X", "org.test.Modules.C"])
        );
    }

    #[test]
    fn test_resolve_keeps_unknown_exact_names() {
        let names = resolve_service_names(
            &strings(&["org.test.Modules.Missing"]),
            &[],
            &strings(&["org.test.Modules.A"]),
        );
        assert_eq!(names, strings(&["org.test.Modules.Missing"]));
    }

    #[test]
    fn test_forbidden_wildcard() {
        let names = resolve_service_names(
            &strings(&["org.test.*"]),
            &strings(&["org.test.Addons.*"]),
            &strings(&["org.test.Addons.X", "org.test.Modules.A"]),
        );
        assert_eq!(names, strings(&["org.test.Modules.A"]));
    }

    #[test]
    fn test_optional_namespaces() {
        let config = ModuleStartConfig {
            activatable: Vec::new(),
            forbidden: Vec::new(),
            optional: strings(&["org.test.Addons"]),
            timeout: Duration::from_secs(1),
        };
        assert!(config.is_optional("org.test.Addons.X"));
        assert!(!config.is_optional("org.test.Modules.A"));
        assert!(!config.is_optional("org.test.AddonsExtra.Y"));
    }
}
