//! Service processes started by the installer broker
//!
//! When a module is activated, `quarry-boss bus` runs the program configured
//! for its name. Those programs must not outlive the broker: a module left
//! running after the broker died would keep changing the target system with
//! nobody listening.
//!
//! - Every service runs in its own process group with a parent-death signal
//! - Every service PID is tracked in a global registry until it exits
//! - When the broker exits (Drop, SIGTERM, SIGINT, SIGHUP) each group gets
//!   SIGTERM, then SIGKILL after a grace period

use crate::bus::address::{SESSION_ADDRESS_ENV, STARTER_ADDRESS_ENV};
use crate::bus::{Activator, Broker, BusAddress};
use crate::config::ServiceEntry;
use nix::libc;
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use std::collections::HashSet;
use std::process::Command;
use std::sync::{mpsc, Arc, Mutex, MutexGuard, OnceLock, PoisonError};
use std::thread;
use std::time::{Duration, Instant};

static CHILD_REGISTRY: OnceLock<Arc<Mutex<ChildRegistry>>> = OnceLock::new();

/// PIDs of the running service processes.
#[derive(Debug, Default)]
pub struct ChildRegistry {
    pids: HashSet<u32>,
    /// Set by the first `terminate_all`; later calls do nothing.
    cleanup_initiated: bool,
}

impl ChildRegistry {
    /// The registry shared by the activators and the signal handlers.
    pub fn global() -> Arc<Mutex<ChildRegistry>> {
        CHILD_REGISTRY
            .get_or_init(|| Arc::new(Mutex::new(ChildRegistry::default())))
            .clone()
    }

    fn lock_global() -> MutexGuard<'static, ChildRegistry> {
        CHILD_REGISTRY
            .get_or_init(|| Arc::new(Mutex::new(ChildRegistry::default())))
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    pub fn register(&mut self, pid: u32) {
        self.pids.insert(pid);
        log::debug!("Registered service process {}", pid);
    }

    pub fn unregister(&mut self, pid: u32) {
        if self.pids.remove(&pid) {
            log::debug!("Unregistered service process {}", pid);
        }
    }

    pub fn count(&self) -> usize {
        self.pids.len()
    }

    pub fn contains(&self, pid: u32) -> bool {
        self.pids.contains(&pid)
    }

    /// SIGTERM every process group, wait up to `grace_period` for them to
    /// go away, then SIGKILL what is left.
    pub fn terminate_all(&mut self, grace_period: Duration) {
        if self.cleanup_initiated {
            log::debug!("Service cleanup already initiated");
            return;
        }
        self.cleanup_initiated = true;

        if self.pids.is_empty() {
            log::debug!("No service processes to terminate");
            return;
        }

        log::info!("Terminating {} service process(es)", self.pids.len());

        let pids: Vec<u32> = self.pids.iter().copied().collect();
        for &pid in &pids {
            if let Err(e) = send_signal_to_group(pid, Signal::SIGTERM) {
                log::warn!("Failed to send SIGTERM to process group {}: {}", pid, e);
                if let Err(e) = send_signal(pid, Signal::SIGTERM) {
                    log::warn!("Failed to send SIGTERM to PID {}: {}", pid, e);
                }
            }
        }

        let start = Instant::now();
        while start.elapsed() < grace_period {
            if !pids.iter().any(|&pid| is_process_alive(pid)) {
                log::info!("All service processes exited");
                self.pids.clear();
                return;
            }
            thread::sleep(Duration::from_millis(100));
        }

        for &pid in pids.iter().filter(|&&pid| is_process_alive(pid)) {
            log::warn!("Service process group {} ignored SIGTERM, killing it", pid);
            if let Err(e) = send_signal_to_group(pid, Signal::SIGKILL) {
                log::error!("Failed to send SIGKILL to process group {}: {}", pid, e);
                let _ = send_signal(pid, Signal::SIGKILL);
            }
        }

        self.pids.clear();
        log::info!("Service process cleanup complete");
    }
}

fn send_signal(pid: u32, signal: Signal) -> Result<(), nix::Error> {
    signal::kill(Pid::from_raw(pid as i32), signal)
}

/// A negative PID addresses the whole group, so helpers the service
/// started get the signal too.
fn send_signal_to_group(pgid: u32, signal: Signal) -> Result<(), nix::Error> {
    signal::kill(Pid::from_raw(-(pgid as i32)), signal)
}

/// Alive means signalable and neither zombie nor dead.
fn is_process_alive(pid: u32) -> bool {
    if signal::kill(Pid::from_raw(pid as i32), None).is_err() {
        return false;
    }

    // Field 3 of /proc/<pid>/stat is the state.
    if let Ok(stat) = std::fs::read_to_string(format!("/proc/{}/stat", pid)) {
        let fields: Vec<&str> = stat.split_whitespace().collect();
        if fields.len() > 2 {
            return !matches!(fields[2], "Z" | "X");
        }
    }

    true
}

/// Terminates every service process when dropped.
pub struct ProcessGuard {
    registry: Arc<Mutex<ChildRegistry>>,
    grace_period: Duration,
}

impl ProcessGuard {
    pub fn new() -> Self {
        Self {
            registry: ChildRegistry::global(),
            grace_period: Duration::from_secs(5),
        }
    }

    pub fn child_count(&self) -> usize {
        self.registry
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .count()
    }
}

impl Default for ProcessGuard {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for ProcessGuard {
    fn drop(&mut self) {
        log::debug!("ProcessGuard dropped, stopping the services");
        self.registry
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .terminate_all(self.grace_period);
    }
}

/// Stop the services on SIGINT, SIGTERM and SIGHUP, then exit with
/// 128 + the signal number. Call once at start-up.
pub fn init_signal_handlers() -> Result<(), std::io::Error> {
    use signal_hook::consts::signal::{SIGHUP, SIGINT, SIGTERM};
    use signal_hook::iterator::Signals;

    let mut signals = Signals::new([SIGINT, SIGTERM, SIGHUP])?;

    thread::Builder::new()
        .name("signals".to_string())
        .spawn(move || {
            for sig in signals.forever() {
                let signal_name = match sig {
                    SIGINT => "SIGINT",
                    SIGTERM => "SIGTERM",
                    SIGHUP => "SIGHUP",
                    _ => "UNKNOWN",
                };
                log::info!("Received {}, stopping the services", signal_name);
                ChildRegistry::lock_global().terminate_all(Duration::from_secs(3));
                std::process::exit(128 + sig);
            }
        })?;

    Ok(())
}

pub trait CommandProcessGroup {
    /// Run the command as leader of a new process group that receives
    /// SIGTERM when this process dies.
    fn in_new_process_group(&mut self) -> &mut Self;
}

impl CommandProcessGroup for Command {
    fn in_new_process_group(&mut self) -> &mut Self {
        use std::os::unix::process::CommandExt;
        // SAFETY: only async-signal-safe calls between fork and exec.
        unsafe {
            self.pre_exec(|| {
                nix::unistd::setpgid(Pid::from_raw(0), Pid::from_raw(0))
                    .map_err(std::io::Error::other)?;

                if libc::prctl(libc::PR_SET_PDEATHSIG, libc::SIGTERM) == -1 {
                    return Err(std::io::Error::last_os_error());
                }

                Ok(())
            });
        }
        self
    }
}

/// Starts a configured service program when its name is activated.
///
/// The program finds the bus through `QUARRY_SESSION_ADDRESS` and
/// `DBUS_STARTER_ADDRESS`. It is tracked in the global registry until it
/// exits.
#[derive(Debug, Clone)]
pub struct ServiceActivator {
    entry: ServiceEntry,
}

impl ServiceActivator {
    pub fn new(entry: ServiceEntry) -> Self {
        Self { entry }
    }
}

impl Activator for ServiceActivator {
    fn activate(&self, name: &str, address: &BusAddress) -> Result<(), String> {
        let entry = self.entry.clone();
        let service = name.to_string();
        let address = address.to_string();
        let (started_tx, started_rx) = mpsc::channel();

        // The parent-death signal follows the spawning thread, so the thread
        // that waits for the service is the one that starts it.
        thread::Builder::new()
            .name(format!("service-{}", service))
            .spawn(move || {
                let spawned = Command::new(&entry.exec)
                    .args(&entry.args)
                    .env(SESSION_ADDRESS_ENV, &address)
                    .env(STARTER_ADDRESS_ENV, &address)
                    .in_new_process_group()
                    .spawn();
                let mut child = match spawned {
                    Ok(child) => child,
                    Err(e) => {
                        let _ = started_tx.send(Err(format!(
                            "cannot run {}: {}",
                            entry.exec.display(),
                            e
                        )));
                        return;
                    }
                };

                let pid = child.id();
                ChildRegistry::lock_global().register(pid);
                let _ = started_tx.send(Ok(pid));

                match child.wait() {
                    Ok(status) => log::info!("Service {} exited with {}", service, status),
                    Err(e) => log::warn!("Lost track of service {}: {}", service, e),
                }
                ChildRegistry::lock_global().unregister(pid);
            })
            .map_err(|e| format!("cannot start a thread for {}: {}", name, e))?;

        let pid = started_rx
            .recv()
            .map_err(|_| format!("the thread starting {} died", name))??;
        log::info!("Started {} as process {}", name, pid);
        Ok(())
    }
}

/// Make every configured service activatable on `broker`.
pub fn register_services(broker: &Broker, services: &[ServiceEntry]) {
    for entry in services {
        broker.register_activatable(&entry.name, Arc::new(ServiceActivator::new(entry.clone())));
    }
}
