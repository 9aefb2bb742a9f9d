//! Name-watch observers.
//!
//! An observer tracks whether a service is on the bus. Appearance and
//! disappearance events are idempotent: a second appearance while the
//! service is available changes nothing and emits nothing.
//!
//! Observers only hold a weak reference to their [`MessageBus`]; the bus may
//! be disconnected and dropped while observers still exist.

use super::client::ClientObjectProxy;
use super::connection::{Connection, SubscriptionId};
use super::error::BusError;
use super::signal::Signal;
use super::MessageBus;
use log::debug;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};

pub struct DBusObserver {
    bus: Weak<MessageBus>,
    service_name: String,
    available: AtomicBool,
    watch: Mutex<Option<(Arc<Connection>, SubscriptionId)>>,
    /// Emitted with the service name when the service appears.
    pub service_available: Signal<String>,
    /// Emitted with the service name when the service disappears.
    pub service_unavailable: Signal<String>,
}

impl std::fmt::Debug for DBusObserver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DBusObserver")
            .field("service_name", &self.service_name)
            .field("available", &self.is_service_available())
            .finish()
    }
}

impl DBusObserver {
    pub fn new(bus: &Arc<MessageBus>, service_name: &str) -> Arc<Self> {
        Arc::new(Self {
            bus: Arc::downgrade(bus),
            service_name: service_name.to_string(),
            available: AtomicBool::new(false),
            watch: Mutex::new(None),
            service_available: Signal::new(),
            service_unavailable: Signal::new(),
        })
    }

    pub fn service_name(&self) -> &str {
        &self.service_name
    }

    /// The bus, unless it is gone.
    pub fn bus(&self) -> Result<Arc<MessageBus>, BusError> {
        self.bus.upgrade().ok_or_else(|| {
            BusError::ConnectionUnavailable(format!(
                "the bus watched for {} is gone",
                self.service_name
            ))
        })
    }

    pub fn is_service_available(&self) -> bool {
        self.available.load(Ordering::SeqCst)
    }

    /// Start watching the service name. Watching twice is a no-op.
    pub fn connect_once_available(self: &Arc<Self>) -> Result<(), BusError> {
        let mut watch = self.watch.lock().unwrap_or_else(PoisonError::into_inner);
        if watch.is_some() {
            return Ok(());
        }

        let connection = self.bus()?.connection()?;
        let appeared = Arc::downgrade(self);
        let vanished = Arc::downgrade(self);
        let id = connection.watch_name(
            &self.service_name,
            move |owner| {
                if let Some(observer) = appeared.upgrade() {
                    observer.service_name_appeared(owner);
                }
            },
            move || {
                if let Some(observer) = vanished.upgrade() {
                    observer.service_name_vanished();
                }
            },
        )?;
        *watch = Some((connection, id));
        Ok(())
    }

    fn service_name_appeared(&self, owner: &str) {
        if self.available.swap(true, Ordering::SeqCst) {
            return;
        }
        debug!("Service {} is available as {}", self.service_name, owner);
        self.service_available.emit(&self.service_name);
    }

    fn service_name_vanished(&self) {
        if !self.available.swap(false, Ordering::SeqCst) {
            return;
        }
        debug!("Service {} is unavailable", self.service_name);
        self.service_unavailable.emit(&self.service_name);
    }

    /// Stop watching. The service is considered unavailable afterwards.
    pub fn disconnect(&self) {
        let watch = self
            .watch
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some((connection, id)) = watch {
            connection.unsubscribe(id);
        }
        self.available.store(false, Ordering::SeqCst);
    }
}

/// An observer of one object of the service, with a cached proxy.
pub struct DBusObjectObserver {
    observer: Arc<DBusObserver>,
    object_path: String,
    proxy: Arc<Mutex<Option<Arc<ClientObjectProxy>>>>,
}

impl std::fmt::Debug for DBusObjectObserver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DBusObjectObserver")
            .field("service_name", &self.observer.service_name)
            .field("object_path", &self.object_path)
            .finish()
    }
}

impl DBusObjectObserver {
    pub fn new(bus: &Arc<MessageBus>, service_name: &str, object_path: &str) -> Self {
        let observer = DBusObserver::new(bus, service_name);
        let proxy: Arc<Mutex<Option<Arc<ClientObjectProxy>>>> = Arc::new(Mutex::new(None));

        // A proxy of a vanished service is useless even if it comes back.
        let cache = Arc::clone(&proxy);
        observer.service_unavailable.connect(move |_| {
            let dropped = cache.lock().unwrap_or_else(PoisonError::into_inner).take();
            if let Some(dropped) = dropped {
                dropped.disconnect();
            }
        });

        Self {
            observer,
            object_path: object_path.to_string(),
            proxy,
        }
    }

    pub fn observer(&self) -> &Arc<DBusObserver> {
        &self.observer
    }

    pub fn service_name(&self) -> &str {
        self.observer.service_name()
    }

    pub fn object_path(&self) -> &str {
        &self.object_path
    }

    pub fn is_service_available(&self) -> bool {
        self.observer.is_service_available()
    }

    pub fn connect_once_available(&self) -> Result<(), BusError> {
        self.observer.connect_once_available()
    }

    /// The proxy of the observed object.
    pub fn proxy(&self) -> Result<Arc<ClientObjectProxy>, BusError> {
        if !self.observer.is_service_available() {
            return Err(BusError::ServiceUnavailable(
                self.observer.service_name.clone(),
            ));
        }
        let mut cached = self.proxy.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(proxy) = cached.as_ref() {
            return Ok(Arc::clone(proxy));
        }
        let proxy = Arc::new(
            self.observer
                .bus()?
                .get_proxy(&self.observer.service_name, &self.object_path)?,
        );
        *cached = Some(Arc::clone(&proxy));
        Ok(proxy)
    }

    pub fn disconnect(&self) {
        self.observer.disconnect();
        let dropped = self
            .proxy
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(proxy) = dropped {
            proxy.disconnect();
        }
    }
}
