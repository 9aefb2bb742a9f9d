//! Typed message-bus runtime
//!
//! Every inter-process conversation of the installer goes through this
//! module: typed values and signatures, a broker with name ownership and
//! service activation, connections bound to an event loop, server-side
//! object tables, client proxies, error mapping and name-watch observers.
//!
//! [`MessageBus`] is the entry point. It finds the bus address, opens the
//! connection lazily, hands out proxies, publishes objects, claims names and
//! releases everything it registered, newest first, on [`MessageBus::disconnect`].

pub mod address;
pub mod broker;
pub mod client;
pub mod connection;
pub mod error;
pub mod error_mapper;
pub mod event_loop;
pub mod match_rule;
pub mod message;
pub mod names;
pub mod observer;
pub mod server;
pub mod signal;
pub mod signature;
pub mod spec;
pub mod transport;
pub mod value;

pub use address::{AddressSource, BusAddress};
pub use broker::{Activator, Broker};
pub use client::{ClientMethod, ClientObjectProxy, ClientProperty, ClientSignal, Finish, Member};
pub use connection::{Connection, ObjectHandler, SubscriptionId};
pub use error::{BusError, MethodError, PlainError, RemoteError};
pub use error_mapper::{ErrorMapper, MappedError, UnknownRemoteError};
pub use event_loop::EventLoop;
pub use match_rule::MatchRule;
pub use message::{Message, MessageKind};
pub use observer::{DBusObjectObserver, DBusObserver};
pub use server::{arg, BusSignal, Interface, ObjectTable, Responder, ServerObjectHandler};
pub use signal::{Signal, SlotId};
pub use signature::{parse_signature, Type};
pub use spec::{InterfaceSpec, MethodSpec, ObjectSpec, PropertySpec, SignalSpec};
pub use transport::{start_memory_broker, stop_memory_broker, UnixBrokerServer};
pub use value::{FromValue, IntoValue, ObjectPath, Unpacked, Value, ValueError};

use log::{debug, error, info};
use names::request_reply;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

enum Registration {
    Object(Arc<ServerObjectHandler>),
    Name(String),
}

/// A lazily connected message bus.
pub struct MessageBus {
    source: AddressSource,
    event_loop: EventLoop,
    mapper: Arc<ErrorMapper>,
    connection: Mutex<Option<Arc<Connection>>>,
    registrations: Mutex<Vec<Registration>>,
}

impl std::fmt::Debug for MessageBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageBus")
            .field("source", &self.source)
            .field("connected", &self.is_connected())
            .finish()
    }
}

impl MessageBus {
    pub fn new(source: AddressSource, event_loop: EventLoop, mapper: ErrorMapper) -> Arc<Self> {
        Arc::new(Self {
            source,
            event_loop,
            mapper: Arc::new(mapper),
            connection: Mutex::new(None),
            registrations: Mutex::new(Vec::new()),
        })
    }

    pub fn event_loop(&self) -> &EventLoop {
        &self.event_loop
    }

    pub fn mapper(&self) -> &Arc<ErrorMapper> {
        &self.mapper
    }

    fn connection_slot(&self) -> MutexGuard<'_, Option<Arc<Connection>>> {
        self.connection.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn registrations(&self) -> MutexGuard<'_, Vec<Registration>> {
        self.registrations
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    pub fn is_connected(&self) -> bool {
        self.connection_slot()
            .as_ref()
            .is_some_and(|c| !c.is_closed())
    }

    /// The connection, opened on first use.
    pub fn connection(&self) -> Result<Arc<Connection>, BusError> {
        let mut slot = self.connection_slot();
        if let Some(connection) = slot.as_ref().filter(|c| !c.is_closed()) {
            return Ok(Arc::clone(connection));
        }
        let address = self.source.resolve()?;
        info!("Connecting to the message bus at {}", address);
        let connection = Connection::open(&address, self.event_loop.clone(), Arc::clone(&self.mapper))
            .map_err(|e| match e {
                BusError::ConnectionUnavailable(_) => e,
                other => BusError::ConnectionUnavailable(format!("{}: {}", address, other)),
            })?;
        *slot = Some(Arc::clone(&connection));
        Ok(connection)
    }

    fn check_self_access(&self, connection: &Connection, service_name: &str) -> Result<(), BusError> {
        if connection.owns_name(service_name) && self.event_loop.is_loop_thread() {
            return Err(BusError::SelfAccessOnMainThread(service_name.to_string()));
        }
        Ok(())
    }

    /// A proxy of a remote object, resolving members through introspection.
    ///
    /// Refused for names this process owns when asked from the loop thread.
    pub fn get_proxy(&self, service_name: &str, object_path: &str) -> Result<ClientObjectProxy, BusError> {
        let connection = self.connection()?;
        self.check_self_access(&connection, service_name)?;
        Ok(ClientObjectProxy::new(connection, service_name, object_path))
    }

    /// A proxy resolving every member against one interface.
    pub fn get_proxy_for_interface(
        &self,
        service_name: &str,
        object_path: &str,
        interface_name: &str,
    ) -> Result<ClientObjectProxy, BusError> {
        let connection = self.connection()?;
        self.check_self_access(&connection, service_name)?;
        Ok(ClientObjectProxy::for_interface(
            connection,
            service_name,
            object_path,
            interface_name,
        ))
    }

    /// Publish an object. It is unpublished on [`MessageBus::disconnect`].
    pub fn publish_object(
        &self,
        object_path: &str,
        table: ObjectTable,
    ) -> Result<Arc<ServerObjectHandler>, BusError> {
        let connection = self.connection()?;
        let handler = ServerObjectHandler::publish(&connection, object_path, table)?;
        self.registrations()
            .push(Registration::Object(Arc::clone(&handler)));
        Ok(handler)
    }

    /// Become the primary owner of `service_name`.
    pub fn register_service(&self, service_name: &str, flags: u32) -> Result<(), BusError> {
        let connection = self.connection()?;
        let reply = connection.request_name(service_name, flags)?;
        if reply != request_reply::PRIMARY_OWNER {
            return Err(BusError::NameTaken {
                name: service_name.to_string(),
                reply,
            });
        }
        info!("Registered service {}", service_name);
        self.registrations()
            .push(Registration::Name(service_name.to_string()));
        Ok(())
    }

    /// Release every registration, newest first, and close the connection.
    pub fn disconnect(&self) {
        let registrations: Vec<Registration> = self.registrations().drain(..).rev().collect();
        let connection = self.connection_slot().take();

        for registration in registrations {
            let outcome = catch_unwind(AssertUnwindSafe(|| match &registration {
                Registration::Object(handler) => handler.disconnect(),
                Registration::Name(name) => {
                    if let Some(connection) = connection.as_ref().filter(|c| !c.is_closed()) {
                        if let Err(e) = connection.release_name(name) {
                            error!("Failed to release {}: {}", name, e);
                        }
                    }
                }
            }));
            if outcome.is_err() {
                error!("Releasing a bus registration panicked");
            }
        }

        if let Some(connection) = connection {
            debug!("Disconnecting from {}", connection.address());
            connection.close();
        }
    }
}
