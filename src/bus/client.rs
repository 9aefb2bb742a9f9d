//! Client-side proxies of remote objects.
//!
//! A proxy loads the object specification once through `Introspect` and
//! resolves member names through the interface priority map (later
//! interfaces win). Proxies restricted to one interface ignore the priority
//! map and resolve members against that interface only.
//!
//! Members are cached per `(interface, member)` key, so there is at most one
//! live method stub, property or signal subscription per key.

use super::connection::{CallResult, Connection, SubscriptionId};
use super::error::BusError;
use super::match_rule::MatchRule;
use super::message::Message;
use super::names::{INTROSPECTABLE_INTERFACE, PROPERTIES_INTERFACE};
use super::signal::{Signal, SlotId};
use super::signature::Type;
use super::spec::{MemberSpec, MethodSpec, ObjectSpec, PropertySpec, SignalSpec};
use super::value::{pack_args, Unpacked, Value, ValueError};
use log::debug;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

/// Returns the unpacked result of an asynchronous call, or its error.
pub type Finish = Box<dyn FnOnce() -> Result<Unpacked, BusError> + Send>;

/// Where a proxy points.
#[derive(Debug, Clone)]
struct Target {
    connection: Arc<Connection>,
    service: String,
    path: String,
}

impl Target {
    fn call(
        &self,
        interface: &str,
        member: &str,
        body: Vec<Value>,
        timeout: Option<Duration>,
    ) -> CallResult {
        let message = Message::method_call(&self.service, &self.path, Some(interface), member, body);
        self.connection.call(message, timeout)
    }

    fn describe(&self) -> String {
        format!("{} at {}", self.service, self.path)
    }
}

/// A remote method.
#[derive(Debug)]
pub struct ClientMethod {
    target: Target,
    interface: String,
    spec: MethodSpec,
}

impl ClientMethod {
    pub fn spec(&self) -> &MethodSpec {
        &self.spec
    }

    /// Call the method and wait for the reply.
    pub fn call(&self, args: Vec<Value>) -> Result<Unpacked, BusError> {
        self.call_with_timeout(args, None)
    }

    pub fn call_with_timeout(
        &self,
        args: Vec<Value>,
        timeout: Option<Duration>,
    ) -> Result<Unpacked, BusError> {
        let body = pack_args(&self.spec.in_type, args)?;
        let reply = self
            .target
            .call(&self.interface, &self.spec.name, body, timeout)?;
        Ok(Unpacked::from_body(&self.spec.out_type, reply)?)
    }

    /// Call the method without waiting. `callback` runs on the event loop
    /// and receives a function that yields the result.
    pub fn call_async(&self, args: Vec<Value>, callback: impl FnOnce(Finish) + Send + 'static) {
        let body = match pack_args(&self.spec.in_type, args) {
            Ok(body) => body,
            Err(e) => {
                let finish: Finish =
                    Box::new(move || -> Result<Unpacked, BusError> { Err(e.into()) });
                self.target
                    .connection
                    .event_loop()
                    .schedule(move || callback(finish));
                return;
            }
        };
        let out_type = self.spec.out_type.clone();
        let message = Message::method_call(
            &self.target.service,
            &self.target.path,
            Some(self.interface.as_str()),
            &self.spec.name,
            body,
        );
        self.target.connection.call_async(message, move |result| {
            let finish: Finish = Box::new(move || -> Result<Unpacked, BusError> {
                Ok(Unpacked::from_body(&out_type, result?)?)
            });
            callback(finish);
        });
    }
}

/// A remote property.
#[derive(Debug)]
pub struct ClientProperty {
    target: Target,
    interface: String,
    spec: PropertySpec,
}

impl ClientProperty {
    pub fn spec(&self) -> &PropertySpec {
        &self.spec
    }

    /// Read the property through `Properties.Get`.
    pub fn get(&self) -> Result<Value, BusError> {
        if !self.spec.readable {
            return Err(BusError::PropertyAccess {
                name: self.spec.name.clone(),
                access: "readable",
            });
        }
        let body = vec![
            Value::from(self.interface.as_str()),
            Value::from(self.spec.name.as_str()),
        ];
        let reply = self.target.call(PROPERTIES_INTERFACE, "Get", body, None)?;
        let value = Unpacked::from_body("v", reply)?
            .into_value()
            .map(Value::unwrap_variant)
            .unwrap_or(Value::Struct(Vec::new()));
        let ty = Type::parse(&self.spec.type_signature).map_err(ValueError::from)?;
        Ok(value.pack(&ty)?)
    }

    /// Write the property through `Properties.Set`.
    pub fn set(&self, value: Value) -> Result<(), BusError> {
        if !self.spec.writable {
            return Err(BusError::PropertyAccess {
                name: self.spec.name.clone(),
                access: "writable",
            });
        }
        let ty = Type::parse(&self.spec.type_signature).map_err(ValueError::from)?;
        let body = vec![
            Value::from(self.interface.as_str()),
            Value::from(self.spec.name.as_str()),
            value.unwrap_variant().pack(&ty)?.variant(),
        ];
        self.target.call(PROPERTIES_INTERFACE, "Set", body, None)?;
        Ok(())
    }
}

/// A remote signal: a local [`Signal`] fed by one bus subscription.
#[derive(Debug)]
pub struct ClientSignal {
    interface: String,
    spec: SignalSpec,
    local: Arc<Signal<Vec<Value>>>,
    subscription: Mutex<Option<(Arc<Connection>, SubscriptionId)>>,
}

impl ClientSignal {
    pub fn spec(&self) -> &SignalSpec {
        &self.spec
    }

    pub fn interface(&self) -> &str {
        &self.interface
    }

    pub fn connect(&self, callback: impl Fn(&Vec<Value>) + Send + Sync + 'static) -> SlotId {
        self.local.connect(callback)
    }

    pub fn disconnect(&self, slot: SlotId) -> bool {
        self.local.disconnect(slot)
    }

    pub fn disconnect_all(&self) {
        self.local.disconnect_all();
    }

    /// Emit locally, as if the signal had arrived from the bus.
    pub fn emit(&self, args: &Vec<Value>) {
        self.local.emit(args);
    }

    fn subscribe(&self, target: &Target) -> Result<(), BusError> {
        let rule = MatchRule::signal(
            Some(target.service.as_str()),
            Some(target.path.as_str()),
            &self.interface,
            &self.spec.name,
        );
        let local = Arc::clone(&self.local);
        let id = target
            .connection
            .subscribe(rule, move |message| local.emit(&message.body))?;
        *self
            .subscription
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some((Arc::clone(&target.connection), id));
        Ok(())
    }

    /// Drop the bus subscription and every local callback.
    fn teardown(&self) {
        let subscription = self
            .subscription
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some((connection, id)) = subscription {
            connection.unsubscribe(id);
        }
        self.local.disconnect_all();
    }
}

/// A resolved member.
#[derive(Debug, Clone)]
pub enum Member {
    Method(Arc<ClientMethod>),
    Property(Arc<ClientProperty>),
    Signal(Arc<ClientSignal>),
}

/// A proxy of one remote object.
pub struct ClientObjectProxy {
    target: Target,
    interface: Option<String>,
    spec: Mutex<Option<Arc<ObjectSpec>>>,
    members: Mutex<HashMap<(String, String), Member>>,
}

impl std::fmt::Debug for ClientObjectProxy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientObjectProxy")
            .field("service", &self.target.service)
            .field("path", &self.target.path)
            .field("interface", &self.interface)
            .finish()
    }
}

impl ClientObjectProxy {
    /// A proxy resolving members through the whole object specification.
    pub fn new(connection: Arc<Connection>, service: &str, path: &str) -> Self {
        Self::build(connection, service, path, None)
    }

    /// A proxy resolving every member against `interface` only.
    pub fn for_interface(
        connection: Arc<Connection>,
        service: &str,
        path: &str,
        interface: &str,
    ) -> Self {
        Self::build(connection, service, path, Some(interface.to_string()))
    }

    fn build(
        connection: Arc<Connection>,
        service: &str,
        path: &str,
        interface: Option<String>,
    ) -> Self {
        Self {
            target: Target {
                connection,
                service: service.to_string(),
                path: path.to_string(),
            },
            interface,
            spec: Mutex::new(None),
            members: Mutex::new(HashMap::new()),
        }
    }

    pub fn service(&self) -> &str {
        &self.target.service
    }

    pub fn path(&self) -> &str {
        &self.target.path
    }

    pub fn connection(&self) -> &Arc<Connection> {
        &self.target.connection
    }

    fn members(&self) -> MutexGuard<'_, HashMap<(String, String), Member>> {
        self.members.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// The object specification, introspected on first use.
    pub fn spec(&self) -> Result<Arc<ObjectSpec>, BusError> {
        let mut cached = self.spec.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(spec) = cached.as_ref() {
            return Ok(Arc::clone(spec));
        }
        debug!("Introspecting {}", self.target.describe());
        let reply = self
            .target
            .call(INTROSPECTABLE_INTERFACE, "Introspect", Vec::new(), None)?;
        let text = Unpacked::from_body("s", reply)?.get::<String>()?;
        let spec = Arc::new(ObjectSpec::from_json(&text)?);
        *cached = Some(Arc::clone(&spec));
        Ok(spec)
    }

    fn lookup_error(&self, member: &str) -> BusError {
        BusError::MemberLookup {
            object: self.target.describe(),
            member: member.to_string(),
        }
    }

    /// Resolve `name` to a cached member, creating it on first access.
    pub fn member(&self, name: &str) -> Result<Member, BusError> {
        let spec = self.spec()?;
        let interface = match &self.interface {
            Some(interface) => interface.clone(),
            None => spec
                .priority_map()
                .remove(name)
                .ok_or_else(|| self.lookup_error(name))?,
        };

        let key = (interface.clone(), name.to_string());
        let mut members = self.members();
        if let Some(member) = members.get(&key) {
            return Ok(member.clone());
        }

        let iface = spec
            .interface(&interface)
            .ok_or_else(|| self.lookup_error(name))?;
        let member = match iface.member(name).ok_or_else(|| self.lookup_error(name))? {
            MemberSpec::Method(spec) => Member::Method(Arc::new(ClientMethod {
                target: self.target.clone(),
                interface,
                spec: spec.clone(),
            })),
            MemberSpec::Property(spec) => Member::Property(Arc::new(ClientProperty {
                target: self.target.clone(),
                interface,
                spec: spec.clone(),
            })),
            MemberSpec::Signal(spec) => {
                let signal = Arc::new(ClientSignal {
                    interface,
                    spec: spec.clone(),
                    local: Arc::new(Signal::new()),
                    subscription: Mutex::new(None),
                });
                signal.subscribe(&self.target)?;
                Member::Signal(signal)
            }
        };
        members.insert(key, member.clone());
        Ok(member)
    }

    pub fn method(&self, name: &str) -> Result<Arc<ClientMethod>, BusError> {
        match self.member(name)? {
            Member::Method(method) => Ok(method),
            _ => Err(self.lookup_error(name)),
        }
    }

    pub fn property(&self, name: &str) -> Result<Arc<ClientProperty>, BusError> {
        match self.member(name)? {
            Member::Property(property) => Ok(property),
            _ => Err(self.lookup_error(name)),
        }
    }

    pub fn signal(&self, name: &str) -> Result<Arc<ClientSignal>, BusError> {
        match self.member(name)? {
            Member::Signal(signal) => Ok(signal),
            _ => Err(self.lookup_error(name)),
        }
    }

    /// Call a method and wait for the reply.
    pub fn call(&self, name: &str, args: Vec<Value>) -> Result<Unpacked, BusError> {
        self.method(name)?.call(args)
    }

    /// Call a method asynchronously.
    pub fn call_async(
        &self,
        name: &str,
        args: Vec<Value>,
        callback: impl FnOnce(Finish) + Send + 'static,
    ) -> Result<(), BusError> {
        self.method(name)?.call_async(args, callback);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Result<Value, BusError> {
        self.property(name)?.get()
    }

    pub fn set(&self, name: &str, value: impl Into<Value>) -> Result<(), BusError> {
        self.property(name)?.set(value.into())
    }

    /// Connect a callback to a remote signal.
    pub fn connect_signal(
        &self,
        name: &str,
        callback: impl Fn(&Vec<Value>) + Send + Sync + 'static,
    ) -> Result<SlotId, BusError> {
        Ok(self.signal(name)?.connect(callback))
    }

    /// Forget a cached member; a signal loses its subscription and callbacks.
    pub fn delete_member(&self, name: &str) {
        let removed: Vec<Member> = {
            let mut members = self.members();
            let keys: Vec<(String, String)> =
                members.keys().filter(|(_, m)| m == name).cloned().collect();
            keys.iter().filter_map(|key| members.remove(key)).collect()
        };
        for member in removed {
            if let Member::Signal(signal) = member {
                signal.teardown();
            }
        }
    }

    /// Tear down every subscription of this proxy.
    pub fn disconnect(&self) {
        let members: Vec<Member> = self.members().drain().map(|(_, m)| m).collect();
        let count = members.len();
        for member in members {
            if let Member::Signal(signal) = member {
                signal.teardown();
            }
        }
        if count > 0 {
            debug!("Disconnected proxy of {}", self.target.describe());
        }
    }
}

impl Drop for ClientObjectProxy {
    fn drop(&mut self) {
        self.disconnect();
    }
}
