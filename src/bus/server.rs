//! Server-side objects
//!
//! An object is published from an explicit table of interfaces. Each
//! interface lists its methods with their signatures and dispatch functions,
//! its properties with getters and setters, and its signals with the local
//! [`Signal`] whose emissions are forwarded to the bus.

use super::connection::{Connection, ObjectHandler};
use super::error_mapper::ErrorMapper;
use super::error::{BusError, MethodError};
use super::message::Message;
use super::names::{errors, INTROSPECTABLE_INTERFACE, PEER_INTERFACE, PROPERTIES_INTERFACE};
use super::signal::{Signal, SlotId};
use super::signature::Type;
use super::spec::{InterfaceSpec, MethodSpec, ObjectSpec, PropertySpec, SignalSpec};
use super::value::{pack_args, FromValue, Value, ValueError};
use log::{debug, error, warn};
use std::any::Any;
use std::collections::{BTreeMap, HashMap};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex, PoisonError, Weak};

pub type MethodFn = Arc<dyn Fn(Vec<Value>) -> Result<Vec<Value>, MethodError> + Send + Sync>;
pub type GetterFn = Arc<dyn Fn() -> Result<Value, MethodError> + Send + Sync>;
pub type SetterFn = Arc<dyn Fn(Value) -> Result<(), MethodError> + Send + Sync>;
pub type DeferredFn = Arc<dyn Fn(Vec<Value>, Responder) + Send + Sync>;

enum MethodImpl {
    Immediate(MethodFn),
    Deferred(DeferredFn),
}

/// Answers a call after its handler has returned.
///
/// Dropping a responder without sending leaves the caller waiting, so every
/// path of a deferred method must end in [`Responder::send`].
pub struct Responder {
    connection: Weak<Connection>,
    call: Message,
    out_type: String,
}

impl Responder {
    pub fn send(self, result: Result<Vec<Value>, MethodError>) {
        let Some(connection) = self.connection.upgrade() else {
            debug!("Dropping the reply to {}, the connection is gone", self.call.describe());
            return;
        };
        let outcome = match result.map(|outputs| pack_args(&self.out_type, outputs)) {
            Ok(Ok(body)) => connection.reply(&self.call, body),
            Ok(Err(e)) => {
                error!("{} produced bad values: {}", self.call.describe(), e);
                connection.reply_error(&self.call, errors::FAILED, &e.to_string())
            }
            Err(e) => {
                let (name, text) = map_error(connection.mapper(), &e);
                connection.reply_error(&self.call, &name, &text)
            }
        };
        if let Err(e) = outcome {
            warn!("Failed to answer {}: {}", self.call.describe(), e);
        }
    }
}

/// Emissions of a local signal published on the bus.
pub type BusSignal = Signal<Vec<Value>>;

/// Take the argument at `index` as a Rust value.
pub fn arg<T: FromValue>(args: &[Value], index: usize) -> Result<T, ValueError> {
    let value = args.get(index).cloned().ok_or(ValueError::ArgumentCount {
        signature: String::new(),
        expected: index + 1,
        found: args.len(),
    })?;
    T::from_value(value)
}

struct PropertyEntry {
    spec: PropertySpec,
    getter: Option<GetterFn>,
    setter: Option<SetterFn>,
}

/// One interface of a published object.
pub struct Interface {
    name: String,
    methods: Vec<(MethodSpec, MethodImpl)>,
    properties: Vec<PropertyEntry>,
    signals: Vec<(SignalSpec, Arc<BusSignal>)>,
}

impl Interface {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            methods: Vec::new(),
            properties: Vec::new(),
            signals: Vec::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Add a method. `f` receives the unpacked arguments and returns the
    /// output values in order.
    pub fn method(
        mut self,
        name: &str,
        in_type: &str,
        out_type: &str,
        f: impl Fn(Vec<Value>) -> Result<Vec<Value>, MethodError> + Send + Sync + 'static,
    ) -> Self {
        self.methods.push((
            MethodSpec {
                name: name.to_string(),
                in_type: in_type.to_string(),
                out_type: out_type.to_string(),
            },
            MethodImpl::Immediate(Arc::new(f)),
        ));
        self
    }

    /// Add a method answered through a [`Responder`], possibly from another
    /// thread. The loop is free to serve other calls in the meantime.
    pub fn deferred_method(
        mut self,
        name: &str,
        in_type: &str,
        out_type: &str,
        f: impl Fn(Vec<Value>, Responder) + Send + Sync + 'static,
    ) -> Self {
        self.methods.push((
            MethodSpec {
                name: name.to_string(),
                in_type: in_type.to_string(),
                out_type: out_type.to_string(),
            },
            MethodImpl::Deferred(Arc::new(f)),
        ));
        self
    }

    pub fn read_property(
        self,
        name: &str,
        type_signature: &str,
        getter: impl Fn() -> Result<Value, MethodError> + Send + Sync + 'static,
    ) -> Self {
        self.property(name, type_signature, Some(Arc::new(getter)), None)
    }

    pub fn write_property(
        self,
        name: &str,
        type_signature: &str,
        setter: impl Fn(Value) -> Result<(), MethodError> + Send + Sync + 'static,
    ) -> Self {
        self.property(name, type_signature, None, Some(Arc::new(setter)))
    }

    pub fn read_write_property(
        self,
        name: &str,
        type_signature: &str,
        getter: impl Fn() -> Result<Value, MethodError> + Send + Sync + 'static,
        setter: impl Fn(Value) -> Result<(), MethodError> + Send + Sync + 'static,
    ) -> Self {
        self.property(
            name,
            type_signature,
            Some(Arc::new(getter)),
            Some(Arc::new(setter)),
        )
    }

    fn property(
        mut self,
        name: &str,
        type_signature: &str,
        getter: Option<GetterFn>,
        setter: Option<SetterFn>,
    ) -> Self {
        self.properties.push(PropertyEntry {
            spec: PropertySpec {
                name: name.to_string(),
                type_signature: type_signature.to_string(),
                readable: getter.is_some(),
                writable: setter.is_some(),
            },
            getter,
            setter,
        });
        self
    }

    /// Declare a signal. Emissions of `emitter` are sent on the bus once the
    /// object is published.
    pub fn signal(mut self, name: &str, signature: &str, emitter: Arc<BusSignal>) -> Self {
        self.signals.push((
            SignalSpec {
                name: name.to_string(),
                signature: signature.to_string(),
            },
            emitter,
        ));
        self
    }

    pub fn spec(&self) -> InterfaceSpec {
        InterfaceSpec {
            name: self.name.clone(),
            methods: self.methods.iter().map(|(spec, _)| spec.clone()).collect(),
            properties: self.properties.iter().map(|p| p.spec.clone()).collect(),
            signals: self.signals.iter().map(|(spec, _)| spec.clone()).collect(),
        }
    }

    fn find_method(&self, name: &str) -> Option<&(MethodSpec, MethodImpl)> {
        self.methods.iter().find(|(spec, _)| spec.name == name)
    }

    fn find_property(&self, name: &str) -> Option<&PropertyEntry> {
        self.properties.iter().find(|p| p.spec.name == name)
    }
}

/// The interfaces of one object, in priority order (later wins).
#[derive(Default)]
pub struct ObjectTable {
    interfaces: Vec<Interface>,
}

impl ObjectTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn interface(mut self, interface: Interface) -> Self {
        self.interfaces.push(interface);
        self
    }

    pub fn spec(&self) -> Result<ObjectSpec, BusError> {
        ObjectSpec::new(self.interfaces.iter().map(Interface::spec).collect())
    }
}

type Reply = Result<Vec<Value>, (String, String)>;

/// `None` when a deferred method will answer later.
type Outcome = Result<Option<Vec<Value>>, (String, String)>;

/// Serves calls for one published object.
pub struct ServerObjectHandler {
    path: String,
    spec: ObjectSpec,
    priority: HashMap<String, String>,
    interfaces: HashMap<String, Interface>,
    connection: Weak<Connection>,
    slots: Mutex<Vec<(Arc<BusSignal>, SlotId)>>,
}

impl std::fmt::Debug for ServerObjectHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerObjectHandler")
            .field("path", &self.path)
            .finish()
    }
}

impl ServerObjectHandler {
    /// Publish `table` at `path` on `connection`.
    pub fn publish(
        connection: &Arc<Connection>,
        path: &str,
        table: ObjectTable,
    ) -> Result<Arc<Self>, BusError> {
        let spec = table.spec()?;
        let priority = spec.priority_map();
        let interfaces = table
            .interfaces
            .into_iter()
            .map(|interface| (interface.name.clone(), interface))
            .collect();

        let handler = Arc::new(Self {
            path: path.to_string(),
            spec,
            priority,
            interfaces,
            connection: Arc::downgrade(connection),
            slots: Mutex::new(Vec::new()),
        });
        connection.register_object(path, Arc::clone(&handler) as Arc<dyn ObjectHandler>)?;
        handler.connect_signals();
        debug!("Published object {}", path);
        Ok(handler)
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn spec(&self) -> &ObjectSpec {
        &self.spec
    }

    /// Forward local signal emissions to the bus.
    fn connect_signals(self: &Arc<Self>) {
        let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
        for interface in self.interfaces.values() {
            for (spec, emitter) in &interface.signals {
                let weak = Arc::downgrade(self);
                let interface_name = interface.name.clone();
                let member = spec.name.clone();
                let slot = emitter.connect(move |args| {
                    if let Some(handler) = weak.upgrade() {
                        if let Err(e) = handler.emit_signal(&interface_name, &member, args.clone()) {
                            error!("Failed to emit {}.{}: {}", interface_name, member, e);
                        }
                    }
                });
                slots.push((Arc::clone(emitter), slot));
            }
        }
    }

    /// Emit a declared signal, packing the arguments to its signature.
    pub fn emit_signal(
        &self,
        interface: &str,
        member: &str,
        args: Vec<Value>,
    ) -> Result<(), BusError> {
        let signature = self
            .spec
            .interface(interface)
            .and_then(|i| i.signals.iter().find(|s| s.name == member))
            .map(|s| s.signature.clone())
            .ok_or_else(|| BusError::MemberLookup {
                object: self.path.clone(),
                member: format!("{}.{}", interface, member),
            })?;
        let body = pack_args(&signature, args)?;
        let connection = self.connection.upgrade().ok_or(BusError::Disconnected)?;
        connection.emit_signal(&self.path, interface, member, body)
    }

    fn send_properties_changed(
        &self,
        interface: &str,
        changed: Vec<(String, Value)>,
        invalidated: Vec<String>,
    ) -> Result<(), BusError> {
        let connection = self.connection.upgrade().ok_or(BusError::Disconnected)?;
        let body = vec![
            Value::from(interface),
            Value::Dict {
                key: Type::Str,
                value: Type::Variant,
                entries: changed
                    .into_iter()
                    .map(|(name, value)| (Value::Str(name), value))
                    .collect(),
            },
            Value::from(invalidated),
        ];
        connection.emit_signal(&self.path, PROPERTIES_INTERFACE, "PropertiesChanged", body)
    }

    /// Stop serving: unregister the path and disconnect signal forwarding.
    pub fn disconnect(&self) {
        let slots: Vec<(Arc<BusSignal>, SlotId)> = self
            .slots
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
            .collect();
        for (signal, slot) in slots {
            signal.disconnect(slot);
        }
        if let Some(connection) = self.connection.upgrade() {
            connection.unregister_object(&self.path);
        }
        debug!("Unpublished object {}", self.path);
    }

    fn handle(&self, call: &Message) -> Outcome {
        let member = call.member();
        let interface = match call.interface.as_deref() {
            Some(interface) => interface.to_string(),
            None => self.priority.get(member).cloned().ok_or_else(|| {
                unknown_method(&self.path, member)
            })?,
        };

        match interface.as_str() {
            PEER_INTERFACE => match member {
                "Ping" => Ok(Some(Vec::new())),
                "GetMachineId" => Ok(Some(vec![Value::from("quarry")])),
                _ => Err(unknown_method(&self.path, member)),
            },
            INTROSPECTABLE_INTERFACE if member == "Introspect" => {
                let json = self
                    .spec
                    .to_json()
                    .map_err(|e| (errors::FAILED.to_string(), e.to_string()))?;
                Ok(Some(vec![Value::Str(json)]))
            }
            PROPERTIES_INTERFACE if !self.interfaces.contains_key(PROPERTIES_INTERFACE) => {
                self.handle_properties(call).map(Some)
            }
            _ => self.handle_method(&interface, call),
        }
    }

    fn handle_method(&self, interface: &str, call: &Message) -> Outcome {
        let member = call.member();
        let iface = self.interfaces.get(interface).ok_or_else(|| {
            (
                errors::UNKNOWN_INTERFACE.to_string(),
                format!("No such interface '{}' at {}", interface, self.path),
            )
        })?;
        let (spec, f) = iface
            .find_method(member)
            .ok_or_else(|| unknown_method(&self.path, member))?;

        let args = pack_args(&spec.in_type, call.body.clone()).map_err(invalid_args)?;
        match f {
            MethodImpl::Immediate(f) => {
                let outputs = f(args).map_err(|e| self.map_error(&e))?;
                pack_args(&spec.out_type, outputs).map(Some).map_err(|e| {
                    error!("{}.{} returned bad values: {}", interface, member, e);
                    (errors::FAILED.to_string(), e.to_string())
                })
            }
            MethodImpl::Deferred(f) => {
                f(
                    args,
                    Responder {
                        connection: self.connection.clone(),
                        call: call.clone(),
                        out_type: spec.out_type.clone(),
                    },
                );
                Ok(None)
            }
        }
    }

    fn map_error(&self, error: &MethodError) -> (String, String) {
        match self.connection.upgrade() {
            Some(connection) => map_error(connection.mapper(), error),
            None => (errors::FAILED.to_string(), error.message()),
        }
    }

    fn lookup_property(&self, interface: &str, name: &str) -> Result<&PropertyEntry, (String, String)> {
        self.interfaces
            .get(interface)
            .and_then(|iface| iface.find_property(name))
            .ok_or_else(|| {
                (
                    errors::UNKNOWN_PROPERTY.to_string(),
                    format!("No such property '{}.{}'", interface, name),
                )
            })
    }

    fn handle_properties(&self, call: &Message) -> Reply {
        let args = &call.body;
        let string = |index: usize| -> Result<String, (String, String)> {
            arg::<String>(args, index).map_err(invalid_args)
        };

        match call.member() {
            "Get" => {
                let (interface, name) = (string(0)?, string(1)?);
                let entry = self.lookup_property(&interface, &name)?;
                let getter = entry.getter.as_ref().ok_or_else(|| {
                    (
                        errors::FAILED.to_string(),
                        format!("Property '{}' is not readable", name),
                    )
                })?;
                let ty = Type::parse(&entry.spec.type_signature).map_err(|e| invalid_args(e.into()))?;
                let value = getter().map_err(|e| self.map_error(&e))?;
                let value = value.pack(&ty).map_err(invalid_args)?;
                Ok(vec![value.variant()])
            }
            "Set" => {
                let (interface, name) = (string(0)?, string(1)?);
                let value = args.get(2).cloned().ok_or_else(|| {
                    invalid_args(ValueError::ArgumentCount {
                        signature: "ssv".to_string(),
                        expected: 3,
                        found: args.len(),
                    })
                })?;
                let entry = self.lookup_property(&interface, &name)?;
                let setter = entry.setter.as_ref().ok_or_else(|| {
                    (
                        errors::PROPERTY_READ_ONLY.to_string(),
                        format!("Property '{}' is read-only", name),
                    )
                })?;
                let ty = Type::parse(&entry.spec.type_signature).map_err(|e| invalid_args(e.into()))?;
                let value = value.unwrap_variant().pack(&ty).map_err(invalid_args)?;
                setter(value.clone()).map_err(|e| self.map_error(&e))?;

                let changed = match &entry.getter {
                    Some(_) => vec![(name.clone(), value.variant())],
                    None => Vec::new(),
                };
                let invalidated = if changed.is_empty() { vec![name] } else { Vec::new() };
                if let Err(e) = self.send_properties_changed(&interface, changed, invalidated) {
                    warn!("Failed to announce a property change: {}", e);
                }
                Ok(Vec::new())
            }
            "GetAll" => {
                let interface = string(0)?;
                let mut entries = BTreeMap::new();
                if let Some(iface) = self.interfaces.get(&interface) {
                    for entry in &iface.properties {
                        if let Some(getter) = &entry.getter {
                            let value = getter().map_err(|e| self.map_error(&e))?;
                            entries.insert(entry.spec.name.clone(), value.variant());
                        }
                    }
                }
                Ok(vec![Value::Dict {
                    key: Type::Str,
                    value: Type::Variant,
                    entries: entries
                        .into_iter()
                        .map(|(name, value)| (Value::Str(name), value))
                        .collect(),
                }])
            }
            other => Err(unknown_method(&self.path, other)),
        }
    }
}

impl ObjectHandler for ServerObjectHandler {
    fn handle_call(&self, connection: &Arc<Connection>, call: Message) {
        let outcome = catch_unwind(AssertUnwindSafe(|| self.handle(&call))).unwrap_or_else(|panic| {
            let text = panic_message(panic.as_ref());
            error!("{} panicked: {}", call.describe(), text);
            Err((errors::FAILED.to_string(), text))
        });
        let result = match outcome {
            Ok(Some(body)) => connection.reply(&call, body),
            Ok(None) => Ok(()),
            Err((name, text)) => connection.reply_error(&call, &name, &text),
        };
        if let Err(e) = result {
            warn!("Failed to answer {}: {}", call.describe(), e);
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    panic
        .downcast_ref::<&str>()
        .map(|text| text.to_string())
        .or_else(|| panic.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "the method implementation panicked".to_string())
}

fn map_error(mapper: &ErrorMapper, error: &MethodError) -> (String, String) {
    let name = mapper.error_name(error);
    debug!("Method failed with {}: {}", name, error);
    (name, error.message())
}

fn unknown_method(path: &str, member: &str) -> (String, String) {
    (
        errors::UNKNOWN_METHOD.to_string(),
        format!("No such method '{}' at {}", member, path),
    )
}

fn invalid_args(error: ValueError) -> (String, String) {
    (errors::INVALID_ARGS.to_string(), error.to_string())
}
