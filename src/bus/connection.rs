//! Bus connections
//!
//! A connection owns a transport link and a pump thread that reads incoming
//! messages. Replies to synchronous calls are handed straight to the waiting
//! thread; everything else (asynchronous replies, signals, incoming method
//! calls) is scheduled on the connection's event loop.

use super::address::BusAddress;
use super::error::BusError;
use super::error_mapper::ErrorMapper;
use super::event_loop::EventLoop;
use super::match_rule::MatchRule;
use super::message::{Message, MessageKind};
use super::names::{
    errors, is_unique_name, release_reply, request_reply, DBUS_INTERFACE, DBUS_NAME, DBUS_PATH,
};
use super::transport::{self, Transport};
use super::value::Value;
use log::{debug, error, trace, warn};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::mpsc::{channel, Receiver, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::thread;
use std::time::Duration;

/// Receives method calls for one object path.
///
/// Called on the event loop thread. The handler must answer the call with
/// [`Connection::reply`] or [`Connection::reply_error`].
pub trait ObjectHandler: Send + Sync {
    fn handle_call(&self, connection: &Arc<Connection>, call: Message);
}

/// The outcome of a method call: the reply body or the error.
pub type CallResult = Result<Vec<Value>, BusError>;

type AsyncCallback = Box<dyn FnOnce(CallResult) + Send>;
type SignalCallback = Arc<dyn Fn(&Message) + Send + Sync>;

enum Pending {
    Sync(Sender<CallResult>),
    Async(AsyncCallback),
}

/// Handle of a signal subscription or a name watch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

struct Subscription {
    rule: MatchRule,
    callback: SignalCallback,
}

#[derive(Default)]
struct State {
    pending: HashMap<u32, Pending>,
    objects: HashMap<String, Arc<dyn ObjectHandler>>,
    subscriptions: HashMap<SubscriptionId, Subscription>,
    owned_names: HashSet<String>,
    /// Last known owners of well-known names we listen to.
    name_owners: HashMap<String, String>,
}

pub struct Connection {
    address: BusAddress,
    unique_name: String,
    transport: Box<dyn Transport>,
    event_loop: EventLoop,
    mapper: Arc<ErrorMapper>,
    serial: AtomicU32,
    next_subscription: AtomicU64,
    closed: AtomicBool,
    state: Mutex<State>,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("address", &self.address)
            .field("unique_name", &self.unique_name)
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl Connection {
    /// Connect to the broker at `address`.
    ///
    /// Callbacks and incoming calls are dispatched on `event_loop`; error
    /// replies are translated with `mapper`.
    pub fn open(
        address: &BusAddress,
        event_loop: EventLoop,
        mapper: Arc<ErrorMapper>,
    ) -> Result<Arc<Self>, BusError> {
        let link = transport::connect(address)?;
        debug!("Connected to {} as {}", address, link.unique_name);

        let connection = Arc::new(Self {
            address: address.clone(),
            unique_name: link.unique_name,
            transport: link.transport,
            event_loop,
            mapper,
            serial: AtomicU32::new(1),
            next_subscription: AtomicU64::new(1),
            closed: AtomicBool::new(false),
            state: Mutex::new(State::default()),
        });

        let weak = Arc::downgrade(&connection);
        let inbox = link.inbox;
        thread::Builder::new()
            .name(format!("bus-pump-{}", connection.unique_name))
            .spawn(move || pump(weak, inbox))?;
        Ok(connection)
    }

    pub fn address(&self) -> &BusAddress {
        &self.address
    }

    pub fn unique_name(&self) -> &str {
        &self.unique_name
    }

    pub fn event_loop(&self) -> &EventLoop {
        &self.event_loop
    }

    pub fn mapper(&self) -> &Arc<ErrorMapper> {
        &self.mapper
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Returns true if this connection is the primary owner of `name`.
    pub fn owns_name(&self, name: &str) -> bool {
        name == self.unique_name || self.lock().owned_names.contains(name)
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn next_serial(&self) -> u32 {
        self.serial.fetch_add(1, Ordering::Relaxed)
    }

    /// Send a message without waiting for anything. Returns its serial.
    pub fn send(&self, mut message: Message) -> Result<u32, BusError> {
        if self.is_closed() {
            return Err(BusError::Disconnected);
        }
        message.serial = self.next_serial();
        let serial = message.serial;
        trace!("Sending {}", message.describe());
        self.transport.send(message)?;
        Ok(serial)
    }

    /// Call a method and wait for the reply.
    ///
    /// Calling a name this connection owns from its own event loop thread
    /// fails immediately: the call could never be served.
    pub fn call(&self, mut message: Message, timeout: Option<Duration>) -> CallResult {
        if self.is_closed() {
            return Err(BusError::Disconnected);
        }
        if let Some(destination) = &message.destination {
            if self.owns_name(destination) && self.event_loop.is_loop_thread() {
                return Err(BusError::SelfAccessOnMainThread(destination.clone()));
            }
        }

        let (sender, receiver) = channel();
        message.serial = self.next_serial();
        let serial = message.serial;
        let description = message.describe();
        self.lock().pending.insert(serial, Pending::Sync(sender));

        trace!("Calling {}", description);
        if let Err(e) = self.transport.send(message) {
            self.lock().pending.remove(&serial);
            return Err(e);
        }

        let received = match timeout {
            Some(timeout) => receiver.recv_timeout(timeout),
            None => receiver.recv().map_err(|_| RecvTimeoutError::Disconnected),
        };
        match received {
            Ok(result) => result,
            Err(RecvTimeoutError::Timeout) => {
                self.lock().pending.remove(&serial);
                Err(BusError::Timeout(description))
            }
            Err(RecvTimeoutError::Disconnected) => Err(BusError::Disconnected),
        }
    }

    /// Call a method; `callback` receives the result on the event loop.
    pub fn call_async(
        &self,
        mut message: Message,
        callback: impl FnOnce(CallResult) + Send + 'static,
    ) {
        if self.is_closed() {
            self.event_loop
                .schedule(move || callback(Err(BusError::Disconnected)));
            return;
        }

        message.serial = self.next_serial();
        let serial = message.serial;
        self.lock()
            .pending
            .insert(serial, Pending::Async(Box::new(callback)));

        trace!("Calling {} asynchronously", message.describe());
        if let Err(e) = self.transport.send(message) {
            if let Some(Pending::Async(callback)) = self.lock().pending.remove(&serial) {
                self.event_loop.schedule(move || callback(Err(e)));
            }
        }
    }

    /// Call a method of the bus daemon.
    pub fn call_daemon(&self, member: &str, body: Vec<Value>) -> CallResult {
        let message =
            Message::method_call(DBUS_NAME, DBUS_PATH, Some(DBUS_INTERFACE), member, body);
        self.call(message, None)
    }

    /// Answer a method call.
    pub fn reply(&self, call: &Message, body: Vec<Value>) -> Result<(), BusError> {
        self.send(Message::method_return(call, body)).map(|_| ())
    }

    /// Answer a method call with an error.
    pub fn reply_error(&self, call: &Message, name: &str, text: &str) -> Result<(), BusError> {
        self.send(Message::error(call, name, text)).map(|_| ())
    }

    /// Broadcast a signal.
    pub fn emit_signal(
        &self,
        path: &str,
        interface: &str,
        member: &str,
        body: Vec<Value>,
    ) -> Result<(), BusError> {
        self.send(Message::signal(path, interface, member, body))
            .map(|_| ())
    }

    /// Ask for a well-known name. Returns the `RequestName` reply code.
    pub fn request_name(&self, name: &str, flags: u32) -> Result<u32, BusError> {
        let body = self.call_daemon("RequestName", vec![Value::from(name), Value::from(flags)])?;
        let reply = first_u32(&body)?;
        if reply == request_reply::PRIMARY_OWNER || reply == request_reply::ALREADY_OWNER {
            self.lock().owned_names.insert(name.to_string());
        }
        debug!("RequestName({}) replied {}", name, reply);
        Ok(reply)
    }

    /// Give up a well-known name. Returns the `ReleaseName` reply code.
    pub fn release_name(&self, name: &str) -> Result<u32, BusError> {
        let body = self.call_daemon("ReleaseName", vec![Value::from(name)])?;
        let reply = first_u32(&body)?;
        if reply == release_reply::RELEASED {
            self.lock().owned_names.remove(name);
        }
        Ok(reply)
    }

    /// Current owner of a name, if any.
    pub fn name_owner(&self, name: &str) -> Result<Option<String>, BusError> {
        match self.call_daemon("GetNameOwner", vec![Value::from(name)]) {
            Ok(body) => Ok(body.first().and_then(Value::as_str).map(str::to_string)),
            Err(BusError::Remote(remote)) if remote.dbus_name == errors::NAME_HAS_NO_OWNER => {
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    /// Route method calls for `path` to `handler`.
    pub fn register_object(
        &self,
        path: &str,
        handler: Arc<dyn ObjectHandler>,
    ) -> Result<(), BusError> {
        let mut state = self.lock();
        if state.objects.contains_key(path) {
            return Err(BusError::PathInUse(path.to_string()));
        }
        state.objects.insert(path.to_string(), handler);
        debug!("Registered object {}", path);
        Ok(())
    }

    pub fn unregister_object(&self, path: &str) -> bool {
        self.lock().objects.remove(path).is_some()
    }

    /// Call `callback` on the event loop for every signal matching `rule`.
    pub fn subscribe(
        &self,
        rule: MatchRule,
        callback: impl Fn(&Message) + Send + Sync + 'static,
    ) -> Result<SubscriptionId, BusError> {
        self.call_daemon("AddMatch", vec![Value::from(rule.to_string())])?;

        if let Some(sender) = rule.sender.clone().filter(|s| !is_unique_name(s) && s != DBUS_NAME) {
            self.track_owner(&sender)?;
        }

        let id = SubscriptionId(self.next_subscription.fetch_add(1, Ordering::Relaxed));
        self.lock().subscriptions.insert(
            id,
            Subscription {
                rule,
                callback: Arc::new(callback),
            },
        );
        Ok(id)
    }

    /// Remove a subscription or a name watch.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let removed = self.lock().subscriptions.remove(&id);
        match removed {
            Some(subscription) => {
                if !self.is_closed() {
                    let message = Message::method_call(
                        DBUS_NAME,
                        DBUS_PATH,
                        Some(DBUS_INTERFACE),
                        "RemoveMatch",
                        vec![Value::from(subscription.rule.to_string())],
                    );
                    if let Err(e) = self.send(message) {
                        debug!("RemoveMatch failed: {}", e);
                    }
                }
                true
            }
            None => false,
        }
    }

    /// Follow the owner of `name` so signal senders can be matched.
    fn track_owner(&self, name: &str) -> Result<(), BusError> {
        let rule = owner_changed_rule(name);
        self.call_daemon("AddMatch", vec![Value::from(rule.to_string())])?;
        if let Some(owner) = self.name_owner(name)? {
            self.lock().name_owners.insert(name.to_string(), owner);
        }
        Ok(())
    }

    /// Watch the owner of `name`.
    ///
    /// `on_appeared` receives the new owner, `on_vanished` runs when the name
    /// loses its owner. One of them is called once the initial state is known.
    pub fn watch_name(
        self: &Arc<Self>,
        name: &str,
        on_appeared: impl Fn(&str) + Send + Sync + 'static,
        on_vanished: impl Fn() + Send + Sync + 'static,
    ) -> Result<SubscriptionId, BusError> {
        let on_appeared: Arc<dyn Fn(&str) + Send + Sync> = Arc::new(on_appeared);
        let on_vanished: Arc<dyn Fn() + Send + Sync> = Arc::new(on_vanished);

        let (appeared, vanished) = (Arc::clone(&on_appeared), Arc::clone(&on_vanished));
        let id = self.subscribe(owner_changed_rule(name), move |signal| {
            let new_owner = signal.body.get(2).and_then(Value::as_str).unwrap_or_default();
            if new_owner.is_empty() {
                vanished();
            } else {
                appeared(new_owner);
            }
        })?;

        let query = Message::method_call(
            DBUS_NAME,
            DBUS_PATH,
            Some(DBUS_INTERFACE),
            "GetNameOwner",
            vec![Value::from(name)],
        );
        self.call_async(query, move |result| match result {
            Ok(body) => match body.first().and_then(Value::as_str) {
                Some(owner) => on_appeared(owner),
                None => on_vanished(),
            },
            Err(_) => on_vanished(),
        });
        Ok(id)
    }

    /// Close the link. Pending calls fail with [`BusError::Disconnected`].
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        debug!("Closing connection {}", self.unique_name);
        self.transport.close();
        self.fail_pending();
    }

    fn fail_pending(&self) {
        let pending: Vec<Pending> = {
            let mut state = self.lock();
            state.objects.clear();
            state.subscriptions.clear();
            state.owned_names.clear();
            state.pending.drain().map(|(_, p)| p).collect()
        };
        for entry in pending {
            match entry {
                Pending::Sync(sender) => {
                    let _ = sender.send(Err(BusError::Disconnected));
                }
                Pending::Async(callback) => {
                    self.event_loop
                        .schedule(move || callback(Err(BusError::Disconnected)));
                }
            }
        }
    }

    fn dispatch(self: &Arc<Self>, message: Message) {
        trace!("Received {}", message.describe());
        match message.kind {
            MessageKind::MethodReturn | MessageKind::Error => self.dispatch_reply(message),
            MessageKind::MethodCall => self.dispatch_call(message),
            MessageKind::Signal => self.dispatch_signal(message),
        }
    }

    fn dispatch_reply(&self, message: Message) {
        let Some(serial) = message.reply_serial else {
            return;
        };
        let Some(pending) = self.lock().pending.remove(&serial) else {
            trace!("Ignoring reply for unknown serial {}", serial);
            return;
        };

        let result = match message.kind {
            MessageKind::Error => {
                let name = message.error_name.as_deref().unwrap_or(errors::FAILED);
                Err(BusError::Remote(
                    self.mapper.remote_error(name, &message.error_text()),
                ))
            }
            _ => Ok(message.body),
        };
        match pending {
            Pending::Sync(sender) => {
                let _ = sender.send(result);
            }
            Pending::Async(callback) => self.event_loop.schedule(move || callback(result)),
        }
    }

    fn dispatch_call(self: &Arc<Self>, call: Message) {
        let handler = self.lock().objects.get(call.path()).cloned();
        match handler {
            Some(handler) => {
                let connection = Arc::clone(self);
                self.event_loop
                    .schedule(move || handler.handle_call(&connection, call));
            }
            None => {
                let text = format!("No such object path '{}'", call.path());
                if let Err(e) = self.reply_error(&call, errors::UNKNOWN_OBJECT, &text) {
                    warn!("Failed to reply to {}: {}", call.describe(), e);
                }
            }
        }
    }

    fn dispatch_signal(&self, signal: Message) {
        let callbacks: Vec<SignalCallback> = {
            let mut state = self.lock();
            if signal.sender() == DBUS_NAME {
                update_names(&mut state, &self.unique_name, &signal);
            }
            let state = &*state;
            state
                .subscriptions
                .values()
                .filter(|s| {
                    s.rule
                        .matches(&signal, |name| state.name_owners.get(name).cloned())
                })
                .map(|s| Arc::clone(&s.callback))
                .collect()
        };

        if callbacks.is_empty() {
            return;
        }
        let signal = Arc::new(signal);
        for callback in callbacks {
            let signal = Arc::clone(&signal);
            self.event_loop.schedule(move || callback(&signal));
        }
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.close();
    }
}

fn owner_changed_rule(name: &str) -> MatchRule {
    MatchRule::signal(
        Some(DBUS_NAME),
        Some(DBUS_PATH),
        DBUS_INTERFACE,
        "NameOwnerChanged",
    )
    .with_arg0(name)
}

fn update_names(state: &mut State, unique_name: &str, signal: &Message) {
    let arg = |index: usize| {
        signal
            .body
            .get(index)
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string()
    };
    match signal.member() {
        "NameOwnerChanged" => {
            let (name, new_owner) = (arg(0), arg(2));
            if new_owner.is_empty() {
                state.name_owners.remove(&name);
            } else {
                state.name_owners.insert(name, new_owner);
            }
        }
        "NameAcquired" if signal.destination.as_deref() == Some(unique_name) => {
            state.owned_names.insert(arg(0));
        }
        "NameLost" if signal.destination.as_deref() == Some(unique_name) => {
            state.owned_names.remove(&arg(0));
        }
        _ => {}
    }
}

fn first_u32(body: &[Value]) -> Result<u32, BusError> {
    body.first().and_then(Value::as_u32).ok_or_else(|| {
        BusError::Transport(format!("unexpected daemon reply {:?}", body))
    })
}

fn pump(connection: Weak<Connection>, inbox: Receiver<Message>) {
    for message in inbox.iter() {
        let Some(connection) = connection.upgrade() else {
            break;
        };
        if connection.is_closed() {
            break;
        }
        connection.dispatch(message);
    }

    if let Some(connection) = connection.upgrade() {
        if !connection.closed.swap(true, Ordering::SeqCst) {
            error!("Lost the connection to {}", connection.address);
            connection.fail_pending();
        }
    }
}
