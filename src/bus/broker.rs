//! Message broker
//!
//! Routes messages between attached clients, owns the name registry and
//! answers the daemon methods (`RequestName`, `StartServiceByName`, ...).
//! The broker knows nothing about sockets: every client is an outbox channel
//! and transports feed incoming messages through [`Broker::route`].

use super::address::BusAddress;
use super::match_rule::MatchRule;
use super::message::{Message, MessageKind};
use super::names::{
    errors, is_unique_name, is_valid_bus_name, release_reply, request_flags, request_reply,
    start_reply, DBUS_INTERFACE, DBUS_NAME, DBUS_PATH, PEER_INTERFACE,
};
use super::value::Value;
use log::{debug, error, info, warn};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::mpsc::Sender;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// Starts the service that will own an activatable name.
///
/// The activated service is expected to connect to `address` and request
/// the name; the pending `StartServiceByName` call is answered then.
pub trait Activator: Send + Sync {
    fn activate(&self, name: &str, address: &BusAddress) -> Result<(), String>;
}

impl<F> Activator for F
where
    F: Fn(&str, &BusAddress) -> Result<(), String> + Send + Sync,
{
    fn activate(&self, name: &str, address: &BusAddress) -> Result<(), String> {
        self(name, address)
    }
}

#[derive(Debug, Clone)]
struct Owner {
    unique: String,
    flags: u32,
}

struct Client {
    outbox: Sender<Message>,
    rules: Vec<MatchRule>,
}

#[derive(Default)]
struct State {
    clients: HashMap<String, Client>,
    /// Front entry is the primary owner, the rest is the queue.
    names: HashMap<String, VecDeque<Owner>>,
    activatable: HashMap<String, Arc<dyn Activator>>,
    /// Activatable names in registration order.
    activatable_order: Vec<String>,
    /// `StartServiceByName` calls waiting for the name to get an owner.
    pending_starts: HashMap<String, Vec<Message>>,
    /// Calls forwarded to a client and not answered yet, by callee.
    in_flight: HashMap<String, Vec<(String, u32)>>,
    next_client: u64,
}

impl State {
    fn owner_of(&self, name: &str) -> Option<String> {
        if name == DBUS_NAME {
            return Some(DBUS_NAME.to_string());
        }
        if is_unique_name(name) {
            return self.clients.contains_key(name).then(|| name.to_string());
        }
        self.names
            .get(name)
            .and_then(|queue| queue.front())
            .map(|owner| owner.unique.clone())
    }
}

/// Work collected under the state lock and carried out after releasing it.
enum Action {
    Deliver(Sender<Message>, Message),
    Activate(String, Arc<dyn Activator>),
}

pub struct Broker {
    address: BusAddress,
    state: Mutex<State>,
    serial: AtomicU32,
}

impl std::fmt::Debug for Broker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Broker")
            .field("address", &self.address)
            .finish()
    }
}

impl Broker {
    pub fn new(address: BusAddress) -> Arc<Self> {
        Arc::new(Self {
            address,
            state: Mutex::new(State::default()),
            serial: AtomicU32::new(1),
        })
    }

    /// The address clients use to reach this broker.
    pub fn address(&self) -> &BusAddress {
        &self.address
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Make `name` startable through `StartServiceByName`.
    pub fn register_activatable(&self, name: &str, activator: Arc<dyn Activator>) {
        debug!("Registering activatable name {}", name);
        let mut state = self.lock();
        if state
            .activatable
            .insert(name.to_string(), activator)
            .is_none()
        {
            state.activatable_order.push(name.to_string());
        }
    }

    /// Attach a client and return its unique name.
    pub fn attach(&self, outbox: Sender<Message>) -> String {
        let mut state = self.lock();
        state.next_client += 1;
        let unique = format!(":1.{}", state.next_client);
        state.clients.insert(
            unique.clone(),
            Client {
                outbox,
                rules: Vec::new(),
            },
        );
        debug!("Client {} attached to {}", unique, self.address);
        let actions = self.owner_changed(&state, &unique, "", &unique);
        drop(state);
        self.execute(actions);
        unique
    }

    /// Detach a client: release its names and fail the calls it still owed.
    pub fn detach(&self, unique: &str) {
        let mut state = self.lock();
        if state.clients.remove(unique).is_none() {
            return;
        }
        debug!("Client {} detached from {}", unique, self.address);

        let mut actions = Vec::new();
        let owned: Vec<String> = state
            .names
            .iter()
            .filter(|(_, queue)| queue.iter().any(|o| o.unique == unique))
            .map(|(name, _)| name.clone())
            .collect();
        for name in owned {
            actions.extend(self.remove_owner(&mut state, &name, unique));
        }

        for (caller, serial) in state.in_flight.remove(unique).unwrap_or_default() {
            if let Some(client) = state.clients.get(&caller) {
                let mut reply = self.daemon_message(MessageKind::Error);
                reply.reply_serial = Some(serial);
                reply.destination = Some(caller.clone());
                reply.error_name = Some(errors::NO_REPLY.to_string());
                reply.body = vec![Value::from(format!("{} disconnected", unique))];
                actions.push(Action::Deliver(client.outbox.clone(), reply));
            }
        }

        actions.extend(self.owner_changed(&state, unique, unique, ""));
        drop(state);
        self.execute(actions);
    }

    /// Disconnect every client.
    pub fn shutdown(&self) {
        let mut state = self.lock();
        info!("Shutting down broker at {}", self.address);
        state.clients.clear();
        state.names.clear();
        state.pending_starts.clear();
        state.in_flight.clear();
    }

    pub fn client_count(&self) -> usize {
        self.lock().clients.len()
    }

    /// Route a message sent by the client `from`.
    pub fn route(&self, from: &str, mut message: Message) {
        message.sender = Some(from.to_string());
        let actions = {
            let mut state = self.lock();
            if !state.clients.contains_key(from) {
                debug!("Dropping message from detached client {}", from);
                return;
            }
            match message.kind {
                MessageKind::MethodCall if message.destination.as_deref() == Some(DBUS_NAME) => {
                    self.daemon_call(&mut state, from, message)
                }
                MessageKind::MethodCall => self.forward_call(&mut state, from, message),
                MessageKind::MethodReturn | MessageKind::Error => {
                    self.forward_reply(&mut state, from, message)
                }
                MessageKind::Signal => self.broadcast(&state, message),
            }
        };
        self.execute(actions);
    }

    fn execute(&self, actions: Vec<Action>) {
        for action in actions {
            match action {
                Action::Deliver(outbox, message) => {
                    if outbox.send(message).is_err() {
                        debug!("Dropping message for a closed client");
                    }
                }
                Action::Activate(name, activator) => {
                    info!("Activating {}", name);
                    if let Err(reason) = activator.activate(&name, &self.address) {
                        error!("Failed to activate {}: {}", name, reason);
                        self.fail_pending_start(&name, &reason);
                    }
                }
            }
        }
    }

    fn fail_pending_start(&self, name: &str, reason: &str) {
        let actions: Vec<Action> = {
            let mut state = self.lock();
            let calls = state.pending_starts.remove(name).unwrap_or_default();
            calls
                .iter()
                .filter_map(|call| {
                    let reply = Message::error(
                        call,
                        errors::SPAWN_FAILED,
                        &format!("Failed to activate service {}: {}", name, reason),
                    );
                    self.reply_action(&state, reply)
                })
                .collect()
        };
        self.execute(actions);
    }

    fn next_serial(&self) -> u32 {
        self.serial.fetch_add(1, Ordering::Relaxed)
    }

    fn daemon_message(&self, kind: MessageKind) -> Message {
        Message {
            kind,
            serial: self.next_serial(),
            reply_serial: None,
            sender: Some(DBUS_NAME.to_string()),
            destination: None,
            path: None,
            interface: None,
            member: None,
            error_name: None,
            body: Vec::new(),
        }
    }

    fn daemon_signal(&self, member: &str, destination: Option<&str>, body: Vec<Value>) -> Message {
        let mut signal = Message::signal(DBUS_PATH, DBUS_INTERFACE, member, body);
        signal.serial = self.next_serial();
        signal.sender = Some(DBUS_NAME.to_string());
        signal.destination = destination.map(str::to_string);
        signal
    }

    fn reply_action(&self, state: &State, mut reply: Message) -> Option<Action> {
        reply.serial = self.next_serial();
        reply.sender = Some(DBUS_NAME.to_string());
        let destination = reply.destination.clone()?;
        state
            .clients
            .get(&destination)
            .map(|client| Action::Deliver(client.outbox.clone(), reply))
    }

    /// Deliver a signal to its destination or to every interested client.
    fn broadcast(&self, state: &State, signal: Message) -> Vec<Action> {
        if let Some(destination) = &signal.destination {
            return state
                .owner_of(destination)
                .and_then(|unique| state.clients.get(&unique))
                .map(|client| vec![Action::Deliver(client.outbox.clone(), signal.clone())])
                .unwrap_or_default();
        }
        state
            .clients
            .values()
            .filter(|client| {
                client
                    .rules
                    .iter()
                    .any(|rule| rule.matches(&signal, |name| state.owner_of(name)))
            })
            .map(|client| Action::Deliver(client.outbox.clone(), signal.clone()))
            .collect()
    }

    fn owner_changed(&self, state: &State, name: &str, old: &str, new: &str) -> Vec<Action> {
        let signal = self.daemon_signal(
            "NameOwnerChanged",
            None,
            vec![Value::from(name), Value::from(old), Value::from(new)],
        );
        self.broadcast(state, signal)
    }

    fn name_event(&self, state: &State, member: &str, unique: &str, name: &str) -> Vec<Action> {
        let signal = self.daemon_signal(member, Some(unique), vec![Value::from(name)]);
        self.broadcast(state, signal)
    }

    fn forward_call(&self, state: &mut State, from: &str, call: Message) -> Vec<Action> {
        let destination = call.destination.clone().unwrap_or_default();
        match state.owner_of(&destination) {
            Some(unique) => {
                let Some(client) = state.clients.get(&unique) else {
                    return Vec::new();
                };
                let outbox = client.outbox.clone();
                state
                    .in_flight
                    .entry(unique)
                    .or_default()
                    .push((from.to_string(), call.serial));
                vec![Action::Deliver(outbox, call)]
            }
            None => {
                let reply = Message::error(
                    &call,
                    errors::SERVICE_UNKNOWN,
                    &format!("The name {} is not owned by anybody", destination),
                );
                self.reply_action(state, reply).into_iter().collect()
            }
        }
    }

    fn forward_reply(&self, state: &mut State, from: &str, reply: Message) -> Vec<Action> {
        let Some(destination) = reply.destination.clone() else {
            return Vec::new();
        };
        if let (Some(calls), Some(serial)) = (state.in_flight.get_mut(from), reply.reply_serial) {
            calls.retain(|(caller, s)| !(caller == &destination && *s == serial));
        }
        state
            .clients
            .get(&destination)
            .map(|client| vec![Action::Deliver(client.outbox.clone(), reply)])
            .unwrap_or_default()
    }

    fn daemon_call(&self, state: &mut State, from: &str, call: Message) -> Vec<Action> {
        let result = if call.interface() == PEER_INTERFACE {
            match call.member() {
                "Ping" => Ok(DaemonReply::now(Vec::new())),
                "GetMachineId" => Ok(DaemonReply::now(vec![Value::from("quarry-broker")])),
                other => Err(unknown_method(other)),
            }
        } else {
            self.daemon_method(state, from, &call)
        };

        let mut actions = Vec::new();
        let reply = match result {
            Ok(DaemonReply::Now(body, follow_up)) => {
                actions.extend(follow_up);
                Some(Message::method_return(&call, body))
            }
            Ok(DaemonReply::Deferred(follow_up)) => {
                actions.extend(follow_up);
                None
            }
            Err((name, text)) => Some(Message::error(&call, name, &text)),
        };
        if let Some(reply) = reply {
            // The reply goes out before any follow-up signal.
            let mut ordered: Vec<Action> = self.reply_action(state, reply).into_iter().collect();
            ordered.append(&mut actions);
            return ordered;
        }
        actions
    }

    fn daemon_method(
        &self,
        state: &mut State,
        from: &str,
        call: &Message,
    ) -> Result<DaemonReply, (&'static str, String)> {
        let string_arg = |index: usize| -> Result<String, (&'static str, String)> {
            call.body
                .get(index)
                .and_then(Value::as_str)
                .map(str::to_string)
                .ok_or_else(|| {
                    (
                        errors::INVALID_ARGS,
                        format!("{} expects a string argument at {}", call.member(), index),
                    )
                })
        };

        match call.member() {
            "Hello" => Ok(DaemonReply::now(vec![Value::from(from)])),
            "RequestName" => {
                let name = string_arg(0)?;
                let flags = call.body.get(1).and_then(Value::as_u32).unwrap_or(0);
                self.request_name(state, from, &name, flags)
            }
            "ReleaseName" => {
                let name = string_arg(0)?;
                self.release_name(state, from, &name)
            }
            "GetNameOwner" => {
                let name = string_arg(0)?;
                match state.owner_of(&name) {
                    Some(owner) => Ok(DaemonReply::now(vec![Value::from(owner)])),
                    None => Err((
                        errors::NAME_HAS_NO_OWNER,
                        format!("Could not get owner of name '{}': no such name", name),
                    )),
                }
            }
            "NameHasOwner" => {
                let name = string_arg(0)?;
                Ok(DaemonReply::now(vec![Value::from(
                    state.owner_of(&name).is_some(),
                )]))
            }
            "ListNames" => {
                let mut names = vec![DBUS_NAME.to_string()];
                let mut owned: Vec<String> = state
                    .clients
                    .keys()
                    .cloned()
                    .chain(state.names.keys().cloned())
                    .collect();
                owned.sort();
                names.extend(owned);
                Ok(DaemonReply::now(vec![Value::from(names)]))
            }
            "ListActivatableNames" => {
                let mut names = vec![DBUS_NAME.to_string()];
                names.extend(state.activatable_order.iter().cloned());
                Ok(DaemonReply::now(vec![Value::from(names)]))
            }
            "StartServiceByName" => {
                let name = string_arg(0)?;
                self.start_service(state, &name, call)
            }
            "AddMatch" => {
                let text = string_arg(0)?;
                let rule = MatchRule::parse(&text)
                    .ok_or_else(|| (errors::INVALID_ARGS, format!("Invalid match rule {:?}", text)))?;
                if let Some(client) = state.clients.get_mut(from) {
                    client.rules.push(rule);
                }
                Ok(DaemonReply::now(Vec::new()))
            }
            "RemoveMatch" => {
                let text = string_arg(0)?;
                let rule = MatchRule::parse(&text)
                    .ok_or_else(|| (errors::INVALID_ARGS, format!("Invalid match rule {:?}", text)))?;
                if let Some(client) = state.clients.get_mut(from) {
                    if let Some(index) = client.rules.iter().position(|r| *r == rule) {
                        client.rules.remove(index);
                    }
                }
                Ok(DaemonReply::now(Vec::new()))
            }
            other => Err(unknown_method(other)),
        }
    }

    fn request_name(
        &self,
        state: &mut State,
        from: &str,
        name: &str,
        flags: u32,
    ) -> Result<DaemonReply, (&'static str, String)> {
        if !is_valid_bus_name(name) {
            return Err((
                errors::INVALID_ARGS,
                format!("Requested bus name {:?} is not valid", name),
            ));
        }

        let entry = Owner {
            unique: from.to_string(),
            flags,
        };
        let queue = state.names.entry(name.to_string()).or_default();

        let reply = match queue.front().cloned() {
            None => {
                queue.push_back(entry);
                None
            }
            Some(primary) if primary.unique == from => {
                if let Some(front) = queue.front_mut() {
                    front.flags = flags;
                }
                return Ok(DaemonReply::now(vec![Value::from(
                    request_reply::ALREADY_OWNER,
                )]));
            }
            Some(primary)
                if flags & request_flags::REPLACE_EXISTING != 0
                    && primary.flags & request_flags::ALLOW_REPLACEMENT != 0 =>
            {
                queue.retain(|o| o.unique != from);
                let old = queue.pop_front();
                queue.push_front(entry);
                if let Some(old) = old.filter(|o| o.flags & request_flags::DO_NOT_QUEUE == 0) {
                    queue.insert(1, old);
                }
                Some(primary.unique)
            }
            Some(_) if flags & request_flags::DO_NOT_QUEUE != 0 => {
                return Ok(DaemonReply::now(vec![Value::from(request_reply::EXISTS)]));
            }
            Some(_) => {
                match queue.iter_mut().find(|o| o.unique == from) {
                    Some(queued) => queued.flags = flags,
                    None => queue.push_back(entry),
                }
                return Ok(DaemonReply::now(vec![Value::from(request_reply::IN_QUEUE)]));
            }
        };

        info!("{} now owns {}", from, name);
        let mut actions = Vec::new();
        if let Some(old) = &reply {
            actions.extend(self.name_event(state, "NameLost", old, name));
        }
        actions.extend(self.owner_changed(state, name, reply.as_deref().unwrap_or(""), from));
        actions.extend(self.name_event(state, "NameAcquired", from, name));
        actions.extend(self.complete_pending_starts(state, name));
        Ok(DaemonReply::Now(
            vec![Value::from(request_reply::PRIMARY_OWNER)],
            actions,
        ))
    }

    fn release_name(
        &self,
        state: &mut State,
        from: &str,
        name: &str,
    ) -> Result<DaemonReply, (&'static str, String)> {
        if !is_valid_bus_name(name) {
            return Err((
                errors::INVALID_ARGS,
                format!("Given bus name {:?} is not valid", name),
            ));
        }
        let code = match state.names.get(name) {
            None => release_reply::NON_EXISTENT,
            Some(queue) if !queue.iter().any(|o| o.unique == from) => release_reply::NOT_OWNER,
            Some(_) => {
                let actions = self.remove_owner(state, name, from);
                return Ok(DaemonReply::Now(
                    vec![Value::from(release_reply::RELEASED)],
                    actions,
                ));
            }
        };
        Ok(DaemonReply::now(vec![Value::from(code)]))
    }

    /// Remove `unique` from the owners of `name`, promoting the next queued
    /// owner if it was the primary one.
    fn remove_owner(&self, state: &mut State, name: &str, unique: &str) -> Vec<Action> {
        let Some(queue) = state.names.get_mut(name) else {
            return Vec::new();
        };
        let was_primary = queue.front().is_some_and(|o| o.unique == unique);
        queue.retain(|o| o.unique != unique);
        let next = queue.front().map(|o| o.unique.clone());
        if queue.is_empty() {
            state.names.remove(name);
        }
        if !was_primary {
            return Vec::new();
        }

        debug!("{} lost {}", unique, name);
        let mut actions = self.name_event(state, "NameLost", unique, name);
        actions.extend(self.owner_changed(state, name, unique, next.as_deref().unwrap_or("")));
        if let Some(next) = next {
            actions.extend(self.name_event(state, "NameAcquired", &next, name));
            actions.extend(self.complete_pending_starts(state, name));
        }
        actions
    }

    fn start_service(
        &self,
        state: &mut State,
        name: &str,
        call: &Message,
    ) -> Result<DaemonReply, (&'static str, String)> {
        if state.owner_of(name).is_some() {
            return Ok(DaemonReply::now(vec![Value::from(
                start_reply::ALREADY_RUNNING,
            )]));
        }
        let Some(activator) = state.activatable.get(name).cloned() else {
            return Err((
                errors::SERVICE_UNKNOWN,
                format!("The name {} was not provided by any activatable service", name),
            ));
        };

        let pending = state.pending_starts.entry(name.to_string()).or_default();
        pending.push(call.clone());
        if pending.len() > 1 {
            debug!("Activation of {} is already in progress", name);
            return Ok(DaemonReply::Deferred(Vec::new()));
        }
        Ok(DaemonReply::Deferred(vec![Action::Activate(
            name.to_string(),
            activator,
        )]))
    }

    fn complete_pending_starts(&self, state: &mut State, name: &str) -> Vec<Action> {
        let calls = state.pending_starts.remove(name).unwrap_or_default();
        calls
            .iter()
            .filter_map(|call| {
                let reply = Message::method_return(call, vec![Value::from(start_reply::SUCCESS)]);
                self.reply_action(state, reply)
            })
            .collect()
    }
}

enum DaemonReply {
    /// Reply immediately, then carry out the follow-up actions.
    Now(Vec<Value>, Vec<Action>),
    /// The reply is sent later.
    Deferred(Vec<Action>),
}

impl DaemonReply {
    fn now(body: Vec<Value>) -> Self {
        DaemonReply::Now(body, Vec::new())
    }
}

fn unknown_method(member: &str) -> (&'static str, String) {
    warn!("Unknown daemon method {}", member);
    (
        errors::UNKNOWN_METHOD,
        format!("The bus daemon has no method {:?}", member),
    )
}
