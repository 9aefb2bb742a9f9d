//! Transports between a connection and a broker.
//!
//! `memory:name=<id>` reaches a broker living in this process through
//! channels. `unix:path=<socket>` reaches a broker served by
//! [`UnixBrokerServer`]: messages travel as newline-delimited JSON and the
//! server opens every stream with a hello frame carrying the protocol tag and
//! the unique name. A socket that does not greet us that way, such as a
//! standard D-Bus daemon waiting for SASL authentication, is reported as
//! unavailable.

use super::address::BusAddress;
use super::broker::Broker;
use super::error::BusError;
use super::message::Message;
use log::{debug, error, info, warn};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::io::{BufRead, BufReader, Write};
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{channel, Receiver, Sender};
use std::sync::{Arc, Mutex, OnceLock, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// The sending half of an open link to a broker.
pub trait Transport: Send + Sync {
    fn send(&self, message: Message) -> Result<(), BusError>;

    /// Detach from the broker. Further sends fail.
    fn close(&self);
}

/// An open link: the transport, our unique name and the incoming messages.
pub struct Link {
    pub transport: Box<dyn Transport>,
    pub unique_name: String,
    pub inbox: Receiver<Message>,
}

/// Open a link to the broker at `address`.
pub fn connect(address: &BusAddress) -> Result<Link, BusError> {
    match address {
        BusAddress::Memory { name } => connect_memory(name),
        BusAddress::Unix { path } => connect_unix(path),
    }
}

// ============================================================================
// In-process brokers
// ============================================================================

fn memory_brokers() -> &'static Mutex<HashMap<String, Arc<Broker>>> {
    static BROKERS: OnceLock<Mutex<HashMap<String, Arc<Broker>>>> = OnceLock::new();
    BROKERS.get_or_init(|| Mutex::new(HashMap::new()))
}

/// Start an in-process broker reachable at `memory:name=<name>`.
///
/// A broker already registered under the same name is shut down first.
pub fn start_memory_broker(name: &str) -> Arc<Broker> {
    let broker = Broker::new(BusAddress::memory(name));
    let previous = memory_brokers()
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .insert(name.to_string(), Arc::clone(&broker));
    if let Some(previous) = previous {
        warn!("Replacing in-process broker {}", name);
        previous.shutdown();
    }
    broker
}

/// Stop the in-process broker registered under `name`.
pub fn stop_memory_broker(name: &str) {
    let broker = memory_brokers()
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .remove(name);
    if let Some(broker) = broker {
        broker.shutdown();
    }
}

struct MemoryTransport {
    broker: Arc<Broker>,
    unique_name: String,
    closed: AtomicBool,
}

impl Transport for MemoryTransport {
    fn send(&self, message: Message) -> Result<(), BusError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(BusError::Disconnected);
        }
        self.broker.route(&self.unique_name, message);
        Ok(())
    }

    fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.broker.detach(&self.unique_name);
        }
    }
}

fn connect_memory(name: &str) -> Result<Link, BusError> {
    let broker = memory_brokers()
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .get(name)
        .cloned()
        .ok_or_else(|| {
            BusError::ConnectionUnavailable(format!("no in-process broker named {:?}", name))
        })?;

    let (outbox, inbox) = channel();
    let unique_name = broker.attach(outbox);
    Ok(Link {
        transport: Box::new(MemoryTransport {
            broker,
            unique_name: unique_name.clone(),
            closed: AtomicBool::new(false),
        }),
        unique_name,
        inbox,
    })
}

// ============================================================================
// Unix sockets
// ============================================================================

/// Protocol tag of the hello frame.
const PROTOCOL: &str = "quarry/1";

/// How long a client waits for the hello frame.
const HELLO_TIMEOUT: Duration = Duration::from_secs(5);

/// First frame on every stream, sent by the server.
#[derive(Debug, Serialize, Deserialize)]
struct Hello {
    protocol: String,
    unique_name: String,
}

fn write_frame<T: Serialize>(stream: &mut impl Write, frame: &T) -> Result<(), BusError> {
    let mut line =
        serde_json::to_string(frame).map_err(|e| BusError::Transport(e.to_string()))?;
    line.push('\n');
    stream.write_all(line.as_bytes())?;
    stream.flush()?;
    Ok(())
}

/// Read frames until EOF, feeding each parsed message to `deliver`.
fn read_messages(reader: impl BufRead, mut deliver: impl FnMut(Message) -> bool) {
    for line in reader.lines() {
        let line = match line {
            Ok(line) => line,
            Err(e) => {
                debug!("Stream read failed: {}", e);
                break;
            }
        };
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<Message>(&line) {
            Ok(message) => {
                if !deliver(message) {
                    break;
                }
            }
            Err(e) => warn!("Dropping malformed frame: {}", e),
        }
    }
}

struct UnixTransport {
    writer: Mutex<UnixStream>,
    closed: AtomicBool,
}

impl Transport for UnixTransport {
    fn send(&self, message: Message) -> Result<(), BusError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(BusError::Disconnected);
        }
        let mut writer = self.writer.lock().unwrap_or_else(PoisonError::into_inner);
        write_frame(&mut *writer, &message)
    }

    fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            let writer = self.writer.lock().unwrap_or_else(PoisonError::into_inner);
            let _ = writer.shutdown(std::net::Shutdown::Both);
        }
    }
}

fn connect_unix(path: &Path) -> Result<Link, BusError> {
    let stream = UnixStream::connect(path).map_err(|e| {
        BusError::ConnectionUnavailable(format!("cannot connect to {}: {}", path.display(), e))
    })?;
    let mut reader = BufReader::new(stream.try_clone()?);
    let hello = read_hello(&stream, &mut reader).map_err(|reason| {
        BusError::ConnectionUnavailable(format!(
            "{} is not a quarry broker: {}",
            path.display(),
            reason
        ))
    })?;
    stream.set_read_timeout(None)?;

    let (sender, inbox) = channel();
    thread::Builder::new()
        .name(format!("bus-reader-{}", hello.unique_name))
        .spawn(move || read_messages(reader, |message| sender.send(message).is_ok()))?;

    Ok(Link {
        transport: Box::new(UnixTransport {
            writer: Mutex::new(stream),
            closed: AtomicBool::new(false),
        }),
        unique_name: hello.unique_name,
        inbox,
    })
}

fn read_hello(stream: &UnixStream, reader: &mut impl BufRead) -> Result<Hello, String> {
    stream
        .set_read_timeout(Some(HELLO_TIMEOUT))
        .map_err(|e| e.to_string())?;
    let mut first = String::new();
    match reader.read_line(&mut first) {
        Ok(0) => return Err("the socket closed without a greeting".to_string()),
        Ok(_) => {}
        Err(e) => return Err(format!("no greeting: {}", e)),
    }
    let hello: Hello =
        serde_json::from_str(first.trim()).map_err(|e| format!("bad greeting: {}", e))?;
    if hello.protocol != PROTOCOL {
        return Err(format!("unsupported protocol {:?}", hello.protocol));
    }
    Ok(hello)
}

/// Serves a broker on a unix stream socket.
pub struct UnixBrokerServer {
    broker: Arc<Broker>,
    path: PathBuf,
    stopping: Arc<AtomicBool>,
    accept_thread: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for UnixBrokerServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UnixBrokerServer")
            .field("path", &self.path)
            .finish()
    }
}

impl UnixBrokerServer {
    /// Bind the socket and start accepting clients.
    ///
    /// A stale socket file at `path` is removed first.
    pub fn bind(path: impl Into<PathBuf>) -> Result<Self, BusError> {
        let path = path.into();
        if path.exists() {
            std::fs::remove_file(&path)?;
        }
        let listener = UnixListener::bind(&path)?;
        let broker = Broker::new(BusAddress::unix(&path));
        let stopping = Arc::new(AtomicBool::new(false));
        info!("Message broker listening on {}", path.display());

        let accept_broker = Arc::clone(&broker);
        let accept_stopping = Arc::clone(&stopping);
        let handle = thread::Builder::new()
            .name("bus-accept".to_string())
            .spawn(move || accept_loop(listener, accept_broker, accept_stopping))?;

        Ok(Self {
            broker,
            path,
            stopping,
            accept_thread: Mutex::new(Some(handle)),
        })
    }

    pub fn broker(&self) -> &Arc<Broker> {
        &self.broker
    }

    pub fn address(&self) -> BusAddress {
        BusAddress::unix(&self.path)
    }

    /// Stop accepting, disconnect every client and remove the socket file.
    pub fn stop(&self) {
        if self.stopping.swap(true, Ordering::SeqCst) {
            return;
        }
        // Wake the accept loop up.
        let _ = UnixStream::connect(&self.path);
        let handle = self
            .accept_thread
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            if handle.join().is_err() {
                error!("The accept thread panicked");
            }
        }
        self.broker.shutdown();
        let _ = std::fs::remove_file(&self.path);
        info!("Message broker at {} stopped", self.path.display());
    }
}

impl Drop for UnixBrokerServer {
    fn drop(&mut self) {
        self.stop();
    }
}

fn accept_loop(listener: UnixListener, broker: Arc<Broker>, stopping: Arc<AtomicBool>) {
    for stream in listener.incoming() {
        if stopping.load(Ordering::SeqCst) {
            break;
        }
        match stream {
            Ok(stream) => {
                if let Err(e) = serve_client(stream, Arc::clone(&broker)) {
                    warn!("Failed to serve a bus client: {}", e);
                }
            }
            Err(e) => warn!("Failed to accept a bus client: {}", e),
        }
    }
}

fn serve_client(stream: UnixStream, broker: Arc<Broker>) -> Result<(), BusError> {
    let mut writer = stream.try_clone()?;
    let reader = BufReader::new(stream);
    let (outbox, outgoing): (Sender<Message>, Receiver<Message>) = channel();
    let unique_name = broker.attach(outbox);

    write_frame(
        &mut writer,
        &Hello {
            protocol: PROTOCOL.to_string(),
            unique_name: unique_name.clone(),
        },
    )?;

    thread::Builder::new()
        .name(format!("bus-writer-{}", unique_name))
        .spawn(move || {
            for message in outgoing {
                if let Err(e) = write_frame(&mut writer, &message) {
                    debug!("Client write failed: {}", e);
                    break;
                }
            }
            let _ = writer.shutdown(std::net::Shutdown::Both);
        })?;

    let name = unique_name.clone();
    thread::Builder::new()
        .name(format!("bus-client-{}", unique_name))
        .spawn(move || {
            read_messages(reader, |message| {
                broker.route(&name, message);
                true
            });
            broker.detach(&name);
        })?;
    Ok(())
}
