//! Bus messages.

use super::value::{body_signature, Value};
use serde::{Deserialize, Serialize};

/// The four kinds of messages travelling on the bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MessageKind {
    MethodCall,
    MethodReturn,
    Error,
    Signal,
}

/// A single bus message.
///
/// Serials are assigned by the sending connection. Replies carry the serial
/// of the call they answer in `reply_serial`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub kind: MessageKind,
    pub serial: u32,
    #[serde(default)]
    pub reply_serial: Option<u32>,
    #[serde(default)]
    pub sender: Option<String>,
    #[serde(default)]
    pub destination: Option<String>,
    #[serde(default)]
    pub path: Option<String>,
    #[serde(default)]
    pub interface: Option<String>,
    #[serde(default)]
    pub member: Option<String>,
    #[serde(default)]
    pub error_name: Option<String>,
    #[serde(default)]
    pub body: Vec<Value>,
}

impl Message {
    fn empty(kind: MessageKind) -> Self {
        Self {
            kind,
            serial: 0,
            reply_serial: None,
            sender: None,
            destination: None,
            path: None,
            interface: None,
            member: None,
            error_name: None,
            body: Vec::new(),
        }
    }

    /// Build a method call.
    pub fn method_call(
        destination: &str,
        path: &str,
        interface: Option<&str>,
        member: &str,
        body: Vec<Value>,
    ) -> Self {
        Self {
            destination: Some(destination.to_string()),
            path: Some(path.to_string()),
            interface: interface.map(str::to_string),
            member: Some(member.to_string()),
            body,
            ..Self::empty(MessageKind::MethodCall)
        }
    }

    /// Build a broadcast signal.
    pub fn signal(path: &str, interface: &str, member: &str, body: Vec<Value>) -> Self {
        Self {
            path: Some(path.to_string()),
            interface: Some(interface.to_string()),
            member: Some(member.to_string()),
            body,
            ..Self::empty(MessageKind::Signal)
        }
    }

    /// Build the successful reply to a method call.
    pub fn method_return(call: &Message, body: Vec<Value>) -> Self {
        Self {
            reply_serial: Some(call.serial),
            destination: call.sender.clone(),
            body,
            ..Self::empty(MessageKind::MethodReturn)
        }
    }

    /// Build the error reply to a method call.
    pub fn error(call: &Message, error_name: &str, message: &str) -> Self {
        Self {
            reply_serial: Some(call.serial),
            destination: call.sender.clone(),
            error_name: Some(error_name.to_string()),
            body: vec![Value::Str(message.to_string())],
            ..Self::empty(MessageKind::Error)
        }
    }

    pub fn member(&self) -> &str {
        self.member.as_deref().unwrap_or_default()
    }

    pub fn interface(&self) -> &str {
        self.interface.as_deref().unwrap_or_default()
    }

    pub fn path(&self) -> &str {
        self.path.as_deref().unwrap_or_default()
    }

    pub fn sender(&self) -> &str {
        self.sender.as_deref().unwrap_or_default()
    }

    /// The human readable message of an error reply.
    pub fn error_text(&self) -> String {
        self.body
            .first()
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string()
    }

    pub fn body_signature(&self) -> String {
        body_signature(&self.body)
    }

    /// Short description for logging.
    pub fn describe(&self) -> String {
        match self.kind {
            MessageKind::MethodCall => format!(
                "call {}.{} on {} at {} (serial {})",
                self.interface(),
                self.member(),
                self.destination.as_deref().unwrap_or("?"),
                self.path(),
                self.serial
            ),
            MessageKind::MethodReturn => {
                format!("return for serial {}", self.reply_serial.unwrap_or(0))
            }
            MessageKind::Error => format!(
                "error {} for serial {}",
                self.error_name.as_deref().unwrap_or("?"),
                self.reply_serial.unwrap_or(0)
            ),
            MessageKind::Signal => format!(
                "signal {}.{} from {} at {}",
                self.interface(),
                self.member(),
                self.sender(),
                self.path()
            ),
        }
    }
}
