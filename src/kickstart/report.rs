//! Kickstart reports
//!
//! A report collects the errors and warnings found while reading a
//! kickstart. On the bus it travels as `(a(ssus)a(ssus))`.

use crate::bus::signature::Type;
use crate::bus::value::{FromValue, IntoValue, Value, ValueError};
use serde::{Deserialize, Serialize};
use std::fmt;

/// One error or warning with its source coordinates.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct KickstartMessage {
    pub module_name: String,
    pub file_name: String,
    pub line_number: u32,
    pub message: String,
}

impl KickstartMessage {
    pub fn new(
        module_name: impl Into<String>,
        file_name: impl Into<String>,
        line_number: u32,
        message: impl Into<String>,
    ) -> Self {
        Self {
            module_name: module_name.into(),
            file_name: file_name.into(),
            line_number,
            message: message.into(),
        }
    }

    /// A message a module reports against a line of its own slice.
    pub fn at_line(line_number: u32, message: impl Into<String>) -> Self {
        Self::new("", "", line_number, message)
    }
}

impl fmt::Display for KickstartMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{}:{}: {}",
            self.module_name, self.file_name, self.line_number, self.message
        )
    }
}

impl IntoValue for KickstartMessage {
    fn value_type() -> Type {
        <(String, String, u32, String)>::value_type()
    }

    fn into_value(self) -> Value {
        (self.module_name, self.file_name, self.line_number, self.message).into_value()
    }
}

impl FromValue for KickstartMessage {
    fn from_value(value: Value) -> Result<Self, ValueError> {
        let (module_name, file_name, line_number, message) =
            <(String, String, u32, String)>::from_value(value)?;
        Ok(Self {
            module_name,
            file_name,
            line_number,
            message,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct KickstartReport {
    pub error_messages: Vec<KickstartMessage>,
    pub warning_messages: Vec<KickstartMessage>,
}

impl KickstartReport {
    pub fn new() -> Self {
        Self::default()
    }

    /// A report is valid if it has no errors. Warnings do not count.
    pub fn is_valid(&self) -> bool {
        self.error_messages.is_empty()
    }

    pub fn add_error(&mut self, message: KickstartMessage) {
        self.error_messages.push(message);
    }

    pub fn add_warning(&mut self, message: KickstartMessage) {
        self.warning_messages.push(message);
    }

    /// Errors first, then warnings.
    pub fn messages(&self) -> impl Iterator<Item = &KickstartMessage> {
        self.error_messages.iter().chain(&self.warning_messages)
    }
}

impl IntoValue for KickstartReport {
    fn value_type() -> Type {
        <(Vec<KickstartMessage>, Vec<KickstartMessage>)>::value_type()
    }

    fn into_value(self) -> Value {
        (self.error_messages, self.warning_messages).into_value()
    }
}

impl FromValue for KickstartReport {
    fn from_value(value: Value) -> Result<Self, ValueError> {
        let (error_messages, warning_messages) = FromValue::from_value(value)?;
        Ok(Self {
            error_messages,
            warning_messages,
        })
    }
}

impl From<KickstartReport> for Value {
    fn from(report: KickstartReport) -> Self {
        report.into_value()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_report_signature() {
        let value = KickstartReport::new().into_value();
        assert_eq!(value.signature(), "(a(ssus)a(ssus))");
    }

    #[test]
    fn test_validity_ignores_warnings() {
        let mut report = KickstartReport::new();
        assert!(report.is_valid());
        report.add_warning(KickstartMessage::at_line(1, "deprecated"));
        assert!(report.is_valid());
        report.add_error(KickstartMessage::at_line(2, "bad"));
        assert!(!report.is_valid());
        assert_eq!(report.messages().count(), 2);
    }

    #[test]
    fn test_report_value_conversion() {
        let mut report = KickstartReport::new();
        report.add_error(KickstartMessage::new(
            "org.quarry.Installer.Modules.Network",
            "ks.cfg",
            3,
            "unknown device",
        ));
        let back = KickstartReport::from_value(report.clone().into_value()).unwrap();
        assert_eq!(back, report);
    }

    #[test]
    fn test_message_display() {
        let message = KickstartMessage::new("Network", "sub.cfg", 3, "boom");
        assert_eq!(message.to_string(), "Network:sub.cfg:3: boom");
    }
}
