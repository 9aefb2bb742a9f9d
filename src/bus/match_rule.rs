//! Signal match rules.
//!
//! Rules travel to the broker as strings such as
//! `type='signal',sender='org.x',interface='org.x.Iface',member='Changed'`.
//! The same rule filters signals again on the receiving connection, where
//! several subscriptions share one delivery.

use super::message::{Message, MessageKind};
use super::names::is_unique_name;
use std::fmt;

#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct MatchRule {
    pub sender: Option<String>,
    pub path: Option<String>,
    pub interface: Option<String>,
    pub member: Option<String>,
    pub arg0: Option<String>,
}

impl MatchRule {
    /// A rule for the given signal, optionally restricted to one sender.
    pub fn signal(sender: Option<&str>, path: Option<&str>, interface: &str, member: &str) -> Self {
        Self {
            sender: sender.map(str::to_string),
            path: path.map(str::to_string),
            interface: Some(interface.to_string()),
            member: Some(member.to_string()),
            arg0: None,
        }
    }

    pub fn with_arg0(mut self, arg0: &str) -> Self {
        self.arg0 = Some(arg0.to_string());
        self
    }

    /// Parse the string form. Unknown keys are ignored; a `type` other
    /// than `signal` is rejected.
    pub fn parse(text: &str) -> Option<Self> {
        let mut rule = MatchRule::default();
        for pair in text.split(',').filter(|p| !p.trim().is_empty()) {
            let (key, value) = pair.split_once('=')?;
            let value = value.trim().strip_prefix('\'')?.strip_suffix('\'')?.to_string();
            match key.trim() {
                "type" if value != "signal" => return None,
                "sender" => rule.sender = Some(value),
                "path" => rule.path = Some(value),
                "interface" => rule.interface = Some(value),
                "member" => rule.member = Some(value),
                "arg0" => rule.arg0 = Some(value),
                _ => {}
            }
        }
        Some(rule)
    }

    /// Check a message against the rule. Well-known sender names are
    /// resolved to their current owner with `owner_of`.
    pub fn matches(&self, message: &Message, owner_of: impl Fn(&str) -> Option<String>) -> bool {
        if message.kind != MessageKind::Signal {
            return false;
        }
        if let Some(sender) = &self.sender {
            let actual = message.sender();
            let sender_matches = sender == actual
                || (!is_unique_name(sender) && owner_of(sender).as_deref() == Some(actual));
            if !sender_matches {
                return false;
            }
        }
        let field_matches = |expected: &Option<String>, actual: &str| {
            expected.as_deref().is_none_or(|e| e == actual)
        };
        if !field_matches(&self.path, message.path())
            || !field_matches(&self.interface, message.interface())
            || !field_matches(&self.member, message.member())
        {
            return false;
        }
        match &self.arg0 {
            Some(arg0) => message.body.first().and_then(|v| v.as_str()) == Some(arg0.as_str()),
            None => true,
        }
    }
}

impl fmt::Display for MatchRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "type='signal'")?;
        let fields = [
            ("sender", &self.sender),
            ("path", &self.path),
            ("interface", &self.interface),
            ("member", &self.member),
            ("arg0", &self.arg0),
        ];
        for (key, value) in fields {
            if let Some(value) = value {
                write!(f, ",{}='{}'", key, value)?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::value::Value;

    fn changed(sender: &str, arg0: &str) -> Message {
        let mut msg = Message::signal("/org/x", "org.x.Iface", "Changed", vec![Value::from(arg0)]);
        msg.sender = Some(sender.to_string());
        msg
    }

    #[test]
    fn test_string_form_round_trip() {
        let rule = MatchRule::signal(Some("org.x"), None, "org.x.Iface", "Changed").with_arg0("a");
        let text = rule.to_string();
        assert_eq!(
            text,
            "type='signal',sender='org.x',interface='org.x.Iface',member='Changed',arg0='a'"
        );
        assert_eq!(MatchRule::parse(&text), Some(rule));
        assert_eq!(MatchRule::parse("type='method_call'"), None);
    }

    #[test]
    fn test_sender_resolved_through_owner() {
        let rule = MatchRule::signal(Some("org.x"), None, "org.x.Iface", "Changed");
        let owner = |name: &str| (name == "org.x").then(|| ":1.3".to_string());
        assert!(rule.matches(&changed(":1.3", "a"), owner));
        assert!(!rule.matches(&changed(":1.4", "a"), owner));
    }

    #[test]
    fn test_arg0_and_member_filter() {
        let rule = MatchRule::signal(None, Some("/org/x"), "org.x.Iface", "Changed").with_arg0("b");
        assert!(!rule.matches(&changed(":1.3", "a"), |_| None));
        assert!(rule.matches(&changed(":1.3", "b"), |_| None));

        let other = MatchRule::signal(None, None, "org.x.Iface", "Other");
        assert!(!other.matches(&changed(":1.3", "b"), |_| None));
    }
}
