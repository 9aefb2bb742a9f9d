//! Remote object specifications.
//!
//! A specification lists, per interface, the methods, properties and signals
//! an object exposes. Servers derive it from their interface tables; clients
//! receive it once through `Introspect` and keep it for the life of the proxy.

use super::error::BusError;
use super::names::{INTROSPECTABLE_INTERFACE, PEER_INTERFACE, PROPERTIES_INTERFACE};
use super::signature::parse_signature;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MethodSpec {
    pub name: String,
    pub in_type: String,
    pub out_type: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PropertySpec {
    pub name: String,
    #[serde(rename = "type")]
    pub type_signature: String,
    pub readable: bool,
    pub writable: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignalSpec {
    pub name: String,
    #[serde(rename = "type")]
    pub signature: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InterfaceSpec {
    pub name: String,
    #[serde(default)]
    pub methods: Vec<MethodSpec>,
    #[serde(default)]
    pub properties: Vec<PropertySpec>,
    #[serde(default)]
    pub signals: Vec<SignalSpec>,
}

/// One member of an interface.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemberSpec<'a> {
    Method(&'a MethodSpec),
    Property(&'a PropertySpec),
    Signal(&'a SignalSpec),
}

impl InterfaceSpec {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            methods: Vec::new(),
            properties: Vec::new(),
            signals: Vec::new(),
        }
    }

    pub fn member(&self, name: &str) -> Option<MemberSpec<'_>> {
        if let Some(method) = self.methods.iter().find(|m| m.name == name) {
            return Some(MemberSpec::Method(method));
        }
        if let Some(property) = self.properties.iter().find(|p| p.name == name) {
            return Some(MemberSpec::Property(property));
        }
        self.signals
            .iter()
            .find(|s| s.name == name)
            .map(MemberSpec::Signal)
    }

    pub fn member_names(&self) -> impl Iterator<Item = &str> {
        self.methods
            .iter()
            .map(|m| m.name.as_str())
            .chain(self.properties.iter().map(|p| p.name.as_str()))
            .chain(self.signals.iter().map(|s| s.name.as_str()))
    }

    fn validate(&self) -> Result<(), BusError> {
        let mut seen = HashSet::new();
        for name in self.member_names() {
            if !seen.insert(name) {
                return Err(BusError::InvalidSpecification(format!(
                    "member {} is defined twice in {}",
                    name, self.name
                )));
            }
        }

        let signatures = self
            .methods
            .iter()
            .flat_map(|m| [m.in_type.as_str(), m.out_type.as_str()])
            .chain(self.properties.iter().map(|p| p.type_signature.as_str()))
            .chain(self.signals.iter().map(|s| s.signature.as_str()));
        for signature in signatures {
            parse_signature(signature)
                .map_err(|e| BusError::InvalidSpecification(format!("{}: {}", self.name, e)))?;
        }

        for property in &self.properties {
            if parse_signature(&property.type_signature).map_or(0, |t| t.len()) != 1 {
                return Err(BusError::InvalidSpecification(format!(
                    "property {}.{} must have a single complete type",
                    self.name, property.name
                )));
            }
        }
        Ok(())
    }
}

/// The complete externally visible surface of an object.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectSpec {
    pub interfaces: Vec<InterfaceSpec>,
}

impl ObjectSpec {
    /// Build a specification from custom interfaces; the standard
    /// interfaces are prepended so they have the lowest priority.
    pub fn new(interfaces: Vec<InterfaceSpec>) -> Result<Self, BusError> {
        let mut all = standard_interfaces();
        let mut names: HashSet<String> = all.iter().map(|i| i.name.clone()).collect();
        for interface in interfaces {
            if !names.insert(interface.name.clone()) {
                return Err(BusError::InvalidSpecification(format!(
                    "interface {} is defined twice",
                    interface.name
                )));
            }
            all.push(interface);
        }
        let spec = Self { interfaces: all };
        spec.validate()?;
        Ok(spec)
    }

    pub fn validate(&self) -> Result<(), BusError> {
        self.interfaces.iter().try_for_each(InterfaceSpec::validate)
    }

    pub fn interface(&self, name: &str) -> Option<&InterfaceSpec> {
        self.interfaces.iter().find(|i| i.name == name)
    }

    /// Map every member name to the interface that provides it; interfaces
    /// defined later win over earlier ones.
    pub fn priority_map(&self) -> HashMap<String, String> {
        let mut map = HashMap::new();
        for interface in &self.interfaces {
            for member in interface.member_names() {
                map.insert(member.to_string(), interface.name.clone());
            }
        }
        map
    }

    pub fn to_json(&self) -> Result<String, BusError> {
        serde_json::to_string(self).map_err(|e| BusError::InvalidSpecification(e.to_string()))
    }

    pub fn from_json(text: &str) -> Result<Self, BusError> {
        let spec: Self = serde_json::from_str(text)
            .map_err(|e| BusError::InvalidSpecification(e.to_string()))?;
        spec.validate()?;
        Ok(spec)
    }
}

fn method(name: &str, in_type: &str, out_type: &str) -> MethodSpec {
    MethodSpec {
        name: name.to_string(),
        in_type: in_type.to_string(),
        out_type: out_type.to_string(),
    }
}

/// The interfaces every published object implements.
pub fn standard_interfaces() -> Vec<InterfaceSpec> {
    vec![
        InterfaceSpec {
            name: PEER_INTERFACE.to_string(),
            methods: vec![method("Ping", "", ""), method("GetMachineId", "", "s")],
            properties: Vec::new(),
            signals: Vec::new(),
        },
        InterfaceSpec {
            name: INTROSPECTABLE_INTERFACE.to_string(),
            methods: vec![method("Introspect", "", "s")],
            properties: Vec::new(),
            signals: Vec::new(),
        },
        InterfaceSpec {
            name: PROPERTIES_INTERFACE.to_string(),
            methods: vec![
                method("Get", "ss", "v"),
                method("Set", "ssv", ""),
                method("GetAll", "s", "a{sv}"),
            ],
            properties: Vec::new(),
            signals: vec![SignalSpec {
                name: "PropertiesChanged".to_string(),
                signature: "sa{sv}as".to_string(),
            }],
        },
    ]
}
