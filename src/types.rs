//! Device, status, command and event models exchanged with the SmartThings API
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

/// Component every status snapshot and default command targets
pub const MAIN_COMPONENT: &str = "main";

/// A device as listed by `GET /devices`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Device {
    pub device_id: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub label: Option<String>,
    #[serde(default)]
    pub manufacturer_name: Option<String>,
    /// Remaining fields (components, profile, location, ...) kept as returned
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Device {
    /// Label if set, otherwise the device name, otherwise the id
    pub fn display_name(&self) -> &str {
        self.label
            .as_deref()
            .or(self.name.as_deref())
            .unwrap_or(&self.device_id)
    }
}

/// One page of `GET /devices`
#[derive(Debug, Clone, Deserialize)]
pub(crate) struct DevicePage {
    #[serde(default)]
    pub items: Vec<Device>,
    #[serde(default, rename = "_links")]
    pub links: Option<PageLinks>,
}

#[derive(Debug, Clone, Deserialize)]
pub(crate) struct PageLinks {
    #[serde(default)]
    pub next: Option<Link>,
}

#[derive(Debug, Clone, Deserialize)]
pub(crate) struct Link {
    pub href: String,
}

/// Value record of a single attribute
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct AttributeState {
    #[serde(default)]
    pub value: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unit: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Status of one device component: capability id -> attribute name -> value record.
///
/// Capabilities are keyed by their fully-qualified id, so `switch` and
/// `custom.switch` never collide.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeviceStatus(pub BTreeMap<String, BTreeMap<String, AttributeState>>);

impl DeviceStatus {
    pub fn attribute(&self, capability: &str, attribute: &str) -> Option<&AttributeState> {
        self.0.get(capability)?.get(attribute)
    }

    /// Current value of `capability.attribute`, if reported
    pub fn value(&self, capability: &str, attribute: &str) -> Option<&Value> {
        self.attribute(capability, attribute).map(|a| &a.value)
    }

    /// Overwrite a single attribute value, creating the capability and attribute
    /// entries when they do not exist yet. Unit and timestamp are kept.
    pub fn set_value(&mut self, capability: &str, attribute: &str, value: Value) {
        self.0
            .entry(capability.to_string())
            .or_default()
            .entry(attribute.to_string())
            .or_default()
            .value = value;
    }
}

/// Body of `GET /devices/{id}/status`
#[derive(Debug, Clone, Deserialize)]
pub(crate) struct StatusResponse {
    #[serde(default)]
    pub components: BTreeMap<String, DeviceStatus>,
}

/// A command for `POST /devices/{id}/commands`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceCommand {
    pub component: String,
    pub capability: String,
    pub command: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub arguments: Vec<Value>,
}

impl DeviceCommand {
    /// Command on the `main` component without arguments
    pub fn new(capability: impl Into<String>, command: impl Into<String>) -> Self {
        Self {
            component: MAIN_COMPONENT.to_string(),
            capability: capability.into(),
            command: command.into(),
            arguments: Vec::new(),
        }
    }

    pub fn with_component(mut self, component: impl Into<String>) -> Self {
        self.component = component.into();
        self
    }

    pub fn with_argument(mut self, argument: impl Into<Value>) -> Self {
        self.arguments.push(argument.into());
        self
    }
}

/// A device attribute change delivered through the webhook
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceEvent {
    pub device_id: String,
    #[serde(default)]
    pub component_id: Option<String>,
    pub capability: String,
    pub attribute: String,
    pub value: Value,
}

impl DeviceEvent {
    /// Whether the event concerns the component status snapshots are built from
    pub fn is_main_component(&self) -> bool {
        self.component_id
            .as_deref()
            .map_or(true, |component| component == MAIN_COMPONENT)
    }
}
