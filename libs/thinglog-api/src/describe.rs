use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Self-description of a service attached to the bus.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceDescription {
    #[serde(rename = "id")]
    pub service_id: String,
    pub device_type: String,
    pub title: String,
    pub description: String,
    #[serde(default)]
    pub properties: BTreeMap<String, PropertyDescription>,
}

/// A single advertised attribute of a service.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PropertyDescription {
    pub title: String,
    pub description: String,
    /// JSON type name of `value` ("string", "boolean", ...).
    #[serde(rename = "type")]
    pub data_type: String,
    pub value: serde_json::Value,
}

impl ServiceDescription {
    pub fn new(
        service_id: impl Into<String>,
        device_type: impl Into<String>,
        title: impl Into<String>,
        description: impl Into<String>,
    ) -> Self {
        Self {
            service_id: service_id.into(),
            device_type: device_type.into(),
            title: title.into(),
            description: description.into(),
            properties: BTreeMap::new(),
        }
    }

    /// Add a string attribute.
    pub fn with_string_property(
        mut self,
        key: impl Into<String>,
        title: impl Into<String>,
        description: impl Into<String>,
        value: impl Into<String>,
    ) -> Self {
        self.properties.insert(
            key.into(),
            PropertyDescription {
                title: title.into(),
                description: description.into(),
                data_type: "string".into(),
                value: serde_json::Value::String(value.into()),
            },
        );
        self
    }

    /// Serialized form published on the bus.
    pub fn to_json(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }
}
