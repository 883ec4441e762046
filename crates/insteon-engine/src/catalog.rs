//! Feature templates and device type definitions.
//!
//! A catalog is loaded from JSON of the form
//!
//! ```json
//! {
//!   "feature_templates": [ { "name": "GenericSwitch", "message_handlers": [ ... ] } ],
//!   "device_types": [ { "product_key": "F00.00.01", "features": [ ... ] } ]
//! }
//! ```
//!
//! Each definition is parsed and validated on its own. A broken definition
//! is reported in the [`LoadReport`] and skipped; the rest of the file still
//! loads. Only a document that is not JSON at all fails the whole load.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Deserializer, Serialize};
use tracing::{debug, info, warn};

use crate::config::parse_timeout;
use crate::error::ConfigError;
use crate::feature::MessageKey;
use crate::state::{CommandKind, StateChangeType};

const BUILTIN_CATALOG: &str = include_str!("../data/device_types.json");

/// Handler kind plus string parameters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandlerSpec {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, deserialize_with = "deserialize_params")]
    pub params: BTreeMap<String, String>,
}

impl HandlerSpec {
    pub fn new(kind: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            params: BTreeMap::new(),
        }
    }

    pub fn with_param(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.params.insert(name.into(), value.into());
        self
    }
}

/// Parameter values may be written as JSON strings, numbers or booleans.
#[derive(Deserialize)]
#[serde(untagged)]
enum ParamValue {
    Str(String),
    Int(i64),
    Float(f64),
    Bool(bool),
}

impl fmt::Display for ParamValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParamValue::Str(s) => write!(f, "{}", s),
            ParamValue::Int(i) => write!(f, "{}", i),
            ParamValue::Float(v) => write!(f, "{}", v),
            ParamValue::Bool(b) => write!(f, "{}", b),
        }
    }
}

fn deserialize_params<'de, D>(deserializer: D) -> Result<BTreeMap<String, String>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = BTreeMap::<String, ParamValue>::deserialize(deserializer)?;
    Ok(raw.into_iter().map(|(k, v)| (k, v.to_string())).collect())
}

/// Message handler bound to a message key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageHandlerEntry {
    /// `"0x11"` for direct traffic, `"bcast:0x11"` for broadcast traffic
    pub key: String,
    #[serde(flatten)]
    pub handler: HandlerSpec,
}

/// Reusable description of one feature.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureTemplate {
    #[serde(default)]
    pub name: String,

    /// Ack timeout, e.g. `"6000"`, `"250ms"` or `"3s"`
    #[serde(default)]
    pub timeout: Option<String>,

    /// Status features see every inbound message
    #[serde(default)]
    pub status: bool,

    #[serde(default)]
    pub state_change: StateChangeType,

    #[serde(default = "default_message_handler")]
    pub default_message_handler: HandlerSpec,

    #[serde(default = "default_command_handler")]
    pub default_command_handler: HandlerSpec,

    #[serde(default)]
    pub message_handlers: Vec<MessageHandlerEntry>,

    /// Command kind name (`"OnOffType"`, `"PercentType"`, ...) to handler
    #[serde(default)]
    pub command_handlers: BTreeMap<String, HandlerSpec>,

    #[serde(default)]
    pub poll_handler: Option<HandlerSpec>,
}

fn default_message_handler() -> HandlerSpec {
    HandlerSpec::new("DefaultMsgHandler")
}

fn default_command_handler() -> HandlerSpec {
    HandlerSpec::new("NoOpCommandHandler")
}

impl FeatureTemplate {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            timeout: None,
            status: false,
            state_change: StateChangeType::default(),
            default_message_handler: default_message_handler(),
            default_command_handler: default_command_handler(),
            message_handlers: Vec::new(),
            command_handlers: BTreeMap::new(),
            poll_handler: None,
        }
    }

    /// Parsed ack timeout, `None` when the template uses the engine default.
    pub fn ack_timeout(&self) -> Result<Option<Duration>, ConfigError> {
        match &self.timeout {
            None => Ok(None),
            Some(raw) => parse_timeout(raw)
                .map(Some)
                .ok_or_else(|| ConfigError::InvalidTimeout(raw.clone())),
        }
    }

    /// Message handlers with their keys parsed.
    pub fn keyed_message_handlers(&self) -> Result<Vec<(MessageKey, &HandlerSpec)>, ConfigError> {
        self.message_handlers
            .iter()
            .map(|entry| Ok((MessageKey::from_str(&entry.key)?, &entry.handler)))
            .collect()
    }

    /// Command handlers with their kinds parsed.
    pub fn keyed_command_handlers(&self) -> Result<Vec<(CommandKind, &HandlerSpec)>, ConfigError> {
        self.command_handlers
            .iter()
            .map(|(kind, spec)| {
                let kind = CommandKind::from_str(kind)
                    .map_err(|_| ConfigError::InvalidCommandKind(kind.clone()))?;
                Ok((kind, spec))
            })
            .collect()
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.name.trim().is_empty() {
            return Err(ConfigError::MissingAttribute {
                attribute: "name".to_string(),
                context: "feature template".to_string(),
            });
        }
        self.ack_timeout()?;
        self.keyed_message_handlers()?;
        self.keyed_command_handlers()?;
        Ok(())
    }
}

/// A named feature of a device type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeatureRef {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub template: String,
    #[serde(default, deserialize_with = "deserialize_params")]
    pub params: BTreeMap<String, String>,
}

/// A feature whose inbound messages are also routed to its member features.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeatureGroupRef {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub template: String,
    #[serde(default, deserialize_with = "deserialize_params")]
    pub params: BTreeMap<String, String>,
    /// Names of member features, in the same device type
    #[serde(default)]
    pub features: Vec<String>,
}

/// What a product is made of.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceTypeDefinition {
    #[serde(default)]
    pub product_key: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    /// Sleeps between transmissions and only listens right after one
    #[serde(default)]
    pub battery_powered: bool,
    #[serde(default)]
    pub features: Vec<FeatureRef>,
    #[serde(default)]
    pub feature_groups: Vec<FeatureGroupRef>,
}

impl DeviceTypeDefinition {
    fn validate(&self, templates: &HashMap<String, FeatureTemplate>) -> Result<(), ConfigError> {
        if self.product_key.trim().is_empty() {
            return Err(ConfigError::MissingAttribute {
                attribute: "product_key".to_string(),
                context: "device type".to_string(),
            });
        }
        let context = format!("device type {}", self.product_key);
        let mut names = HashSet::new();
        let entries = self
            .features
            .iter()
            .map(|f| (&f.name, &f.template))
            .chain(self.feature_groups.iter().map(|g| (&g.name, &g.template)));
        for (name, template) in entries {
            if name.trim().is_empty() {
                return Err(ConfigError::MissingAttribute {
                    attribute: "name".to_string(),
                    context: context.clone(),
                });
            }
            if template.trim().is_empty() {
                return Err(ConfigError::MissingAttribute {
                    attribute: "template".to_string(),
                    context: format!("{} feature {}", context, name),
                });
            }
            if !names.insert(name.as_str()) {
                return Err(ConfigError::DuplicateName(format!("{} in {}", name, context)));
            }
            if !templates.contains_key(template) {
                return Err(ConfigError::UnknownTemplate {
                    template: template.clone(),
                    product_key: self.product_key.clone(),
                });
            }
        }
        Ok(())
    }
}

/// One definition that failed to load.
#[derive(Debug)]
pub struct LoadIssue {
    /// Which definition, e.g. `"feature template #3"`
    pub context: String,
    pub error: ConfigError,
}

/// Outcome of loading one catalog document.
#[derive(Debug, Default)]
pub struct LoadReport {
    pub templates_loaded: usize,
    pub device_types_loaded: usize,
    pub issues: Vec<LoadIssue>,
}

impl LoadReport {
    pub fn is_clean(&self) -> bool {
        self.issues.is_empty()
    }

    fn issue(&mut self, context: String, error: ConfigError) {
        warn!("Skipping {}: {}", context, error);
        self.issues.push(LoadIssue { context, error });
    }
}

#[derive(Deserialize)]
struct RawCatalog {
    #[serde(default)]
    feature_templates: Vec<serde_json::Value>,
    #[serde(default)]
    device_types: Vec<serde_json::Value>,
}

/// All known templates and device types.
#[derive(Debug, Clone, Default)]
pub struct TemplateCatalog {
    templates: HashMap<String, FeatureTemplate>,
    device_types: HashMap<String, DeviceTypeDefinition>,
}

impl TemplateCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// The definitions shipped with the crate.
    pub fn builtin() -> Self {
        let mut catalog = Self::new();
        match catalog.load_str(BUILTIN_CATALOG) {
            Ok(report) => debug!(
                "Loaded built-in catalog: {} templates, {} device types",
                report.templates_loaded, report.device_types_loaded
            ),
            Err(e) => warn!("Built-in catalog failed to load: {}", e),
        }
        catalog
    }

    pub fn load_file(&mut self, path: impl AsRef<Path>) -> Result<LoadReport, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)?;
        let report = self.load_str(&content)?;
        info!(
            "Loaded {}: {} templates, {} device types, {} issues",
            path.display(),
            report.templates_loaded,
            report.device_types_loaded,
            report.issues.len()
        );
        Ok(report)
    }

    /// Merge a JSON document into the catalog. Templates load before device
    /// types so a document may reference its own templates.
    ///
    /// A name already in the catalog, from this document or an earlier one,
    /// is reported as a duplicate and the existing definition is kept. Use
    /// [`add_template`](Self::add_template) or
    /// [`add_device_type`](Self::add_device_type) to replace one on purpose.
    pub fn load_str(&mut self, json: &str) -> Result<LoadReport, ConfigError> {
        let raw: RawCatalog = serde_json::from_str(json)?;
        let mut report = LoadReport::default();

        for (index, value) in raw.feature_templates.into_iter().enumerate() {
            let context = format!("feature template #{}", index);
            let template = match serde_json::from_value::<FeatureTemplate>(value) {
                Ok(template) => template,
                Err(e) => {
                    report.issue(context, e.into());
                    continue;
                }
            };
            if let Err(e) = template.validate() {
                report.issue(format!("{} ({})", context, template.name), e);
                continue;
            }
            if self.templates.contains_key(&template.name) {
                report.issue(context, ConfigError::DuplicateName(template.name));
                continue;
            }
            self.templates.insert(template.name.clone(), template);
            report.templates_loaded += 1;
        }

        for (index, value) in raw.device_types.into_iter().enumerate() {
            let context = format!("device type #{}", index);
            let definition = match serde_json::from_value::<DeviceTypeDefinition>(value) {
                Ok(definition) => definition,
                Err(e) => {
                    report.issue(context, e.into());
                    continue;
                }
            };
            if let Err(e) = definition.validate(&self.templates) {
                report.issue(context, e);
                continue;
            }
            if self.device_types.contains_key(&definition.product_key) {
                report.issue(context, ConfigError::DuplicateName(definition.product_key));
                continue;
            }
            self.device_types
                .insert(definition.product_key.clone(), definition);
            report.device_types_loaded += 1;
        }

        Ok(report)
    }

    /// Insert a template, replacing one of the same name.
    pub fn add_template(&mut self, template: FeatureTemplate) {
        self.templates.insert(template.name.clone(), template);
    }

    /// Insert a device type, replacing one with the same product key.
    pub fn add_device_type(&mut self, definition: DeviceTypeDefinition) {
        self.device_types
            .insert(definition.product_key.clone(), definition);
    }

    pub fn template(&self, name: &str) -> Option<&FeatureTemplate> {
        self.templates.get(name)
    }

    pub fn device_type(&self, product_key: &str) -> Option<&DeviceTypeDefinition> {
        self.device_types.get(product_key)
    }

    /// Product keys, sorted.
    pub fn product_keys(&self) -> Vec<&str> {
        let mut keys: Vec<&str> = self.device_types.keys().map(String::as_str).collect();
        keys.sort_unstable();
        keys
    }

    pub fn template_count(&self) -> usize {
        self.templates.len()
    }

    pub fn device_type_count(&self) -> usize {
        self.device_types.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"{
        "feature_templates": [
            {
                "name": "Switch",
                "timeout": "3s",
                "message_handlers": [
                    { "key": "0x11", "type": "LightOnSwitchHandler", "params": { "button": 1 } },
                    { "key": "bcast:0x11", "type": "LightOnSwitchHandler" }
                ],
                "command_handlers": { "OnOffType": { "type": "LightOnOffCommandHandler" } },
                "poll_handler": { "type": "DefaultPollHandler" }
            },
            { "name": "Broken", "timeout": "soon" },
            { "timeout": "1s" },
            { "name": "Switch" }
        ],
        "device_types": [
            { "product_key": "X1", "features": [ { "name": "light", "template": "Switch" } ] },
            { "product_key": "X2", "features": [ { "name": "light", "template": "Missing" } ] },
            { "product_key": "X3", "features": [
                { "name": "a", "template": "Switch" },
                { "name": "a", "template": "Switch" }
            ] }
        ]
    }"#;

    #[test]
    fn test_load_reports_each_bad_definition() {
        let mut catalog = TemplateCatalog::new();
        let report = catalog.load_str(SAMPLE).unwrap();

        assert_eq!(report.templates_loaded, 1);
        assert_eq!(report.device_types_loaded, 1);
        assert_eq!(report.issues.len(), 5);
        assert!(matches!(report.issues[0].error, ConfigError::InvalidTimeout(_)));
        assert!(matches!(report.issues[1].error, ConfigError::MissingAttribute { .. }));
        assert!(matches!(report.issues[2].error, ConfigError::DuplicateName(_)));
        assert!(matches!(report.issues[3].error, ConfigError::UnknownTemplate { .. }));
        assert!(matches!(report.issues[4].error, ConfigError::DuplicateName(_)));

        assert!(catalog.device_type("X1").is_some());
        assert!(catalog.device_type("X2").is_none());
    }

    #[test]
    fn test_later_document_cannot_redefine_names() {
        let mut catalog = TemplateCatalog::new();
        catalog.load_str(SAMPLE).unwrap();

        let report = catalog
            .load_str(
                r#"{
                    "feature_templates": [ { "name": "Switch", "timeout": "9s" } ],
                    "device_types": [
                        { "product_key": "X1", "features": [ { "name": "other", "template": "Switch" } ] }
                    ]
                }"#,
            )
            .unwrap();

        assert_eq!(report.templates_loaded, 0);
        assert_eq!(report.device_types_loaded, 0);
        assert_eq!(report.issues.len(), 2);
        assert!(matches!(
            &report.issues[0].error,
            ConfigError::DuplicateName(name) if name == "Switch"
        ));
        assert!(matches!(
            &report.issues[1].error,
            ConfigError::DuplicateName(key) if key == "X1"
        ));

        let template = catalog.template("Switch").unwrap();
        assert_eq!(template.ack_timeout().unwrap(), Some(Duration::from_secs(3)));
        assert_eq!(catalog.device_type("X1").unwrap().features[0].name, "light");
    }

    #[test]
    fn test_builtin_names_cannot_be_redefined_by_a_file() {
        let mut catalog = TemplateCatalog::builtin();
        let key = catalog.product_keys()[0].to_string();
        let json = format!(r#"{{ "device_types": [ {{ "product_key": "{}" }} ] }}"#, key);

        let report = catalog.load_str(&json).unwrap();
        assert!(!report.is_clean());
        assert!(matches!(
            &report.issues[0].error,
            ConfigError::DuplicateName(k) if *k == key
        ));
    }

    #[test]
    fn test_oversized_timeout_is_rejected() {
        let mut catalog = TemplateCatalog::new();
        let json = r#"{
            "feature_templates": [ { "name": "Slow", "timeout": "18446744073709551615s" } ]
        }"#;
        let report = catalog.load_str(json).unwrap();
        assert_eq!(report.templates_loaded, 0);
        assert!(matches!(report.issues[0].error, ConfigError::InvalidTimeout(_)));
    }

    #[test]
    fn test_template_accessors() {
        let mut catalog = TemplateCatalog::new();
        catalog.load_str(SAMPLE).unwrap();
        let template = catalog.template("Switch").unwrap();

        assert_eq!(template.ack_timeout().unwrap(), Some(Duration::from_secs(3)));
        let keyed = template.keyed_message_handlers().unwrap();
        assert_eq!(keyed[0].0, MessageKey::Command(0x11));
        assert_eq!(keyed[1].0, MessageKey::Broadcast(0x11));
        assert_eq!(keyed[0].1.params.get("button").map(String::as_str), Some("1"));
        assert_eq!(template.default_message_handler.kind, "DefaultMsgHandler");

        let commands = template.keyed_command_handlers().unwrap();
        assert_eq!(commands[0].0, CommandKind::OnOff);
    }

    #[test]
    fn test_not_json_fails_loudly() {
        let mut catalog = TemplateCatalog::new();
        assert!(matches!(
            catalog.load_str("feature_templates: []"),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn test_builtin_catalog_is_clean() {
        let mut catalog = TemplateCatalog::new();
        let report = catalog.load_str(BUILTIN_CATALOG).unwrap();
        for issue in &report.issues {
            eprintln!("{}: {}", issue.context, issue.error);
        }
        assert!(report.is_clean());
        assert!(catalog.device_type_count() > 0);
    }
}
