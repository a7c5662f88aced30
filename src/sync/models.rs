//! Sync Data Models - Client-Side Structures
//!
//! Data exchanged between the preferences façade, the offline queue and the
//! sync server:
//! - PreferenceValue / PreferenceSet: the flat, timestamped settings bundle
//! - SyncRecord: the unit pushed to and pulled from the server
//! - DeviceIdentity: stable per-install identifier (diagnostics only)
//! - ValidationError: rejected keys and values

use crate::store::{LocalStore, DEVICE_KEY};
use chrono::{DateTime, Utc};
use regex_lite::Regex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::OnceLock;

// ============================================================================
// Preference Keys & Schema
// ============================================================================

/// Known preference keys
pub mod keys {
    pub const COLOR: &str = "color";
    pub const INTENSITY: &str = "intensity";
    pub const SENSITIVITY: &str = "sensitivity";
    pub const SHAPE: &str = "shape";
    pub const THEME: &str = "theme";
    pub const GLOW_ENABLED: &str = "glowEnabled";
    pub const MIRROR_MODE: &str = "mirrorMode";
    pub const SHOW_FPS: &str = "showFps";
    pub const VOLUME: &str = "volume";
    pub const QUALITY: &str = "quality";
}

const SHAPES: &[&str] = &["circle", "bars", "wave", "spiral", "particles"];
const THEMES: &[&str] = &["dark", "light"];
const QUALITIES: &[&str] = &["low", "medium", "high", "ultra"];

enum Rule {
    Color,
    Range(f64, f64),
    OneOf(&'static [&'static str]),
    Flag,
}

enum Literal {
    Bool(bool),
    Number(f64),
    Text(&'static str),
}

struct FieldSpec {
    key: &'static str,
    rule: Rule,
    default: Literal,
}

const SCHEMA: &[FieldSpec] = &[
    FieldSpec { key: keys::COLOR, rule: Rule::Color, default: Literal::Text("#00d4ff") },
    FieldSpec { key: keys::INTENSITY, rule: Rule::Range(0.0, 2.0), default: Literal::Number(1.0) },
    FieldSpec { key: keys::SENSITIVITY, rule: Rule::Range(0.1, 5.0), default: Literal::Number(1.0) },
    FieldSpec { key: keys::SHAPE, rule: Rule::OneOf(SHAPES), default: Literal::Text("circle") },
    FieldSpec { key: keys::THEME, rule: Rule::OneOf(THEMES), default: Literal::Text("dark") },
    FieldSpec { key: keys::GLOW_ENABLED, rule: Rule::Flag, default: Literal::Bool(true) },
    FieldSpec { key: keys::MIRROR_MODE, rule: Rule::Flag, default: Literal::Bool(false) },
    FieldSpec { key: keys::SHOW_FPS, rule: Rule::Flag, default: Literal::Bool(false) },
    FieldSpec { key: keys::VOLUME, rule: Rule::Range(0.0, 1.0), default: Literal::Number(0.8) },
    FieldSpec { key: keys::QUALITY, rule: Rule::OneOf(QUALITIES), default: Literal::Text("high") },
];

fn field_spec(key: &str) -> Option<&'static FieldSpec> {
    SCHEMA.iter().find(|spec| spec.key == key)
}

fn color_pattern() -> Option<&'static Regex> {
    static PATTERN: OnceLock<Option<Regex>> = OnceLock::new();
    PATTERN
        .get_or_init(|| Regex::new(r"^#[0-9a-fA-F]{6}$").ok())
        .as_ref()
}

/// All keys the client knows how to validate, in schema order
pub fn known_keys() -> impl Iterator<Item = &'static str> {
    SCHEMA.iter().map(|spec| spec.key)
}

/// Check a single key/value pair against the schema
pub fn validate_entry(key: &str, value: &PreferenceValue) -> Result<(), ValidationError> {
    let spec = field_spec(key).ok_or_else(|| ValidationError::UnknownKey(key.to_string()))?;

    match (&spec.rule, value) {
        (Rule::Flag, PreferenceValue::Bool(_)) => Ok(()),
        (Rule::Range(min, max), PreferenceValue::Number(n)) => {
            if n.is_finite() && *n >= *min && *n <= *max {
                Ok(())
            } else {
                Err(ValidationError::OutOfRange {
                    key: key.to_string(),
                    value: *n,
                    min: *min,
                    max: *max,
                })
            }
        }
        (Rule::OneOf(allowed), PreferenceValue::Text(s)) => {
            if allowed.contains(&s.as_str()) {
                Ok(())
            } else {
                Err(ValidationError::NotAllowed {
                    key: key.to_string(),
                    value: s.clone(),
                })
            }
        }
        (Rule::Color, PreferenceValue::Text(s)) => {
            if color_pattern().is_some_and(|pattern| pattern.is_match(s)) {
                Ok(())
            } else {
                Err(ValidationError::InvalidColor {
                    key: key.to_string(),
                    value: s.clone(),
                })
            }
        }
        (rule, _) => Err(ValidationError::WrongType {
            key: key.to_string(),
            expected: match rule {
                Rule::Flag => "boolean",
                Rule::Range(..) => "number",
                Rule::OneOf(_) | Rule::Color => "string",
            },
        }),
    }
}

// ============================================================================
// Preference Values
// ============================================================================

/// A single setting value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PreferenceValue {
    Bool(bool),
    Number(f64),
    Text(String),
}

impl fmt::Display for PreferenceValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bool(b) => write!(f, "{}", b),
            Self::Number(n) => write!(f, "{}", n),
            Self::Text(s) => write!(f, "{}", s),
        }
    }
}

impl From<bool> for PreferenceValue {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

impl From<f64> for PreferenceValue {
    fn from(value: f64) -> Self {
        Self::Number(value)
    }
}

impl From<&str> for PreferenceValue {
    fn from(value: &str) -> Self {
        Self::Text(value.to_string())
    }
}

impl From<String> for PreferenceValue {
    fn from(value: String) -> Self {
        Self::Text(value)
    }
}

fn literal_value(literal: &Literal) -> PreferenceValue {
    match literal {
        Literal::Bool(b) => PreferenceValue::Bool(*b),
        Literal::Number(n) => PreferenceValue::Number(*n),
        Literal::Text(s) => PreferenceValue::Text((*s).to_string()),
    }
}

// ============================================================================
// Preference Set
// ============================================================================

/// Flat settings bundle with the time of its most recent local mutation
///
/// Serialized as one JSON object: every setting as a top-level field plus
/// `lastModified`. Keys the client does not know are carried through
/// untouched so newer clients' settings survive a round trip.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PreferenceSet {
    #[serde(flatten)]
    values: BTreeMap<String, PreferenceValue>,

    #[serde(rename = "lastModified")]
    last_modified: DateTime<Utc>,
}

impl PreferenceSet {
    /// Static defaults, stamped at the epoch so any real edit wins over them
    pub fn defaults() -> Self {
        let values = SCHEMA
            .iter()
            .map(|spec| (spec.key.to_string(), literal_value(&spec.default)))
            .collect();

        Self {
            values,
            last_modified: DateTime::<Utc>::default(),
        }
    }

    pub fn from_values(
        values: BTreeMap<String, PreferenceValue>,
        last_modified: DateTime<Utc>,
    ) -> Self {
        Self {
            values,
            last_modified,
        }
    }

    pub fn get(&self, key: &str) -> Option<&PreferenceValue> {
        self.values.get(key)
    }

    pub fn values(&self) -> &BTreeMap<String, PreferenceValue> {
        &self.values
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.values.keys().map(String::as_str)
    }

    pub fn last_modified(&self) -> DateTime<Utc> {
        self.last_modified
    }

    pub fn set_last_modified(&mut self, at: DateTime<Utc>) {
        self.last_modified = at;
    }

    /// Store a value without validation. Returns the previous value.
    pub fn insert(&mut self, key: impl Into<String>, value: PreferenceValue) -> Option<PreferenceValue> {
        self.values.insert(key.into(), value)
    }

    /// Advance `lastModified` to now, strictly past its previous value
    pub fn touch(&mut self) -> DateTime<Utc> {
        let now = Utc::now();
        self.last_modified = if now > self.last_modified {
            now
        } else {
            self.last_modified + chrono::Duration::milliseconds(1)
        };
        self.last_modified
    }

    /// Fill in defaults for any known key missing from this set
    pub fn fill_defaults(&mut self) {
        for field in SCHEMA {
            self.values
                .entry(field.key.to_string())
                .or_insert_with(|| literal_value(&field.default));
        }
    }

    /// Values equal, timestamps ignored
    pub fn same_values(&self, other: &PreferenceSet) -> bool {
        self.values == other.values
    }

    /// Keys whose value differs between the two sets (present on either side)
    pub fn changed_keys(&self, other: &PreferenceSet) -> BTreeSet<String> {
        self.values
            .keys()
            .chain(other.values.keys())
            .filter(|key| self.values.get(*key) != other.values.get(*key))
            .cloned()
            .collect()
    }

    /// Every known key must be present and valid. Unknown keys pass through.
    pub fn validate(&self) -> Result<(), ValidationError> {
        for field in SCHEMA {
            let value = self
                .values
                .get(field.key)
                .ok_or_else(|| ValidationError::MissingKey(field.key.to_string()))?;
            validate_entry(field.key, value)?;
        }
        Ok(())
    }
}

impl Default for PreferenceSet {
    fn default() -> Self {
        Self::defaults()
    }
}

// ============================================================================
// Sync Record
// ============================================================================

/// Unit exchanged with the sync server
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncRecord {
    pub preferences: PreferenceSet,

    /// Time of the most recent local mutation included in `preferences`
    pub timestamp: DateTime<Utc>,

    pub device_id: String,
}

impl SyncRecord {
    pub fn new(preferences: PreferenceSet, device_id: impl Into<String>) -> Self {
        Self {
            timestamp: preferences.last_modified(),
            preferences,
            device_id: device_id.into(),
        }
    }
}

// ============================================================================
// Device Identity
// ============================================================================

/// Stable per-install identity, used to attribute edits in conflict logs
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceIdentity {
    /// Unique device identifier (UUID v4)
    pub device_id: String,

    /// Device name (e.g., "studio-mac")
    pub device_name: String,

    pub platform: Platform,
}

impl DeviceIdentity {
    pub fn generate() -> Self {
        Self {
            device_id: uuid::Uuid::new_v4().to_string(),
            device_name: get_default_device_name(),
            platform: Platform::current(),
        }
    }

    /// Load the persisted identity or create and persist a new one
    pub fn load_or_create(store: &LocalStore) -> Self {
        if let Some(identity) = store.get::<DeviceIdentity>(DEVICE_KEY) {
            return identity;
        }

        let identity = Self::generate();
        if !store.set(DEVICE_KEY, &identity) {
            log::warn!("Device id {} could not be persisted; a new one will be generated next start",
                       identity.device_id);
        }
        log::info!("Generated device id {} ({})", identity.device_id, identity.device_name);
        identity
    }
}

/// Platform identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Platform {
    Windows,
    MacOS,
    Linux,
    Other,
}

impl Platform {
    /// Get current platform
    pub fn current() -> Self {
        if cfg!(target_os = "windows") {
            Platform::Windows
        } else if cfg!(target_os = "macos") {
            Platform::MacOS
        } else if cfg!(target_os = "linux") {
            Platform::Linux
        } else {
            Platform::Other
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Platform::Windows => "windows",
            Platform::MacOS => "macos",
            Platform::Linux => "linux",
            Platform::Other => "other",
        }
    }
}

/// Get default device name from hostname
fn get_default_device_name() -> String {
    hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| format!("{} device", Platform::current().as_str()))
}

// ============================================================================
// Error Types
// ============================================================================

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ValidationError {
    #[error("Unknown preference: {0}")]
    UnknownKey(String),

    #[error("Missing preference: {0}")]
    MissingKey(String),

    #[error("Preference {key} must be a {expected}")]
    WrongType { key: String, expected: &'static str },

    #[error("Preference {key} = {value} is outside {min}..={max}")]
    OutOfRange { key: String, value: f64, min: f64, max: f64 },

    #[error("Preference {key} does not accept '{value}'")]
    NotAllowed { key: String, value: String },

    #[error("Preference {key} is not a #rrggbb colour: '{value}'")]
    InvalidColor { key: String, value: String },
}

// ============================================================================
// Tests
// ============================================================================
