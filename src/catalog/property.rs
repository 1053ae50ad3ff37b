use serde::Serialize;

use crate::driver::ObjectKind;

/// Type information the driver reports for a property.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum PropertyMetadata {
    Unknown,
    Boolean,
    UnsignedRange { min: u64, max: u64 },
    SignedRange { min: i64, max: i64 },
    Enum { entries: Vec<EnumEntry> },
    Bitmask,
    Blob,
    /// Refers to a mode-setting object, or to a framebuffer when `kind` is `None`.
    Object { kind: Option<ObjectKind> },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EnumEntry {
    pub value: u64,
    pub name: String,
}

/// What the driver reports for a single property id.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PropertyInfo {
    pub name: String,
    pub metadata: PropertyMetadata,
    pub mutable: bool,
    pub atomic: bool,
}

/// A property attached to an object, as it was when the catalog was fetched.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PropertyDescriptor {
    pub id: u32,
    /// Value at fetch time. Not kept up to date.
    pub value: u64,
    #[serde(flatten)]
    pub info: PropertyInfo,
}

impl PropertyDescriptor {
    pub fn name(&self) -> &str {
        &self.info.name
    }

    pub fn metadata(&self) -> &PropertyMetadata {
        &self.info.metadata
    }

    /// Name of the enum entry matching the fetched value, for enum properties.
    pub fn enum_value_name(&self) -> Option<&str> {
        match &self.info.metadata {
            PropertyMetadata::Enum { entries } => entries
                .iter()
                .find(|entry| entry.value == self.value)
                .map(|entry| entry.name.as_str()),
            _ => None,
        }
    }
}

/// The properties of one object.
///
/// Order carries no meaning. Lookups are a linear scan by exact, case-sensitive name: objects
/// have a few dozen properties at most, so no index is kept.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(transparent)]
pub struct PropertySet(Vec<PropertyDescriptor>);

impl PropertySet {
    pub fn new(properties: Vec<PropertyDescriptor>) -> Self {
        Self(properties)
    }

    /// Finds a property by name. O(n); the first match wins.
    pub fn find(&self, name: &str) -> Option<&PropertyDescriptor> {
        self.0.iter().find(|prop| prop.name() == name)
    }

    pub fn iter(&self) -> impl Iterator<Item = &PropertyDescriptor> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}
