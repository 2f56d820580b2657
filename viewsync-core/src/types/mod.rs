/*
    types - Declared property types and the registry that describes them

    The registry is an external collaborator: something else parses the
    component spec files. The engine only needs, per property name, the
    declared type, default value, access level, protecting rule and
    attach-order dependencies.
*/

mod capability;

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::collections::BTreeMap;

use crate::access::{AccessLevel, PathSegment};
use crate::error::{SyncError, SyncResult};

pub use capability::json_kind;

/// Shape of a declared type
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum TypeKind {
    Any,
    Boolean,
    Number,
    String,
    Array {
        element: Box<PropertyType>,
    },
    Object {
        #[serde(default)]
        fields: BTreeMap<String, PropertyType>,
        /// Type of keys not listed in `fields`
        #[serde(default, skip_serializing_if = "Option::is_none")]
        other: Option<Box<PropertyType>>,
    },
}

/// A declared type plus its own (not computed) access level
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PropertyType {
    #[serde(flatten)]
    pub kind: TypeKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub access: Option<AccessLevel>,
}

impl PropertyType {
    pub fn new(kind: TypeKind) -> Self {
        Self { kind, access: None }
    }

    pub fn any() -> Self {
        Self::new(TypeKind::Any)
    }

    pub fn boolean() -> Self {
        Self::new(TypeKind::Boolean)
    }

    pub fn number() -> Self {
        Self::new(TypeKind::Number)
    }

    pub fn string() -> Self {
        Self::new(TypeKind::String)
    }

    pub fn array_of(element: PropertyType) -> Self {
        Self::new(TypeKind::Array {
            element: Box::new(element),
        })
    }

    pub fn object<I, K>(fields: I) -> Self
    where
        I: IntoIterator<Item = (K, PropertyType)>,
        K: Into<String>,
    {
        Self::new(TypeKind::Object {
            fields: fields.into_iter().map(|(k, v)| (k.into(), v)).collect(),
            other: None,
        })
    }

    pub fn with_access(mut self, level: AccessLevel) -> Self {
        self.access = Some(level);
        self
    }

    pub fn with_other_fields(mut self, other: PropertyType) -> Self {
        if let TypeKind::Object { other: slot, .. } = &mut self.kind {
            *slot = Some(Box::new(other));
        }
        self
    }

    /// Short tag sent to the peer alongside changed values
    pub fn tag(&self) -> &'static str {
        match self.kind {
            TypeKind::Any => "any",
            TypeKind::Boolean => "boolean",
            TypeKind::Number => "number",
            TypeKind::String => "string",
            TypeKind::Array { .. } => "array",
            TypeKind::Object { .. } => "object",
        }
    }

    /// Declared type of an array element
    pub fn element_type(&self) -> Option<&PropertyType> {
        match &self.kind {
            TypeKind::Array { element } => Some(element),
            _ => None,
        }
    }

    /// Declared type of an object entry
    pub fn field_type(&self, key: &str) -> Option<&PropertyType> {
        match &self.kind {
            TypeKind::Object { fields, other } => fields.get(key).or(other.as_deref()),
            _ => None,
        }
    }

    pub fn child(&self, segment: &PathSegment) -> Option<&PropertyType> {
        match segment {
            PathSegment::Index(_) => self.element_type(),
            PathSegment::Key(key) => self.field_type(key),
        }
    }
}

/// Attach-order dependencies of a property
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Dependencies {
    #[default]
    None,
    On(Vec<String>),
    /// Attached after everything else
    All,
}

/// A property that, while at `blocking_value`, blocks peer mutations
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProtectingRule {
    pub blocking_value: JsonValue,
    /// `None` protects every other property
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub protects: Option<Vec<String>>,
}

impl ProtectingRule {
    pub fn blocking_on(value: JsonValue) -> Self {
        Self {
            blocking_value: value,
            protects: None,
        }
    }

    pub fn protecting<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.protects = Some(names.into_iter().map(Into::into).collect());
        self
    }

    pub fn covers(&self, name: &str) -> bool {
        match &self.protects {
            None => true,
            Some(names) => names.iter().any(|n| n == name),
        }
    }
}

/// Everything the engine needs to know about one property
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PropertyDescription {
    pub name: String,
    #[serde(rename = "type")]
    pub ty: PropertyType,
    #[serde(default)]
    pub default_value: JsonValue,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub protecting: Option<ProtectingRule>,
    /// Controls visibility of its owner; always flushed
    #[serde(default)]
    pub visibility: bool,
    #[serde(default)]
    pub depends_on: Dependencies,
}

impl PropertyDescription {
    pub fn new(name: impl Into<String>, ty: PropertyType) -> Self {
        Self {
            name: name.into(),
            ty,
            default_value: JsonValue::Null,
            protecting: None,
            visibility: false,
            depends_on: Dependencies::None,
        }
    }

    pub fn default_value(mut self, value: JsonValue) -> Self {
        self.default_value = value;
        self
    }

    pub fn access(mut self, level: AccessLevel) -> Self {
        self.ty.access = Some(level);
        self
    }

    pub fn protecting(mut self, rule: ProtectingRule) -> Self {
        self.protecting = Some(rule);
        self
    }

    pub fn visibility(mut self) -> Self {
        self.visibility = true;
        self
    }

    pub fn depends_on(mut self, deps: Dependencies) -> Self {
        self.depends_on = deps;
        self
    }

    pub fn is_protecting(&self) -> bool {
        self.protecting.is_some()
    }
}

/// Lookup from property name to its declaration
pub trait TypeRegistry: Send + Sync {
    fn describe(&self, name: &str) -> Option<&PropertyDescription>;

    /// All declarations, in a stable order
    fn descriptions(&self) -> Vec<&PropertyDescription>;
}

/// In-memory registry, typically built once per component type
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StaticTypeRegistry {
    properties: BTreeMap<String, PropertyDescription>,
}

impl StaticTypeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, description: PropertyDescription) -> Self {
        self.insert(description);
        self
    }

    pub fn insert(&mut self, description: PropertyDescription) {
        self.properties
            .insert(description.name.clone(), description);
    }

    /// Parse a JSON list of property descriptions
    pub fn from_json(raw: &str) -> SyncResult<Self> {
        let descriptions: Vec<PropertyDescription> = serde_json::from_str(raw)?;
        let mut registry = Self::new();
        for description in descriptions {
            if registry.properties.contains_key(&description.name) {
                return Err(SyncError::MalformedUpdate(format!(
                    "duplicate property declaration '{}'",
                    description.name
                )));
            }
            registry.insert(description);
        }
        Ok(registry)
    }

    pub fn len(&self) -> usize {
        self.properties.len()
    }

    pub fn is_empty(&self) -> bool {
        self.properties.is_empty()
    }
}

impl TypeRegistry for StaticTypeRegistry {
    fn describe(&self, name: &str) -> Option<&PropertyDescription> {
        self.properties.get(name)
    }

    fn descriptions(&self) -> Vec<&PropertyDescription> {
        self.properties.values().collect()
    }
}
