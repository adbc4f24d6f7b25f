//! Feathers: named schemas with single inheritance.
//!
//! # Core Concepts
//!
//! - [`FeatherSpec`]: one entry of the server-sourced schema payload, as
//!   written (`inherits`, `properties`, flags).
//! - [`Feather`]: the materialised schema. Its property table already holds
//!   every ancestor property, with the nearest definition winning on name
//!   collision, and it lists the feathers that descend from it.
//!
//! Every chain ends at [`ROOT_FEATHER`]. Resolution happens once per load in
//! [`resolve_all`]; instances never walk the inheritance graph themselves.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::defaults::{marker_name, DefaultFactories};
use crate::error::SchemaError;

/// The feather every other feather ultimately inherits from.
pub const ROOT_FEATHER: &str = "Object";

/// A schema definition as received from the catalog service.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FeatherSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default)]
    pub description: String,
    /// Parent feather. `None` means [`ROOT_FEATHER`].
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub inherits: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub plural: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub module: Option<String>,
    #[serde(default)]
    pub is_child: bool,
    #[serde(default)]
    pub is_system: bool,
    #[serde(default)]
    pub is_fetch_on_startup: bool,
    #[serde(default)]
    pub properties: IndexMap<String, PropertySpec>,
}

/// A property definition as written in a schema payload.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PropertySpec {
    #[serde(default)]
    pub description: String,
    #[serde(rename = "type", default)]
    pub kind: TypeSpec,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub format: Option<String>,
    /// Literal value or a `"factory()"` marker.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<Value>,
    #[serde(default)]
    pub is_required: bool,
    #[serde(default)]
    pub is_read_only: bool,
}

/// Either a primitive type name or a relation object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TypeSpec {
    Primitive(String),
    Relation {
        relation: String,
        #[serde(rename = "parentOf", default, skip_serializing_if = "Option::is_none")]
        parent_of: Option<String>,
        #[serde(rename = "childOf", default, skip_serializing_if = "Option::is_none")]
        child_of: Option<String>,
    },
}

impl Default for TypeSpec {
    fn default() -> Self {
        Self::Primitive("string".to_string())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Primitive {
    String,
    Integer,
    Number,
    Boolean,
    Date,
    DateTime,
    Object,
    Array,
    Other(String),
}

impl Primitive {
    pub fn parse(s: &str) -> Self {
        match s {
            "string" => Self::String,
            "integer" => Self::Integer,
            "number" => Self::Number,
            "boolean" => Self::Boolean,
            "date" => Self::Date,
            "dateTime" => Self::DateTime,
            "object" => Self::Object,
            "array" => Self::Array,
            other => Self::Other(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Self::String => "string",
            Self::Integer => "integer",
            Self::Number => "number",
            Self::Boolean => "boolean",
            Self::Date => "date",
            Self::DateTime => "dateTime",
            Self::Object => "object",
            Self::Array => "array",
            Self::Other(name) => name,
        }
    }
}

/// Resolved property type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PropertyType {
    Primitive(Primitive),
    /// Weak reference to one record of `feather`.
    ToOne {
        feather: String,
        child_of: Option<String>,
    },
    /// Owned array of child records; `parent_of` names the back reference.
    ToMany { feather: String, parent_of: String },
}

impl PropertyType {
    fn from_spec(spec: &TypeSpec) -> Self {
        match spec {
            TypeSpec::Primitive(name) => Self::Primitive(Primitive::parse(name)),
            TypeSpec::Relation {
                relation,
                parent_of: Some(parent_of),
                ..
            } => Self::ToMany {
                feather: relation.clone(),
                parent_of: parent_of.clone(),
            },
            TypeSpec::Relation {
                relation, child_of, ..
            } => Self::ToOne {
                feather: relation.clone(),
                child_of: child_of.clone(),
            },
        }
    }

    /// Target feather for relation types.
    pub fn relation(&self) -> Option<&str> {
        match self {
            Self::Primitive(_) => None,
            Self::ToOne { feather, .. } | Self::ToMany { feather, .. } => Some(feather),
        }
    }

    /// Property on the related feather that points back here, if declared.
    pub fn back_reference(&self) -> Option<&str> {
        match self {
            Self::Primitive(_) => None,
            Self::ToOne { child_of, .. } => child_of.as_deref(),
            Self::ToMany { parent_of, .. } => Some(parent_of),
        }
    }

    /// Value used when a property declares no default.
    pub fn implicit_default(&self) -> Value {
        match self {
            Self::Primitive(Primitive::Boolean) => json!(false),
            Self::Primitive(Primitive::Integer | Primitive::Number) => json!(0),
            Self::Primitive(Primitive::Array) | Self::ToMany { .. } => json!([]),
            _ => Value::Null,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum DefaultValue {
    Literal(Value),
    /// Name of a [`DefaultFactories`] entry, evaluated at instance creation.
    Factory(String),
}

/// A property of a resolved feather.
#[derive(Debug, Clone, PartialEq)]
pub struct Property {
    pub name: String,
    pub description: String,
    pub kind: PropertyType,
    pub format: Option<String>,
    pub default: DefaultValue,
    pub is_required: bool,
    pub is_read_only: bool,
    /// Feather whose definition won for this property.
    pub declared_by: String,
}

/// A fully resolved schema.
#[derive(Debug, Clone, PartialEq)]
pub struct Feather {
    pub name: String,
    pub description: String,
    pub inherits: Option<String>,
    pub plural: Option<String>,
    pub module: Option<String>,
    pub is_child: bool,
    pub is_system: bool,
    pub is_fetch_on_startup: bool,
    /// Effective properties, ancestors first.
    pub properties: IndexMap<String, Property>,
    /// Inheritance chain, nearest ancestor first.
    pub ancestors: Vec<String>,
    /// Every feather that descends from this one.
    pub children: Vec<String>,
}

impl Feather {
    pub fn property(&self, name: &str) -> Option<&Property> {
        self.properties.get(name)
    }

    /// Whether this feather is `name` or inherits from it.
    pub fn is_a(&self, name: &str) -> bool {
        self.name == name || self.ancestors.iter().any(|a| a == name)
    }

    /// Datasource path for single records.
    pub fn record_path(&self) -> String {
        format!("/data/{}", to_spinal_case(&self.name))
    }

    /// Datasource path for collections, when the feather has a plural name.
    pub fn collection_path(&self) -> Option<String> {
        self.plural
            .as_ref()
            .map(|plural| format!("/data/{}", to_spinal_case(plural)))
    }
}

/// `SalesOrder` becomes `sales-order`.
pub fn to_spinal_case(name: &str) -> String {
    let mut out = String::with_capacity(name.len() + 4);
    for (i, c) in name.chars().enumerate() {
        if c.is_ascii_uppercase() {
            if i > 0 {
                out.push('-');
            }
            out.push(c.to_ascii_lowercase());
        } else {
            out.push(c);
        }
    }
    out
}

/// The built-in root feather, used when a payload does not define one.
pub fn object_spec() -> FeatherSpec {
    let prop = |kind: &str, description: &str, default: Option<Value>, is_read_only: bool| {
        PropertySpec {
            description: description.to_string(),
            kind: TypeSpec::Primitive(kind.to_string()),
            format: None,
            default,
            is_required: false,
            is_read_only,
        }
    };

    let mut properties = IndexMap::new();
    properties.insert(
        "id".to_string(),
        prop("string", "Surrogate key", Some(json!("createId()")), false),
    );
    properties.insert(
        "created".to_string(),
        prop("dateTime", "Create time of the record", Some(json!("now()")), true),
    );
    properties.insert(
        "createdBy".to_string(),
        prop("string", "User who created the record", None, true),
    );
    properties.insert(
        "updated".to_string(),
        prop("dateTime", "Last time the record was updated", Some(json!("now()")), true),
    );
    properties.insert(
        "updatedBy".to_string(),
        prop("string", "User who last updated the record", None, true),
    );
    properties.insert(
        "isDeleted".to_string(),
        prop("boolean", "Indicates the record is no longer active", None, true),
    );
    properties.insert(
        "lock".to_string(),
        prop("object", "Record lock information", None, true),
    );
    properties.insert(
        "etag".to_string(),
        prop("string", "Optimistic concurrency version", None, true),
    );

    FeatherSpec {
        name: Some(ROOT_FEATHER.to_string()),
        description: "Base class for all persisted objects".to_string(),
        is_system: true,
        properties,
        ..FeatherSpec::default()
    }
}

/// Inheritance chain of `name`, starting with `name` and ending at the root.
fn ancestry<'a>(
    specs: &'a IndexMap<String, FeatherSpec>,
    name: &'a str,
) -> Result<Vec<String>, SchemaError> {
    let mut chain = vec![name.to_string()];
    let mut cursor = name;

    loop {
        let spec = specs
            .get(cursor)
            .ok_or_else(|| SchemaError::UnknownFeather(cursor.to_string()))?;
        let parent = match spec.inherits.as_deref() {
            Some(parent) => parent,
            None if cursor == ROOT_FEATHER => break,
            None => ROOT_FEATHER,
        };

        if chain.iter().any(|c| c == parent) {
            chain.push(parent.to_string());
            return Err(SchemaError::Cycle {
                feather: name.to_string(),
                chain,
            });
        }
        if !specs.contains_key(parent) {
            return Err(SchemaError::MissingAncestor {
                feather: cursor.to_string(),
                ancestor: parent.to_string(),
            });
        }

        chain.push(parent.to_string());
        cursor = parent;
    }

    Ok(chain)
}

fn resolve_property(
    feather: &str,
    name: &str,
    spec: &PropertySpec,
    factories: &DefaultFactories,
) -> Result<Property, SchemaError> {
    let kind = PropertyType::from_spec(&spec.kind);
    let default = match &spec.default {
        Some(Value::String(raw)) => match marker_name(raw) {
            Some(marker) if factories.contains(marker) => DefaultValue::Factory(marker.to_string()),
            Some(marker) => {
                return Err(SchemaError::UnknownDefault {
                    feather: feather.to_string(),
                    property: name.to_string(),
                    marker: marker.to_string(),
                })
            }
            None => DefaultValue::Literal(Value::String(raw.clone())),
        },
        Some(value) => DefaultValue::Literal(value.clone()),
        None => DefaultValue::Literal(kind.implicit_default()),
    };

    Ok(Property {
        name: name.to_string(),
        description: spec.description.clone(),
        kind,
        format: spec.format.clone(),
        default,
        is_required: spec.is_required,
        is_read_only: spec.is_read_only,
        declared_by: feather.to_string(),
    })
}

/// Validate and materialise every feather in `specs`.
///
/// Fails on the first missing or cyclic ancestor, unknown relation target,
/// unknown back-reference property or unknown default marker. `specs` must
/// already contain [`ROOT_FEATHER`].
pub fn resolve_all(
    specs: &IndexMap<String, FeatherSpec>,
    factories: &DefaultFactories,
) -> Result<IndexMap<String, Feather>, SchemaError> {
    let mut resolved: IndexMap<String, Feather> = IndexMap::with_capacity(specs.len());

    for (name, spec) in specs {
        let chain = ancestry(specs, name)?;

        let mut properties = IndexMap::new();
        for feather_name in chain.iter().rev() {
            for (prop_name, prop_spec) in &specs[feather_name.as_str()].properties {
                let property = resolve_property(feather_name, prop_name, prop_spec, factories)?;
                properties.insert(prop_name.clone(), property);
            }
        }

        resolved.insert(
            name.clone(),
            Feather {
                name: name.clone(),
                description: spec.description.clone(),
                inherits: chain.get(1).cloned(),
                plural: spec.plural.clone(),
                module: spec.module.clone(),
                is_child: spec.is_child,
                is_system: spec.is_system,
                is_fetch_on_startup: spec.is_fetch_on_startup,
                properties,
                ancestors: chain[1..].to_vec(),
                children: Vec::new(),
            },
        );
    }

    for feather in resolved.values() {
        for property in feather.properties.values() {
            let Some(target) = property.kind.relation() else {
                continue;
            };
            let Some(related) = resolved.get(target) else {
                return Err(SchemaError::UnknownRelation {
                    feather: feather.name.clone(),
                    property: property.name.clone(),
                    target: target.to_string(),
                });
            };
            if let Some(reference) = property.kind.back_reference() {
                if related.property(reference).is_none() {
                    return Err(SchemaError::UnknownBackReference {
                        feather: feather.name.clone(),
                        property: property.name.clone(),
                        target: target.to_string(),
                        reference: reference.to_string(),
                    });
                }
            }
        }
    }

    let links: Vec<(String, String)> = resolved
        .values()
        .flat_map(|f| f.ancestors.iter().map(|a| (a.clone(), f.name.clone())))
        .collect();
    for (ancestor, child) in links {
        if let Some(feather) = resolved.get_mut(&ancestor) {
            feather.children.push(child);
        }
    }

    Ok(resolved)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_property_types() {
        let spec: FeatherSpec = serde_json::from_value(json!({
            "properties": {
                "name": {"type": "string", "isRequired": true},
                "qty": {"type": "integer"},
                "customer": {"type": {"relation": "Contact"}},
                "lines": {"type": {"relation": "OrderLine", "parentOf": "parent"}},
                "parent": {"type": {"relation": "Order", "childOf": "lines"}},
                "untyped": {"default": "createId()"}
            }
        }))
        .unwrap();

        let kinds: Vec<PropertyType> = spec
            .properties
            .values()
            .map(|p| PropertyType::from_spec(&p.kind))
            .collect();
        assert_eq!(kinds[0], PropertyType::Primitive(Primitive::String));
        assert_eq!(kinds[1], PropertyType::Primitive(Primitive::Integer));
        assert_eq!(
            kinds[2],
            PropertyType::ToOne {
                feather: "Contact".into(),
                child_of: None
            }
        );
        assert_eq!(
            kinds[3],
            PropertyType::ToMany {
                feather: "OrderLine".into(),
                parent_of: "parent".into()
            }
        );
        assert_eq!(kinds[4].relation(), Some("Order"));
        assert_eq!(kinds[5], PropertyType::Primitive(Primitive::String));
        assert!(spec.properties["name"].is_required);
    }

    #[test]
    fn implicit_defaults_follow_type() {
        assert_eq!(PropertyType::Primitive(Primitive::Boolean).implicit_default(), json!(false));
        assert_eq!(PropertyType::Primitive(Primitive::Number).implicit_default(), json!(0));
        assert_eq!(
            PropertyType::ToMany {
                feather: "X".into(),
                parent_of: "p".into()
            }
            .implicit_default(),
            json!([])
        );
        assert_eq!(PropertyType::Primitive(Primitive::String).implicit_default(), Value::Null);
    }

    #[test]
    fn spinal_case() {
        assert_eq!(to_spinal_case("SalesOrder"), "sales-order");
        assert_eq!(to_spinal_case("contact"), "contact");
        assert_eq!(to_spinal_case("Contact"), "contact");
    }

    #[test]
    fn unknown_default_marker_is_fatal() {
        let mut specs = IndexMap::new();
        specs.insert(ROOT_FEATHER.to_string(), object_spec());
        specs.insert(
            "Thing".to_string(),
            serde_json::from_value(json!({
                "properties": {"code": {"type": "string", "default": "nextCode()"}}
            }))
            .unwrap(),
        );

        let err = resolve_all(&specs, &DefaultFactories::builtin()).unwrap_err();
        assert!(matches!(err, SchemaError::UnknownDefault { ref marker, .. } if marker == "nextCode"));
    }
}
