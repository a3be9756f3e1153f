//! Structural validation against a closed set of schema keywords.
//!
//! A [`SchemaBody`] is a JSON-Schema-shaped description restricted to the
//! keywords listed on its fields. [`Validator::compile`] prepares a body
//! once (patterns are compiled up front) and [`Validator::validate`] returns
//! every violation with a JSON-Pointer path.

use std::collections::BTreeMap;
use std::fmt;

use regex::Regex;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

/// Tolerance used when checking `multipleOf` on floating point input.
const MULTIPLE_OF_EPSILON: f64 = 1e-9;

/// JSON value types as named by the `type` keyword.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JsonType {
    Null,
    Boolean,
    Integer,
    Number,
    String,
    Array,
    Object,
}

impl JsonType {
    /// The type of a value. Numbers are always reported as `Number`.
    pub fn of(value: &Value) -> Self {
        match value {
            Value::Null => Self::Null,
            Value::Bool(_) => Self::Boolean,
            Value::Number(_) => Self::Number,
            Value::String(_) => Self::String,
            Value::Array(_) => Self::Array,
            Value::Object(_) => Self::Object,
        }
    }

    fn matches(self, value: &Value) -> bool {
        match (self, value) {
            (Self::Integer, Value::Number(n)) => {
                n.is_i64() || n.is_u64() || n.as_f64().is_some_and(|f| f.fract() == 0.0)
            }
            (Self::Integer, _) => false,
            (ty, value) => ty == Self::of(value),
        }
    }

    fn as_str(self) -> &'static str {
        match self {
            Self::Null => "null",
            Self::Boolean => "boolean",
            Self::Integer => "integer",
            Self::Number => "number",
            Self::String => "string",
            Self::Array => "array",
            Self::Object => "object",
        }
    }
}

impl fmt::Display for JsonType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// `type` accepts a single name or a list of names.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TypeSet {
    One(JsonType),
    Many(Vec<JsonType>),
}

impl TypeSet {
    fn matches(&self, value: &Value) -> bool {
        match self {
            Self::One(ty) => ty.matches(value),
            Self::Many(tys) => tys.iter().any(|ty| ty.matches(value)),
        }
    }
}

impl fmt::Display for TypeSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::One(ty) => write!(f, "{ty}"),
            Self::Many(tys) => {
                let names: Vec<&str> = tys.iter().map(|t| t.as_str()).collect();
                write!(f, "one of [{}]", names.join(", "))
            }
        }
    }
}

/// `additionalProperties` is either a switch or a schema for extra keys.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AdditionalProperties {
    Allowed(bool),
    Schema(Box<SchemaBody>),
}

/// A schema description. Unknown keywords are rejected when parsing.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct SchemaBody {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub ty: Option<TypeSet>,
    #[serde(rename = "enum", default, skip_serializing_if = "Option::is_none")]
    pub enumeration: Option<Vec<Value>>,
    #[serde(
        rename = "const",
        default,
        deserialize_with = "present",
        skip_serializing_if = "Option::is_none"
    )]
    pub constant: Option<Value>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub minimum: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub maximum: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exclusive_minimum: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exclusive_maximum: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub multiple_of: Option<f64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_length: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_length: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pattern: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub properties: Option<BTreeMap<String, SchemaBody>>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub required: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub additional_properties: Option<AdditionalProperties>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub items: Option<Box<SchemaBody>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_items: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_items: Option<usize>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub unique_items: bool,
}

// `"const": null` must stay distinguishable from an absent `const`.
fn present<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Value>, D::Error> {
    Value::deserialize(d).map(Some)
}

impl SchemaBody {
    /// A body that only constrains the top-level type.
    pub fn of_type(ty: JsonType) -> Self {
        Self {
            ty: Some(TypeSet::One(ty)),
            ..Self::default()
        }
    }

    /// The minimal body accepting `value`'s shape (its top-level type).
    pub fn infer(value: &Value) -> Self {
        Self::of_type(JsonType::of(value))
    }

    /// Parse a body from a JSON value.
    pub fn from_json(value: Value) -> Result<Self, serde_json::Error> {
        serde_json::from_value(value)
    }
}

/// One violation found by the validator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationError {
    /// JSON Pointer to the offending value (`""` is the root).
    pub path: String,
    /// Human readable description.
    pub message: String,
    /// Keyword that failed.
    pub keyword: String,
}

impl ValidationError {
    pub fn new(path: impl Into<String>, keyword: &str, message: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            message: message.into(),
            keyword: keyword.to_owned(),
        }
    }
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.path.is_empty() {
            write!(f, "{}", self.message)
        } else {
            write!(f, "{}: {}", self.path, self.message)
        }
    }
}

/// A compiled [`SchemaBody`].
#[derive(Debug, Clone)]
pub struct Validator {
    root: Node,
}

#[derive(Debug, Clone)]
struct Node {
    body: SchemaBody,
    pattern: Option<Regex>,
    properties: BTreeMap<String, Node>,
    additional: Option<Box<Node>>,
    items: Option<Box<Node>>,
}

impl Node {
    fn compile(body: &SchemaBody) -> Result<Self, regex::Error> {
        let pattern = body.pattern.as_deref().map(Regex::new).transpose()?;

        let mut properties = BTreeMap::new();
        for (name, child) in body.properties.iter().flatten() {
            properties.insert(name.clone(), Node::compile(child)?);
        }

        let additional = match &body.additional_properties {
            Some(AdditionalProperties::Schema(child)) => Some(Box::new(Node::compile(child)?)),
            _ => None,
        };

        let items = body
            .items
            .as_deref()
            .map(Node::compile)
            .transpose()?
            .map(Box::new);

        Ok(Self {
            body: body.clone(),
            pattern,
            properties,
            additional,
            items,
        })
    }

    fn check(&self, value: &Value, path: &str, out: &mut Vec<ValidationError>) {
        let body = &self.body;

        if let Some(ty) = &body.ty {
            if !ty.matches(value) {
                out.push(ValidationError::new(
                    path,
                    "type",
                    format!("expected {ty}, found {}", JsonType::of(value)),
                ));
                return;
            }
        }

        if let Some(expected) = &body.constant {
            if expected != value {
                out.push(ValidationError::new(
                    path,
                    "const",
                    format!("must equal {expected}"),
                ));
            }
        }

        if let Some(options) = &body.enumeration {
            if !options.contains(value) {
                let listed: Vec<String> = options.iter().map(Value::to_string).collect();
                out.push(ValidationError::new(
                    path,
                    "enum",
                    format!("must be one of [{}]", listed.join(", ")),
                ));
            }
        }

        match value {
            Value::Number(n) => {
                if let Some(n) = n.as_f64() {
                    self.check_number(n, path, out);
                }
            }
            Value::String(s) => self.check_string(s, path, out),
            Value::Array(items) => self.check_array(items, path, out),
            Value::Object(map) => self.check_object(map, path, out),
            Value::Null | Value::Bool(_) => {}
        }
    }

    fn check_number(&self, n: f64, path: &str, out: &mut Vec<ValidationError>) {
        let body = &self.body;
        if let Some(min) = body.minimum {
            if n < min {
                out.push(ValidationError::new(path, "minimum", format!("must be >= {min}")));
            }
        }
        if let Some(max) = body.maximum {
            if n > max {
                out.push(ValidationError::new(path, "maximum", format!("must be <= {max}")));
            }
        }
        if let Some(min) = body.exclusive_minimum {
            if n <= min {
                out.push(ValidationError::new(
                    path,
                    "exclusiveMinimum",
                    format!("must be > {min}"),
                ));
            }
        }
        if let Some(max) = body.exclusive_maximum {
            if n >= max {
                out.push(ValidationError::new(
                    path,
                    "exclusiveMaximum",
                    format!("must be < {max}"),
                ));
            }
        }
        if let Some(step) = body.multiple_of {
            let ratio = n / step;
            if step <= 0.0 || (ratio - ratio.round()).abs() > MULTIPLE_OF_EPSILON {
                out.push(ValidationError::new(
                    path,
                    "multipleOf",
                    format!("must be a multiple of {step}"),
                ));
            }
        }
    }

    fn check_string(&self, s: &str, path: &str, out: &mut Vec<ValidationError>) {
        let body = &self.body;
        let len = s.chars().count();
        if let Some(min) = body.min_length {
            if len < min {
                out.push(ValidationError::new(
                    path,
                    "minLength",
                    format!("must be at least {min} characters"),
                ));
            }
        }
        if let Some(max) = body.max_length {
            if len > max {
                out.push(ValidationError::new(
                    path,
                    "maxLength",
                    format!("must be at most {max} characters"),
                ));
            }
        }
        if let Some(re) = &self.pattern {
            if !re.is_match(s) {
                out.push(ValidationError::new(
                    path,
                    "pattern",
                    format!("must match /{}/", re.as_str()),
                ));
            }
        }
    }

    fn check_array(&self, items: &[Value], path: &str, out: &mut Vec<ValidationError>) {
        let body = &self.body;
        if let Some(min) = body.min_items {
            if items.len() < min {
                out.push(ValidationError::new(
                    path,
                    "minItems",
                    format!("must have at least {min} items"),
                ));
            }
        }
        if let Some(max) = body.max_items {
            if items.len() > max {
                out.push(ValidationError::new(
                    path,
                    "maxItems",
                    format!("must have at most {max} items"),
                ));
            }
        }
        if body.unique_items {
            let duplicate = items
                .iter()
                .enumerate()
                .any(|(i, a)| items[i + 1..].contains(a));
            if duplicate {
                out.push(ValidationError::new(
                    path,
                    "uniqueItems",
                    "items must be unique",
                ));
            }
        }
        if let Some(node) = &self.items {
            for (i, item) in items.iter().enumerate() {
                node.check(item, &format!("{path}/{i}"), out);
            }
        }
    }

    fn check_object(
        &self,
        map: &serde_json::Map<String, Value>,
        path: &str,
        out: &mut Vec<ValidationError>,
    ) {
        for name in &self.body.required {
            if !map.contains_key(name) {
                out.push(ValidationError::new(
                    path,
                    "required",
                    format!("missing required property `{name}`"),
                ));
            }
        }

        for (name, value) in map {
            let child_path = format!("{path}/{}", escape_pointer(name));
            if let Some(node) = self.properties.get(name) {
                node.check(value, &child_path, out);
                continue;
            }
            match (&self.body.additional_properties, &self.additional) {
                (Some(AdditionalProperties::Allowed(false)), _) => {
                    out.push(ValidationError::new(
                        child_path,
                        "additionalProperties",
                        "unexpected property",
                    ));
                }
                (_, Some(node)) => node.check(value, &child_path, out),
                _ => {}
            }
        }
    }
}

fn escape_pointer(segment: &str) -> String {
    segment.replace('~', "~0").replace('/', "~1")
}

impl Validator {
    /// Compile a body. Fails only on an invalid `pattern`.
    pub fn compile(body: &SchemaBody) -> Result<Self, regex::Error> {
        Node::compile(body).map(|root| Self { root })
    }

    /// All violations of `value`; empty means valid.
    pub fn validate(&self, value: &Value) -> Vec<ValidationError> {
        let mut out = Vec::new();
        self.root.check(value, "", &mut out);
        out
    }

    /// Whether `value` satisfies the body.
    pub fn is_valid(&self, value: &Value) -> bool {
        self.validate(value).is_empty()
    }

    /// The body this validator was compiled from.
    pub fn body(&self) -> &SchemaBody {
        &self.root.body
    }
}

/// Validate `value` against `body` in one step.
///
/// A body that fails to compile reports a single `pattern` error.
pub fn validate(value: &Value, body: &SchemaBody) -> Vec<ValidationError> {
    match Validator::compile(body) {
        Ok(validator) => validator.validate(value),
        Err(e) => vec![ValidationError::new("", "pattern", format!("invalid pattern: {e}"))],
    }
}
