//! Entity definitions and the typed fields they declare.

use keel_types::{format_timestamp, Record, Value};
use serde::{Deserialize, Serialize};

/// Describes a declared record type: where it is stored and which typed
/// fields a record of it may carry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntityDefinition {
    pub name: String,
    pub table: String,
    pub primary_key: PrimaryKeySpec,
    #[serde(default)]
    pub fields: Vec<FieldSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub soft_delete: Option<SoftDeleteSpec>,
}

/// Primary key column and how new keys are produced.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PrimaryKeySpec {
    pub field: String,
    #[serde(default)]
    pub generation: KeyGeneration,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeyGeneration {
    /// Integer rowid assigned by the store.
    #[default]
    Auto,
    /// UUID v7 text generated on insert.
    Uuid,
    /// The client supplies the key.
    Manual,
}

/// Soft-deleted rows carry a timestamp in this column and are invisible to
/// reads and nested writes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SoftDeleteSpec {
    pub field: String,
}

/// A typed field of an entity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FieldSpec {
    pub name: String,
    #[serde(rename = "type")]
    pub field_type: FieldType,
    #[serde(default)]
    pub required: bool,
    #[serde(default)]
    pub unique: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<Value>,
    /// Allowed values. Only meaningful for text-like fields.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[serde(alias = "enum")]
    pub enum_values: Option<Vec<String>>,
    /// Decimal places kept for `decimal`/`float` fields.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub precision: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auto: Option<AutoTimestamp>,
}

impl FieldSpec {
    fn simple(name: &str, field_type: FieldType) -> Self {
        Self {
            name: name.into(),
            field_type,
            required: false,
            unique: false,
            default: None,
            enum_values: None,
            precision: None,
            auto: None,
        }
    }

    /// Shorthand for a short string field.
    pub fn string(name: &str) -> Self {
        Self::simple(name, FieldType::String)
    }

    /// Shorthand for a long text field.
    pub fn text(name: &str) -> Self {
        Self::simple(name, FieldType::Text)
    }

    /// Shorthand for an integer field.
    pub fn int(name: &str) -> Self {
        Self::simple(name, FieldType::Int)
    }

    /// Shorthand for a float field.
    pub fn float(name: &str) -> Self {
        Self::simple(name, FieldType::Float)
    }

    /// Shorthand for a decimal field rounded to `precision` places.
    pub fn decimal(name: &str, precision: u32) -> Self {
        Self {
            precision: Some(precision),
            ..Self::simple(name, FieldType::Decimal)
        }
    }

    /// Shorthand for a boolean field.
    pub fn bool(name: &str) -> Self {
        Self::simple(name, FieldType::Bool)
    }

    /// Shorthand for an RFC 3339 timestamp field.
    pub fn timestamp(name: &str) -> Self {
        Self::simple(name, FieldType::Timestamp)
    }

    /// Shorthand for a JSON blob field.
    pub fn json(name: &str) -> Self {
        Self::simple(name, FieldType::Json)
    }

    /// Shorthand for an enum field with fixed options.
    pub fn enumeration(name: &str, options: &[&str]) -> Self {
        Self {
            enum_values: Some(options.iter().map(|o| o.to_string()).collect()),
            ..Self::simple(name, FieldType::String)
        }
    }

    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }

    pub fn unique(mut self) -> Self {
        self.unique = true;
        self
    }

    pub fn with_default(mut self, value: impl Into<Value>) -> Self {
        self.default = Some(value.into());
        self
    }

    pub fn with_auto(mut self, auto: AutoTimestamp) -> Self {
        self.auto = Some(auto);
        self
    }

    /// Checks and normalizes a value for this field. Nil is always accepted;
    /// presence is enforced separately through `required`.
    pub fn coerce(&self, value: Value) -> Result<Value, String> {
        if value.is_null() {
            return Ok(value);
        }
        let value = self.field_type.coerce(value)?;
        if let (Some(options), Some(text)) = (&self.enum_values, value.as_str()) {
            if !options.iter().any(|o| o == text) {
                return Err(format!("must be one of [{}]", options.join(", ")));
            }
        }
        match (self.precision, &value) {
            (Some(places), Value::Float(f)) => {
                let factor = 10f64.powi(places as i32);
                Ok(Value::Float((f * factor).round() / factor))
            }
            _ => Ok(value),
        }
    }
}

/// Auto-maintained timestamp fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AutoTimestamp {
    /// Set once when the row is inserted.
    OnCreate,
    /// Set on insert and on every update.
    OnUpdate,
}

/// The storage type of a field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldType {
    String,
    Text,
    Int,
    Float,
    Decimal,
    Bool,
    Timestamp,
    Date,
    Uuid,
    Json,
}

impl FieldType {
    /// Checks a non-nil value against this type, normalizing where the
    /// representation is flexible (ints into floats, timestamps into UTC).
    pub fn coerce(self, value: Value) -> Result<Value, String> {
        match (self, value) {
            (Self::Json, v) => Ok(v),
            (Self::String | Self::Text, v @ Value::Text(_)) => Ok(v),
            (Self::Int, v @ Value::Int(_)) => Ok(v),
            (Self::Int, Value::Float(f)) if f.fract() == 0.0 && f.is_finite() => {
                Ok(Value::Int(f as i64))
            }
            (Self::Float | Self::Decimal, Value::Int(i)) => Ok(Value::Float(i as f64)),
            (Self::Float | Self::Decimal, v @ Value::Float(_)) => Ok(v),
            (Self::Bool, v @ Value::Bool(_)) => Ok(v),
            (Self::Timestamp, Value::Text(s)) => chrono::DateTime::parse_from_rfc3339(&s)
                .map(|dt| Value::Text(format_timestamp(dt.with_timezone(&chrono::Utc))))
                .map_err(|e| format!("invalid timestamp `{s}`: {e}")),
            (Self::Date, Value::Text(s)) => chrono::NaiveDate::parse_from_str(&s, "%Y-%m-%d")
                .map(|_| Value::Text(s.clone()))
                .map_err(|e| format!("invalid date `{s}`: {e}")),
            (Self::Uuid, Value::Text(s)) => uuid::Uuid::parse_str(&s)
                .map(|u| Value::Text(u.to_string()))
                .map_err(|e| format!("invalid uuid `{s}`: {e}")),
            (ty, v) => Err(format!("expected {}, found {}", ty.name(), v.type_name())),
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::String => "string",
            Self::Text => "text",
            Self::Int => "int",
            Self::Float => "float",
            Self::Decimal => "decimal",
            Self::Bool => "bool",
            Self::Timestamp => "timestamp",
            Self::Date => "date",
            Self::Uuid => "uuid",
            Self::Json => "json",
        }
    }
}

/// Why a record does not fit its entity definition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShapeError {
    UnknownField(String),
    InvalidValue { field: String, message: String },
}

impl EntityDefinition {
    pub fn field(&self, name: &str) -> Option<&FieldSpec> {
        self.fields.iter().find(|f| f.name == name)
    }

    /// Name of the primary key column.
    pub fn pk(&self) -> &str {
        &self.primary_key.field
    }

    pub fn soft_delete_field(&self) -> Option<&str> {
        self.soft_delete.as_ref().map(|s| s.field.as_str())
    }

    /// True for any stored column: key, declared field, or soft-delete marker.
    pub fn has_column(&self, name: &str) -> bool {
        name == self.pk() || self.field(name).is_some() || self.soft_delete_field() == Some(name)
    }

    /// All stored columns, key first, in declaration order.
    pub fn columns(&self) -> Vec<&str> {
        let mut cols = vec![self.pk()];
        cols.extend(
            self.fields
                .iter()
                .map(|f| f.name.as_str())
                .filter(|name| *name != self.pk()),
        );
        if let Some(marker) = self.soft_delete_field() {
            if !cols.contains(&marker) {
                cols.push(marker);
            }
        }
        cols
    }

    /// Storage type of a column, including the implicit key and marker columns.
    pub fn column_type(&self, name: &str) -> Option<FieldType> {
        if let Some(spec) = self.field(name) {
            return Some(spec.field_type);
        }
        if name == self.pk() {
            return Some(match self.primary_key.generation {
                KeyGeneration::Auto => FieldType::Int,
                KeyGeneration::Uuid => FieldType::Uuid,
                KeyGeneration::Manual => FieldType::String,
            });
        }
        if self.soft_delete_field() == Some(name) {
            return Some(FieldType::Timestamp);
        }
        None
    }

    /// Validates every field of `record` against this definition and returns
    /// the normalized record. The soft-delete marker is system-managed and
    /// may not be written directly.
    pub fn check_shape(&self, record: Record) -> Result<Record, ShapeError> {
        let mut out = Record::new();
        for (name, value) in record {
            if self.soft_delete_field() == Some(name.as_str()) {
                return Err(ShapeError::InvalidValue {
                    field: name,
                    message: "soft-delete marker is managed by the engine".into(),
                });
            }
            let coerced = match self.field(&name) {
                Some(spec) => spec.coerce(value),
                None if name == self.pk() => match self.column_type(&name) {
                    Some(ty) if !value.is_null() => ty.coerce(value),
                    _ => Ok(value),
                },
                None => return Err(ShapeError::UnknownField(name)),
            };
            match coerced {
                Ok(v) => {
                    out.insert(name, v);
                }
                Err(message) => return Err(ShapeError::InvalidValue { field: name, message }),
            }
        }
        Ok(out)
    }
}
