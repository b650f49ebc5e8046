//! Typed parameter values and grouped parameter stores.

use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum ParameterError {
    #[error("Parameter not found: {0}")]
    NotFound(String),
    #[error("Parameter group not found: {0}")]
    GroupNotFound(String),
    #[error("Parameter '{name}' is not of type {expected}")]
    TypeMismatch { name: String, expected: &'static str },
    #[error("Duplicate parameter group: {0}")]
    DuplicateGroup(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ParameterValue {
    Bool(bool),
    Int(i64),
    Double(f64),
    Uuid(Uuid),
    String(String),
}

impl ParameterValue {
    pub fn type_name(&self) -> &'static str {
        match self {
            ParameterValue::Bool(_) => "bool",
            ParameterValue::Int(_) => "int",
            ParameterValue::Double(_) => "double",
            ParameterValue::Uuid(_) => "uuid",
            ParameterValue::String(_) => "string",
        }
    }

    pub fn as_string(&self) -> Option<&str> {
        match self {
            ParameterValue::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_uuid(&self) -> Option<Uuid> {
        match self {
            ParameterValue::Uuid(u) => Some(*u),
            ParameterValue::String(s) => Uuid::parse_str(s).ok(),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            ParameterValue::Int(i) => Some(*i),
            _ => None,
        }
    }

    /// Integers widen to doubles.
    pub fn as_double(&self) -> Option<f64> {
        match self {
            ParameterValue::Double(d) => Some(*d),
            ParameterValue::Int(i) => Some(*i as f64),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            ParameterValue::Bool(b) => Some(*b),
            _ => None,
        }
    }
}

impl std::fmt::Display for ParameterValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ParameterValue::Bool(b) => write!(f, "{}", b),
            ParameterValue::Int(i) => write!(f, "{}", i),
            ParameterValue::Double(d) => write!(f, "{}", d),
            ParameterValue::Uuid(u) => write!(f, "{}", u),
            ParameterValue::String(s) => write!(f, "{}", s),
        }
    }
}

impl From<bool> for ParameterValue {
    fn from(v: bool) -> Self { ParameterValue::Bool(v) }
}
impl From<i64> for ParameterValue {
    fn from(v: i64) -> Self { ParameterValue::Int(v) }
}
impl From<f64> for ParameterValue {
    fn from(v: f64) -> Self { ParameterValue::Double(v) }
}
impl From<Uuid> for ParameterValue {
    fn from(v: Uuid) -> Self { ParameterValue::Uuid(v) }
}
impl From<&str> for ParameterValue {
    fn from(v: &str) -> Self { ParameterValue::String(v.to_string()) }
}
impl From<String> for ParameterValue {
    fn from(v: String) -> Self { ParameterValue::String(v) }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Parameter {
    pub name: String,
    pub description: String,
    pub value: ParameterValue,
}

/// An ordered set of named values. Lookups are linear; groups stay small.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParameterGroup {
    pub name: String,
    pub description: String,
    pub parameters: Vec<Parameter>,
}

impl ParameterGroup {
    pub fn new(name: &str, description: &str) -> Self {
        Self {
            name: name.to_string(),
            description: description.to_string(),
            parameters: Vec::new(),
        }
    }

    pub fn add(&mut self, name: &str, description: &str, value: impl Into<ParameterValue>) -> &mut Self {
        let value = value.into();
        match self.parameters.iter_mut().find(|p| p.name == name) {
            Some(existing) => {
                existing.description = description.to_string();
                existing.value = value;
            }
            None => self.parameters.push(Parameter {
                name: name.to_string(),
                description: description.to_string(),
                value,
            }),
        }
        self
    }

    pub fn has(&self, name: &str) -> bool {
        self.parameters.iter().any(|p| p.name == name)
    }

    pub fn get(&self, name: &str) -> Result<&ParameterValue, ParameterError> {
        self.parameters
            .iter()
            .find(|p| p.name == name)
            .map(|p| &p.value)
            .ok_or_else(|| ParameterError::NotFound(format!("{}.{}", self.name, name)))
    }

    /// Overwrite an existing value. The value's type may change.
    pub fn set(&mut self, name: &str, value: impl Into<ParameterValue>) -> Result<(), ParameterError> {
        let group = self.name.clone();
        let param = self
            .parameters
            .iter_mut()
            .find(|p| p.name == name)
            .ok_or_else(|| ParameterError::NotFound(format!("{}.{}", group, name)))?;
        param.value = value.into();
        Ok(())
    }

    pub fn remove(&mut self, name: &str) -> Option<ParameterValue> {
        let pos = self.parameters.iter().position(|p| p.name == name)?;
        Some(self.parameters.remove(pos).value)
    }

    pub fn get_string(&self, name: &str) -> Result<String, ParameterError> {
        self.typed(name, "string", |v| v.as_string().map(str::to_string))
    }

    pub fn get_uuid(&self, name: &str) -> Result<Uuid, ParameterError> {
        self.typed(name, "uuid", ParameterValue::as_uuid)
    }

    pub fn get_int(&self, name: &str) -> Result<i64, ParameterError> {
        self.typed(name, "int", ParameterValue::as_int)
    }

    pub fn get_double(&self, name: &str) -> Result<f64, ParameterError> {
        self.typed(name, "double", ParameterValue::as_double)
    }

    pub fn get_bool(&self, name: &str) -> Result<bool, ParameterError> {
        self.typed(name, "bool", ParameterValue::as_bool)
    }

    fn typed<T>(
        &self,
        name: &str,
        expected: &'static str,
        convert: impl Fn(&ParameterValue) -> Option<T>,
    ) -> Result<T, ParameterError> {
        let value = self.get(name)?;
        convert(value).ok_or_else(|| ParameterError::TypeMismatch {
            name: name.to_string(),
            expected,
        })
    }
}

/// Collection of parameter groups owned by one instance.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ParameterHandler {
    groups: Vec<ParameterGroup>,
}

impl ParameterHandler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_group(&mut self, group: ParameterGroup) -> Result<(), ParameterError> {
        if self.groups.iter().any(|g| g.name == group.name) {
            return Err(ParameterError::DuplicateGroup(group.name));
        }
        self.groups.push(group);
        Ok(())
    }

    pub fn group(&self, name: &str) -> Result<&ParameterGroup, ParameterError> {
        self.groups
            .iter()
            .find(|g| g.name == name)
            .ok_or_else(|| ParameterError::GroupNotFound(name.to_string()))
    }

    pub fn group_mut(&mut self, name: &str) -> Result<&mut ParameterGroup, ParameterError> {
        self.groups
            .iter_mut()
            .find(|g| g.name == name)
            .ok_or_else(|| ParameterError::GroupNotFound(name.to_string()))
    }

    pub fn groups(&self) -> &[ParameterGroup] {
        &self.groups
    }
}
