//! Stateless validators for step results.

use kumiito_core::{path, Map, ValidationError, Validator};
use serde_json::Value;
use std::fmt;
use std::sync::Arc;

/// Requires top-level keys to be present and not null.
#[derive(Debug, Clone)]
pub struct RequiredFields {
    fields: Vec<String>,
    empty_as_missing: bool,
}

impl RequiredFields {
    /// Requires every key in `fields`.
    pub fn new<I, S>(fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            fields: fields.into_iter().map(Into::into).collect(),
            empty_as_missing: false,
        }
    }

    /// Treats `""` as missing.
    pub fn empty_as_missing(mut self, enabled: bool) -> Self {
        self.empty_as_missing = enabled;
        self
    }

    fn is_missing(&self, value: Option<&Value>) -> bool {
        match value {
            None | Some(Value::Null) => true,
            Some(Value::String(s)) => self.empty_as_missing && s.is_empty(),
            Some(_) => false,
        }
    }
}

impl Validator for RequiredFields {
    fn validate(&self, data: &Map) -> Result<(), ValidationError> {
        match self.fields.iter().find(|f| self.is_missing(data.get(f.as_str()))) {
            Some(field) => Err(ValidationError::MissingField {
                field: field.clone(),
            }),
            None => Ok(()),
        }
    }

    fn name(&self) -> &str {
        "required_fields"
    }
}

/// Requires a value at a dotted path such as `screen.layout.blocks`.
#[derive(Debug, Clone)]
pub struct RequiredPath {
    path: String,
}

impl RequiredPath {
    /// Requires `path`.
    pub fn new(path: impl Into<String>) -> Self {
        Self { path: path.into() }
    }
}

impl Validator for RequiredPath {
    fn validate(&self, data: &Map) -> Result<(), ValidationError> {
        let found = match self.path.split_once('.') {
            Some((head, rest)) => data
                .get(head)
                .and_then(|root| path::lookup_dotted(root, rest)),
            None => data.get(&self.path),
        };
        match found {
            Some(value) if !value.is_null() => Ok(()),
            _ => Err(ValidationError::MissingPath {
                path: self.path.clone(),
            }),
        }
    }

    fn name(&self) -> &str {
        "required_path"
    }
}

/// Applies [`RequiredFields`] only when a predicate over the data holds.
pub struct ConditionalRequired {
    predicate: Arc<dyn Fn(&Map) -> bool + Send + Sync>,
    required: RequiredFields,
}

impl ConditionalRequired {
    /// Requires `fields` whenever `predicate` is true.
    pub fn new<P, I, S>(predicate: P, fields: I) -> Self
    where
        P: Fn(&Map) -> bool + Send + Sync + 'static,
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            predicate: Arc::new(predicate),
            required: RequiredFields::new(fields),
        }
    }

    /// Treats `""` as missing.
    pub fn empty_as_missing(mut self, enabled: bool) -> Self {
        self.required = self.required.empty_as_missing(enabled);
        self
    }
}

impl fmt::Debug for ConditionalRequired {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConditionalRequired")
            .field("required", &self.required)
            .finish()
    }
}

impl Validator for ConditionalRequired {
    fn validate(&self, data: &Map) -> Result<(), ValidationError> {
        if (self.predicate)(data) {
            self.required.validate(data)
        } else {
            Ok(())
        }
    }

    fn name(&self) -> &str {
        "conditional_required"
    }
}

type ValidateFn = dyn Fn(&Map) -> Result<(), ValidationError> + Send + Sync;

/// Validator backed by a closure.
pub struct FnValidator {
    name: String,
    func: Box<ValidateFn>,
}

impl FnValidator {
    /// Wraps `func` under `name`.
    pub fn new<F>(name: impl Into<String>, func: F) -> Self
    where
        F: Fn(&Map) -> Result<(), ValidationError> + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            func: Box::new(func),
        }
    }
}

impl fmt::Debug for FnValidator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FnValidator").field("name", &self.name).finish()
    }
}

impl Validator for FnValidator {
    fn validate(&self, data: &Map) -> Result<(), ValidationError> {
        (self.func)(data)
    }

    fn name(&self) -> &str {
        &self.name
    }
}

/// Runs validators in order; the first error wins.
#[derive(Clone, Default)]
pub struct ValidatorChain {
    validators: Vec<Arc<dyn Validator>>,
}

impl ValidatorChain {
    /// Creates an empty chain, which accepts everything.
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a validator.
    pub fn with(mut self, validator: Arc<dyn Validator>) -> Self {
        self.validators.push(validator);
        self
    }
}

impl fmt::Debug for ValidatorChain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<&str> = self.validators.iter().map(|v| v.name()).collect();
        f.debug_struct("ValidatorChain")
            .field("validators", &names)
            .finish()
    }
}

impl Validator for ValidatorChain {
    fn validate(&self, data: &Map) -> Result<(), ValidationError> {
        self.validators.iter().try_for_each(|v| v.validate(data))
    }

    fn name(&self) -> &str {
        "validator_chain"
    }
}
