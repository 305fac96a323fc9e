//! Voice functions: developer callbacks the processor can ask the engine to run.
//!
//! The registry exports [`FunctionSignature`]s (no handler) for the request and
//! resolves the calls named in a reply back to handlers. A failing handler is
//! logged and never stops its siblings.

use crate::error::{VoiceError, VoiceResult};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

pub type FunctionHandler = Arc<dyn Fn(&FunctionArgs) -> anyhow::Result<()> + Send + Sync>;

/// A callable capability exposed to the processor.
#[derive(Clone)]
pub struct VoiceFunction {
    pub name: String,
    pub description: String,
    /// JSON schema of the arguments object.
    pub parameters: Option<Value>,
    pub handler: FunctionHandler,
}

impl VoiceFunction {
    pub fn new<F>(name: impl Into<String>, description: impl Into<String>, handler: F) -> Self
    where
        F: Fn(&FunctionArgs) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            description: description.into(),
            parameters: None,
            handler: Arc::new(handler),
        }
    }

    pub fn with_parameters(mut self, schema: Value) -> Self {
        self.parameters = Some(schema);
        self
    }

    pub fn signature(&self) -> FunctionSignature {
        FunctionSignature {
            kind: "function".to_string(),
            function: FunctionSpec {
                name: self.name.clone(),
                description: self.description.clone(),
                parameters: self.parameters.clone(),
            },
        }
    }
}

impl fmt::Debug for VoiceFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VoiceFunction")
            .field("name", &self.name)
            .field("description", &self.description)
            .field("parameters", &self.parameters)
            .finish_non_exhaustive()
    }
}

/// What the processor sees of a voice function.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionSignature {
    #[serde(rename = "type")]
    pub kind: String,
    pub function: FunctionSpec,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionSpec {
    pub name: String,
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parameters: Option<Value>,
}

/// A call requested by the processor. `args` is kept raw: it may be an object,
/// a JSON-encoded string, or null.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionCall {
    pub name: String,
    #[serde(default, alias = "arguments")]
    pub args: Value,
    #[serde(default)]
    pub id: Option<String>,
}

impl FunctionCall {
    pub fn new(name: impl Into<String>, args: Value) -> Self {
        Self {
            name: name.into(),
            args,
            id: None,
        }
    }

    /// Decode `args` into an argument map.
    pub fn parse_args(&self) -> Result<FunctionArgs, String> {
        match &self.args {
            Value::Null => Ok(FunctionArgs::default()),
            Value::Object(map) => Ok(FunctionArgs(map.clone())),
            Value::String(encoded) if encoded.trim().is_empty() => Ok(FunctionArgs::default()),
            Value::String(encoded) => match serde_json::from_str::<Value>(encoded) {
                Ok(Value::Object(map)) => Ok(FunctionArgs(map)),
                Ok(Value::Null) => Ok(FunctionArgs::default()),
                Ok(other) => Err(format!(
                    "arguments decode to {} instead of an object",
                    type_name(&other)
                )),
                Err(e) => Err(format!("arguments are not valid JSON: {}", e)),
            },
            other => Err(format!("arguments are {} instead of an object", type_name(other))),
        }
    }
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

/// Arguments passed to a handler, in the order the processor sent them.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FunctionArgs(Map<String, Value>);

impl FunctionArgs {
    pub fn new(map: Map<String, Value>) -> Self {
        Self(map)
    }

    /// Typed lookup. `None` if missing or of the wrong shape.
    pub fn get<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        self.0.get(key).and_then(|v| serde_json::from_value(v.clone()).ok())
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.0.get(key).and_then(Value::as_str)
    }

    /// Argument values in arrival order.
    pub fn positional(&self) -> Vec<&Value> {
        self.0.values().collect()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn as_map(&self) -> &Map<String, Value> {
        &self.0
    }
}

/// Outcome counts for one `execute_functions` call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExecutionReport {
    /// Handlers that ran (including ones that failed).
    pub invoked: usize,
    /// Handlers that returned an error or panicked.
    pub failed: usize,
    /// Calls naming an unregistered function.
    pub missing: usize,
    /// Calls whose arguments could not be decoded.
    pub invalid: usize,
}

impl ExecutionReport {
    pub fn succeeded(&self) -> usize {
        self.invoked - self.failed
    }
}

#[derive(Clone, Default)]
pub struct FunctionRegistry {
    signatures: Vec<FunctionSignature>,
    handlers: HashMap<String, FunctionHandler>,
}

impl FunctionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add functions. A name that is already registered keeps its first handler.
    pub fn register_functions(&mut self, functions: Vec<VoiceFunction>) {
        for function in functions {
            if self.handlers.contains_key(&function.name) {
                warn!(
                    "voice function '{}' is already registered; skipping duplicate",
                    function.name
                );
                continue;
            }
            self.signatures.push(function.signature());
            self.handlers.insert(function.name.clone(), function.handler);
        }
        info!(count = self.signatures.len(), "voice functions registered");
        debug!(signatures = ?self.function_names(), "registered function signatures");
    }

    pub fn signatures(&self) -> &[FunctionSignature] {
        &self.signatures
    }

    pub fn function_names(&self) -> Vec<&str> {
        self.signatures.iter().map(|s| s.function.name.as_str()).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    /// Run each call in order. Only an empty registry is an error.
    pub fn execute_functions(&self, calls: &[FunctionCall]) -> VoiceResult<ExecutionReport> {
        if self.is_empty() {
            return Err(VoiceError::EmptyRegistry);
        }

        let mut report = ExecutionReport::default();
        for call in calls {
            let Some(handler) = self.handlers.get(&call.name) else {
                error!(
                    "Function '{}' not found. Register it with register_functions \
                     before starting an interaction",
                    call.name
                );
                report.missing += 1;
                continue;
            };

            let args = match call.parse_args() {
                Ok(args) => args,
                Err(reason) => {
                    error!(function = %call.name, "invalid function arguments: {}", reason);
                    report.invalid += 1;
                    continue;
                }
            };

            info!(function = %call.name, args = ?args.positional(), "calling voice function");
            report.invoked += 1;
            match catch_unwind(AssertUnwindSafe(|| handler(&args))) {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    let err = VoiceError::Handler {
                        name: call.name.clone(),
                        reason: format!("{:#}", e),
                    };
                    error!("{}", err);
                    report.failed += 1;
                }
                Err(_) => {
                    error!(function = %call.name, "voice function panicked");
                    report.failed += 1;
                }
            }
        }
        Ok(report)
    }
}
