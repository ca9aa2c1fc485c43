//! Relevance model definitions and the compile interface
//!
//! The search engine that evaluates relevance functions lives outside this
//! workspace. What crosses the boundary is a compiled
//! [`RelevanceFunctionFactory`], produced from a definition document by a
//! [`ModelCompiler`]. Bootstrap load, local apply and notification apply all
//! go through the same compiler.

use serde_json::{Map, Value};
use std::sync::Arc;

use crate::{Error, Result};

/// A compiled relevance model, ready to hand to the indexing engine
#[derive(Debug, Clone, PartialEq)]
pub struct RelevanceFunctionFactory {
    /// Function body
    function: String,

    /// Ordered function parameter names
    params: Vec<String>,

    /// The full parsed definition document
    definition: Value,
}

impl RelevanceFunctionFactory {
    /// Function body of the model
    pub fn function(&self) -> &str {
        &self.function
    }

    /// Declared function parameters, in order
    pub fn params(&self) -> &[String] {
        &self.params
    }

    /// Parsed definition document
    pub fn definition(&self) -> &Value {
        &self.definition
    }
}

/// Shared handle to a compiled model
pub type FactoryHandle = Arc<RelevanceFunctionFactory>;

/// Turns a serialized definition into a factory
///
/// Implementations must be pure: the same document always compiles to an
/// equal factory, so equality can be used to detect redundant updates.
pub trait ModelCompiler: Send + Sync {
    fn compile(&self, name: &str, definition: &str) -> Result<RelevanceFunctionFactory>;
}

/// Compiler for JSON model documents of the form
///
/// ```json
/// {
///   "function_params": ["_INNER_SCORE", "thisYear", "year"],
///   "facets": {"int": ["year"]},
///   "variables": {"int": ["thisYear"]},
///   "function": "if(year == thisYear) return 2 * _INNER_SCORE; return _INNER_SCORE;"
/// }
/// ```
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonModelCompiler;

impl JsonModelCompiler {
    pub fn new() -> Self {
        Self
    }

    fn build_error(name: &str, reason: impl Into<String>) -> Error {
        Error::ModelBuild {
            name: name.to_string(),
            reason: reason.into(),
        }
    }

    fn check_object_field(name: &str, doc: &Map<String, Value>, field: &str) -> Result<()> {
        match doc.get(field) {
            None | Some(Value::Object(_)) => Ok(()),
            Some(_) => Err(Self::build_error(
                name,
                format!("'{}' must be an object", field),
            )),
        }
    }
}

impl ModelCompiler for JsonModelCompiler {
    fn compile(&self, name: &str, definition: &str) -> Result<RelevanceFunctionFactory> {
        let value: Value = serde_json::from_str(definition).map_err(|e| {
            Self::build_error(name, format!("can not parse model json: {}", e))
        })?;

        let doc = value
            .as_object()
            .ok_or_else(|| Self::build_error(name, "model json must be an object"))?;

        let function = match doc.get("function") {
            Some(Value::String(f)) if !f.trim().is_empty() => f.clone(),
            Some(Value::String(_)) => return Err(Self::build_error(name, "'function' is empty")),
            Some(_) => return Err(Self::build_error(name, "'function' must be a string")),
            None => return Err(Self::build_error(name, "missing 'function'")),
        };

        let params = match doc.get("function_params") {
            None => Vec::new(),
            Some(Value::Array(items)) => items
                .iter()
                .map(|p| {
                    p.as_str().map(str::to_string).ok_or_else(|| {
                        Self::build_error(name, "'function_params' must contain strings")
                    })
                })
                .collect::<Result<Vec<_>>>()?,
            Some(_) => {
                return Err(Self::build_error(
                    name,
                    "'function_params' must be an array",
                ))
            }
        };

        Self::check_object_field(name, doc, "facets")?;
        Self::check_object_field(name, doc, "variables")?;

        Ok(RelevanceFunctionFactory {
            function,
            params,
            definition: value,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MODEL: &str = r#"{
        "function_params": ["_INNER_SCORE", "year"],
        "facets": {"int": ["year"]},
        "function": "return _INNER_SCORE + year;"
    }"#;

    #[test]
    fn test_compile_model() {
        let factory = JsonModelCompiler.compile("m1", MODEL).unwrap();
        assert_eq!(factory.function(), "return _INNER_SCORE + year;");
        assert_eq!(factory.params(), ["_INNER_SCORE", "year"]);
    }

    #[test]
    fn test_equal_documents_compile_equal() {
        let reformatted = serde_json::to_string_pretty(
            &serde_json::from_str::<Value>(MODEL).unwrap(),
        )
        .unwrap();
        let a = JsonModelCompiler.compile("m1", MODEL).unwrap();
        let b = JsonModelCompiler.compile("m1", &reformatted).unwrap();
        assert_eq!(a, b);

        let c = JsonModelCompiler
            .compile("m1", r#"{"function": "return 1;"}"#)
            .unwrap();
        assert_ne!(a, c);
    }

    #[test]
    fn test_compile_rejects_bad_documents() {
        for doc in [
            "not json",
            "[1, 2]",
            r#"{"facets": {}}"#,
            r#"{"function": 3}"#,
            r#"{"function": "  "}"#,
            r#"{"function": "x", "function_params": [1]}"#,
            r#"{"function": "x", "variables": []}"#,
        ] {
            let err = JsonModelCompiler.compile("bad", doc).unwrap_err();
            assert!(
                matches!(err, Error::ModelBuild { ref name, .. } if name == "bad"),
                "{doc}: {err}"
            );
        }
    }
}
