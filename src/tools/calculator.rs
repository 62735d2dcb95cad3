use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::protocol::ToolResult;
use crate::registry::{RegistryError, ToolDescriptor, ToolError, ToolHandler};

pub const NAME: &str = "calculator";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Operation {
    Add,
    Subtract,
    Multiply,
    Divide,
}

impl Operation {
    fn symbol(self) -> &'static str {
        match self {
            Self::Add => "+",
            Self::Subtract => "-",
            Self::Multiply => "×",
            Self::Divide => "÷",
        }
    }

    pub fn apply(self, a: f64, b: f64) -> Result<f64, ToolError> {
        match self {
            Self::Add => Ok(a + b),
            Self::Subtract => Ok(a - b),
            Self::Multiply => Ok(a * b),
            Self::Divide if b == 0.0 => Err(ToolError::Invocation(
                "Division by zero is not allowed".into(),
            )),
            Self::Divide => Ok(a / b),
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.symbol())
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct CalculatorArgs {
    pub operation: Operation,
    pub a: f64,
    pub b: f64,
}

/// Four-operation arithmetic tool.
pub struct Calculator;

#[async_trait]
impl ToolHandler for Calculator {
    async fn call(&self, arguments: Value) -> Result<ToolResult, ToolError> {
        let args: CalculatorArgs =
            serde_json::from_value(arguments).map_err(|e| ToolError::InvalidArguments {
                tool: NAME.to_string(),
                reason: e.to_string(),
            })?;

        let result = args.operation.apply(args.a, args.b)?;
        Ok(ToolResult::text(format!(
            "Calculation: {} {} {} = {}",
            format_number(args.a),
            args.operation,
            format_number(args.b),
            format_number(result)
        )))
    }
}

/// Renders a number the way JSON clients print it: no negative zero, and
/// named non-finite values.
fn format_number(n: f64) -> String {
    if n.is_nan() {
        "NaN".to_string()
    } else if n == f64::INFINITY {
        "Infinity".to_string()
    } else if n == f64::NEG_INFINITY {
        "-Infinity".to_string()
    } else if n == 0.0 {
        "0".to_string()
    } else {
        n.to_string()
    }
}

pub fn input_schema() -> Value {
    json!({
        "type": "object",
        "properties": {
            "operation": {
                "type": "string",
                "enum": ["add", "subtract", "multiply", "divide"],
                "description": "The mathematical operation to perform"
            },
            "a": {
                "type": "number",
                "description": "First number"
            },
            "b": {
                "type": "number",
                "description": "Second number"
            }
        },
        "required": ["operation", "a", "b"]
    })
}

pub fn descriptor() -> Result<ToolDescriptor, RegistryError> {
    ToolDescriptor::builder()
        .name(NAME)
        .description("Perform basic mathematical calculations")
        .input_schema(input_schema())
        .handler(Arc::new(Calculator))
        .build()
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn calc(args: Value) -> Result<ToolResult, ToolError> {
        Calculator.call(args).await
    }

    #[tokio::test]
    async fn adds() {
        let result = calc(json!({ "operation": "add", "a": 2, "b": 3 })).await.unwrap();
        assert_eq!(result.joined_text(), "Calculation: 2 + 3 = 5");
    }

    #[tokio::test]
    async fn formats_fractions_and_symbols() {
        let result = calc(json!({ "operation": "divide", "a": 10, "b": 4 })).await.unwrap();
        assert_eq!(result.joined_text(), "Calculation: 10 ÷ 4 = 2.5");

        let result = calc(json!({ "operation": "multiply", "a": 1.5, "b": -2 })).await.unwrap();
        assert_eq!(result.joined_text(), "Calculation: 1.5 × -2 = -3");

        let result = calc(json!({ "operation": "subtract", "a": 1, "b": 3 })).await.unwrap();
        assert_eq!(result.joined_text(), "Calculation: 1 - 3 = -2");
    }

    #[test]
    fn formats_signed_zero_and_non_finite_values() {
        assert_eq!(format_number(-0.0), "0");
        assert_eq!(format_number(f64::INFINITY), "Infinity");
        assert_eq!(format_number(f64::NEG_INFINITY), "-Infinity");
        assert_eq!(format_number(f64::NAN), "NaN");
        assert_eq!(format_number(-2.5), "-2.5");
    }

    #[tokio::test]
    async fn overflow_and_negative_zero_results() {
        let result = calc(json!({ "operation": "multiply", "a": 0, "b": -1 })).await.unwrap();
        assert_eq!(result.joined_text(), "Calculation: 0 × -1 = 0");

        let result = calc(json!({ "operation": "multiply", "a": 1e200, "b": 1e200 }))
            .await
            .unwrap();
        assert!(result.joined_text().ends_with("= Infinity"));
    }

    #[tokio::test]
    async fn division_by_zero_fails() {
        let err = calc(json!({ "operation": "divide", "a": 10, "b": 0 })).await.unwrap_err();
        assert_eq!(err.to_string(), "Division by zero is not allowed");
    }

    #[tokio::test]
    async fn unsupported_operation_is_rejected() {
        let err = calc(json!({ "operation": "modulo", "a": 1, "b": 2 })).await.unwrap_err();
        assert!(matches!(err, ToolError::InvalidArguments { .. }));
    }

    #[test]
    fn descriptor_is_valid() {
        let d = descriptor().unwrap();
        assert_eq!(d.name(), "calculator");
        assert_eq!(d.input_schema().as_value()["required"], json!(["operation", "a", "b"]));
    }
}
