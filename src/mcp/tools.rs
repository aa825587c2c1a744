//! Built-in tools
//!
//! Served by the `toolwire` binary so it works as a counterpart process out
//! of the box.

use anyhow::{bail, Context};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::error::RegistryError;
use crate::mcp::registry::ToolRegistry;
use crate::mcp::schema::Schema;

/// Registry holding every built-in tool
pub fn builtin_registry() -> Result<ToolRegistry, RegistryError> {
    let mut registry = ToolRegistry::new();
    register_builtins(&mut registry)?;
    Ok(registry)
}

/// Add the built-in tools to an existing registry
pub fn register_builtins(registry: &mut ToolRegistry) -> Result<(), RegistryError> {
    registry.register("echo", "Echo the given text back", echo_schema(), echo)?;
    registry.register(
        "calculate",
        "Perform basic arithmetic operations",
        calculate_schema(),
        calculate,
    )?;
    Ok(())
}

// ==================== Schemas ====================

fn echo_schema() -> Schema {
    Schema::object().property("text", Schema::string().describe("Text to echo"))
}

fn calculate_schema() -> Schema {
    Schema::object()
        .property(
            "operation",
            Schema::enumeration(["add", "subtract", "multiply", "divide"])
                .describe("The arithmetic operation to perform"),
        )
        .property("a", Schema::number().describe("First number"))
        .property("b", Schema::number().describe("Second number"))
}

// ==================== Handlers ====================

async fn echo(params: Value) -> anyhow::Result<Value> {
    #[derive(Deserialize)]
    struct Args {
        text: String,
    }

    let args: Args = serde_json::from_value(params).context("Invalid arguments")?;
    Ok(json!({ "echoed": args.text }))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
enum Operation {
    Add,
    Subtract,
    Multiply,
    Divide,
}

async fn calculate(params: Value) -> anyhow::Result<Value> {
    #[derive(Deserialize)]
    struct Args {
        operation: Operation,
        a: f64,
        b: f64,
    }

    let Args { operation, a, b } =
        serde_json::from_value(params).context("Invalid arguments")?;

    let result = match operation {
        Operation::Add => a + b,
        Operation::Subtract => a - b,
        Operation::Multiply => a * b,
        Operation::Divide => {
            if b == 0.0 {
                bail!("Division by zero is not allowed");
            }
            a / b
        }
    };

    Ok(json!({ "operation": operation, "a": a, "b": b, "result": result }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_echo() {
        let result = echo(json!({"text": "hi"})).await.unwrap();
        assert_eq!(result, json!({"echoed": "hi"}));
    }

    #[tokio::test]
    async fn test_calculate() {
        let result = calculate(json!({"operation": "multiply", "a": 6, "b": 7}))
            .await
            .unwrap();
        assert_eq!(result["result"], json!(42.0));
        assert_eq!(result["operation"], json!("multiply"));
    }

    #[tokio::test]
    async fn test_divide_by_zero() {
        let err = calculate(json!({"operation": "divide", "a": 1, "b": 0}))
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "Division by zero is not allowed");
    }

    #[test]
    fn test_builtin_registry() {
        let registry = builtin_registry().unwrap();
        assert_eq!(registry.names(), vec!["echo", "calculate"]);

        let calculate = registry.get("calculate").unwrap();
        assert!(calculate.schema.validate(&json!({"operation": "add", "a": 1, "b": 2})).is_ok());
        assert!(calculate
            .schema
            .validate(&json!({"operation": "modulo", "a": 1, "b": 2}))
            .is_err());
    }

    #[test]
    fn test_register_twice_fails() {
        let mut registry = builtin_registry().unwrap();
        assert!(matches!(
            register_builtins(&mut registry),
            Err(RegistryError::DuplicateTool { .. })
        ));
    }
}
