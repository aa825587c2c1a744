//! Tool registry
//!
//! Name → (description, schema, handler) table. Built once before a server
//! starts, then shared immutably behind an `Arc`.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

use futures::future::{BoxFuture, FutureExt};
use serde_json::Value;

use crate::error::RegistryError;
use crate::mcp::schema::Schema;
use crate::mcp::types::{ToolDescriptor, LIST_TOOLS};

/// Future returned by a tool handler
pub type HandlerFuture = BoxFuture<'static, anyhow::Result<Value>>;

/// Type-erased tool handler
pub type ToolHandler = Arc<dyn Fn(Value) -> HandlerFuture + Send + Sync>;

/// A registered tool
#[derive(Clone)]
pub struct Tool {
    pub name: String,
    pub description: String,
    pub schema: Schema,
    handler: ToolHandler,
}

impl Tool {
    /// Discovery descriptor for this tool
    pub fn descriptor(&self) -> ToolDescriptor {
        ToolDescriptor {
            name: self.name.clone(),
            description: self.description.clone(),
            parameters: self.schema.to_json_schema(),
        }
    }

    /// Invoke the handler with already-validated params
    pub fn call(&self, params: Value) -> HandlerFuture {
        (self.handler)(params)
    }
}

impl fmt::Debug for Tool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Tool")
            .field("name", &self.name)
            .field("description", &self.description)
            .finish_non_exhaustive()
    }
}

/// Registry of tools, in registration order
#[derive(Debug, Default)]
pub struct ToolRegistry {
    tools: Vec<Tool>,
    index: HashMap<String, usize>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a tool.
    ///
    /// A name that is already present is rejected with `DuplicateTool` and the
    /// existing registration is kept.
    pub fn register<F, Fut>(
        &mut self,
        name: impl Into<String>,
        description: impl Into<String>,
        schema: Schema,
        handler: F,
    ) -> Result<(), RegistryError>
    where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
    {
        let name = name.into();
        if name == LIST_TOOLS {
            return Err(RegistryError::ReservedName { name });
        }
        if self.index.contains_key(&name) {
            return Err(RegistryError::DuplicateTool { name });
        }

        let handler: ToolHandler = Arc::new(move |params| handler(params).boxed());
        self.index.insert(name.clone(), self.tools.len());
        self.tools.push(Tool {
            name,
            description: description.into(),
            schema,
            handler,
        });
        Ok(())
    }

    /// Look up a tool by name
    pub fn get(&self, name: &str) -> Result<&Tool, RegistryError> {
        self.index
            .get(name)
            .map(|&position| &self.tools[position])
            .ok_or_else(|| RegistryError::NotFound {
                name: name.to_string(),
            })
    }

    /// Descriptors for every tool, in registration order
    pub fn list(&self) -> Vec<ToolDescriptor> {
        self.tools.iter().map(Tool::descriptor).collect()
    }

    pub fn names(&self) -> Vec<&str> {
        self.tools.iter().map(|tool| tool.name.as_str()).collect()
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }
}
