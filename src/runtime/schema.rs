//! Validation of tool input schemas against the JSON Schema meta-schema
//!
//! Tools declaring an invalid schema are dropped from the exposed list and
//! reported, never silently included.

use crate::protocol::ToolDefinition;
use crate::utils::errors::McpError;
use tracing::warn;

/// Split a fetched tool list into schema-valid tools and per-tool errors.
pub fn validate_tools(tools: Vec<ToolDefinition>) -> (Vec<ToolDefinition>, Vec<McpError>) {
    let mut valid = Vec::with_capacity(tools.len());
    let mut rejected = Vec::new();
    for tool in tools {
        match validate_tool(&tool) {
            Ok(()) => valid.push(tool),
            Err(e) => {
                warn!(tool = %tool.name, error = %e, "dropping tool with invalid schema");
                rejected.push(e);
            }
        }
    }
    (valid, rejected)
}

fn validate_tool(tool: &ToolDefinition) -> Result<(), McpError> {
    let schema = match &tool.input_schema {
        Some(schema) => schema,
        // No declared parameters is fine.
        None => return Ok(()),
    };
    jsonschema::meta::validate(schema).map_err(|e| McpError::ToolSchemaInvalid {
        tool: tool.name.clone(),
        reason: e.to_string(),
    })?;
    // Meta-validity does not guarantee compilability (e.g. bad $ref).
    jsonschema::validator_for(schema).map_err(|e| McpError::ToolSchemaInvalid {
        tool: tool.name.clone(),
        reason: e.to_string(),
    })?;
    Ok(())
}
