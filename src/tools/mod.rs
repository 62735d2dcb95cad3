pub mod calculator;

use crate::registry::{RegistryError, ToolRegistry};

/// Register every built-in tool.
pub fn register_builtin(registry: &ToolRegistry) -> Result<(), RegistryError> {
    registry.add_tool(calculator::descriptor()?);
    Ok(())
}
