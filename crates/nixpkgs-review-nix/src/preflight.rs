//! Preflight checks
//!
//! Validates the host before a review starts, so a missing executable or an
//! unsupported platform fails fast instead of halfway through a build.

use crate::error::NixError;
use crate::Result;
use std::path::PathBuf;

/// Locate `tool` in PATH
pub fn require_tool(tool: &str, hint: Option<&str>) -> Result<PathBuf> {
    which::which(tool).map_err(|_| NixError::ToolNotFound {
        tool: tool.to_string(),
        hint: hint.map(str::to_string),
    })
}

/// Check that every `(tool, hint)` pair is available, reporting the first missing one
pub fn require_tools(tools: &[(&str, Option<&str>)]) -> Result<()> {
    for (tool, hint) in tools {
        require_tool(tool, *hint)?;
    }
    Ok(())
}

/// Fail unless the host OS is one of `supported` (values of `std::env::consts::OS`)
pub fn require_platform(feature: &str, supported: &[&str]) -> Result<()> {
    let platform = std::env::consts::OS;
    if supported.contains(&platform) {
        Ok(())
    } else {
        Err(NixError::PlatformUnsupported {
            feature: feature.to_string(),
            supported: supported.join(", "),
            platform: platform.to_string(),
        })
    }
}
