//! Locating the encoder executable and reporting its version.

use crate::{Error, Result};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

/// What a version probe found out about a tool.
#[derive(Debug, Clone)]
pub struct ToolInfo {
    /// Program as it was named.
    pub name: String,
    /// Whether the program ran and answered the version probe.
    pub available: bool,
    /// Version banner, if any was printed.
    pub version: Option<String>,
    /// Resolved location of the executable.
    pub path: Option<PathBuf>,
}

impl ToolInfo {
    fn missing(name: String) -> Self {
        Self {
            name,
            available: false,
            version: None,
            path: None,
        }
    }

    /// First line of the version banner.
    pub fn version_line(&self) -> Option<&str> {
        self.version.as_deref().and_then(|v| v.lines().next())
    }
}

/// ffmpeg-family tools only understand the single-dash form.
fn version_flag(program: &Path) -> &'static str {
    let ff = program
        .file_name()
        .and_then(|n| n.to_str())
        .is_some_and(|n| n.starts_with("ff"));
    if ff {
        "-version"
    } else {
        "--version"
    }
}

fn is_bare_name(program: &Path) -> bool {
    program.components().count() == 1
}

/// Run `program`'s version probe.
///
/// # Example
///
/// ```no_run
/// use std::path::Path;
/// use streamcoder_av::check_tool;
///
/// let info = check_tool(Path::new("ffmpeg"));
/// if info.available {
///     println!("encoder: {}", info.version_line().unwrap_or("unknown version"));
/// }
/// ```
pub fn check_tool(program: &Path) -> ToolInfo {
    let name = program.display().to_string();

    let output = match Command::new(program)
        .arg(version_flag(program))
        .stdin(Stdio::null())
        .output()
    {
        Ok(output) if output.status.success() => output,
        _ => return ToolInfo::missing(name),
    };

    // Some tools print their banner on stderr.
    let banner = if output.stdout.is_empty() {
        &output.stderr
    } else {
        &output.stdout
    };
    let version = Some(String::from_utf8_lossy(banner).trim().to_string()).filter(|v| !v.is_empty());

    let path = if is_bare_name(program) {
        which::which(program).ok()
    } else {
        Some(program.to_path_buf())
    };

    ToolInfo {
        name,
        available: true,
        version,
        path,
    }
}

/// Look `name` up on `PATH`.
///
/// # Errors
///
/// Returns [`Error::ToolNotFound`] if it is not there.
pub fn require_tool(name: &str) -> Result<PathBuf> {
    which::which(name).map_err(|_| Error::tool_not_found(name))
}

/// Resolve a configured program: an existing path is used as is, a bare name
/// is looked up on `PATH`.
pub fn resolve_tool(configured: &Path) -> Result<PathBuf> {
    if configured.exists() {
        return Ok(configured.to_path_buf());
    }
    if is_bare_name(configured) {
        if let Some(name) = configured.to_str() {
            return require_tool(name);
        }
    }
    Err(Error::tool_not_found(configured.display().to_string()))
}
