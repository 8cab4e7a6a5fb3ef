//! Variable substitution for encoder argument templates.

use std::collections::HashMap;
use std::path::Path;

use streamcoder_common::TargetFormat;

use crate::{Error, Result};

/// Variables every encoder template must reference.
pub const REQUIRED_VARS: &[&str] = &["input", "output"];

/// Variable substitution context for encoder argument templates.
///
/// Supports variable substitution in strings using the `{varname}` syntax.
///
/// # Example
///
/// ```
/// use std::path::Path;
/// use streamcoder_av::TemplateContext;
/// use streamcoder_common::TargetFormat;
///
/// let ctx = TemplateContext::new().with_encode(
///     Path::new("/videos/clip.avi"),
///     Path::new("/videos/clip.avi.mp4"),
///     "800x450",
///     TargetFormat::Mp4,
/// );
///
/// assert_eq!(ctx.substitute("{resolution}"), "800x450");
/// assert_eq!(ctx.substitute("{filestem}.{format}"), "clip.mp4");
/// ```
#[derive(Debug, Clone)]
pub struct TemplateContext {
    vars: HashMap<String, String>,
}

impl TemplateContext {
    /// Create a new empty template context.
    pub fn new() -> Self {
        Self {
            vars: HashMap::new(),
        }
    }

    /// Set the variables describing one encode.
    ///
    /// This adds the following variables:
    /// - `{input}` - Full path to the source file
    /// - `{output}` - Full path to the output file
    /// - `{resolution}` - Target resolution, `WIDTHxHEIGHT`
    /// - `{format}` - Target format name (`mp4`, `mkv`, ...)
    /// - `{filename}` - Source file name with extension
    /// - `{filestem}` - Source file name without extension
    pub fn with_encode(
        mut self,
        input: &Path,
        output: &Path,
        resolution: &str,
        format: TargetFormat,
    ) -> Self {
        self.set("input", &input.display().to_string());
        self.set("output", &output.display().to_string());
        self.set("resolution", resolution);
        self.set("format", format.extension());

        if let Some(name) = input.file_name() {
            self.set("filename", &name.to_string_lossy());
        }
        if let Some(stem) = input.file_stem() {
            self.set("filestem", &stem.to_string_lossy());
        }

        self
    }

    /// Add a custom variable.
    pub fn with_var(mut self, key: &str, value: &str) -> Self {
        self.set(key, value);
        self
    }

    /// Set a variable.
    pub fn set(&mut self, key: &str, value: &str) {
        self.vars.insert(key.to_string(), value.to_string());
    }

    /// Get a variable value.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.vars.get(key).map(|s| s.as_str())
    }

    /// Substitute variables in a string.
    ///
    /// Variables are in the form `{varname}`.
    pub fn substitute(&self, template: &str) -> String {
        let mut result = template.to_string();
        for (key, value) in &self.vars {
            result = result.replace(&format!("{{{}}}", key), value);
        }
        result
    }

    /// Substitute variables in a list of strings.
    pub fn substitute_all(&self, templates: &[String]) -> Vec<String> {
        templates.iter().map(|t| self.substitute(t)).collect()
    }
}

impl Default for TemplateContext {
    fn default() -> Self {
        Self::new()
    }
}

/// Check that an argument template names both the input and the output.
pub fn validate_template(templates: &[String]) -> Result<()> {
    for var in REQUIRED_VARS {
        let placeholder = format!("{{{var}}}");
        if !templates.iter().any(|t| t.contains(&placeholder)) {
            return Err(Error::InvalidInput(format!(
                "encoder argument template must reference {placeholder}"
            )));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn test_substitute() {
        let ctx = TemplateContext::new().with_encode(
            &PathBuf::from("/videos/clip.avi"),
            &PathBuf::from("/videos/clip.avi.mkv"),
            "640x360",
            TargetFormat::Mkv,
        );

        assert_eq!(ctx.substitute("{input}"), "/videos/clip.avi");
        assert_eq!(ctx.substitute("{output}"), "/videos/clip.avi.mkv");
        assert_eq!(ctx.substitute("scale={resolution}"), "scale=640x360");
        assert_eq!(ctx.substitute("{filename}"), "clip.avi");
        assert_eq!(ctx.get("format"), Some("mkv"));
    }

    #[test]
    fn test_custom_var() {
        let ctx = TemplateContext::new()
            .with_var("preset", "veryfast")
            .with_var("crf", "23");

        assert_eq!(ctx.substitute("-preset {preset} -crf {crf}"), "-preset veryfast -crf 23");
    }

    #[test]
    fn test_unknown_vars_are_left_alone() {
        let ctx = TemplateContext::new().with_var("name", "test");
        assert_eq!(ctx.substitute("{name}-{other}"), "test-{other}");
    }

    #[test]
    fn test_validate_template() {
        let ok = vec!["-i".to_string(), "{input}".to_string(), "{output}".to_string()];
        assert!(validate_template(&ok).is_ok());

        let missing_output = vec!["-i".to_string(), "{input}".to_string()];
        let err = validate_template(&missing_output).unwrap_err();
        assert!(err.to_string().contains("{output}"));
    }
}
