//! Template engine for node boot configuration
//!
//! Plain minijinja syntax (`{{ }}`, `{% %}`) with strict undefined handling,
//! so a misspelled context field fails rendering instead of producing an
//! empty value in a file a machine boots from.

use minijinja::{Environment, UndefinedBehavior};
use serde::Serialize;

use super::filters;
use crate::{Error, Result};

/// minijinja environment with the node config filters registered
pub struct TemplateEngine {
    env: Environment<'static>,
}

impl Default for TemplateEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl TemplateEngine {
    /// Create an engine with strict undefined behavior
    pub fn new() -> Self {
        let mut env = Environment::new();
        env.set_undefined_behavior(UndefinedBehavior::Strict);

        env.add_filter("base64_encode", filters::base64_encode);
        env.add_filter("required", filters::required);

        Self { env }
    }

    /// Render a template string with a serializable context
    ///
    /// # Errors
    ///
    /// Returns `Error::Template` if the syntax is invalid, a referenced
    /// variable is undefined or a filter fails.
    pub fn render<S: Serialize>(&self, template: &str, ctx: &S) -> Result<String> {
        self.env
            .render_str(template, ctx)
            .map_err(|e| Error::template(format!("{:#}", e)))
    }
}
