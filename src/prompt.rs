//! The prompt we send along with extracted text.

use handlebars::Handlebars;

use crate::prelude::*;

/// The default correction/translation prompt. `{{text}}` is replaced by the
/// extracted text.
pub const DEFAULT_PROMPT_TEMPLATE: &str = "In the french text below, fix all spelling mistakes and fill in any missing words. Output the results in french and english. Text: {{text}}";

/// Name under which we register our template.
const TEMPLATE_NAME: &str = "prompt";

/// A compiled prompt template.
#[derive(Debug)]
pub struct PromptTemplate {
    handlebars: Handlebars<'static>,
}

impl PromptTemplate {
    /// Compile a template. Syntax errors are reported here, not when we first
    /// render.
    pub fn new(template: &str) -> Result<Self> {
        let mut handlebars = Handlebars::new();
        // This is a prompt, not HTML.
        handlebars.register_escape_fn(handlebars::no_escape);
        handlebars.set_strict_mode(true);
        handlebars
            .register_template_string(TEMPLATE_NAME, template)
            .context("failed to parse prompt template")?;
        Ok(Self { handlebars })
    }

    /// Load a template from a file.
    pub async fn from_path(path: &Path) -> Result<Self> {
        let template = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("failed to read prompt template {:?}", path.display()))?;
        Self::new(&template)
    }

    /// Render the prompt for some extracted text.
    pub fn render(&self, text: &str) -> Result<String> {
        self.handlebars
            .render(TEMPLATE_NAME, &json!({ "text": text }))
            .context("error rendering prompt")
    }
}

impl Default for PromptTemplate {
    fn default() -> Self {
        Self::new(DEFAULT_PROMPT_TEMPLATE).expect("built-in prompt template should be valid")
    }
}
