//! Tera-backed document rendering.
//!
//! Templates are registered up front by name; a generate-document
//! directive only ever references a registered template, so a typo in
//! a model payload fails loudly instead of writing an empty document.

use anyhow::{Context, Result};
use async_trait::async_trait;
use tera::Tera;

use crate::effects::DocumentRenderer;

pub struct TeraDocumentRenderer {
    templates: Tera,
}

impl TeraDocumentRenderer {
    pub fn new(templates: impl IntoIterator<Item = (&'static str, &'static str)>) -> Result<Self> {
        let mut tera = Tera::default();
        for (name, body) in templates {
            tera.add_raw_template(name, body)
                .with_context(|| format!("template `{name}` failed to compile"))?;
        }
        Ok(Self { templates: tera })
    }

    /// Built-in document set. Tenants cannot add templates from chat;
    /// new ones ship with the binary.
    pub fn with_builtin_templates() -> Result<Self> {
        Self::new([
            (
                "welcome",
                "Welcome aboard, {{ business_name | default(value=\"there\") }}!\n\
                 Your workspace is ready.",
            ),
            (
                "investor-summary",
                "Investor summary for {{ investor_name | default(value=\"investor\") }}\n\
                 Prepared {{ prepared_at | default(value=\"today\") }}.",
            ),
        ])
    }
}

#[async_trait]
impl DocumentRenderer for TeraDocumentRenderer {
    async fn render(
        &self,
        template: &str,
        context: &serde_json::Value,
        _idempotency_key: &str,
    ) -> Result<String> {
        let context = tera::Context::from_value(context.clone())
            .context("document context must be a JSON object")?;
        self.templates
            .render(template, &context)
            .with_context(|| format!("template `{template}` failed to render"))
    }
}
