//! Template renderer using Tera for Jinja2-style template rendering
//! Renders the VM definition, the cloud-init network fragment and the post-install script

use super::embedded_templates;
use crate::provisioner::ProvisionError;
use std::path::{Path, PathBuf};
use tera::{Context, Tera};

pub struct TemplateRenderer {
    tera: Tera,
    templates_dir: PathBuf,
}

impl TemplateRenderer {
    /// Create a TemplateRenderer from embedded templates (compiled into the binary).
    pub fn from_embedded() -> Result<Self, ProvisionError> {
        tracing::debug!("[TemplateRenderer] Initializing Tera from embedded templates");

        let mut tera = Tera::default();
        for (name, content) in embedded_templates::ALL_TEMPLATES {
            tera.add_raw_template(name, content).map_err(|e| {
                ProvisionError::Template(format!("Failed to add embedded template {}: {}", name, e))
            })?;
            tracing::debug!("[TemplateRenderer] Loaded embedded template: {}", name);
        }

        tracing::info!(
            "[TemplateRenderer] Loaded {} embedded templates",
            embedded_templates::ALL_TEMPLATES.len()
        );

        Ok(Self {
            tera,
            templates_dir: PathBuf::from("(embedded)"),
        })
    }

    /// Create a TemplateRenderer from a directory, falling back to the
    /// embedded copy for any template the directory does not provide.
    pub fn new(templates_dir: PathBuf) -> Result<Self, ProvisionError> {
        tracing::debug!(
            "[TemplateRenderer] Initializing Tera with templates_dir: {}",
            templates_dir.display()
        );

        let mut tera = Tera::default();
        let mut from_disk = 0;

        for (name, embedded) in embedded_templates::ALL_TEMPLATES {
            let path = templates_dir.join(name);
            let content = if path.is_file() {
                from_disk += 1;
                std::fs::read_to_string(&path)?
            } else {
                embedded.to_string()
            };
            tera.add_raw_template(name, &content).map_err(|e| {
                ProvisionError::Template(format!("Failed to add template {}: {}", name, e))
            })?;
        }

        tracing::info!(
            "[TemplateRenderer] Loaded {} templates from {} ({} embedded)",
            from_disk,
            templates_dir.display(),
            embedded_templates::ALL_TEMPLATES.len() - from_disk
        );

        Ok(Self {
            tera,
            templates_dir,
        })
    }

    /// Render a template with a Tera Context
    pub fn render(&self, template_name: &str, context: &Context) -> Result<String, ProvisionError> {
        let rendered = self.tera.render(template_name, context).map_err(|e| {
            ProvisionError::Template(format!(
                "Failed to render template {}: {}",
                template_name, e
            ))
        })?;

        tracing::debug!(
            "[TemplateRenderer] Rendered template {} ({} bytes)",
            template_name,
            rendered.len()
        );

        Ok(rendered)
    }

    /// List all loaded template names
    pub fn list_templates(&self) -> Vec<String> {
        self.tera.get_template_names().map(String::from).collect()
    }

    pub fn templates_dir(&self) -> &Path {
        &self.templates_dir
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_embedded_templates_load() {
        let renderer = TemplateRenderer::from_embedded().unwrap();
        let mut names = renderer.list_templates();
        names.sort();
        assert_eq!(
            names,
            vec!["cloudinit.tail.j2", "post-install.sh.j2", "vm.conf.j2"]
        );
    }

    #[test]
    fn test_missing_variable_is_template_error() {
        let renderer = TemplateRenderer::from_embedded().unwrap();
        let err = renderer
            .render("cloudinit.tail.j2", &Context::new())
            .unwrap_err();
        assert!(matches!(err, ProvisionError::Template(_)));
    }
}
