pub mod embedded_templates;
pub mod template_renderer;

pub use template_renderer::TemplateRenderer;
