//! The template collaborator: per-method message templates.
//!
//! Templates are looked up by delivery method as `notify_<method>.html`. A
//! theme may override the default:
//!
//! ```text
//! <root>/themes/<theme>/msg/notify_email.html   (override)
//! <root>/msg/notify_email.html                   (default)
//! ```
//!
//! Rendering uses minijinja with HTML auto-escaping.

use std::collections::BTreeMap;
use std::io;
use std::path::PathBuf;

use minijinja::Environment;
use thiserror::Error;

use crate::callback::digest::DigestView;
use crate::types::DeliveryMethod;

/// Name of the theme that has no override directory.
pub const DEFAULT_THEME: &str = "default";

/// Errors from template resolution and rendering.
#[derive(Debug, Error)]
pub enum TemplateError {
    #[error("no template for {method} (theme {theme})")]
    Missing {
        method: DeliveryMethod,
        theme: String,
    },

    #[error("failed to read template {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: io::Error,
    },

    /// The template is malformed or failed while rendering.
    #[error("{name}: {source}")]
    Render {
        name: String,
        #[source]
        source: minijinja::Error,
    },
}

/// A resolved template, ready to render.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TemplateHandle {
    pub method: DeliveryMethod,
    /// Path relative to the template root; also the template name.
    pub name: String,
    pub source: String,
}

/// Resolves and renders channel-specific templates.
pub trait TemplateSet: Send + Sync {
    fn resolve(&self, method: DeliveryMethod, theme: &str)
    -> Result<TemplateHandle, TemplateError>;

    fn render(&self, handle: &TemplateHandle, view: &DigestView) -> Result<String, TemplateError>;
}

/// Where [`MiniJinjaTemplates`] reads template sources from.
#[derive(Debug, Clone)]
enum Source {
    Dir(PathBuf),
    Memory(BTreeMap<String, String>),
}

/// [`TemplateSet`] backed by minijinja.
#[derive(Debug, Clone)]
pub struct MiniJinjaTemplates {
    source: Source,
}

impl MiniJinjaTemplates {
    /// Reads templates from a directory, at resolve time.
    pub fn from_dir(root: impl Into<PathBuf>) -> Self {
        MiniJinjaTemplates {
            source: Source::Dir(root.into()),
        }
    }

    /// Serves templates from memory, keyed by relative path.
    pub fn in_memory<I, K, V>(templates: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        MiniJinjaTemplates {
            source: Source::Memory(
                templates
                    .into_iter()
                    .map(|(k, v)| (k.into(), v.into()))
                    .collect(),
            ),
        }
    }

    fn candidates(method: DeliveryMethod, theme: &str) -> Vec<String> {
        let file = format!("notify_{}.html", method.template_name());
        let mut paths = Vec::with_capacity(2);
        if theme != DEFAULT_THEME {
            paths.push(format!("themes/{theme}/msg/{file}"));
        }
        paths.push(format!("msg/{file}"));
        paths
    }

    fn read(&self, name: &str) -> Result<Option<String>, TemplateError> {
        match &self.source {
            Source::Memory(map) => Ok(map.get(name).cloned()),
            Source::Dir(root) => match std::fs::read_to_string(root.join(name)) {
                Ok(source) => Ok(Some(source)),
                Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
                Err(e) => Err(TemplateError::Io {
                    path: name.to_string(),
                    source: e,
                }),
            },
        }
    }
}

impl TemplateSet for MiniJinjaTemplates {
    fn resolve(
        &self,
        method: DeliveryMethod,
        theme: &str,
    ) -> Result<TemplateHandle, TemplateError> {
        for name in Self::candidates(method, theme) {
            if let Some(source) = self.read(&name)? {
                return Ok(TemplateHandle {
                    method,
                    name,
                    source,
                });
            }
        }
        Err(TemplateError::Missing {
            method,
            theme: theme.to_string(),
        })
    }

    fn render(&self, handle: &TemplateHandle, view: &DigestView) -> Result<String, TemplateError> {
        let render_err = |source| TemplateError::Render {
            name: handle.name.clone(),
            source,
        };
        let mut env = Environment::new();
        env.add_template(&handle.name, &handle.source)
            .map_err(render_err)?;
        let template = env.get_template(&handle.name).map_err(render_err)?;
        template.render(view).map_err(render_err)
    }
}
