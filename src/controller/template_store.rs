use super::context::Context;
use super::error::ReconcileError;
use crate::resources::{Kind, PodTemplate, SandboxTemplate};

/// A template looked up by name, with its hash computed.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct ResolvedTemplate {
    pub name: String,
    pub pod_template: PodTemplate,
    pub hash: String,
}

/// Read-only view of the templates in the store.
pub(crate) struct TemplateStore<'a> {
    ctx: &'a Context,
}

impl<'a> TemplateStore<'a> {
    pub fn new(ctx: &'a Context) -> Self {
        Self { ctx }
    }

    /// Looks up `name`.
    ///
    /// A missing or invalid template is a `Validation` error; store failures
    /// pass through as they are.
    pub async fn resolve(&self, name: &str) -> Result<ResolvedTemplate, ReconcileError> {
        let template = self
            .ctx
            .get::<SandboxTemplate>(name)
            .await?
            .ok_or_else(|| {
                ReconcileError::validation(Kind::Template, name, "template not found")
            })?;

        let pod_template = template.spec.pod_template;
        pod_template
            .validate()
            .map_err(|message| ReconcileError::validation(Kind::Template, name, message))?;

        Ok(ResolvedTemplate {
            name: name.to_string(),
            hash: pod_template.hash(),
            pod_template,
        })
    }
}
