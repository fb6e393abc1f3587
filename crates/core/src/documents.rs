//! Reference [`DocumentGenerator`] rendering plain-text filing drafts from
//! templates embedded at build time.

use async_trait::async_trait;
use sha2::{Digest, Sha256};
use tera::{Context, Tera};

use crate::collaborators::{
    CollaboratorError, DocumentGenerator, DocumentRequest, DocumentTemplate,
};
use crate::domain::compliance::Artifact;

const TEMPLATES: [(DocumentTemplate, &str, &str); 4] = [
    (
        DocumentTemplate::AnnualReport,
        "annual_report.txt.tera",
        include_str!("../../../templates/filings/annual_report.txt.tera"),
    ),
    (
        DocumentTemplate::TaxReturn,
        "tax_return.txt.tera",
        include_str!("../../../templates/filings/tax_return.txt.tera"),
    ),
    (
        DocumentTemplate::LicenseRenewal,
        "license_renewal.txt.tera",
        include_str!("../../../templates/filings/license_renewal.txt.tera"),
    ),
    (
        DocumentTemplate::RegisteredAgentRenewal,
        "registered_agent_renewal.txt.tera",
        include_str!("../../../templates/filings/registered_agent_renewal.txt.tera"),
    ),
];

#[derive(Clone, Debug)]
pub struct TemplateDocumentGenerator {
    tera: Tera,
}

impl TemplateDocumentGenerator {
    pub fn with_embedded_templates() -> Result<Self, CollaboratorError> {
        let mut tera = Tera::default();
        tera.add_raw_templates(TEMPLATES.iter().map(|(_, name, body)| (*name, *body)))
            .map_err(|error| {
                CollaboratorError::Rejected(format!("template load failed: {error}"))
            })?;
        Ok(Self { tera })
    }

    fn template_name(template: DocumentTemplate) -> &'static str {
        TEMPLATES
            .iter()
            .find(|(kind, _, _)| *kind == template)
            .map(|(_, name, _)| *name)
            .unwrap_or("annual_report.txt.tera")
    }

    pub fn render_text(&self, request: &DocumentRequest) -> Result<String, CollaboratorError> {
        let context = Context::from_serialize(&request.data).map_err(|error| {
            CollaboratorError::Rejected(format!("document data must be an object: {error}"))
        })?;
        self.tera
            .render(Self::template_name(request.template), &context)
            .map_err(|error| CollaboratorError::Rejected(format!("render failed: {error}")))
    }
}

#[async_trait]
impl DocumentGenerator for TemplateDocumentGenerator {
    async fn render(&self, request: DocumentRequest) -> Result<Artifact, CollaboratorError> {
        let content = self.render_text(&request)?;
        let checksum = format!("{:x}", Sha256::digest(content.as_bytes()));

        Ok(Artifact {
            name: format!(
                "{}-{}-{}.txt",
                request.jurisdiction.code().to_ascii_lowercase(),
                request.template.as_str(),
                request.idempotency_key
            ),
            media_type: "text/plain; charset=utf-8".to_string(),
            content,
            checksum,
        })
    }
}
