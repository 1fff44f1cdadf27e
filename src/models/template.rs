use std::fmt::{Display, Formatter, Result as FmtResult};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub const DEFAULT_LANGUAGE: &str = "en";
pub const DEFAULT_TREATMENT: &str = "A";

/// (language, treatment) pair identifying a variant within its template.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct VariantKey {
    pub language: String,
    pub treatment: String,
}

impl VariantKey {
    pub fn new(language: impl Into<String>, treatment: impl Into<String>) -> Self {
        Self {
            language: language.into(),
            treatment: treatment.into(),
        }
    }

    pub fn default_key() -> Self {
        Self::new(DEFAULT_LANGUAGE, DEFAULT_TREATMENT)
    }

    pub fn is_default(&self) -> bool {
        self.language == DEFAULT_LANGUAGE && self.treatment == DEFAULT_TREATMENT
    }
}

impl Display for VariantKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        write!(f, "({}, {})", self.language, self.treatment)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TemplateVariant {
    pub language: String,
    pub treatment: String,
    pub email_subject: String,
    pub email_body: String,
    pub sms_body: String,
}

impl TemplateVariant {
    pub fn key(&self) -> VariantKey {
        VariantKey::new(self.language.clone(), self.treatment.clone())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Template {
    pub name: String,
    pub variants: Vec<TemplateVariant>,
    pub created_at: DateTime<Utc>,
}

impl Template {
    pub fn variant(&self, key: &VariantKey) -> Option<&TemplateVariant> {
        self.variants
            .iter()
            .find(|v| v.language == key.language && v.treatment == key.treatment)
    }
}

/// Rendered content for one channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RenderedContent {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subject: Option<String>,
    pub body: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CreateTemplateRequest {
    pub name: String,
    pub default_variant: VariantContent,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CreateVariantRequest {
    pub language: String,
    pub treatment: String,

    #[serde(flatten)]
    pub content: VariantContent,
}

#[derive(Debug, Clone, Deserialize)]
pub struct VariantContent {
    #[serde(default)]
    pub email_subject: String,

    #[serde(default)]
    pub email_body: String,

    #[serde(default)]
    pub sms_body: String,
}

impl VariantContent {
    pub fn into_variant(self, key: VariantKey) -> TemplateVariant {
        TemplateVariant {
            language: key.language,
            treatment: key.treatment,
            email_subject: self.email_subject,
            email_body: self.email_body,
            sms_body: self.sms_body,
        }
    }
}
