use std::{collections::BTreeSet, sync::Arc};

use chrono::Utc;
use tracing::{debug, info};

use crate::{
    error::DispatchError,
    models::{
        message::Channel,
        template::{DEFAULT_TREATMENT, Template, TemplateVariant, VariantContent, VariantKey},
        validation::{validate_template_name, validate_variant_key},
    },
    render::placeholders,
    store::{MessageStore, TemplateRepository},
};

/// Picks the variant for (language, treatment), falling back first to the
/// default treatment in the same language, then to the default variant.
pub fn select_variant<'a>(
    template: &'a Template,
    language: &str,
    treatment: &str,
) -> Option<&'a TemplateVariant> {
    [
        VariantKey::new(language, treatment),
        VariantKey::new(language, DEFAULT_TREATMENT),
        VariantKey::default_key(),
    ]
    .iter()
    .find_map(|key| template.variant(key))
}

/// Placeholder names referenced by any variant for the given channels.
pub fn template_placeholders(template: &Template, channels: &[Channel]) -> BTreeSet<String> {
    let mut names = BTreeSet::new();
    for variant in &template.variants {
        for channel in channels {
            match channel {
                Channel::Sms => names.extend(placeholders(&variant.sms_body)),
                Channel::Email => {
                    names.extend(placeholders(&variant.email_subject));
                    names.extend(placeholders(&variant.email_body));
                }
            }
        }
    }
    names
}

#[derive(Clone)]
pub struct TemplateStore {
    templates: Arc<dyn TemplateRepository>,
    messages: Arc<dyn MessageStore>,
}

impl TemplateStore {
    pub fn new(templates: Arc<dyn TemplateRepository>, messages: Arc<dyn MessageStore>) -> Self {
        Self { templates, messages }
    }

    pub async fn get(&self, name: &str) -> Result<Template, DispatchError> {
        self.templates
            .find_template(name)
            .await?
            .ok_or_else(|| DispatchError::TemplateNotFound(name.to_string()))
    }

    pub async fn resolve(
        &self,
        name: &str,
        language: &str,
        treatment: &str,
    ) -> Result<(Template, TemplateVariant), DispatchError> {
        let template = self.get(name).await?;

        let variant = select_variant(&template, language, treatment)
            .cloned()
            .ok_or_else(|| DispatchError::VariantUnresolvable {
                template: template.name.clone(),
                requested: VariantKey::new(language, treatment),
            })?;

        debug!(
            template = %template.name,
            requested_language = language,
            requested_treatment = treatment,
            language = %variant.language,
            treatment = %variant.treatment,
            "Template variant resolved"
        );

        Ok((template, variant))
    }

    /// Creates a template together with its mandatory default variant.
    pub async fn create_template(
        &self,
        name: &str,
        default_variant: VariantContent,
    ) -> Result<Template, DispatchError> {
        validate_template_name(name).map_err(DispatchError::Validation)?;

        let template = Template {
            name: name.trim().to_string(),
            variants: vec![default_variant.into_variant(VariantKey::default_key())],
            created_at: Utc::now(),
        };

        if !self.templates.insert_template(&template).await? {
            return Err(DispatchError::DuplicateTemplate(template.name));
        }

        info!(template = %template.name, "Template created");
        Ok(template)
    }

    pub async fn create_variant(
        &self,
        template_name: &str,
        key: VariantKey,
        content: VariantContent,
    ) -> Result<TemplateVariant, DispatchError> {
        validate_variant_key(&key.language, &key.treatment).map_err(DispatchError::Validation)?;
        let template = self.get(template_name).await?;

        if template.variant(&key).is_some() {
            return Err(DispatchError::DuplicateVariant {
                template: template.name,
                key,
            });
        }

        let variant = content.into_variant(key.clone());
        if !self.templates.insert_variant(&template.name, &variant).await? {
            return Err(DispatchError::DuplicateVariant {
                template: template.name,
                key,
            });
        }

        info!(template = %template.name, variant = %key, "Template variant created");
        Ok(variant)
    }

    pub async fn delete_variant(&self, template_name: &str, key: &VariantKey) -> Result<(), DispatchError> {
        let template = self.get(template_name).await?;

        if template.variant(key).is_none() {
            return Err(DispatchError::VariantNotFound {
                template: template.name,
                key: key.clone(),
            });
        }

        if key.is_default() {
            return Err(DispatchError::DefaultVariantRequired(template.name));
        }

        let usage = self.messages.count_variant_usage(&template.name, key).await?;
        if usage > 0 {
            return Err(DispatchError::VariantInUse {
                template: template.name,
                key: key.clone(),
            });
        }

        self.templates.delete_variant(&template.name, key).await?;
        info!(template = %template.name, variant = %key, "Template variant deleted");
        Ok(())
    }
}
