use serde::Serialize;

use crate::models::{
    message::{DispatchRequest, Recipient},
    phone::{PhoneNumber, PhoneParsingError},
};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FieldError {
    pub field: String,
    pub reason: String,
}

impl FieldError {
    pub fn new(field: &str, reason: impl Into<String>) -> Self {
        Self {
            field: field.to_string(),
            reason: reason.into(),
        }
    }
}

#[derive(Debug)]
pub enum RecipientError {
    Fields(Vec<FieldError>),
    Phone(PhoneParsingError),
}

/// Checks the cross-field recipient rule and each present address.
pub fn validate_recipient(request: &DispatchRequest) -> Result<Recipient, RecipientError> {
    let phone = present(request.phone.as_deref());
    let email = present(request.email.as_deref());

    if phone.is_none() && email.is_none() {
        return Err(RecipientError::Fields(vec![
            FieldError::new("phone", "at least one of phone or email is required"),
            FieldError::new("email", "at least one of phone or email is required"),
        ]));
    }

    let phone = phone
        .map(PhoneNumber::parse)
        .transpose()
        .map_err(RecipientError::Phone)?;

    if let Some(email) = email {
        validate_email(email).map_err(|e| RecipientError::Fields(vec![e]))?;
    }

    Ok(Recipient {
        phone,
        email: email.map(str::to_string),
    })
}

pub fn validate_email(email: &str) -> Result<(), FieldError> {
    if email.len() > 254 {
        return Err(FieldError::new("email", "email address too long (maximum 254 characters)"));
    }

    if email.chars().any(char::is_whitespace) {
        return Err(FieldError::new("email", "email address contains whitespace"));
    }

    let Some((local, domain)) = email.split_once('@') else {
        return Err(FieldError::new("email", "email address must contain '@'"));
    };

    if local.is_empty() || domain.contains('@') {
        return Err(FieldError::new("email", "email address is malformed"));
    }

    let labels_ok = domain.contains('.') && domain.split('.').all(|label| !label.is_empty());
    if !labels_ok {
        return Err(FieldError::new("email", "email domain is malformed"));
    }

    Ok(())
}

pub fn validate_variant_key(language: &str, treatment: &str) -> Result<(), Vec<FieldError>> {
    let mut errors = Vec::new();

    if language.trim().is_empty() {
        errors.push(FieldError::new("language", "must not be blank"));
    } else if language.len() > 16 {
        errors.push(FieldError::new("language", "too long (maximum 16 characters)"));
    }

    if treatment.trim().is_empty() {
        errors.push(FieldError::new("treatment", "must not be blank"));
    } else if treatment.len() > 16 {
        errors.push(FieldError::new("treatment", "too long (maximum 16 characters)"));
    }

    if errors.is_empty() { Ok(()) } else { Err(errors) }
}

pub fn validate_template_name(name: &str) -> Result<(), Vec<FieldError>> {
    if name.trim().is_empty() {
        return Err(vec![FieldError::new("name", "must not be blank")]);
    }

    let valid_chars = name
        .chars()
        .all(|c| c.is_alphanumeric() || c == '_' || c == '-' || c == '.');

    if !valid_chars {
        return Err(vec![FieldError::new("name", "contains invalid characters")]);
    }

    Ok(())
}

fn present(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|v| !v.is_empty())
}
