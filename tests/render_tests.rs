use std::collections::{BTreeSet, HashMap};

use anyhow::Result;
use dispatch_service::{
    error::DispatchError,
    models::{message::Channel, template::TemplateVariant},
    render::{placeholders, render, render_variant},
};
use serde_json::{Value as JsonValue, json};

fn params(pairs: &[(&str, JsonValue)]) -> HashMap<String, JsonValue> {
    pairs.iter().map(|(k, v)| (k.to_string(), v.clone())).collect()
}

/// Test: Placeholders are replaced with their parameter values
#[test]
fn test_render_substitutes_values() -> Result<()> {
    let out = render("Hi {{n}}, your code is {{ code }}", &params(&[("n", json!("Jo")), ("code", json!(42))]))?;
    assert_eq!(out, "Hi Jo, your code is 42");
    Ok(())
}

/// Test: Double braces escape HTML, triple braces insert raw text
#[test]
fn test_render_escapes_unless_triple_braced() -> Result<()> {
    let p = params(&[("v", json!("<b>Tom & Jerry</b>"))]);

    assert_eq!(render("{{v}}", &p)?, "&lt;b&gt;Tom &amp; Jerry&lt;/b&gt;");
    assert_eq!(render("{{{v}}}", &p)?, "<b>Tom & Jerry</b>");

    Ok(())
}

/// Test: Every missing placeholder is reported at once
#[test]
fn test_render_reports_all_missing_placeholders() {
    let result = render("{{a}} {{b}} {{{c}}}", &params(&[("b", json!("x"))]));

    match result {
        Err(DispatchError::MissingPlaceholder(missing)) => {
            assert_eq!(missing, BTreeSet::from(["a".to_string(), "c".to_string()]));
        }
        other => panic!("expected MissingPlaceholder, got {:?}", other),
    }
}

/// Test: Unused parameters are ignored
#[test]
fn test_render_ignores_extra_params() -> Result<()> {
    let out = render("static text", &params(&[("unused", json!("x"))]))?;
    assert_eq!(out, "static text");
    Ok(())
}

/// Test: Rendering the same inputs twice yields identical bytes
#[test]
fn test_render_is_deterministic() -> Result<()> {
    let p = params(&[("n", json!("Jo")), ("flag", json!(true)), ("none", JsonValue::Null)]);
    let template = "{{n}}/{{flag}}/{{none}}";

    assert_eq!(render(template, &p)?, render(template, &p)?);
    assert_eq!(render(template, &p)?, "Jo/true/");

    Ok(())
}

/// Test: Placeholder discovery covers both marker forms
#[test]
fn test_placeholders_lists_names() {
    assert_eq!(
        placeholders("Dear {{ name }}, see {{{link}}} or {{name}}"),
        BTreeSet::from(["link".to_string(), "name".to_string()])
    );
}

/// Test: Email rendering fills the subject, SMS rendering leaves it empty
#[test]
fn test_render_variant_per_channel() -> Result<()> {
    let variant = TemplateVariant {
        language: "en".to_string(),
        treatment: "A".to_string(),
        email_subject: "Hello {{n}}".to_string(),
        email_body: "<p>Hi {{n}}</p>".to_string(),
        sms_body: "Hi {{n}}".to_string(),
    };
    let p = params(&[("n", json!("Jo"))]);

    let email = render_variant(&variant, Channel::Email, &p)?;
    assert_eq!(email.subject.as_deref(), Some("Hello Jo"));
    assert_eq!(email.body, "<p>Hi Jo</p>");

    let sms = render_variant(&variant, Channel::Sms, &p)?;
    assert_eq!(sms.subject, None);
    assert_eq!(sms.body, "Hi Jo");

    Ok(())
}
