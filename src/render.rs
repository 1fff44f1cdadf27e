//! `{{placeholder}}` substitution.
//!
//! `{{key}}` inserts the HTML-escaped value, `{{{key}}}` inserts it verbatim.
//! Output depends only on the template and the parameter values, which keeps
//! fingerprints stable across renders.

use std::collections::{BTreeSet, HashMap};

use serde_json::Value as JsonValue;
use tracing::debug;

use crate::{
    error::DispatchError,
    models::{
        message::Channel,
        template::{RenderedContent, TemplateVariant},
    },
};

#[derive(Debug, PartialEq, Eq)]
enum Segment<'a> {
    Text(&'a str),
    Escaped(&'a str),
    Raw(&'a str),
}

fn parse(template: &str) -> Vec<Segment<'_>> {
    let mut segments = Vec::new();
    let mut rest = template;

    while let Some(start) = rest.find("{{") {
        if start > 0 {
            segments.push(Segment::Text(&rest[..start]));
        }
        let tail = &rest[start..];

        match marker(tail) {
            Some((segment, consumed)) => {
                segments.push(segment);
                rest = &tail[consumed..];
            }
            None => {
                segments.push(Segment::Text("{{"));
                rest = &tail[2..];
            }
        }
    }

    if !rest.is_empty() {
        segments.push(Segment::Text(rest));
    }

    segments
}

/// Recognises a marker at the start of `tail`, returning it and its length.
fn marker(tail: &str) -> Option<(Segment<'_>, usize)> {
    if let Some(inner) = tail.strip_prefix("{{{") {
        let end = inner.find("}}}")?;
        let key = valid_key(&inner[..end])?;
        return Some((Segment::Raw(key), 3 + end + 3));
    }

    let inner = &tail[2..];
    let end = inner.find("}}")?;
    let key = valid_key(&inner[..end])?;
    Some((Segment::Escaped(key), 2 + end + 2))
}

fn valid_key(raw: &str) -> Option<&str> {
    let key = raw.trim();
    let ok = !key.is_empty() && !key.contains(['{', '}']) && !key.contains(char::is_whitespace);
    ok.then_some(key)
}

/// Every placeholder name referenced by `template`, escaped or raw.
pub fn placeholders(template: &str) -> BTreeSet<String> {
    parse(template)
        .into_iter()
        .filter_map(|segment| match segment {
            Segment::Escaped(key) | Segment::Raw(key) => Some(key.to_string()),
            Segment::Text(_) => None,
        })
        .collect()
}

pub fn render(template: &str, params: &HashMap<String, JsonValue>) -> Result<String, DispatchError> {
    let segments = parse(template);

    let missing: BTreeSet<String> = segments
        .iter()
        .filter_map(|segment| match segment {
            Segment::Escaped(key) | Segment::Raw(key) if !params.contains_key(*key) => {
                Some(key.to_string())
            }
            _ => None,
        })
        .collect();

    if !missing.is_empty() {
        return Err(DispatchError::MissingPlaceholder(missing));
    }

    let mut output = String::with_capacity(template.len());
    for segment in segments {
        match segment {
            Segment::Text(text) => output.push_str(text),
            Segment::Escaped(key) => output.push_str(&escape_html(&value_text(&params[key]))),
            Segment::Raw(key) => output.push_str(&value_text(&params[key])),
        }
    }

    Ok(output)
}

/// Renders the fields of `variant` used by `channel`, reporting every missing
/// placeholder across subject and body together.
pub fn render_variant(
    variant: &TemplateVariant,
    channel: Channel,
    params: &HashMap<String, JsonValue>,
) -> Result<RenderedContent, DispatchError> {
    debug!(
        language = %variant.language,
        treatment = %variant.treatment,
        channel = %channel,
        param_count = params.len(),
        "Rendering template variant"
    );

    match channel {
        Channel::Sms => Ok(RenderedContent {
            subject: None,
            body: render(&variant.sms_body, params)?,
        }),
        Channel::Email => {
            let subject = render(&variant.email_subject, params);
            let body = render(&variant.email_body, params);
            match (subject, body) {
                (Ok(subject), Ok(body)) => Ok(RenderedContent {
                    subject: Some(subject),
                    body,
                }),
                (Err(DispatchError::MissingPlaceholder(mut a)), Err(DispatchError::MissingPlaceholder(b))) => {
                    a.extend(b);
                    Err(DispatchError::MissingPlaceholder(a))
                }
                (Err(e), _) | (_, Err(e)) => Err(e),
            }
        }
    }
}

fn value_text(value: &JsonValue) -> String {
    match value {
        JsonValue::String(s) => s.clone(),
        JsonValue::Null => String::new(),
        JsonValue::Bool(b) => b.to_string(),
        JsonValue::Number(n) => n.to_string(),
        other => other.to_string(),
    }
}

fn escape_html(text: &str) -> String {
    let mut escaped = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '"' => escaped.push_str("&quot;"),
            '\'' => escaped.push_str("&#x27;"),
            _ => escaped.push(c),
        }
    }
    escaped
}
