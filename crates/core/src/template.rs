//! Notification templates and `{{placeholder}}` rendering.
//!
//! Rendering never fails: an unknown placeholder renders as the empty
//! string, so a template problem can never block delivery.

use std::collections::HashMap;
use std::sync::LazyLock;

use regex::{Captures, Regex};
use serde::{Deserialize, Serialize};
use validator::Validate;

use crate::notification::Channel;
use crate::types::{DbId, TenantId, Timestamp};

/// Regex pattern matching `{{placeholder}}` tokens, with optional inner whitespace.
pub const PLACEHOLDER_PATTERN: &str = r"\{\{\s*([a-zA-Z_][a-zA-Z0-9_.]*)\s*\}\}";

static PLACEHOLDER_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(PLACEHOLDER_PATTERN).expect("valid regex"));

/// Default language used when a caller does not ask for one.
pub const DEFAULT_LANGUAGE: &str = "en";

/// Variable bindings for rendering.
pub type Variables = HashMap<String, String>;

/// A row from the `notification_templates` table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Template {
    pub id: DbId,
    pub tenant_id: TenantId,
    pub name: String,
    pub template_type: String,
    pub channel: Channel,
    pub language_code: String,
    pub subject_template: Option<String>,
    pub body_template: String,
    pub variables: Vec<String>,
    pub is_active: bool,
    pub is_default: bool,
    pub created_at: Timestamp,
    pub updated_at: Timestamp,
}

impl Template {
    pub fn render_subject(&self, vars: &Variables) -> Option<String> {
        self.subject_template.as_deref().map(|s| render(s, vars))
    }

    pub fn render_body(&self, vars: &Variables) -> String {
        render(&self.body_template, vars)
    }
}

/// DTO for creating a template.
#[derive(Debug, Clone, Deserialize, Validate)]
pub struct CreateTemplate {
    #[validate(length(min = 1, max = 100))]
    pub name: String,
    #[validate(length(min = 1, max = 50))]
    pub template_type: String,
    pub channel: Channel,
    #[validate(length(min = 2, max = 10))]
    pub language_code: String,
    #[validate(length(max = 200))]
    pub subject_template: Option<String>,
    #[validate(length(min = 1))]
    pub body_template: String,
    #[serde(default)]
    pub is_default: bool,
}

// ---------------------------------------------------------------------------
// Rendering
// ---------------------------------------------------------------------------

/// Substitute every `{{name}}` in `template` from `vars`.
pub fn render(template: &str, vars: &Variables) -> String {
    PLACEHOLDER_RE
        .replace_all(template, |caps: &Captures| {
            vars.get(&caps[1]).cloned().unwrap_or_default()
        })
        .into_owned()
}

/// Extract the placeholder names used in a template.
///
/// Returns a de-duplicated, sorted list of names (without braces).
pub fn placeholders(template: &str) -> Vec<String> {
    let mut names: Vec<String> = PLACEHOLDER_RE
        .captures_iter(template)
        .map(|caps| caps[1].to_string())
        .collect();
    names.sort();
    names.dedup();
    names
}

/// Choose the template for `(template_type, channel, language)`.
///
/// An active exact-language match wins; otherwise the active default for
/// `(template_type, channel)` is used.
pub fn select<'a>(
    templates: &'a [Template],
    template_type: &str,
    channel: Channel,
    language: &str,
) -> Option<&'a Template> {
    let candidates = || {
        templates
            .iter()
            .filter(move |t| t.is_active && t.template_type == template_type && t.channel == channel)
    };
    candidates()
        .find(|t| t.language_code == language)
        .or_else(|| candidates().find(|t| t.is_default))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use super::*;

    fn vars(pairs: &[(&str, &str)]) -> Variables {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    fn template(id: DbId, channel: Channel, language: &str, is_default: bool) -> Template {
        Template {
            id,
            tenant_id: 1,
            name: format!("t{id}"),
            template_type: "BUDGET_THRESHOLD".into(),
            channel,
            language_code: language.into(),
            subject_template: Some("Budget {{budget}}".into()),
            body_template: "Usage at {{usage}}%".into(),
            variables: vec!["budget".into(), "usage".into()],
            is_active: true,
            is_default,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn render_substitutes_known_variables() {
        let out = render(
            "Budget {{ name }} reached {{pct}}%",
            &vars(&[("name", "HVAC"), ("pct", "85")]),
        );
        assert_eq!(out, "Budget HVAC reached 85%");
    }

    #[test]
    fn missing_variable_renders_empty() {
        assert_eq!(render("Hello {{who}}!", &Variables::new()), "Hello !");
    }

    #[test]
    fn malformed_tokens_are_left_literal() {
        assert_eq!(render("{{ }} and {single}", &Variables::new()), "{{ }} and {single}");
    }

    #[test]
    fn placeholders_are_sorted_and_unique() {
        assert_eq!(
            placeholders("{{b}} {{a}} {{ b }}"),
            vec!["a".to_string(), "b".to_string()]
        );
    }

    #[test]
    fn select_prefers_language_then_default() {
        let templates = vec![
            template(1, Channel::Email, "ko", true),
            template(2, Channel::Email, "en", false),
            template(3, Channel::Sms, "en", false),
        ];
        assert_eq!(select(&templates, "BUDGET_THRESHOLD", Channel::Email, "en").unwrap().id, 2);
        assert_eq!(select(&templates, "BUDGET_THRESHOLD", Channel::Email, "fr").unwrap().id, 1);
        assert!(select(&templates, "BUDGET_THRESHOLD", Channel::Push, "en").is_none());
    }

    #[test]
    fn template_renders_subject_and_body() {
        let t = template(1, Channel::Email, "en", true);
        let v = vars(&[("budget", "Lobby"), ("usage", "91")]);
        assert_eq!(t.render_subject(&v).as_deref(), Some("Budget Lobby"));
        assert_eq!(t.render_body(&v), "Usage at 91%");
    }
}
