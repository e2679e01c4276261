//! `{{placeholder}}` extraction and rendering.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::LazyLock;

use regex::{Captures, Regex};

static PLACEHOLDER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\{\{([A-Za-z0-9_]+)\}\}").unwrap());

/// Names of every placeholder in `content`.
pub fn extract_variables(content: &str) -> BTreeSet<String> {
    PLACEHOLDER
        .captures_iter(content)
        .map(|caps| caps[1].to_string())
        .collect()
}

/// Result of rendering a template against one recipient's variables.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rendered {
    pub content: String,
    /// Placeholder names with no value, in order of first appearance.
    pub missing: Vec<String>,
}

impl Rendered {
    pub fn is_complete(&self) -> bool {
        self.missing.is_empty()
    }
}

/// Substitute every placeholder found in `variables`.
///
/// Unknown placeholders stay in the output verbatim and are listed in
/// `missing`. Replacement values are inserted as-is and never re-scanned.
pub fn render(content: &str, variables: &BTreeMap<String, String>) -> Rendered {
    let mut missing: Vec<String> = Vec::new();
    let rendered = PLACEHOLDER.replace_all(content, |caps: &Captures<'_>| {
        let name = &caps[1];
        match variables.get(name) {
            Some(value) => value.clone(),
            None => {
                if !missing.iter().any(|m| m == name) {
                    missing.push(name.to_string());
                }
                caps[0].to_string()
            }
        }
    });

    Rendered {
        content: rendered.into_owned(),
        missing,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vars(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_extract_variables() {
        let names = extract_variables("Hi {{name}}, order {{order_no}} for {{name}}");
        assert_eq!(
            names.into_iter().collect::<Vec<_>>(),
            vec!["name".to_string(), "order_no".to_string()]
        );
    }

    #[test]
    fn test_extract_ignores_malformed_tokens() {
        let names = extract_variables("{{ name }} {{first-name}} {name} {{}} {{ok_1}}");
        assert_eq!(names.into_iter().collect::<Vec<_>>(), vec!["ok_1".to_string()]);
    }

    #[test]
    fn test_render_substitutes_known_values() {
        let out = render("Hi {{name}}, order {{order_no}}", &vars(&[("name", "Ann"), ("order_no", "42")]));
        assert_eq!(out.content, "Hi Ann, order 42");
        assert!(out.is_complete());
    }

    #[test]
    fn test_render_reports_missing_and_keeps_placeholder() {
        let out = render("Hi {{name}}, code {{code}} {{code}}", &vars(&[("name", "Ann")]));
        assert_eq!(out.content, "Hi Ann, code {{code}} {{code}}");
        assert_eq!(out.missing, vec!["code".to_string()]);
    }

    #[test]
    fn test_render_is_deterministic() {
        let v = vars(&[("a", "1")]);
        let first = render("{{a}} {{b}}", &v);
        let second = render("{{a}} {{b}}", &v);
        assert_eq!(first, second);
    }

    #[test]
    fn test_values_are_not_rescanned() {
        let out = render("{{a}}", &vars(&[("a", "{{b}}"), ("b", "x")]));
        assert_eq!(out.content, "{{b}}");
        assert!(out.is_complete());
    }

    #[test]
    fn test_content_without_placeholders() {
        let out = render("plain text", &BTreeMap::new());
        assert_eq!(out.content, "plain text");
        assert!(extract_variables("plain text").is_empty());
    }
}
