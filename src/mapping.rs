//! Ticket → repository resolution.
//!
//! Resolution order is deterministic: the explicit mapping table first,
//! then (only when enabled) a hint scan over the ticket text, then the
//! single-repo fallback. The allowlist is a hard boundary checked last —
//! a mapped repo outside it is treated exactly like an ambiguous one.

use std::collections::BTreeMap;

use serde_json::Value;

use crate::config::WorkspaceConfig;

/// Why a repo could not be resolved. Both cases route to NEEDS_HUMAN.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MappingFailure {
    NoMatch,
    NotAllowed { repo: String },
}

impl std::fmt::Display for MappingFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NoMatch => write!(f, "no repo mapping matched"),
            Self::NotAllowed { repo } => {
                write!(f, "repo `{}` is not in the allowlist", repo)
            }
        }
    }
}

/// Match the explicit mapping table against ticket fields.
///
/// Key forms, checked in table order:
/// - `field` — matches when the field is present at all
/// - `field:value` / `field=value` — matches when the field equals the
///   value, or (for list fields) contains it
pub fn map_repo(fields: &Value, repo_mapping: &BTreeMap<String, String>) -> Option<String> {
    for (key, repo) in repo_mapping {
        let sep = if key.contains(':') {
            Some(':')
        } else if key.contains('=') {
            Some('=')
        } else {
            None
        };
        match sep {
            Some(sep) => {
                let Some((field, expected)) = key.split_once(sep) else {
                    continue;
                };
                match fields.get(field) {
                    Some(Value::Array(items)) => {
                        if items.iter().any(|v| value_as_string(v) == expected) {
                            return Some(repo.clone());
                        }
                    }
                    Some(value) if !value.is_null() => {
                        if value_as_string(value) == expected {
                            return Some(repo.clone());
                        }
                    }
                    _ => {}
                }
            }
            None => {
                if matches!(fields.get(key), Some(v) if !v.is_null()) {
                    return Some(repo.clone());
                }
            }
        }
    }
    None
}

fn value_as_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        // Component/label objects expose their identity under "name".
        Value::Object(map) => map
            .get("name")
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| value.to_string()),
        other => other.to_string(),
    }
}

/// Scan ticket title/description for an allowlisted repo name. Disabled
/// unless `hint_inference` is configured on.
pub fn infer_repo_from_text(
    fields: &Value,
    allowlist: &[String],
    hint_inference: bool,
) -> Option<String> {
    if !hint_inference || allowlist.is_empty() {
        return None;
    }
    let mut haystack = String::new();
    if let Some(summary) = fields.get("summary").and_then(Value::as_str) {
        haystack.push_str(summary);
        haystack.push('\n');
    }
    if let Some(description) = fields.get("description") {
        haystack.push_str(&value_as_string(description));
    }
    let haystack = haystack.to_lowercase();

    let mut hits: Vec<&String> = allowlist
        .iter()
        .filter(|repo| haystack.contains(&repo.to_lowercase()))
        .collect();
    hits.dedup();
    // Exactly one hit is a hint; more than one is ambiguity, not a match.
    if hits.len() == 1 {
        Some(hits[0].clone())
    } else {
        None
    }
}

/// Full resolution pipeline for one ticket.
pub fn resolve_repo(fields: &Value, workspace: &WorkspaceConfig) -> Result<String, MappingFailure> {
    let mut repo = map_repo(fields, &workspace.repo_mapping);
    if repo.is_none() {
        repo = infer_repo_from_text(fields, &workspace.repo_allowlist, workspace.hint_inference);
    }
    if repo.is_none() && workspace.single_repo_only && workspace.repo_allowlist.len() == 1 {
        repo = Some(workspace.repo_allowlist[0].clone());
    }

    let repo = repo.ok_or(MappingFailure::NoMatch)?;
    if !workspace.repo_allowlist.is_empty() && !workspace.repo_allowlist.contains(&repo) {
        return Err(MappingFailure::NotAllowed { repo });
    }
    Ok(repo)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn workspace(allowlist: &[&str]) -> WorkspaceConfig {
        WorkspaceConfig {
            root_dir: "~/work".into(),
            repo_allowlist: allowlist.iter().map(|s| s.to_string()).collect(),
            repo_mapping: BTreeMap::new(),
            single_repo_only: true,
            hint_inference: false,
        }
    }

    #[test]
    fn bare_field_key_matches_on_presence() {
        let fields = json!({"project": "PAY"});
        let mapping = BTreeMap::from([("project".to_string(), "repo-a".to_string())]);
        assert_eq!(map_repo(&fields, &mapping), Some("repo-a".into()));
    }

    #[test]
    fn field_value_key_matches_on_equality() {
        let fields = json!({"component": "payments"});
        let mapping = BTreeMap::from([("component:payments".to_string(), "repo-pay".to_string())]);
        assert_eq!(map_repo(&fields, &mapping), Some("repo-pay".into()));
    }

    #[test]
    fn equals_separator_also_works() {
        let fields = json!({"team": "core"});
        let mapping = BTreeMap::from([("team=core".to_string(), "repo-core".to_string())]);
        assert_eq!(map_repo(&fields, &mapping), Some("repo-core".into()));
    }

    #[test]
    fn list_field_matches_on_membership() {
        let fields = json!({"labels": ["backend", "payments"]});
        let mapping = BTreeMap::from([("labels:payments".to_string(), "repo-pay".to_string())]);
        assert_eq!(map_repo(&fields, &mapping), Some("repo-pay".into()));
    }

    #[test]
    fn component_objects_match_by_name() {
        let fields = json!({"components": [{"name": "payments", "id": "1"}]});
        let mapping =
            BTreeMap::from([("components:payments".to_string(), "repo-pay".to_string())]);
        assert_eq!(map_repo(&fields, &mapping), Some("repo-pay".into()));
    }

    #[test]
    fn no_match_returns_none() {
        let fields = json!({"component": "search"});
        let mapping = BTreeMap::from([("component:payments".to_string(), "repo-pay".to_string())]);
        assert_eq!(map_repo(&fields, &mapping), None);
    }

    #[test]
    fn hint_inference_is_off_by_default() {
        let fields = json!({"summary": "fix bug in service-a login"});
        let ws = workspace(&["service-a", "service-b"]);
        assert_eq!(resolve_repo(&fields, &ws), Err(MappingFailure::NoMatch));
    }

    #[test]
    fn hint_inference_needs_exactly_one_hit() {
        let one = json!({"summary": "fix bug in service-a login"});
        let both = json!({"summary": "sync service-a with service-b"});
        let allowlist = vec!["service-a".to_string(), "service-b".to_string()];
        assert_eq!(
            infer_repo_from_text(&one, &allowlist, true),
            Some("service-a".into())
        );
        assert_eq!(infer_repo_from_text(&both, &allowlist, true), None);
    }

    #[test]
    fn single_repo_fallback_applies() {
        let fields = json!({"summary": "anything"});
        let ws = workspace(&["only-repo"]);
        assert_eq!(resolve_repo(&fields, &ws), Ok("only-repo".into()));
    }

    #[test]
    fn allowlist_is_a_hard_boundary() {
        let fields = json!({"component": "payments"});
        let mut ws = workspace(&["service-a"]);
        ws.repo_mapping =
            BTreeMap::from([("component:payments".to_string(), "secret-repo".to_string())]);
        assert_eq!(
            resolve_repo(&fields, &ws),
            Err(MappingFailure::NotAllowed {
                repo: "secret-repo".into()
            })
        );
    }

    #[test]
    fn empty_allowlist_allows_any_mapped_repo() {
        let fields = json!({"component": "payments"});
        let mut ws = workspace(&[]);
        ws.single_repo_only = false;
        ws.repo_mapping =
            BTreeMap::from([("component:payments".to_string(), "any-repo".to_string())]);
        assert_eq!(resolve_repo(&fields, &ws), Ok("any-repo".into()));
    }
}
