//! Ticket source adapter (Jira-compatible REST).
//!
//! The ticket service is the sole source of ticket truth. prforge never
//! writes status semantics back — it only posts comments.

use async_trait::async_trait;
use serde_json::Value;

use super::AdapterError;
use crate::config::TicketsConfig;

/// One ticket with its raw field payload.
#[derive(Debug, Clone)]
pub struct TicketFields {
    pub key: String,
    pub fields: Value,
}

impl TicketFields {
    pub fn summary(&self) -> String {
        self.fields
            .get("summary")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string()
    }

    /// Rich-text descriptions arrive as a document object; flatten those
    /// to their JSON text so downstream prompts always get a string.
    pub fn description(&self) -> String {
        match self.fields.get("description") {
            Some(Value::String(s)) => s.clone(),
            Some(doc @ Value::Object(map)) if map.contains_key("content") => doc.to_string(),
            _ => String::new(),
        }
    }

    pub fn acceptance_criteria(&self) -> String {
        let description = self.description();
        match description.split_once("Acceptance Criteria") {
            Some((_, rest)) => rest.trim().to_string(),
            None => String::new(),
        }
    }

    /// A ticket is workable when it has both a summary and a description.
    pub fn is_complete(&self) -> bool {
        !self.summary().is_empty() && !self.description().is_empty()
    }
}

#[async_trait]
pub trait TicketSource: Send + Sync {
    async fn search(&self, jql: &str, limit: u32) -> Result<Vec<TicketFields>, AdapterError>;

    async fn get(&self, key: &str) -> Result<Option<TicketFields>, AdapterError> {
        let results = self.search(&format!("key = {}", key), 1).await?;
        Ok(results.into_iter().next())
    }

    async fn comment(&self, key: &str, text: &str) -> Result<(), AdapterError>;
}

/// Jira REST implementation.
pub struct JiraSource {
    client: reqwest::Client,
    cfg: TicketsConfig,
}

impl JiraSource {
    pub fn new(cfg: &TicketsConfig) -> Self {
        Self {
            client: reqwest::Client::new(),
            cfg: cfg.clone(),
        }
    }

    fn base(&self) -> String {
        self.cfg.base_url.trim_end_matches('/').to_string()
    }

    fn parse_issues(data: Value) -> Vec<TicketFields> {
        data.get("issues")
            .and_then(Value::as_array)
            .map(|issues| {
                issues
                    .iter()
                    .filter_map(|issue| {
                        let key = issue.get("key")?.as_str()?.to_string();
                        let fields = issue.get("fields").cloned().unwrap_or(Value::Null);
                        Some(TicketFields { key, fields })
                    })
                    .collect()
            })
            .unwrap_or_default()
    }
}

#[async_trait]
impl TicketSource for JiraSource {
    async fn search(&self, jql: &str, limit: u32) -> Result<Vec<TicketFields>, AdapterError> {
        let payload = serde_json::json!({
            "jql": jql,
            "maxResults": limit,
            "fields": self.cfg.fields,
        });

        // Cloud instances expose /search/jql; Server/DC may only have the
        // legacy /search endpoint.
        let new_url = format!("{}/rest/api/{}/search/jql", self.base(), self.cfg.api_version);
        let mut resp = self
            .client
            .post(&new_url)
            .basic_auth(&self.cfg.email, Some(&self.cfg.api_token))
            .json(&payload)
            .send()
            .await
            .map_err(|e| AdapterError::from_reqwest("ticket source", e))?;

        if matches!(resp.status().as_u16(), 404 | 405 | 410) {
            let legacy_url = format!("{}/rest/api/{}/search", self.base(), self.cfg.api_version);
            resp = self
                .client
                .post(&legacy_url)
                .basic_auth(&self.cfg.email, Some(&self.cfg.api_token))
                .json(&payload)
                .send()
                .await
                .map_err(|e| AdapterError::from_reqwest("ticket source", e))?;
        }

        let status = resp.status();
        let body = resp
            .text()
            .await
            .map_err(|e| AdapterError::from_reqwest("ticket source", e))?;
        if !status.is_success() {
            return Err(AdapterError::from_status("ticket source", status, &body));
        }
        let data: Value = serde_json::from_str(&body)
            .map_err(|e| AdapterError::Other(anyhow::anyhow!("ticket search response not JSON: {}", e)))?;
        Ok(Self::parse_issues(data))
    }

    async fn comment(&self, key: &str, text: &str) -> Result<(), AdapterError> {
        let url = format!(
            "{}/rest/api/{}/issue/{}/comment",
            self.base(),
            self.cfg.api_version,
            key
        );
        let resp = self
            .client
            .post(&url)
            .basic_auth(&self.cfg.email, Some(&self.cfg.api_token))
            .json(&serde_json::json!({ "body": text }))
            .send()
            .await
            .map_err(|e| AdapterError::from_reqwest("ticket source", e))?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(AdapterError::from_status("ticket source", status, &body));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn ticket(fields: Value) -> TicketFields {
        TicketFields {
            key: "ABC-1".into(),
            fields,
        }
    }

    #[test]
    fn summary_and_description_extraction() {
        let t = ticket(json!({"summary": "Fix login", "description": "Steps..."}));
        assert_eq!(t.summary(), "Fix login");
        assert_eq!(t.description(), "Steps...");
        assert!(t.is_complete());
    }

    #[test]
    fn rich_text_description_is_flattened_to_json() {
        let t = ticket(json!({
            "summary": "Fix login",
            "description": {"type": "doc", "content": [{"type": "paragraph"}]},
        }));
        assert!(t.description().contains("paragraph"));
        assert!(t.is_complete());
    }

    #[test]
    fn missing_description_is_incomplete() {
        let t = ticket(json!({"summary": "Fix login"}));
        assert_eq!(t.description(), "");
        assert!(!t.is_complete());
    }

    #[test]
    fn acceptance_criteria_is_the_tail_after_the_marker() {
        let t = ticket(json!({
            "summary": "s",
            "description": "Context here.\nAcceptance Criteria\n- logs in\n- stays logged in",
        }));
        assert_eq!(t.acceptance_criteria(), "- logs in\n- stays logged in");
    }

    #[test]
    fn parse_issues_pulls_key_and_fields() {
        let data = json!({
            "issues": [
                {"key": "ABC-1", "fields": {"summary": "one"}},
                {"key": "ABC-2", "fields": {"summary": "two"}},
            ]
        });
        let issues = JiraSource::parse_issues(data);
        assert_eq!(issues.len(), 2);
        assert_eq!(issues[0].key, "ABC-1");
        assert_eq!(issues[1].summary(), "two");
    }

    #[test]
    fn parse_issues_tolerates_empty_payload() {
        assert!(JiraSource::parse_issues(json!({})).is_empty());
    }
}
