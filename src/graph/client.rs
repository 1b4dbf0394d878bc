//! Microsoft Graph HTTP client.
//!
//! Uses synchronous HTTP (ureq); every call blocks the single thread of
//! control, including retry sleeps.

use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{debug, warn};
use ureq::http::Response;
use ureq::{Agent, Body, RequestBuilder};

use super::retry;
use super::{MailboxApi, MessageQuery};
use crate::auth::TokenProvider;
use crate::config::GraphConfig;
use crate::error::{GraphMailError, Result};
use crate::model::folder::FOLDER_SELECT_FIELDS;
use crate::model::{Attachment, MailFolder, Message};

/// Largest JSON body accepted from the API.
const JSON_BODY_LIMIT: u64 = 32 * 1024 * 1024;

/// Page size used for message listings.
const MESSAGE_PAGE_SIZE: usize = 50;

#[derive(Debug, Clone, Copy)]
enum Method {
    Get,
    Post,
    Patch,
}

/// One page of a collection response.
#[derive(Debug, Deserialize)]
struct Page<T> {
    #[serde(default = "Vec::new")]
    value: Vec<T>,
    #[serde(rename = "@odata.nextLink", default)]
    next_link: Option<String>,
}

/// A new draft message.
#[derive(Debug, Clone)]
pub struct DraftRequest {
    pub to: Vec<String>,
    pub subject: String,
    pub body: String,
    /// `"Text"` or `"HTML"`.
    pub body_content_type: String,
}

/// Graph API client for mailbox operations.
pub struct GraphClient {
    auth: Box<dyn TokenProvider>,
    agent: Agent,
    base_url: String,
    max_retries: u32,
    max_download_bytes: u64,
}

impl GraphClient {
    /// Create a client from transport settings and a token provider.
    pub fn new(config: &GraphConfig, auth: Box<dyn TokenProvider>) -> Self {
        let agent_config = Agent::config_builder()
            .timeout_global(Some(Duration::from_secs(config.timeout_secs)))
            .http_status_as_error(false)
            .build();

        Self {
            auth,
            agent: Agent::new_with_config(agent_config),
            base_url: config.base_url.trim_end_matches('/').to_string(),
            max_retries: config.max_retries,
            max_download_bytes: config.max_download_bytes,
        }
    }

    /// The token provider backing this client.
    pub fn auth(&self) -> &dyn TokenProvider {
        self.auth.as_ref()
    }

    // === Mail operations outside the sync capability ===

    /// Get a full message record.
    pub fn get_message(&self, message_id: &str) -> Result<Value> {
        let url = self.url(&format!("/me/messages/{}", segment(message_id)));
        Ok(self
            .request_json(Method::Get, &url, &[], None)?
            .unwrap_or_else(|| json!({})))
    }

    /// Set or clear the read flag.
    pub fn mark_message(&self, message_id: &str, read: bool) -> Result<Value> {
        let url = self.url(&format!("/me/messages/{}", segment(message_id)));
        let body = json!({ "isRead": read });
        Ok(self
            .request_json(Method::Patch, &url, &[], Some(&body))?
            .unwrap_or_else(|| json!({})))
    }

    /// Create a draft in the Drafts folder.
    pub fn create_draft(&self, draft: &DraftRequest) -> Result<Value> {
        let recipients: Vec<Value> = draft
            .to
            .iter()
            .map(|address| json!({ "emailAddress": { "address": address } }))
            .collect();
        let body = json!({
            "subject": draft.subject,
            "body": {
                "contentType": draft.body_content_type,
                "content": draft.body,
            },
            "toRecipients": recipients,
        });
        let url = self.url("/me/messages");
        Ok(self
            .request_json(Method::Post, &url, &[], Some(&body))?
            .unwrap_or_else(|| json!({})))
    }

    /// Send an existing draft.
    pub fn send_draft(&self, message_id: &str) -> Result<()> {
        let url = self.url(&format!("/me/messages/{}/send", segment(message_id)));
        self.request_json(Method::Post, &url, &[], None)?;
        Ok(())
    }

    // === Transport ===

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path.trim_start_matches('/'))
    }

    fn decorate<B>(
        &self,
        request: RequestBuilder<B>,
        token: &str,
        query: &[(&str, String)],
    ) -> RequestBuilder<B> {
        let mut request = request
            .header("Authorization", &format!("Bearer {token}"))
            .header("Accept", "application/json")
            .header("Prefer", "IdType=\"ImmutableId\"");
        for (key, value) in query {
            request = request.query(*key, value);
        }
        request
    }

    fn send_once(
        &self,
        method: Method,
        url: &str,
        token: &str,
        query: &[(&str, String)],
        body: Option<&Value>,
    ) -> std::result::Result<Response<Body>, ureq::Error> {
        match method {
            Method::Get => self.decorate(self.agent.get(url), token, query).call(),
            Method::Post => {
                let request = self.decorate(self.agent.post(url), token, query);
                match body {
                    Some(payload) => request.send_json(payload),
                    None => request.send_empty(),
                }
            }
            Method::Patch => {
                let request = self.decorate(self.agent.patch(url), token, query);
                match body {
                    Some(payload) => request.send_json(payload),
                    None => request.send_empty(),
                }
            }
        }
    }

    /// Send a request, retrying transient statuses within the retry budget.
    fn execute(
        &self,
        method: Method,
        url: &str,
        query: &[(&str, String)],
        body: Option<&Value>,
    ) -> Result<Response<Body>> {
        let token = self.auth.access_token()?;
        let mut attempt: u32 = 0;

        loop {
            debug!(?method, url = %url, attempt, "Graph request");
            let mut response = self
                .send_once(method, url, &token, query, body)
                .map_err(|e| GraphMailError::api(None, format!("Graph API request failed: {e}")))?;
            let status = response.status().as_u16();

            if retry::is_transient(status) && attempt < self.max_retries {
                let delay = retry::retry_delay(header(&response, "Retry-After").as_deref(), attempt);
                warn!(
                    status,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    url = %url,
                    "Transient Graph API status, retrying"
                );
                std::thread::sleep(delay);
                attempt += 1;
                continue;
            }

            if status >= 400 {
                let text = response
                    .body_mut()
                    .with_config()
                    .limit(JSON_BODY_LIMIT)
                    .read_to_string()
                    .unwrap_or_default();
                return Err(GraphMailError::api(
                    Some(status),
                    extract_graph_error(status, &text),
                ));
            }

            return Ok(response);
        }
    }

    /// Send a request expecting a JSON body. Empty and 204 responses yield `None`.
    fn request_json(
        &self,
        method: Method,
        url: &str,
        query: &[(&str, String)],
        body: Option<&Value>,
    ) -> Result<Option<Value>> {
        let mut response = self.execute(method, url, query, body)?;
        let status = response.status().as_u16();
        let content_type = header(&response, "Content-Type").unwrap_or_default();

        let bytes = response
            .body_mut()
            .with_config()
            .limit(JSON_BODY_LIMIT)
            .read_to_vec()
            .map_err(|e| GraphMailError::api(Some(status), format!("Failed to read response: {e}")))?;

        if status == 204 || bytes.is_empty() {
            return Ok(None);
        }
        if !content_type.to_lowercase().contains("application/json") {
            return Err(GraphMailError::api(
                Some(status),
                format!("Expected JSON response but got content type '{content_type}'"),
            ));
        }

        serde_json::from_slice(&bytes)
            .map(Some)
            .map_err(|e| GraphMailError::api(Some(status), format!("Malformed JSON response: {e}")))
    }

    fn get_typed<T: DeserializeOwned>(&self, url: &str, query: &[(&str, String)]) -> Result<T> {
        let value = self
            .request_json(Method::Get, url, query, None)?
            .unwrap_or_else(|| json!({}));
        serde_json::from_value(value)
            .map_err(|e| GraphMailError::api(None, format!("Unexpected response shape: {e}")))
    }

    /// Follow `@odata.nextLink` until `limit` items or `max_pages` pages.
    fn collect_paginated<T: DeserializeOwned>(
        &self,
        path: &str,
        mut query: Vec<(&str, String)>,
        limit: usize,
        max_pages: Option<usize>,
    ) -> Result<Vec<T>> {
        let mut items: Vec<T> = Vec::new();
        let mut next_url = Some(self.url(path));
        let mut pages = 0usize;

        while let Some(url) = next_url.take() {
            if items.len() >= limit || max_pages.is_some_and(|max| pages >= max) {
                break;
            }
            let page: Page<T> = self.get_typed(&url, &query)?;
            pages += 1;

            for value in page.value {
                if items.len() >= limit {
                    break;
                }
                items.push(value);
            }

            // nextLink already carries the query
            next_url = page.next_link;
            query.clear();
        }

        debug!(path = %path, pages, count = items.len(), "Collected paginated results");
        Ok(items)
    }
}

impl MailboxApi for GraphClient {
    fn list_messages(&self, query: &MessageQuery) -> Result<Vec<Message>> {
        let limit = query.limit();
        let mut params: Vec<(&str, String)> = vec![
            ("$top", limit.min(MESSAGE_PAGE_SIZE).to_string()),
            ("$orderby", "receivedDateTime DESC".to_string()),
        ];
        if let Some(filter) = query.filter() {
            params.push(("$filter", filter));
        }
        if !query.select.is_empty() {
            params.push(("$select", query.select.join(",")));
        }

        let path = format!("/me/mailFolders/{}/messages", segment(&query.folder));
        self.collect_paginated(&path, params, limit, query.max_pages)
    }

    fn list_attachments(&self, message_id: &str) -> Result<Vec<Attachment>> {
        let url = self.url(&format!("/me/messages/{}/attachments", segment(message_id)));
        let page: Page<Attachment> = self.get_typed(&url, &[])?;
        Ok(page.value)
    }

    fn get_attachment(&self, message_id: &str, attachment_id: &str) -> Result<Attachment> {
        let url = self.url(&format!(
            "/me/messages/{}/attachments/{}",
            segment(message_id),
            segment(attachment_id)
        ));
        self.get_typed(&url, &[])
    }

    fn download_attachment_bytes(
        &self,
        message_id: &str,
        attachment_id: &str,
    ) -> Result<(Vec<u8>, String)> {
        let url = self.url(&format!(
            "/me/messages/{}/attachments/{}/$value",
            segment(message_id),
            segment(attachment_id)
        ));
        let mut response = self.execute(Method::Get, &url, &[], None)?;
        let status = response.status().as_u16();
        let content_type = header(&response, "Content-Type")
            .unwrap_or_else(|| "application/octet-stream".to_string());

        let bytes = response
            .body_mut()
            .with_config()
            .limit(self.max_download_bytes)
            .read_to_vec()
            .map_err(|e| {
                GraphMailError::api(Some(status), format!("Failed to read attachment body: {e}"))
            })?;
        Ok((bytes, content_type))
    }

    fn get_mail_folder(&self, token: &str) -> Result<MailFolder> {
        let url = self.url(&format!("/me/mailFolders/{}", segment(token)));
        self.get_typed(&url, &[("$select", FOLDER_SELECT_FIELDS.to_string())])
    }

    fn list_child_folders(
        &self,
        folder_id: &str,
        include_hidden: bool,
    ) -> Result<Vec<MailFolder>> {
        let mut params: Vec<(&str, String)> = vec![
            ("$select", FOLDER_SELECT_FIELDS.to_string()),
            ("$top", "50".to_string()),
        ];
        if include_hidden {
            params.push(("includeHiddenFolders", "true".to_string()));
        }
        let path = format!("/me/mailFolders/{}/childFolders", segment(folder_id));
        self.collect_paginated(&path, params, super::MAX_LIST_LIMIT, Some(200))
    }
}

/// Percent-encode a single path segment.
fn segment(value: &str) -> String {
    urlencoding::encode(value).into_owned()
}

fn header(response: &Response<Body>, name: &str) -> Option<String> {
    response
        .headers()
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
}

/// Build a readable message from a Graph error body.
fn extract_graph_error(status: u16, body: &str) -> String {
    let prefix = format!("Graph API request failed with status {status}");

    let Ok(payload) = serde_json::from_str::<Value>(body) else {
        let trimmed = body.trim();
        if trimmed.is_empty() {
            return prefix;
        }
        let snippet: String = trimmed.chars().take(500).collect();
        return format!("{prefix}: {snippet}");
    };

    let error = payload.get("error");
    let code = error.and_then(|e| e.get("code")).and_then(Value::as_str);
    let message = error.and_then(|e| e.get("message")).and_then(Value::as_str);
    match (code, message) {
        (Some(code), Some(message)) => format!("{prefix}: {code} - {message}"),
        (None, Some(message)) => format!("{prefix}: {message}"),
        _ => prefix,
    }
}
