//! OAuth2 exchanges with the identity service.
//!
//! Implements the refresh-token grant, the device-code grant, and the
//! authorization-code grant with PKCE for browser sign-in. The browser
//! flow listens on the loopback redirect URI for the callback.
//! Uses synchronous HTTP (ureq).

use std::io::{BufRead, BufReader, Write};
use std::net::TcpListener;
use std::time::{Duration, Instant};

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use serde_json::Value;
use sha2::{Digest, Sha256};
use tracing::{debug, info};
use ureq::Agent;

use super::AccountInfo;
use crate::error::{GraphMailError, Result};

/// Scopes always added so the service returns a refresh token and an ID token.
const OIDC_SCOPES: &str = "offline_access openid profile";

/// Tokens issued by one successful grant.
#[derive(Debug, Clone)]
pub struct TokenGrant {
    pub access_token: String,
    pub refresh_token: Option<String>,
    /// Lifetime in seconds.
    pub expires_in: i64,
    pub scope: String,
    pub id_token: Option<String>,
}

/// Error body returned by the token endpoint.
#[derive(Debug)]
struct OAuthFailure {
    error: String,
    description: String,
}

/// Client for the tenant's OAuth2 v2.0 endpoints.
pub struct IdentityEndpoint {
    agent: Agent,
    authority: String,
    client_id: String,
    scope: String,
}

impl IdentityEndpoint {
    /// Endpoint for `{authority_host}/{tenant}` requesting `scopes`.
    pub fn new(authority_host: &str, tenant_id: &str, client_id: &str, scopes: &[String]) -> Self {
        let agent_config = Agent::config_builder()
            .timeout_global(Some(Duration::from_secs(30)))
            .http_status_as_error(false)
            .build();
        Self {
            agent: Agent::new_with_config(agent_config),
            authority: format!("{}/{}", authority_host.trim_end_matches('/'), tenant_id),
            client_id: client_id.to_string(),
            scope: format!("{} {OIDC_SCOPES}", scopes.join(" ")),
        }
    }

    fn token_url(&self) -> String {
        format!("{}/oauth2/v2.0/token", self.authority)
    }

    fn post_form(&self, url: &str, form: &[(&str, &str)]) -> Result<Value> {
        let mut response = self
            .agent
            .post(url)
            .send_form(form.iter().copied())
            .map_err(|e| GraphMailError::Auth(format!("Identity service request failed: {e}")))?;
        response
            .body_mut()
            .read_json::<Value>()
            .map_err(|e| GraphMailError::Auth(format!("Malformed identity service response: {e}")))
    }

    /// Exchange a refresh token for a new access token.
    pub fn refresh(&self, refresh_token: &str) -> Result<TokenGrant> {
        let payload = self.post_form(
            &self.token_url(),
            &[
                ("client_id", self.client_id.as_str()),
                ("grant_type", "refresh_token"),
                ("refresh_token", refresh_token),
                ("scope", self.scope.as_str()),
            ],
        )?;
        let mut grant = parse_grant(&payload).map_err(|f| {
            GraphMailError::Auth(format!("Token refresh failed: {}", f.description))
        })?;
        // Preserve the refresh token if not rotated
        if grant.refresh_token.is_none() {
            grant.refresh_token = Some(refresh_token.to_string());
        }
        Ok(grant)
    }

    /// Run the device-code grant. `notify` receives the sign-in instructions.
    pub fn device_code_login(&self, notify: &dyn Fn(&str)) -> Result<(TokenGrant, String)> {
        let start = self.post_form(
            &format!("{}/oauth2/v2.0/devicecode", self.authority),
            &[
                ("client_id", self.client_id.as_str()),
                ("scope", self.scope.as_str()),
            ],
        )?;

        let device_code = start
            .get("device_code")
            .and_then(Value::as_str)
            .filter(|_| start.get("user_code").is_some())
            .ok_or_else(|| GraphMailError::Auth("Device code flow initialization failed".into()))?
            .to_string();
        let instructions = start
            .get("message")
            .and_then(Value::as_str)
            .unwrap_or("Complete sign-in in a browser using the code shown by the identity service")
            .to_string();
        let mut interval = start.get("interval").and_then(Value::as_u64).unwrap_or(5);
        let expires_in = start.get("expires_in").and_then(Value::as_u64).unwrap_or(900);
        let deadline = Instant::now() + Duration::from_secs(expires_in);

        notify(&instructions);

        while Instant::now() < deadline {
            std::thread::sleep(Duration::from_secs(interval));
            let payload = self.post_form(
                &self.token_url(),
                &[
                    ("client_id", self.client_id.as_str()),
                    ("grant_type", "urn:ietf:params:oauth:grant-type:device_code"),
                    ("device_code", device_code.as_str()),
                ],
            )?;
            match parse_grant(&payload) {
                Ok(grant) => return Ok((grant, instructions)),
                Err(f) if f.error == "authorization_pending" => {
                    debug!("Device authorization pending");
                }
                Err(f) if f.error == "slow_down" => interval += 5,
                Err(f) => return Err(GraphMailError::Auth(f.description)),
            }
        }
        Err(GraphMailError::Auth("Device code expired before sign-in completed".into()))
    }

    /// Run the authorization-code grant with PKCE through a loopback redirect.
    ///
    /// `notify` receives the URL the user must open.
    pub fn browser_login(&self, redirect_uri: &str, notify: &dyn Fn(&str)) -> Result<TokenGrant> {
        let port = local_redirect_port(redirect_uri)?;
        let listener = TcpListener::bind(("127.0.0.1", port)).map_err(|e| {
            GraphMailError::Auth(format!("Could not listen on port {port} for the sign-in callback: {e}"))
        })?;

        let verifier = format!(
            "{}{}",
            uuid::Uuid::new_v4().simple(),
            uuid::Uuid::new_v4().simple()
        );
        let challenge = URL_SAFE_NO_PAD.encode(Sha256::digest(verifier.as_bytes()));
        let state = uuid::Uuid::new_v4().simple().to_string();

        let auth_url = format!(
            "{}/oauth2/v2.0/authorize?client_id={}&response_type=code&redirect_uri={}&response_mode=query&scope={}&state={}&code_challenge={}&code_challenge_method=S256&prompt=select_account",
            self.authority,
            urlencoding::encode(&self.client_id),
            urlencoding::encode(redirect_uri),
            urlencoding::encode(&self.scope),
            state,
            challenge,
        );
        notify(&format!("Open this URL to sign in: {auth_url}"));

        let params = wait_for_callback(&listener)?;
        let param = |key: &str| {
            params
                .iter()
                .find(|(k, _)| k == key)
                .map(|(_, v)| v.as_str())
        };

        if let Some(error) = param("error") {
            let description = param("error_description").unwrap_or(error);
            return Err(GraphMailError::Auth(format!("Sign-in failed: {description}")));
        }
        if param("state") != Some(state.as_str()) {
            return Err(GraphMailError::Auth("Sign-in callback state mismatch".into()));
        }
        let code = param("code")
            .ok_or_else(|| GraphMailError::Auth("No authorization code received".into()))?;

        info!("Exchanging authorization code for tokens");
        let payload = self.post_form(
            &self.token_url(),
            &[
                ("client_id", self.client_id.as_str()),
                ("grant_type", "authorization_code"),
                ("code", code),
                ("redirect_uri", redirect_uri),
                ("code_verifier", verifier.as_str()),
                ("scope", self.scope.as_str()),
            ],
        )?;
        parse_grant(&payload).map_err(|f| GraphMailError::Auth(f.description))
    }
}

fn parse_grant(payload: &Value) -> std::result::Result<TokenGrant, OAuthFailure> {
    let text = |key: &str| payload.get(key).and_then(Value::as_str).map(str::to_string);

    if let Some(access_token) = text("access_token") {
        return Ok(TokenGrant {
            access_token,
            refresh_token: text("refresh_token"),
            expires_in: payload.get("expires_in").and_then(Value::as_i64).unwrap_or(3600),
            scope: text("scope").unwrap_or_default(),
            id_token: text("id_token"),
        });
    }

    let error = text("error").unwrap_or_else(|| "unknown_error".to_string());
    let description = text("error_description").unwrap_or_else(|| {
        if error == "unknown_error" {
            "Authentication failed with an empty response".to_string()
        } else {
            error.clone()
        }
    });
    Err(OAuthFailure { error, description })
}

/// Accept one callback request and return its decoded query parameters.
fn wait_for_callback(listener: &TcpListener) -> Result<Vec<(String, String)>> {
    let (mut stream, _) = listener
        .accept()
        .map_err(|e| GraphMailError::Auth(format!("Failed to accept sign-in callback: {e}")))?;

    let mut request_line = String::new();
    BufReader::new(&stream)
        .read_line(&mut request_line)
        .map_err(|e| GraphMailError::Auth(format!("Failed to read sign-in callback: {e}")))?;

    // Format: GET /?code=...&state=... HTTP/1.1
    let params = request_line
        .split_whitespace()
        .nth(1)
        .and_then(|target| target.split_once('?'))
        .map(|(_, query)| parse_query(query))
        .unwrap_or_default();

    let ok = params.iter().any(|(k, _)| k == "code");
    let (status, body) = if ok {
        ("200 OK", "Sign-in complete. You can close this window.")
    } else {
        ("400 Bad Request", "Sign-in failed. Return to the terminal.")
    };
    let response = format!(
        "HTTP/1.1 {status}\r\nContent-Type: text/html\r\nConnection: close\r\n\r\n<html><body><h1>{body}</h1></body></html>"
    );
    stream.write_all(response.as_bytes()).ok();

    Ok(params)
}

fn parse_query(query: &str) -> Vec<(String, String)> {
    query
        .split('&')
        .filter(|pair| !pair.is_empty())
        .map(|pair| {
            let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
            let decode = |s: &str| {
                let spaced = s.replace('+', " ");
                urlencoding::decode(&spaced)
                    .map(|c| c.into_owned())
                    .unwrap_or(spaced)
            };
            (decode(key), decode(value))
        })
        .collect()
}

/// Port of a loopback redirect URI (`http(s)://localhost[:port]`).
pub fn local_redirect_port(redirect_uri: &str) -> Result<u16> {
    let (scheme, rest) = redirect_uri
        .trim()
        .split_once("://")
        .ok_or_else(|| GraphMailError::Config("OUTLOOK_REDIRECT_URI must be an http(s) URL".into()))?;
    let default_port = match scheme.to_lowercase().as_str() {
        "http" => 80,
        "https" => 443,
        _ => {
            return Err(GraphMailError::Config(
                "OUTLOOK_REDIRECT_URI must be an http(s) URL for browser auth".into(),
            ))
        }
    };

    let authority = rest.split(['/', '?', '#']).next().unwrap_or_default();
    let (host, port) = match authority.rsplit_once(':') {
        Some((host, port)) => {
            let port = port.parse::<u16>().map_err(|_| {
                GraphMailError::Config(format!("Invalid port in OUTLOOK_REDIRECT_URI: {port}"))
            })?;
            (host, port)
        }
        None => (authority, default_port),
    };

    if !matches!(host.to_lowercase().as_str(), "localhost" | "127.0.0.1") {
        return Err(GraphMailError::Config(
            "OUTLOOK_REDIRECT_URI host must be localhost or 127.0.0.1 for browser auth".into(),
        ));
    }
    Ok(port)
}

/// Decode the (unverified) claims section of an ID token.
pub fn decode_id_token_claims(id_token: &str) -> Option<Value> {
    let payload = id_token.split('.').nth(1)?;
    let bytes = URL_SAFE_NO_PAD.decode(payload.trim_end_matches('=')).ok()?;
    serde_json::from_slice(&bytes).ok()
}

/// Build the account identity from ID token claims.
///
/// The home account id is `<oid>.<tid>`, stable across sessions.
pub fn account_from_claims(claims: &Value) -> Result<AccountInfo> {
    let text = |key: &str| claims.get(key).and_then(Value::as_str).map(str::to_string);
    let (Some(oid), Some(tid)) = (text("oid"), text("tid")) else {
        return Err(GraphMailError::Auth(
            "ID token lacks the oid/tid claims needed to identify the account".into(),
        ));
    };
    Ok(AccountInfo {
        home_account_id: format!("{oid}.{tid}"),
        username: text("preferred_username")
            .or_else(|| text("email"))
            .or_else(|| text("upn")),
        name: text("name"),
    })
}
