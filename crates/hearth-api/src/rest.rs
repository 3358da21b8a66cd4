// Remote management API HTTP client
//
// Wraps `reqwest::Client` with hearth-specific URL construction and the
// `Token <token>` authorization scheme. Resources are opaque JSON values
// here -- the core crate decides what a device or routine looks like.

use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use serde_json::Value;
use tracing::debug;
use url::Url;

use crate::error::Error;
use crate::transport::TransportConfig;

/// Raw HTTP client for the remote management API.
///
/// Handles token exchange, the health probe, and generic resource CRUD
/// under the configured API prefix. All methods take the token explicitly;
/// token caching and refresh is owned by the controller. Cloning shares
/// the underlying connection pool.
#[derive(Clone)]
pub struct RemoteClient {
    http: reqwest::Client,
    base_url: Url,
    api_prefix: String,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    token: String,
}

impl RemoteClient {
    /// Create a new client from a `TransportConfig`.
    ///
    /// `base_url` is the API root (e.g. `http://192.168.1.10:8000`);
    /// `api_prefix` is the path prefix resource endpoints live under
    /// (e.g. `/api`, may be empty).
    pub fn new(
        base_url: Url,
        api_prefix: impl Into<String>,
        transport: &TransportConfig,
    ) -> Result<Self, Error> {
        let http = transport.build_client()?;
        Ok(Self {
            http,
            base_url,
            api_prefix: api_prefix.into(),
        })
    }

    /// Create a client with a pre-built `reqwest::Client` (used by tests).
    pub fn with_client(http: reqwest::Client, base_url: Url, api_prefix: impl Into<String>) -> Self {
        Self {
            http,
            base_url,
            api_prefix: api_prefix.into(),
        }
    }

    /// The API root URL.
    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    // ── URL builders ─────────────────────────────────────────────────

    /// Build a resource URL: `{base}{prefix}/{resource_type}[/{id}]`
    fn resource_url(&self, resource_type: &str, resource_id: Option<&str>) -> Result<Url, Error> {
        let mut path = format!(
            "{}/{}",
            self.api_prefix.trim_end_matches('/'),
            resource_type.trim_matches('/')
        );
        if let Some(id) = resource_id {
            path.push('/');
            path.push_str(id);
        }
        Ok(self.base_url.join(path.trim_start_matches('/'))?)
    }

    fn auth_header(token: &str) -> String {
        format!("Token {token}")
    }

    // ── Authentication ───────────────────────────────────────────────

    /// Exchange username/password for an API token at `/api-token-auth/`.
    pub async fn login(
        &self,
        username: &str,
        password: &SecretString,
    ) -> Result<SecretString, Error> {
        let url = self.base_url.join("api-token-auth/")?;
        debug!(%url, username, "requesting auth token");

        let resp = self
            .http
            .post(url)
            .json(&serde_json::json!({
                "username": username,
                "password": password.expose_secret(),
            }))
            .send()
            .await
            .map_err(Error::Transport)?;

        let status = resp.status();
        let body = resp.text().await.map_err(Error::Transport)?;

        if !status.is_success() {
            return Err(Error::Authentication {
                message: format!("token endpoint returned HTTP {}", status.as_u16()),
            });
        }

        let parsed: TokenResponse =
            serde_json::from_str(&body).map_err(|e| Error::Deserialization {
                message: e.to_string(),
                body,
            })?;

        Ok(SecretString::from(parsed.token))
    }

    /// Probe the remote health endpoint. Any 2xx counts as reachable.
    pub async fn health(&self) -> Result<(), Error> {
        let url = self.base_url.join("status/")?;
        let resp = self.http.get(url).send().await.map_err(Error::Transport)?;

        let status = resp.status();
        if status.is_success() {
            Ok(())
        } else {
            Err(Error::RemoteApi {
                status: status.as_u16(),
                message: "health check failed".into(),
            })
        }
    }

    // ── Resource CRUD ────────────────────────────────────────────────

    /// `GET /{prefix}/{resource_type}[/{id}]` -- a list without an id,
    /// a single object with one.
    pub async fn fetch(
        &self,
        resource_type: &str,
        resource_id: Option<&str>,
        token: &str,
    ) -> Result<Value, Error> {
        let url = self.resource_url(resource_type, resource_id)?;
        debug!(%url, "GET resource");

        let resp = self
            .http
            .get(url)
            .header("Authorization", Self::auth_header(token))
            .send()
            .await
            .map_err(Error::Transport)?;

        Self::expect_json(resp, 200).await
    }

    /// `POST /{prefix}/{resource_type}` -- returns the created resource.
    pub async fn create(
        &self,
        resource_type: &str,
        data: &Value,
        token: &str,
    ) -> Result<Value, Error> {
        let url = self.resource_url(resource_type, None)?;
        debug!(%url, "POST resource");

        let resp = self
            .http
            .post(url)
            .header("Authorization", Self::auth_header(token))
            .json(data)
            .send()
            .await
            .map_err(Error::Transport)?;

        Self::expect_json(resp, 201).await
    }

    /// `PUT /{prefix}/{resource_type}/{id}` -- returns the updated resource.
    pub async fn update(
        &self,
        resource_type: &str,
        resource_id: &str,
        data: &Value,
        token: &str,
    ) -> Result<Value, Error> {
        let url = self.resource_url(resource_type, Some(resource_id))?;
        debug!(%url, "PUT resource");

        let resp = self
            .http
            .put(url)
            .header("Authorization", Self::auth_header(token))
            .json(data)
            .send()
            .await
            .map_err(Error::Transport)?;

        Self::expect_json(resp, 200).await
    }

    /// `DELETE /{prefix}/{resource_type}/{id}`.
    pub async fn delete(
        &self,
        resource_type: &str,
        resource_id: &str,
        token: &str,
    ) -> Result<(), Error> {
        let url = self.resource_url(resource_type, Some(resource_id))?;
        debug!(%url, "DELETE resource");

        let resp = self
            .http
            .delete(url)
            .header("Authorization", Self::auth_header(token))
            .send()
            .await
            .map_err(Error::Transport)?;

        let status = resp.status();
        if status.as_u16() == 204 || status.is_success() {
            Ok(())
        } else {
            Err(Error::RemoteApi {
                status: status.as_u16(),
                message: resp.text().await.unwrap_or_default(),
            })
        }
    }

    /// Check the status against the expected code and parse the JSON body.
    async fn expect_json(resp: reqwest::Response, expected: u16) -> Result<Value, Error> {
        let status = resp.status();
        let body = resp.text().await.map_err(Error::Transport)?;

        if status.as_u16() != expected && !status.is_success() {
            return Err(Error::RemoteApi {
                status: status.as_u16(),
                message: body,
            });
        }

        serde_json::from_str(&body).map_err(|e| Error::Deserialization {
            message: e.to_string(),
            body,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resource_url_with_prefix_and_id() {
        let client = RemoteClient::with_client(
            reqwest::Client::new(),
            Url::parse("http://localhost:8000").expect("url"),
            "/api",
        );

        let url = client
            .resource_url("devices", Some("abc-123"))
            .expect("url");
        assert_eq!(url.as_str(), "http://localhost:8000/api/devices/abc-123");
    }

    #[test]
    fn resource_url_without_prefix() {
        let client = RemoteClient::with_client(
            reqwest::Client::new(),
            Url::parse("http://localhost:8000").expect("url"),
            "",
        );

        let url = client.resource_url("routines", None).expect("url");
        assert_eq!(url.as_str(), "http://localhost:8000/routines");
    }
}
