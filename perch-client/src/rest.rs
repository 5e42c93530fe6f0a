//! Blocking REST session shared by the room API and the websocket handshake.

use std::sync::Arc;

use reqwest::cookie::{CookieStore, Jar};
use reqwest::Url;
use serde_json::Value;

use crate::error::{Error, Result};

/// Endpoints and identity of the service instance to talk to.
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    /// Web base, e.g. `https://volafile.io`.
    pub base_url: String,
    /// REST base, with trailing slash.
    pub rest_url: String,
    /// Websocket endpoint.
    pub ws_url: String,
    /// User-Agent for both REST and websocket requests.
    pub agent: String,
}

impl ServiceConfig {
    /// Derive the REST and websocket endpoints from a web base URL.
    pub fn new(base_url: &str) -> Result<ServiceConfig> {
        let base = Url::parse(base_url).map_err(|e| Error::InvalidArg(e.to_string()))?;
        let host = base
            .host_str()
            .ok_or_else(|| Error::InvalidArg("base url without a host".into()))?;
        let base_url = base_url.trim_end_matches('/').to_owned();
        Ok(ServiceConfig {
            rest_url: format!("{base_url}/rest/"),
            ws_url: format!("wss://{host}/api/"),
            base_url,
            agent: format!("perch/{}", env!("CARGO_PKG_VERSION")),
        })
    }
}

impl Default for ServiceConfig {
    /// The public service this client was written against.
    fn default() -> Self {
        ServiceConfig::new("https://volafile.io").unwrap_or(ServiceConfig {
            base_url: "https://volafile.io".into(),
            rest_url: "https://volafile.io/rest/".into(),
            ws_url: "wss://volafile.io/api/".into(),
            agent: format!("perch/{}", env!("CARGO_PKG_VERSION")),
        })
    }
}

/// A cookie-carrying blocking HTTP session. One per room (or shared between
/// rooms to carry a login over).
pub struct Session {
    http: reqwest::blocking::Client,
    jar: Arc<Jar>,
    config: ServiceConfig,
}

impl Session {
    pub fn new(config: ServiceConfig) -> Result<Session> {
        let jar = Arc::new(Jar::default());
        let base = Url::parse(&config.base_url).map_err(|e| Error::InvalidArg(e.to_string()))?;
        // Download tokens are only issued when this cookie is present.
        jar.add_cookie_str("allow-download=1", &base);
        let http = reqwest::blocking::Client::builder()
            .user_agent(config.agent.clone())
            .cookie_provider(jar.clone())
            .build()?;
        Ok(Session { http, jar, config })
    }

    pub fn config(&self) -> &ServiceConfig {
        &self.config
    }

    /// Issue a REST call. The raw response body is returned even when it
    /// carries an `error` object; see [`expect_ok`].
    pub fn call(
        &self,
        name: &str,
        params: &[(&str, String)],
        referer: Option<&str>,
    ) -> Result<Value> {
        let mut req = self
            .http
            .get(format!("{}{}", self.config.rest_url, name))
            .query(params)
            .header("Origin", &self.config.base_url);
        if let Some(room) = referer {
            req = req.header("Referer", format!("{}/r/{}", self.config.base_url, room));
        }
        Ok(req.send()?.error_for_status()?.json()?)
    }

    /// Plain GET, for endpoints outside the REST prefix.
    pub fn get(&self, url: &str) -> Result<reqwest::blocking::Response> {
        Ok(self.http.get(url).send()?)
    }

    /// Multipart POST, used by uploads.
    pub fn post_multipart(
        &self,
        url: &str,
        params: &[(&str, String)],
        form: reqwest::blocking::multipart::Form,
    ) -> Result<Value> {
        let resp = self
            .http
            .post(url)
            .query(params)
            .header("Origin", &self.config.base_url)
            .multipart(form)
            .send()?
            .error_for_status()?;
        Ok(resp.json().unwrap_or(Value::Null))
    }

    /// Store the login session cookie; carried by later REST calls and by
    /// websocket handshakes.
    pub fn set_session_cookie(&self, session: &str) {
        if let Ok(base) = Url::parse(&self.config.base_url) {
            self.jar.add_cookie_str(&format!("session={session}"), &base);
        }
    }

    pub fn clear_session_cookie(&self) {
        if let Ok(base) = Url::parse(&self.config.base_url) {
            self.jar.add_cookie_str("session=; Max-Age=0", &base);
        }
    }

    /// The Cookie header value for a websocket handshake against our host.
    pub fn cookie_header(&self) -> Option<String> {
        let base = Url::parse(&self.config.base_url).ok()?;
        let header = self.jar.cookies(&base)?;
        header.to_str().ok().map(str::to_owned)
    }
}

/// Surface an embedded `{"error": …}` object as [`Error::Rest`].
pub fn expect_ok(value: Value) -> Result<Value> {
    match value.get("error") {
        Some(err) => {
            let message = err
                .get("message")
                .and_then(Value::as_str)
                .map(str::to_owned)
                .unwrap_or_else(|| err.to_string());
            Err(Error::Rest(message))
        }
        None => Ok(value),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn endpoints_derive_from_the_base_url() {
        let cfg = ServiceConfig::new("https://example.net/").unwrap();
        assert_eq!(cfg.base_url, "https://example.net");
        assert_eq!(cfg.rest_url, "https://example.net/rest/");
        assert_eq!(cfg.ws_url, "wss://example.net/api/");
    }

    #[test]
    fn embedded_errors_are_surfaced() {
        let ok = expect_ok(json!({"key": "k"})).unwrap();
        assert_eq!(ok["key"], "k");
        let err = expect_ok(json!({"error": {"message": "no such room"}}));
        assert!(matches!(err, Err(Error::Rest(m)) if m == "no such room"));
    }
}
