// Request building
// Turns an Operation plus credentials into a signed HttpRequest.

use bytes::Bytes;
use indexmap::IndexMap;
use paas_core::{
    Credentials, Method, Operation, PaasError, PaasResult, Signer, HEADER_APP_ID, HEADER_APP_KEY,
    HEADER_PRODUCTION, HEADER_SESSION, HEADER_SIGN,
};
use paas_transport::HttpRequest;
use reqwest::Url;
use serde_json::{Map, Value};
use tracing::trace;

/// Names of the authentication headers. Defaults to the `X-LC-*` set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthHeaders {
    pub application_id: String,
    pub application_key: String,
    pub session_token: String,
}

impl Default for AuthHeaders {
    fn default() -> Self {
        AuthHeaders {
            application_id: HEADER_APP_ID.to_string(),
            application_key: HEADER_APP_KEY.to_string(),
            session_token: HEADER_SESSION.to_string(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct RequestBuilder {
    server_url: String,
    api_version: String,
    user_agent: String,
    signer: Signer,
    auth_headers: AuthHeaders,
}

impl RequestBuilder {
    pub fn new(
        server_url: impl Into<String>,
        api_version: impl Into<String>,
        user_agent: impl Into<String>,
        signer: Signer,
    ) -> Self {
        let server_url: String = server_url.into();
        RequestBuilder {
            server_url: server_url.trim_end_matches('/').to_string(),
            api_version: api_version.into().trim_matches('/').to_string(),
            user_agent: user_agent.into(),
            signer,
            auth_headers: AuthHeaders::default(),
        }
    }

    pub fn with_auth_headers(mut self, auth_headers: AuthHeaders) -> Self {
        self.auth_headers = auth_headers;
        self
    }

    pub fn signer(&self) -> &Signer {
        &self.signer
    }

    pub fn auth_headers(&self) -> &AuthHeaders {
        &self.auth_headers
    }

    /// Builds the request for `operation`. A session token carried by the
    /// operation replaces the one from `credentials` for this call.
    pub fn build(&self, operation: &Operation, credentials: &Credentials) -> PaasResult<HttpRequest> {
        operation.validate()?;
        let overridden;
        let credentials = match operation.session_token() {
            Some(token) => {
                overridden = credentials.clone().with_session_token(token);
                &overridden
            }
            None => credentials,
        };
        self.build_raw(
            operation.method(),
            operation.path(),
            operation.parameters(),
            operation.headers(),
            credentials,
        )
    }

    /// Builds a request from its parts; used for batch endpoints whose body
    /// is composed separately.
    pub fn build_raw(
        &self,
        method: Method,
        path: &str,
        parameters: &Map<String, Value>,
        headers: &IndexMap<String, String>,
        credentials: &Credentials,
    ) -> PaasResult<HttpRequest> {
        let query = if method.uses_query() {
            Some(parameters)
        } else {
            None
        };
        let url = self.absolute_url(path, query)?;
        let mut request = HttpRequest::new(method, url);

        if !method.uses_query() {
            let body = serde_json::to_vec(&Value::Object(parameters.clone()))?;
            request.body = Some(Bytes::from(body));
        }

        let signature = self.signer.sign_now(credentials)?;
        let defaults = [
            ("Content-Type", "application/json".to_string()),
            ("User-Agent", self.user_agent.clone()),
            (
                self.auth_headers.application_id.as_str(),
                credentials.application_id.clone(),
            ),
        ];
        for (name, value) in defaults {
            request.headers.insert(name.to_string(), value);
        }
        match &credentials.session_token {
            Some(token) => {
                request
                    .headers
                    .insert(self.auth_headers.session_token.clone(), token.clone());
            }
            None => {
                request.headers.insert(
                    self.auth_headers.application_key.clone(),
                    credentials.client_key.clone(),
                );
            }
        }
        request.headers.insert(HEADER_SIGN.to_string(), signature);
        let production = if credentials.production_mode { "1" } else { "0" };
        request
            .headers
            .insert(HEADER_PRODUCTION.to_string(), production.to_string());

        for (name, value) in headers {
            override_header(&mut request.headers, name, value);
        }

        trace!("Built {} {}", request.method, request.url);
        Ok(request)
    }

    /// `{server_url}/{api_version}{path}`, with `parameters` encoded as the
    /// query string when given.
    pub fn absolute_url(&self, path: &str, parameters: Option<&Map<String, Value>>) -> PaasResult<String> {
        if path.is_empty() || !path.starts_with('/') {
            return Err(PaasError::malformed(format!(
                "path must start with '/': {:?}",
                path
            )));
        }
        let raw = format!("{}/{}{}", self.server_url, self.api_version, path);
        let mut url = Url::parse(&raw)
            .map_err(|e| PaasError::malformed(format!("invalid url {}: {}", raw, e)))?;

        if let Some(parameters) = parameters.filter(|p| !p.is_empty()) {
            let mut pairs = url.query_pairs_mut();
            for (name, value) in parameters {
                pairs.append_pair(name, &query_value(value));
            }
        }
        Ok(url.to_string())
    }
}

fn query_value(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn override_header(headers: &mut IndexMap<String, String>, name: &str, value: &str) {
    let existing = headers
        .keys()
        .find(|k| k.eq_ignore_ascii_case(name))
        .cloned();
    if let Some(existing) = existing {
        headers.shift_remove(&existing);
    }
    headers.insert(name.to_string(), value.to_string());
}
