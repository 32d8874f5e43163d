//! HTTP client for a remote agent runtime

use reqwest::blocking::Client;
use reqwest::header::CONTENT_TYPE;
use reqwest::StatusCode;
use url::Url;

use super::{AgentRuntime, InvokeRequest, RuntimeResponse};
use crate::config::RuntimeSection;
use crate::constants;
use crate::error::RuntimeError;

/// Agent runtime reached over HTTP.
///
/// `invoke` POSTs the request as JSON and returns the streaming body untouched.
/// `stop_session` POSTs to `{invoke_url}/sessions/{id}/stop`.
pub struct HttpAgentRuntime {
    client: Client,
    invoke_url: Url,
    api_key: Option<String>,
}

impl HttpAgentRuntime {
    pub fn new(config: &RuntimeSection) -> Result<Self, RuntimeError> {
        let raw = config
            .invoke_url
            .as_deref()
            .ok_or_else(|| RuntimeError::Endpoint("runtime.invoke_url is not set".to_string()))?;
        let invoke_url =
            Url::parse(raw).map_err(|e| RuntimeError::Endpoint(format!("{}: {}", raw, e)))?;

        // Blocking clients apply this per read, so it bounds silence rather than stream length
        let client = Client::builder()
            .connect_timeout(config.connect_timeout())
            .timeout(config.read_timeout())
            .build()?;

        Ok(Self {
            client,
            invoke_url,
            api_key: config.api_key.clone(),
        })
    }

    fn stop_url(&self, session_id: &str) -> Result<Url, RuntimeError> {
        let mut url = self.invoke_url.clone();
        url.path_segments_mut()
            .map_err(|_| RuntimeError::Endpoint(self.invoke_url.to_string()))?
            .pop_if_empty()
            .extend(["sessions", session_id, "stop"]);
        Ok(url)
    }

    fn authorize(
        &self,
        builder: reqwest::blocking::RequestBuilder,
    ) -> reqwest::blocking::RequestBuilder {
        match &self.api_key {
            Some(key) => builder.bearer_auth(key),
            None => builder,
        }
    }
}

impl AgentRuntime for HttpAgentRuntime {
    fn invoke(&self, request: &InvokeRequest) -> Result<RuntimeResponse, RuntimeError> {
        let mut builder = self
            .authorize(self.client.post(self.invoke_url.clone()))
            .json(request);
        if let Some(session_id) = &request.session_id {
            builder = builder.header(constants::runtime::SESSION_HEADER, session_id);
        }

        tracing::info!(
            "Invoking runtime for account {} (session: {:?}, prompt {} chars)",
            request.resource_id,
            request.session_id,
            request.prompt.len()
        );

        let response = builder.send()?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().unwrap_or_default();
            return Err(RuntimeError::Status {
                status: status.as_u16(),
                body,
            });
        }

        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
            .to_string();

        Ok(RuntimeResponse {
            content_type,
            body: Box::new(response),
        })
    }

    fn stop_session(&self, session_id: &str) -> Result<bool, RuntimeError> {
        let url = self.stop_url(session_id)?;
        let response = self.authorize(self.client.post(url)).send()?;

        match response.status() {
            status if status.is_success() => {
                tracing::info!("Stopped runtime session {}", session_id);
                Ok(true)
            }
            StatusCode::NOT_FOUND => {
                tracing::debug!("Runtime session {} not found, nothing to stop", session_id);
                Ok(false)
            }
            status => Err(RuntimeError::Status {
                status: status.as_u16(),
                body: response.text().unwrap_or_default(),
            }),
        }
    }
}
