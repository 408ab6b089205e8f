//! Shared HTTP plumbing for the backend clients.

use super::error::ModelError;
use serde::Serialize;
use std::time::Duration;

#[derive(Clone)]
pub(crate) struct HttpTransport {
    kind: String,
    http: reqwest::Client,
}

impl HttpTransport {
    pub fn new(kind: impl Into<String>, timeout: Duration) -> Self {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .unwrap_or_default();
        Self {
            kind: kind.into(),
            http,
        }
    }

    /// Posts JSON and checks the status, returning the open response so
    /// callers can decode JSON or consume the body as a stream.
    pub async fn post_json<B: Serialize>(
        &self,
        url: &str,
        headers: &[(&str, &str)],
        body: &B,
    ) -> Result<reqwest::Response, ModelError> {
        let mut request = self.http.post(url).json(body);
        for (name, value) in headers {
            request = request.header(*name, *value);
        }

        let response = request
            .send()
            .await
            .map_err(|source| ModelError::network(&self.kind, source))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ModelError::Status {
                kind: self.kind.clone(),
                status: status.as_u16(),
                body,
            });
        }
        Ok(response)
    }

    pub async fn post_json_decoded<B, R>(
        &self,
        url: &str,
        headers: &[(&str, &str)],
        body: &B,
    ) -> Result<R, ModelError>
    where
        B: Serialize,
        R: serde::de::DeserializeOwned,
    {
        let response = self.post_json(url, headers, body).await?;
        response
            .json()
            .await
            .map_err(|source| ModelError::network(&self.kind, source))
    }
}
