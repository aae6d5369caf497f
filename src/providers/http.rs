use async_trait::async_trait;
use serde_json::{json, Value};

use super::{ProviderAdapter, ProviderConfig, ProviderError, StageInput};

const ERROR_BODY_LIMIT: usize = 512;

/// key: provider-http -> json-over-https provider adapter
///
/// Posts `{run_id, stage, model, input}` to the configured endpoint and accepts either a
/// bare JSON document or one wrapped in an `output` field.
pub struct HttpProviderAdapter {
    provider_id: String,
    client: reqwest::Client,
}

impl HttpProviderAdapter {
    pub fn new(provider_id: impl Into<String>) -> Self {
        Self::with_client(provider_id, reqwest::Client::new())
    }

    pub fn with_client(provider_id: impl Into<String>, client: reqwest::Client) -> Self {
        Self {
            provider_id: provider_id.into(),
            client,
        }
    }

    fn transport(&self, err: reqwest::Error) -> ProviderError {
        ProviderError::Transport {
            provider: self.provider_id.clone(),
            message: err.to_string(),
        }
    }
}

#[async_trait]
impl ProviderAdapter for HttpProviderAdapter {
    fn provider_id(&self) -> &str {
        &self.provider_id
    }

    fn check_config(&self, config: &ProviderConfig) -> Result<(), String> {
        match &config.endpoint {
            Some(_) => Ok(()),
            None => Err("endpoint is required for http providers".to_string()),
        }
    }

    async fn invoke(&self, input: &StageInput, config: &ProviderConfig) -> Result<Value, ProviderError> {
        let endpoint = config
            .endpoint
            .as_deref()
            .ok_or_else(|| ProviderError::Misconfigured {
                provider: self.provider_id.clone(),
                reason: "endpoint missing".to_string(),
            })?;

        let mut request = self.client.post(endpoint).json(&json!({
            "run_id": input.run_id,
            "stage": input.stage,
            "model": config.model,
            "input": input.payload,
        }));
        if let Some(credential) = &config.credential {
            request = request.bearer_auth(credential.expose());
        }

        let response = request.send().await.map_err(|err| self.transport(err))?;
        let status = response.status();
        if !status.is_success() {
            let mut body = response.text().await.unwrap_or_default();
            if body.len() > ERROR_BODY_LIMIT {
                let mut cut = ERROR_BODY_LIMIT;
                while !body.is_char_boundary(cut) {
                    cut -= 1;
                }
                body.truncate(cut);
            }
            return Err(ProviderError::Status {
                provider: self.provider_id.clone(),
                status: status.as_u16(),
                body,
            });
        }

        let document: Value = response
            .json()
            .await
            .map_err(|err| ProviderError::InvalidResponse {
                provider: self.provider_id.clone(),
                message: err.to_string(),
            })?;
        Ok(match document {
            Value::Object(mut fields) if fields.contains_key("output") => {
                fields.remove("output").unwrap_or(Value::Null)
            }
            other => other,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::{Credential, StageKind};
    use httpmock::prelude::*;
    use uuid::Uuid;

    fn config_for(server: &MockServer) -> ProviderConfig {
        let mut config = ProviderConfig::new("remote", 0);
        config.endpoint = Some(server.url("/v1/stages"));
        config.model = Some("judge-large".to_string());
        config.credential = Some(Credential::new("sk-test"));
        config
    }

    fn input() -> StageInput {
        StageInput {
            run_id: Uuid::new_v4(),
            stage: StageKind::Adjudication,
            payload: json!({"extraction": {"summary": "a pitch"}}),
        }
    }

    #[tokio::test]
    async fn unwraps_output_envelope_and_sends_bearer() {
        let server = MockServer::start_async().await;
        let mock = server.mock(|when, then| {
            when.method(POST)
                .path("/v1/stages")
                .header("authorization", "Bearer sk-test")
                .json_body_partial(r#"{"stage": "adjudication", "model": "judge-large"}"#);
            then.status(200)
                .json_body(json!({"output": {"score": 82, "rationale": "strong team"}}));
        });

        let adapter = HttpProviderAdapter::new("remote");
        let output = adapter.invoke(&input(), &config_for(&server)).await.unwrap();

        assert_eq!(output, json!({"score": 82, "rationale": "strong team"}));
        mock.assert();
    }

    #[tokio::test]
    async fn non_success_status_is_a_provider_error() {
        let server = MockServer::start_async().await;
        let mock = server.mock(|when, then| {
            when.method(POST).path("/v1/stages");
            then.status(503).body("upstream overloaded");
        });

        let adapter = HttpProviderAdapter::new("remote");
        let err = adapter
            .invoke(&input(), &config_for(&server))
            .await
            .expect_err("503 should fail");

        assert_eq!(
            err,
            ProviderError::Status {
                provider: "remote".to_string(),
                status: 503,
                body: "upstream overloaded".to_string(),
            }
        );
        mock.assert();
    }

    #[test]
    fn endpoint_is_required_for_selection() {
        let adapter = HttpProviderAdapter::new("remote");
        assert!(adapter
            .check_config(&ProviderConfig::new("remote", 0))
            .is_err());
    }
}
