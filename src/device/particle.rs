//! Particle Cloud function calls.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;

use crate::config::DeviceConfig;
use crate::device::DeviceTrigger;
use crate::error::DeviceError;

/// Calls a cloud function on a Particle device.
pub struct ParticleClient {
    client: Client,
    api_url: String,
    device_id: String,
    access_token: SecretString,
    function_name: String,
}

#[derive(Debug, Deserialize)]
struct FunctionResponse {
    #[serde(default)]
    return_value: Option<serde_json::Value>,
}

impl ParticleClient {
    /// Build a client, or explain why the device isn't configured.
    pub fn new(config: &DeviceConfig) -> Result<Self, DeviceError> {
        let (Some(device_id), Some(access_token)) = (&config.device_id, &config.access_token)
        else {
            return Err(DeviceError::NotConfigured {
                reason: "Particle device ID or access token not set".to_string(),
            });
        };

        let client = Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .unwrap_or_else(|_| Client::new());

        Ok(Self {
            client,
            api_url: config.api_url.clone(),
            device_id: device_id.clone(),
            access_token: access_token.clone(),
            function_name: config.function_name.clone(),
        })
    }

    fn function_url(&self) -> String {
        format!(
            "{}/v1/devices/{}/{}",
            self.api_url,
            urlencoding::encode(&self.device_id),
            urlencoding::encode(&self.function_name)
        )
    }
}

#[async_trait]
impl DeviceTrigger for ParticleClient {
    async fn invoke(&self, argument: &str) -> Result<String, DeviceError> {
        tracing::info!(
            "Calling Particle function '{}' on device {}",
            self.function_name,
            self.device_id
        );

        let response = self
            .client
            .post(self.function_url())
            .form(&[
                ("access_token", self.access_token.expose_secret()),
                ("arg", argument),
            ])
            .send()
            .await?;

        let status = response.status();
        if status.as_u16() != 200 {
            let body = response.text().await.unwrap_or_default();
            return Err(DeviceError::Status {
                status: status.as_u16(),
                body,
            });
        }

        let parsed: FunctionResponse =
            response
                .json()
                .await
                .map_err(|e| DeviceError::InvalidResponse {
                    reason: e.to_string(),
                })?;

        let return_value = match parsed.return_value {
            Some(serde_json::Value::String(s)) => s,
            Some(other) => other.to_string(),
            None => "No return value".to_string(),
        };

        tracing::info!("Particle function call successful, returned: {}", return_value);
        Ok(return_value)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::{Arc, Mutex};

    use axum::{
        Form, Json, Router,
        extract::{Path, State},
        http::StatusCode,
        response::{IntoResponse, Response},
        routing::post,
    };

    use super::*;

    type Calls = Arc<Mutex<Vec<(String, String, HashMap<String, String>)>>>;

    async fn function(
        State(calls): State<Calls>,
        Path((device, func)): Path<(String, String)>,
        Form(form): Form<HashMap<String, String>>,
    ) -> Response {
        let authorized = form.get("access_token").map(String::as_str) == Some("tok");
        calls.lock().unwrap().push((device, func, form));
        if authorized {
            Json(serde_json::json!({ "id": "dev1", "connected": true, "return_value": 1 }))
                .into_response()
        } else {
            (StatusCode::UNAUTHORIZED, "invalid_token").into_response()
        }
    }

    async fn spawn_cloud() -> (String, Calls) {
        let calls: Calls = Arc::default();
        let app = Router::new()
            .route("/v1/devices/{device}/{func}", post(function))
            .with_state(Arc::clone(&calls));
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        (format!("http://{addr}"), calls)
    }

    fn config(api_url: String, token: &str) -> DeviceConfig {
        DeviceConfig {
            device_id: Some("dev1".to_string()),
            access_token: Some(SecretString::from(token)),
            function_name: "timerExpired".to_string(),
            api_url,
        }
    }

    #[test]
    fn test_missing_credentials() {
        let config = DeviceConfig {
            device_id: None,
            access_token: None,
            function_name: "timerExpired".to_string(),
            api_url: "https://api.particle.io".to_string(),
        };
        assert!(matches!(
            ParticleClient::new(&config),
            Err(DeviceError::NotConfigured { .. })
        ));
    }

    #[tokio::test]
    async fn test_invoke_posts_form() {
        let (url, calls) = spawn_cloud().await;
        let client = ParticleClient::new(&config(url, "tok")).unwrap();

        let value = client.invoke("triggered").await.unwrap();
        assert_eq!(value, "1");

        let calls = calls.lock().unwrap();
        assert_eq!(calls.len(), 1);
        let (device, func, form) = &calls[0];
        assert_eq!(device, "dev1");
        assert_eq!(func, "timerExpired");
        assert_eq!(form.get("arg").map(String::as_str), Some("triggered"));
    }

    #[tokio::test]
    async fn test_invoke_non_200_is_error() {
        let (url, _calls) = spawn_cloud().await;
        let client = ParticleClient::new(&config(url, "bad")).unwrap();

        match client.invoke("triggered").await {
            Err(DeviceError::Status { status, body }) => {
                assert_eq!(status, 401);
                assert_eq!(body, "invalid_token");
            }
            other => panic!("Expected Status error, got {other:?}"),
        }
    }
}
