//! HTTP adapter for the Laboratory control plane.
//!
//! Every call is a `POST {address}/api/v1/lab/{Action}` with a JSON body. The
//! Laboratory answers with an envelope:
//!
//! ```json
//! { "code": "", "message": "", "data": { ... } }
//! ```
//!
//! An empty (or `"OK"`) code means success. Provider codes that denote a
//! missing resource or a malformed id, and HTTP 404, are classified as
//! [`LabError::NotFound`]; request timeouts as [`LabError::Timeout`].

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::{Value, json};

use super::{
    EnvRequest, EnvStatus, ImageInfo, JobRequest, JobState, LabConnector, LabError, LabResult,
    LaboratoryClient,
};

/// Provider code prefixes that mean "this resource does not exist".
const NOT_FOUND_CODES: &[&str] = &[
    "ResourceNotFound",
    "InvalidParameterValue.InvalidId",
    "InvalidParameterValue.Malformed",
    "InvalidEnvId",
    "InvalidJobId",
];

#[derive(Debug, Deserialize)]
struct Envelope {
    #[serde(default)]
    code: String,
    #[serde(default)]
    message: String,
    #[serde(default)]
    data: Value,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct IdData {
    #[serde(alias = "envId", alias = "jobId")]
    id: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct JobStateData {
    job_state: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ZoneListData {
    zones: Vec<String>,
}

fn is_not_found_code(code: &str) -> bool {
    NOT_FOUND_CODES.iter().any(|prefix| code.starts_with(prefix))
}

/// Classifies a Laboratory reply into data or a [`LabError`].
fn classify(http_status: u16, envelope: Envelope, resource: &str, id: &str) -> LabResult<Value> {
    if http_status == 404 || is_not_found_code(&envelope.code) {
        return Err(LabError::not_found(resource, id));
    }
    if !envelope.code.is_empty() && envelope.code != "OK" {
        return Err(LabError::remote(envelope.code, envelope.message));
    }
    if !(200..300).contains(&http_status) {
        return Err(LabError::remote(
            format!("HTTP{http_status}"),
            envelope.message,
        ));
    }
    Ok(envelope.data)
}

fn decode<T: DeserializeOwned>(action: &str, data: Value) -> LabResult<T> {
    serde_json::from_value(data)
        .map_err(|e| LabError::transport(format!("invalid {action} response: {e}")))
}

fn base_url(address: &str) -> String {
    let trimmed = address.trim().trim_end_matches('/');
    if trimmed.starts_with("http://") || trimmed.starts_with("https://") {
        trimmed.to_string()
    } else {
        format!("http://{trimmed}")
    }
}

/// Laboratory client speaking JSON over HTTP.
#[derive(Debug, Clone)]
pub struct HttpLaboratoryClient {
    client: reqwest::Client,
    base_url: String,
}

impl HttpLaboratoryClient {
    /// Creates a client for one Laboratory address.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be built.
    pub fn new(address: &str, request_timeout: Duration) -> LabResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(request_timeout)
            .build()
            .map_err(|e| LabError::transport(format!("failed to create HTTP client: {e}")))?;
        Ok(Self::with_client(client, address))
    }

    /// Creates a client sharing an existing connection pool.
    #[must_use]
    pub fn with_client(client: reqwest::Client, address: &str) -> Self {
        Self {
            client,
            base_url: base_url(address),
        }
    }

    /// Returns the resolved base URL.
    #[must_use]
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn action_url(&self, action: &str) -> String {
        format!("{}/api/v1/lab/{action}", self.base_url)
    }

    async fn call(&self, action: &str, body: Value, resource: &str, id: &str) -> LabResult<Value> {
        let response = self
            .client
            .post(self.action_url(action))
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    LabError::Timeout
                } else {
                    LabError::transport(format!("{action} request failed: {e}"))
                }
            })?;

        let status = response.status().as_u16();
        let text = response.text().await.map_err(|e| {
            if e.is_timeout() {
                LabError::Timeout
            } else {
                LabError::transport(format!("{action} response unreadable: {e}"))
            }
        })?;

        let envelope = if text.trim().is_empty() {
            Envelope {
                code: String::new(),
                message: String::new(),
                data: Value::Null,
            }
        } else {
            match serde_json::from_str::<Envelope>(&text) {
                Ok(envelope) => envelope,
                Err(_) if status == 404 => return Err(LabError::not_found(resource, id)),
                Err(e) => {
                    return Err(LabError::transport(format!(
                        "{action} returned HTTP {status} with invalid body: {e}"
                    )));
                }
            }
        };

        tracing::debug!(action, status, code = %envelope.code, "laboratory call completed");
        classify(status, envelope, resource, id)
    }
}

#[async_trait]
impl LaboratoryClient for HttpLaboratoryClient {
    async fn create_experiment_env(&self, request: &EnvRequest) -> LabResult<String> {
        let body = serde_json::to_value(request)
            .map_err(|e| LabError::transport(format!("invalid env request: {e}")))?;
        let data = self.call("CreateExperimentEnv", body, "image", &request.image_id).await?;
        Ok(decode::<IdData>("CreateExperimentEnv", data)?.id)
    }

    async fn query_experiment_env(&self, env_id: &str) -> LabResult<EnvStatus> {
        let data = self
            .call("QueryExperimentEnv", json!({ "envId": env_id }), "environment", env_id)
            .await?;
        decode("QueryExperimentEnv", data)
    }

    async fn delete_experiment_env(&self, env_id: &str) -> LabResult<()> {
        self.call("DeleteExperimentEnv", json!({ "envId": env_id }), "environment", env_id)
            .await
            .map(drop)
    }

    async fn submit_experiment(&self, request: &JobRequest) -> LabResult<String> {
        let body = serde_json::to_value(request)
            .map_err(|e| LabError::transport(format!("invalid job request: {e}")))?;
        let data = self
            .call("SubmitExperiment", body, "environment", &request.env_id)
            .await?;
        Ok(decode::<IdData>("SubmitExperiment", data)?.id)
    }

    async fn query_experiment(&self, job_id: &str) -> LabResult<JobState> {
        let data = self
            .call("QueryExperiment", json!({ "jobId": job_id }), "job", job_id)
            .await?;
        let state: JobStateData = decode("QueryExperiment", data)?;
        Ok(JobState::parse(&state.job_state))
    }

    async fn terminate_experiment(&self, job_id: &str) -> LabResult<()> {
        self.call("TerminateExperiment", json!({ "jobId": job_id }), "job", job_id)
            .await
            .map(drop)
    }

    async fn delete_experiment(&self, job_id: &str) -> LabResult<()> {
        self.call("DeleteExperiment", json!({ "jobId": job_id }), "job", job_id)
            .await
            .map(drop)
    }

    async fn available_zone_list(&self) -> LabResult<Vec<String>> {
        let data = self.call("AvailableZoneList", json!({}), "zone", "*").await?;
        Ok(decode::<ZoneListData>("AvailableZoneList", data)?.zones)
    }

    async fn cvm_image(&self, image_id: &str) -> LabResult<ImageInfo> {
        let data = self
            .call("CvmImage", json!({ "imageId": image_id }), "image", image_id)
            .await?;
        decode("CvmImage", data)
    }

    async fn share_cvm_image(&self, image_id: &str, account: &str) -> LabResult<()> {
        self.call(
            "ShareCvmImage",
            json!({ "imageId": image_id, "account": account }),
            "image",
            image_id,
        )
        .await
        .map(drop)
    }
}

/// Connects to tenant Laboratories over HTTP, sharing one connection pool.
#[derive(Debug, Clone)]
pub struct HttpLabConnector {
    client: reqwest::Client,
}

impl HttpLabConnector {
    /// Creates a connector whose clients time out after `request_timeout`.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be built.
    pub fn new(request_timeout: Duration) -> LabResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(request_timeout)
            .build()
            .map_err(|e| LabError::transport(format!("failed to create HTTP client: {e}")))?;
        Ok(Self { client })
    }
}

impl LabConnector for HttpLabConnector {
    fn connect(&self, address: &str) -> LabResult<Arc<dyn LaboratoryClient>> {
        if address.trim().is_empty() {
            return Err(LabError::transport("laboratory address is empty"));
        }
        Ok(Arc::new(HttpLaboratoryClient::with_client(
            self.client.clone(),
            address,
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn envelope(code: &str, data: Value) -> Envelope {
        Envelope {
            code: code.to_string(),
            message: "msg".to_string(),
            data,
        }
    }

    #[test]
    fn success_returns_data() {
        let data = classify(200, envelope("", json!({"id": "env-1"})), "environment", "x")
            .expect("success");
        let id: IdData = decode("CreateExperimentEnv", data).expect("decode");
        assert_eq!(id.id, "env-1");
    }

    #[test]
    fn provider_not_found_codes_are_classified() {
        for code in [
            "ResourceNotFound.EnvNotExist",
            "InvalidParameterValue.InvalidId",
            "InvalidJobId",
        ] {
            let err = classify(200, envelope(code, Value::Null), "job", "j-1")
                .expect_err("not found");
            assert_eq!(err, LabError::not_found("job", "j-1"));
        }
    }

    #[test]
    fn http_404_is_not_found() {
        let err = classify(404, envelope("", Value::Null), "environment", "env-9")
            .expect_err("not found");
        assert!(err.is_not_found());
    }

    #[test]
    fn other_codes_are_remote_errors() {
        let err = classify(200, envelope("InternalError", Value::Null), "job", "j-1")
            .expect_err("remote");
        assert!(matches!(err, LabError::Remote { ref code, .. } if code == "InternalError"));

        let err = classify(503, envelope("", Value::Null), "job", "j-1").expect_err("remote");
        assert!(!err.is_not_found());
    }

    #[test]
    fn base_url_defaults_to_http() {
        assert_eq!(base_url("10.0.0.5:8080/"), "http://10.0.0.5:8080");
        assert_eq!(base_url("https://lab.example.com"), "https://lab.example.com");
    }

    #[test]
    fn env_id_alias_is_accepted() {
        let id: IdData = decode("x", json!({"envId": "env-3"})).expect("decode");
        assert_eq!(id.id, "env-3");
    }

    #[test]
    fn connector_rejects_empty_address() {
        let connector = HttpLabConnector::new(Duration::from_secs(1)).expect("client");
        assert!(connector.connect("  ").is_err());
        assert!(connector.connect("10.1.1.1:9000").is_ok());
    }
}
