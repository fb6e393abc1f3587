use std::time::Duration;

use async_trait::async_trait;
use charter_core::{CollaboratorError, FormationService, StepReceipt, StepRequest};
use reqwest::{Client, StatusCode};
use secrecy::{ExposeSecret, SecretString};
use tracing::{info, warn};

const IDEMPOTENCY_HEADER: &str = "Idempotency-Key";

/// Sends formation steps to a remote registration service at
/// `POST {base_url}/v1/steps/{kind}`.
///
/// Every attempt of a step carries the same `Idempotency-Key`, so the service
/// can answer a replay with the original receipt.
pub struct HttpRegistrationService {
    client: Client,
    base_url: String,
    api_key: Option<SecretString>,
    timeout: Duration,
}

impl HttpRegistrationService {
    pub fn new(
        base_url: &str,
        api_key: Option<SecretString>,
        timeout: Duration,
    ) -> Result<Self, reqwest::Error> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self { client, base_url: base_url.trim_end_matches('/').to_string(), api_key, timeout })
    }

    fn endpoint(&self, request: &StepRequest) -> String {
        format!("{}/v1/steps/{}", self.base_url, request.kind.as_str())
    }

    fn transport_error(&self, error: reqwest::Error) -> CollaboratorError {
        if error.is_timeout() {
            CollaboratorError::Timeout(self.timeout.as_secs())
        } else if error.is_decode() {
            CollaboratorError::Rejected(format!("unreadable receipt: {error}"))
        } else {
            CollaboratorError::Unavailable(error.to_string())
        }
    }
}

fn status_error(status: StatusCode, body: &str) -> CollaboratorError {
    let detail =
        if body.trim().is_empty() { status.to_string() } else { format!("{status}: {body}") };
    if status.is_server_error()
        || status == StatusCode::TOO_MANY_REQUESTS
        || status == StatusCode::REQUEST_TIMEOUT
    {
        CollaboratorError::Unavailable(detail)
    } else {
        CollaboratorError::Rejected(detail)
    }
}

#[async_trait]
impl FormationService for HttpRegistrationService {
    async fn perform(&self, request: StepRequest) -> Result<StepReceipt, CollaboratorError> {
        let url = self.endpoint(&request);
        let mut builder = self
            .client
            .post(&url)
            .header(IDEMPOTENCY_HEADER, request.idempotency_key.0.as_str())
            .json(&request);
        if let Some(api_key) = &self.api_key {
            builder = builder.bearer_auth(api_key.expose_secret());
        }

        let response = builder.send().await.map_err(|error| self.transport_error(error))?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            warn!(
                event_name = "registration.request.failed",
                workflow_id = %request.workflow_id,
                step_id = %request.step_id,
                attempt = request.attempt,
                status = status.as_u16(),
                "registration service refused the step"
            );
            return Err(status_error(status, &body));
        }

        let receipt =
            response.json::<StepReceipt>().await.map_err(|error| self.transport_error(error))?;
        info!(
            event_name = "registration.request.accepted",
            workflow_id = %request.workflow_id,
            step_id = %request.step_id,
            attempt = request.attempt,
            reference = %receipt.reference,
            "registration service accepted the step"
        );
        Ok(receipt)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    use axum::{
        extract::{Path, State},
        http::{HeaderMap, StatusCode},
        routing::post,
        Json, Router,
    };
    use charter_core::{
        CollaboratorError, EntityKind, FormationService, Jurisdiction, StepId, StepKind,
        StepRequest, WorkflowId,
    };
    use secrecy::SecretString;
    use serde_json::{json, Value};

    use super::{status_error, HttpRegistrationService};

    #[derive(Clone, Default)]
    struct Seen {
        calls: Arc<Mutex<Vec<(String, Option<String>, Option<String>)>>>,
    }

    async fn accept(
        State(seen): State<Seen>,
        Path(kind): Path<String>,
        headers: HeaderMap,
        Json(body): Json<Value>,
    ) -> (StatusCode, Json<Value>) {
        let header = |name: &str| {
            headers.get(name).and_then(|value| value.to_str().ok()).map(str::to_string)
        };
        seen.calls.lock().unwrap().push((
            kind.clone(),
            header("idempotency-key"),
            header("authorization"),
        ));
        if body["entity_name"] == "Reject Me LLC" {
            return (StatusCode::UNPROCESSABLE_ENTITY, Json(json!({ "error": "name taken" })));
        }
        (StatusCode::OK, Json(json!({ "reference": format!("REG-{kind}"), "detail": {} })))
    }

    async fn registry() -> (String, Seen) {
        let seen = Seen::default();
        let app = Router::new().route("/v1/steps/{kind}", post(accept)).with_state(seen.clone());
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let address = listener.local_addr().expect("address");
        tokio::spawn(async move {
            let _ = axum::serve(listener, app).await;
        });
        (format!("http://{address}/"), seen)
    }

    fn request(entity_name: &str) -> StepRequest {
        let workflow_id = WorkflowId("wf_http".to_string());
        let step_id = StepId::from("formation_filing");
        StepRequest {
            idempotency_key: charter_core::domain::workflow::OperationKey::for_step(
                &workflow_id,
                &step_id,
            ),
            workflow_id,
            step_id,
            kind: StepKind::FormationFiling,
            jurisdiction: Jurisdiction::Wyoming,
            entity_name: entity_name.to_string(),
            entity_kind: EntityKind::Llc,
            attempt: 1,
            input: Value::Null,
        }
    }

    #[tokio::test]
    async fn sends_idempotency_key_and_bearer_token() {
        let (base_url, seen) = registry().await;
        let service = HttpRegistrationService::new(
            &base_url,
            Some(SecretString::from("reg-key-1".to_string())),
            Duration::from_secs(5),
        )
        .expect("client");

        let request = request("Prairie Goods LLC");
        let expected_key = request.idempotency_key.0.clone();
        let receipt = service.perform(request).await.expect("accepted");

        assert_eq!(receipt.reference, "REG-formation_filing");
        let calls = seen.calls.lock().unwrap().clone();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].1.as_deref(), Some(expected_key.as_str()));
        assert_eq!(calls[0].2.as_deref(), Some("Bearer reg-key-1"));
    }

    #[tokio::test]
    async fn client_errors_are_rejections() {
        let (base_url, _) = registry().await;
        let service =
            HttpRegistrationService::new(&base_url, None, Duration::from_secs(5)).expect("client");

        let error = service.perform(request("Reject Me LLC")).await.expect_err("rejected");
        assert!(matches!(error, CollaboratorError::Rejected(ref detail) if detail.contains("422")));
    }

    #[tokio::test]
    async fn unreachable_service_is_unavailable() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let address = listener.local_addr().expect("address");
        drop(listener);

        let service =
            HttpRegistrationService::new(&format!("http://{address}"), None, Duration::from_secs(2))
                .expect("client");
        let error = service.perform(request("Prairie Goods LLC")).await.expect_err("refused");
        assert!(matches!(error, CollaboratorError::Unavailable(_)));
    }

    #[test]
    fn throttling_and_server_errors_stay_retryable() {
        assert!(matches!(
            status_error(StatusCode::TOO_MANY_REQUESTS, ""),
            CollaboratorError::Unavailable(_)
        ));
        assert!(matches!(
            status_error(StatusCode::BAD_GATEWAY, "upstream"),
            CollaboratorError::Unavailable(_)
        ));
        assert!(matches!(status_error(StatusCode::CONFLICT, ""), CollaboratorError::Rejected(_)));
    }
}
