//! Control-plane API client
//!
//! Thin typed wrapper over the marketplace REST API. Every call maps 2xx to a
//! value, 404 to [`ApiError::NotFound`] and anything else to
//! [`ApiError::Status`] carrying the raw body. No call is retried here; the
//! caller decides whether a failure is job-scoped or instance-fatal.

use crate::error::{ApiError, ApiResult};
use crate::types::{Batch, Image, Instance, JobUpdate};
use async_trait::async_trait;
use reqwest::{Method, RequestBuilder, Response};
use serde::de::DeserializeOwned;
use std::time::Duration;
use tracing::debug;

/// Operations the agent consumes from the control-plane
#[async_trait]
pub trait ControlPlane: Send + Sync {
    async fn get_instance(&self, instance_id: &str) -> ApiResult<Instance>;

    /// Mark the instance AVAILABLE
    async fn start_instance(&self, instance_id: &str) -> ApiResult<Instance>;

    /// Heartbeat that returns the next batch of jobs
    async fn poll_jobs(&self, instance_id: &str) -> ApiResult<Batch>;

    /// Mark the instance NOT_AVAILABLE
    async fn stop_instance(&self, instance_id: &str) -> ApiResult<()>;

    async fn patch_job(&self, job_id: &str, update: &JobUpdate) -> ApiResult<()>;

    /// Image catalog, or only the images declared by `instance_id`
    async fn list_images(&self, instance_id: Option<&str>) -> ApiResult<Vec<Image>>;

    async fn add_image(&self, instance_id: &str, reference: &str) -> ApiResult<()>;

    async fn remove_image(&self, instance_id: &str, reference: &str) -> ApiResult<()>;
}

/// HTTP implementation of [`ControlPlane`]
#[derive(Clone)]
pub struct HttpControlPlane {
    base_url: String,
    token: String,
    client: reqwest::Client,
}

impl HttpControlPlane {
    pub fn new(base_url: &str, token: &str, timeout: Duration) -> ApiResult<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            token: token.to_string(),
            client,
        })
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        self.client
            .request(method, format!("{}{}", self.base_url, path))
            .header("Authorization", format!("Token {}", self.token))
    }

    fn instance_action(&self, instance_id: &str, action: &str) -> RequestBuilder {
        self.request(
            Method::PATCH,
            &format!("/api/v1/instances/{}/{}/", instance_id, action),
        )
    }

    async fn send(&self, request: RequestBuilder, what: &str) -> ApiResult<Response> {
        let response = request.send().await?;
        let status = response.status();
        debug!("{} -> {}", what, status);

        if status.is_success() {
            return Ok(response);
        }

        let body = response.text().await.unwrap_or_default();
        if status == reqwest::StatusCode::NOT_FOUND {
            return Err(ApiError::NotFound(what.to_string()));
        }
        Err(ApiError::Status {
            status: status.as_u16(),
            body,
        })
    }

    async fn send_json<T: DeserializeOwned>(
        &self,
        request: RequestBuilder,
        what: &str,
    ) -> ApiResult<T> {
        let response = self.send(request, what).await?;
        response
            .json()
            .await
            .map_err(|e| ApiError::Decode(format!("{}: {}", what, e)))
    }
}

#[async_trait]
impl ControlPlane for HttpControlPlane {
    async fn get_instance(&self, instance_id: &str) -> ApiResult<Instance> {
        let request = self.request(Method::GET, &format!("/api/v1/instances/{}/", instance_id));
        self.send_json(request, &format!("instance {}", instance_id))
            .await
    }

    async fn start_instance(&self, instance_id: &str) -> ApiResult<Instance> {
        let request = self.instance_action(instance_id, "start");
        self.send_json(request, &format!("instance {}", instance_id))
            .await
    }

    async fn poll_jobs(&self, instance_id: &str) -> ApiResult<Batch> {
        let request = self.instance_action(instance_id, "ping");
        self.send_json(request, &format!("instance {}", instance_id))
            .await
    }

    async fn stop_instance(&self, instance_id: &str) -> ApiResult<()> {
        let request = self.instance_action(instance_id, "stop");
        self.send(request, &format!("instance {}", instance_id))
            .await?;
        Ok(())
    }

    async fn patch_job(&self, job_id: &str, update: &JobUpdate) -> ApiResult<()> {
        let request = self
            .request(Method::PATCH, &format!("/api/v1/jobs/{}/", job_id))
            .json(update);
        self.send(request, &format!("job {}", job_id)).await?;
        Ok(())
    }

    async fn list_images(&self, instance_id: Option<&str>) -> ApiResult<Vec<Image>> {
        let mut request = self.request(Method::GET, "/api/v1/images/");
        if let Some(id) = instance_id {
            request = request.query(&[("instance", id)]);
        }
        self.send_json(request, "images").await
    }

    async fn add_image(&self, instance_id: &str, reference: &str) -> ApiResult<()> {
        let request = self
            .instance_action(instance_id, "add-image")
            .json(&serde_json::json!({ "image_registry_path": reference }));
        self.send(request, &format!("instance {}", instance_id))
            .await?;
        Ok(())
    }

    async fn remove_image(&self, instance_id: &str, reference: &str) -> ApiResult<()> {
        let request = self
            .instance_action(instance_id, "delete-image")
            .json(&serde_json::json!({ "image_registry_path": reference }));
        self.send(request, &format!("instance {}", instance_id))
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{InstanceType, JobStatus};
    use httpmock::prelude::*;
    use httpmock::Method::PATCH;

    fn client(server: &MockServer) -> HttpControlPlane {
        HttpControlPlane::new(&server.base_url(), "tok", Duration::from_secs(5)).unwrap()
    }

    #[tokio::test]
    async fn test_start_instance_returns_instance() {
        let server = MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(PATCH)
                    .path("/api/v1/instances/i-1/start/")
                    .header("Authorization", "Token tok");
                then.status(200)
                    .header("content-type", "application/json")
                    .body(r#"{"uuid": "i-1", "name": "box", "status": 2, "type": 1, "max_num_parallel_jobs": 3}"#);
            })
            .await;

        let instance = client(&server).start_instance("i-1").await.unwrap();
        mock.assert_async().await;
        assert_eq!(instance.kind, InstanceType::Cpu);
        assert_eq!(instance.max_parallel_jobs, 3);
    }

    #[tokio::test]
    async fn test_not_found_is_distinguished() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(PATCH).path("/api/v1/instances/missing/start/");
                then.status(404).body("Not found.");
            })
            .await;

        let err = client(&server).start_instance("missing").await.unwrap_err();
        assert!(err.is_not_found(), "got {:?}", err);
    }

    #[tokio::test]
    async fn test_server_error_carries_body() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(PATCH).path("/api/v1/instances/i-1/ping/");
                then.status(500).body("database down");
            })
            .await;

        match client(&server).poll_jobs("i-1").await {
            Err(ApiError::Status { status, body }) => {
                assert_eq!(status, 500);
                assert_eq!(body, "database down");
            }
            other => panic!("Expected Status error, got: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_poll_jobs_parses_batch() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(PATCH).path("/api/v1/instances/i-1/ping/");
                then.status(200)
                    .header("content-type", "application/json")
                    .body(r#"[{"job_uuid": "j-1", "requires_gpu": true, "image_registry_path": "img:gpu", "wrapped_code": "x"}]"#);
            })
            .await;

        let jobs = client(&server).poll_jobs("i-1").await.unwrap();
        assert_eq!(jobs.len(), 1);
        assert!(jobs[0].requires_gpu);
        assert_eq!(jobs[0].image_reference, "img:gpu");
    }

    #[tokio::test]
    async fn test_poll_jobs_invalid_body() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(PATCH).path("/api/v1/instances/i-1/ping/");
                then.status(200).body("not json");
            })
            .await;

        let err = client(&server).poll_jobs("i-1").await.unwrap_err();
        assert!(matches!(err, ApiError::Decode(_)), "got {:?}", err);
    }

    #[tokio::test]
    async fn test_patch_job_sends_partial_body() {
        let server = MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(PATCH)
                    .path("/api/v1/jobs/j-1/")
                    .json_body(serde_json::json!({ "status": 2 }));
                then.status(200).body("{}");
            })
            .await;

        client(&server)
            .patch_job("j-1", &JobUpdate::status(JobStatus::InProgress))
            .await
            .unwrap();
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_list_images_filters_by_instance() {
        let server = MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(GET)
                    .path("/api/v1/images/")
                    .query_param("instance", "i-1");
                then.status(200)
                    .header("content-type", "application/json")
                    .body(r#"[{"uuid": "a", "registry_path": "img:1", "requires_gpu": false}]"#);
            })
            .await;

        let images = client(&server).list_images(Some("i-1")).await.unwrap();
        mock.assert_async().await;
        assert_eq!(images[0].reference, "img:1");
    }

    #[tokio::test]
    async fn test_add_and_remove_image() {
        let server = MockServer::start_async().await;
        let add = server
            .mock_async(|when, then| {
                when.method(PATCH)
                    .path("/api/v1/instances/i-1/add-image/")
                    .json_body(serde_json::json!({ "image_registry_path": "img:1" }));
                then.status(200);
            })
            .await;
        let remove = server
            .mock_async(|when, then| {
                when.method(PATCH)
                    .path("/api/v1/instances/i-1/delete-image/")
                    .json_body(serde_json::json!({ "image_registry_path": "img:1" }));
                then.status(204);
            })
            .await;

        let cp = client(&server);
        cp.add_image("i-1", "img:1").await.unwrap();
        cp.remove_image("i-1", "img:1").await.unwrap();
        add.assert_async().await;
        remove.assert_async().await;
    }

    #[tokio::test]
    async fn test_trailing_slash_in_base_url() {
        let server = MockServer::start_async().await;
        let stop = server
            .mock_async(|when, then| {
                when.method(PATCH).path("/api/v1/instances/i-1/stop/");
                then.status(200);
            })
            .await;

        let cp = HttpControlPlane::new(&format!("{}/", server.base_url()), "tok", Duration::from_secs(5))
            .unwrap();
        cp.stop_instance("i-1").await.unwrap();
        stop.assert_async().await;
    }

    #[tokio::test]
    async fn test_connection_error() {
        let cp = HttpControlPlane::new("http://127.0.0.1:65534", "tok", Duration::from_secs(2)).unwrap();
        let err = cp.stop_instance("i-1").await.unwrap_err();
        assert!(matches!(err, ApiError::Transport(_)), "got {:?}", err);
    }
}
