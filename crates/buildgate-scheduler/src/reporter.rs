//! Build API status reporter.

use async_trait::async_trait;
use buildgate_core::{BuildId, BuildStatus, Error, Result, StatusReporter};
use chrono::{DateTime, Utc};
use reqwest::{RequestBuilder, Response};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::records::BuildConfigStore;

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct StatusUpdate<'a> {
    status: BuildStatus,
    status_message: &'a str,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct StepStop {
    end_time: DateTime<Utc>,
    code: i32,
}

#[derive(Debug, Deserialize)]
struct Step {
    name: String,
}

/// Where a build's API lives and how to authenticate to it.
struct Target {
    base: String,
    token: Option<String>,
}

impl Target {
    fn url(&self, build_id: BuildId, path: &str) -> String {
        format!("{}/v4/builds/{}{}", self.base, build_id, path)
    }

    fn authorize(&self, request: RequestBuilder) -> RequestBuilder {
        match &self.token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }
}

/// Reports status to the build API that owns each build.
///
/// The API endpoint and token come from the build's config record. When the
/// record is gone the build has already been resolved and nothing is sent.
pub struct ApiStatusReporter {
    client: reqwest::Client,
    records: BuildConfigStore,
}

impl ApiStatusReporter {
    pub fn new(records: BuildConfigStore) -> Self {
        Self::with_client(records, reqwest::Client::new())
    }

    pub fn with_client(records: BuildConfigStore, client: reqwest::Client) -> Self {
        Self { client, records }
    }

    async fn target(&self, build_id: BuildId) -> Result<Option<Target>> {
        let Some(config) = self.records.get(build_id).await? else {
            debug!(build_id = %build_id, "Build config gone, skipping build API call");
            return Ok(None);
        };
        let Some(api_uri) = config.api_uri else {
            warn!(build_id = %build_id, "Build config has no apiUri, cannot call build API");
            return Ok(None);
        };
        Ok(Some(Target {
            base: api_uri.as_str().trim_end_matches('/').to_string(),
            token: config.token,
        }))
    }

    async fn send(&self, method: &str, url: &str, request: RequestBuilder) -> Result<Response> {
        let response = request
            .send()
            .await
            .map_err(|e| Error::Reporter(e.to_string()))?;

        if !response.status().is_success() {
            let code = response.status();
            let text = response.text().await.unwrap_or_default();
            return Err(Error::Reporter(format!(
                "{} {} returned {}: {}",
                method, url, code, text
            )));
        }
        Ok(response)
    }
}

#[async_trait]
impl StatusReporter for ApiStatusReporter {
    async fn report(&self, build_id: BuildId, status: BuildStatus, message: &str) -> Result<()> {
        let Some(target) = self.target(build_id).await? else {
            return Ok(());
        };

        let url = target.url(build_id, "");
        let request = target.authorize(self.client.put(&url).json(&StatusUpdate {
            status,
            status_message: message,
        }));
        self.send("PUT", &url, request).await?;

        debug!(build_id = %build_id, %status, "Reported build status");
        Ok(())
    }

    async fn stop_active_step(&self, build_id: BuildId, code: i32) -> Result<Option<String>> {
        let Some(target) = self.target(build_id).await? else {
            return Ok(None);
        };

        let url = target.url(build_id, "/steps?status=active");
        let response = self
            .send("GET", &url, target.authorize(self.client.get(&url)))
            .await?;
        let steps: Vec<Step> = response
            .json()
            .await
            .map_err(|e| Error::Reporter(e.to_string()))?;
        let Some(step) = steps.into_iter().next() else {
            return Ok(None);
        };

        let url = target.url(build_id, &format!("/steps/{}", step.name));
        let request = target.authorize(self.client.put(&url).json(&StepStop {
            end_time: Utc::now(),
            code,
        }));
        self.send("PUT", &url, request).await?;

        debug!(build_id = %build_id, step = %step.name, code, "Stopped active step");
        Ok(Some(step.name))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::Keys;
    use buildgate_core::BuildConfig;
    use buildgate_store::MemoryStore;
    use std::sync::Arc;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    /// Answers one HTTP request per `(status line, body)` entry, each on its
    /// own connection, and hands back the raw request texts.
    async fn scripted_server(
        responses: Vec<(&'static str, &'static str)>,
    ) -> (String, tokio::task::JoinHandle<Vec<String>>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let handle = tokio::spawn(async move {
            let mut requests = Vec::new();
            for (status_line, body) in responses {
                let (mut socket, _) = listener.accept().await.unwrap();
                let mut buf = Vec::new();
                let mut chunk = [0u8; 1024];
                loop {
                    let n = socket.read(&mut chunk).await.unwrap();
                    buf.extend_from_slice(&chunk[..n]);
                    let text = String::from_utf8_lossy(&buf);
                    if let Some(end) = text.find("\r\n\r\n") {
                        let length = text[..end]
                            .lines()
                            .find_map(|l| {
                                l.to_ascii_lowercase()
                                    .strip_prefix("content-length:")
                                    .map(|v| v.trim().parse::<usize>().unwrap())
                            })
                            .unwrap_or(0);
                        if buf.len() >= end + 4 + length || n == 0 {
                            break;
                        }
                    }
                    if n == 0 {
                        break;
                    }
                }
                let response = format!(
                    "{status_line}\r\ncontent-type: application/json\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{body}",
                    body.len()
                );
                socket.write_all(response.as_bytes()).await.unwrap();
                requests.push(String::from_utf8_lossy(&buf).to_string());
            }
            requests
        });
        (format!("http://{addr}"), handle)
    }

    async fn one_shot_server(status_line: &'static str) -> (String, tokio::task::JoinHandle<Vec<String>>) {
        scripted_server(vec![(status_line, "")]).await
    }

    async fn reporter_with_config(api_uri: Option<&str>) -> ApiStatusReporter {
        let store = Arc::new(MemoryStore::new());
        let records = BuildConfigStore::new(store, &Keys::default());
        let mut config = BuildConfig::new(42u64, 7u64);
        config.api_uri = api_uri.map(|u| u.parse().unwrap());
        config.token = Some("sekrit".to_string());
        records.put(&config).await.unwrap();
        let client = reqwest::Client::builder().no_proxy().build().unwrap();
        ApiStatusReporter::with_client(records, client)
    }

    #[tokio::test]
    async fn test_reports_status_to_build_api() {
        let (base, server) = one_shot_server("HTTP/1.1 200 OK").await;
        let reporter = reporter_with_config(Some(&base)).await;

        reporter
            .report(BuildId::new(42), BuildStatus::Blocked, "Blocked by these running build(s): 9")
            .await
            .unwrap();

        let request = server.await.unwrap().remove(0);
        assert!(request.starts_with("PUT /v4/builds/42 "));
        assert!(request.to_ascii_lowercase().contains("authorization: bearer sekrit"));
        assert!(request.contains(r#""status":"BLOCKED""#));
        assert!(request.contains(r#""statusMessage":"Blocked by these running build(s): 9""#));
    }

    #[tokio::test]
    async fn test_api_error_is_reported_as_error() {
        let (base, _server) = one_shot_server("HTTP/1.1 500 Internal Server Error").await;
        let reporter = reporter_with_config(Some(&base)).await;

        let result = reporter
            .report(BuildId::new(42), BuildStatus::Failure, "boom")
            .await;
        assert!(matches!(result, Err(Error::Reporter(_))));
    }

    #[tokio::test]
    async fn test_skips_resolved_builds() {
        let reporter = reporter_with_config(None).await;
        reporter
            .report(BuildId::new(1), BuildStatus::Failure, "gone")
            .await
            .unwrap();
        reporter
            .report(BuildId::new(42), BuildStatus::Failure, "no api uri")
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_stops_active_step() {
        let (base, server) = scripted_server(vec![
            ("HTTP/1.1 200 OK", r#"[{"name":"install","startTime":"2024-01-01T00:00:00Z"}]"#),
            ("HTTP/1.1 200 OK", "{}"),
        ])
        .await;
        let reporter = reporter_with_config(Some(&base)).await;

        let step = reporter.stop_active_step(BuildId::new(42), 3).await.unwrap();

        assert_eq!(step.as_deref(), Some("install"));
        let requests = server.await.unwrap();
        assert!(requests[0].starts_with("GET /v4/builds/42/steps?status=active "));
        assert!(requests[1].starts_with("PUT /v4/builds/42/steps/install "));
        assert!(requests[1].contains(r#""code":3"#));
        assert!(requests[1].contains(r#""endTime":""#));
    }

    #[tokio::test]
    async fn test_no_active_step_is_not_an_error() {
        let (base, server) = scripted_server(vec![("HTTP/1.1 200 OK", "[]")]).await;
        let reporter = reporter_with_config(Some(&base)).await;

        assert_eq!(
            reporter.stop_active_step(BuildId::new(42), 3).await.unwrap(),
            None
        );
        assert_eq!(server.await.unwrap().len(), 1);
    }
}
