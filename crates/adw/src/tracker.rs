//! External tracker/VCS port.
//!
//! The Plan, Ship, and Document phases all need to talk to an external
//! issue tracker and VCS host (comment on an issue, open a PR, attach a
//! build artifact). [`TrackerClient`] is the seam between the Phase
//! Runner and that outside world; [`HttpTrackerClient`] is the
//! production implementation, a thin `reqwest::blocking` wrapper in the
//! same style as the registry HTTP client, with rate-limit-aware retries
//! via [`adw_retry::RetryExecutor`].

use anyhow::{Context, Result, bail};
use reqwest::StatusCode;
use reqwest::blocking::Client;
use serde::{Deserialize, Serialize};

use adw_retry::{RetryExecutor, RetryPolicy};

#[derive(Debug, Clone, Serialize)]
pub struct IssueComment {
    pub issue_id: u64,
    pub body: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct PullRequestRequest {
    pub title: String,
    pub body: String,
    pub head_branch: String,
    pub base_branch: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PullRequestHandle {
    pub url: String,
    pub number: u64,
}

/// The seam the Phase Runner calls through; swapped for a mock in tests.
pub trait TrackerClient {
    fn post_comment(&self, comment: &IssueComment) -> Result<()>;
    fn open_pull_request(&self, req: &PullRequestRequest) -> Result<PullRequestHandle>;
    fn pull_request_merged(&self, handle: &PullRequestHandle) -> Result<bool>;
}

pub struct HttpTrackerClient {
    api_base: String,
    token: String,
    http: Client,
    retry: RetryExecutor,
}

impl HttpTrackerClient {
    pub fn new(api_base: String, token: String) -> Result<Self> {
        let http = Client::builder()
            .user_agent(format!("adw/{}", env!("CARGO_PKG_VERSION")))
            .build()
            .context("failed to build tracker HTTP client")?;

        Ok(Self {
            api_base,
            token,
            http,
            retry: RetryExecutor::from_policy(RetryPolicy::Default),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.api_base.trim_end_matches('/'), path.trim_start_matches('/'))
    }
}

impl TrackerClient for HttpTrackerClient {
    fn post_comment(&self, comment: &IssueComment) -> Result<()> {
        let url = self.url(&format!("issues/{}/comments", comment.issue_id));
        self.retry
            .run(|_attempt| {
                let resp = self
                    .http
                    .post(&url)
                    .bearer_auth(&self.token)
                    .json(&comment)
                    .send()
                    .context("tracker comment request failed")?;
                match resp.status() {
                    StatusCode::OK | StatusCode::CREATED => Ok(()),
                    StatusCode::TOO_MANY_REQUESTS => {
                        bail!("tracker rate limit hit posting comment")
                    }
                    s => bail!("unexpected status posting comment: {s}"),
                }
            })
    }

    fn open_pull_request(&self, req: &PullRequestRequest) -> Result<PullRequestHandle> {
        let url = self.url("pulls");
        self.retry.run(|_attempt| {
            let resp = self
                .http
                .post(&url)
                .bearer_auth(&self.token)
                .json(req)
                .send()
                .context("tracker pull request creation failed")?;
            match resp.status() {
                StatusCode::OK | StatusCode::CREATED => {
                    resp.json().context("failed to parse pull request response")
                }
                StatusCode::TOO_MANY_REQUESTS => bail!("tracker rate limit hit opening PR"),
                s => bail!("unexpected status opening pull request: {s}"),
            }
        })
    }

    fn pull_request_merged(&self, handle: &PullRequestHandle) -> Result<bool> {
        let url = self.url(&format!("pulls/{}", handle.number));
        let resp = self
            .http
            .get(&url)
            .bearer_auth(&self.token)
            .send()
            .context("tracker pull request lookup failed")?;
        match resp.status() {
            StatusCode::OK => {
                let body: serde_json::Value =
                    resp.json().context("failed to parse pull request status")?;
                Ok(body.get("merged").and_then(|v| v.as_bool()).unwrap_or(false))
            }
            StatusCode::NOT_FOUND => bail!("pull request {} not found", handle.number),
            s => bail!("unexpected status checking merge status: {s}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn post_comment_succeeds_on_201() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/issues/42/comments"))
            .respond_with(ResponseTemplate::new(201))
            .mount(&server)
            .await;

        let client = HttpTrackerClient::new(server.uri(), "token".to_string()).unwrap();
        let comment = IssueComment {
            issue_id: 42,
            body: "done".to_string(),
        };
        tokio::task::spawn_blocking(move || client.post_comment(&comment))
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn open_pull_request_parses_handle() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/pulls"))
            .respond_with(ResponseTemplate::new(201).set_body_json(serde_json::json!({
                "url": "https://example.invalid/pr/7",
                "number": 7
            })))
            .mount(&server)
            .await;

        let client = HttpTrackerClient::new(server.uri(), "token".to_string()).unwrap();
        let req = PullRequestRequest {
            title: "adw: ship run-1".to_string(),
            body: String::new(),
            head_branch: "adw/run-1".to_string(),
            base_branch: "main".to_string(),
        };
        let handle = tokio::task::spawn_blocking(move || client.open_pull_request(&req))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(handle.number, 7);
    }

    #[tokio::test]
    async fn pull_request_merged_reads_flag() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/pulls/7"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "merged": true
            })))
            .mount(&server)
            .await;

        let client = HttpTrackerClient::new(server.uri(), "token".to_string()).unwrap();
        let handle = PullRequestHandle {
            url: "https://example.invalid/pr/7".to_string(),
            number: 7,
        };
        let merged = tokio::task::spawn_blocking(move || client.pull_request_merged(&handle))
            .await
            .unwrap()
            .unwrap();
        assert!(merged);
    }
}
