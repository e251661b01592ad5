use super::{
    decode_records, encode_records, FetchOutcome, RemoteError, RemoteFile, RemoteStore,
    WriteReceipt, WriteRequest,
};
use async_trait::async_trait;
use reqwest::header::{
    HeaderMap, HeaderValue, ACCEPT, AUTHORIZATION, ETAG, IF_NONE_MATCH, USER_AGENT,
};
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};

const GITHUB_API_URL: &str = "https://api.github.com";
const GITHUB_API_VERSION: &str = "2022-11-28";

#[derive(Debug, Deserialize)]
struct ContentsResponse {
    sha: String,
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    encoding: Option<String>,
}

#[derive(Debug, Serialize)]
struct PutContentsRequest<'a> {
    message: &'a str,
    content: String,
    branch: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    sha: Option<&'a str>,
}

#[derive(Debug, Deserialize)]
struct PutContentsResponse {
    #[serde(default)]
    content: Option<PutContent>,
}

#[derive(Debug, Deserialize)]
struct PutContent {
    sha: String,
}

/// Remote store backed by the GitHub Contents API of one repository branch.
#[derive(Debug, Clone)]
pub struct GitHubStore {
    client: reqwest::Client,
    api_base: String,
    owner: String,
    repo: String,
    token: String,
    branch: String,
}

impl GitHubStore {
    pub fn new(owner: &str, repo: &str, token: &str, branch: &str) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_base: GITHUB_API_URL.to_string(),
            owner: owner.to_string(),
            repo: repo.to_string(),
            token: token.to_string(),
            branch: branch.to_string(),
        }
    }

    /// Point at a GitHub Enterprise (or test) API root instead of api.github.com.
    pub fn with_api_base(mut self, api_base: &str) -> Self {
        self.api_base = api_base.trim_end_matches('/').to_string();
        self
    }

    pub fn branch(&self) -> &str {
        &self.branch
    }

    fn contents_url(&self, path: &str) -> String {
        format!(
            "{}/repos/{}/{}/contents/{}",
            self.api_base, self.owner, self.repo, path
        )
    }

    fn headers(&self) -> Result<HeaderMap, RemoteError> {
        let mut headers = HeaderMap::new();
        let auth = HeaderValue::from_str(&format!("Bearer {}", self.token)).map_err(|_| {
            RemoteError::Transport("token contains invalid header characters".into())
        })?;
        headers.insert(AUTHORIZATION, auth);
        headers.insert(ACCEPT, HeaderValue::from_static("application/vnd.github+json"));
        headers.insert("X-GitHub-Api-Version", HeaderValue::from_static(GITHUB_API_VERSION));
        headers.insert(
            USER_AGENT,
            HeaderValue::from_static(concat!("mushafdb/", env!("CARGO_PKG_VERSION"))),
        );
        Ok(headers)
    }
}

fn transport_error(err: reqwest::Error) -> RemoteError {
    if err.is_timeout() || err.is_connect() {
        RemoteError::Unavailable {
            status: None,
            message: err.to_string(),
        }
    } else {
        RemoteError::Transport(err.to_string())
    }
}

#[async_trait]
impl RemoteStore for GitHubStore {
    async fn fetch(
        &self,
        path: &str,
        if_none_match: Option<&str>,
    ) -> Result<FetchOutcome, RemoteError> {
        let mut headers = self.headers()?;
        if let Some(tag) = if_none_match {
            if let Ok(value) = HeaderValue::from_str(tag) {
                headers.insert(IF_NONE_MATCH, value);
            }
        }

        let response = self
            .client
            .get(self.contents_url(path))
            .query(&[("ref", self.branch.as_str())])
            .headers(headers)
            .send()
            .await
            .map_err(transport_error)?;

        let status = response.status();
        if status == StatusCode::NOT_MODIFIED {
            return Ok(FetchOutcome::NotModified);
        }
        if status == StatusCode::NOT_FOUND {
            return Ok(FetchOutcome::NotFound);
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(RemoteError::from_status(path, status.as_u16(), body));
        }

        let revision_tag = response
            .headers()
            .get(ETAG)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let body: ContentsResponse = response.json().await.map_err(|e| RemoteError::Decode {
            path: path.to_string(),
            message: e.to_string(),
        })?;

        if body.encoding.as_deref() == Some("none") {
            return Err(RemoteError::Decode {
                path: path.to_string(),
                message: "file is too large for the contents API".into(),
            });
        }
        let records = decode_records(path, body.content.as_deref().unwrap_or_default())?;

        Ok(FetchOutcome::Found(RemoteFile {
            records,
            revision_tag,
            revision_id: body.sha,
        }))
    }

    async fn write(&self, request: WriteRequest<'_>) -> Result<WriteReceipt, RemoteError> {
        let content = encode_records(request.records).map_err(|e| RemoteError::Decode {
            path: request.path.to_string(),
            message: e.to_string(),
        })?;
        let body = PutContentsRequest {
            message: request.message,
            content,
            branch: &self.branch,
            sha: request.expected_revision,
        };

        let response = self
            .client
            .put(self.contents_url(request.path))
            .headers(self.headers()?)
            .json(&body)
            .send()
            .await
            .map_err(transport_error)?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(RemoteError::from_status(request.path, status.as_u16(), text));
        }

        let revision_id = response
            .json::<PutContentsResponse>()
            .await
            .ok()
            .and_then(|r| r.content)
            .map(|c| c.sha);
        Ok(WriteReceipt { revision_id })
    }
}
