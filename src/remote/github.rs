//! GitHub git-data REST API store

use std::fmt;
use std::time::Duration;

use reqwest::blocking::{Client, RequestBuilder};
use reqwest::header::ACCEPT;
use reqwest::{Method, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::RemoteConfig;
use crate::error::{Error, Result};
use crate::remote::{validate_ref_name, Encoding, ObjectStore, Op};
use crate::types::{CommitRequest, ObjectId, TreeEntry};

const API_VERSION: &str = "2022-11-28";

/// object store backed by one GitHub repository
pub struct GithubStore {
    client: Client,
    base_url: String,
    owner: String,
    repo: String,
    token: String,
}

impl fmt::Debug for GithubStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GithubStore")
            .field("base_url", &self.base_url)
            .field("owner", &self.owner)
            .field("repo", &self.repo)
            .field("has_token", &!self.token.is_empty())
            .finish()
    }
}

#[derive(Serialize)]
struct BlobRequest<'a> {
    content: &'a str,
    encoding: Encoding,
}

#[derive(Serialize)]
struct TreeRequest<'a> {
    base_tree: &'a ObjectId,
    tree: &'a [TreeEntry],
}

#[derive(Serialize)]
struct UpdateRefRequest<'a> {
    sha: &'a ObjectId,
    force: bool,
}

#[derive(Deserialize)]
struct ShaResponse {
    sha: ObjectId,
}

#[derive(Deserialize)]
struct RefResponse {
    object: ShaResponse,
}

#[derive(Deserialize)]
struct ErrorBody {
    message: String,
}

impl GithubStore {
    /// connect to the repository named in `remote`, authenticating with `token`
    pub fn new(remote: &RemoteConfig, token: impl Into<String>) -> Result<Self> {
        let token = token.into();
        if token.trim().is_empty() {
            return Err(Error::Auth("no token supplied".to_string()));
        }

        let client = Client::builder()
            .timeout(Duration::from_secs(remote.timeout_secs))
            .user_agent(concat!("zine/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| Error::Network(format!("failed to build http client: {}", e)))?;

        Ok(Self {
            client,
            base_url: remote.api_base.trim_end_matches('/').to_string(),
            owner: remote.owner.clone(),
            repo: remote.repo.clone(),
            token,
        })
    }

    /// url of a git-data endpoint, e.g. `git_url("blobs")`
    fn git_url(&self, tail: &str) -> String {
        format!(
            "{}/repos/{}/{}/git/{}",
            self.base_url, self.owner, self.repo, tail
        )
    }

    fn request(&self, method: Method, url: &str) -> RequestBuilder {
        self.client
            .request(method, url)
            .bearer_auth(&self.token)
            .header(ACCEPT, "application/vnd.github+json")
            .header("X-GitHub-Api-Version", API_VERSION)
    }

    fn send<T: DeserializeOwned>(&self, op: Op, req: RequestBuilder) -> Result<T> {
        let resp = req.send().map_err(map_network_error)?;
        let status = resp.status();
        debug!(%op, status = status.as_u16(), "github response");

        if status.is_success() {
            resp.json()
                .map_err(|e| Error::Network(format!("invalid response to {}: {}", op, e)))
        } else {
            let body = resp.text().unwrap_or_default();
            Err(map_status(op, status, &body))
        }
    }
}

impl ObjectStore for GithubStore {
    fn get_ref(&self, ref_name: &str) -> Result<ObjectId> {
        validate_ref_name(ref_name)?;
        let url = self.git_url(&format!("ref/{}", ref_name));
        let resp: RefResponse = self.send(Op::GetRef, self.request(Method::GET, &url))?;
        Ok(resp.object.sha)
    }

    fn create_blob(&self, content: &str, encoding: Encoding) -> Result<ObjectId> {
        let url = self.git_url("blobs");
        let body = BlobRequest { content, encoding };
        let resp: ShaResponse =
            self.send(Op::CreateBlob, self.request(Method::POST, &url).json(&body))?;
        Ok(resp.sha)
    }

    fn create_tree(&self, entries: &[TreeEntry], base: &ObjectId) -> Result<ObjectId> {
        let url = self.git_url("trees");
        let body = TreeRequest {
            base_tree: base,
            tree: entries,
        };
        let resp: ShaResponse =
            self.send(Op::CreateTree, self.request(Method::POST, &url).json(&body))?;
        Ok(resp.sha)
    }

    fn create_commit(&self, commit: &CommitRequest) -> Result<ObjectId> {
        let url = self.git_url("commits");
        let resp: ShaResponse =
            self.send(Op::CreateCommit, self.request(Method::POST, &url).json(commit))?;
        Ok(resp.sha)
    }

    fn update_ref(&self, ref_name: &str, sha: &ObjectId) -> Result<()> {
        validate_ref_name(ref_name)?;
        let url = self.git_url(&format!("refs/{}", ref_name));
        let body = UpdateRefRequest { sha, force: false };
        let _: RefResponse =
            self.send(Op::UpdateRef, self.request(Method::PATCH, &url).json(&body))?;
        Ok(())
    }
}

/// map a non-2xx GitHub response to the error taxonomy
pub fn map_status(op: Op, status: StatusCode, body: &str) -> Error {
    let message = serde_json::from_str::<ErrorBody>(body)
        .map(|b| b.message)
        .unwrap_or_else(|_| {
            if body.is_empty() {
                format!("status {}", status)
            } else {
                body.to_string()
            }
        });
    let message = format!("{} returned {}: {}", op, status.as_u16(), message);

    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => Error::Auth(message),
        StatusCode::NOT_FOUND => Error::NotFound(message),
        StatusCode::CONFLICT => Error::Conflict(message),
        // "Update is not a fast forward"
        StatusCode::UNPROCESSABLE_ENTITY if op == Op::UpdateRef => Error::Conflict(message),
        StatusCode::UNPROCESSABLE_ENTITY | StatusCode::BAD_REQUEST => {
            Error::InvalidContent(message)
        }
        _ => Error::Network(message),
    }
}

fn map_network_error(e: reqwest::Error) -> Error {
    if e.is_timeout() {
        Error::Network(format!("request timed out: {}", e))
    } else if e.is_connect() {
        Error::Network(format!("connection failed: {}", e))
    } else {
        Error::Network(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    fn remote() -> RemoteConfig {
        RemoteConfig {
            owner: "octo".into(),
            repo: "blog".into(),
            api_base: "https://api.github.com/".into(),
            ..RemoteConfig::default()
        }
    }

    #[test]
    fn test_git_url() {
        let store = GithubStore::new(&remote(), "t0ken").unwrap();
        assert_eq!(
            store.git_url("ref/heads/main"),
            "https://api.github.com/repos/octo/blog/git/ref/heads/main"
        );
    }

    #[test]
    fn test_empty_token_is_auth_error() {
        let result = GithubStore::new(&remote(), "  ");
        assert!(matches!(result, Err(Error::Auth(_))));
    }

    #[test]
    fn test_debug_hides_token() {
        let store = GithubStore::new(&remote(), "secret-token-value").unwrap();
        let dbg = format!("{:?}", store);
        assert!(!dbg.contains("secret-token-value"));
        assert!(dbg.contains("has_token: true"));
    }

    #[test]
    fn test_map_status_taxonomy() {
        let kind = |op, code: u16| map_status(op, StatusCode::from_u16(code).unwrap(), "").kind();

        assert_eq!(kind(Op::GetRef, 401), ErrorKind::Auth);
        assert_eq!(kind(Op::CreateBlob, 403), ErrorKind::Auth);
        assert_eq!(kind(Op::GetRef, 404), ErrorKind::NotFound);
        assert_eq!(kind(Op::UpdateRef, 422), ErrorKind::Conflict);
        assert_eq!(kind(Op::UpdateRef, 409), ErrorKind::Conflict);
        assert_eq!(kind(Op::CreateBlob, 422), ErrorKind::InvalidContent);
        assert_eq!(kind(Op::CreateTree, 400), ErrorKind::InvalidContent);
        assert_eq!(kind(Op::CreateCommit, 502), ErrorKind::Network);
    }

    #[test]
    fn test_map_status_uses_github_message() {
        let e = map_status(
            Op::UpdateRef,
            StatusCode::UNPROCESSABLE_ENTITY,
            r#"{"message":"Update is not a fast forward","documentation_url":"x"}"#,
        );
        let text = e.to_string();
        assert!(text.contains("Update is not a fast forward"));
        assert!(text.contains("update-ref"));
    }

    #[test]
    fn test_request_bodies() {
        let sha = ObjectId::parse("aa218f56b14c9653891f9e74264a383fa43fefbd").unwrap();

        let blob = serde_json::to_value(BlobRequest {
            content: "WA==",
            encoding: Encoding::Base64,
        })
        .unwrap();
        assert_eq!(blob, serde_json::json!({"content": "WA==", "encoding": "base64"}));

        let entries = vec![TreeEntry::blob("list.json", sha.clone()).unwrap()];
        let tree = serde_json::to_value(TreeRequest {
            base_tree: &sha,
            tree: &entries,
        })
        .unwrap();
        assert_eq!(tree["base_tree"], sha.as_str());
        assert_eq!(tree["tree"][0]["path"], "list.json");

        let update = serde_json::to_value(UpdateRefRequest {
            sha: &sha,
            force: false,
        })
        .unwrap();
        assert_eq!(update["force"], false);
    }

    #[test]
    fn test_ref_response_parse() {
        let body = r#"{"ref":"refs/heads/main","object":{"sha":"aa218f56b14c9653891f9e74264a383fa43fefbd","type":"commit"}}"#;
        let parsed: RefResponse = serde_json::from_str(body).unwrap();
        assert_eq!(parsed.object.sha.short(), "aa218f56b14c");
    }
}
