//! Publishing boundary: the `Publisher` contract and its Bluesky
//! implementation over the atproto XRPC endpoints.

use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use chrono::{SecondsFormat, Utc};
use dfbugs_core::{LinkFacet, PostText};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;

pub const CRATE_NAME: &str = "dfbugs-publish";

#[derive(Debug, Clone)]
pub struct PublishConfig {
    pub service: String,
    pub handle: String,
    pub password: String,
}

impl PublishConfig {
    /// Credentials come from the environment; both must be present and
    /// non-empty before any network call is attempted.
    pub fn from_env() -> Result<Self, PublishError> {
        let handle = std::env::var("BLUESKY_HANDLE").ok().filter(|v| !v.is_empty());
        let password = std::env::var("BLUESKY_PASSWORD").ok().filter(|v| !v.is_empty());
        match (handle, password) {
            (Some(handle), Some(password)) => Ok(Self {
                service: std::env::var("BLUESKY_SERVICE")
                    .unwrap_or_else(|_| "https://bsky.social".to_string()),
                handle,
                password,
            }),
            _ => Err(PublishError::MissingCredentials),
        }
    }
}

#[derive(Debug, Error)]
pub enum PublishError {
    #[error("BLUESKY_HANDLE and BLUESKY_PASSWORD must be set (see .env.example)")]
    MissingCredentials,
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("{endpoint} rejected with status {status}: {body}")]
    Rejected {
        endpoint: &'static str,
        status: u16,
        body: String,
    },
}

/// Opaque reference to a published post.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PostRef {
    pub uri: String,
}

#[async_trait]
pub trait Publisher: Send + Sync {
    async fn publish(&self, post: &PostText) -> Result<PostRef, PublishError>;
}

#[derive(Debug, Serialize)]
struct CreateSessionRequest<'a> {
    identifier: &'a str,
    password: &'a str,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreateSessionResponse {
    access_jwt: String,
    did: String,
}

#[derive(Debug, Serialize)]
struct CreateRecordRequest<'a> {
    repo: &'a str,
    collection: &'a str,
    record: PostRecord<'a>,
}

#[derive(Debug, Serialize)]
struct PostRecord<'a> {
    #[serde(rename = "$type")]
    record_type: &'a str,
    text: &'a str,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    facets: Vec<FacetJson<'a>>,
    #[serde(rename = "createdAt")]
    created_at: String,
}

#[derive(Debug, Serialize)]
struct FacetJson<'a> {
    index: FacetIndex,
    features: Vec<FacetFeature<'a>>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct FacetIndex {
    byte_start: usize,
    byte_end: usize,
}

#[derive(Debug, Serialize)]
struct FacetFeature<'a> {
    #[serde(rename = "$type")]
    feature_type: &'a str,
    uri: &'a str,
}

#[derive(Debug, Deserialize)]
struct CreateRecordResponse {
    uri: String,
}

fn facet_json(facet: &LinkFacet) -> FacetJson<'_> {
    FacetJson {
        index: FacetIndex {
            byte_start: facet.byte_start,
            byte_end: facet.byte_end,
        },
        features: vec![FacetFeature {
            feature_type: "app.bsky.richtext.facet#link",
            uri: &facet.uri,
        }],
    }
}

fn post_record<'a>(post: &'a PostText, created_at: String) -> PostRecord<'a> {
    PostRecord {
        record_type: "app.bsky.feed.post",
        text: post.text(),
        facets: post.facets().iter().map(facet_json).collect(),
        created_at,
    }
}

/// Bluesky client: createSession for an access token, then createRecord of
/// an `app.bsky.feed.post`. Single attempt per endpoint, no retries.
#[derive(Debug)]
pub struct BlueskyPublisher {
    client: reqwest::Client,
    config: PublishConfig,
}

impl BlueskyPublisher {
    pub fn new(config: PublishConfig) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .context("building reqwest client")?;
        Ok(Self { client, config })
    }

    fn xrpc_url(&self, method: &str) -> String {
        format!("{}/xrpc/{method}", self.config.service.trim_end_matches('/'))
    }

    async fn create_session(&self) -> Result<CreateSessionResponse, PublishError> {
        let resp = self
            .client
            .post(self.xrpc_url("com.atproto.server.createSession"))
            .json(&CreateSessionRequest {
                identifier: &self.config.handle,
                password: &self.config.password,
            })
            .send()
            .await?;

        let status = resp.status();
        if !status.is_success() {
            return Err(PublishError::Rejected {
                endpoint: "com.atproto.server.createSession",
                status: status.as_u16(),
                body: resp.text().await.unwrap_or_default(),
            });
        }
        Ok(resp.json().await?)
    }
}

#[async_trait]
impl Publisher for BlueskyPublisher {
    async fn publish(&self, post: &PostText) -> Result<PostRef, PublishError> {
        let session = self.create_session().await?;

        let created_at = Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true);
        let request = CreateRecordRequest {
            repo: &session.did,
            collection: "app.bsky.feed.post",
            record: post_record(post, created_at),
        };

        let resp = self
            .client
            .post(self.xrpc_url("com.atproto.repo.createRecord"))
            .bearer_auth(&session.access_jwt)
            .json(&request)
            .send()
            .await?;

        let status = resp.status();
        if !status.is_success() {
            return Err(PublishError::Rejected {
                endpoint: "com.atproto.repo.createRecord",
                status: status.as_u16(),
                body: resp.text().await.unwrap_or_default(),
            });
        }

        let created: CreateRecordResponse = resp.json().await?;
        info!(uri = %created.uri, "post published");
        Ok(PostRef { uri: created.uri })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dfbugs_core::{format_bug_post, BugRecord};

    fn mk_bug(id: &str, summary: &str) -> BugRecord {
        BugRecord {
            id: id.to_string(),
            summary: summary.to_string(),
            status: "new".to_string(),
            category: "General".to_string(),
            resolution: "open".to_string(),
            severity: "minor".to_string(),
            date_submitted: "2020-01-01".to_string(),
        }
    }

    #[test]
    fn post_record_wire_shape_carries_link_facet() {
        let bug = mk_bug("123456", "Magma flows uphill");
        let post = format_bug_post(&bug, "https://tracker.example");
        let record = post_record(&post, "2026-08-23T00:00:00.000Z".to_string());
        let value = serde_json::to_value(&record).expect("serialize");

        assert_eq!(value["$type"], "app.bsky.feed.post");
        assert_eq!(value["createdAt"], "2026-08-23T00:00:00.000Z");
        assert_eq!(
            value["text"],
            "Magma flows uphill\n\nhttps://tracker.example/view.php?id=123456"
        );

        let facet = &value["facets"][0];
        assert_eq!(facet["features"][0]["$type"], "app.bsky.richtext.facet#link");
        assert_eq!(
            facet["features"][0]["uri"],
            "https://tracker.example/view.php?id=123456"
        );

        let start = facet["index"]["byteStart"].as_u64().expect("byteStart") as usize;
        let end = facet["index"]["byteEnd"].as_u64().expect("byteEnd") as usize;
        assert_eq!(
            &post.text()[start..end],
            "https://tracker.example/view.php?id=123456"
        );
    }

    #[test]
    fn facetless_post_omits_the_facets_key() {
        let mut post = PostText::new();
        post.push_text("plain text only");
        let record = post_record(&post, "2026-08-23T00:00:00.000Z".to_string());
        let value = serde_json::to_value(&record).expect("serialize");
        assert!(value.get("facets").is_none());
    }

    #[test]
    fn missing_credentials_error_is_user_actionable() {
        let message = PublishError::MissingCredentials.to_string();
        assert!(message.contains("BLUESKY_HANDLE"));
        assert!(message.contains("BLUESKY_PASSWORD"));
    }
}
