//! Turning track identifiers into playable URLs.
//!
//! Sources live behind signed, expiring URLs. Resolution happens before a
//! session begins and again whenever the controller asks for a fresh source
//! (the apnea track at the start of every apnea).

use std::collections::HashMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use url::Url;

use super::track::TrackId;
use crate::error::AudioError;

/// Where a track's audio lives on the remote side.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceRef {
    pub slug: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
}

impl SourceRef {
    pub fn new(slug: impl Into<String>) -> Self {
        Self {
            slug: slug.into(),
            token: None,
        }
    }

    pub fn with_token(slug: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            slug: slug.into(),
            token: Some(token.into()),
        }
    }
}

/// The tracks to resolve for one session, in resolution order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SourcePlan {
    pub entries: Vec<(TrackId, SourceRef)>,
}

impl SourcePlan {
    pub fn get(&self, track: TrackId) -> Option<&SourceRef> {
        self.entries
            .iter()
            .find(|(t, _)| *t == track)
            .map(|(_, source)| source)
    }
}

/// Playable URLs keyed by track. Missing tracks failed to resolve.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResolvedSources {
    urls: HashMap<TrackId, String>,
}

impl ResolvedSources {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, track: TrackId, url: impl Into<String>) {
        self.urls.insert(track, url.into());
    }

    pub fn with(mut self, track: TrackId, url: impl Into<String>) -> Self {
        self.insert(track, url);
        self
    }

    pub fn get(&self, track: TrackId) -> Option<&str> {
        self.urls.get(&track).map(String::as_str)
    }

    pub fn contains(&self, track: TrackId) -> bool {
        self.urls.contains_key(&track)
    }

    pub fn len(&self) -> usize {
        self.urls.len()
    }

    pub fn is_empty(&self) -> bool {
        self.urls.is_empty()
    }
}

#[async_trait]
pub trait AudioSourceResolver: Send + Sync {
    async fn resolve(&self, source: &SourceRef) -> Result<String, AudioError>;
}

/// Resolve every entry of `plan`, tolerating failures.
///
/// A missing apnea track degrades the session; ambient and secondary tracks
/// are optional decoration and fail quietly.
pub async fn resolve_all(resolver: &dyn AudioSourceResolver, plan: &SourcePlan) -> ResolvedSources {
    let mut resolved = ResolvedSources::new();
    for (track, source) in &plan.entries {
        match resolver.resolve(source).await {
            Ok(url) => resolved.insert(*track, url),
            Err(e) => match track {
                TrackId::ApneaCue => {
                    tracing::warn!(slug = %source.slug, error = %e, "apnea track unavailable")
                }
                _ => tracing::debug!(%track, slug = %source.slug, error = %e, "track unavailable"),
            },
        }
    }
    resolved
}

#[derive(Debug, Deserialize)]
struct SignedUrlResponse {
    #[serde(default)]
    url: Option<String>,
}

/// Resolves sources through `GET {base}/api/audio?slug=..&token=..`.
#[derive(Debug, Clone)]
pub struct HttpAudioResolver {
    client: reqwest::Client,
    base: Url,
}

impl HttpAudioResolver {
    pub fn new(client: reqwest::Client, base: Url) -> Self {
        Self { client, base }
    }

    fn endpoint(&self, source: &SourceRef) -> Result<Url, url::ParseError> {
        let mut url = self.base.join("api/audio")?;
        {
            let mut query = url.query_pairs_mut();
            query.append_pair("slug", &source.slug);
            if let Some(token) = source.token.as_deref().filter(|t| !t.is_empty()) {
                query.append_pair("token", token);
            }
        }
        Ok(url)
    }
}

#[async_trait]
impl AudioSourceResolver for HttpAudioResolver {
    async fn resolve(&self, source: &SourceRef) -> Result<String, AudioError> {
        let unavailable = |message: String| AudioError::Unavailable {
            slug: source.slug.clone(),
            message,
        };
        let url = self.endpoint(source).map_err(|e| unavailable(e.to_string()))?;
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| unavailable(e.to_string()))?;
        if !response.status().is_success() {
            return Err(unavailable(format!("status {}", response.status().as_u16())));
        }
        let body: SignedUrlResponse = response
            .json()
            .await
            .map_err(|e| unavailable(e.to_string()))?;
        body.url
            .filter(|u| !u.is_empty())
            .ok_or_else(|| unavailable("empty url".into()))
    }
}

/// Serves a fixed slug -> URL table. Anything else is unavailable.
#[derive(Debug, Clone, Default)]
pub struct StaticResolver {
    urls: HashMap<String, String>,
}

impl StaticResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, slug: impl Into<String>, url: impl Into<String>) -> Self {
        self.urls.insert(slug.into(), url.into());
        self
    }
}

#[async_trait]
impl AudioSourceResolver for StaticResolver {
    async fn resolve(&self, source: &SourceRef) -> Result<String, AudioError> {
        self.urls
            .get(&source.slug)
            .cloned()
            .ok_or_else(|| AudioError::Unavailable {
                slug: source.slug.clone(),
                message: "not configured".into(),
            })
    }
}
