use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::{Client, StatusCode};
use serde::Deserialize;

use super::{classify_status, AccountInfo, AccountLookup, CallSpacer};
use crate::error::PlatformError;
use crate::model::PostKind;

const API: &str = "https://api.twitter.com/2";
const RESET_HEADER: &str = "x-rate-limit-reset";
const USER_FIELDS: &str = "name,username,profile_image_url";

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct TwitterUser {
    pub id: String,
    pub name: String,
    pub username: String,
    #[serde(default)]
    pub profile_image_url: Option<String>,
}

impl TwitterUser {
    pub fn url(&self) -> String {
        format!("https://twitter.com/{}", self.username)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaKind {
    Photo,
    Video,
    Gif,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TweetMedia {
    pub kind: MediaKind,
    pub url: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tweet {
    pub id: u64,
    pub text: String,
    pub created_at: DateTime<Utc>,
    pub kind: PostKind,
    pub sensitive: bool,
    /// Author of the retweeted/replied/quoted tweet.
    pub referenced_author: Option<TwitterUser>,
    pub media: Vec<TweetMedia>,
    /// Preview image of the first embedded link, or of the referenced tweet.
    pub fallback_image: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Timeline {
    pub user: TwitterUser,
    pub tweets: Vec<Tweet>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TimelineQuery {
    pub since_id: Option<u64>,
    pub include_retweets: bool,
    pub include_replies: bool,
}

#[async_trait]
pub trait TwitterApi: Send + Sync {
    async fn recent_posts(
        &self,
        user_id: &str,
        query: TimelineQuery,
    ) -> Result<Timeline, PlatformError>;
}

#[derive(Debug, Deserialize)]
struct ApiError {
    #[serde(default)]
    title: String,
    #[serde(default)]
    detail: String,
}

#[derive(Debug, Deserialize)]
struct UserResponse {
    data: Option<TwitterUser>,
    #[serde(default)]
    errors: Vec<ApiError>,
}

#[derive(Debug, Deserialize)]
struct RawReference {
    #[serde(rename = "type")]
    kind: String,
    id: String,
}

#[derive(Debug, Default, Deserialize)]
struct RawAttachments {
    #[serde(default)]
    media_keys: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct RawUrlImage {
    url: String,
}

#[derive(Debug, Deserialize)]
struct RawUrl {
    #[serde(default)]
    images: Vec<RawUrlImage>,
}

#[derive(Debug, Default, Deserialize)]
struct RawEntities {
    #[serde(default)]
    urls: Vec<RawUrl>,
}

#[derive(Debug, Deserialize)]
struct RawTweet {
    id: String,
    text: String,
    #[serde(default)]
    created_at: Option<DateTime<Utc>>,
    #[serde(default)]
    author_id: Option<String>,
    #[serde(default)]
    possibly_sensitive: bool,
    #[serde(default)]
    referenced_tweets: Vec<RawReference>,
    #[serde(default)]
    attachments: RawAttachments,
    #[serde(default)]
    entities: RawEntities,
}

#[derive(Debug, Deserialize)]
struct RawMedia {
    media_key: String,
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    url: Option<String>,
    #[serde(default)]
    preview_image_url: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct RawIncludes {
    #[serde(default)]
    users: Vec<TwitterUser>,
    #[serde(default)]
    media: Vec<RawMedia>,
    #[serde(default)]
    tweets: Vec<RawTweet>,
}

#[derive(Debug, Deserialize)]
struct TimelineResponse {
    #[serde(default)]
    data: Vec<RawTweet>,
    #[serde(default)]
    includes: RawIncludes,
}

fn first_link_image(entities: &RawEntities) -> Option<String> {
    entities
        .urls
        .iter()
        .flat_map(|u| u.images.iter())
        .map(|i| i.url.clone())
        .next()
}

fn media_for(keys: &[String], media: &HashMap<&str, &RawMedia>) -> Vec<TweetMedia> {
    keys.iter()
        .filter_map(|key| media.get(key.as_str()))
        .map(|m| TweetMedia {
            kind: match m.kind.as_str() {
                "video" => MediaKind::Video,
                "animated_gif" => MediaKind::Gif,
                _ => MediaKind::Photo,
            },
            url: m.url.clone().or_else(|| m.preview_image_url.clone()),
        })
        .collect()
}

impl TimelineResponse {
    fn into_tweets(self) -> Vec<Tweet> {
        let users: HashMap<&str, &TwitterUser> = self
            .includes
            .users
            .iter()
            .map(|u| (u.id.as_str(), u))
            .collect();
        let media: HashMap<&str, &RawMedia> = self
            .includes
            .media
            .iter()
            .map(|m| (m.media_key.as_str(), m))
            .collect();
        let referenced: HashMap<&str, &RawTweet> = self
            .includes
            .tweets
            .iter()
            .map(|t| (t.id.as_str(), t))
            .collect();

        self.data
            .iter()
            .filter_map(|raw| {
                let id = raw.id.parse::<u64>().ok()?;
                let reference = raw.referenced_tweets.first();
                let kind = match reference.map(|r| r.kind.as_str()) {
                    Some("retweeted") => PostKind::Retweet,
                    Some("replied_to") => PostKind::Reply,
                    Some("quoted") => PostKind::Quote,
                    _ => PostKind::Post,
                };
                let reference_tweet = reference.and_then(|r| referenced.get(r.id.as_str()));
                let referenced_author = reference_tweet
                    .and_then(|t| t.author_id.as_deref())
                    .and_then(|a| users.get(a))
                    .map(|u| (*u).clone());

                let fallback_image = first_link_image(&raw.entities).or_else(|| {
                    reference_tweet.and_then(|t| {
                        media_for(&t.attachments.media_keys, &media)
                            .into_iter()
                            .find_map(|m| m.url)
                            .or_else(|| first_link_image(&t.entities))
                    })
                });

                Some(Tweet {
                    id,
                    text: raw.text.clone(),
                    created_at: raw.created_at.unwrap_or_else(Utc::now),
                    kind,
                    sensitive: raw.possibly_sensitive,
                    referenced_author,
                    media: media_for(&raw.attachments.media_keys, &media),
                    fallback_image,
                })
            })
            .collect()
    }
}

fn user_errors_mean_gone(errors: &[ApiError]) -> bool {
    errors
        .iter()
        .any(|e| e.title.contains("Not Found") || e.title.contains("Forbidden"))
}

pub struct TwitterClient {
    client: Client,
    bearer_token: String,
    spacer: CallSpacer,
}

impl TwitterClient {
    pub fn new(bearer_token: String, call_delay: Duration) -> Result<Self, PlatformError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(15))
            .build()?;

        Ok(Self {
            client,
            bearer_token,
            spacer: CallSpacer::new(call_delay),
        })
    }

    async fn get(&self, url: String, query: &[(&str, String)]) -> Result<String, PlatformError> {
        self.spacer.wait().await;

        let response = self
            .client
            .get(url)
            .bearer_auth(&self.bearer_token)
            .query(query)
            .send()
            .await?;

        let status = response.status();
        let error = classify_status(status, response.headers(), RESET_HEADER, Utc::now().timestamp());
        let body = response.text().await?;

        match error {
            None => Ok(body),
            Some(_) if status == StatusCode::BAD_REQUEST && body.contains("since_id") => {
                Err(PlatformError::StaleCursor)
            }
            Some(err) => Err(err),
        }
    }

    async fn user(&self, url: String) -> Result<TwitterUser, PlatformError> {
        let body = self
            .get(url, &[("user.fields", USER_FIELDS.to_string())])
            .await?;
        let parsed: UserResponse = serde_json::from_str(&body)
            .map_err(|e| PlatformError::transient(format!("bad user payload: {}", e)))?;

        match parsed.data {
            Some(user) => Ok(user),
            None if user_errors_mean_gone(&parsed.errors) => Err(PlatformError::NotFound),
            None => Err(PlatformError::transient(
                parsed
                    .errors
                    .first()
                    .map(|e| e.detail.clone())
                    .unwrap_or_else(|| "empty user payload".to_string()),
            )),
        }
    }
}

#[async_trait]
impl TwitterApi for TwitterClient {
    async fn recent_posts(
        &self,
        user_id: &str,
        query: TimelineQuery,
    ) -> Result<Timeline, PlatformError> {
        let user = self.user(format!("{}/users/{}", API, user_id)).await?;

        let mut params = vec![
            ("max_results", "10".to_string()),
            (
                "tweet.fields",
                "created_at,possibly_sensitive,referenced_tweets,entities,attachments,author_id"
                    .to_string(),
            ),
            (
                "expansions",
                "attachments.media_keys,referenced_tweets.id,referenced_tweets.id.author_id"
                    .to_string(),
            ),
            ("media.fields", "url,preview_image_url,type".to_string()),
            ("user.fields", USER_FIELDS.to_string()),
        ];
        if let Some(since_id) = query.since_id {
            params.push(("since_id", since_id.to_string()));
        }
        let mut exclude = Vec::new();
        if !query.include_retweets {
            exclude.push("retweets");
        }
        if !query.include_replies {
            exclude.push("replies");
        }
        if !exclude.is_empty() {
            params.push(("exclude", exclude.join(",")));
        }

        let body = self
            .get(format!("{}/users/{}/tweets", API, user_id), &params)
            .await?;
        let timeline: TimelineResponse = serde_json::from_str(&body)
            .map_err(|e| PlatformError::transient(format!("bad timeline payload: {}", e)))?;

        Ok(Timeline {
            user,
            tweets: timeline.into_tweets(),
        })
    }
}

#[async_trait]
impl AccountLookup for TwitterClient {
    async fn lookup_account(&self, handle: &str) -> Result<AccountInfo, PlatformError> {
        let user = self
            .user(format!("{}/users/by/username/{}", API, handle))
            .await?;
        Ok(AccountInfo {
            external_id: user.id,
            display_name: user.username,
        })
    }
}
