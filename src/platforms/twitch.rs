use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::Client;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use super::{classify_status, AccountInfo, AccountLookup, CallSpacer};
use crate::config::TwitchCredentials;
use crate::error::PlatformError;

const HELIX: &str = "https://api.twitch.tv/helix";
const TOKEN_URL: &str = "https://id.twitch.tv/oauth2/token";
const RESET_HEADER: &str = "ratelimit-reset";
/// Helix accepts at most 100 ids per request.
const BATCH_SIZE: usize = 100;

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct TwitchStream {
    pub id: String,
    pub user_id: String,
    pub user_login: String,
    pub user_name: String,
    #[serde(default)]
    pub game_id: String,
    #[serde(default)]
    pub game_name: String,
    pub title: String,
    pub viewer_count: u64,
    pub started_at: DateTime<Utc>,
    #[serde(default)]
    pub thumbnail_url: String,
}

impl TwitchStream {
    pub fn thumbnail(&self, width: u32, height: u32) -> String {
        self.thumbnail_url
            .replace("{width}", &width.to_string())
            .replace("{height}", &height.to_string())
    }

    pub fn box_art(&self) -> Option<String> {
        (!self.game_id.is_empty()).then(|| {
            format!(
                "https://static-cdn.jtvnw.net/ttv-boxart/{}-144x192.jpg",
                self.game_id
            )
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct TwitchUser {
    pub id: String,
    pub login: String,
    pub display_name: String,
    #[serde(default)]
    pub profile_image_url: String,
}

impl TwitchUser {
    pub fn url(&self) -> String {
        format!("https://twitch.tv/{}", self.login)
    }
}

#[derive(Debug, Deserialize)]
struct HelixPage<T> {
    data: Vec<T>,
}

#[derive(Debug, Deserialize)]
struct AppToken {
    access_token: String,
}

/// Per-id result of a bulk stream lookup; `Ok(None)` means offline.
pub type StreamBatch = HashMap<String, Result<Option<TwitchStream>, PlatformError>>;

#[async_trait]
pub trait TwitchApi: Send + Sync {
    /// Errors at this level (rate limit, bad credentials) abort the whole batch.
    async fn fetch_streams(&self, ids: &[String]) -> Result<StreamBatch, PlatformError>;
    /// Looks up many users at once. Ids Helix does not know are absent from the map.
    async fn fetch_users(&self, ids: &[String]) -> Result<HashMap<String, TwitchUser>, PlatformError>;
    async fn get_user(&self, id: &str) -> Result<TwitchUser, PlatformError>;
}

pub struct TwitchClient {
    client: Client,
    credentials: TwitchCredentials,
    token: RwLock<Option<String>>,
    spacer: CallSpacer,
}

impl TwitchClient {
    pub fn new(credentials: TwitchCredentials, call_delay: Duration) -> Result<Self, PlatformError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(15))
            .build()?;

        Ok(Self {
            client,
            credentials,
            token: RwLock::new(None),
            spacer: CallSpacer::new(call_delay),
        })
    }

    async fn refresh_token(&self) -> Result<String, PlatformError> {
        let response = self
            .client
            .post(TOKEN_URL)
            .query(&[
                ("client_id", self.credentials.client_id.as_str()),
                ("client_secret", self.credentials.client_secret.as_str()),
                ("grant_type", "client_credentials"),
            ])
            .send()
            .await?;

        match response.status() {
            s if s.is_success() => {}
            s if s.is_client_error() => return Err(PlatformError::Unauthorized),
            s => return Err(PlatformError::transient(format!("token endpoint returned {}", s))),
        }

        let token = response.json::<AppToken>().await?.access_token;
        info!("[TWITCH] Obtained new app access token");
        *self.token.write().await = Some(token.clone());
        Ok(token)
    }

    async fn token(&self) -> Result<String, PlatformError> {
        if let Some(token) = self.token.read().await.clone() {
            return Ok(token);
        }
        self.refresh_token().await
    }

    async fn helix<T: DeserializeOwned>(
        &self,
        path: &str,
        query: &[(&str, String)],
    ) -> Result<T, PlatformError> {
        let mut retried = false;
        loop {
            let token = self.token().await?;
            self.spacer.wait().await;

            let response = self
                .client
                .get(format!("{}{}", HELIX, path))
                .header("Client-Id", &self.credentials.client_id)
                .bearer_auth(&token)
                .query(query)
                .send()
                .await?;

            let status = response.status();
            match classify_status(status, response.headers(), RESET_HEADER, Utc::now().timestamp()) {
                None => return Ok(response.json::<T>().await?),
                Some(PlatformError::Unauthorized) if !retried => {
                    debug!("[TWITCH] Token rejected, refreshing");
                    *self.token.write().await = None;
                    retried = true;
                }
                Some(err) => return Err(err),
            }
        }
    }

    async fn users_by(&self, key: &str, value: &str) -> Result<TwitchUser, PlatformError> {
        let page: HelixPage<TwitchUser> = self
            .helix("/users", &[(key, value.to_string())])
            .await?;
        page.data.into_iter().next().ok_or(PlatformError::NotFound)
    }
}

#[async_trait]
impl TwitchApi for TwitchClient {
    async fn fetch_streams(&self, ids: &[String]) -> Result<StreamBatch, PlatformError> {
        let mut batch = StreamBatch::with_capacity(ids.len());

        for chunk in ids.chunks(BATCH_SIZE) {
            let mut query: Vec<(&str, String)> =
                chunk.iter().map(|id| ("user_id", id.clone())).collect();
            query.push(("first", BATCH_SIZE.to_string()));

            match self.helix::<HelixPage<TwitchStream>>("/streams", &query).await {
                Ok(page) => {
                    let mut live: HashMap<String, TwitchStream> = page
                        .data
                        .into_iter()
                        .map(|stream| (stream.user_id.clone(), stream))
                        .collect();
                    for id in chunk {
                        batch.insert(id.clone(), Ok(live.remove(id)));
                    }
                }
                Err(PlatformError::Transient(msg)) => {
                    warn!("[TWITCH] Stream batch failed: {}", msg);
                    for id in chunk {
                        batch.insert(id.clone(), Err(PlatformError::Transient(msg.clone())));
                    }
                }
                Err(e) => return Err(e),
            }
        }

        Ok(batch)
    }

    async fn fetch_users(&self, ids: &[String]) -> Result<HashMap<String, TwitchUser>, PlatformError> {
        let mut users = HashMap::with_capacity(ids.len());
        for chunk in ids.chunks(BATCH_SIZE) {
            let query: Vec<(&str, String)> = chunk.iter().map(|id| ("id", id.clone())).collect();
            let page: HelixPage<TwitchUser> = self.helix("/users", &query).await?;
            users.extend(page.data.into_iter().map(|user| (user.id.clone(), user)));
        }
        Ok(users)
    }

    async fn get_user(&self, id: &str) -> Result<TwitchUser, PlatformError> {
        self.users_by("id", id).await
    }
}

#[async_trait]
impl AccountLookup for TwitchClient {
    async fn lookup_account(&self, handle: &str) -> Result<AccountInfo, PlatformError> {
        let user = self.users_by("login", &handle.to_lowercase()).await?;
        Ok(AccountInfo {
            external_id: user.id,
            display_name: user.display_name,
        })
    }
}
