use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::{StatusCode, header};
use serde::de::DeserializeOwned;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use url::Url;

use tracksync_core::{
    EpisodeListing, HistoryEntry, LibraryListing, MediaServerClient, Result, SeasonListing,
    SelectedTracks, ShowListing, SyncError,
};
use tracksync_model::{EpisodeId, LibraryId, SeasonId, ShowId, TrackId, UserId};

use super::accounts::{SharedServersContainer, UserDirectory, UsersContainer};
use super::payloads::{
    Envelope, IdentityContainer, MetadataContainer, MetadataItem, SectionDirectory,
    SectionsContainer,
};
use crate::infra::config::{PlexConfig, mask_secret};

const TOKEN_HEADER: &str = "x-plex-token";
const CLIENT_ID_HEADER: &str = "x-plex-client-identifier";
const PRODUCT_HEADER: &str = "x-plex-product";
const CLIENT_ID: &str = "tracksync";

/// Plex Media Server over its JSON HTTP API.
///
/// Library listings use the owner token. Selections are per account on Plex,
/// so reads and writes for a user go out with that user's token: a token
/// from the configuration when one is set, otherwise the one plex.tv issued
/// for the user's share of this server.
pub struct PlexClient {
    http: reqwest::Client,
    base: Url,
    owner_id: UserId,
    owner_token: String,
    user_tokens: HashMap<UserId, String>,
    accounts: Option<Accounts>,
}

/// plex.tv user discovery and its cached result.
struct Accounts {
    base: Url,
    max_age: Duration,
    directory: Mutex<Option<UserDirectory>>,
}

impl fmt::Debug for PlexClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PlexClient")
            .field("base", &self.base.as_str())
            .field("owner_id", &self.owner_id)
            .field("owner_token", &mask_secret(&self.owner_token))
            .field("users", &self.user_tokens.len())
            .field(
                "accounts",
                &self.accounts.as_ref().map(|accounts| accounts.base.as_str()),
            )
            .finish()
    }
}

impl PlexClient {
    pub fn new(config: &PlexConfig) -> Result<Self> {
        let client = Self::from_parts(
            config.url.clone(),
            config.owner_id.clone(),
            config.token.clone(),
            config.user_tokens(),
            config.request_timeout,
        )?;
        Ok(if config.discover_users {
            client.with_user_discovery(config.accounts_url.clone(), config.users_refresh)
        } else {
            client
        })
    }

    pub fn from_parts(
        base: Url,
        owner_id: UserId,
        owner_token: String,
        user_tokens: HashMap<UserId, String>,
        timeout: Duration,
    ) -> Result<Self> {
        let mut headers = header::HeaderMap::new();
        headers.insert(header::ACCEPT, header::HeaderValue::from_static("application/json"));
        headers.insert(CLIENT_ID_HEADER, header::HeaderValue::from_static(CLIENT_ID));
        headers.insert(PRODUCT_HEADER, header::HeaderValue::from_static(CLIENT_ID));
        let http = reqwest::Client::builder()
            .default_headers(headers)
            .timeout(timeout)
            .build()
            .map_err(|err| SyncError::Configuration(format!("failed to build HTTP client: {err}")))?;
        Ok(Self {
            http,
            base,
            owner_id,
            owner_token,
            user_tokens,
            accounts: None,
        })
    }

    /// Resolves users without a configured token through the plex.tv
    /// account API at `base`. The user list is reused for `max_age`.
    pub fn with_user_discovery(mut self, base: Url, max_age: Duration) -> Self {
        self.accounts = Some(Accounts {
            base,
            max_age,
            directory: Mutex::new(None),
        });
        self
    }

    pub fn owner_id(&self) -> &UserId {
        &self.owner_id
    }

    /// Cheap reachability and token check.
    pub async fn identity(&self) -> Result<IdentityContainer> {
        let envelope: Envelope<IdentityContainer> =
            self.get_json("/identity", &self.owner_token, &[]).await?;
        Ok(envelope.container)
    }

    /// Display names of the users sharing this server, loading the user
    /// list when needed. Empty when discovery is off or plex.tv fails.
    pub async fn discovered_names(&self) -> HashMap<UserId, String> {
        let Some(accounts) = &self.accounts else {
            return HashMap::new();
        };
        let mut directory = accounts.directory.lock().await;
        if let Err(err) = self.refresh_directory(accounts, &mut directory).await {
            warn!(target: "tracksync::plex", error = %err, "user discovery failed");
        }
        directory
            .as_ref()
            .map(UserDirectory::names)
            .unwrap_or_default()
    }

    async fn token_for(&self, user: &UserId) -> Result<String> {
        if *user == self.owner_id {
            return Ok(self.owner_token.clone());
        }
        if let Some(token) = self.user_tokens.get(user) {
            return Ok(token.clone());
        }
        let Some(accounts) = &self.accounts else {
            return Err(SyncError::UnknownUser(user.to_string()));
        };

        let mut directory = accounts.directory.lock().await;
        if let Err(err) = self.refresh_directory(accounts, &mut directory).await {
            if directory.is_none() {
                return Err(err);
            }
            warn!(target: "tracksync::plex", error = %err, "user discovery failed, keeping the previous user list");
        }
        directory
            .as_ref()
            .and_then(|directory| directory.token(user))
            .map(str::to_string)
            .ok_or_else(|| SyncError::UnknownUser(user.to_string()))
    }

    /// Reloads the user list when it is missing or older than its max age.
    async fn refresh_directory(
        &self,
        accounts: &Accounts,
        directory: &mut Option<UserDirectory>,
    ) -> Result<()> {
        if directory
            .as_ref()
            .is_some_and(|current| !current.is_stale(accounts.max_age))
        {
            return Ok(());
        }

        let identity = self.identity().await?;
        let users: UsersContainer = self.get_xml(&accounts.base, "/api/users").await?;
        let shared_path = format!(
            "/api/servers/{}/shared_servers",
            identity.machine_identifier
        );
        let shared: SharedServersContainer = self.get_xml(&accounts.base, &shared_path).await?;
        let fresh = UserDirectory::from_listings(&identity.machine_identifier, users, shared);
        info!(target: "tracksync::plex", users = fresh.len(), "Plex users discovered");
        *directory = Some(fresh);
        Ok(())
    }

    fn url(&self, path: &str) -> Result<Url> {
        join(&self.base, path)
    }

    async fn get_xml<T: DeserializeOwned>(&self, base: &Url, path: &str) -> Result<T> {
        let response = self
            .http
            .get(join(base, path)?)
            .header(header::ACCEPT, "application/xml")
            .header(TOKEN_HEADER, &self.owner_token)
            .send()
            .await
            .map_err(|err| transport_error(path, err))?;
        let status = response.status();
        if !status.is_success() {
            return Err(status_error(path, status));
        }
        let body = response
            .text()
            .await
            .map_err(|err| transport_error(path, err))?;
        quick_xml::de::from_str(&body)
            .map_err(|err| SyncError::Transient(format!("{path}: unreadable response: {err}")))
    }

    async fn get_json<T: DeserializeOwned>(
        &self,
        path: &str,
        token: &str,
        query: &[(&str, String)],
    ) -> Result<T> {
        let response = self
            .http
            .get(self.url(path)?)
            .header(TOKEN_HEADER, token)
            .query(query)
            .send()
            .await
            .map_err(|err| transport_error(path, err))?;
        let status = response.status();
        if !status.is_success() {
            return Err(status_error(path, status));
        }
        let body = response
            .bytes()
            .await
            .map_err(|err| transport_error(path, err))?;
        Ok(serde_json::from_slice(&body)?)
    }

    async fn put(&self, path: &str, token: &str, query: &[(&str, String)]) -> Result<()> {
        let response = self
            .http
            .put(self.url(path)?)
            .header(TOKEN_HEADER, token)
            .query(query)
            .send()
            .await
            .map_err(|err| transport_error(path, err))?;
        let status = response.status();
        if !status.is_success() {
            return Err(status_error(path, status));
        }
        Ok(())
    }

    async fn metadata(&self, path: &str, token: &str) -> Result<Vec<MetadataItem>> {
        let envelope: Envelope<MetadataContainer> = self.get_json(path, token, &[]).await?;
        Ok(envelope.container.metadata)
    }

    async fn episode_detail(&self, episode: &EpisodeId, token: &str) -> Result<MetadataItem> {
        let path = format!("/library/metadata/{episode}");
        self.metadata(&path, token)
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| SyncError::NotFound(format!("episode {episode}")))
    }
}

#[async_trait]
impl MediaServerClient for PlexClient {
    async fn list_libraries(&self) -> Result<Vec<LibraryListing>> {
        let envelope: Envelope<SectionsContainer> = self
            .get_json("/library/sections", &self.owner_token, &[])
            .await?;
        Ok(envelope
            .container
            .directories
            .into_iter()
            .filter_map(SectionDirectory::into_listing)
            .collect())
    }

    async fn list_shows(&self, library: &LibraryId) -> Result<Vec<ShowListing>> {
        let path = format!("/library/sections/{library}/all");
        let envelope: Envelope<MetadataContainer> = self
            .get_json(&path, &self.owner_token, &[("type", "2".to_string())])
            .await?;
        Ok(envelope
            .container
            .metadata
            .into_iter()
            .filter_map(MetadataItem::into_show)
            .collect())
    }

    async fn list_seasons(&self, show: &ShowId) -> Result<Vec<SeasonListing>> {
        let path = format!("/library/metadata/{show}/children");
        Ok(self
            .metadata(&path, &self.owner_token)
            .await?
            .into_iter()
            .filter_map(MetadataItem::into_season)
            .collect())
    }

    async fn list_episodes(&self, season: &SeasonId) -> Result<Vec<EpisodeListing>> {
        let path = format!("/library/metadata/{season}/children");
        Ok(self
            .metadata(&path, &self.owner_token)
            .await?
            .into_iter()
            .filter_map(MetadataItem::into_episode)
            .collect())
    }

    async fn get_track_selection(
        &self,
        episode: &EpisodeId,
        user: &UserId,
    ) -> Result<SelectedTracks> {
        let token = self.token_for(user).await?;
        let detail = self.episode_detail(episode, &token).await?;
        Ok(detail.selected_tracks())
    }

    async fn set_track_selection(
        &self,
        episode: &EpisodeId,
        user: &UserId,
        audio: &TrackId,
        subtitle: Option<&TrackId>,
    ) -> Result<()> {
        let token = self.token_for(user).await?;
        let detail = self.episode_detail(episode, &token).await?;

        let mut parts = detail.parts().peekable();
        if parts.peek().is_none() {
            return Err(SyncError::TrackUnavailable(format!(
                "episode {episode} has no media parts"
            )));
        }
        let mut updates = Vec::new();
        for part in parts {
            if let Some(streams) = part.plan(audio, subtitle)? {
                updates.push((part.id.to_string(), streams));
            }
        }
        if updates.is_empty() {
            debug!(target: "tracksync::plex", episode = %episode, "streams already selected");
        }

        for (part, streams) in updates {
            let path = format!("/library/parts/{part}");
            self.put(
                &path,
                &token,
                &[
                    ("audioStreamID", streams.audio.to_string()),
                    ("subtitleStreamID", streams.subtitle.to_string()),
                    ("allParts", "1".to_string()),
                ],
            )
            .await?;
            debug!(
                target: "tracksync::plex",
                episode = %episode,
                part = %part,
                audio_stream = streams.audio,
                subtitle_stream = streams.subtitle,
                "part streams updated"
            );
        }
        Ok(())
    }

    async fn history_since(&self, since: DateTime<Utc>) -> Result<Vec<HistoryEntry>> {
        let envelope: Envelope<MetadataContainer> = self
            .get_json(
                "/status/sessions/history/all",
                &self.owner_token,
                &[
                    ("sort", "viewedAt:desc".to_string()),
                    ("viewedAt>", since.timestamp().to_string()),
                ],
            )
            .await?;
        Ok(envelope
            .container
            .metadata
            .into_iter()
            .filter_map(MetadataItem::into_history_entry)
            .filter(|entry| entry.viewed_at >= since)
            .collect())
    }
}

fn join(base: &Url, path: &str) -> Result<Url> {
    let joined = format!("{}{}", base.as_str().trim_end_matches('/'), path);
    Url::parse(&joined)
        .map_err(|err| SyncError::Configuration(format!("invalid Plex URL {joined}: {err}")))
}

fn transport_error(path: &str, err: reqwest::Error) -> SyncError {
    SyncError::Transient(format!("{path}: {err}"))
}

fn status_error(path: &str, status: StatusCode) -> SyncError {
    match status {
        StatusCode::NOT_FOUND => SyncError::NotFound(path.to_string()),
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
            warn!(target: "tracksync::plex", path, %status, "Plex rejected the token");
            SyncError::Configuration(format!("Plex rejected the token for {path} ({status})"))
        }
        StatusCode::REQUEST_TIMEOUT | StatusCode::TOO_MANY_REQUESTS => {
            SyncError::Transient(format!("{path}: {status}"))
        }
        status if status.is_server_error() => SyncError::Transient(format!("{path}: {status}")),
        status => SyncError::Configuration(format!("unexpected status {status} for {path}")),
    }
}
