//! Users sharing the server, as listed by the plex.tv account API.
//!
//! plex.tv answers these endpoints in XML only. Attributes are mapped with
//! the `@` prefix `quick-xml` uses for them.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use serde::Deserialize;

use tracksync_model::UserId;

/// `GET /api/users`
#[derive(Debug, Default, Deserialize)]
pub struct UsersContainer {
    #[serde(rename = "User", default)]
    pub users: Vec<AccountUser>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AccountUser {
    #[serde(rename = "@id")]
    pub id: String,
    #[serde(rename = "@title", default)]
    pub title: String,
    #[serde(rename = "@username", default)]
    pub username: String,
    #[serde(rename = "Server", default)]
    pub servers: Vec<AccountServer>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AccountServer {
    #[serde(rename = "@machineIdentifier")]
    pub machine_identifier: String,
}

/// `GET /api/servers/{machine}/shared_servers`
#[derive(Debug, Default, Deserialize)]
pub struct SharedServersContainer {
    #[serde(rename = "SharedServer", default)]
    pub shared: Vec<SharedServer>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SharedServer {
    #[serde(rename = "@userID")]
    pub user_id: String,
    #[serde(rename = "@accessToken", default)]
    pub access_token: Option<String>,
}

#[derive(Clone)]
pub struct DiscoveredUser {
    pub name: String,
    pub token: Option<String>,
}

impl std::fmt::Debug for DiscoveredUser {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DiscoveredUser")
            .field("name", &self.name)
            .field("has_token", &self.token.is_some())
            .finish()
    }
}

/// Users with access to one server and the server-scoped tokens plex.tv
/// issued for them.
#[derive(Debug, Clone)]
pub struct UserDirectory {
    users: HashMap<UserId, DiscoveredUser>,
    fetched_at: Instant,
}

impl UserDirectory {
    /// Keeps the users whose shares include `machine_identifier`.
    pub fn from_listings(
        machine_identifier: &str,
        users: UsersContainer,
        shared: SharedServersContainer,
    ) -> Self {
        let tokens: HashMap<String, String> = shared
            .shared
            .into_iter()
            .filter_map(|share| {
                let token = share.access_token.filter(|token| !token.trim().is_empty())?;
                Some((share.user_id.trim().to_string(), token))
            })
            .collect();

        let users = users
            .users
            .into_iter()
            .filter(|user| {
                user.servers
                    .iter()
                    .any(|server| server.machine_identifier == machine_identifier)
            })
            .map(|user| {
                let id = user.id.trim().to_string();
                let name = if user.title.is_empty() {
                    user.username
                } else {
                    user.title
                };
                let token = tokens.get(&id).cloned();
                (UserId::new(id), DiscoveredUser { name, token })
            })
            .collect();

        Self {
            users,
            fetched_at: Instant::now(),
        }
    }

    pub fn is_stale(&self, max_age: Duration) -> bool {
        self.fetched_at.elapsed() >= max_age
    }

    pub fn len(&self) -> usize {
        self.users.len()
    }

    pub fn is_empty(&self) -> bool {
        self.users.is_empty()
    }

    pub fn contains(&self, user: &UserId) -> bool {
        self.users.contains_key(user)
    }

    pub fn token(&self, user: &UserId) -> Option<&str> {
        self.users.get(user)?.token.as_deref()
    }

    pub fn names(&self) -> HashMap<UserId, String> {
        self.users
            .iter()
            .filter(|(_, user)| !user.name.is_empty())
            .map(|(id, user)| (id.clone(), user.name.clone()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const USERS: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<MediaContainer friendlyName="myPlex" identifier="com.plexapp.plugins.myplex" size="3">
  <User id="42" title="Sam" username="sam" home="1">
    <Server id="1" serverId="2" machineIdentifier="abc123" name="Home" owned="1"/>
  </User>
  <User id="7" title="" username="kid" home="1">
    <Server id="3" serverId="2" machineIdentifier="abc123" name="Home" owned="1"/>
  </User>
  <User id="99" title="Elsewhere" username="other">
    <Server id="4" serverId="5" machineIdentifier="zzz999" name="Cabin" owned="0"/>
  </User>
</MediaContainer>"#;

    const SHARED: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<MediaContainer friendlyName="myPlex" machineIdentifier="abc123" size="2">
  <SharedServer id="11" username="sam" userID="42" accessToken="sam-token" name="Home">
    <Section id="1" key="2" title="TV Shows" type="show" shared="1"/>
  </SharedServer>
  <SharedServer id="12" username="kid" userID="7" accessToken="" name="Home"/>
</MediaContainer>"#;

    fn directory() -> UserDirectory {
        let users: UsersContainer = quick_xml::de::from_str(USERS).unwrap();
        let shared: SharedServersContainer = quick_xml::de::from_str(SHARED).unwrap();
        UserDirectory::from_listings("abc123", users, shared)
    }

    #[test]
    fn only_users_of_this_server_are_kept() {
        let directory = directory();
        assert_eq!(directory.len(), 2);
        assert!(directory.contains(&UserId::new("42")));
        assert!(!directory.contains(&UserId::new("99")));
    }

    #[test]
    fn tokens_come_from_the_server_shares() {
        let directory = directory();
        assert_eq!(directory.token(&UserId::new("42")), Some("sam-token"));
        assert_eq!(directory.token(&UserId::new("7")), None);
    }

    #[test]
    fn names_fall_back_to_the_username() {
        let names = directory().names();
        assert_eq!(names[&UserId::new("42")], "Sam");
        assert_eq!(names[&UserId::new("7")], "kid");
    }

    #[test]
    fn fresh_directories_are_not_stale() {
        let directory = directory();
        assert!(!directory.is_stale(Duration::from_secs(3600)));
        assert!(directory.is_stale(Duration::ZERO));
    }
}
