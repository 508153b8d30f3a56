/**
 * user.rs
 *
 * User credentials consumed by the ticket protocol. Loading and persisting
 * these is the profile collaborator's job; the search only reads them.
 */

use std::sync::Mutex;

use crate::matchmaking::OnlinePlayMode;

/// Identity fields sent with a create-ticket request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub uid: String,
    pub play_key: String,
    pub connect_code: String,
}

/// A logged-in user. Carries the primary identity plus the alternate
/// ecosystem identity used for modes routed outside the ranked/unranked
/// queues.
#[derive(Debug, Clone)]
pub struct UserProfile {
    pub identity: Identity,
    pub display_name: String,
    pub alternate: Identity,
}

impl UserProfile {
    /// Identity to put on the wire for a given search mode.
    pub fn identity_for(&self, mode: OnlinePlayMode) -> &Identity {
        match mode {
            OnlinePlayMode::Ranked | OnlinePlayMode::Unranked => &self.identity,
            _ => &self.alternate,
        }
    }
}

/// Source of the current credentials. Implemented by the profile layer;
/// the search treats the contents as opaque.
pub trait CredentialProvider: Send + Sync {
    /// The logged-in user, if any. `None` fails a search with `NotLoggedIn`.
    fn current_user(&self) -> Option<UserProfile>;

    /// Called when the directory server rejects us with a newer version
    /// string (client-is-outdated signal).
    fn note_latest_version(&self, version: &str);
}

/// Fixed in-memory credentials, for the demo binary and tests.
#[derive(Debug, Default)]
pub struct StaticCredentials {
    user: Option<UserProfile>,
    latest_version: Mutex<Option<String>>,
}

impl StaticCredentials {
    pub fn logged_in(user: UserProfile) -> Self {
        Self {
            user: Some(user),
            latest_version: Mutex::new(None),
        }
    }

    pub fn logged_out() -> Self {
        Self::default()
    }

    pub fn latest_version(&self) -> Option<String> {
        self.latest_version.lock().unwrap().clone()
    }
}

impl CredentialProvider for StaticCredentials {
    fn current_user(&self) -> Option<UserProfile> {
        self.user.clone()
    }

    fn note_latest_version(&self, version: &str) {
        *self.latest_version.lock().unwrap() = Some(version.to_string());
    }
}
