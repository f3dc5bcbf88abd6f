//! Identity module
//!
//! Registration, credential verification, and bearer issuance for the
//! scoreboard core. The core consumes this through three calls:
//! `register`, `authenticate`, and `verify_bearer`.
//!
//! Users live in MongoDB with unique indexes on identity, username, and
//! email; an in-process projection serves lookups without I/O. In
//! memory-only mode (dev, tests) the maps are the whole story.

use dashmap::DashMap;
use serde::Serialize;
use std::time::Duration;
use tracing::info;
use uuid::Uuid;

use crate::auth::{hash_password, verify_password, JwtValidator};
use crate::db::schemas::{UserDoc, USER_COLLECTION};
use crate::db::{is_duplicate_key, MongoClient, MongoCollection};
use crate::error::{PodiumError, Result};

/// Authenticated caller extracted from a bearer token
#[derive(Debug, Clone)]
pub struct Principal {
    pub identity: String,
    pub username: String,
}

/// User shape returned by the auth endpoints
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PublicUser {
    pub identity: String,
    pub username: String,
    pub email: String,
}

#[derive(Debug, Clone)]
struct StoredUser {
    identity: String,
    username: String,
    email: String,
    password_hash: String,
}

/// Registration, login, and bearer verification
pub struct IdentityService {
    users: DashMap<String, StoredUser>,
    email_index: DashMap<String, String>,
    username_index: DashMap<String, String>,
    collection: Option<MongoCollection<UserDoc>>,
    jwt: JwtValidator,
    timeout: Duration,
}

impl IdentityService {
    /// Memory-only service (dev mode and tests)
    pub fn memory_only(jwt: JwtValidator, timeout: Duration) -> Self {
        Self {
            users: DashMap::new(),
            email_index: DashMap::new(),
            username_index: DashMap::new(),
            collection: None,
            jwt,
            timeout,
        }
    }

    /// MongoDB-backed service; loads the user projection at startup
    pub async fn with_mongo(
        client: MongoClient,
        jwt: JwtValidator,
        timeout: Duration,
    ) -> Result<Self> {
        let collection = client.collection::<UserDoc>(USER_COLLECTION).await?;
        let docs = collection.find_all().await?;

        let service = Self {
            users: DashMap::new(),
            email_index: DashMap::new(),
            username_index: DashMap::new(),
            collection: Some(collection),
            jwt,
            timeout,
        };

        for doc in docs {
            service.index_user(StoredUser {
                identity: doc.identity,
                username: doc.username,
                email: doc.email,
                password_hash: doc.password_hash,
            });
        }

        info!(users = service.users.len(), "Identity service loaded");
        Ok(service)
    }

    fn index_user(&self, user: StoredUser) {
        self.email_index
            .insert(user.email.clone(), user.identity.clone());
        self.username_index
            .insert(user.username.clone(), user.identity.clone());
        self.users.insert(user.identity.clone(), user);
    }

    /// Create an identity with credentials; returns a bearer token and
    /// the public user shape. The caller provisions the zero ScoreRecord.
    pub async fn register(
        &self,
        username: &str,
        email: &str,
        password: &str,
    ) -> Result<(String, PublicUser)> {
        if username.is_empty() || email.is_empty() || password.is_empty() {
            return Err(PodiumError::MissingFields("username, email, password".into()));
        }

        let identity = Uuid::new_v4().to_string();

        // Atomic gates against concurrent registration of the same name
        use dashmap::mapref::entry::Entry;
        match self.username_index.entry(username.to_string()) {
            Entry::Occupied(_) => {
                return Err(PodiumError::DuplicateIdentity(format!(
                    "username '{username}' is taken"
                )))
            }
            Entry::Vacant(slot) => {
                slot.insert(identity.clone());
            }
        }
        match self.email_index.entry(email.to_string()) {
            Entry::Occupied(_) => {
                self.username_index.remove(username);
                return Err(PodiumError::DuplicateIdentity(format!(
                    "email '{email}' is already registered"
                )));
            }
            Entry::Vacant(slot) => {
                slot.insert(identity.clone());
            }
        }

        let password_hash = hash_password(password)?;

        if let Some(collection) = &self.collection {
            let doc = UserDoc {
                identity: identity.clone(),
                username: username.to_string(),
                email: email.to_string(),
                password_hash: password_hash.clone(),
                created_at: chrono::Utc::now().timestamp_millis(),
            };
            let insert = async { collection.inner().insert_one(&doc).await };
            let result = tokio::time::timeout(self.timeout, insert).await;
            let persisted = match result {
                Ok(Ok(_)) => Ok(()),
                Ok(Err(e)) if is_duplicate_key(&e) => Err(PodiumError::DuplicateIdentity(
                    "username or email is already registered".into(),
                )),
                Ok(Err(e)) => Err(PodiumError::from(e)),
                Err(_) => Err(PodiumError::BackendUnavailable(
                    "store deadline exceeded".into(),
                )),
            };
            if let Err(e) = persisted {
                self.username_index.remove(username);
                self.email_index.remove(email);
                return Err(e);
            }
        }

        self.users.insert(
            identity.clone(),
            StoredUser {
                identity: identity.clone(),
                username: username.to_string(),
                email: email.to_string(),
                password_hash,
            },
        );

        let token = self.jwt.generate_token(&identity, username)?;
        info!(identity = %identity, username = username, "User registered");

        Ok((
            token,
            PublicUser {
                identity,
                username: username.to_string(),
                email: email.to_string(),
            },
        ))
    }

    /// Verify credentials and issue a bearer token
    pub async fn authenticate(&self, email: &str, password: &str) -> Result<(String, PublicUser)> {
        if email.is_empty() || password.is_empty() {
            return Err(PodiumError::MissingFields("email, password".into()));
        }

        let user = self
            .email_index
            .get(email)
            .and_then(|id| self.users.get(id.value()).map(|u| u.value().clone()))
            .ok_or_else(|| PodiumError::InvalidToken("invalid credentials".into()))?;

        if !verify_password(password, &user.password_hash)? {
            return Err(PodiumError::InvalidToken("invalid credentials".into()));
        }

        let token = self.jwt.generate_token(&user.identity, &user.username)?;
        Ok((
            token,
            PublicUser {
                identity: user.identity,
                username: user.username,
                email: user.email,
            },
        ))
    }

    /// Verify a bearer token and resolve the current principal
    pub fn verify_bearer(&self, token: &str) -> Result<Principal> {
        let claims = self.jwt.verify_token(token)?;
        let user = self
            .users
            .get(&claims.identity)
            .ok_or_else(|| PodiumError::InvalidToken("unknown identity".into()))?;
        Ok(Principal {
            identity: user.identity.clone(),
            username: user.username.clone(),
        })
    }

    /// Username for an identity, if it exists
    pub fn username_of(&self, identity: &str) -> Option<String> {
        self.users.get(identity).map(|u| u.username.clone())
    }
}
