//! User document schema
//!
//! Stores credentials and the identity → username mapping.

use bson::{doc, Document};
use mongodb::options::IndexOptions;
use serde::{Deserialize, Serialize};

use crate::db::mongo::IntoIndexes;

/// Collection name for users
pub const USER_COLLECTION: &str = "users";

/// User document stored in MongoDB
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct UserDoc {
    /// Opaque identity, globally unique
    pub identity: String,

    /// Display username, unique
    pub username: String,

    /// Email address, unique
    pub email: String,

    /// Argon2 password hash
    pub password_hash: String,

    /// Creation time (Unix milliseconds)
    pub created_at: i64,
}

impl IntoIndexes for UserDoc {
    fn into_indices() -> Vec<(Document, Option<IndexOptions>)> {
        vec![
            (
                doc! { "identity": 1 },
                Some(
                    IndexOptions::builder()
                        .unique(true)
                        .name("identity_unique".to_string())
                        .build(),
                ),
            ),
            (
                doc! { "username": 1 },
                Some(
                    IndexOptions::builder()
                        .unique(true)
                        .name("username_unique".to_string())
                        .build(),
                ),
            ),
            (
                doc! { "email": 1 },
                Some(
                    IndexOptions::builder()
                        .unique(true)
                        .name("email_unique".to_string())
                        .build(),
                ),
            ),
        ]
    }
}
