//! Action log schema
//!
//! Append-only ledger of accepted increments. The unique nonce index is
//! the duplicate-suppression backbone; `(identity, accepted_at)` serves
//! per-identity audit queries.

use bson::{doc, Document};
use mongodb::options::IndexOptions;
use serde::{Deserialize, Serialize};

use crate::db::mongo::IntoIndexes;

/// Collection name for the action log
pub const ACTION_LOG_COLLECTION: &str = "action_log";

/// Accepted action, one document per consumed nonce
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct ActionLogDoc {
    /// Single-use nonce, unique
    pub nonce: String,

    /// Identity the increment was applied to
    pub identity: String,

    /// Accepted increment amount
    pub increment: i64,

    /// When the action token was issued (Unix milliseconds)
    pub issued_at: i64,

    /// When the action was accepted (Unix milliseconds)
    pub accepted_at: i64,

    /// Source address of the accepting request, if known
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source_address: Option<String>,
}

impl IntoIndexes for ActionLogDoc {
    fn into_indices() -> Vec<(Document, Option<IndexOptions>)> {
        vec![
            (
                doc! { "nonce": 1 },
                Some(
                    IndexOptions::builder()
                        .unique(true)
                        .name("nonce_unique".to_string())
                        .build(),
                ),
            ),
            (
                doc! { "identity": 1, "accepted_at": 1 },
                Some(
                    IndexOptions::builder()
                        .name("identity_audit".to_string())
                        .build(),
                ),
            ),
        ]
    }
}
