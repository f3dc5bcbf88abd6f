//! Score record schema
//!
//! One document per identity. The compound `(score DESC, last_updated ASC)`
//! index serves the top-K query in a single ordered scan.

use bson::{doc, Document};
use mongodb::options::IndexOptions;
use serde::{Deserialize, Serialize};

use crate::db::mongo::IntoIndexes;

/// Collection name for score records
pub const SCORE_COLLECTION: &str = "scores";

/// Score record stored in MongoDB
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct ScoreDoc {
    /// Identity this record belongs to
    pub identity: String,

    /// Current score; never decreases through the public API
    pub score: i64,

    /// Commit time of the last accepted write (monotonic, Unix milliseconds)
    pub last_updated: i64,
}

impl IntoIndexes for ScoreDoc {
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
                doc! { "score": -1, "last_updated": 1 },
                Some(
                    IndexOptions::builder()
                        .name("ranking_order".to_string())
                        .build(),
                ),
            ),
        ]
    }
}
