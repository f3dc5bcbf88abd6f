//! Document schemas and their index definitions

pub mod action;
pub mod score;
pub mod user;

pub use action::{ActionLogDoc, ACTION_LOG_COLLECTION};
pub use score::{ScoreDoc, SCORE_COLLECTION};
pub use user::{UserDoc, USER_COLLECTION};
