use crate::aggregate::FlagPolicy;
use crate::errors::{RepoError, StorageError};
use crate::models::{Comment, Flag, FlagOutcome, Identity, ImageRef, Meme, MemePatch, Vote, VoteOutcome, VoteType};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

/// Storage of meme documents and their vote index.
///
/// Every counter mutation is a single atomic step in the backend: callers never
/// read a meme, change a number and write the meme back.
#[async_trait]
pub trait MemeRepository: Send + Sync + 'static {
    async fn create(&self, meme: &Meme) -> Result<(), RepoError>;

    /// Returns Ok(None) if the meme is not found.
    async fn get_by_id(&self, id: Uuid) -> Result<Option<Meme>, RepoError>;

    /// Published (non-draft) memes, optionally only those created at or after `since`.
    async fn list_published(&self, since: Option<DateTime<Utc>>) -> Result<Vec<Meme>, RepoError>;

    /// Every meme of one creator, drafts included.
    async fn list_by_creator(&self, creator_id: &str) -> Result<Vec<Meme>, RepoError>;

    /// Applies creator edits and returns the updated meme.
    async fn update_details(&self, id: Uuid, patch: &MemePatch) -> Result<Meme, RepoError>;

    async fn get_vote(&self, id: Uuid, user_id: &str) -> Result<Option<VoteType>, RepoError>;

    async fn list_votes(&self, id: Uuid) -> Result<Vec<Vote>, RepoError>;

    /// Runs the vote state machine for `(id, user_id)` and moves the counters
    /// in the same atomic step.
    async fn cast_vote(&self, id: Uuid, user_id: &str, requested: VoteType) -> Result<VoteOutcome, RepoError>;

    /// Appends a flag, bumps `flag_count` and applies `policy` to `is_flagged`.
    async fn add_flag(&self, id: Uuid, flag: &Flag, policy: FlagPolicy) -> Result<FlagOutcome, RepoError>;

    async fn increment_comment_count(&self, id: Uuid) -> Result<u64, RepoError>;

    /// Decrements `comment_count`, never below zero.
    async fn decrement_comment_count(&self, id: Uuid) -> Result<u64, RepoError>;

    async fn increment_views(&self, id: Uuid) -> Result<u64, RepoError>;

    /// Removes the meme and its vote index entries.
    async fn delete(&self, id: Uuid) -> Result<(), RepoError>;
}

#[async_trait]
pub trait CommentRepository: Send + Sync + 'static {
    async fn create(&self, comment: &Comment) -> Result<(), RepoError>;

    async fn get_by_id(&self, id: Uuid) -> Result<Option<Comment>, RepoError>;

    async fn list_for_meme(&self, meme_id: Uuid) -> Result<Vec<Comment>, RepoError>;

    /// Returns true when this call removed the comment, false if it was already gone.
    async fn delete(&self, id: Uuid) -> Result<bool, RepoError>;

    /// Removes every comment of a meme and returns how many were removed.
    async fn delete_for_meme(&self, meme_id: Uuid) -> Result<usize, RepoError>;
}

/// Trait defining operations for storing and retrieving file data (meme images).
#[async_trait]
pub trait FileStorage: Send + Sync + 'static {
    /// Stores the bytes under `key` and returns the public reference.
    async fn upload(&self, key: &str, data: Vec<u8>, content_type: Option<String>) -> Result<ImageRef, StorageError>;

    async fn download(&self, key: &str) -> Result<(Vec<u8>, Option<String>), StorageError>;

    async fn delete(&self, key: &str) -> Result<(), StorageError>;
}

/// Resolves an opaque bearer token to the caller. Issuing tokens happens elsewhere.
#[async_trait]
pub trait IdentityResolver: Send + Sync + 'static {
    /// Returns Ok(None) for unknown or expired tokens.
    async fn resolve(&self, token: &str) -> Result<Option<Identity>, RepoError>;
}
