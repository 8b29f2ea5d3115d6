//! In-process backend.
//!
//! Each trait call takes the map lock once and finishes its whole
//! read-modify-write inside it, which makes every mutation atomic per meme.
//! Used by the test suite and by `STORAGE_BACKEND=memory` for local runs.

use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info};
use uuid::Uuid;

use crate::{
    aggregate::{self, FlagPolicy},
    domain::{CommentRepository, FileStorage, IdentityResolver, MemeRepository},
    errors::{RepoError, StorageError},
    models::{Comment, Flag, FlagOutcome, Identity, ImageRef, Meme, MemePatch, Vote, VoteOutcome, VoteType},
};

struct MemeRecord {
    meme: Meme,
    /// Vote index keyed by user id: one entry per user by construction.
    votes: BTreeMap<String, VoteType>,
}

#[derive(Default)]
pub struct InMemoryMemeRepository {
    records: Mutex<HashMap<Uuid, MemeRecord>>,
}

impl InMemoryMemeRepository {
    pub fn new() -> Self {
        info!("Initializing InMemoryMemeRepository");
        Self::default()
    }
}

#[async_trait]
impl MemeRepository for InMemoryMemeRepository {
    async fn create(&self, meme: &Meme) -> Result<(), RepoError> {
        let mut records = self.records.lock().await;
        records.insert(
            meme.id,
            MemeRecord {
                meme: meme.clone(),
                votes: BTreeMap::new(),
            },
        );
        Ok(())
    }

    async fn get_by_id(&self, id: Uuid) -> Result<Option<Meme>, RepoError> {
        let records = self.records.lock().await;
        Ok(records.get(&id).map(|r| r.meme.clone()))
    }

    async fn list_published(&self, since: Option<DateTime<Utc>>) -> Result<Vec<Meme>, RepoError> {
        let records = self.records.lock().await;
        Ok(records
            .values()
            .map(|r| &r.meme)
            .filter(|m| !m.is_draft)
            .filter(|m| since.is_none_or(|since| m.created_at >= since))
            .cloned()
            .collect())
    }

    async fn list_by_creator(&self, creator_id: &str) -> Result<Vec<Meme>, RepoError> {
        let records = self.records.lock().await;
        Ok(records
            .values()
            .map(|r| &r.meme)
            .filter(|m| m.is_owned_by(creator_id))
            .cloned()
            .collect())
    }

    async fn update_details(&self, id: Uuid, patch: &MemePatch) -> Result<Meme, RepoError> {
        let mut records = self.records.lock().await;
        let record = records.get_mut(&id).ok_or(RepoError::NotFound(id))?;
        record.meme.apply_patch(patch);
        Ok(record.meme.clone())
    }

    async fn get_vote(&self, id: Uuid, user_id: &str) -> Result<Option<VoteType>, RepoError> {
        let records = self.records.lock().await;
        Ok(records.get(&id).and_then(|r| r.votes.get(user_id).copied()))
    }

    async fn list_votes(&self, id: Uuid) -> Result<Vec<Vote>, RepoError> {
        let records = self.records.lock().await;
        let record = records.get(&id).ok_or(RepoError::NotFound(id))?;
        Ok(record
            .votes
            .iter()
            .map(|(user_id, vote_type)| Vote {
                user_id: user_id.clone(),
                vote_type: *vote_type,
            })
            .collect())
    }

    async fn cast_vote(&self, id: Uuid, user_id: &str, requested: VoteType) -> Result<VoteOutcome, RepoError> {
        let mut records = self.records.lock().await;
        let record = records.get_mut(&id).ok_or(RepoError::NotFound(id))?;

        let current = record.votes.get(user_id).copied();
        let step = aggregate::transition(current, requested);
        match step.next {
            Some(vote_type) => record.votes.insert(user_id.to_string(), vote_type),
            None => record.votes.remove(user_id),
        };
        record.meme.upvotes = aggregate::apply_delta(record.meme.upvotes, step.upvotes_delta);
        record.meme.downvotes = aggregate::apply_delta(record.meme.downvotes, step.downvotes_delta);

        debug!(meme_id = %id, %user_id, ?current, next = ?step.next, "Memory: vote applied");
        Ok(VoteOutcome {
            upvotes: record.meme.upvotes,
            downvotes: record.meme.downvotes,
            effective_vote: step.next,
        })
    }

    async fn add_flag(&self, id: Uuid, flag: &Flag, policy: FlagPolicy) -> Result<FlagOutcome, RepoError> {
        let mut records = self.records.lock().await;
        let meme = &mut records.get_mut(&id).ok_or(RepoError::NotFound(id))?.meme;

        if policy.once_per_user && meme.flags.iter().any(|f| f.user_id == flag.user_id) {
            return Err(RepoError::AlreadyFlagged {
                meme_id: id,
                user_id: flag.user_id.clone(),
            });
        }
        meme.flags.push(flag.clone());
        meme.flag_count += 1;
        meme.is_flagged = policy.is_flagged(meme.flag_count, meme.is_flagged);

        Ok(FlagOutcome {
            flag_count: meme.flag_count,
            is_flagged: meme.is_flagged,
        })
    }

    async fn increment_comment_count(&self, id: Uuid) -> Result<u64, RepoError> {
        let mut records = self.records.lock().await;
        let meme = &mut records.get_mut(&id).ok_or(RepoError::NotFound(id))?.meme;
        meme.comment_count += 1;
        Ok(meme.comment_count)
    }

    async fn decrement_comment_count(&self, id: Uuid) -> Result<u64, RepoError> {
        let mut records = self.records.lock().await;
        let meme = &mut records.get_mut(&id).ok_or(RepoError::NotFound(id))?.meme;
        meme.comment_count = meme.comment_count.saturating_sub(1);
        Ok(meme.comment_count)
    }

    async fn increment_views(&self, id: Uuid) -> Result<u64, RepoError> {
        let mut records = self.records.lock().await;
        let meme = &mut records.get_mut(&id).ok_or(RepoError::NotFound(id))?.meme;
        meme.views += 1;
        Ok(meme.views)
    }

    async fn delete(&self, id: Uuid) -> Result<(), RepoError> {
        self.records.lock().await.remove(&id);
        Ok(())
    }
}

#[derive(Default)]
pub struct InMemoryCommentRepository {
    comments: Mutex<HashMap<Uuid, Comment>>,
}

impl InMemoryCommentRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CommentRepository for InMemoryCommentRepository {
    async fn create(&self, comment: &Comment) -> Result<(), RepoError> {
        self.comments.lock().await.insert(comment.id, comment.clone());
        Ok(())
    }

    async fn get_by_id(&self, id: Uuid) -> Result<Option<Comment>, RepoError> {
        Ok(self.comments.lock().await.get(&id).cloned())
    }

    async fn list_for_meme(&self, meme_id: Uuid) -> Result<Vec<Comment>, RepoError> {
        let comments = self.comments.lock().await;
        Ok(comments
            .values()
            .filter(|c| c.meme_id == meme_id)
            .cloned()
            .collect())
    }

    async fn delete(&self, id: Uuid) -> Result<bool, RepoError> {
        Ok(self.comments.lock().await.remove(&id).is_some())
    }

    async fn delete_for_meme(&self, meme_id: Uuid) -> Result<usize, RepoError> {
        let mut comments = self.comments.lock().await;
        let before = comments.len();
        comments.retain(|_, c| c.meme_id != meme_id);
        Ok(before - comments.len())
    }
}

pub struct InMemoryFileStorage {
    public_base_url: String,
    objects: Mutex<HashMap<String, (Vec<u8>, Option<String>)>>,
    #[cfg(test)]
    fail_deletes: std::sync::atomic::AtomicBool,
}

impl InMemoryFileStorage {
    pub fn new(public_base_url: impl Into<String>) -> Self {
        Self {
            public_base_url: public_base_url.into(),
            objects: Mutex::new(HashMap::new()),
            #[cfg(test)]
            fail_deletes: std::sync::atomic::AtomicBool::new(false),
        }
    }

    #[cfg(test)]
    pub fn fail_deletes(&self) {
        self.fail_deletes
            .store(true, std::sync::atomic::Ordering::SeqCst);
    }

    #[cfg(test)]
    pub async fn contains(&self, key: &str) -> bool {
        self.objects.lock().await.contains_key(key)
    }
}

#[async_trait]
impl FileStorage for InMemoryFileStorage {
    async fn upload(&self, key: &str, data: Vec<u8>, content_type: Option<String>) -> Result<ImageRef, StorageError> {
        self.objects
            .lock()
            .await
            .insert(key.to_string(), (data, content_type));
        Ok(ImageRef {
            url: format!("{}/{}", self.public_base_url.trim_end_matches('/'), key),
            delete_handle: Some(key.to_string()),
        })
    }

    async fn download(&self, key: &str) -> Result<(Vec<u8>, Option<String>), StorageError> {
        self.objects
            .lock()
            .await
            .get(key)
            .cloned()
            .ok_or_else(|| StorageError::NotFound(key.to_string()))
    }

    async fn delete(&self, key: &str) -> Result<(), StorageError> {
        #[cfg(test)]
        if self.fail_deletes.load(std::sync::atomic::Ordering::SeqCst) {
            return Err(StorageError::BackendError(anyhow::anyhow!(
                "injected delete failure for '{key}'"
            )));
        }
        self.objects.lock().await.remove(key);
        Ok(())
    }
}

#[derive(Default)]
pub struct InMemoryIdentityResolver {
    sessions: RwLock<HashMap<String, Identity>>,
}

impl InMemoryIdentityResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert(&self, token: impl Into<String>, identity: Identity) {
        self.sessions.write().await.insert(token.into(), identity);
    }
}

#[async_trait]
impl IdentityResolver for InMemoryIdentityResolver {
    async fn resolve(&self, token: &str) -> Result<Option<Identity>, RepoError> {
        Ok(self.sessions.read().await.get(token).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Creator, NewMeme};

    fn sample_meme() -> Meme {
        Meme::new(
            Creator {
                id: "creator".into(),
                username: "creator".into(),
            },
            NewMeme {
                image: ImageRef {
                    url: "/images/a.png".into(),
                    delete_handle: Some("a.png".into()),
                },
                top_text: String::new(),
                bottom_text: String::new(),
                tags: vec![],
                font_size: 40,
                font_color: "#FFFFFF".into(),
                is_draft: false,
            },
        )
    }

    #[tokio::test]
    async fn vote_index_holds_one_entry_per_user() {
        let repo = InMemoryMemeRepository::new();
        let meme = sample_meme();
        repo.create(&meme).await.unwrap();

        repo.cast_vote(meme.id, "a", VoteType::Up).await.unwrap();
        repo.cast_vote(meme.id, "a", VoteType::Down).await.unwrap();
        repo.cast_vote(meme.id, "b", VoteType::Down).await.unwrap();

        let votes = repo.list_votes(meme.id).await.unwrap();
        assert_eq!(votes.len(), 2);
        assert!(votes.iter().all(|v| v.vote_type == VoteType::Down));
        let stored = repo.get_by_id(meme.id).await.unwrap().unwrap();
        assert_eq!((stored.upvotes, stored.downvotes), (0, 2));
    }

    #[tokio::test]
    async fn counters_on_missing_meme_are_not_found() {
        let repo = InMemoryMemeRepository::new();
        let id = Uuid::new_v4();
        assert!(matches!(repo.increment_views(id).await, Err(RepoError::NotFound(_))));
        assert!(matches!(
            repo.decrement_comment_count(id).await,
            Err(RepoError::NotFound(_))
        ));
        assert!(matches!(
            repo.cast_vote(id, "a", VoteType::Up).await,
            Err(RepoError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn once_per_user_policy_rejects_repeat_flags() {
        let repo = InMemoryMemeRepository::new();
        let meme = sample_meme();
        repo.create(&meme).await.unwrap();
        let policy = FlagPolicy {
            threshold: 1,
            once_per_user: true,
        };
        let flag = Flag {
            user_id: "b".into(),
            reason: "spam".into(),
            created_at: Utc::now(),
        };
        repo.add_flag(meme.id, &flag, policy).await.unwrap();
        let again = repo.add_flag(meme.id, &flag, policy).await;
        assert!(matches!(again, Err(RepoError::AlreadyFlagged { .. })));
        let stored = repo.get_by_id(meme.id).await.unwrap().unwrap();
        assert_eq!(stored.flag_count, 1);
        assert_eq!(stored.flags.len(), 1);
    }

    #[tokio::test]
    async fn deleting_a_comment_twice_reports_once() {
        let repo = InMemoryCommentRepository::new();
        let comment = Comment {
            id: Uuid::new_v4(),
            meme_id: Uuid::new_v4(),
            text: "hi".into(),
            author: Creator {
                id: "a".into(),
                username: "a".into(),
            },
            created_at: Utc::now(),
        };
        repo.create(&comment).await.unwrap();
        assert!(repo.delete(comment.id).await.unwrap());
        assert!(!repo.delete(comment.id).await.unwrap());
    }

    #[tokio::test]
    async fn uploaded_images_get_public_urls() {
        let storage = InMemoryFileStorage::new("/images/");
        let image = storage
            .upload("k.png", vec![1, 2, 3], Some("image/png".into()))
            .await
            .unwrap();
        assert_eq!(image.url, "/images/k.png");
        assert_eq!(image.delete_handle.as_deref(), Some("k.png"));
        let (bytes, content_type) = storage.download("k.png").await.unwrap();
        assert_eq!(bytes, vec![1, 2, 3]);
        assert_eq!(content_type.as_deref(), Some("image/png"));
        storage.delete("k.png").await.unwrap();
        assert!(matches!(
            storage.download("k.png").await,
            Err(StorageError::NotFound(_))
        ));
    }
}
