//! Meme operations as the HTTP layer sees them: ownership checks, validation,
//! the comment-count projection and the deletion cascade sit on top of the
//! atomic repository primitives.

use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::{
    aggregate::FlagPolicy,
    domain::{CommentRepository, FileStorage, MemeRepository},
    errors::{MemeError, RepoError},
    feed::{self, FeedQuery, PageQuery},
    models::{
        Comment, CommentCount, CommentPage, Creator, CreatorStats, Flag, FlagOutcome, Identity, Meme,
        MemeDetail, MemePage, MemePatch, NewMeme, ViewCount, VoteOutcome, VoteType,
    },
    validation,
};

/// Raw image upload as received from the client.
#[derive(Debug, Clone)]
pub struct ImageUpload {
    pub data: Vec<u8>,
    pub file_name: Option<String>,
    pub content_type: Option<String>,
}

/// Unvalidated creator input for a new meme; absent fields take defaults.
#[derive(Debug, Clone, Default)]
pub struct MemeDraft {
    pub top_text: Option<String>,
    pub bottom_text: Option<String>,
    pub tags: Vec<String>,
    pub font_size: Option<u32>,
    pub font_color: Option<String>,
    pub is_draft: bool,
}

#[derive(Clone)]
pub struct MemeService {
    memes: Arc<dyn MemeRepository>,
    comments: Arc<dyn CommentRepository>,
    files: Arc<dyn FileStorage>,
    flag_policy: FlagPolicy,
    max_upload_bytes: usize,
}

impl MemeService {
    pub fn new(
        memes: Arc<dyn MemeRepository>,
        comments: Arc<dyn CommentRepository>,
        files: Arc<dyn FileStorage>,
        flag_policy: FlagPolicy,
        max_upload_bytes: usize,
    ) -> Self {
        Self {
            memes,
            comments,
            files,
            flag_policy,
            max_upload_bytes,
        }
    }

    async fn require_meme(&self, id: Uuid) -> Result<Meme, MemeError> {
        self.memes
            .get_by_id(id)
            .await?
            .ok_or(MemeError::NotFound(id))
    }

    async fn require_owned_meme(&self, id: Uuid, user_id: &str, action: &str) -> Result<Meme, MemeError> {
        let meme = self.require_meme(id).await?;
        if !meme.is_owned_by(user_id) {
            warn!(meme_id = %id, %user_id, action, "Rejected change by non-creator");
            return Err(MemeError::Forbidden(format!("Not authorized to {action} this meme")));
        }
        Ok(meme)
    }

    // --- Creation and editing ---

    pub async fn create_meme(&self, creator: &Identity, image: ImageUpload, draft: MemeDraft) -> Result<Meme, MemeError> {
        let content_type = image
            .content_type
            .clone()
            .or_else(|| {
                image
                    .file_name
                    .as_deref()
                    .and_then(|name| mime_guess::from_path(name).first_raw())
                    .map(str::to_string)
            })
            .unwrap_or_else(|| "application/octet-stream".to_string());
        if !content_type.starts_with("image") {
            return Err(MemeError::InvalidInput("Please upload an image file".to_string()));
        }
        if image.data.is_empty() {
            return Err(MemeError::InvalidInput("image data cannot be empty".to_string()));
        }
        if image.data.len() > self.max_upload_bytes {
            return Err(MemeError::InvalidInput(format!(
                "Image size should be less than {} bytes",
                self.max_upload_bytes
            )));
        }

        let top_text = draft.top_text.unwrap_or_default();
        let bottom_text = draft.bottom_text.unwrap_or_default();
        let tags = validation::normalize_tags(&draft.tags);
        let font_size = draft.font_size.unwrap_or(validation::DEFAULT_FONT_SIZE);
        let font_color = draft
            .font_color
            .unwrap_or_else(|| validation::DEFAULT_FONT_COLOR.to_string());
        validation::check_caption("topText", &top_text)?;
        validation::check_caption("bottomText", &bottom_text)?;
        validation::check_tags(&tags)?;
        validation::check_font_size(font_size)?;
        validation::check_font_color(&font_color)?;

        let extension = image
            .file_name
            .as_deref()
            .and_then(|name| name.rsplit_once('.').map(|(_, ext)| ext.to_lowercase()))
            .filter(|ext| !ext.is_empty() && ext.chars().all(|c| c.is_ascii_alphanumeric()))
            .unwrap_or_else(|| "bin".to_string());
        let image_key = format!("{}.{}", Uuid::new_v4(), extension);
        let image_ref = self
            .files
            .upload(&image_key, image.data, Some(content_type))
            .await?;

        let meme = Meme::new(
            Creator::from(creator),
            NewMeme {
                image: image_ref,
                top_text,
                bottom_text,
                tags,
                font_size,
                font_color,
                is_draft: draft.is_draft,
            },
        );
        if let Err(e) = self.memes.create(&meme).await {
            // Don't leave an orphaned object behind when the metadata write fails.
            if let Err(cleanup) = self.files.delete(&image_key).await {
                warn!(%image_key, error = %cleanup, "Failed to remove image after metadata write failed");
            }
            return Err(e.into());
        }

        info!(meme_id = %meme.id, creator = %creator.user_id, draft = meme.is_draft, "Meme created");
        Ok(meme)
    }

    pub async fn update_meme(&self, id: Uuid, caller: &Identity, patch: MemePatch) -> Result<Meme, MemeError> {
        let meme = self.require_owned_meme(id, &caller.user_id, "update").await?;

        let mut patch = patch;
        if let Some(text) = &patch.top_text {
            validation::check_caption("topText", text)?;
        }
        if let Some(text) = &patch.bottom_text {
            validation::check_caption("bottomText", text)?;
        }
        if let Some(tags) = patch.tags.take() {
            let tags = validation::normalize_tags(&tags);
            validation::check_tags(&tags)?;
            patch.tags = Some(tags);
        }
        if let Some(size) = patch.font_size {
            validation::check_font_size(size)?;
        }
        if let Some(color) = &patch.font_color {
            validation::check_font_color(color)?;
        }
        if patch.is_empty() {
            return Ok(meme);
        }

        let updated = self.memes.update_details(id, &patch).await?;
        info!(meme_id = %id, "Meme updated by creator");
        Ok(updated)
    }

    // --- Reads ---

    /// Detail fetch: records the view, then returns the meme with the
    /// caller's own vote when a caller is known.
    pub async fn view_meme(&self, id: Uuid, viewer: Option<&Identity>) -> Result<MemeDetail, MemeError> {
        let recorded = self.record_view(id).await?;
        let mut meme = self.require_meme(id).await?;
        // The read may lag the increment; never report fewer views than we just recorded.
        meme.views = meme.views.max(recorded.views);
        let user_vote = match viewer {
            Some(viewer) => self.memes.get_vote(id, &viewer.user_id).await?,
            None => None,
        };
        Ok(MemeDetail { meme, user_vote })
    }

    pub async fn feed(&self, query: &FeedQuery) -> Result<MemePage, MemeError> {
        let since = query.time.since(Utc::now());
        let memes = self.memes.list_published(since).await?;
        Ok(feed::feed_page(memes, query))
    }

    pub async fn trending_today(&self) -> Result<Vec<Meme>, MemeError> {
        let since = feed::start_of_day(Utc::now());
        let memes = self.memes.list_published(Some(since)).await?;
        Ok(feed::trending(memes))
    }

    pub async fn memes_by_creator(&self, creator_id: &str) -> Result<Vec<Meme>, MemeError> {
        let memes = self.memes.list_by_creator(creator_id).await?;
        Ok(feed::newest_first(memes))
    }

    pub async fn creator_stats(&self, creator_id: &str) -> Result<CreatorStats, MemeError> {
        let memes = self.memes.list_by_creator(creator_id).await?;
        Ok(memes.iter().fold(CreatorStats::default(), |mut stats, meme| {
            if meme.is_draft {
                stats.drafts_count += 1;
            } else {
                stats.memes_count += 1;
                stats.total_upvotes += meme.upvotes;
                stats.total_views += meme.views;
            }
            stats
        }))
    }

    pub async fn image(&self, key: &str) -> Result<(Vec<u8>, Option<String>), MemeError> {
        Ok(self.files.download(key).await?)
    }

    // --- Aggregate counters ---

    pub async fn cast_vote(&self, id: Uuid, voter: &Identity, vote_type: VoteType) -> Result<VoteOutcome, MemeError> {
        let outcome = self.memes.cast_vote(id, &voter.user_id, vote_type).await?;
        debug!(meme_id = %id, user_id = %voter.user_id, requested = %vote_type, effective = ?outcome.effective_vote, "Vote cast");
        Ok(outcome)
    }

    pub async fn flag_meme(&self, id: Uuid, reporter: &Identity, reason: &str) -> Result<FlagOutcome, MemeError> {
        let reason = validation::check_flag_reason(reason)?;
        let flag = Flag {
            user_id: reporter.user_id.clone(),
            reason: reason.to_string(),
            created_at: Utc::now(),
        };
        let outcome = self.memes.add_flag(id, &flag, self.flag_policy).await?;
        info!(meme_id = %id, user_id = %reporter.user_id, flag_count = outcome.flag_count, is_flagged = outcome.is_flagged, "Meme flagged");
        Ok(outcome)
    }

    /// Call only after the comment write is durable.
    pub async fn on_comment_created(&self, meme_id: Uuid) -> Result<CommentCount, MemeError> {
        let comment_count = self.memes.increment_comment_count(meme_id).await?;
        Ok(CommentCount { comment_count })
    }

    /// Call only after the comment deletion succeeded. Floors at zero.
    pub async fn on_comment_deleted(&self, meme_id: Uuid) -> Result<CommentCount, MemeError> {
        let comment_count = self.memes.decrement_comment_count(meme_id).await?;
        Ok(CommentCount { comment_count })
    }

    pub async fn record_view(&self, id: Uuid) -> Result<ViewCount, MemeError> {
        let views = self.memes.increment_views(id).await?;
        Ok(ViewCount { views })
    }

    // --- Comments ---

    pub async fn list_comments(&self, meme_id: Uuid, query: &PageQuery) -> Result<CommentPage, MemeError> {
        let comments = self.comments.list_for_meme(meme_id).await?;
        Ok(feed::comment_page(comments, query))
    }

    pub async fn add_comment(&self, author: &Identity, meme_id: Uuid, text: &str) -> Result<Comment, MemeError> {
        let text = validation::check_comment(text)?;
        self.require_meme(meme_id).await?;

        let comment = Comment {
            id: Uuid::new_v4(),
            meme_id,
            text: text.to_string(),
            author: Creator::from(author),
            created_at: Utc::now(),
        };
        self.comments.create(&comment).await?;

        if let Err(e) = self.on_comment_created(meme_id).await {
            // The meme vanished between the check and the increment: roll the comment back.
            warn!(meme_id = %meme_id, comment_id = %comment.id, error = %e, "Comment count update failed, removing comment");
            self.comments.delete(comment.id).await?;
            return Err(e);
        }

        info!(comment_id = %comment.id, meme_id = %meme_id, "Comment added");
        Ok(comment)
    }

    pub async fn remove_comment(&self, comment_id: Uuid, caller: &Identity) -> Result<CommentCount, MemeError> {
        let comment = self
            .comments
            .get_by_id(comment_id)
            .await?
            .ok_or(MemeError::CommentNotFound(comment_id))?;
        if comment.author.id != caller.user_id {
            return Err(MemeError::Forbidden("Not authorized to delete this comment".to_string()));
        }

        if !self.comments.delete(comment_id).await? {
            // A concurrent request already removed it and moved the counter.
            return Err(MemeError::CommentNotFound(comment_id));
        }

        match self.on_comment_deleted(comment.meme_id).await {
            Ok(count) => {
                info!(%comment_id, meme_id = %comment.meme_id, "Comment deleted");
                Ok(count)
            }
            Err(MemeError::NotFound(meme_id)) => {
                debug!(%comment_id, %meme_id, "Comment deleted after its meme was removed");
                Ok(CommentCount { comment_count: 0 })
            }
            Err(e) => Err(e),
        }
    }

    // --- Deletion cascade ---

    /// Releases the image (best-effort), then the comments, then the meme.
    pub async fn delete_meme(&self, id: Uuid, requesting_user_id: &str) -> Result<(), MemeError> {
        let meme = self.require_owned_meme(id, requesting_user_id, "delete").await?;

        if let Some(handle) = &meme.image.delete_handle {
            match self.files.delete(handle).await {
                Ok(()) => debug!(meme_id = %id, image_key = %handle, "Released meme image"),
                Err(e) => warn!(meme_id = %id, image_key = %handle, error = ?e, "Failed to release meme image, continuing with deletion"),
            }
        }

        let mut removed = self.comments.delete_for_meme(id).await?;
        match self.memes.delete(id).await {
            Ok(()) | Err(RepoError::NotFound(_)) => {}
            Err(e) => return Err(e.into()),
        }
        // A comment added between the first sweep and the meme delete already holds
        // its increment; anything later fails the increment and rolls itself back.
        removed += self.comments.delete_for_meme(id).await?;

        info!(meme_id = %id, comments_removed = removed, "Meme deleted");
        Ok(())
    }
}
