use std::{fmt, str::FromStr};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// Direction of a single user's vote on a meme.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum VoteType {
    Up,
    Down,
}

impl VoteType {
    pub fn as_str(&self) -> &'static str {
        match self {
            VoteType::Up => "up",
            VoteType::Down => "down",
        }
    }
}

impl fmt::Display for VoteType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Error, Debug, PartialEq, Eq)]
#[error("Invalid vote type '{0}', expected 'up' or 'down'")]
pub struct UnknownVoteType(pub String);

impl FromStr for VoteType {
    type Err = UnknownVoteType;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "up" => Ok(VoteType::Up),
            "down" => Ok(VoteType::Down),
            other => Err(UnknownVoteType(other.to_string())),
        }
    }
}

/// Resolved caller identity, supplied by the session layer.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Identity {
    pub user_id: String,
    pub username: String,
}

/// Where a meme image lives and how to release it again.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ImageRef {
    pub url: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub delete_handle: Option<String>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Creator {
    pub id: String,
    pub username: String,
}

impl From<&Identity> for Creator {
    fn from(identity: &Identity) -> Self {
        Creator {
            id: identity.user_id.clone(),
            username: identity.username.clone(),
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Flag {
    pub user_id: String,
    pub reason: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Vote {
    pub user_id: String,
    pub vote_type: VoteType,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Meme {
    pub id: Uuid,
    pub image: ImageRef,
    pub top_text: String,
    pub bottom_text: String,
    pub creator: Creator,
    pub created_at: DateTime<Utc>,
    pub upvotes: u64,
    pub downvotes: u64,
    pub comment_count: u64,
    pub views: u64,
    pub is_draft: bool,
    pub tags: Vec<String>,
    pub font_size: u32,
    pub font_color: String,
    pub flags: Vec<Flag>,
    pub flag_count: u64,
    pub is_flagged: bool,
}

impl Meme {
    /// Builds a fresh meme with every counter at zero.
    pub fn new(creator: Creator, details: NewMeme) -> Self {
        Meme {
            id: Uuid::new_v4(),
            image: details.image,
            top_text: details.top_text,
            bottom_text: details.bottom_text,
            creator,
            created_at: Utc::now(),
            upvotes: 0,
            downvotes: 0,
            comment_count: 0,
            views: 0,
            is_draft: details.is_draft,
            tags: details.tags,
            font_size: details.font_size,
            font_color: details.font_color,
            flags: Vec::new(),
            flag_count: 0,
            is_flagged: false,
        }
    }

    pub fn is_owned_by(&self, user_id: &str) -> bool {
        self.creator.id == user_id
    }

    /// Applies creator edits in memory. Counters are never touched here.
    pub fn apply_patch(&mut self, patch: &MemePatch) {
        if let Some(top_text) = &patch.top_text {
            self.top_text = top_text.clone();
        }
        if let Some(bottom_text) = &patch.bottom_text {
            self.bottom_text = bottom_text.clone();
        }
        if let Some(tags) = &patch.tags {
            self.tags = tags.clone();
        }
        if let Some(font_size) = patch.font_size {
            self.font_size = font_size;
        }
        if let Some(font_color) = &patch.font_color {
            self.font_color = font_color.clone();
        }
        if let Some(is_draft) = patch.is_draft {
            self.is_draft = is_draft;
        }
    }
}

/// Validated creator input for a new meme.
#[derive(Debug, Clone)]
pub struct NewMeme {
    pub image: ImageRef,
    pub top_text: String,
    pub bottom_text: String,
    pub tags: Vec<String>,
    pub font_size: u32,
    pub font_color: String,
    pub is_draft: bool,
}

/// Creator edits; `None` leaves the field untouched. Tags replace the whole set.
#[derive(Deserialize, Debug, Clone, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MemePatch {
    pub top_text: Option<String>,
    pub bottom_text: Option<String>,
    pub tags: Option<Vec<String>>,
    pub font_size: Option<u32>,
    pub font_color: Option<String>,
    pub is_draft: Option<bool>,
}

impl MemePatch {
    pub fn is_empty(&self) -> bool {
        *self == MemePatch::default()
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Comment {
    pub id: Uuid,
    pub meme_id: Uuid,
    pub text: String,
    pub author: Creator,
    pub created_at: DateTime<Utc>,
}

// --- Operation results ---

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct VoteOutcome {
    pub upvotes: u64,
    pub downvotes: u64,
    pub effective_vote: Option<VoteType>,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct FlagOutcome {
    pub flag_count: u64,
    pub is_flagged: bool,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct CommentCount {
    pub comment_count: u64,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ViewCount {
    pub views: u64,
}

/// A meme as returned from the detail endpoint, with the caller's own vote.
#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct MemeDetail {
    #[serde(flatten)]
    pub meme: Meme,
    pub user_vote: Option<VoteType>,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct MemePage {
    pub memes: Vec<Meme>,
    pub total: usize,
    pub pages: usize,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct CommentPage {
    pub comments: Vec<Comment>,
    pub total: usize,
    pub pages: usize,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct CreatorStats {
    pub memes_count: usize,
    pub drafts_count: usize,
    pub total_upvotes: u64,
    pub total_views: u64,
}
