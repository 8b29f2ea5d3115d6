//! Sorting, time windows and pagination over meme listings.

use chrono::{DateTime, Duration, Utc};
use serde::Deserialize;

use crate::models::{Comment, CommentPage, Meme, MemePage};

pub const DEFAULT_FEED_LIMIT: usize = 10;
pub const DEFAULT_COMMENT_LIMIT: usize = 20;
pub const MAX_PAGE_LIMIT: usize = 100;
pub const TRENDING_LIMIT: usize = 10;

#[derive(Deserialize, Debug, Clone, Copy, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum FeedSort {
    #[default]
    New,
    Top,
}

#[derive(Deserialize, Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum TimeWindow {
    #[default]
    #[serde(rename = "all")]
    All,
    #[serde(rename = "24h")]
    Day,
    #[serde(rename = "week")]
    Week,
}

impl TimeWindow {
    /// Earliest creation time included in the window.
    pub fn since(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        match self {
            TimeWindow::All => None,
            TimeWindow::Day => Some(now - Duration::days(1)),
            TimeWindow::Week => Some(now - Duration::days(7)),
        }
    }
}

/// Query string of `GET /api/memes`.
#[derive(Deserialize, Debug, Clone, Copy, Default)]
pub struct FeedQuery {
    pub page: Option<usize>,
    pub limit: Option<usize>,
    #[serde(default)]
    pub sort: FeedSort,
    #[serde(default)]
    pub time: TimeWindow,
}

/// Query string of paginated comment listings.
#[derive(Deserialize, Debug, Clone, Copy, Default)]
pub struct PageQuery {
    pub page: Option<usize>,
    pub limit: Option<usize>,
}

/// 1-based page number and a clamped page size.
fn page_bounds(page: Option<usize>, limit: Option<usize>, default_limit: usize) -> (usize, usize) {
    let page = page.unwrap_or(1).max(1);
    let limit = limit.unwrap_or(default_limit).clamp(1, MAX_PAGE_LIMIT);
    (page, limit)
}

fn paginate<T>(items: Vec<T>, page: usize, limit: usize) -> (Vec<T>, usize, usize) {
    let total = items.len();
    let pages = total.div_ceil(limit);
    let items = items
        .into_iter()
        .skip((page - 1).saturating_mul(limit))
        .take(limit)
        .collect();
    (items, total, pages)
}

/// Orders and slices published memes for the public feed. The caller has
/// already applied the draft and time-window filters.
pub fn feed_page(mut memes: Vec<Meme>, query: &FeedQuery) -> MemePage {
    match query.sort {
        FeedSort::New => memes.sort_by(|a, b| b.created_at.cmp(&a.created_at)),
        FeedSort::Top => memes.sort_by(|a, b| {
            b.upvotes
                .cmp(&a.upvotes)
                .then_with(|| b.created_at.cmp(&a.created_at))
        }),
    }
    let (page, limit) = page_bounds(query.page, query.limit, DEFAULT_FEED_LIMIT);
    let (memes, total, pages) = paginate(memes, page, limit);
    MemePage { memes, total, pages }
}

/// Today's best: most upvoted first, fewest downvotes breaking ties.
pub fn trending(mut memes: Vec<Meme>) -> Vec<Meme> {
    memes.sort_by(|a, b| {
        b.upvotes
            .cmp(&a.upvotes)
            .then_with(|| a.downvotes.cmp(&b.downvotes))
    });
    memes.truncate(TRENDING_LIMIT);
    memes
}

pub fn start_of_day(now: DateTime<Utc>) -> DateTime<Utc> {
    now.date_naive()
        .and_hms_opt(0, 0, 0)
        .map(|midnight| midnight.and_utc())
        .unwrap_or(now)
}

pub fn newest_first(mut memes: Vec<Meme>) -> Vec<Meme> {
    memes.sort_by(|a, b| b.created_at.cmp(&a.created_at));
    memes
}

pub fn comment_page(mut comments: Vec<Comment>, query: &PageQuery) -> CommentPage {
    comments.sort_by(|a, b| b.created_at.cmp(&a.created_at));
    let (page, limit) = page_bounds(query.page, query.limit, DEFAULT_COMMENT_LIMIT);
    let (comments, total, pages) = paginate(comments, page, limit);
    CommentPage {
        comments,
        total,
        pages,
    }
}
