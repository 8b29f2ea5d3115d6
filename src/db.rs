// Standard library imports
use std::collections::HashMap;
use std::str::FromStr;

// External crate imports
use aws_sdk_dynamodb::types::AttributeValue;
use chrono::{DateTime, Utc};
use uuid::Uuid;

// Internal crate imports
use crate::models::{Comment, Creator, Flag, Identity, ImageRef, Meme, VoteType};

pub type Item = HashMap<String, AttributeValue>;

pub const MEMES_TABLE: &str = "memes";
pub const VOTES_TABLE: &str = "meme_votes";
pub const COMMENTS_TABLE: &str = "comments";
pub const SESSIONS_TABLE: &str = "sessions";
pub const COMMENTS_BY_MEME_INDEX: &str = "meme_id-created_at-index";

/// Physical table names, optionally prefixed per deployment.
#[derive(Debug, Clone)]
pub struct TableNames {
    pub memes: String,
    pub votes: String,
    pub comments: String,
    pub sessions: String,
}

impl TableNames {
    pub fn with_prefix(prefix: &str) -> Self {
        Self {
            memes: format!("{prefix}{MEMES_TABLE}"),
            votes: format!("{prefix}{VOTES_TABLE}"),
            comments: format!("{prefix}{COMMENTS_TABLE}"),
            sessions: format!("{prefix}{SESSIONS_TABLE}"),
        }
    }
}

pub fn s(value: impl Into<String>) -> AttributeValue {
    AttributeValue::S(value.into())
}

pub fn n(value: impl ToString) -> AttributeValue {
    AttributeValue::N(value.to_string())
}

pub fn get_s<'a>(item: &'a Item, key: &str) -> Option<&'a str> {
    item.get(key)?.as_s().ok().map(String::as_str)
}

pub fn get_n<T: FromStr>(item: &Item, key: &str) -> Option<T> {
    item.get(key)?.as_n().ok()?.parse().ok()
}

/// Counters are written with `ADD`, so a missing attribute means zero.
pub fn get_counter(item: &Item, key: &str) -> Option<u64> {
    match item.get(key) {
        None => Some(0),
        Some(_) => get_n(item, key),
    }
}

fn get_bool(item: &Item, key: &str) -> Option<bool> {
    match item.get(key) {
        None => Some(false),
        Some(value) => value.as_bool().ok().copied(),
    }
}

fn get_time(item: &Item, key: &str) -> Option<DateTime<Utc>> {
    DateTime::from_timestamp_millis(get_n(item, key)?)
}

pub fn time(value: DateTime<Utc>) -> AttributeValue {
    n(value.timestamp_millis())
}

fn flag_to_value(flag: &Flag) -> AttributeValue {
    AttributeValue::M(HashMap::from([
        ("user_id".to_string(), s(&flag.user_id)),
        ("reason".to_string(), s(&flag.reason)),
        ("created_at".to_string(), time(flag.created_at)),
    ]))
}

fn value_to_flag(value: &AttributeValue) -> Option<Flag> {
    let map = value.as_m().ok()?;
    Some(Flag {
        user_id: get_s(map, "user_id")?.to_string(),
        reason: get_s(map, "reason")?.to_string(),
        created_at: get_time(map, "created_at")?,
    })
}

/// A single flag wrapped as a one-element list, ready for `list_append`.
pub fn flag_list(flag: &Flag) -> AttributeValue {
    AttributeValue::L(vec![flag_to_value(flag)])
}

pub fn string_list(values: &[String]) -> AttributeValue {
    AttributeValue::L(values.iter().map(s).collect())
}

/// Converts a `Meme` into a DynamoDB item.
pub fn meme_to_item(meme: &Meme) -> Item {
    let mut item = HashMap::from([
        ("meme_id".to_string(), s(meme.id.to_string())),
        ("image_url".to_string(), s(&meme.image.url)),
        ("top_text".to_string(), s(&meme.top_text)),
        ("bottom_text".to_string(), s(&meme.bottom_text)),
        ("creator_id".to_string(), s(&meme.creator.id)),
        ("creator_username".to_string(), s(&meme.creator.username)),
        ("created_at".to_string(), time(meme.created_at)),
        ("upvotes".to_string(), n(meme.upvotes)),
        ("downvotes".to_string(), n(meme.downvotes)),
        ("comment_count".to_string(), n(meme.comment_count)),
        ("views".to_string(), n(meme.views)),
        ("is_draft".to_string(), AttributeValue::Bool(meme.is_draft)),
        ("tags".to_string(), string_list(&meme.tags)),
        ("font_size".to_string(), n(meme.font_size)),
        ("font_color".to_string(), s(&meme.font_color)),
        (
            "flags".to_string(),
            AttributeValue::L(meme.flags.iter().map(flag_to_value).collect()),
        ),
        ("flag_count".to_string(), n(meme.flag_count)),
        ("is_flagged".to_string(), AttributeValue::Bool(meme.is_flagged)),
    ]);
    if let Some(handle) = &meme.image.delete_handle {
        item.insert("image_key".to_string(), s(handle));
    }
    item
}

/// Converts a DynamoDB item into a `Meme`.
/// Returns `None` if any required field is missing or has the wrong type.
pub fn item_to_meme(item: &Item) -> Option<Meme> {
    let id = Uuid::parse_str(get_s(item, "meme_id")?).ok()?;
    let tags = match item.get("tags") {
        Some(value) => value
            .as_l()
            .ok()?
            .iter()
            .map(|v| v.as_s().ok().cloned())
            .collect::<Option<Vec<_>>>()?,
        None => Vec::new(),
    };
    let flags = match item.get("flags") {
        Some(value) => value
            .as_l()
            .ok()?
            .iter()
            .map(value_to_flag)
            .collect::<Option<Vec<_>>>()?,
        None => Vec::new(),
    };

    Some(Meme {
        id,
        image: ImageRef {
            url: get_s(item, "image_url")?.to_string(),
            delete_handle: get_s(item, "image_key").map(str::to_string),
        },
        top_text: get_s(item, "top_text").unwrap_or_default().to_string(),
        bottom_text: get_s(item, "bottom_text").unwrap_or_default().to_string(),
        creator: Creator {
            id: get_s(item, "creator_id")?.to_string(),
            username: get_s(item, "creator_username")?.to_string(),
        },
        created_at: get_time(item, "created_at")?,
        upvotes: get_counter(item, "upvotes")?,
        downvotes: get_counter(item, "downvotes")?,
        comment_count: get_counter(item, "comment_count")?,
        views: get_counter(item, "views")?,
        is_draft: get_bool(item, "is_draft")?,
        tags,
        font_size: get_n(item, "font_size")?,
        font_color: get_s(item, "font_color")?.to_string(),
        flags,
        flag_count: get_counter(item, "flag_count")?,
        is_flagged: get_bool(item, "is_flagged")?,
    })
}

pub fn comment_to_item(comment: &Comment) -> Item {
    HashMap::from([
        ("comment_id".to_string(), s(comment.id.to_string())),
        ("meme_id".to_string(), s(comment.meme_id.to_string())),
        ("text".to_string(), s(&comment.text)),
        ("author_id".to_string(), s(&comment.author.id)),
        ("author_username".to_string(), s(&comment.author.username)),
        ("created_at".to_string(), time(comment.created_at)),
    ])
}

pub fn item_to_comment(item: &Item) -> Option<Comment> {
    Some(Comment {
        id: Uuid::parse_str(get_s(item, "comment_id")?).ok()?,
        meme_id: Uuid::parse_str(get_s(item, "meme_id")?).ok()?,
        text: get_s(item, "text")?.to_string(),
        author: Creator {
            id: get_s(item, "author_id")?.to_string(),
            username: get_s(item, "author_username")?.to_string(),
        },
        created_at: get_time(item, "created_at")?,
    })
}

pub fn item_to_vote_type(item: &Item) -> Option<VoteType> {
    get_s(item, "vote_type")?.parse().ok()
}

/// Session rows carry `user_id`, `username` and an optional `expires_at` (epoch seconds).
pub fn item_to_identity(item: &Item, now: DateTime<Utc>) -> Option<Identity> {
    if let Some(expires_at) = get_n::<i64>(item, "expires_at") {
        if expires_at <= now.timestamp() {
            return None;
        }
    }
    Some(Identity {
        user_id: get_s(item, "user_id")?.to_string(),
        username: get_s(item, "username")?.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::NewMeme;
    use chrono::TimeZone;

    fn sample() -> Meme {
        let mut meme = Meme::new(
            Creator {
                id: "u1".into(),
                username: "alice".into(),
            },
            NewMeme {
                image: ImageRef {
                    url: "/images/k.png".into(),
                    delete_handle: Some("k.png".into()),
                },
                top_text: "top".into(),
                bottom_text: String::new(),
                tags: vec!["b".into(), "a".into()],
                font_size: 44,
                font_color: "#00FF00".into(),
                is_draft: true,
            },
        );
        // millisecond precision is what the table keeps
        meme.created_at = Utc.timestamp_millis_opt(1_700_000_000_123).unwrap();
        meme.flags.push(Flag {
            user_id: "u2".into(),
            reason: "spam".into(),
            created_at: Utc.timestamp_millis_opt(1_700_000_001_000).unwrap(),
        });
        meme.flag_count = 1;
        meme.is_flagged = true;
        meme.upvotes = 3;
        meme
    }

    #[test]
    fn meme_item_keeps_tag_order_and_flags() {
        let meme = sample();
        let decoded = item_to_meme(&meme_to_item(&meme)).unwrap();
        assert_eq!(decoded, meme);
        assert_eq!(decoded.tags, vec!["b", "a"]);
    }

    #[test]
    fn missing_counters_read_as_zero() {
        let mut item = meme_to_item(&sample());
        item.remove("views");
        item.remove("comment_count");
        let decoded = item_to_meme(&item).unwrap();
        assert_eq!(decoded.views, 0);
        assert_eq!(decoded.comment_count, 0);
    }

    #[test]
    fn negative_counter_is_corrupt() {
        let mut item = meme_to_item(&sample());
        item.insert("upvotes".into(), n(-1));
        assert!(item_to_meme(&item).is_none());
    }

    #[test]
    fn expired_sessions_do_not_resolve() {
        let now = Utc.timestamp_opt(1_000, 0).unwrap();
        let mut item = HashMap::from([
            ("token".to_string(), s("t")),
            ("user_id".to_string(), s("u1")),
            ("username".to_string(), s("alice")),
        ]);
        assert_eq!(item_to_identity(&item, now).unwrap().user_id, "u1");
        item.insert("expires_at".into(), n(999));
        assert!(item_to_identity(&item, now).is_none());
        item.insert("expires_at".into(), n(1_001));
        assert!(item_to_identity(&item, now).is_some());
    }

    #[test]
    fn table_prefix() {
        let names = TableNames::with_prefix("dev-");
        assert_eq!(names.memes, "dev-memes");
        assert_eq!(names.votes, "dev-meme_votes");
    }
}
