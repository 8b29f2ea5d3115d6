use crate::errors::MemeError;

pub const MAX_CAPTION_CHARS: usize = 100;
pub const MAX_TAGS: usize = 5;
pub const MAX_TAG_CHARS: usize = 20;
pub const MAX_COMMENT_CHARS: usize = 140;
pub const MAX_FLAG_REASON_CHARS: usize = 200;
pub const MIN_FONT_SIZE: u32 = 20;
pub const MAX_FONT_SIZE: u32 = 80;
pub const DEFAULT_FONT_SIZE: u32 = 40;
pub const DEFAULT_FONT_COLOR: &str = "#FFFFFF";

fn invalid(msg: impl Into<String>) -> MemeError {
    MemeError::InvalidInput(msg.into())
}

/// Trims, lowercases and de-duplicates tags, keeping first-seen order.
pub fn normalize_tags<I, S>(raw: I) -> Vec<String>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut tags: Vec<String> = Vec::new();
    for tag in raw {
        let tag = tag.as_ref().trim().to_lowercase();
        if !tag.is_empty() && !tags.contains(&tag) {
            tags.push(tag);
        }
    }
    tags
}

/// Splits the comma-separated form value used by the upload form.
pub fn parse_tag_list(raw: &str) -> Vec<String> {
    normalize_tags(raw.split(','))
}

pub fn check_caption(field: &str, text: &str) -> Result<(), MemeError> {
    if text.chars().count() > MAX_CAPTION_CHARS {
        return Err(invalid(format!(
            "{field} must be {MAX_CAPTION_CHARS} characters or less"
        )));
    }
    Ok(())
}

pub fn check_tags(tags: &[String]) -> Result<(), MemeError> {
    if tags.len() > MAX_TAGS {
        return Err(invalid(format!("At most {MAX_TAGS} tags are allowed")));
    }
    if let Some(tag) = tags.iter().find(|t| t.chars().count() > MAX_TAG_CHARS) {
        return Err(invalid(format!(
            "Tag '{tag}' is longer than {MAX_TAG_CHARS} characters"
        )));
    }
    Ok(())
}

pub fn check_font_size(size: u32) -> Result<(), MemeError> {
    if !(MIN_FONT_SIZE..=MAX_FONT_SIZE).contains(&size) {
        return Err(invalid(format!(
            "fontSize must be between {MIN_FONT_SIZE} and {MAX_FONT_SIZE}"
        )));
    }
    Ok(())
}

/// Accepts `#RRGGBB` hex colors only.
pub fn check_font_color(color: &str) -> Result<(), MemeError> {
    let valid = color.len() == 7
        && color.starts_with('#')
        && color[1..].chars().all(|c| c.is_ascii_hexdigit());
    if !valid {
        return Err(invalid(format!("fontColor '{color}' is not a #RRGGBB color")));
    }
    Ok(())
}

/// Returns the trimmed comment body.
pub fn check_comment(text: &str) -> Result<&str, MemeError> {
    let text = text.trim();
    if text.is_empty() {
        return Err(invalid("Comment cannot be empty"));
    }
    if text.chars().count() > MAX_COMMENT_CHARS {
        return Err(invalid(format!(
            "Comment must be {MAX_COMMENT_CHARS} characters or less"
        )));
    }
    Ok(text)
}

/// Returns the trimmed flag reason.
pub fn check_flag_reason(reason: &str) -> Result<&str, MemeError> {
    let reason = reason.trim();
    if reason.is_empty() {
        return Err(invalid("Please provide a reason for flagging this meme"));
    }
    if reason.chars().count() > MAX_FLAG_REASON_CHARS {
        return Err(invalid(format!(
            "Flag reason must be {MAX_FLAG_REASON_CHARS} characters or less"
        )));
    }
    Ok(reason)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tags_are_normalized_in_insertion_order() {
        assert_eq!(
            parse_tag_list(" Cats, dogs ,CATS,, Birds "),
            vec!["cats", "dogs", "birds"]
        );
        assert!(parse_tag_list("").is_empty());
    }

    #[test]
    fn tag_limits() {
        let five: Vec<String> = (0..5).map(|i| format!("t{i}")).collect();
        assert!(check_tags(&five).is_ok());
        let six: Vec<String> = (0..6).map(|i| format!("t{i}")).collect();
        assert!(check_tags(&six).is_err());
        assert!(check_tags(&["a".repeat(21)]).is_err());
    }

    #[test]
    fn caption_length_counts_characters_not_bytes() {
        assert!(check_caption("topText", &"é".repeat(100)).is_ok());
        assert!(check_caption("topText", &"é".repeat(101)).is_err());
    }

    #[test]
    fn font_checks() {
        assert!(check_font_size(DEFAULT_FONT_SIZE).is_ok());
        assert!(check_font_size(19).is_err());
        assert!(check_font_size(81).is_err());
        assert!(check_font_color(DEFAULT_FONT_COLOR).is_ok());
        assert!(check_font_color("#abc123").is_ok());
        assert!(check_font_color("red").is_err());
        assert!(check_font_color("#GGGGGG").is_err());
    }

    #[test]
    fn comment_and_flag_bounds() {
        assert_eq!(check_comment("  hi  ").unwrap(), "hi");
        assert!(check_comment("   ").is_err());
        assert!(check_comment(&"x".repeat(140)).is_ok());
        assert!(check_comment(&"x".repeat(141)).is_err());

        assert_eq!(check_flag_reason(" spam ").unwrap(), "spam");
        assert!(check_flag_reason("").is_err());
        assert!(check_flag_reason(&"x".repeat(201)).is_err());
    }
}
