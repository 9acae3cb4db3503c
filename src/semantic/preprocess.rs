//! Text preparation for embedding generation.
//!
//! Items are embedded as:
//! 1. Trim whitespace
//! 2. Skip if both title and description are empty
//! 3. Concatenate with separator
//!
//! Truncation to the provider's character budget happens in the embedder so
//! queries and item text share the same limit.

/// Ellipsis suffix when content is truncated
const TRUNCATION_SUFFIX: &str = "...";

/// Build the text embedded for an item.
///
/// Returns `None` if both title and description are empty after trimming.
pub fn item_text(title: &str, description: &str) -> Option<String> {
    let title = title.trim();
    let description = description.trim();

    if title.is_empty() && description.is_empty() {
        return None;
    }

    let content = if title.is_empty() {
        description.to_string()
    } else if description.is_empty() {
        title.to_string()
    } else {
        format!("{} - {}", title, description)
    };

    Some(content)
}

/// Cut `content` to at most `max_chars` characters, adding an ellipsis when
/// something was dropped. Counts chars, so UTF-8 sequences are never split.
pub fn truncate_chars(content: &str, max_chars: usize) -> String {
    if content.chars().count() <= max_chars {
        return content.to_string();
    }

    let keep = max_chars.saturating_sub(TRUNCATION_SUFFIX.len());
    let truncated: String = content.chars().take(keep).collect();

    format!("{}{}", truncated, TRUNCATION_SUFFIX)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_content_returns_none() {
        assert!(item_text("", "").is_none());
        assert!(item_text("   ", "   ").is_none());
        assert!(item_text("\n\t", "  \r\n").is_none());
    }

    #[test]
    fn test_title_only() {
        assert_eq!(item_text("Hello World", ""), Some("Hello World".to_string()));
    }

    #[test]
    fn test_description_only() {
        assert_eq!(
            item_text("", "A description"),
            Some("A description".to_string())
        );
    }

    #[test]
    fn test_both_title_and_description() {
        assert_eq!(
            item_text("  Title  ", "  Description  "),
            Some("Title - Description".to_string())
        );
    }

    #[test]
    fn test_truncation() {
        let long_content = "x".repeat(600);
        let content = truncate_chars(&long_content, 512);

        assert_eq!(content.chars().count(), 512);
        assert!(content.ends_with(TRUNCATION_SUFFIX));
    }

    #[test]
    fn test_truncation_respects_multibyte_chars() {
        let content = truncate_chars(&"ж".repeat(20), 10);
        assert_eq!(content.chars().count(), 10);
        assert!(content.starts_with("жжжжжжж"));
    }

    #[test]
    fn test_no_truncation_for_short_content() {
        assert_eq!(truncate_chars("Short title", 512), "Short title");
    }
}
