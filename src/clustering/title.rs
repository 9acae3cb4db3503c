//! Suggested titles for clusters.

use std::collections::HashMap;

use crate::items::Item;
use crate::semantic::lexical::tokenize;

/// How many top tokens are kept as cluster keywords
const MAX_KEYWORDS: usize = 3;

/// Pick a title for a group of items.
///
/// The title is the most frequent informative token across member titles and
/// descriptions (ties go to the token seen first), capitalised. Without any
/// informative token it falls back to the dominant source type, and then to
/// the member count.
///
/// Returns the title and up to three keywords, most frequent first.
pub fn suggest_title(members: &[Item]) -> (String, Vec<String>) {
    let keywords = top_tokens(members, MAX_KEYWORDS);

    let title = match keywords.first() {
        Some(token) => capitalize(token),
        None => match dominant(members.iter().map(|m| m.source_type.trim())) {
            Some(source_type) => format!("Related {source_type} items"),
            None => format!("Related items ({})", members.len()),
        },
    };

    (title, keywords)
}

/// Most frequent non-empty value, ties resolved by first occurrence.
pub fn dominant<'a, I>(values: I) -> Option<&'a str>
where
    I: IntoIterator<Item = &'a str>,
{
    let mut counts: HashMap<&str, (usize, usize)> = HashMap::new();
    for (pos, value) in values.into_iter().enumerate() {
        if value.is_empty() {
            continue;
        }
        counts.entry(value).or_insert((0, pos)).0 += 1;
    }

    counts
        .into_iter()
        .max_by(|a, b| a.1 .0.cmp(&b.1 .0).then_with(|| b.1 .1.cmp(&a.1 .1)))
        .map(|(value, _)| value)
}

fn top_tokens(members: &[Item], n: usize) -> Vec<String> {
    // token -> (count, first position)
    let mut counts: HashMap<String, (usize, usize)> = HashMap::new();
    let mut position = 0usize;

    for member in members {
        for token in tokenize(&member.title)
            .into_iter()
            .chain(tokenize(&member.description))
        {
            if !is_informative(&token) {
                continue;
            }
            counts.entry(token).or_insert((0, position)).0 += 1;
            position += 1;
        }
    }

    let mut ranked: Vec<(String, (usize, usize))> = counts.into_iter().collect();
    ranked.sort_by(|a, b| b.1 .0.cmp(&a.1 .0).then_with(|| a.1 .1.cmp(&b.1 .1)));
    ranked.into_iter().take(n).map(|(token, _)| token).collect()
}

fn is_informative(token: &str) -> bool {
    token.chars().count() > 2 && !token.chars().all(|c| c.is_ascii_digit())
}

fn capitalize(token: &str) -> String {
    let mut chars = token.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}
