//! Lexical (keyword) matching used when semantic search is unavailable.
//!
//! A document matches when the whole query appears in its title or
//! description, or when any informative query term does (case-insensitive
//! substring match).
//!
//! Length normalization: Description matches are weighted inversely to description
//! length to prevent long descriptions from having unfair advantage due to more
//! surface area for substring matches.

/// Words that carry no topical signal.
pub const STOP_WORDS: &[&str] = &[
    "a", "an", "the", "is", "are", "was", "were", "be", "been", "being",
    "in", "on", "at", "to", "for", "of", "with", "by", "from", "as",
    "and", "or", "but", "not", "no", "so", "if", "then", "this", "that",
    "these", "those", "it", "its", "into", "about", "we", "our", "you",
    "your", "they", "their", "i", "me", "my", "can", "will", "should",
    "would", "could", "has", "have", "had", "do", "does", "did", "all",
    "any", "some", "new", "via", "up", "out", "more", "also", "just",
];

/// A keyword hit for one document.
#[derive(Debug, Clone)]
pub struct KeywordMatch<T> {
    pub key: T,
    /// Whole query found verbatim
    pub phrase_match: bool,
    /// Number of query terms matched
    pub matched_terms: usize,
    /// Weighted score across all fields (length-normalized)
    pub total_hits: f32,
}

/// Match `(key, title, description)` documents against `query`.
///
/// # Returns
/// Matching documents sorted by relevance (phrase match first, then
/// matched_terms DESC, total_hits DESC). Ties keep input order.
pub fn score_keywords<T: Clone>(query: &str, documents: &[(T, &str, &str)]) -> Vec<KeywordMatch<T>> {
    let phrase = query.trim().to_lowercase();
    if phrase.is_empty() {
        return vec![];
    }
    let query_terms = tokenize(query);

    let mut results: Vec<KeywordMatch<T>> = documents
        .iter()
        .filter_map(|(key, title, description)| {
            let title_lower = title.to_lowercase();
            let description_lower = description.to_lowercase();

            let phrase_match =
                title_lower.contains(&phrase) || description_lower.contains(&phrase);
            let (matched_terms, total_hits) =
                count_matches(&query_terms, &title_lower, &description_lower);

            if phrase_match || matched_terms > 0 {
                Some(KeywordMatch {
                    key: key.clone(),
                    phrase_match,
                    matched_terms,
                    total_hits,
                })
            } else {
                None
            }
        })
        .collect();

    results.sort_by(|a, b| {
        b.phrase_match
            .cmp(&a.phrase_match)
            .then_with(|| b.matched_terms.cmp(&a.matched_terms))
            .then_with(|| {
                b.total_hits
                    .partial_cmp(&a.total_hits)
                    .unwrap_or(std::cmp::Ordering::Equal)
            })
    });

    results
}

/// Split into lowercase alphanumeric terms, dropping 1-char terms and stop words.
pub fn tokenize(text: &str) -> Vec<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .map(|s| s.to_lowercase())
        .filter(|s| s.chars().count() > 1 && !STOP_WORDS.contains(&s.as_str()))
        .collect()
}

/// Baseline description length for normalization (characters).
/// Descriptions at or below this length get full weight.
const DESC_LENGTH_BASELINE: f32 = 100.0;

/// - 100 chars or less: 1.0 (full weight)
/// - 270 chars: ~0.5
/// - 730 chars: ~0.33
fn description_length_weight(len: usize) -> f32 {
    if len <= DESC_LENGTH_BASELINE as usize {
        return 1.0;
    }
    1.0 / (1.0 + (len as f32 / DESC_LENGTH_BASELINE).ln())
}

/// Returns (unique_terms_matched, weighted occurrences). Inputs are lowercased.
fn count_matches(query_terms: &[String], title: &str, description: &str) -> (usize, f32) {
    let desc_weight = description_length_weight(description.len());

    let mut matched_terms = 0;
    let mut total_hits: f32 = 0.0;

    for term in query_terms {
        let mut term_hits: f32 = 0.0;

        if title.contains(term.as_str()) {
            term_hits += 2.0; // Title matches worth more
        }

        if description.contains(term.as_str()) {
            term_hits += desc_weight;
        }

        if term_hits > 0.0 {
            matched_terms += 1;
            total_hits += term_hits;
        }
    }

    (matched_terms, total_hits)
}
