//! Title normalization and similarity scoring.
//!
//! Provider titles arrive with release-group tags, episode counts and
//! dub/sub markers attached; Jikan wants the bare series title. The
//! similarity score is used both to re-rank search results and to pick
//! the dubbed counterpart of a series.

/// Strips leading `[...]`/`(...)` tags, trailing `(... episodes)` /
/// `(Dub)` / `(Sub)` annotations and trailing noise characters.
pub fn clean_title(title: &str) -> String {
    let mut cleaned = title.to_string();

    loop {
        let trimmed = cleaned.trim_start();
        if let Some(rest) = trimmed.strip_prefix('[') {
            if let Some(end) = rest.find(']') {
                cleaned = rest[end + 1..].to_string();
                continue;
            }
        } else if let Some(rest) = trimmed.strip_prefix('(') {
            if let Some(end) = rest.find(')') {
                cleaned = rest[end + 1..].to_string();
                continue;
            }
        }
        break;
    }

    // Drop a trailing parenthesized annotation when it carries episode
    // or dub/sub info, e.g. "Naruto (220 episodes)" or "Bleach (Dub)".
    if let Some(idx) = cleaned.rfind('(') {
        let tail = cleaned[idx..].to_ascii_lowercase();
        if tail.contains("episode")
            || tail.contains("eps")
            || tail.contains("dub")
            || tail.contains("sub")
        {
            cleaned.truncate(idx);
        }
    }

    let cleaned = cleaned
        .trim()
        .trim_end_matches(':')
        .trim_end_matches('-')
        .trim_end_matches('*');
    cleaned.trim().to_string()
}

/// Canonical form for title comparison: lowercase, ASCII alphanumerics
/// and spaces only, whitespace collapsed.
pub fn normalize_title(title: &str) -> String {
    let lowered: String = title
        .to_lowercase()
        .chars()
        .filter(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || *c == ' ')
        .collect();
    lowered.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Similarity score in `0..=100` between two titles.
///
/// Exact normalized match scores 100; one title containing the other
/// scores 80 minus the length difference; anything else scores 0.
pub fn similarity(source: &str, target: &str) -> i32 {
    let a = normalize_title(source);
    let b = normalize_title(target);

    if a.is_empty() || b.is_empty() {
        return 0;
    }
    if a == b {
        return 100;
    }
    if a.contains(&b) || b.contains(&a) {
        let diff = (a.len() as i32 - b.len() as i32).abs();
        return (80 - diff).max(0);
    }
    0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cleans_leading_tags() {
        assert_eq!(clean_title("[HorribleSubs] Spy x Family"), "Spy x Family");
        assert_eq!(clean_title("(TV) Monster"), "Monster");
    }

    #[test]
    fn cleans_trailing_annotations() {
        assert_eq!(clean_title("Naruto (220 episodes)"), "Naruto");
        assert_eq!(clean_title("Bleach (Dub)"), "Bleach");
        assert_eq!(clean_title("One Piece (Sub)"), "One Piece");
        assert_eq!(clean_title("Mushoku Tensei*"), "Mushoku Tensei");
        assert_eq!(clean_title("Frieren: "), "Frieren");
    }

    #[test]
    fn keeps_plain_titles() {
        assert_eq!(clean_title("Cowboy Bebop"), "Cowboy Bebop");
    }

    #[test]
    fn normalizes_symbols_and_whitespace() {
        assert_eq!(normalize_title("SPY×FAMILY!!"), "spyfamily");
        assert_eq!(normalize_title("  Spy   x  Family "), "spy x family");
    }

    #[test]
    fn identical_titles_score_100() {
        assert_eq!(similarity("Spy x Family", "Spy x Family"), 100);
    }

    #[test]
    fn containment_scores_80_minus_length_diff() {
        // "spy x family part 2" is 7 bytes longer than "spy x family".
        assert_eq!(similarity("Spy x Family", "Spy x Family Part 2"), 73);
    }

    #[test]
    fn unrelated_titles_score_0() {
        assert_eq!(similarity("Spy x Family", "Totally Unrelated"), 0);
    }

    #[test]
    fn empty_titles_score_0() {
        assert_eq!(similarity("", "Anything"), 0);
        assert_eq!(similarity("!!!", "Anything"), 0);
    }
}
