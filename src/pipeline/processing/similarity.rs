//! Fuzzy similarity primitive shared by the benchmark matcher, the taxonomy
//! matcher and duplicate detection.
//!
//! The score is the maximum of a normalized Damerau-Levenshtein similarity over
//! the whole key and an abbreviation-aware token overlap. Identical keys score 1.0.

const ABBREVIATION_WEIGHT: f64 = 0.9;
const STEM_WEIGHT: f64 = 0.85;
const MIN_ABBREVIATION_STEM: usize = 3;
const MIN_SHARED_STEM: usize = 4;
/// Combined length of the differing endings after a shared stem
const MAX_ENDING: usize = 2;

/// Case and whitespace normalized lookup key
pub fn normalize_key(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut pending_space = false;
    for ch in input.chars() {
        let ch = match ch {
            'ё' | 'Ё' => 'е',
            '"' | '\'' | '«' | '»' | '“' | '”' | '„' | '`' => ' ',
            c => c,
        };
        if ch.is_whitespace() {
            pending_space = !out.is_empty();
            continue;
        }
        if pending_space {
            out.push(' ');
            pending_space = false;
        }
        out.extend(ch.to_lowercase());
    }
    out.trim_matches(|c: char| matches!(c, ',' | ';' | ':' | '-' | ' '))
        .to_string()
}

/// Tokens of a normalized key; a trailing `.` is kept to mark abbreviations
pub fn tokens(key: &str) -> Vec<&str> {
    key.split(|c: char| c.is_whitespace() || matches!(c, ',' | ';' | ':' | '(' | ')' | '/'))
        .filter(|t| !t.is_empty() && *t != ".")
        .collect()
}

/// Similarity in [0, 1] between two raw strings
pub fn similarity(a: &str, b: &str) -> f64 {
    let ka = normalize_key(a);
    let kb = normalize_key(b);
    key_similarity(&ka, &kb)
}

/// Similarity between two already normalized keys
pub fn key_similarity(ka: &str, kb: &str) -> f64 {
    if ka == kb {
        return 1.0;
    }
    if ka.is_empty() || kb.is_empty() {
        return 0.0;
    }
    edit_similarity(ka, kb).max(token_similarity(ka, kb))
}

/// 1 - (Damerau-Levenshtein distance / longer length), counted in chars
pub fn edit_similarity(a: &str, b: &str) -> f64 {
    strsim::normalized_damerau_levenshtein(a, b)
}

/// Dice-style overlap where abbreviations and shared stems count as partial matches
pub fn token_similarity(ka: &str, kb: &str) -> f64 {
    let ta = tokens(ka);
    let tb = tokens(kb);
    if ta.is_empty() || tb.is_empty() {
        return 0.0;
    }
    let mut used = vec![false; tb.len()];
    let mut matched = 0.0;
    for a in &ta {
        let mut best: Option<(usize, f64)> = None;
        for (j, b) in tb.iter().enumerate() {
            if used[j] {
                continue;
            }
            let w = token_weight(a, b);
            if w > 0.0 && best.map_or(true, |(_, bw)| w > bw) {
                best = Some((j, w));
                if w >= 1.0 {
                    break;
                }
            }
        }
        if let Some((j, w)) = best {
            used[j] = true;
            matched += w;
        }
    }
    (2.0 * matched / (ta.len() + tb.len()) as f64).min(1.0)
}

fn token_weight(a: &str, b: &str) -> f64 {
    if a == b {
        return 1.0;
    }
    if is_abbreviation_of(a, b) || is_abbreviation_of(b, a) {
        return ABBREVIATION_WEIGHT;
    }
    let la = a.chars().count();
    let lb = b.chars().count();
    let shared = a
        .chars()
        .zip(b.chars())
        .take_while(|(x, y)| x == y)
        .count();
    if shared >= MIN_SHARED_STEM && (la - shared) + (lb - shared) <= MAX_ENDING {
        return STEM_WEIGHT;
    }
    0.0
}

/// `оцинк.` abbreviates `оцинкованный`
fn is_abbreviation_of(short: &str, long: &str) -> bool {
    let Some(stem) = short.strip_suffix('.') else {
        return false;
    };
    let stem_len = stem.chars().count();
    stem_len >= MIN_ABBREVIATION_STEM
        && long.trim_end_matches('.').chars().count() > stem_len
        && long.starts_with(stem)
}
