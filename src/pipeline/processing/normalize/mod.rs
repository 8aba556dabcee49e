use once_cell::sync::Lazy;
use regex::Regex;

use crate::domain::EntityType;

/// Organisational forms in match priority order: canonical form and its spellings.
/// Longer forms come first so `АОЗТ` is never read as `АО`.
const LEGAL_FORMS: &[(&str, &[&str])] = &[
    ("ООО", &[r"Общество\s+с\s+ограниченной\s+ответственностью", r"О\.?О\.?О\.?"]),
    ("АОЗТ", &[r"Акционерное\s+общество\s+закрытого\s+типа", "АОЗТ"]),
    ("ЗАО", &[r"Закрытое\s+акционерное\s+общество", "ЗАО"]),
    ("ОАО", &[r"Открытое\s+акционерное\s+общество", "ОАО"]),
    ("ПАО", &[r"Публичное\s+акционерное\s+общество", "ПАО"]),
    ("НАО", &[r"Некоммерческое\s+акционерное\s+общество", "НАО"]),
    ("АО", &[r"Акционерное\s+общество", "АО"]),
    ("ИП", &[r"Индивидуальный\s+предприниматель", "ИП"]),
    ("ТОО", &[r"Товарищество\s+с\s+ограниченной\s+ответственностью", "ТОО"]),
    ("НКО", &[r"Некоммерческая\s+организация", "НКО"]),
    ("ЧП", &[r"Частное\s+предприятие", "ЧП"]),
    ("LLC", &[r"Limited\s+Liability\s+Company", "LLC"]),
    ("LLP", &[r"Limited\s+Liability\s+Partnership", "LLP"]),
    ("JSC", &[r"Joint\s+Stock\s+Company", "JSC"]),
    ("Ltd", &[r"Limited", r"Ltd\.?"]),
    ("Inc", &[r"Incorporated", r"Inc\.?"]),
];

const QUOTES: &[char] = &['"', '\'', '«', '»', '“', '”', '„'];

struct LegalFormPattern {
    canonical: &'static str,
    prefix: Regex,
    suffix: Regex,
}

static LEGAL_FORM_PATTERNS: Lazy<Vec<LegalFormPattern>> = Lazy::new(|| {
    LEGAL_FORMS
        .iter()
        .filter_map(|(canonical, spellings)| {
            let alternation = spellings.join("|");
            let prefix = Regex::new(&format!(
                r#"^(?i)\s*(?:{})(?:[\s«"“”'„]+|$)(.*)$"#,
                alternation
            ))
            .ok()?;
            let suffix = Regex::new(&format!(
                r#"^(?i)\s*[«"“”'„]?(.+?)[«"“”'„]?[\s,]+(?:{})\.?$"#,
                alternation
            ))
            .ok()?;
            Some(LegalFormPattern {
                canonical,
                prefix,
                suffix,
            })
        })
        .collect()
});

static WHITESPACE: Lazy<Option<Regex>> = Lazy::new(|| Regex::new(r"\s+").ok());

/// Trim, drop surrounding quotes and collapse runs of whitespace
pub fn cleanup(name: &str) -> String {
    let trimmed = name.trim().trim_matches(QUOTES).trim();
    match WHITESPACE.as_ref() {
        Some(re) => re.replace_all(trimmed, " ").into_owned(),
        None => trimmed.split_whitespace().collect::<Vec<_>>().join(" "),
    }
}

/// Split a counterparty name into its canonical legal form and the remaining name.
/// Returns `None` when no recognised form is present.
pub fn extract_legal_form(name: &str) -> Option<(&'static str, String)> {
    let clean = cleanup(name);
    for pattern in LEGAL_FORM_PATTERNS.iter() {
        if let Some(rest) = pattern.prefix.captures(&clean).and_then(|c| c.get(1)) {
            let rest = cleanup(rest.as_str());
            if !rest.is_empty() {
                return Some((pattern.canonical, rest));
            }
        }
    }
    for pattern in LEGAL_FORM_PATTERNS.iter() {
        if let Some(rest) = pattern.suffix.captures(&clean).and_then(|c| c.get(1)) {
            let rest = cleanup(rest.as_str());
            if !rest.is_empty() {
                return Some((pattern.canonical, rest));
            }
        }
    }
    None
}

/// Canonical spelling of a free-form legal form value (`"о.о.о."` -> `"ООО"`)
pub fn canonical_legal_form(value: &str) -> Option<&'static str> {
    let sample = format!("{} x", value.trim());
    extract_legal_form(&sample).map(|(form, _)| form)
}

/// Name with the legal form removed, used for comparisons between counterparties
pub fn strip_legal_form(name: &str) -> String {
    match extract_legal_form(name) {
        Some((_, rest)) => rest,
        None => cleanup(name),
    }
}

/// Deterministic local normalizer used for `basic` level items.
#[derive(Debug, Clone, Default)]
pub struct BasicNormalizer;

impl BasicNormalizer {
    pub fn new() -> Self {
        Self
    }

    pub fn normalize(&self, name: &str, entity_type: EntityType) -> String {
        let clean = cleanup(name);
        if clean.is_empty() {
            return clean;
        }
        match entity_type {
            EntityType::Counterparty => match extract_legal_form(&clean) {
                Some((form, rest)) => format!("{} {}", form, capitalize_words(&rest)),
                None => capitalize_words(&clean),
            },
            EntityType::Nomenclature => {
                let base = if is_shouting(&clean) {
                    clean.to_lowercase()
                } else {
                    clean
                };
                capitalize_first(&base)
            }
        }
    }
}

/// More than three letters and every letter uppercase
pub fn is_shouting(s: &str) -> bool {
    let letters: Vec<char> = s.chars().filter(|c| c.is_alphabetic()).collect();
    letters.len() > 3 && letters.iter().all(|c| c.is_uppercase())
}

fn capitalize_first(s: &str) -> String {
    let mut chars = s.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

/// Capitalizes words that are entirely lowercase; mixed-case words are kept
fn capitalize_words(s: &str) -> String {
    s.split(' ')
        .map(|w| {
            if w.chars().any(|c| c.is_uppercase()) {
                w.to_string()
            } else {
                capitalize_first(w)
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_prefix_and_suffix_forms() {
        assert_eq!(
            extract_legal_form("ООО «Ромашка»"),
            Some(("ООО", "Ромашка".to_string()))
        );
        assert_eq!(
            extract_legal_form("Общество с ограниченной ответственностью Вектор"),
            Some(("ООО", "Вектор".to_string()))
        );
        assert_eq!(
            extract_legal_form("Acme Trading, LLC"),
            Some(("LLC", "Acme Trading".to_string()))
        );
        assert_eq!(
            extract_legal_form("АОЗТ Заря"),
            Some(("АОЗТ", "Заря".to_string()))
        );
    }

    #[test]
    fn form_requires_a_word_boundary() {
        assert_eq!(extract_legal_form("Аорта медикал"), None);
        assert_eq!(strip_legal_form("Аорта медикал"), "Аорта медикал");
    }

    #[test]
    fn canonicalizes_form_values() {
        assert_eq!(canonical_legal_form("о.о.о."), Some("ООО"));
        assert_eq!(canonical_legal_form("Индивидуальный предприниматель"), Some("ИП"));
        assert_eq!(canonical_legal_form("что-то"), None);
    }

    #[test]
    fn basic_normalizer_formats_counterparties() {
        let n = BasicNormalizer::new();
        assert_eq!(n.normalize("ооо ромашка", EntityType::Counterparty), "ООО Ромашка");
        assert_eq!(n.normalize("  ип   Иванов И.И. ", EntityType::Counterparty), "ИП Иванов И.И.");
    }

    #[test]
    fn basic_normalizer_lowers_shouting_nomenclature() {
        let n = BasicNormalizer::new();
        assert_eq!(
            n.normalize("БОЛТ  М6 ОЦИНКОВАННЫЙ", EntityType::Nomenclature),
            "Болт м6 оцинкованный"
        );
        assert_eq!(n.normalize("гайка М8", EntityType::Nomenclature), "Гайка М8");
    }
}
