use crate::config::QualityConfig;
use crate::domain::{EntityType, NormalizedItem, ProcessingLevel, Severity};
use crate::pipeline::processing::normalize::{canonical_legal_form, extract_legal_form, is_shouting};

/// Base score an item earns from how it was produced
pub fn base_score(item: &NormalizedItem) -> f64 {
    match item.processing_level {
        ProcessingLevel::BenchmarkMatched => 1.0,
        ProcessingLevel::AiNormalized => item.ai_confidence.unwrap_or(0.7),
        ProcessingLevel::Basic => 0.5,
    }
}

/// One violation found by a rule
#[derive(Debug, Clone, PartialEq)]
pub struct Finding {
    pub rule: &'static str,
    pub severity: Severity,
    pub category: &'static str,
    pub description: String,
}

impl Finding {
    fn new(rule: &'static str, severity: Severity, category: &'static str, description: impl Into<String>) -> Self {
        Self {
            rule,
            severity,
            category,
            description: description.into(),
        }
    }
}

/// A validation rule yields at most one finding per item
pub trait ValidationRule: Send + Sync {
    fn id(&self) -> &'static str;
    fn check(&self, item: &NormalizedItem, config: &QualityConfig) -> Option<Finding>;
}

pub fn default_rules() -> Vec<Box<dyn ValidationRule>> {
    vec![
        Box::new(RequiredName),
        Box::new(RequiredCategory),
        Box::new(NameFormat),
        Box::new(InnChecksum),
        Box::new(KppFormat),
        Box::new(LegalFormConsistency),
        Box::new(LowConfidence),
    ]
}

pub struct RequiredName;

impl ValidationRule for RequiredName {
    fn id(&self) -> &'static str {
        "required_name"
    }

    fn check(&self, item: &NormalizedItem, config: &QualityConfig) -> Option<Finding> {
        let len = item.normalized_name.trim().chars().count();
        if len == 0 {
            Some(Finding::new(self.id(), Severity::Critical, "completeness", "name is empty"))
        } else if len < config.min_name_length {
            Some(Finding::new(
                self.id(),
                Severity::Error,
                "completeness",
                format!("name is shorter than {} characters", config.min_name_length),
            ))
        } else {
            None
        }
    }
}

pub struct RequiredCategory;

impl ValidationRule for RequiredCategory {
    fn id(&self) -> &'static str {
        "required_category"
    }

    fn check(&self, item: &NormalizedItem, config: &QualityConfig) -> Option<Finding> {
        let missing = item.category.as_deref().map_or(true, |c| c.trim().is_empty());
        (config.check_category && missing)
            .then(|| Finding::new(self.id(), Severity::Warning, "completeness", "category is missing"))
    }
}

pub struct NameFormat;

impl ValidationRule for NameFormat {
    fn id(&self) -> &'static str {
        "name_format"
    }

    fn check(&self, item: &NormalizedItem, _config: &QualityConfig) -> Option<Finding> {
        let name = &item.normalized_name;
        if name.trim().is_empty() {
            return None;
        }
        let mut problems = Vec::new();
        if name.trim() != name {
            problems.push("leading or trailing whitespace");
        }
        if name.contains("  ") {
            problems.push("repeated spaces");
        }
        if item.entity_type == EntityType::Nomenclature && is_shouting(name) {
            problems.push("all uppercase");
        }
        if name.chars().any(|c| c.is_control() || c == '\u{fffd}') {
            problems.push("invalid characters");
        }
        if problems.is_empty() {
            return None;
        }
        Some(Finding::new(
            self.id(),
            Severity::Warning,
            "format",
            format!("name formatting: {}", problems.join(", ")),
        ))
    }
}

pub struct InnChecksum;

impl ValidationRule for InnChecksum {
    fn id(&self) -> &'static str {
        "inn_checksum"
    }

    fn check(&self, item: &NormalizedItem, config: &QualityConfig) -> Option<Finding> {
        if !config.check_tax_ids {
            return None;
        }
        let inn = item.attributes.get("inn").map(|s| s.trim()).filter(|s| !s.is_empty())?;
        (!inn_is_valid(inn)).then(|| {
            Finding::new(
                self.id(),
                Severity::Error,
                "tax_id",
                format!("INN {} fails the checksum", inn),
            )
        })
    }
}

pub struct KppFormat;

impl ValidationRule for KppFormat {
    fn id(&self) -> &'static str {
        "kpp_format"
    }

    fn check(&self, item: &NormalizedItem, config: &QualityConfig) -> Option<Finding> {
        if !config.check_tax_ids {
            return None;
        }
        let kpp = item.attributes.get("kpp").map(|s| s.trim()).filter(|s| !s.is_empty())?;
        let valid = kpp.len() == 9 && kpp.chars().all(|c| c.is_ascii_digit());
        (!valid).then(|| {
            Finding::new(
                self.id(),
                Severity::Warning,
                "tax_id",
                format!("KPP {} is not 9 digits", kpp),
            )
        })
    }
}

pub struct LegalFormConsistency;

impl ValidationRule for LegalFormConsistency {
    fn id(&self) -> &'static str {
        "legal_form_consistency"
    }

    fn check(&self, item: &NormalizedItem, _config: &QualityConfig) -> Option<Finding> {
        if item.entity_type != EntityType::Counterparty {
            return None;
        }
        let declared = canonical_legal_form(item.attributes.get("legal_form")?)?;
        let (in_name, _) = extract_legal_form(&item.normalized_name)?;
        (declared != in_name).then(|| {
            Finding::new(
                self.id(),
                Severity::Warning,
                "consistency",
                format!("name says {} but legal_form is {}", in_name, declared),
            )
        })
    }
}

pub struct LowConfidence;

impl ValidationRule for LowConfidence {
    fn id(&self) -> &'static str {
        "low_confidence"
    }

    fn check(&self, item: &NormalizedItem, config: &QualityConfig) -> Option<Finding> {
        let score = base_score(item);
        (score < config.medium_tier).then(|| {
            Finding::new(
                self.id(),
                Severity::Info,
                "confidence",
                format!("confidence {:.2} is below {:.2}", score, config.medium_tier),
            )
        })
    }
}

const INN10: [u32; 9] = [2, 4, 10, 3, 5, 9, 4, 6, 8];
const INN12_FIRST: [u32; 10] = [7, 2, 4, 10, 3, 5, 9, 4, 6, 8];
const INN12_SECOND: [u32; 11] = [3, 7, 2, 4, 10, 3, 5, 9, 4, 6, 8];

fn check_digit(digits: &[u32], weights: &[u32]) -> u32 {
    let sum: u32 = digits.iter().zip(weights).map(|(d, w)| d * w).sum();
    (sum % 11) % 10
}

/// 10-digit (organisation) or 12-digit (individual) INN checksum
pub fn inn_is_valid(inn: &str) -> bool {
    let digits: Option<Vec<u32>> = inn.chars().map(|c| c.to_digit(10)).collect();
    let Some(d) = digits else {
        return false;
    };
    match d.len() {
        10 => check_digit(&d[..9], &INN10) == d[9],
        12 => check_digit(&d[..10], &INN12_FIRST) == d[10] && check_digit(&d[..11], &INN12_SECOND) == d[11],
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn counterparty(name: &str) -> NormalizedItem {
        NormalizedItem::new(1, EntityType::Counterparty, name, name, ProcessingLevel::Basic)
    }

    #[test]
    fn inn_checksums() {
        assert!(inn_is_valid("7707083893"));
        assert!(!inn_is_valid("7707083894"));
        assert!(inn_is_valid("500100732259"));
        assert!(!inn_is_valid("500100732250"));
        assert!(!inn_is_valid("77070838"));
        assert!(!inn_is_valid("77070838ab"));
    }

    #[test]
    fn tax_id_rules_fire_on_bad_values() {
        let config = QualityConfig::default();
        let mut item = counterparty("ООО Ромашка");
        item.attributes.insert("inn".into(), "7707083894".into());
        item.attributes.insert("kpp".into(), "77360100".into());
        assert_eq!(InnChecksum.check(&item, &config).unwrap().severity, Severity::Error);
        assert_eq!(KppFormat.check(&item, &config).unwrap().severity, Severity::Warning);

        item.attributes.insert("inn".into(), "7707083893".into());
        item.attributes.insert("kpp".into(), "773601001".into());
        assert!(InnChecksum.check(&item, &config).is_none());
        assert!(KppFormat.check(&item, &config).is_none());
    }

    #[test]
    fn legal_form_must_agree_with_attribute() {
        let config = QualityConfig::default();
        let mut item = counterparty("ООО Ромашка");
        item.attributes.insert("legal_form".into(), "Акционерное общество".into());
        let finding = LegalFormConsistency.check(&item, &config).unwrap();
        assert!(finding.description.contains("АО"));

        item.attributes.insert("legal_form".into(), "ооо".into());
        assert!(LegalFormConsistency.check(&item, &config).is_none());
    }

    #[test]
    fn name_rules() {
        let config = QualityConfig::default();
        let mut item = NormalizedItem::new(1, EntityType::Nomenclature, "x", "", ProcessingLevel::Basic);
        assert_eq!(RequiredName.check(&item, &config).unwrap().severity, Severity::Critical);
        item.normalized_name = "Бо".into();
        assert_eq!(RequiredName.check(&item, &config).unwrap().severity, Severity::Error);

        item.normalized_name = "БОЛТ  М6".into();
        let finding = NameFormat.check(&item, &config).unwrap();
        assert!(finding.description.contains("repeated spaces"));
        assert!(finding.description.contains("all uppercase"));

        item.normalized_name = "Болт М6".into();
        assert!(NameFormat.check(&item, &config).is_none());
    }

    #[test]
    fn low_confidence_uses_production_score() {
        let config = QualityConfig::default();
        let mut item = NormalizedItem::new(1, EntityType::Nomenclature, "a", "Болт", ProcessingLevel::AiNormalized);
        item.ai_confidence = Some(0.3);
        assert_eq!(LowConfidence.check(&item, &config).unwrap().severity, Severity::Info);
        item.processing_level = ProcessingLevel::Basic;
        assert!(LowConfidence.check(&item, &config).is_none());
    }
}
