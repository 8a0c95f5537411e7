//! Regulation tier inference and regulator abbreviation expansion.

use std::collections::HashSet;
use std::sync::Arc;

use fxb_adapters::slugify;
use fxb_core::{Broker, RegulationTier};
use serde::{Deserialize, Serialize};

use crate::rules::LookupTables;

/// Which rule produced a tier.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ClassificationBasis {
    BrokerTable { pattern: String },
    PropMarker { marker: String },
    CryptoMarker { marker: String },
    Regulators { codes: Vec<String> },
    LegacyDefault,
    NoEvidence,
}

impl ClassificationBasis {
    pub fn label(&self) -> String {
        match self {
            ClassificationBasis::BrokerTable { pattern } => format!("broker table `{pattern}`"),
            ClassificationBasis::PropMarker { marker } => format!("prop marker `{marker}`"),
            ClassificationBasis::CryptoMarker { marker } => format!("crypto marker `{marker}`"),
            ClassificationBasis::Regulators { codes } => format!("regulators {}", codes.join(", ")),
            ClassificationBasis::LegacyDefault => "legacy tier2 default".to_string(),
            ClassificationBasis::NoEvidence => "no evidence".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Classification {
    pub tier: RegulationTier,
    pub basis: ClassificationBasis,
}

pub struct TierClassifier {
    tables: Arc<LookupTables>,
}

impl TierClassifier {
    pub fn new(tables: Arc<LookupTables>) -> Self {
        Self { tables }
    }

    /// Same inputs always give the same tier. Returns `Unknown` rather than
    /// guessing unless the tables opt into the legacy tier2 default.
    pub fn classify(&self, slug: &str, name: &str, regulations: Option<&[String]>) -> Classification {
        let slug = slug.trim().to_lowercase();
        let name_slug = slugify(name);

        if let Some(rule) = self
            .tables
            .broker_tiers
            .iter()
            .find(|rule| slug.contains(&rule.pattern) || name_slug.contains(&rule.pattern))
        {
            return Classification {
                tier: rule.tier,
                basis: ClassificationBasis::BrokerTable {
                    pattern: rule.pattern.clone(),
                },
            };
        }

        let haystack = format!("{slug} {}", name.to_lowercase());
        if let Some(marker) = self.tables.prop_markers.iter().find(|m| haystack.contains(m.as_str())) {
            return Classification {
                tier: RegulationTier::Unregulated,
                basis: ClassificationBasis::PropMarker {
                    marker: marker.clone(),
                },
            };
        }
        if let Some(marker) = self.tables.crypto_markers.iter().find(|m| haystack.contains(m.as_str())) {
            return Classification {
                tier: RegulationTier::Tier2,
                basis: ClassificationBasis::CryptoMarker {
                    marker: marker.clone(),
                },
            };
        }

        if let Some(classification) = regulations.and_then(|list| self.from_regulators(list)) {
            return classification;
        }

        if self.tables.legacy_default_tier2 {
            Classification {
                tier: RegulationTier::Tier2,
                basis: ClassificationBasis::LegacyDefault,
            }
        } else {
            Classification {
                tier: RegulationTier::Unknown,
                basis: ClassificationBasis::NoEvidence,
            }
        }
    }

    pub fn classify_broker(&self, broker: &Broker) -> Classification {
        self.classify(&broker.slug, &broker.name, Some(broker.regulations.as_slice()))
    }

    /// Strongest tier among recognised regulators; codes are listed strongest first.
    fn from_regulators(&self, regulations: &[String]) -> Option<Classification> {
        let mut seen = HashSet::new();
        let mut found = regulations
            .iter()
            .filter_map(|entry| self.tables.regulator_for(entry))
            .filter(|r| seen.insert(r.code.as_str()))
            .collect::<Vec<_>>();
        if found.is_empty() {
            return None;
        }
        found.sort_by_key(|r| r.tier.strength_rank());
        let tier = found[0].tier;
        Some(Classification {
            tier,
            basis: ClassificationBasis::Regulators {
                codes: found.iter().map(|r| r.code.clone()).collect(),
            },
        })
    }

    /// Full regulator name for display, e.g. `FCA` to `Financial Conduct Authority (UK)`.
    pub fn expand_regulator(&self, entry: &str) -> Option<&str> {
        self.tables.regulator_for(entry).map(|r| r.name.as_str())
    }

    /// Expands every recognised entry and leaves the rest untouched.
    pub fn expand_regulations(&self, regulations: &[String]) -> Vec<String> {
        regulations
            .iter()
            .map(|entry| {
                self.expand_regulator(entry)
                    .map(str::to_string)
                    .unwrap_or_else(|| entry.trim().to_string())
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn classifier() -> TierClassifier {
        TierClassifier::new(Arc::new(LookupTables::builtin().unwrap()))
    }

    fn regs(values: &[&str]) -> Vec<String> {
        values.iter().map(|v| v.to_string()).collect()
    }

    #[test]
    fn curated_table_wins_over_markers_and_regulators() {
        let c = classifier();
        let result = c.classify("ig-markets", "IG Markets", Some(regs(&["FSA Seychelles"]).as_slice()));
        assert_eq!(result.tier, RegulationTier::Tier1);
        assert_eq!(
            result.basis,
            ClassificationBasis::BrokerTable {
                pattern: "ig-markets".to_string()
            }
        );
    }

    #[test]
    fn table_is_consulted_on_name_when_slug_is_opaque() {
        let result = classifier().classify("b-1042", "Pepperstone UK", None);
        assert_eq!(result.tier, RegulationTier::Tier1);
    }

    #[test]
    fn prop_firms_are_unregulated() {
        let result = classifier().classify("apex-trader-funding", "Apex Trader Funding", None);
        assert_eq!(result.tier, RegulationTier::Unregulated);
        assert_eq!(
            result.basis,
            ClassificationBasis::PropMarker {
                marker: "funding".to_string()
            }
        );
    }

    #[test]
    fn crypto_exchanges_are_tier2() {
        let result = classifier().classify("bybit", "Bybit", Some(regs(&["VFSC"]).as_slice()));
        assert_eq!(result.tier, RegulationTier::Tier2);
        assert!(matches!(result.basis, ClassificationBasis::CryptoMarker { .. }));
    }

    #[test]
    fn strongest_listed_regulator_decides() {
        let result = classifier().classify(
            "acme-fx",
            "Acme FX",
            Some(regs(&["FSA Seychelles", "CySEC", "FCA (UK)", "fca"]).as_slice()),
        );
        assert_eq!(result.tier, RegulationTier::Tier1);
        assert_eq!(
            result.basis,
            ClassificationBasis::Regulators {
                codes: regs(&["FCA", "CySEC", "FSA Seychelles"])
            }
        );
    }

    #[test]
    fn repeated_regulator_is_listed_once() {
        let result = classifier().classify(
            "acme-fx",
            "Acme FX",
            Some(regs(&["FCA", "ASIC", "FCA (UK)"]).as_slice()),
        );
        assert_eq!(
            result.basis,
            ClassificationBasis::Regulators {
                codes: regs(&["FCA", "ASIC"])
            }
        );
    }

    #[test]
    fn no_evidence_is_unknown_not_tier2() {
        let result = classifier().classify("acme-fx", "Acme FX", Some(regs(&["Some Local Body"]).as_slice()));
        assert_eq!(result.tier, RegulationTier::Unknown);
        assert_eq!(result.basis, ClassificationBasis::NoEvidence);
        assert!(!result.tier.is_storable());
    }

    #[test]
    fn legacy_switch_restores_tier2_default() {
        let mut tables = LookupTables::builtin().unwrap();
        tables.legacy_default_tier2 = true;
        let result = TierClassifier::new(Arc::new(tables)).classify("acme-fx", "Acme FX", None);
        assert_eq!(result.tier, RegulationTier::Tier2);
        assert_eq!(result.basis, ClassificationBasis::LegacyDefault);
    }

    #[test]
    fn classification_is_deterministic() {
        let c = classifier();
        let inputs = [
            ("fxtm", "FXTM", regs(&["CySEC"])),
            ("acme-prop", "Acme Prop", regs(&[])),
            ("zenith", "Zenith", regs(&["ASIC", "VFSC"])),
            ("nobody", "Nobody", regs(&[])),
        ];
        for (slug, name, list) in &inputs {
            let first = c.classify(slug, name, Some(list.as_slice()));
            for _ in 0..5 {
                assert_eq!(c.classify(slug, name, Some(list.as_slice())), first);
            }
        }
    }

    #[test]
    fn abbreviations_expand_for_display_only() {
        let c = classifier();
        assert_eq!(c.expand_regulator("FCA"), Some("Financial Conduct Authority (UK)"));
        assert_eq!(
            c.expand_regulations(&regs(&["ASIC", " Local Body "])),
            regs(&["Australian Securities and Investments Commission", "Local Body"])
        );
    }
}
