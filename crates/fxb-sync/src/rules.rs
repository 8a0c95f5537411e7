//! Lookup tables loaded once per run from `rules/*.yaml`.

use std::path::Path;

use anyhow::{bail, Context, Result};
use fxb_core::RegulationTier;
use regex::{Regex, RegexBuilder};
use serde::Deserialize;

const BUILTIN_TIERS: &str = include_str!("../../../rules/tiers.yaml");
const BUILTIN_REGULATORS: &str = include_str!("../../../rules/regulators.yaml");
const BUILTIN_CLEANUP: &str = include_str!("../../../rules/cleanup.yaml");

#[derive(Debug, Clone, Deserialize)]
struct TierRulesFile {
    #[allow(dead_code)]
    version: u32,
    #[serde(default)]
    legacy_default_tier2: bool,
    #[serde(default)]
    broker_tiers: Vec<BrokerTierRule>,
    #[serde(default)]
    prop_markers: Vec<String>,
    #[serde(default)]
    crypto_markers: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct RegulatorRulesFile {
    #[allow(dead_code)]
    version: u32,
    #[serde(default)]
    regulators: Vec<Regulator>,
}

#[derive(Debug, Clone, Deserialize)]
struct CleanupRulesFile {
    #[allow(dead_code)]
    version: u32,
    #[serde(default)]
    junk_name_patterns: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct BrokerTierRule {
    pub pattern: String,
    pub tier: RegulationTier,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Regulator {
    pub code: String,
    pub name: String,
    pub tier: RegulationTier,
    #[serde(default)]
    pub aliases: Vec<String>,
}

fn normalize_label(value: &str) -> String {
    value
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_uppercase()
}

impl Regulator {
    /// Whether a free-text regulation entry such as `"FCA (UK)"` names this regulator.
    pub fn matches(&self, entry: &str) -> bool {
        let entry = normalize_label(entry);
        if entry.is_empty() {
            return false;
        }
        if entry.contains(&normalize_label(&self.name)) {
            return true;
        }
        std::iter::once(&self.code)
            .chain(self.aliases.iter())
            .map(|label| normalize_label(label))
            .any(|label| {
                entry == label
                    || entry.starts_with(&format!("{label} "))
                    || entry.ends_with(&format!("({label})"))
            })
    }
}

/// Immutable classification and cleanup data shared by every job in a run.
#[derive(Debug, Clone)]
pub struct LookupTables {
    pub broker_tiers: Vec<BrokerTierRule>,
    pub prop_markers: Vec<String>,
    pub crypto_markers: Vec<String>,
    pub regulators: Vec<Regulator>,
    pub junk_name_patterns: Vec<Regex>,
    pub legacy_default_tier2: bool,
}

impl LookupTables {
    /// Tables compiled into the binary from the repository's `rules/` directory.
    pub fn builtin() -> Result<Self> {
        Self::parse(BUILTIN_TIERS, BUILTIN_REGULATORS, BUILTIN_CLEANUP)
    }

    /// Reads `rules/*.yaml` under `root`; any file that is missing falls back to the built-in copy.
    pub fn from_workspace_root(root: &Path) -> Result<Self> {
        let rules_dir = root.join("rules");
        let read = |name: &str, builtin: &str| -> Result<String> {
            let path = rules_dir.join(name);
            if path.exists() {
                std::fs::read_to_string(&path).with_context(|| format!("reading {}", path.display()))
            } else {
                Ok(builtin.to_string())
            }
        };
        Self::parse(
            &read("tiers.yaml", BUILTIN_TIERS)?,
            &read("regulators.yaml", BUILTIN_REGULATORS)?,
            &read("cleanup.yaml", BUILTIN_CLEANUP)?,
        )
    }

    pub fn parse(tiers: &str, regulators: &str, cleanup: &str) -> Result<Self> {
        let tiers: TierRulesFile = serde_yaml::from_str(tiers).context("parsing rules/tiers.yaml")?;
        let regulators: RegulatorRulesFile =
            serde_yaml::from_str(regulators).context("parsing rules/regulators.yaml")?;
        let cleanup: CleanupRulesFile =
            serde_yaml::from_str(cleanup).context("parsing rules/cleanup.yaml")?;

        for rule in &tiers.broker_tiers {
            if !rule.tier.is_storable() {
                bail!("broker tier rule `{}` maps to {}", rule.pattern, rule.tier);
            }
        }
        for regulator in &regulators.regulators {
            if !regulator.tier.is_storable() {
                bail!("regulator {} maps to {}", regulator.code, regulator.tier);
            }
        }

        let junk_name_patterns = cleanup
            .junk_name_patterns
            .iter()
            .map(|p| {
                RegexBuilder::new(p)
                    .case_insensitive(true)
                    .build()
                    .with_context(|| format!("compiling junk name pattern `{p}`"))
            })
            .collect::<Result<Vec<_>>>()?;

        let lower = |values: Vec<String>| {
            values
                .into_iter()
                .map(|v| v.trim().to_lowercase())
                .filter(|v| !v.is_empty())
                .collect::<Vec<_>>()
        };

        Ok(Self {
            broker_tiers: tiers
                .broker_tiers
                .into_iter()
                .map(|rule| BrokerTierRule {
                    pattern: rule.pattern.trim().to_lowercase(),
                    tier: rule.tier,
                })
                .collect(),
            prop_markers: lower(tiers.prop_markers),
            crypto_markers: lower(tiers.crypto_markers),
            regulators: regulators.regulators,
            junk_name_patterns,
            legacy_default_tier2: tiers.legacy_default_tier2,
        })
    }

    /// First regulator in table order named by `entry`.
    pub fn regulator_for(&self, entry: &str) -> Option<&Regulator> {
        self.regulators.iter().find(|r| r.matches(entry))
    }

    pub fn is_junk_name(&self, name: &str) -> bool {
        let name = name.trim();
        self.junk_name_patterns.iter().any(|re| re.is_match(name))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtin_tables_parse() {
        let tables = LookupTables::builtin().unwrap();
        assert!(!tables.broker_tiers.is_empty());
        assert!(tables.prop_markers.contains(&"funding".to_string()));
        assert!(tables.crypto_markers.contains(&"binance".to_string()));
        assert!(!tables.legacy_default_tier2);
        assert!(tables.regulator_for("FCA").is_some());
    }

    #[test]
    fn regulator_entries_match_codes_aliases_and_full_names() {
        let tables = LookupTables::builtin().unwrap();
        assert_eq!(tables.regulator_for("fca (uk)").unwrap().code, "FCA");
        assert_eq!(tables.regulator_for("FSC  Mauritius").unwrap().tier, RegulationTier::Tier3);
        assert_eq!(tables.regulator_for("IIROC").unwrap().code, "CIRO");
        assert_eq!(
            tables.regulator_for("Australian Securities and Investments Commission").unwrap().code,
            "ASIC"
        );
        assert_eq!(tables.regulator_for("Cyprus regulator (CySEC)").unwrap().code, "CySEC");
        assert!(tables.regulator_for("FSA").is_none());
        assert!(tables.regulator_for("  ").is_none());
    }

    #[test]
    fn junk_patterns_are_case_insensitive() {
        let tables = LookupTables::builtin().unwrap();
        assert!(tables.is_junk_name("TEST broker"));
        assert!(tables.is_junk_name("  "));
        assert!(tables.is_junk_name("N/A"));
        assert!(tables.is_junk_name("Broker 12"));
        assert!(!tables.is_junk_name("Pepperstone"));
        assert!(!tables.is_junk_name("Testarossa Markets"));
    }

    #[test]
    fn workspace_rules_override_builtin_per_file() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("rules")).unwrap();
        std::fs::write(
            dir.path().join("rules/tiers.yaml"),
            "version: 1\nlegacy_default_tier2: true\nbroker_tiers:\n  - pattern: Acme-FX\n    tier: tier3\n",
        )
        .unwrap();

        let tables = LookupTables::from_workspace_root(dir.path()).unwrap();
        assert!(tables.legacy_default_tier2);
        assert_eq!(
            tables.broker_tiers,
            vec![BrokerTierRule {
                pattern: "acme-fx".to_string(),
                tier: RegulationTier::Tier3
            }]
        );
        assert!(tables.prop_markers.is_empty());
        assert!(tables.regulator_for("ASIC").is_some());
    }

    #[test]
    fn unknown_tier_is_rejected_in_tables() {
        let err = LookupTables::parse(
            "version: 1\nbroker_tiers:\n  - pattern: acme\n    tier: unknown\n",
            BUILTIN_REGULATORS,
            BUILTIN_CLEANUP,
        )
        .unwrap_err();
        assert!(err.to_string().contains("acme"));
    }
}
