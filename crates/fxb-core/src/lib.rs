//! Core domain model for the forex broker directory pipeline.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map as JsonMap, Value as JsonValue};

pub const CRATE_NAME: &str = "fxb-core";

/// Opaque broker identifier; the hosted store hands out either integers or uuids.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum BrokerId {
    Int(i64),
    Text(String),
}

impl fmt::Display for BrokerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BrokerId::Int(v) => write!(f, "{v}"),
            BrokerId::Text(v) => f.write_str(v),
        }
    }
}

impl From<i64> for BrokerId {
    fn from(value: i64) -> Self {
        BrokerId::Int(value)
    }
}

impl From<&str> for BrokerId {
    fn from(value: &str) -> Self {
        BrokerId::Text(value.to_string())
    }
}

/// Coarse regulatory strength of a broker.
///
/// `Unknown` is what the classifier reports when nothing in the lookup tables
/// applies. It is never persisted: only the other four values are valid in the
/// `regulation_tier` column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RegulationTier {
    Tier1,
    Tier2,
    Tier3,
    Unregulated,
    Unknown,
}

impl RegulationTier {
    pub const STORED_VALUES: [&'static str; 4] = ["tier1", "tier2", "tier3", "unregulated"];

    pub fn as_str(&self) -> &'static str {
        match self {
            RegulationTier::Tier1 => "tier1",
            RegulationTier::Tier2 => "tier2",
            RegulationTier::Tier3 => "tier3",
            RegulationTier::Unregulated => "unregulated",
            RegulationTier::Unknown => "unknown",
        }
    }

    pub fn is_storable(&self) -> bool {
        !matches!(self, RegulationTier::Unknown)
    }

    /// Lower rank is stronger oversight.
    pub fn strength_rank(&self) -> u8 {
        match self {
            RegulationTier::Tier1 => 0,
            RegulationTier::Tier2 => 1,
            RegulationTier::Tier3 => 2,
            RegulationTier::Unregulated => 3,
            RegulationTier::Unknown => 4,
        }
    }
}

impl fmt::Display for RegulationTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownTier(pub String);

impl fmt::Display for UnknownTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown regulation tier `{}`", self.0)
    }
}

impl std::error::Error for UnknownTier {}

impl FromStr for RegulationTier {
    type Err = UnknownTier;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "tier1" => Ok(RegulationTier::Tier1),
            "tier2" => Ok(RegulationTier::Tier2),
            "tier3" => Ok(RegulationTier::Tier3),
            "unregulated" => Ok(RegulationTier::Unregulated),
            "unknown" => Ok(RegulationTier::Unknown),
            other => Err(UnknownTier(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Fees {
    #[serde(default)]
    pub commission: Option<String>,
    #[serde(default)]
    pub deposit_fee: Option<String>,
    #[serde(default)]
    pub withdrawal_fee: Option<String>,
    #[serde(default)]
    pub inactivity_fee: Option<String>,
}

/// Canonical broker row as stored in the `brokers` table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Broker {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<BrokerId>,
    pub name: String,
    #[serde(default)]
    pub slug: String,
    #[serde(default)]
    pub country: Option<String>,
    #[serde(default)]
    pub established_year: Option<i32>,
    #[serde(default)]
    pub min_deposit: Option<f64>,
    #[serde(default)]
    pub spreads_avg: Option<f64>,
    #[serde(default)]
    pub leverage_max: Option<String>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub platforms: Vec<String>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub instruments: Vec<String>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub regulations: Vec<String>,
    #[serde(default)]
    pub regulation_tier: Option<RegulationTier>,
    #[serde(default)]
    pub trust_score: Option<i64>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub fees: Fees,
    #[serde(default, deserialize_with = "null_as_default")]
    pub pros: Vec<String>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub cons: Vec<String>,
    #[serde(default)]
    pub logo_url: Option<String>,
    #[serde(default)]
    pub website_url: Option<String>,
    #[serde(default = "default_active")]
    pub is_active: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
}

fn default_active() -> bool {
    true
}

fn null_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

impl Broker {
    pub fn new(name: impl Into<String>, slug: impl Into<String>) -> Self {
        Self {
            id: None,
            name: name.into(),
            slug: slug.into(),
            country: None,
            established_year: None,
            min_deposit: None,
            spreads_avg: None,
            leverage_max: None,
            platforms: Vec::new(),
            instruments: Vec::new(),
            regulations: Vec::new(),
            regulation_tier: None,
            trust_score: None,
            fees: Fees::default(),
            pros: Vec::new(),
            cons: Vec::new(),
            logo_url: None,
            website_url: None,
            is_active: true,
            created_at: None,
            updated_at: None,
        }
    }

    pub fn reference(&self) -> BrokerRef {
        BrokerRef {
            id: self.id.clone(),
            slug: self.slug.clone(),
            name: self.name.clone(),
        }
    }
}

/// Lightweight pointer to a broker used in reports and review lists.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BrokerRef {
    pub id: Option<BrokerId>,
    pub slug: String,
    pub name: String,
}

impl BrokerRef {
    /// Builds a reference from a raw store row, tolerating missing or mistyped fields.
    pub fn from_row(row: &JsonValue) -> Self {
        let id = row
            .get("id")
            .and_then(|v| serde_json::from_value::<BrokerId>(v.clone()).ok());
        let text = |key: &str| {
            row.get(key)
                .and_then(|v| v.as_str())
                .unwrap_or_default()
                .to_string()
        };
        Self {
            id,
            slug: text("slug"),
            name: text("name"),
        }
    }
}

impl fmt::Display for BrokerRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.id {
            Some(id) => write!(f, "{} [{}] #{}", self.name, self.slug, id),
            None => write!(f, "{} [{}]", self.name, self.slug),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MatchType {
    Name,
    Slug,
}

impl MatchType {
    pub fn as_str(&self) -> &'static str {
        match self {
            MatchType::Name => "name",
            MatchType::Slug => "slug",
        }
    }
}

/// Ephemeral scoring result pairing an extracted label with a known broker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatchCandidate {
    pub extracted_name: String,
    pub broker: BrokerRef,
    pub broker_index: usize,
    pub score: f64,
    #[serde(rename = "matchType")]
    pub match_type: MatchType,
}

/// Column-level changes applied to a single broker in one round-trip.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FieldChanges(JsonMap<String, JsonValue>);

impl FieldChanges {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(mut self, column: impl Into<String>, value: impl Serialize) -> Self {
        self.insert(column, value);
        self
    }

    pub fn insert(&mut self, column: impl Into<String>, value: impl Serialize) {
        let value = serde_json::to_value(value).unwrap_or(JsonValue::Null);
        self.0.insert(column.into(), value);
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn columns(&self) -> impl Iterator<Item = &str> {
        self.0.keys().map(String::as_str)
    }

    pub fn get(&self, column: &str) -> Option<&JsonValue> {
        self.0.get(column)
    }

    pub fn as_map(&self) -> &JsonMap<String, JsonValue> {
        &self.0
    }

    pub fn into_value(self) -> JsonValue {
        JsonValue::Object(self.0)
    }
}

impl From<JsonMap<String, JsonValue>> for FieldChanges {
    fn from(value: JsonMap<String, JsonValue>) -> Self {
        Self(value)
    }
}
