//! Input adapters: logo directories, scraped broker directory pages, seed bundles.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use scraper::{Html, Selector};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;
use uuid::Uuid;

mod names;

pub use names::{clean_display_name, extract_candidate_name, slugify};

pub const CRATE_NAME: &str = "fxb-adapters";

pub const LOGO_EXTENSIONS: [&str; 6] = ["png", "jpg", "jpeg", "webp", "svg", "gif"];

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("{0}")]
    Message(String),
    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
}

/// One raw label waiting to be matched against the broker table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceItem {
    pub item_id: Uuid,
    pub source_id: String,
    pub raw_label: String,
    pub extracted_name: String,
    pub path: Option<PathBuf>,
    pub content_type: Option<String>,
}

impl SourceItem {
    pub fn new(source_id: &str, raw_label: &str) -> Self {
        Self {
            item_id: deterministic_item_id(source_id, raw_label),
            source_id: source_id.to_string(),
            raw_label: raw_label.to_string(),
            extracted_name: extract_candidate_name(raw_label),
            path: None,
            content_type: None,
        }
    }
}

pub fn deterministic_item_id(source_id: &str, raw_label: &str) -> Uuid {
    Uuid::new_v5(
        &Uuid::NAMESPACE_URL,
        format!("{source_id}:{raw_label}").as_bytes(),
    )
}

pub trait LabelSource {
    fn source_id(&self) -> &str;
    fn load_items(&self) -> Result<Vec<SourceItem>, AdapterError>;
}

pub fn content_type_for_extension(ext: &str) -> Option<&'static str> {
    match ext.to_ascii_lowercase().as_str() {
        "png" => Some("image/png"),
        "jpg" | "jpeg" => Some("image/jpeg"),
        "webp" => Some("image/webp"),
        "svg" => Some("image/svg+xml"),
        "gif" => Some("image/gif"),
        _ => None,
    }
}

/// A directory of logo images named after the brokers they belong to.
#[derive(Debug, Clone)]
pub struct LogoDirectory {
    dir: PathBuf,
}

impl LogoDirectory {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }
}

impl LabelSource for LogoDirectory {
    fn source_id(&self) -> &str {
        "logo-directory"
    }

    /// Image files only, sorted by filename so runs are reproducible.
    fn load_items(&self) -> Result<Vec<SourceItem>, AdapterError> {
        let entries = fs::read_dir(&self.dir)
            .with_context(|| format!("reading logo directory {}", self.dir.display()))?;
        let mut items = Vec::new();
        for entry in entries {
            let entry = entry.with_context(|| format!("listing {}", self.dir.display()))?;
            let path = entry.path();
            if !path.is_file() {
                continue;
            }
            let Some(ext) = path.extension().map(|e| e.to_string_lossy().to_ascii_lowercase()) else {
                continue;
            };
            if !LOGO_EXTENSIONS.contains(&ext.as_str()) {
                continue;
            }
            let file_name = entry.file_name().to_string_lossy().to_string();
            let mut item = SourceItem::new(self.source_id(), &file_name);
            item.content_type = content_type_for_extension(&ext).map(str::to_string);
            item.path = Some(path);
            items.push(item);
        }
        items.sort_by(|a, b| a.raw_label.cmp(&b.raw_label));
        Ok(items)
    }
}

pub fn read_logo_bytes(path: impl AsRef<Path>) -> Result<Vec<u8>> {
    let path = path.as_ref();
    fs::read(path).with_context(|| format!("reading logo {}", path.display()))
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawArtifact {
    pub content_type: String,
    pub path: Option<String>,
    pub inline_text: Option<String>,
}

/// Saved copy of a broker directory page plus the selector that finds broker labels.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScrapeBundle {
    pub source_id: String,
    pub captured_from_url: String,
    pub fetched_at: DateTime<Utc>,
    pub label_selector: String,
    #[serde(default)]
    pub label_attr: Option<String>,
    pub raw_artifact: RawArtifact,
    #[serde(default)]
    pub notes: Option<String>,
}

pub fn load_scrape_bundle(path: impl AsRef<Path>) -> Result<ScrapeBundle> {
    let path = path.as_ref();
    let mut bundle: ScrapeBundle = read_json_file(path)?;
    hydrate_inline_raw_artifact(path, &mut bundle.raw_artifact)?;
    Ok(bundle)
}

fn read_json_file<T: DeserializeOwned>(path: impl AsRef<Path>) -> Result<T> {
    let path = path.as_ref();
    let data = fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    serde_json::from_str(&data).with_context(|| format!("parsing {}", path.display()))
}

fn hydrate_inline_raw_artifact(bundle_path: &Path, artifact: &mut RawArtifact) -> Result<()> {
    if artifact.inline_text.is_some() {
        return Ok(());
    }
    let Some(rel_path) = &artifact.path else {
        return Ok(());
    };
    let raw_path = bundle_path
        .parent()
        .unwrap_or_else(|| Path::new("."))
        .join(rel_path);
    if !raw_path.exists() {
        return Ok(());
    }
    let raw = fs::read_to_string(&raw_path)
        .with_context(|| format!("reading raw artifact {}", raw_path.display()))?;
    artifact.inline_text = Some(raw);
    Ok(())
}

fn text_or_none(value: String) -> Option<String> {
    let trimmed = value.split_whitespace().collect::<Vec<_>>().join(" ");
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed)
    }
}

fn select_all_texts(document: &Html, selector: &str) -> Result<Vec<String>, AdapterError> {
    let sel = Selector::parse(selector).map_err(|e| AdapterError::Message(e.to_string()))?;
    Ok(document
        .select(&sel)
        .filter_map(|n| text_or_none(n.text().collect::<String>()))
        .collect())
}

fn select_all_attrs(document: &Html, selector: &str, attr: &str) -> Result<Vec<String>, AdapterError> {
    let sel = Selector::parse(selector).map_err(|e| AdapterError::Message(e.to_string()))?;
    Ok(document
        .select(&sel)
        .filter_map(|n| n.value().attr(attr))
        .filter_map(|s| text_or_none(s.to_string()))
        .collect())
}

/// Broker labels found on a scraped page, in document order, without repeats.
pub fn scrape_labels(html: &str, selector: &str, attr: Option<&str>) -> Result<Vec<String>, AdapterError> {
    let document = Html::parse_document(html);
    let labels = match attr {
        Some(attr) => select_all_attrs(&document, selector, attr)?,
        None => select_all_texts(&document, selector)?,
    };
    let mut seen = std::collections::HashSet::new();
    Ok(labels
        .into_iter()
        .filter(|label| seen.insert(label.to_lowercase()))
        .collect())
}

impl LabelSource for ScrapeBundle {
    fn source_id(&self) -> &str {
        &self.source_id
    }

    fn load_items(&self) -> Result<Vec<SourceItem>, AdapterError> {
        let Some(html) = self.raw_artifact.inline_text.as_deref() else {
            return Err(AdapterError::Message(format!(
                "scrape bundle {} has no page content",
                self.source_id
            )));
        };
        let labels = scrape_labels(html, &self.label_selector, self.label_attr.as_deref())?;
        Ok(labels
            .iter()
            .map(|label| SourceItem::new(&self.source_id, label))
            .collect())
    }
}

/// Broker rows captured for seeding a fresh table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SeedBundle {
    pub bundle_id: String,
    #[serde(default)]
    pub captured_from: Option<String>,
    pub fetched_at: DateTime<Utc>,
    pub brokers: Vec<JsonValue>,
}

pub fn load_seed_bundle(path: impl AsRef<Path>) -> Result<SeedBundle> {
    read_json_file(path)
}

/// Trims names and fills in missing slugs so rows can be upserted by slug.
pub fn prepare_seed_rows(bundle: &SeedBundle) -> Vec<JsonValue> {
    bundle
        .brokers
        .iter()
        .cloned()
        .map(|mut row| {
            if let Some(map) = row.as_object_mut() {
                let name = map
                    .get("name")
                    .and_then(|v| v.as_str())
                    .map(|n| n.split_whitespace().collect::<Vec<_>>().join(" "));
                if let Some(name) = name {
                    let has_slug = map
                        .get("slug")
                        .and_then(|v| v.as_str())
                        .map(|s| !s.trim().is_empty())
                        .unwrap_or(false);
                    if !has_slug {
                        map.insert("slug".to_string(), JsonValue::String(slugify(&name)));
                    }
                    map.insert("name".to_string(), JsonValue::String(name));
                }
            }
            row
        })
        .collect()
}
