use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};
use uuid::Uuid;

use crate::{ApiClient, ApiError};

const MAPS_PATH: &str = "api/v1/maps";
const PAGE_SIZE: u32 = 100;
const MAX_PAGES: u32 = 50;
const FETCH_RETRIES: u32 = 2;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MapCatalogEntry {
    pub id: Uuid,
    pub key: String,
    #[serde(rename = "type", default)]
    pub kind: Option<String>,
    #[serde(default)]
    pub category: Option<String>,
}

#[derive(Debug, Error)]
pub enum CatalogError {
    #[error(transparent)]
    Api(#[from] ApiError),
    #[error("catalog source unavailable: {0}")]
    Unavailable(String),
}

/// Where catalog entries come from.
#[async_trait]
pub trait MapSource: Send + Sync {
    async fn fetch_all(&self) -> Result<Vec<MapCatalogEntry>, CatalogError>;
}

/// Key to id resolution. `lookup` never goes to the network.
#[async_trait]
pub trait MapCatalog: Send + Sync {
    async fn lookup(&self, map_key: &str) -> Option<MapCatalogEntry>;

    /// Re-reads the whole catalog. Returns the number of cached entries.
    async fn refresh(&self) -> Result<usize, CatalogError>;
}

pub struct CachedMapCatalog {
    source: Arc<dyn MapSource>,
    cache: RwLock<HashMap<String, MapCatalogEntry>>,
}

impl CachedMapCatalog {
    pub fn new(source: Arc<dyn MapSource>) -> Arc<Self> {
        Arc::new(Self {
            source,
            cache: RwLock::new(HashMap::new()),
        })
    }

    pub fn len(&self) -> usize {
        self.cache.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.cache.read().is_empty()
    }
}

#[async_trait]
impl MapCatalog for CachedMapCatalog {
    async fn lookup(&self, map_key: &str) -> Option<MapCatalogEntry> {
        self.cache.read().get(map_key).cloned()
    }

    async fn refresh(&self) -> Result<usize, CatalogError> {
        let entries = self.source.fetch_all().await?;
        let fresh: HashMap<String, MapCatalogEntry> = entries
            .into_iter()
            .map(|entry| (entry.key.clone(), entry))
            .collect();
        let count = fresh.len();
        *self.cache.write() = fresh;
        debug!(target: "sim.catalog", entries = count, "map catalog refreshed");
        Ok(count)
    }
}

/// Entries held in memory. Swappable at runtime so tests can model a catalog
/// that learns about a map only after a refresh.
#[derive(Default)]
pub struct StaticMapSource {
    entries: RwLock<Vec<MapCatalogEntry>>,
}

impl StaticMapSource {
    pub fn new(entries: Vec<MapCatalogEntry>) -> Arc<Self> {
        Arc::new(Self {
            entries: RwLock::new(entries),
        })
    }

    pub fn set(&self, entries: Vec<MapCatalogEntry>) {
        *self.entries.write() = entries;
    }
}

#[async_trait]
impl MapSource for StaticMapSource {
    async fn fetch_all(&self) -> Result<Vec<MapCatalogEntry>, CatalogError> {
        Ok(self.entries.read().clone())
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct MapsPage {
    #[serde(default)]
    items: Vec<MapRecord>,
    #[serde(default)]
    total_pages: u32,
}

#[derive(Debug, Deserialize)]
struct MapRecord {
    id: Uuid,
    #[serde(default)]
    key: Option<String>,
    #[serde(default)]
    title: Option<String>,
    #[serde(rename = "type", default)]
    kind: Option<String>,
    #[serde(default)]
    category: Option<String>,
    #[serde(default, rename = "isDeleted")]
    is_deleted: bool,
}

impl MapRecord {
    /// Older records only carry a title, which doubles as their key.
    fn into_entry(self) -> Option<MapCatalogEntry> {
        if self.is_deleted {
            return None;
        }
        let key = self.key.or(self.title)?;
        Some(MapCatalogEntry {
            id: self.id,
            key,
            kind: self.kind,
            category: self.category,
        })
    }
}

/// Reads the paginated `maps` endpoint page by page.
pub struct HttpMapSource {
    client: ApiClient,
}

impl HttpMapSource {
    pub fn new(client: ApiClient) -> Arc<Self> {
        Arc::new(Self { client })
    }
}

#[async_trait]
impl MapSource for HttpMapSource {
    async fn fetch_all(&self) -> Result<Vec<MapCatalogEntry>, CatalogError> {
        let mut entries = Vec::new();
        let mut page = 1;
        loop {
            let query = [("page", page.to_string()), ("size", PAGE_SIZE.to_string())];
            let body: MapsPage = self
                .client
                .get(MAPS_PATH, &query, FETCH_RETRIES)
                .await?
                .into_data()?;
            let received = body.items.len();
            entries.extend(body.items.into_iter().filter_map(MapRecord::into_entry));
            if received == 0 || page >= body.total_pages || page >= MAX_PAGES {
                break;
            }
            page += 1;
        }
        info!(target: "sim.catalog", entries = entries.len(), pages = page, "fetched map catalog");
        Ok(entries)
    }
}
