//! In-memory catalog seeded with demo records

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::RwLock;
use serde_json::{json, Value};
use tracing::debug;

use super::BackingStore;
use crate::error::{Error, Result};
use crate::query::{Collection, OptimizedQuery};

/// Catalog held in process memory
pub struct InMemoryCatalog {
    records: RwLock<HashMap<Collection, Vec<Value>>>,
    fetches: AtomicU64,
    /// Artificial latency per fetch
    delay: Option<Duration>,
}

impl Default for InMemoryCatalog {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryCatalog {
    /// Empty catalog
    pub fn new() -> Self {
        Self {
            records: RwLock::new(HashMap::new()),
            fetches: AtomicU64::new(0),
            delay: None,
        }
    }

    /// Catalog with the demo venues, vendors, and packages
    pub fn seeded() -> Self {
        let catalog = Self::new();
        for record in seed_venues() {
            catalog.insert(Collection::Venues, record);
        }
        for record in seed_vendors() {
            catalog.insert(Collection::Vendors, record);
        }
        for record in seed_packages() {
            catalog.insert(Collection::Packages, record);
        }
        catalog
    }

    /// Sleep this long inside every fetch
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Add or replace a record (matched by `id`)
    pub fn insert(&self, collection: Collection, record: Value) {
        let mut records = self.records.write();
        let list = records.entry(collection).or_default();
        let id = record.get("id").cloned();
        match list.iter_mut().find(|r| id.is_some() && r.get("id") == id.as_ref()) {
            Some(existing) => *existing = record,
            None => list.push(record),
        }
    }

    /// Number of fetches served
    pub fn fetch_count(&self) -> u64 {
        self.fetches.load(Ordering::Relaxed)
    }

    /// Records in `collection`
    pub fn len(&self, collection: Collection) -> usize {
        self.records.read().get(&collection).map_or(0, Vec::len)
    }
}

#[async_trait]
impl BackingStore for InMemoryCatalog {
    async fn fetch(&self, query: &OptimizedQuery) -> Result<Vec<Value>> {
        self.fetches.fetch_add(1, Ordering::Relaxed);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        let records = self.records.read();
        let list = records
            .get(&query.collection)
            .ok_or_else(|| Error::BackingFetch(format!("collection {} is empty", query.collection)))?;
        let out = query.execute(list);
        debug!(collection = %query.collection, matched = out.len(), "In-memory catalog fetch");
        Ok(out)
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}

fn seed_venues() -> Vec<Value> {
    vec![
        json!({"id": "ven-001", "name": "Lighthouse Hall", "slug": "lighthouse-hall",
               "location": "Galle Fort, Galle", "capacity": 250, "price": 1200, "rating": 4.8,
               "amenities": ["wifi", "parking", "sea view", "catering"],
               "description": "Colonial ballroom inside the fort ramparts"}),
        json!({"id": "ven-002", "name": "Lotus Garden Pavilion", "slug": "lotus-garden-pavilion",
               "location": "Colombo 07", "capacity": 400, "price": 2500, "rating": 4.6,
               "amenities": ["wifi", "parking", "air conditioning", "stage"],
               "description": "Garden pavilion with a lotus pond"}),
        json!({"id": "ven-003", "name": "Hill Country Lodge", "slug": "hill-country-lodge",
               "location": "Kandy", "capacity": 120, "price": 900, "rating": 4.4,
               "amenities": ["parking", "pool", "accommodation"],
               "description": "Tea estate bungalow overlooking the lake"}),
        json!({"id": "ven-004", "name": "Lagoon Terrace", "slug": "lagoon-terrace",
               "location": "Negombo", "capacity": 180, "price": 1100, "rating": 4.2,
               "amenities": ["wifi", "sea view", "bar"],
               "description": "Open terrace on the lagoon"}),
        json!({"id": "ven-005", "name": "Bentota Beach Deck", "slug": "bentota-beach-deck",
               "location": "Bentota", "capacity": 90, "price": 750, "rating": 4.5,
               "amenities": ["sea view", "pool", "accommodation"],
               "description": "Beachfront deck for sunset ceremonies"}),
        json!({"id": "ven-006", "name": "Unawatuna Bay Villa", "slug": "unawatuna-bay-villa",
               "location": "Unawatuna, Galle", "capacity": 60, "price": 650, "rating": 4.7,
               "amenities": ["wifi", "pool", "sea view", "accommodation"],
               "description": "Private villa on the bay"}),
    ]
}

fn seed_vendors() -> Vec<Value> {
    vec![
        json!({"id": "vnd-001", "name": "Ceylon Blooms", "slug": "ceylon-blooms", "category": "florist",
               "location": "Colombo", "price": 300, "rating": 4.9,
               "features": ["delivery", "custom arrangements"],
               "description": "Tropical floral design"}),
        json!({"id": "vnd-002", "name": "Spice Route Catering", "slug": "spice-route-catering",
               "category": "catering", "location": "Galle", "price": 1500, "rating": 4.7,
               "features": ["vegetarian", "halal", "live stations"],
               "description": "Southern coastal cuisine"}),
        json!({"id": "vnd-003", "name": "Kandyan Drummers", "slug": "kandyan-drummers",
               "category": "entertainment", "location": "Kandy", "price": 450, "rating": 4.8,
               "features": ["traditional", "dancers"],
               "description": "Traditional drum and dance troupe"}),
        json!({"id": "vnd-004", "name": "Golden Hour Studio", "slug": "golden-hour-studio",
               "category": "photography", "location": "Colombo", "price": 1200, "rating": 4.6,
               "features": ["drone", "same day edit"],
               "description": "Wedding and event photography"}),
        json!({"id": "vnd-005", "name": "Island Sound", "slug": "island-sound", "category": "entertainment",
               "location": "Negombo", "price": 600, "rating": 4.3,
               "features": ["dj", "lighting"],
               "description": "DJ and stage lighting"}),
    ]
}

fn seed_packages() -> Vec<Value> {
    vec![
        json!({"id": "pkg-001", "name": "Fort Sunset Wedding", "slug": "fort-sunset-wedding",
               "vendorId": "vnd-002", "category": "wedding", "location": "Galle", "price": 5400,
               "capacity": 150, "features": ["catering", "decor", "photography"],
               "description": "Ceremony and dinner inside Galle Fort"}),
        json!({"id": "pkg-002", "name": "City Corporate Day", "slug": "city-corporate-day",
               "vendorId": "vnd-004", "category": "corporate", "location": "Colombo", "price": 3200,
               "capacity": 300, "features": ["av equipment", "catering"],
               "description": "Full-day conference package"}),
        json!({"id": "pkg-003", "name": "Hill Country Retreat", "slug": "hill-country-retreat",
               "vendorId": "vnd-003", "category": "retreat", "location": "Kandy", "price": 2100,
               "capacity": 40, "features": ["accommodation", "traditional"],
               "description": "Weekend retreat with cultural show"}),
        json!({"id": "pkg-004", "name": "Beach Party Night", "slug": "beach-party-night",
               "vendorId": "vnd-005", "category": "party", "location": "Bentota", "price": 1800,
               "capacity": 120, "features": ["dj", "lighting", "bar"],
               "description": "Beach party with sound and lights"}),
    ]
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::{CatalogFilter, QueryOptimizer};

    fn query(collection: Collection, filter: Value) -> OptimizedQuery {
        let filter = match filter {
            Value::Object(m) => CatalogFilter::from_map(&m).unwrap(),
            _ => unreachable!(),
        };
        QueryOptimizer::default().build_query(collection, &filter).unwrap()
    }

    #[tokio::test]
    async fn test_seeded_fetch() {
        let catalog = InMemoryCatalog::seeded();
        assert_eq!(catalog.len(Collection::Venues), 6);

        let galle = catalog
            .fetch(&query(Collection::Venues, json!({"location": "Galle"})))
            .await
            .unwrap();
        let ids: Vec<&str> = galle.iter().filter_map(|r| r["id"].as_str()).collect();
        assert_eq!(ids, vec!["ven-001", "ven-006"]);
        assert_eq!(catalog.fetch_count(), 1);

        // Projection drops unrequested fields
        assert!(galle[0].get("amenities").is_none());
        assert!(galle[0].get("name").is_some());
    }

    #[tokio::test]
    async fn test_vendor_filters() {
        let catalog = InMemoryCatalog::seeded();
        let out = catalog
            .fetch(&query(
                Collection::Vendors,
                json!({"category": "Entertainment", "sort": "-price"}),
            ))
            .await
            .unwrap();
        let ids: Vec<&str> = out.iter().filter_map(|r| r["id"].as_str()).collect();
        assert_eq!(ids, vec!["vnd-005", "vnd-003"]);
    }

    #[tokio::test]
    async fn test_insert_replaces_by_id() {
        let catalog = InMemoryCatalog::new();
        catalog.insert(Collection::Venues, json!({"id": "a", "name": "One", "location": "Galle"}));
        catalog.insert(Collection::Venues, json!({"id": "a", "name": "Two", "location": "Galle"}));
        assert_eq!(catalog.len(Collection::Venues), 1);

        let out = catalog
            .fetch(&query(Collection::Venues, json!({"fields": ["name"]})))
            .await
            .unwrap();
        assert_eq!(out, vec![json!({"id": "a", "name": "Two"})]);

        assert!(catalog
            .fetch(&query(Collection::Packages, json!({})))
            .await
            .is_err());
    }
}
