//! Per-country listing cache shared by every resolution in a run.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::OnceCell;
use tracing::{debug, info, instrument, warn};

use mineassembler_api::ProjectApi;
use mineassembler_shared::{ApiError, ProjectId, ProjectLead, RawSourceRecord};

/// All projects one country's listing returned, in listing order.
#[derive(Debug, Default)]
pub struct CountryListing {
    records: Vec<RawSourceRecord>,
    index: HashMap<ProjectId, usize>,
}

impl CountryListing {
    fn new(records: Vec<RawSourceRecord>) -> Self {
        let mut index = HashMap::with_capacity(records.len());
        for (i, record) in records.iter().enumerate() {
            // First row wins when the listing repeats a project.
            index.entry(record.identifier.clone()).or_insert(i);
        }
        Self { records, index }
    }

    pub fn get(&self, id: &ProjectId) -> Option<&RawSourceRecord> {
        self.index.get(id).map(|&i| &self.records[i])
    }

    pub fn records(&self) -> &[RawSourceRecord] {
        &self.records
    }

    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }
}

/// Fetches each country's listing at most once per process, even when many
/// resolutions ask for the same country at the same time.
pub struct ListingCache {
    api: Arc<dyn ProjectApi>,
    countries: Vec<String>,
    cells: Mutex<HashMap<String, Arc<OnceCell<Arc<CountryListing>>>>>,
}

impl ListingCache {
    /// `countries` are searched, in order, for projects whose lead names no country.
    pub fn new(api: Arc<dyn ProjectApi>, countries: Vec<String>) -> Self {
        Self {
            api,
            countries,
            cells: Mutex::new(HashMap::new()),
        }
    }

    /// The listing for `country`.
    ///
    /// Only `Unauthorized` is returned as an error. Any other failure is
    /// logged and cached as an empty listing.
    #[instrument(skip_all, fields(country = %country))]
    pub async fn country(&self, country: &str) -> Result<Arc<CountryListing>, ApiError> {
        let cell = {
            let mut cells = self.cells.lock().unwrap_or_else(|e| e.into_inner());
            cells.entry(country.to_string()).or_default().clone()
        };

        cell.get_or_try_init(|| async {
            match self.api.fetch_listing(country).await {
                Ok(records) => {
                    let listing = CountryListing::new(records);
                    info!(projects = listing.len(), "listing fetched");
                    Ok(Arc::new(listing))
                }
                Err(e @ ApiError::Unauthorized(_)) => Err(e),
                Err(e) => {
                    warn!(error = %e, "listing unavailable, continuing without it");
                    Ok(Arc::new(CountryListing::default()))
                }
            }
        })
        .await
        .cloned()
    }

    /// Find the listing row for `id`, trying `hint` first and then every
    /// configured country.
    pub async fn lookup(
        &self,
        id: &ProjectId,
        hint: Option<&str>,
    ) -> Result<Option<RawSourceRecord>, ApiError> {
        let mut tried: Vec<&str> = Vec::new();
        for country in hint.into_iter().chain(self.countries.iter().map(String::as_str)) {
            if tried.iter().any(|c| c.eq_ignore_ascii_case(country)) {
                continue;
            }
            tried.push(country);

            let listing = self.country(country).await?;
            if let Some(record) = listing.get(id) {
                debug!(gid = %id, country, "listing row found");
                return Ok(Some(record.clone()));
            }
        }
        Ok(None)
    }

    /// One lead per project in `country`'s listing.
    pub async fn leads(&self, country: &str) -> Result<Vec<ProjectLead>, ApiError> {
        let listing = self.country(country).await?;
        Ok(listing
            .records()
            .iter()
            .map(|r| ProjectLead::in_country(r.identifier.clone(), country))
            .collect())
    }

    /// Number of countries fetched so far.
    pub fn fetched(&self) -> usize {
        let cells = self.cells.lock().unwrap_or_else(|e| e.into_inner());
        cells.values().filter(|c| c.initialized()).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use mineassembler_shared::{SourceFields, SourceKind};

    struct CountingApi {
        listing_calls: AtomicUsize,
        fail_with: Option<ApiError>,
    }

    impl CountingApi {
        fn new(fail_with: Option<ApiError>) -> Arc<Self> {
            Arc::new(Self {
                listing_calls: AtomicUsize::new(0),
                fail_with,
            })
        }
    }

    #[async_trait]
    impl ProjectApi for CountingApi {
        async fn fetch_listing(&self, country: &str) -> Result<Vec<RawSourceRecord>, ApiError> {
            self.listing_calls.fetch_add(1, Ordering::SeqCst);
            tokio::task::yield_now().await;
            if let Some(e) = &self.fail_with {
                return Err(e.clone());
            }
            let gid = if country == "Australia" { "1001" } else { "2001" };
            Ok(vec![RawSourceRecord::new(
                ProjectId::new(gid),
                SourceKind::Listing,
                SourceFields {
                    stage: Some(format!("{country} stage")),
                    ..SourceFields::default()
                },
            )])
        }

        async fn fetch_relationships(&self, id: &ProjectId) -> Result<RawSourceRecord, ApiError> {
            Err(ApiError::NotFound(id.to_string()))
        }
    }

    fn countries() -> Vec<String> {
        vec!["Australia".into(), "Canada".into()]
    }

    #[tokio::test]
    async fn concurrent_lookups_fetch_once() {
        let api = CountingApi::new(None);
        let cache = Arc::new(ListingCache::new(api.clone(), countries()));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let cache = cache.clone();
            handles.push(tokio::spawn(async move {
                cache.lookup(&ProjectId::new("1001"), Some("Australia")).await
            }));
        }
        for handle in handles {
            let found = handle.await.unwrap().unwrap();
            assert_eq!(found.unwrap().fields.stage.as_deref(), Some("Australia stage"));
        }
        assert_eq!(api.listing_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn lookup_without_hint_walks_countries() {
        let api = CountingApi::new(None);
        let cache = ListingCache::new(api.clone(), countries());

        let found = cache.lookup(&ProjectId::new("2001"), None).await.unwrap();
        assert_eq!(found.unwrap().fields.stage.as_deref(), Some("Canada stage"));
        assert_eq!(cache.fetched(), 2);

        assert!(cache.lookup(&ProjectId::new("9"), None).await.unwrap().is_none());
        assert_eq!(api.listing_calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn transient_failure_caches_empty_listing() {
        let api = CountingApi::new(Some(ApiError::Transient("503".into())));
        let cache = ListingCache::new(api.clone(), countries());

        assert!(cache.lookup(&ProjectId::new("1001"), Some("Australia")).await.unwrap().is_none());
        assert!(cache.country("Australia").await.unwrap().is_empty());
        // Australia and Canada once each.
        assert_eq!(api.listing_calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn unauthorized_propagates() {
        let api = CountingApi::new(Some(ApiError::Unauthorized("/projects/filter".into())));
        let cache = ListingCache::new(api, countries());
        let err = cache.leads("Australia").await.unwrap_err();
        assert!(matches!(err, ApiError::Unauthorized(_)));
    }

    #[tokio::test]
    async fn leads_carry_country() {
        let cache = ListingCache::new(CountingApi::new(None), countries());
        let leads = cache.leads("Canada").await.unwrap();
        assert_eq!(leads.len(), 1);
        assert_eq!(leads[0].country.as_deref(), Some("Canada"));
        assert_eq!(leads[0].id.as_str(), "2001");
    }
}
