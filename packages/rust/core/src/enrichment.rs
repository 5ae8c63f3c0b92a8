//! Reverse-geocoding enrichment with an on-disk cache.
//!
//! Coordinates are rounded to a fixed number of decimals to form a cache
//! bucket. Lookups for the same bucket are serialized; different buckets
//! proceed independently.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::{debug, instrument, warn};

use mineassembler_api::{Address, ReverseGeocoder};
use mineassembler_shared::{Coordinates, GeocodeError, Project, ProjectField, SourceKind};
use mineassembler_storage::Storage;

/// Cache key for a coordinate pair at `precision` decimals.
pub fn bucket_key(coords: Coordinates, precision: u32) -> String {
    let p = precision as usize;
    // Adding 0.0 turns -0.0 into 0.0 so both round to the same bucket.
    format!(
        "{:.p$},{:.p$}",
        round_to(coords.latitude, precision) + 0.0,
        round_to(coords.longitude, precision) + 0.0,
    )
}

fn round_to(value: f64, precision: u32) -> f64 {
    let factor = 10f64.powi(precision as i32);
    (value * factor).round() / factor
}

/// Counters for one enricher.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub struct EnrichmentStats {
    pub cache_hits: u64,
    pub remote_calls: u64,
    pub failures: u64,
}

/// Fills country/state/postcode/county from coordinates.
pub struct GeocodingEnricher {
    geocoder: Arc<dyn ReverseGeocoder>,
    storage: Arc<Storage>,
    precision: u32,
    locks: std::sync::Mutex<HashMap<String, Arc<Mutex<()>>>>,
    cache_hits: AtomicU64,
    remote_calls: AtomicU64,
    failures: AtomicU64,
}

impl GeocodingEnricher {
    pub fn new(geocoder: Arc<dyn ReverseGeocoder>, storage: Arc<Storage>, precision: u32) -> Self {
        Self {
            geocoder,
            storage,
            precision,
            locks: std::sync::Mutex::new(HashMap::new()),
            cache_hits: AtomicU64::new(0),
            remote_calls: AtomicU64::new(0),
            failures: AtomicU64::new(0),
        }
    }

    pub fn stats(&self) -> EnrichmentStats {
        EnrichmentStats {
            cache_hits: self.cache_hits.load(Ordering::Relaxed),
            remote_calls: self.remote_calls.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed),
        }
    }

    /// Return `project` with its location enriched, or unchanged when it has
    /// no coordinates, already knows its state, or the geocoder is unavailable.
    #[instrument(skip_all, fields(gid = %project.id))]
    pub async fn enrich(&self, project: Project) -> Project {
        let Some(coords) = project.location.coordinates() else {
            return project;
        };
        if project.location.fields.state.is_some() {
            return project;
        }

        match self.reverse(coords).await {
            Ok(address) => {
                let mut location = project.location.clone();
                location.fields.country = location.fields.country.or(address.country);
                location.fields.state = address.state;
                location.postcode = address.postcode;
                location.county = address.county;
                location.geocoded = true;
                let mut enriched = project.with_location(location);
                enriched
                    .provenance
                    .entry(ProjectField::Location)
                    .or_insert(SourceKind::Geocoding);
                enriched.complete = enriched.primary().is_some() && enriched.location.is_known();
                enriched
            }
            Err(e) => {
                self.failures.fetch_add(1, Ordering::Relaxed);
                warn!(error = %e, "reverse geocoding unavailable, keeping raw coordinates");
                project
            }
        }
    }

    /// Cached reverse lookup. Failures are not cached.
    pub async fn reverse(&self, coords: Coordinates) -> Result<Address, GeocodeError> {
        let bucket = bucket_key(coords, self.precision);
        let lease = self.bucket_lease(bucket);
        let _guard = lease.lock.lock().await;
        let bucket = lease.bucket.as_str();

        match self.storage.get_geocode(bucket).await {
            Ok(Some(json)) => match serde_json::from_str::<Address>(&json) {
                Ok(address) => {
                    self.cache_hits.fetch_add(1, Ordering::Relaxed);
                    debug!(%bucket, "geocode cache hit");
                    return Ok(address);
                }
                Err(e) => warn!(%bucket, error = %e, "unreadable cache entry, refetching"),
            },
            Ok(None) => {}
            Err(e) => warn!(%bucket, error = %e, "geocode cache read failed"),
        }

        self.remote_calls.fetch_add(1, Ordering::Relaxed);
        let address = self.geocoder.reverse(coords).await?;

        match serde_json::to_string(&address) {
            Ok(json) => {
                if let Err(e) = self.storage.put_geocode(bucket, &json).await {
                    warn!(%bucket, error = %e, "geocode cache write failed");
                }
            }
            Err(e) => warn!(%bucket, error = %e, "address serialization failed"),
        }
        Ok(address)
    }

    fn bucket_lease(&self, bucket: String) -> BucketLease<'_> {
        let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
        let lock = locks.entry(bucket.clone()).or_default().clone();
        BucketLease {
            locks: &self.locks,
            bucket,
            lock,
        }
    }
}

/// A handle on one bucket's lock. The map entry goes away with the last handle.
struct BucketLease<'a> {
    locks: &'a std::sync::Mutex<HashMap<String, Arc<Mutex<()>>>>,
    bucket: String,
    lock: Arc<Mutex<()>>,
}

impl Drop for BucketLease<'_> {
    fn drop(&mut self) {
        let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
        // Only the map and this lease hold it: nobody else waits on the bucket.
        if Arc::strong_count(&self.lock) == 2 {
            locks.remove(&self.bucket);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use std::sync::atomic::AtomicUsize;

    use async_trait::async_trait;
    use chrono::Utc;
    use mineassembler_shared::{
        CURRENT_SCHEMA_VERSION, CompanyAttribution, GeoLocation, LocationFields, ProjectId,
        RelationshipType,
    };

    struct FakeGeocoder {
        calls: AtomicUsize,
        fail: bool,
    }

    #[async_trait]
    impl ReverseGeocoder for FakeGeocoder {
        async fn reverse(&self, _coords: Coordinates) -> Result<Address, GeocodeError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            tokio::task::yield_now().await;
            if self.fail {
                return Err(GeocodeError::Unavailable("503".into()));
            }
            Ok(Address {
                country: Some("Australia".into()),
                state: Some("Northern Territory".into()),
                postcode: Some("0872".into()),
                county: None,
            })
        }
    }

    async fn setup(fail: bool) -> (GeocodingEnricher, Arc<FakeGeocoder>, Arc<Storage>) {
        let path = std::env::temp_dir().join(format!("ma_geo_{}.db", uuid::Uuid::now_v7()));
        let storage = Arc::new(Storage::open(&path).await.unwrap());
        let geocoder = Arc::new(FakeGeocoder {
            calls: AtomicUsize::new(0),
            fail,
        });
        (
            GeocodingEnricher::new(geocoder.clone(), storage.clone(), 3),
            geocoder,
            storage,
        )
    }

    fn coords(latitude: f64, longitude: f64) -> Coordinates {
        Coordinates {
            latitude,
            longitude,
        }
    }

    fn project(location: GeoLocation) -> Project {
        let mut owner =
            CompanyAttribution::new("55", "Acme Mining", RelationshipType::Jv, SourceKind::Relationships);
        owner.primary = true;
        Project {
            schema_version: CURRENT_SCHEMA_VERSION,
            id: ProjectId::new("1001"),
            name: None,
            stage: None,
            commodities: None,
            operator: None,
            location,
            companies: vec![owner],
            provenance: BTreeMap::from([(ProjectField::Companies, SourceKind::Relationships)]),
            urls: vec![],
            complete: true,
            assembled_at: Utc::now(),
        }
    }

    #[test]
    fn bucket_rounding() {
        assert_eq!(bucket_key(coords(-19.12341, 130.55549), 3), "-19.123,130.555");
        assert_eq!(bucket_key(coords(-0.0001, 0.0), 3), "0.000,0.000");
        assert_eq!(bucket_key(coords(12.5, 7.0), 0), "13,7");
    }

    #[tokio::test]
    async fn same_bucket_hits_cache() {
        let (enricher, geocoder, storage) = setup(false).await;

        enricher.reverse(coords(-19.12341, 130.55549)).await.unwrap();
        enricher.reverse(coords(-19.12339, 130.55551)).await.unwrap();

        assert_eq!(geocoder.calls.load(Ordering::SeqCst), 1);
        assert_eq!(enricher.stats().cache_hits, 1);
        assert_eq!(storage.geocode_cache_size().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn different_buckets_call_twice() {
        let (enricher, geocoder, _) = setup(false).await;

        enricher.reverse(coords(-19.1234, 130.555)).await.unwrap();
        enricher.reverse(coords(-19.1244, 130.555)).await.unwrap();

        assert_eq!(geocoder.calls.load(Ordering::SeqCst), 2);
        assert_eq!(enricher.stats().cache_hits, 0);
        assert!(enricher.locks.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn concurrent_lookups_in_one_bucket_call_once() {
        let (enricher, geocoder, _) = setup(false).await;
        let enricher = Arc::new(enricher);

        let mut handles = Vec::new();
        for _ in 0..6 {
            let enricher = enricher.clone();
            handles.push(tokio::spawn(async move {
                enricher.reverse(coords(45.0001, -75.0001)).await
            }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }
        assert_eq!(geocoder.calls.load(Ordering::SeqCst), 1);
        assert_eq!(enricher.stats().cache_hits, 5);
        assert!(enricher.locks.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn enrich_sets_geocoded() {
        let (enricher, _, _) = setup(false).await;
        let original = project(GeoLocation {
            latitude: Some(-19.5),
            longitude: Some(130.2),
            ..GeoLocation::default()
        });

        let enriched = enricher.enrich(original.clone()).await;
        assert!(enriched.location.geocoded);
        assert_eq!(enriched.location.fields.state.as_deref(), Some("Northern Territory"));
        assert_eq!(enriched.location.postcode.as_deref(), Some("0872"));
        assert!(!original.location.geocoded);
        assert!(enriched.validate().is_ok());
        assert_eq!(enriched.provenance[&ProjectField::Location], SourceKind::Geocoding);
    }

    #[tokio::test]
    async fn enrich_keeps_source_location_tag() {
        let (enricher, _, _) = setup(false).await;
        let mut listed = project(GeoLocation {
            fields: LocationFields {
                country: Some("Australia".into()),
                ..LocationFields::default()
            },
            latitude: Some(-19.5),
            longitude: Some(130.2),
            ..GeoLocation::default()
        });
        listed.provenance.insert(ProjectField::Location, SourceKind::Listing);

        let enriched = enricher.enrich(listed).await;
        assert!(enriched.location.geocoded);
        assert_eq!(enriched.location.fields.country.as_deref(), Some("Australia"));
        assert_eq!(enriched.provenance[&ProjectField::Location], SourceKind::Listing);
    }

    #[tokio::test]
    async fn no_coordinates_means_no_call() {
        let (enricher, geocoder, _) = setup(false).await;
        let unchanged = enricher.enrich(project(GeoLocation::default())).await;
        assert!(!unchanged.location.geocoded);
        assert_eq!(geocoder.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn unavailable_keeps_coordinates_and_is_not_cached() {
        let (enricher, geocoder, storage) = setup(true).await;
        let original = project(GeoLocation {
            latitude: Some(10.0),
            longitude: Some(20.0),
            ..GeoLocation::default()
        });

        let result = enricher.enrich(original.clone()).await;
        assert!(!result.location.geocoded);
        assert_eq!(result.location.latitude, Some(10.0));
        enricher.enrich(original).await;

        assert_eq!(geocoder.calls.load(Ordering::SeqCst), 2);
        assert_eq!(enricher.stats().failures, 2);
        assert_eq!(storage.geocode_cache_size().await.unwrap(), 0);
    }
}
