//! Core domain types for project assembly.

use std::collections::BTreeMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{AssemblyError, Result};

/// Current schema version for source records and assembled projects.
pub const CURRENT_SCHEMA_VERSION: u32 = 1;

// ---------------------------------------------------------------------------
// ProjectId
// ---------------------------------------------------------------------------

/// Opaque project key (the remote GID). The only join key across sources.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ProjectId(String);

impl ProjectId {
    pub fn new(raw: impl Into<String>) -> Self {
        Self(raw.into().trim().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Extract the `gid` query parameter from a project profile URL.
    pub fn from_profile_url(raw: &str) -> Option<Self> {
        let parsed = url::Url::parse(raw.trim()).ok()?;
        parsed
            .query_pairs()
            .find(|(k, _)| k == "gid")
            .map(|(_, v)| v.trim().to_string())
            .filter(|v| !v.is_empty())
            .map(Self)
    }
}

impl std::fmt::Display for ProjectId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl std::str::FromStr for ProjectId {
    type Err = AssemblyError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let trimmed = s.trim();
        if trimmed.is_empty() {
            return Err(AssemblyError::validation("empty project identifier"));
        }
        Ok(Self(trimmed.to_string()))
    }
}

impl From<u64> for ProjectId {
    fn from(gid: u64) -> Self {
        Self(gid.to_string())
    }
}

// ---------------------------------------------------------------------------
// Sources and provenance
// ---------------------------------------------------------------------------

/// Which source supplied a value. Declaration order is the default authority
/// order: earlier variants outrank later ones.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    Relationships,
    Listing,
    Scrape,
    /// Reverse geocoding. Only tags location fields no fetched source supplied.
    Geocoding,
}

impl SourceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Relationships => "relationships",
            Self::Listing => "listing",
            Self::Scrape => "scrape",
            Self::Geocoding => "geocoding",
        }
    }
}

impl std::fmt::Display for SourceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Fields of a [`Project`] that carry a provenance tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProjectField {
    Name,
    Stage,
    Commodities,
    Operator,
    Location,
    Coordinates,
    Companies,
    ProjectUrl,
}

// ---------------------------------------------------------------------------
// Company attribution
// ---------------------------------------------------------------------------

/// How a company relates to a project.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RelationshipType {
    /// Joint venture / ownership share.
    Jv,
    /// Net smelter return royalty.
    Nsr,
    /// Option agreement.
    Option,
    /// Operating company.
    Operator,
}

/// One company's relationship to a project.
///
/// Percentages across several attributions are not guaranteed to sum to 100.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompanyAttribution {
    pub company_id: String,
    pub company_name: String,
    pub relationship_type: RelationshipType,
    /// 0–100 when known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub percentage: Option<f64>,
    pub data_source: SourceKind,
    /// Exactly one attribution per finished project has this set.
    #[serde(default)]
    pub primary: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ownership_id: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ticker: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exchange: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub company_url: Option<String>,
}

impl CompanyAttribution {
    /// A bare attribution with only the required fields set.
    pub fn new(
        company_id: impl Into<String>,
        company_name: impl Into<String>,
        relationship_type: RelationshipType,
        data_source: SourceKind,
    ) -> Self {
        Self {
            company_id: company_id.into(),
            company_name: company_name.into(),
            relationship_type,
            percentage: None,
            data_source,
            primary: false,
            ownership_id: None,
            ticker: None,
            exchange: None,
            company_url: None,
        }
    }
}

// ---------------------------------------------------------------------------
// Location
// ---------------------------------------------------------------------------

/// A latitude/longitude pair in decimal degrees.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Coordinates {
    pub latitude: f64,
    pub longitude: f64,
}

/// Descriptive location fields as reported by a source.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LocationFields {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location_string: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub country: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mineral_district: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub area_m2: Option<String>,
}

impl LocationFields {
    pub fn is_empty(&self) -> bool {
        self.location_string.is_none()
            && self.country.is_none()
            && self.state.is_none()
            && self.mineral_district.is_none()
    }
}

/// Resolved project location.
///
/// `geocoded == true` implies both coordinates are present and the
/// reverse-geocoding call succeeded.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GeoLocation {
    #[serde(flatten)]
    pub fields: LocationFields,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub latitude: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub longitude: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub postcode: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub county: Option<String>,
    #[serde(default)]
    pub geocoded: bool,
}

impl GeoLocation {
    pub fn coordinates(&self) -> Option<Coordinates> {
        match (self.latitude, self.longitude) {
            (Some(latitude), Some(longitude)) => Some(Coordinates {
                latitude,
                longitude,
            }),
            _ => None,
        }
    }

    /// True when the project can be placed at all (text or coordinates).
    pub fn is_known(&self) -> bool {
        self.coordinates().is_some() || !self.fields.is_empty()
    }
}

// ---------------------------------------------------------------------------
// RawSourceRecord
// ---------------------------------------------------------------------------

/// The explicit field set every source may report. Absent means "this source
/// did not say", never "empty".
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SourceFields {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stage: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub commodities: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub operator: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<LocationFields>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub coordinates: Option<Coordinates>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub companies: Vec<CompanyAttribution>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project_url: Option<String>,
}

/// A partial, source-tagged record. Immutable once created.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawSourceRecord {
    pub schema_version: u32,
    pub identifier: ProjectId,
    pub source: SourceKind,
    pub fields: SourceFields,
    pub fetched_at: DateTime<Utc>,
}

impl RawSourceRecord {
    pub fn new(identifier: ProjectId, source: SourceKind, fields: SourceFields) -> Self {
        Self {
            schema_version: CURRENT_SCHEMA_VERSION,
            identifier,
            source,
            fields,
            fetched_at: Utc::now(),
        }
    }
}

// ---------------------------------------------------------------------------
// Project
// ---------------------------------------------------------------------------

/// A fully assembled project. Never edited in place: merges produce a new value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Project {
    pub schema_version: u32,
    pub id: ProjectId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stage: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub commodities: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub operator: Option<String>,
    pub location: GeoLocation,
    pub companies: Vec<CompanyAttribution>,
    /// Which source supplied each populated field.
    pub provenance: BTreeMap<ProjectField, SourceKind>,
    /// Project/company URLs gathered from every lead that named this project.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub urls: Vec<String>,
    /// Primary company and a location are both known.
    pub complete: bool,
    pub assembled_at: DateTime<Utc>,
}

impl Project {
    /// The single primary attribution.
    pub fn primary(&self) -> Option<&CompanyAttribution> {
        self.companies.iter().find(|c| c.primary)
    }

    /// Check the invariants downstream consumers rely on.
    pub fn validate(&self) -> Result<()> {
        let primaries = self.companies.iter().filter(|c| c.primary).count();
        if primaries != 1 {
            return Err(AssemblyError::validation(format!(
                "project {} has {primaries} primary attributions",
                self.id
            )));
        }

        match self.provenance.get(&ProjectField::Companies) {
            Some(source) if self.companies.iter().all(|c| c.data_source == *source) => {}
            _ => {
                return Err(AssemblyError::validation(format!(
                    "project {} has company attributions without a matching provenance tag",
                    self.id
                )));
            }
        }

        if self.location.geocoded && self.location.coordinates().is_none() {
            return Err(AssemblyError::validation(format!(
                "project {} is marked geocoded without coordinates",
                self.id
            )));
        }

        Ok(())
    }

    /// A copy with `urls` merged in (sorted, deduplicated).
    pub fn with_urls<I, S>(&self, urls: I) -> Project
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut merged = self.urls.clone();
        merged.extend(urls.into_iter().map(Into::into));
        merged.sort();
        merged.dedup();
        Project {
            urls: merged,
            ..self.clone()
        }
    }

    /// A copy with a replaced location.
    pub fn with_location(&self, location: GeoLocation) -> Project {
        Project {
            location,
            ..self.clone()
        }
    }
}

// ---------------------------------------------------------------------------
// Leads
// ---------------------------------------------------------------------------

/// An identifier handed over by discovery, with any URLs that named it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProjectLead {
    pub id: ProjectId,
    pub urls: Vec<String>,
    /// Country whose listing named this project, when known.
    pub country: Option<String>,
}

impl ProjectLead {
    pub fn new(id: ProjectId) -> Self {
        Self {
            id,
            urls: Vec::new(),
            country: None,
        }
    }

    pub fn in_country(id: ProjectId, country: impl Into<String>) -> Self {
        Self {
            country: Some(country.into()),
            ..Self::new(id)
        }
    }

    pub fn with_urls<I, S>(mut self, urls: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.urls.extend(urls.into_iter().map(Into::into));
        self
    }
}

// ---------------------------------------------------------------------------
// BatchMetrics
// ---------------------------------------------------------------------------

/// Outcome counters for one batch.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BatchMetrics {
    pub batch_id: usize,
    pub attempted: usize,
    pub succeeded: usize,
    /// Identifiers skipped because the ledger had already seen them.
    pub duplicates: usize,
    /// Identifiers never started because shutdown was requested.
    pub abandoned: usize,
    pub failed_by_reason: BTreeMap<String, usize>,
    pub elapsed_ms: u64,
}

impl BatchMetrics {
    pub fn new(batch_id: usize) -> Self {
        Self {
            batch_id,
            ..Self::default()
        }
    }

    pub fn record_failure(&mut self, reason: impl Into<String>) {
        *self.failed_by_reason.entry(reason.into()).or_insert(0) += 1;
    }

    pub fn failed(&self) -> usize {
        self.failed_by_reason.values().sum()
    }

    pub fn set_elapsed(&mut self, elapsed: Duration) {
        self.elapsed_ms = elapsed.as_millis() as u64;
    }

    pub fn elapsed(&self) -> Duration {
        Duration::from_millis(self.elapsed_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_project() -> Project {
        let mut owner = CompanyAttribution::new(
            "55",
            "Acme Mining",
            RelationshipType::Jv,
            SourceKind::Relationships,
        );
        owner.primary = true;
        owner.percentage = Some(60.0);

        let mut provenance = BTreeMap::new();
        provenance.insert(ProjectField::Companies, SourceKind::Relationships);
        provenance.insert(ProjectField::Stage, SourceKind::Listing);

        Project {
            schema_version: CURRENT_SCHEMA_VERSION,
            id: ProjectId::new("1001"),
            name: Some("Acme Ridge".into()),
            stage: Some("Mining".into()),
            commodities: None,
            operator: None,
            location: GeoLocation::default(),
            companies: vec![owner],
            provenance,
            urls: vec![],
            complete: false,
            assembled_at: Utc::now(),
        }
    }

    #[test]
    fn project_id_from_profile_url() {
        let id = ProjectId::from_profile_url("https://mininghub.com/project-profile?gid=1002")
            .expect("gid present");
        assert_eq!(id.as_str(), "1002");

        assert!(ProjectId::from_profile_url("https://mininghub.com/project-profile").is_none());
        assert!(ProjectId::from_profile_url("not a url").is_none());
    }

    #[test]
    fn project_id_parse_rejects_blank() {
        assert!("   ".parse::<ProjectId>().is_err());
        let id: ProjectId = " 77 ".parse().expect("parse");
        assert_eq!(id, ProjectId::from(77));
    }

    #[test]
    fn default_authority_order() {
        assert!(SourceKind::Relationships < SourceKind::Listing);
        assert!(SourceKind::Listing < SourceKind::Scrape);
    }

    #[test]
    fn validate_accepts_single_primary() {
        assert!(sample_project().validate().is_ok());
    }

    #[test]
    fn validate_rejects_two_primaries() {
        let mut project = sample_project();
        let mut second = project.companies[0].clone();
        second.company_id = "56".into();
        project.companies.push(second);
        let err = project.validate().unwrap_err();
        assert!(err.to_string().contains("2 primary"));
    }

    #[test]
    fn validate_rejects_geocoded_without_coordinates() {
        let mut project = sample_project();
        project.location.geocoded = true;
        assert!(project.validate().is_err());
    }

    #[test]
    fn with_urls_returns_new_value() {
        let project = sample_project();
        let merged = project.with_urls(["https://b", "https://a", "https://b"]);
        assert!(project.urls.is_empty());
        assert_eq!(merged.urls, vec!["https://a", "https://b"]);
    }

    #[test]
    fn project_serialization() {
        let project = sample_project();
        let json = serde_json::to_string(&project).expect("serialize");
        assert!(json.contains(r#""companies":"relationships""#));
        let parsed: Project = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(parsed.id, project.id);
        assert_eq!(parsed.primary().map(|c| c.company_name.as_str()), Some("Acme Mining"));
    }

    #[test]
    fn metrics_count_failures_by_reason() {
        let mut batch = BatchMetrics::new(1);
        batch.record_failure("scrape_timeout");
        batch.record_failure("scrape_timeout");
        batch.record_failure("listing_missing");
        batch.set_elapsed(Duration::from_millis(1500));
        assert_eq!(batch.failed(), 3);
        assert_eq!(batch.failed_by_reason["scrape_timeout"], 2);
        assert_eq!(batch.elapsed(), Duration::from_millis(1500));
    }
}
