//! Per-identifier fallback chain: relationships → listing → scrape.
//!
//! Each source contributes a [`RawSourceRecord`]. The records are folded into
//! a [`ProjectDraft`] that remembers which source set every field and refuses
//! to let a lower-authority source overwrite a higher one.

use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, instrument, warn};

use mineassembler_api::ProjectApi;
use mineassembler_scraper::{Scraper, company_slug};
use mineassembler_shared::{
    AppConfig, AssemblyError, CURRENT_SCHEMA_VERSION, CompanyAttribution, Coordinates,
    GeoLocation, LocationFields, Project, ProjectField, ProjectLead, RawSourceRecord,
    RelationshipType, Result, SourceKind,
};

use crate::listing::ListingCache;

// ---------------------------------------------------------------------------
// States and outcomes
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolveState {
    Start,
    RelationshipsTried,
    ListingTried,
    ScrapeTried,
    Resolved,
    Exhausted,
}

/// Terminal result of one identifier's fallback chain.
#[derive(Debug)]
pub enum Resolution {
    Resolved(Project),
    Exhausted { reason: String },
}

#[derive(Debug, Clone)]
pub struct ResolverSettings {
    /// Precedence for non-company fields, highest first.
    pub field_authority: Vec<SourceKind>,
    pub operator_fallback: bool,
    /// Ask the scraper for a map centre when nothing places the project.
    pub map_center: bool,
}

impl Default for ResolverSettings {
    fn default() -> Self {
        Self {
            field_authority: vec![
                SourceKind::Relationships,
                SourceKind::Listing,
                SourceKind::Scrape,
            ],
            operator_fallback: true,
            map_center: true,
        }
    }
}

impl From<&AppConfig> for ResolverSettings {
    fn from(config: &AppConfig) -> Self {
        Self {
            field_authority: config.resolver.field_authority.clone(),
            operator_fallback: config.resolver.operator_fallback,
            map_center: config.scrape.enabled && config.scrape.map_center,
        }
    }
}

// ---------------------------------------------------------------------------
// ProjectDraft
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
struct Sourced<T> {
    value: T,
    source: SourceKind,
}

/// Fields gathered so far for one identifier, each tagged with its source.
#[derive(Debug)]
pub struct ProjectDraft {
    authority: Vec<SourceKind>,
    name: Option<Sourced<String>>,
    stage: Option<Sourced<String>>,
    commodities: Option<Sourced<String>>,
    operator: Option<Sourced<String>>,
    location: Option<Sourced<LocationFields>>,
    coordinates: Option<Sourced<Coordinates>>,
    companies: Option<Sourced<Vec<CompanyAttribution>>>,
    project_url: Option<Sourced<String>>,
}

impl ProjectDraft {
    pub fn new(authority: &[SourceKind]) -> Self {
        Self {
            authority: authority.to_vec(),
            name: None,
            stage: None,
            commodities: None,
            operator: None,
            location: None,
            coordinates: None,
            companies: None,
            project_url: None,
        }
    }

    fn rank(&self, source: SourceKind) -> usize {
        self.authority
            .iter()
            .position(|s| *s == source)
            .unwrap_or(self.authority.len())
    }

    fn outranks(&self, incoming: SourceKind, held: SourceKind) -> bool {
        self.rank(incoming) < self.rank(held)
    }

    /// Fold a source record in. Company attributions always follow
    /// relationships > listing > scrape; other fields follow the configured
    /// authority.
    pub fn absorb(&mut self, record: &RawSourceRecord) {
        let source = record.source;
        let fields = &record.fields;

        let name = self.pick(&self.name, fields.name.clone(), source, "name");
        let stage = self.pick(&self.stage, fields.stage.clone(), source, "stage");
        let commodities = self.pick(&self.commodities, fields.commodities.clone(), source, "commodities");
        let operator = self.pick(&self.operator, fields.operator.clone(), source, "operator");
        let location = self.pick(
            &self.location,
            fields.location.clone().filter(|l| !l.is_empty()),
            source,
            "location",
        );
        let coordinates = self.pick(&self.coordinates, fields.coordinates, source, "coordinates");
        let project_url = self.pick(&self.project_url, fields.project_url.clone(), source, "project_url");

        if let Some(v) = name {
            self.name = Some(v);
        }
        if let Some(v) = stage {
            self.stage = Some(v);
        }
        if let Some(v) = commodities {
            self.commodities = Some(v);
        }
        if let Some(v) = operator {
            self.operator = Some(v);
        }
        if let Some(v) = location {
            self.location = Some(v);
        }
        if let Some(v) = coordinates {
            self.coordinates = Some(v);
        }
        if let Some(v) = project_url {
            self.project_url = Some(v);
        }

        if !fields.companies.is_empty() {
            match &self.companies {
                Some(held) if held.source <= source => {
                    debug!(held = %held.source, incoming = %source, "kept higher-authority attribution");
                }
                _ => {
                    self.companies = Some(Sourced {
                        value: fields.companies.clone(),
                        source,
                    });
                }
            }
        }
    }

    fn pick<T: Clone>(
        &self,
        held: &Option<Sourced<T>>,
        incoming: Option<T>,
        source: SourceKind,
        field: &'static str,
    ) -> Option<Sourced<T>> {
        let value = incoming?;
        match held {
            Some(h) if !self.outranks(source, h.source) => {
                if h.source != source {
                    debug!(field, held = %h.source, incoming = %source, "kept higher-authority value");
                }
                None
            }
            _ => Some(Sourced { value, source }),
        }
    }

    pub fn has_companies(&self) -> bool {
        self.companies.is_some()
    }

    pub fn companies_source(&self) -> Option<SourceKind> {
        self.companies.as_ref().map(|c| c.source)
    }

    pub fn has_coordinates(&self) -> bool {
        self.coordinates.is_some()
    }

    pub fn has_state(&self) -> bool {
        self.location
            .as_ref()
            .is_some_and(|l| l.value.state.is_some())
    }

    pub fn has_location(&self) -> bool {
        self.location.is_some() || self.coordinates.is_some()
    }

    /// Turn the listing's operator name into the only attribution. Does
    /// nothing when companies are already known or no operator was listed.
    pub fn apply_operator_fallback(&mut self) -> bool {
        if self.companies.is_some() {
            return false;
        }
        let Some(operator) = self.operator.as_ref().filter(|o| o.source == SourceKind::Listing) else {
            return false;
        };
        let name = operator.value.trim();
        if name.is_empty() {
            return false;
        }
        let mut attribution = CompanyAttribution::new(
            company_slug(name),
            name,
            RelationshipType::Operator,
            SourceKind::Listing,
        );
        // A lone listed operator is taken as the full owner.
        attribution.percentage = Some(100.0);
        self.companies = Some(Sourced {
            value: vec![attribution],
            source: SourceKind::Listing,
        });
        true
    }

    /// Build the immutable project. `None` when no company is known.
    pub fn finish(self, lead: &ProjectLead) -> Option<Project> {
        let Sourced {
            value: mut companies,
            source: companies_source,
        } = self.companies?;
        select_primary(&mut companies);

        let mut provenance = std::collections::BTreeMap::new();
        provenance.insert(ProjectField::Companies, companies_source);
        let mut tag = |field: ProjectField, source: Option<SourceKind>| {
            if let Some(source) = source {
                provenance.insert(field, source);
            }
        };
        tag(ProjectField::Name, self.name.as_ref().map(|s| s.source));
        tag(ProjectField::Stage, self.stage.as_ref().map(|s| s.source));
        tag(ProjectField::Commodities, self.commodities.as_ref().map(|s| s.source));
        tag(ProjectField::Location, self.location.as_ref().map(|s| s.source));
        tag(ProjectField::Coordinates, self.coordinates.as_ref().map(|s| s.source));
        tag(ProjectField::ProjectUrl, self.project_url.as_ref().map(|s| s.source));

        let operator = match self.operator {
            Some(op) => {
                tag(ProjectField::Operator, Some(op.source));
                Some(op.value)
            }
            None => companies.iter().find(|c| c.primary).map(|c| {
                tag(ProjectField::Operator, Some(c.data_source));
                c.company_name.clone()
            }),
        };

        let location = GeoLocation {
            fields: self.location.map(|l| l.value).unwrap_or_default(),
            latitude: self.coordinates.as_ref().map(|c| c.value.latitude),
            longitude: self.coordinates.as_ref().map(|c| c.value.longitude),
            ..GeoLocation::default()
        };

        let mut urls = lead.urls.clone();
        urls.extend(self.project_url.map(|u| u.value));
        urls.sort();
        urls.dedup();

        let complete = location.is_known();
        Some(Project {
            schema_version: CURRENT_SCHEMA_VERSION,
            id: lead.id.clone(),
            name: self.name.map(|s| s.value),
            stage: self.stage.map(|s| s.value),
            commodities: self.commodities.map(|s| s.value),
            operator,
            location,
            companies,
            provenance,
            urls,
            complete,
            assembled_at: Utc::now(),
        })
    }
}

/// Mark exactly one attribution primary: the JV with the largest share
/// (unknown counts as 0, earliest wins ties), otherwise the first one.
pub fn select_primary(companies: &mut [CompanyAttribution]) {
    for c in companies.iter_mut() {
        c.primary = false;
    }

    let mut best: Option<(usize, f64)> = None;
    for (i, c) in companies.iter().enumerate() {
        if c.relationship_type != RelationshipType::Jv {
            continue;
        }
        let share = c.percentage.unwrap_or(0.0);
        if best.is_none_or(|(_, top)| share > top) {
            best = Some((i, share));
        }
    }

    let index = best.map(|(i, _)| i).unwrap_or(0);
    if let Some(c) = companies.get_mut(index) {
        c.primary = true;
    }
}

// ---------------------------------------------------------------------------
// Resolver
// ---------------------------------------------------------------------------

/// Runs the fallback chain for one identifier at a time. Shared across tasks.
pub struct Resolver {
    api: Arc<dyn ProjectApi>,
    listings: Arc<ListingCache>,
    scraper: Option<Arc<dyn Scraper>>,
    settings: ResolverSettings,
}

impl Resolver {
    pub fn new(
        api: Arc<dyn ProjectApi>,
        listings: Arc<ListingCache>,
        scraper: Option<Arc<dyn Scraper>>,
        settings: ResolverSettings,
    ) -> Self {
        Self {
            api,
            listings,
            scraper,
            settings,
        }
    }

    /// Resolve one lead.
    ///
    /// Identifier-level failures come back as [`Resolution::Exhausted`]. Only
    /// a rejected credential is returned as an error.
    #[instrument(skip_all, fields(gid = %lead.id))]
    pub async fn resolve(&self, lead: &ProjectLead) -> Result<Resolution> {
        let id = &lead.id;
        let mut state = ResolveState::Start;
        let mut draft = ProjectDraft::new(&self.settings.field_authority);
        let mut last_failure: Option<String> = None;

        // Relationships
        match self.api.fetch_relationships(id).await {
            Ok(record) if !record.fields.companies.is_empty() => {
                debug!(companies = record.fields.companies.len(), "relationships found");
                draft.absorb(&record);
            }
            Ok(_) => {
                debug!("relationships empty");
                last_failure = Some("relationships_empty".into());
            }
            Err(e @ mineassembler_shared::ApiError::Unauthorized(_)) => {
                return Err(AssemblyError::from(e));
            }
            Err(e) => {
                debug!(error = %e, "relationships failed");
                last_failure = Some(format!("relationships_{}", e.kind()));
            }
        }
        advance(&mut state, ResolveState::RelationshipsTried);

        // Listing
        match self.listings.lookup(id, lead.country.as_deref()).await {
            Ok(Some(record)) => draft.absorb(&record),
            Ok(None) => {
                debug!("no listing row");
                if !draft.has_companies() {
                    last_failure = Some("listing_missing".into());
                }
            }
            Err(e) => return Err(AssemblyError::from(e)),
        }
        advance(&mut state, ResolveState::ListingTried);

        // Scrape, only when nothing named a company yet
        if !draft.has_companies() {
            if let Some(scraper) = &self.scraper {
                match scraper.scrape(id).await {
                    Ok(record) => {
                        draft.absorb(&record);
                        if !draft.has_companies() {
                            last_failure = Some("scrape_no_company".into());
                        }
                    }
                    Err(e) => {
                        debug!(error = %e, "scrape failed");
                        last_failure = Some(e.kind().to_string());
                    }
                }
                advance(&mut state, ResolveState::ScrapeTried);
            }
        }

        if !draft.has_companies() && self.settings.operator_fallback && draft.apply_operator_fallback() {
            debug!("using listed operator as attribution");
        }

        if !draft.has_companies() {
            advance(&mut state, ResolveState::Exhausted);
            let reason = last_failure.unwrap_or_else(|| "no_company".into());
            warn!(%reason, has_location = draft.has_location(), "identifier exhausted");
            return Ok(Resolution::Exhausted { reason });
        }

        // Geocoding needs coordinates; only look for them when the state is missing.
        if self.settings.map_center && !draft.has_coordinates() && !draft.has_state() {
            self.locate(lead, &mut draft).await;
        }

        match draft.finish(lead) {
            Some(project) => {
                advance(&mut state, ResolveState::Resolved);
                Ok(Resolution::Resolved(project))
            }
            None => {
                advance(&mut state, ResolveState::Exhausted);
                Ok(Resolution::Exhausted {
                    reason: "no_company".into(),
                })
            }
        }
    }

    async fn locate(&self, lead: &ProjectLead, draft: &mut ProjectDraft) {
        let Some(scraper) = &self.scraper else {
            return;
        };
        match scraper.locate(&lead.id).await {
            Ok(Some(coords)) => {
                debug!(lat = coords.latitude, lon = coords.longitude, "map centre found");
                let mut record = RawSourceRecord::new(
                    lead.id.clone(),
                    SourceKind::Scrape,
                    Default::default(),
                );
                record.fields.coordinates = Some(coords);
                draft.absorb(&record);
            }
            Ok(None) => debug!("no map on page"),
            Err(e) => debug!(error = %e, "map centre lookup failed"),
        }
    }
}

fn advance(state: &mut ResolveState, next: ResolveState) {
    debug!(from = ?*state, to = ?next, "resolver transition");
    *state = next;
}
