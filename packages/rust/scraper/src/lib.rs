//! Browser-driven scraping of project profile pages.
//!
//! This crate provides:
//! - [`Scraper`] — the contract the resolver falls back to
//! - [`ScrapePool`] — fixed-size pool of isolated browser sessions
//! - [`session`] — the session seam and a Browserless-backed implementation
//! - [`extract`] — HTML extraction for project and company profile pages

pub mod extract;
pub mod pool;
pub mod session;

use async_trait::async_trait;

use mineassembler_shared::{Coordinates, ProjectId, RawSourceRecord, ScrapeError};

pub use extract::{
    CompanyTableRow, OwnerLink, ProfilePage, company_slug, parse_company_table, parse_profile,
    proper_case,
};
pub use pool::{PoolSettings, ScrapePool};
pub use session::{BrowserSession, BrowserlessFactory, BrowserlessSession, SessionFactory};

/// Last-resort source of company data for a project.
#[async_trait]
pub trait Scraper: Send + Sync {
    /// Scrape the project's profile page into a record tagged `scrape`.
    async fn scrape(&self, id: &ProjectId) -> Result<RawSourceRecord, ScrapeError>;

    /// Read the map centre of the project's map page. `None` when the page
    /// has no map.
    async fn locate(&self, id: &ProjectId) -> Result<Option<Coordinates>, ScrapeError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use mineassembler_shared::{RelationshipType, SourceKind};

    const HOST: &str = "https://mininghub.com";

    fn load_fixture(name: &str) -> String {
        let path = format!("../../../fixtures/html/{name}");
        std::fs::read_to_string(&path).unwrap_or_else(|_| panic!("missing fixture: {path}"))
    }

    #[test]
    fn project_profile_fixture() {
        let html = load_fixture("project-profile.html");
        let page = parse_profile(&html, HOST).unwrap();

        assert_eq!(page.project_name.as_deref(), Some("Tanami Ridge"));
        assert_eq!(page.operator.as_deref(), Some("Northern Star Resources"));
        assert_eq!(page.stage.as_deref(), Some("Exploration"));
        assert_eq!(page.commodities, None);
        assert_eq!(page.owners.len(), 2);
        assert!(page.needs_company_table());

        let companies = page.attributions(HOST);
        assert_eq!(companies[0].company_id, "412");
        assert_eq!(companies[0].company_name, "Northern Star Resources Ltd");
        assert!(companies.iter().all(|c| c.data_source == SourceKind::Scrape));
        assert!(companies.iter().all(|c| c.relationship_type == RelationshipType::Jv));
    }

    #[test]
    fn company_profile_fixture() {
        let html = load_fixture("company-profile.html");
        let row = parse_company_table(&html, &ProjectId::new("2208"), Some("Tanami Ridge")).unwrap();
        assert_eq!(row.commodities.as_deref(), Some("Gold"));
        assert_eq!(row.stage.as_deref(), Some("Exploration"));
    }

    #[test]
    fn record_carries_project_url() {
        let html = load_fixture("project-profile.html");
        let page = parse_profile(&html, HOST).unwrap();
        let url = format!("{HOST}/project-profile?gid=2208");
        let record = page.into_record(&ProjectId::new("2208"), &url, HOST);

        assert_eq!(record.source, SourceKind::Scrape);
        assert_eq!(record.fields.project_url.as_deref(), Some(url.as_str()));
        assert_eq!(record.fields.name.as_deref(), Some("Tanami Ridge"));
    }
}
