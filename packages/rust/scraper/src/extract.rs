//! HTML extraction for project and company profile pages.

use std::sync::LazyLock;

use regex::Regex;
use scraper::{ElementRef, Html, Selector};
use serde_json::Value;

use mineassembler_shared::{
    CompanyAttribution, Coordinates, ProjectId, RawSourceRecord, RelationshipType, ScrapeError,
    SourceFields, SourceKind,
};

static TITLE: LazyLock<Selector> =
    LazyLock::new(|| sel("h1#project-title, h1#project_title, h1"));
static COMPANY_NAME: LazyLock<Selector> = LazyLock::new(|| sel("h3#company-name"));
static COMPANY_NEWS_BTN: LazyLock<Selector> = LazyLock::new(|| sel("a#company-news-btn[href]"));
static MODAL_COMPANY: LazyLock<Selector> = LazyLock::new(|| {
    sel("#modal-nav-buttons a#company_profile, #modal_nav_buttons a#company_profile")
});
static PROJECT_MAP: LazyLock<Selector> = LazyLock::new(|| sel("#project-map[src]"));
static ANY_COMPANY_LINK: LazyLock<Selector> =
    LazyLock::new(|| sel(r#"a[href*="company-profile?gid="]"#));
static PROPERTIES_TABLE: LazyLock<Selector> = LazyLock::new(|| sel(".properties-wrapper-table"));
static ROW: LazyLock<Selector> = LazyLock::new(|| sel("tr"));
static CELL: LazyLock<Selector> = LazyLock::new(|| sel("td, th"));
static LINK: LazyLock<Selector> = LazyLock::new(|| sel("a"));

static GID_PARAM: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[?&]gid=(\d+)").expect("valid gid regex"));
static COMPANY_ID_PARAM: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[?&]companyId=(\d+)").expect("valid companyId regex"));

/// Lowercased fragments that only appear on interstitial or refusal pages.
const BLOCK_MARKERS: &[&str] = &[
    "captcha",
    "access denied",
    "attention required",
    "are you a robot",
    "cf-chl-",
    "request blocked",
];

fn sel(css: &str) -> Selector {
    Selector::parse(css).expect("static selector must parse")
}

// ---------------------------------------------------------------------------
// Project profile
// ---------------------------------------------------------------------------

/// A company named by an ownership link.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OwnerLink {
    pub company_id: String,
    pub name: String,
}

/// Everything a project profile page reveals.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProfilePage {
    pub project_name: Option<String>,
    pub operator: Option<String>,
    pub commodities: Option<String>,
    pub stage: Option<String>,
    pub ticker: Option<String>,
    pub company_name: Option<String>,
    pub company_id: Option<String>,
    pub company_url: Option<String>,
    pub owners: Vec<OwnerLink>,
}

impl ProfilePage {
    /// Whether the company projects table is worth a second page load.
    pub fn needs_company_table(&self) -> bool {
        self.company_url.is_some() && (self.stage.is_none() || self.commodities.is_none())
    }

    /// Company attributions in page order, operator match first.
    pub fn attributions(&self, base_host: &str) -> Vec<CompanyAttribution> {
        let mut owners = self.owners.clone();
        if let Some(operator) = self.operator.as_deref().map(str::to_lowercase) {
            if let Some(pos) = owners
                .iter()
                .position(|o| o.name.to_lowercase().contains(&operator))
            {
                let matched = owners.remove(pos);
                owners.insert(0, matched);
            }
        }

        let mut attributions: Vec<CompanyAttribution> = owners
            .into_iter()
            .map(|owner| {
                let mut a = CompanyAttribution::new(
                    owner.company_id.clone(),
                    proper_case(&owner.name),
                    RelationshipType::Jv,
                    SourceKind::Scrape,
                );
                a.company_url = Some(company_profile_url(base_host, &owner.company_id));
                a
            })
            .collect();

        if attributions.is_empty() {
            let name = self.company_name.clone().or_else(|| self.operator.clone());
            let id = self
                .company_id
                .clone()
                .or_else(|| name.as_deref().map(company_slug));
            if let (Some(id), Some(name)) = (id, name) {
                let mut a =
                    CompanyAttribution::new(id, proper_case(&name), RelationshipType::Jv, SourceKind::Scrape);
                a.company_url = self.company_url.clone();
                attributions.push(a);
            }
        }

        if let Some(first) = attributions.first_mut() {
            if let Some((ticker, exchange)) = self.ticker.as_deref().and_then(split_ticker) {
                first.ticker = Some(ticker);
                first.exchange = exchange;
            }
        }
        attributions
    }

    /// Fold the page into a record tagged `scrape`.
    pub fn into_record(self, id: &ProjectId, project_url: &str, base_host: &str) -> RawSourceRecord {
        let companies = self.attributions(base_host);
        RawSourceRecord::new(
            id.clone(),
            SourceKind::Scrape,
            SourceFields {
                name: self.project_name,
                stage: self.stage,
                commodities: self.commodities,
                operator: self.operator.map(|o| proper_case(&o)),
                companies,
                project_url: Some(project_url.to_string()),
                ..SourceFields::default()
            },
        )
    }
}

/// Parse a rendered project profile page.
pub fn parse_profile(html: &str, base_host: &str) -> Result<ProfilePage, ScrapeError> {
    let lowered = html.to_lowercase();
    if let Some(marker) = BLOCK_MARKERS.iter().find(|m| lowered.contains(*m)) {
        return Err(ScrapeError::Blocked(format!("page contains {marker:?}")));
    }

    let doc = Html::parse_document(html);
    let mut page = ProfilePage {
        project_name: first_text(&doc, &TITLE),
        company_name: first_text(&doc, &COMPANY_NAME),
        ..ProfilePage::default()
    };

    if let Some(table) = doc.select(&PROPERTIES_TABLE).next() {
        read_properties(table, &mut page);
    }
    find_company_link(&doc, base_host, &mut page);

    if page.project_name.is_none()
        && page.company_name.is_none()
        && page.company_id.is_none()
        && page.owners.is_empty()
    {
        return Err(ScrapeError::NotRendered(
            "no profile markup on page".to_string(),
        ));
    }
    Ok(page)
}

/// Key/value rows: label in the first cell, value in the second.
fn read_properties(table: ElementRef<'_>, page: &mut ProfilePage) {
    for row in table.select(&ROW) {
        let cells: Vec<ElementRef<'_>> = row.select(&CELL).collect();
        let [label, value, ..] = cells.as_slice() else {
            continue;
        };
        let label = text_of(*label).to_lowercase();

        if label.contains("ownership") {
            for link in value.select(&LINK) {
                let name = text_of(link);
                let id = ["href", "onclick"]
                    .iter()
                    .filter_map(|attr| link.value().attr(attr))
                    .find_map(|raw| capture(&GID_PARAM, raw));
                if let (Some(company_id), false) = (id, name.is_empty()) {
                    page.owners.push(OwnerLink { company_id, name });
                }
            }
            continue;
        }

        let Some(value) = clean(&text_of(*value)) else {
            continue;
        };
        let slot = if label.contains("project") {
            &mut page.project_name
        } else if label.contains("operator") {
            &mut page.operator
        } else if label.contains("commodit") {
            &mut page.commodities
        } else if label.contains("stage") {
            &mut page.stage
        } else if label.contains("ticker") {
            &mut page.ticker
        } else {
            continue;
        };
        slot.get_or_insert(value);
    }
}

/// The owning company's profile link, from the most to the least specific spot.
fn find_company_link(doc: &Html, base_host: &str, page: &mut ProfilePage) {
    let candidates = doc
        .select(&COMPANY_NEWS_BTN)
        .filter_map(|a| a.value().attr("href"))
        .chain(
            doc.select(&MODAL_COMPANY)
                .filter_map(|a| a.value().attr("data-url").or(a.value().attr("href"))),
        )
        .chain(doc.select(&ANY_COMPANY_LINK).filter_map(|a| a.value().attr("href")));

    for href in candidates {
        if !href.contains("company-profile") {
            continue;
        }
        if let Some(id) = capture(&GID_PARAM, href) {
            page.company_url = Some(absolute(base_host, href));
            page.company_id = Some(id);
            return;
        }
    }

    let from_map = doc
        .select(&PROJECT_MAP)
        .filter_map(|el| el.value().attr("src"))
        .find_map(|src| capture(&COMPANY_ID_PARAM, src));
    if let Some(id) = from_map {
        page.company_url = Some(company_profile_url(base_host, &id));
        page.company_id = Some(id);
    }
}

// ---------------------------------------------------------------------------
// Company profile projects table
// ---------------------------------------------------------------------------

/// Stage and commodities of one project as listed on its company's profile.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CompanyTableRow {
    pub commodities: Option<String>,
    pub stage: Option<String>,
}

/// Find the project's row in the company's project table, by `gid` link and
/// then by normalised project name.
pub fn parse_company_table(
    html: &str,
    id: &ProjectId,
    project_name: Option<&str>,
) -> Option<CompanyTableRow> {
    let doc = Html::parse_document(html);
    let target_name = project_name.map(normalize);

    for table in doc.select(&PROPERTIES_TABLE) {
        let mut rows = table.select(&ROW);
        let Some(header) = rows.next() else {
            continue;
        };
        let headers: Vec<String> = header
            .select(&CELL)
            .map(|c| text_of(c).to_lowercase())
            .collect();
        let column = |key: &str| headers.iter().position(|h| h.contains(key));
        let (Some(project_col), Some(commodity_col), Some(stage_col)) =
            (column("project"), column("commodit"), column("stage"))
        else {
            continue;
        };

        let mut by_name = None;
        for row in rows {
            let cells: Vec<ElementRef<'_>> = row.select(&CELL).collect();
            let cell = |i: usize| cells.get(i).and_then(|c| clean(&text_of(*c)));
            let found = CompanyTableRow {
                commodities: cell(commodity_col),
                stage: cell(stage_col),
            };

            let links_here = row
                .select(&LINK)
                .filter_map(|a| a.value().attr("href"))
                .filter(|href| href.contains("project-profile"))
                .filter_map(|href| capture(&GID_PARAM, href))
                .any(|gid| gid == id.as_str());
            if links_here {
                return Some(found);
            }

            let name_matches = match (&target_name, cells.get(project_col)) {
                (Some(target), Some(c)) => normalize(&text_of(*c)) == *target,
                _ => false,
            };
            if name_matches && by_name.is_none() {
                by_name = Some(found);
            }
        }
        if by_name.is_some() {
            return by_name;
        }
    }
    None
}

// ---------------------------------------------------------------------------
// Map centre
// ---------------------------------------------------------------------------

/// Read `{lat, lng}` out of the map-centre script result.
pub fn map_center(value: &Value) -> Option<Coordinates> {
    let latitude = value.get("lat")?.as_f64()?;
    let longitude = value
        .get("lng")
        .or_else(|| value.get("lon"))
        .and_then(Value::as_f64)?;
    let valid = (-90.0..=90.0).contains(&latitude) && (-180.0..=180.0).contains(&longitude);
    valid.then_some(Coordinates {
        latitude,
        longitude,
    })
}

// ---------------------------------------------------------------------------
// Text helpers
// ---------------------------------------------------------------------------

/// `"ACME  mining corp"` → `"Acme Mining Corp"`.
pub fn proper_case(name: &str) -> String {
    name.split_whitespace()
        .map(|word| {
            let mut chars = word.chars();
            match chars.next() {
                Some(first) => first
                    .to_uppercase()
                    .chain(chars.flat_map(char::to_lowercase))
                    .collect(),
                None => String::new(),
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}

/// Stable id for a company known only by name.
pub fn company_slug(name: &str) -> String {
    name.to_lowercase()
        .replace('&', "and")
        .chars()
        .filter_map(|c| match c {
            ' ' | '/' => Some('-'),
            c if c.is_alphanumeric() || c == '-' => Some(c),
            _ => None,
        })
        .collect()
}

/// `"ACM:ASX"` / `"ACM (ASX)"` / `"ACM"`.
fn split_ticker(raw: &str) -> Option<(String, Option<String>)> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }
    if let Some((ticker, exchange)) = raw.split_once(':') {
        return Some((ticker.trim().to_string(), clean(exchange)));
    }
    if let Some((ticker, rest)) = raw.split_once('(') {
        let exchange = rest.trim_end_matches(')');
        return Some((ticker.trim().to_string(), clean(exchange)));
    }
    Some((raw.to_string(), None))
}

pub(crate) fn company_profile_url(base_host: &str, company_id: &str) -> String {
    format!("{}/company-profile?gid={company_id}", base_host.trim_end_matches('/'))
}

fn absolute(base_host: &str, href: &str) -> String {
    url::Url::parse(base_host)
        .and_then(|base| base.join(href))
        .map(String::from)
        .unwrap_or_else(|_| href.to_string())
}

fn capture(re: &Regex, haystack: &str) -> Option<String> {
    re.captures(haystack).map(|c| c[1].to_string())
}

fn first_text(doc: &Html, selector: &Selector) -> Option<String> {
    doc.select(selector).find_map(|el| clean(&text_of(el)))
}

fn text_of(el: ElementRef<'_>) -> String {
    el.text().collect::<Vec<_>>().join(" ").split_whitespace().collect::<Vec<_>>().join(" ")
}

fn clean(text: &str) -> Option<String> {
    let trimmed = text.trim();
    (!trimmed.is_empty() && trimmed != "-").then(|| trimmed.to_string())
}

fn normalize(text: &str) -> String {
    text.split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

#[cfg(test)]
mod tests {
    use super::*;

    const HOST: &str = "https://mininghub.com";

    const PROFILE: &str = r#"
        <html><body>
          <h1 id="project-title">Beta Hill</h1>
          <div id="right-sider">
            <h3 id="company-name">BETA corp</h3>
            <a id="company-news-btn" href="/company-profile?gid=88&tab=news">News</a>
          </div>
          <table class="properties-wrapper-table">
            <tr><td>Project</td><td>Beta Hill</td></tr>
            <tr><td>Operator</td><td>Beta Corp</td></tr>
            <tr><td>Commodities</td><td>Gold, Silver</td></tr>
            <tr><td>Stage</td><td>-</td></tr>
            <tr><td>Ticker</td><td>BTA:TSXV</td></tr>
          </table>
        </body></html>
    "#;

    #[test]
    fn parses_profile_fields() {
        let page = parse_profile(PROFILE, HOST).unwrap();
        assert_eq!(page.project_name.as_deref(), Some("Beta Hill"));
        assert_eq!(page.company_name.as_deref(), Some("BETA corp"));
        assert_eq!(page.company_id.as_deref(), Some("88"));
        assert_eq!(
            page.company_url.as_deref(),
            Some("https://mininghub.com/company-profile?gid=88&tab=news")
        );
        assert_eq!(page.commodities.as_deref(), Some("Gold, Silver"));
        assert_eq!(page.stage, None);
        assert!(page.needs_company_table());
    }

    #[test]
    fn header_company_becomes_single_attribution() {
        let page = parse_profile(PROFILE, HOST).unwrap();
        let companies = page.attributions(HOST);
        assert_eq!(companies.len(), 1);
        let c = &companies[0];
        assert_eq!(c.company_id, "88");
        assert_eq!(c.company_name, "Beta Corp");
        assert_eq!(c.data_source, SourceKind::Scrape);
        assert_eq!(c.ticker.as_deref(), Some("BTA"));
        assert_eq!(c.exchange.as_deref(), Some("TSXV"));
    }

    #[test]
    fn ownership_links_prefer_operator() {
        let html = r#"
            <h1>Gamma</h1>
            <table class="properties-wrapper-table">
              <tr><td>Operator</td><td>Delta Metals</td></tr>
              <tr><td>Ownership</td><td>
                <a href="/company-profile?gid=1">Gamma Holdings</a>
                <a onclick="go('/company-profile?gid=2')">DELTA METALS LTD</a>
              </td></tr>
            </table>
        "#;
        let page = parse_profile(html, HOST).unwrap();
        let companies = page.attributions(HOST);
        assert_eq!(companies.len(), 2);
        assert_eq!(companies[0].company_id, "2");
        assert_eq!(companies[0].company_name, "Delta Metals Ltd");
        assert_eq!(
            companies[0].company_url.as_deref(),
            Some("https://mininghub.com/company-profile?gid=2")
        );
    }

    #[test]
    fn company_id_from_map_iframe() {
        let html = r#"
            <h1>Epsilon</h1>
            <iframe id="project-map" src="/map?gid=5&companyId=321"></iframe>
        "#;
        let page = parse_profile(html, HOST).unwrap();
        assert_eq!(page.company_id.as_deref(), Some("321"));
    }

    #[test]
    fn detects_blocked_and_unrendered() {
        let blocked = "<html><title>Attention Required!</title><div class=g-recaptcha></div></html>";
        assert!(matches!(parse_profile(blocked, HOST), Err(ScrapeError::Blocked(_))));

        let empty = "<html><body><div id=app></div></body></html>";
        assert!(matches!(parse_profile(empty, HOST), Err(ScrapeError::NotRendered(_))));
    }

    #[test]
    fn company_table_matches_gid_then_name() {
        let html = r#"
            <table class="properties-wrapper-table">
              <tr><th>Project</th><th>Location</th><th>Commodities</th><th>Stage</th><th></th></tr>
              <tr><td>Other</td><td>x</td><td>Zinc</td><td>Exploration</td>
                  <td><a href="/project-profile?gid=7">view</a></td></tr>
              <tr><td>Beta  Hill</td><td>x</td><td>Gold</td><td>Development</td>
                  <td><a href="/project-profile?gid=1002">view</a></td></tr>
            </table>
        "#;
        let row = parse_company_table(html, &ProjectId::new("1002"), None).unwrap();
        assert_eq!(row.stage.as_deref(), Some("Development"));

        let row = parse_company_table(html, &ProjectId::new("9999"), Some("beta hill")).unwrap();
        assert_eq!(row.commodities.as_deref(), Some("Gold"));

        assert!(parse_company_table(html, &ProjectId::new("9999"), Some("nope")).is_none());
    }

    #[test]
    fn map_center_values() {
        let value = serde_json::json!({"lib": "Leaflet", "lat": -31.9, "lng": 115.8, "zoom": 9});
        let c = map_center(&value).unwrap();
        assert_eq!(c.latitude, -31.9);
        assert_eq!(c.longitude, 115.8);
        assert!(map_center(&Value::Null).is_none());
        assert!(map_center(&serde_json::json!({"lat": 120.0, "lng": 0.0})).is_none());
    }

    #[test]
    fn proper_case_and_slug() {
        assert_eq!(proper_case("  ACME   mining corp "), "Acme Mining Corp");
        assert_eq!(company_slug("Beta & Sons Ltd."), "beta-and-sons-ltd");
    }
}
