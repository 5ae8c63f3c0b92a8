//! Parsing of project API payloads into source-tagged records.
//!
//! The API is loose about types (ids arrive as numbers or strings, numbers
//! as strings) so every scalar goes through a lenient deserializer.

use serde::{Deserialize, Deserializer};
use serde_json::Value;
use tracing::warn;

use mineassembler_shared::{
    ApiError, CompanyAttribution, Coordinates, LocationFields, ProjectId, RawSourceRecord,
    RelationshipType, SourceFields, SourceKind,
};

// ---------------------------------------------------------------------------
// Wire types
// ---------------------------------------------------------------------------

/// One row of the `/projects/filter` listing.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct ListingRow {
    #[serde(deserialize_with = "lenient_string")]
    gid: Option<String>,
    #[serde(deserialize_with = "lenient_string")]
    project_name: Option<String>,
    #[serde(deserialize_with = "lenient_string")]
    stage: Option<String>,
    #[serde(deserialize_with = "lenient_string")]
    commodities: Option<String>,
    #[serde(deserialize_with = "lenient_string")]
    operator: Option<String>,
    #[serde(deserialize_with = "lenient_string")]
    location: Option<String>,
    #[serde(deserialize_with = "lenient_string")]
    mineral_district_camp: Option<String>,
    #[serde(deserialize_with = "lenient_string")]
    area_m2: Option<String>,
    #[serde(deserialize_with = "lenient_centroid")]
    centroid: Option<Coordinates>,
}

/// One company entry of the `/project/relationships` payload.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct RelationshipEntry {
    #[serde(deserialize_with = "lenient_string")]
    id: Option<String>,
    #[serde(deserialize_with = "lenient_string")]
    company_name: Option<String>,
    #[serde(deserialize_with = "lenient_f64")]
    percentage: Option<f64>,
    #[serde(rename = "projectCompanyOwnership", deserialize_with = "lenient_i64")]
    ownership: Option<i64>,
    #[serde(rename = "projectCompanyNsr", deserialize_with = "lenient_i64")]
    nsr: Option<i64>,
    #[serde(rename = "projectcompanyoptions", deserialize_with = "lenient_i64")]
    option: Option<i64>,
    #[serde(deserialize_with = "lenient_string")]
    root_ticker: Option<String>,
    #[serde(deserialize_with = "lenient_string")]
    exchange: Option<String>,
}

impl RelationshipEntry {
    fn into_attribution(self, kind: RelationshipType) -> Option<CompanyAttribution> {
        let company_id = self.id?;
        let company_name = self.company_name.unwrap_or_else(|| company_id.clone());
        let ownership_id = match kind {
            RelationshipType::Jv => self.ownership,
            RelationshipType::Nsr => self.nsr,
            RelationshipType::Option => self.option,
            RelationshipType::Operator => None,
        };

        let mut attribution =
            CompanyAttribution::new(company_id, company_name, kind, SourceKind::Relationships);
        attribution.percentage = self.percentage;
        attribution.ownership_id = ownership_id;
        attribution.ticker = self.root_ticker;
        attribution.exchange = self.exchange;
        Some(attribution)
    }
}

// ---------------------------------------------------------------------------
// Relationships
// ---------------------------------------------------------------------------

/// Turn a relationships payload into a record tagged `relationships`.
///
/// `null` means the endpoint knows nothing about the project. An object with
/// no entries is a valid, empty answer.
pub fn parse_relationships(id: &ProjectId, body: Value) -> Result<RawSourceRecord, ApiError> {
    let Value::Object(mut map) = body else {
        if body.is_null() {
            return Err(ApiError::NotFound(id.to_string()));
        }
        return Err(ApiError::Transient(format!(
            "relationships for {id}: expected an object"
        )));
    };

    let mut companies = Vec::new();
    for (key, kind) in [
        ("jv", RelationshipType::Jv),
        ("nsrs", RelationshipType::Nsr),
        ("option", RelationshipType::Option),
    ] {
        let Some(section) = map.remove(key) else {
            continue;
        };
        for entry in flatten_entries(section) {
            match serde_json::from_value::<RelationshipEntry>(entry) {
                Ok(entry) => companies.extend(entry.into_attribution(kind)),
                Err(e) => tracing::debug!(%id, section = key, error = %e, "skipping entry"),
            }
        }
    }

    Ok(RawSourceRecord::new(
        id.clone(),
        SourceKind::Relationships,
        SourceFields {
            companies,
            ..SourceFields::default()
        },
    ))
}

/// Sections arrive either as a flat array or as an array of arrays.
fn flatten_entries(section: Value) -> Vec<Value> {
    match section {
        Value::Array(items) => items
            .into_iter()
            .flat_map(|item| match item {
                Value::Array(inner) => inner,
                other => vec![other],
            })
            .filter(Value::is_object)
            .collect(),
        Value::Object(_) => vec![section],
        _ => Vec::new(),
    }
}

// ---------------------------------------------------------------------------
// Listing
// ---------------------------------------------------------------------------

/// Turn a listing payload into one record per project, tagged `listing`.
/// Rows without a project id, or that are not objects, are dropped with a warning.
pub fn parse_listing(country: &str, body: Value) -> Result<Vec<RawSourceRecord>, ApiError> {
    let rows = match body {
        Value::Array(rows) => rows,
        Value::Null => return Ok(Vec::new()),
        _ => {
            return Err(ApiError::Transient(format!(
                "listing for {country}: expected an array"
            )));
        }
    };

    let mut records = Vec::with_capacity(rows.len());
    for (index, row) in rows.into_iter().enumerate() {
        let gid = row.get("gid").cloned();
        match serde_json::from_value::<ListingRow>(row) {
            Ok(row) => match listing_record(row) {
                Some(record) => records.push(record),
                None => warn!(country, index, "listing row without a gid, dropped"),
            },
            Err(e) => warn!(country, index, ?gid, error = %e, "unreadable listing row, dropped"),
        }
    }
    Ok(records)
}

fn listing_record(row: ListingRow) -> Option<RawSourceRecord> {
    let id = ProjectId::new(row.gid?);
    if id.as_str().is_empty() {
        return None;
    }

    let location = location_fields(row.location, row.mineral_district_camp, row.area_m2);
    let coordinates = row.centroid;

    Some(RawSourceRecord::new(
        id,
        SourceKind::Listing,
        SourceFields {
            name: row.project_name,
            stage: row.stage,
            commodities: row.commodities,
            operator: row.operator,
            location: (!location.is_empty()).then_some(location),
            coordinates,
            ..SourceFields::default()
        },
    ))
}

/// Split `"State, Country"`: the last segment is the country, the first is
/// the state when there is more than one segment.
fn location_fields(
    location: Option<String>,
    district: Option<String>,
    area_m2: Option<String>,
) -> LocationFields {
    let (state, country) = match location.as_deref() {
        Some(text) => {
            let parts: Vec<&str> = text
                .split(',')
                .map(str::trim)
                .filter(|p| !p.is_empty())
                .collect();
            match parts.as_slice() {
                [] => (None, None),
                [country] => (None, Some(country.to_string())),
                [state, .., country] => (Some(state.to_string()), Some(country.to_string())),
            }
        }
        None => (None, None),
    };

    LocationFields {
        location_string: location,
        country,
        state,
        mineral_district: district,
        area_m2,
    }
}

// ---------------------------------------------------------------------------
// Lenient scalars
// ---------------------------------------------------------------------------

fn clean(text: &str) -> Option<String> {
    let trimmed = text.trim();
    if trimmed.is_empty() || trimmed == "-" || trimmed.eq_ignore_ascii_case("null") {
        None
    } else {
        Some(trimmed.to_string())
    }
}

fn lenient_string<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match Value::deserialize(deserializer)? {
        Value::String(s) => clean(&s),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        Value::Array(items) => {
            let joined: Vec<String> = items
                .iter()
                .filter_map(|v| match v {
                    Value::String(s) => clean(s),
                    Value::Number(n) => Some(n.to_string()),
                    _ => None,
                })
                .collect();
            (!joined.is_empty()).then(|| joined.join(", "))
        }
        _ => None,
    })
}

fn lenient_f64<'de, D>(deserializer: D) -> Result<Option<f64>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match Value::deserialize(deserializer)? {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().trim_end_matches('%').trim().parse().ok(),
        _ => None,
    })
}

/// GeoJSON point, `[lon, lat]`. Anything short of two numbers is no centroid.
fn lenient_centroid<'de, D>(deserializer: D) -> Result<Option<Coordinates>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Value::deserialize(deserializer)?;
    let Some(Value::Array(pair)) = value.get("coordinates") else {
        return Ok(None);
    };
    let number = |v: &Value| match v {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    };
    Ok(match pair.as_slice() {
        [lon, lat, ..] => number(lon)
            .zip(number(lat))
            .filter(|(lon, lat)| lon.is_finite() && lat.is_finite())
            .map(|(longitude, latitude)| Coordinates {
                latitude,
                longitude,
            }),
        _ => None,
    })
}

fn lenient_i64<'de, D>(deserializer: D) -> Result<Option<i64>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match Value::deserialize(deserializer)? {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    })
}
