//! Lead intake: URL lists, id files and resume filtering.

use std::collections::BTreeSet;
use std::path::Path;

use tracing::{debug, warn};

use mineassembler_shared::{AssemblyError, ProjectId, ProjectLead, Result};

/// Parse `project_url[,company_url]` lines. Blank lines, `#` comments and a
/// header row are skipped; lines without a `gid=` are dropped with a warning.
pub fn parse_url_list(text: &str) -> Vec<ProjectLead> {
    let mut leads = Vec::new();
    for (lineno, line) in text.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        let mut cells = line.split(',').map(|c| c.trim().trim_matches('"'));
        let project_url = cells.next().unwrap_or_default();
        let company_url = cells.next().filter(|c| !c.is_empty());

        let Some(id) = ProjectId::from_profile_url(project_url) else {
            if lineno == 0 && !project_url.contains("://") {
                debug!(header = line, "skipping header row");
            } else {
                warn!(line = lineno + 1, "no gid in project URL, skipping");
            }
            continue;
        };

        let mut lead = ProjectLead::new(id).with_urls([project_url]);
        lead.urls.extend(company_url.map(String::from));
        leads.push(lead);
    }
    leads
}

/// Parse identifiers separated by whitespace or commas.
pub fn parse_id_list(text: &str) -> Vec<ProjectLead> {
    text.lines()
        .map(|line| line.split('#').next().unwrap_or_default())
        .flat_map(|line| line.split([',', ' ', '\t']))
        .filter_map(|raw| raw.parse::<ProjectId>().ok())
        .map(ProjectLead::new)
        .collect()
}

pub fn read_url_file(path: &Path) -> Result<Vec<ProjectLead>> {
    let text = std::fs::read_to_string(path).map_err(|e| AssemblyError::io(path, e))?;
    Ok(parse_url_list(&text))
}

pub fn read_id_file(path: &Path) -> Result<Vec<ProjectLead>> {
    let text = std::fs::read_to_string(path).map_err(|e| AssemblyError::io(path, e))?;
    Ok(parse_id_list(&text))
}

/// Drop leads whose identifier a previous run already completed.
pub fn drop_completed(leads: Vec<ProjectLead>, completed: &BTreeSet<ProjectId>) -> Vec<ProjectLead> {
    let before = leads.len();
    let remaining: Vec<ProjectLead> = leads
        .into_iter()
        .filter(|lead| !completed.contains(&lead.id))
        .collect();
    debug!(skipped = before - remaining.len(), "resume filter applied");
    remaining
}
