//! Dataset domain definitions and the paginated OpenFEMA harvester.

use chrono::Utc;
use oflp_core::{normalize_envelope, DatasetQuery, FilterGroup, FlatRecord, HarvestResult};
use oflp_storage::{FetchError, PageFetcher};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};

pub const CRATE_NAME: &str = "oflp-harvest";

pub const DEFAULT_PAGE_SIZE: usize = 100;
pub const DEFAULT_MAX_RECORDS: usize = 1000;

/// One independently harvested data category: remote entity, field
/// selection, state filter, and the artifact it lands in.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatasetDomain {
    pub domain_id: String,
    pub display_name: String,
    pub enabled: bool,
    pub version: String,
    pub entity: String,
    pub select: Vec<String>,
    pub state_field: String,
    pub states: Vec<String>,
    #[serde(default)]
    pub non_zero_field: Option<String>,
    pub artifact_name: String,
}

impl DatasetDomain {
    pub fn query(&self, base_url: &str, page_top: u32) -> DatasetQuery {
        let mut filter_groups = Vec::new();
        if !self.states.is_empty() {
            filter_groups.push(FilterGroup::any_eq(&self.state_field, self.states.clone()));
        }
        if let Some(field) = &self.non_zero_field {
            filter_groups.push(FilterGroup::non_zero(field));
        }
        DatasetQuery {
            base_url: base_url.to_string(),
            version: self.version.clone(),
            entity: self.entity.clone(),
            select: self.select.clone(),
            top: Some(page_top),
            filter_groups,
        }
    }
}

/// The three dataset domains the sales workflow harvests, with the field
/// selections and states of interest the source datasets use.
pub fn builtin_domains() -> Vec<DatasetDomain> {
    vec![
        DatasetDomain {
            domain_id: "cayg".to_string(),
            display_name: "Public Assistance applicant program deliveries".to_string(),
            enabled: true,
            version: "v1".to_string(),
            entity: "PublicAssistanceApplicantsProgramDeliveries".to_string(),
            select: [
                "declarationType",
                "stateCode",
                "disasterNumber",
                "incidentType",
                "applicantName",
                "federalShareObligated",
            ]
            .map(String::from)
            .to_vec(),
            state_field: "stateCode".to_string(),
            states: [
                "NC", "SC", "TX", "NY", "CA", "MS", "AL", "LA", "VA", "MD", "CO", "OR", "WA",
                "NJ", "HI", "AL", "PR",
            ]
            .map(String::from)
            .to_vec(),
            non_zero_field: Some("federalShareObligated".to_string()),
            artifact_name: "processed_pa_data.json".to_string(),
        },
        DatasetDomain {
            domain_id: "hma".to_string(),
            display_name: "Hazard mitigation assistance projects".to_string(),
            enabled: true,
            version: "v3".to_string(),
            entity: "HazardMitigationAssistanceProjects".to_string(),
            select: [
                "programArea",
                "programFy",
                "state",
                "disasterNumber",
                "recipient",
                "federalShareObligated",
            ]
            .map(String::from)
            .to_vec(),
            state_field: "state".to_string(),
            states: [
                "North Carolina",
                "South Carolina",
                "Texas",
                "New York",
                "California",
            ]
            .map(String::from)
            .to_vec(),
            non_zero_field: Some("federalShareObligated".to_string()),
            artifact_name: "processed_hm_data.json".to_string(),
        },
        DatasetDomain {
            domain_id: "preparedness".to_string(),
            display_name: "Emergency management performance grants".to_string(),
            enabled: true,
            version: "v2".to_string(),
            entity: "EmergencyManagementPerformanceGrants".to_string(),
            select: ["state", "legalAgencyName", "projectEndDate", "fundingAmount"]
                .map(String::from)
                .to_vec(),
            state_field: "state".to_string(),
            states: [
                "North Carolina",
                "South Carolina",
                "Texas",
                "New York",
                "California",
            ]
            .map(String::from)
            .to_vec(),
            non_zero_field: None,
            artifact_name: "processed_preparedness_data.json".to_string(),
        },
    ]
}

#[derive(Debug, Error)]
enum PageError {
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error("response envelope has no record array under '{entity}'")]
    Envelope { entity: String },
}

/// Paginated harvester over the `PageFetcher` seam.
///
/// Partial-failure policy: a failed page call stops the loop and the
/// records accumulated so far are returned with `complete = false`; no
/// error escapes the harvest boundary. There is deliberately no retry or
/// backoff here — the fetcher's bounded timeout is the only safety net.
#[derive(Debug, Clone, Copy)]
pub struct Harvester {
    pub page_size: usize,
    pub max_records: usize,
}

impl Default for Harvester {
    fn default() -> Self {
        Self {
            page_size: DEFAULT_PAGE_SIZE,
            max_records: DEFAULT_MAX_RECORDS,
        }
    }
}

impl Harvester {
    /// Appends a `$top`/`$skip` suffix to the pre-built query on every
    /// call. After each successful page, in order: a short page ends the
    /// harvest (last page), then a skip counter at or past `max_records`
    /// ends it (record cap).
    pub async fn harvest(
        &self,
        fetcher: &dyn PageFetcher,
        query: &str,
        entity: &str,
    ) -> HarvestResult {
        let separator = if query.contains('?') { '&' } else { '?' };
        let mut records: Vec<FlatRecord> = Vec::new();
        let mut skip = 0usize;
        let mut complete = true;

        loop {
            let url = format!("{query}{separator}$top={}&$skip={skip}", self.page_size);
            let page = match self.fetch_page(fetcher, &url, entity).await {
                Ok(page) => page,
                Err(err) => {
                    warn!(entity, skip, error = %err, "page fetch failed, keeping partial results");
                    complete = false;
                    break;
                }
            };

            let page_len = page.len();
            records.extend(page);
            if page_len < self.page_size {
                break;
            }
            skip += self.page_size;
            if skip >= self.max_records {
                info!(entity, skip, max_records = self.max_records, "record cap reached");
                break;
            }
        }

        info!(entity, records = records.len(), complete, "harvest finished");
        HarvestResult {
            entity: entity.to_string(),
            records,
            complete,
            harvested_at: Utc::now(),
        }
    }

    async fn fetch_page(
        &self,
        fetcher: &dyn PageFetcher,
        url: &str,
        entity: &str,
    ) -> Result<Vec<FlatRecord>, PageError> {
        let envelope = fetcher.fetch_json(url).await?;
        normalize_envelope(&envelope, entity).ok_or_else(|| PageError::Envelope {
            entity: entity.to_string(),
        })
    }
}
