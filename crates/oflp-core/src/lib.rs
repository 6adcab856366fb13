//! Core domain model for OFLP: dataset queries, harvested records,
//! scoring vocabulary, and the pipeline client document.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map as JsonMap, Value as JsonValue};
use thiserror::Error;

pub const CRATE_NAME: &str = "oflp-core";

/// Sentinel string permitted for any pipeline field whose value is not yet
/// known.
pub const DATA_UNAVAILABLE: &str = "Data Unavailable";

/// One predicate inside a filter group. Field and value content is passed
/// through verbatim; the builder performs no escaping or validation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum FilterPredicate {
    Eq { field: String, value: String },
    Gt { field: String, value: String },
    Lt { field: String, value: String },
}

impl FilterPredicate {
    fn render(&self) -> String {
        match self {
            Self::Eq { field, value } => format!("{field} eq '{value}'"),
            Self::Gt { field, value } => format!("{field} gt {value}"),
            Self::Lt { field, value } => format!("{field} lt {value}"),
        }
    }
}

/// Predicates within a group are OR-joined; groups are AND-joined.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilterGroup {
    pub predicates: Vec<FilterPredicate>,
}

impl FilterGroup {
    /// Equality match against any of the given values, e.g.
    /// `(state eq 'NC' or state eq 'SC')`.
    pub fn any_eq<I, V>(field: &str, values: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: Into<String>,
    {
        Self {
            predicates: values
                .into_iter()
                .map(|value| FilterPredicate::Eq {
                    field: field.to_string(),
                    value: value.into(),
                })
                .collect(),
        }
    }

    /// Numeric non-zero match, e.g. `(federalShareObligated gt 0 or
    /// federalShareObligated lt 0)`.
    pub fn non_zero(field: &str) -> Self {
        Self {
            predicates: vec![
                FilterPredicate::Gt {
                    field: field.to_string(),
                    value: "0".to_string(),
                },
                FilterPredicate::Lt {
                    field: field.to_string(),
                    value: "0".to_string(),
                },
            ],
        }
    }

    fn render(&self) -> String {
        let joined = self
            .predicates
            .iter()
            .map(FilterPredicate::render)
            .collect::<Vec<_>>()
            .join(" or ");
        format!("({joined})")
    }
}

/// A filtered, field-limited query against the remote open-data service.
/// Immutable once built; callers append pagination parameters to the
/// rendered string, relying on the select/top/filter clause ordering.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatasetQuery {
    pub base_url: String,
    pub version: String,
    pub entity: String,
    pub select: Vec<String>,
    pub top: Option<u32>,
    pub filter_groups: Vec<FilterGroup>,
}

impl DatasetQuery {
    /// Renders `{base_url}/{version}/{entity}` plus, in this order:
    /// `$select`, `$top`, `$filter`. Clauses are omitted when empty/unset.
    pub fn to_query_string(&self) -> String {
        let mut query = format!("{}/{}/{}", self.base_url, self.version, self.entity);
        let mut params = Vec::new();
        if !self.select.is_empty() {
            params.push(format!("$select={}", self.select.join(",")));
        }
        if let Some(top) = self.top {
            params.push(format!("$top={top}"));
        }
        if !self.filter_groups.is_empty() {
            let filter = self
                .filter_groups
                .iter()
                .map(FilterGroup::render)
                .collect::<Vec<_>>()
                .join(" and ");
            params.push(format!("$filter={filter}"));
        }
        if !params.is_empty() {
            query.push('?');
            query.push_str(&params.join("&"));
        }
        query
    }
}

/// One flat record as returned by the service: field values preserved as
/// given, no coercion.
pub type FlatRecord = JsonMap<String, JsonValue>;

/// Accumulated output of one paginated harvest. `complete` is false when a
/// page call failed and the record set was truncated at that point.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HarvestResult {
    pub entity: String,
    pub records: Vec<FlatRecord>,
    pub complete: bool,
    pub harvested_at: DateTime<Utc>,
}

/// Extracts the record array from the entity-keyed response envelope.
/// Returns `None` when the envelope key is missing or not an array.
pub fn normalize_envelope(envelope: &JsonValue, entity: &str) -> Option<Vec<FlatRecord>> {
    let array = envelope.get(entity)?.as_array()?;
    Some(
        array
            .iter()
            .filter_map(|value| value.as_object().cloned())
            .collect(),
    )
}

/// Contracting scope level selecting which weight vector applies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    Local,
    State,
    Federal,
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Local => "local",
            Self::State => "state",
            Self::Federal => "federal",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown tier '{0}', expected local, state, or federal")]
pub struct UnknownTier(pub String);

impl FromStr for Tier {
    type Err = UnknownTier;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.to_ascii_lowercase().as_str() {
            "local" => Ok(Self::Local),
            "state" => Ok(Self::State),
            "federal" => Ok(Self::Federal),
            _ => Err(UnknownTier(raw.to_string())),
        }
    }
}

/// The five scored criteria. Ordering matches the weight tables.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Criterion {
    ScopeAlignment,
    ContractValue,
    InternalStaffingMatch,
    QualificationsMatch,
    DealOverview,
}

impl Criterion {
    pub const ALL: [Criterion; 5] = [
        Criterion::ScopeAlignment,
        Criterion::ContractValue,
        Criterion::InternalStaffingMatch,
        Criterion::QualificationsMatch,
        Criterion::DealOverview,
    ];
}

impl fmt::Display for Criterion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::ScopeAlignment => "scopeAlignment",
            Self::ContractValue => "contractValue",
            Self::InternalStaffingMatch => "internalStaffingMatch",
            Self::QualificationsMatch => "qualificationsMatch",
            Self::DealOverview => "dealOverview",
        };
        f.write_str(name)
    }
}

/// Recommendation band derived from the weighted total.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Band {
    AvoidUnlessJustified,
    ProceedWithCaution,
    Pursue,
}

impl fmt::Display for Band {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::AvoidUnlessJustified => "avoid unless justified",
            Self::ProceedWithCaution => "proceed with caution",
            Self::Pursue => "pursue",
        };
        f.write_str(name)
    }
}

/// One scoring evaluation. Derived on demand, never persisted.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DealScore {
    pub tier: Tier,
    pub criterion_scores: BTreeMap<Criterion, u8>,
    pub weighted_total: f64,
    pub band: Band,
}

/// One client/opportunity record. `ID` is the upsert key; every other
/// field is an open, caller-defined JSON value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClientRecord {
    #[serde(rename = "ID")]
    pub id: String,
    #[serde(flatten)]
    pub fields: BTreeMap<String, JsonValue>,
}

impl ClientRecord {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            fields: BTreeMap::new(),
        }
    }

    pub fn with_field(mut self, name: impl Into<String>, value: impl Into<JsonValue>) -> Self {
        self.fields.insert(name.into(), value.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("no client with ID '{0}' in the pipeline document")]
pub struct UnknownClientId(pub String);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    Inserted,
    Updated,
}

impl fmt::Display for UpsertOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Inserted => "inserted",
            Self::Updated => "updated",
        };
        f.write_str(name)
    }
}

/// The persisted ledger of known/prospective clients. IDs are unique;
/// upserts merge into the first matching record or append a new one.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PipelineDocument {
    pub clients: Vec<ClientRecord>,
}

impl PipelineDocument {
    /// Merges `incoming` into the first record with a matching ID
    /// (incoming fields overwrite, others untouched), or appends it.
    pub fn upsert(&mut self, incoming: ClientRecord) -> UpsertOutcome {
        for client in &mut self.clients {
            if client.id == incoming.id {
                for (name, value) in incoming.fields {
                    client.fields.insert(name, value);
                }
                return UpsertOutcome::Updated;
            }
        }
        self.clients.push(incoming);
        UpsertOutcome::Inserted
    }

    /// Update-only variant: fails explicitly when the ID is unknown
    /// instead of silently doing nothing.
    pub fn update(
        &mut self,
        id: &str,
        fields: BTreeMap<String, JsonValue>,
    ) -> Result<(), UnknownClientId> {
        for client in &mut self.clients {
            if client.id == id {
                for (name, value) in fields {
                    client.fields.insert(name, value);
                }
                return Ok(());
            }
        }
        Err(UnknownClientId(id.to_string()))
    }

    pub fn get(&self, id: &str) -> Option<&ClientRecord> {
        self.clients.iter().find(|client| client.id == id)
    }
}
