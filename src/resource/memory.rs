//! In-memory [`ResourceCatalog`] loaded from a JSON fixture.
//!
//! ```json
//! {
//!   "project_task": {
//!     "label": "Tasks",
//!     "fields": [
//!       {"name": "id", "kind": "id"},
//!       {"name": "name", "label": "Name"},
//!       {"name": "created_on", "kind": "timestamp"},
//!       {"name": "modified_on", "kind": "timestamp"}
//!     ],
//!     "records": [{"id": 1, "name": "Fix roof", "created_on": "2024-01-01T00:00:00Z"}]
//!   }
//! }
//! ```
//!
//! A resource is tracked for modifications iff it declares a `modified_on` field.

use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::RwLock;

use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::{Map, Value};

use super::{
    CREATED_ON, Column, FieldFilter, FilterOp, MODIFIED_ON, Record, RecordQuery, RecordSet,
    ReportFields, ResourceCatalog, ResourceError,
};
use crate::types::{ResourceName, decode_iso};

/// Kind of a resource field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldKind {
    Id,
    #[default]
    Text,
    Timestamp,
}

fn default_true() -> bool {
    true
}

/// Declaration of one field.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct FieldSpec {
    pub name: String,
    pub label: Option<String>,
    #[serde(default)]
    pub kind: FieldKind,
    #[serde(default = "default_true")]
    pub readable: bool,
}

impl FieldSpec {
    pub fn text(name: &str) -> Self {
        FieldSpec {
            name: name.to_string(),
            label: None,
            kind: FieldKind::Text,
            readable: true,
        }
    }

    pub fn timestamp(name: &str) -> Self {
        FieldSpec {
            kind: FieldKind::Timestamp,
            ..FieldSpec::text(name)
        }
    }

    pub fn id(name: &str) -> Self {
        FieldSpec {
            kind: FieldKind::Id,
            ..FieldSpec::text(name)
        }
    }

    /// Label shown in digests; defaults to the capitalized field name.
    pub fn display_label(&self) -> String {
        self.label
            .clone()
            .unwrap_or_else(|| capitalize_words(&self.name))
    }
}

/// One resource: its schema and rows.
#[derive(Debug, Clone, PartialEq, Default, Deserialize)]
pub struct MemoryResource {
    pub label: Option<String>,
    pub fields: Vec<FieldSpec>,
    pub notify_fields: Option<Vec<String>>,
    pub list_fields: Option<Vec<String>>,
    #[serde(default)]
    pub records: Vec<Map<String, Value>>,
}

impl MemoryResource {
    fn field(&self, name: &str) -> Option<&FieldSpec> {
        self.fields.iter().find(|f| f.name == name)
    }

    fn is_tracked(&self) -> bool {
        self.field(MODIFIED_ON).is_some()
    }
}

/// Catalog of resources held in memory.
#[derive(Debug, Default)]
pub struct MemoryCatalog {
    resources: RwLock<BTreeMap<ResourceName, MemoryResource>>,
}

impl MemoryCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parses a catalog from its JSON fixture form.
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        let resources: BTreeMap<ResourceName, MemoryResource> = serde_json::from_str(json)?;
        Ok(MemoryCatalog {
            resources: RwLock::new(resources),
        })
    }

    pub fn load(path: &Path) -> Result<Self, ResourceError> {
        let json = std::fs::read_to_string(path)
            .map_err(|e| ResourceError::Query(format!("{}: {e}", path.display())))?;
        Self::from_json(&json).map_err(|e| ResourceError::Query(format!("{}: {e}", path.display())))
    }

    /// Adds or replaces a resource.
    pub fn insert(
        &self,
        name: impl Into<ResourceName>,
        resource: MemoryResource,
    ) -> Result<(), ResourceError> {
        let mut resources = self
            .resources
            .write()
            .map_err(|_| ResourceError::Query("catalog lock poisoned".into()))?;
        resources.insert(name.into(), resource);
        Ok(())
    }

    /// Appends a row to an existing resource.
    pub fn push_record(
        &self,
        name: &ResourceName,
        record: Map<String, Value>,
    ) -> Result<(), ResourceError> {
        let mut resources = self
            .resources
            .write()
            .map_err(|_| ResourceError::Query("catalog lock poisoned".into()))?;
        let resource = resources
            .get_mut(name)
            .ok_or_else(|| ResourceError::UnknownResource(name.clone()))?;
        resource.records.push(record);
        Ok(())
    }

    fn with_resource<T>(
        &self,
        name: &ResourceName,
        f: impl FnOnce(&MemoryResource) -> Result<T, ResourceError>,
    ) -> Result<T, ResourceError> {
        let resources = self
            .resources
            .read()
            .map_err(|_| ResourceError::Query("catalog lock poisoned".into()))?;
        let resource = resources
            .get(name)
            .ok_or_else(|| ResourceError::UnknownResource(name.clone()))?;
        f(resource)
    }
}

impl ResourceCatalog for MemoryCatalog {
    fn newest_modification(
        &self,
        resource: &ResourceName,
        since: Option<DateTime<Utc>>,
    ) -> Result<Option<DateTime<Utc>>, ResourceError> {
        self.with_resource(resource, |r| {
            if !r.is_tracked() {
                return Err(ResourceError::Untracked(resource.clone()));
            }
            Ok(r.records
                .iter()
                .filter_map(|row| timestamp(row.get(MODIFIED_ON)))
                .filter(|ts| since.is_none_or(|s| *ts >= s))
                .max())
        })
    }

    fn report_fields(&self, resource: &ResourceName) -> Result<ReportFields, ResourceError> {
        self.with_resource(resource, |r| {
            Ok(ReportFields {
                notify_fields: r.notify_fields.clone(),
                list_fields: r.list_fields.clone(),
                readable: r
                    .fields
                    .iter()
                    .filter(|f| f.readable)
                    .map(|f| f.name.clone())
                    .collect(),
                tracks_creation: r.field(CREATED_ON).is_some(),
            })
        })
    }

    fn display_name(&self, resource: &ResourceName) -> Option<String> {
        self.with_resource(resource, |r| Ok(r.label.clone()))
            .ok()
            .flatten()
    }

    fn select(&self, query: &RecordQuery) -> Result<RecordSet, ResourceError> {
        self.with_resource(&query.resource, |r| {
            let unknown = |field: &str| ResourceError::UnknownField {
                resource: query.resource.clone(),
                field: field.to_string(),
            };

            let mut columns = Vec::with_capacity(query.fields.len());
            for name in &query.fields {
                let spec = r.field(name).ok_or_else(|| unknown(name))?;
                columns.push(Column {
                    field: spec.name.clone(),
                    label: spec.display_label(),
                    is_id: spec.kind == FieldKind::Id,
                });
            }
            // Without a creation time no row was created after a bound, so a
            // `created_on` filter matches nothing instead of failing.
            for filter in &query.filters {
                if r.field(filter.field()).is_none() && filter.field() != CREATED_ON {
                    return Err(unknown(filter.field()));
                }
            }

            let rows = r
                .records
                .iter()
                .filter(|row| query.filters.iter().all(|f| matches_filter(row, f)))
                .map(|row| Record {
                    values: columns
                        .iter()
                        .map(|c| display_value(row.get(&c.field)))
                        .collect(),
                    created_on: timestamp(row.get(CREATED_ON)),
                })
                .collect();

            Ok(RecordSet { columns, rows })
        })
    }
}

fn timestamp(value: Option<&Value>) -> Option<DateTime<Utc>> {
    value.and_then(Value::as_str).and_then(|s| decode_iso(s).ok())
}

fn display_value(value: Option<&Value>) -> String {
    match value {
        None | Some(Value::Null) => "-".to_string(),
        Some(Value::String(s)) => s.clone(),
        Some(other) => other.to_string(),
    }
}

/// Compares a stored value to a filter operand: as timestamps, then as
/// numbers, then as strings.
fn compare(stored: &Value, operand: &str) -> Option<Ordering> {
    let stored_str = match stored {
        Value::Null => return None,
        Value::String(s) => s.clone(),
        other => other.to_string(),
    };
    if let (Ok(a), Ok(b)) = (decode_iso(&stored_str), decode_iso(operand)) {
        return Some(a.cmp(&b));
    }
    if let (Ok(a), Ok(b)) = (stored_str.parse::<f64>(), operand.parse::<f64>()) {
        return a.partial_cmp(&b);
    }
    Some(stored_str.as_str().cmp(operand))
}

fn matches_filter(row: &Map<String, Value>, filter: &FieldFilter) -> bool {
    let stored = row.get(filter.field()).unwrap_or(&Value::Null);
    if filter.op == FilterOp::Like {
        let needle = filter.value.replace('*', "").to_lowercase();
        return match stored {
            Value::Null => false,
            Value::String(s) => s.to_lowercase().contains(&needle),
            other => other.to_string().to_lowercase().contains(&needle),
        };
    }
    let Some(ordering) = compare(stored, &filter.value) else {
        return filter.op == FilterOp::Ne;
    };
    match filter.op {
        FilterOp::Eq => ordering == Ordering::Equal,
        FilterOp::Ne => ordering != Ordering::Equal,
        FilterOp::Lt => ordering == Ordering::Less,
        FilterOp::Le => ordering != Ordering::Greater,
        FilterOp::Gt => ordering == Ordering::Greater,
        FilterOp::Ge => ordering != Ordering::Less,
        FilterOp::Like => false,
    }
}

/// `project_task` -> `Project Task`.
pub(crate) fn capitalize_words(s: &str) -> String {
    s.split(['_', ' '])
        .filter(|w| !w.is_empty())
        .map(|w| {
            let mut chars = w.chars();
            match chars.next() {
                Some(first) => first.to_uppercase().chain(chars).collect(),
                None => String::new(),
            }
        })
        .collect::<Vec<String>>()
        .join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    const FIXTURE: &str = r#"{
        "project_task": {
            "label": "Tasks",
            "fields": [
                {"name": "id", "kind": "id"},
                {"name": "name", "label": "Task"},
                {"name": "status"},
                {"name": "hours"},
                {"name": "secret", "readable": false},
                {"name": "created_on", "kind": "timestamp"},
                {"name": "modified_on", "kind": "timestamp"}
            ],
            "list_fields": ["id", "name", "status"],
            "records": [
                {"id": 1, "name": "Fix roof", "status": "open", "hours": 3,
                 "created_on": "2024-01-01T00:00:00Z", "modified_on": "2024-01-05T00:00:00Z"},
                {"id": 2, "name": "Paint fence", "status": "closed", "hours": 12,
                 "created_on": "2024-01-03T00:00:00Z", "modified_on": "2024-01-03T00:00:00Z"},
                {"id": 3, "name": "Mow lawn", "status": null, "hours": 1,
                 "created_on": "2024-01-04T00:00:00Z"}
            ]
        },
        "org_office": {
            "fields": [{"name": "name"}],
            "records": [{"name": "HQ"}]
        },
        "org_event": {
            "fields": [
                {"name": "name"},
                {"name": "modified_on", "kind": "timestamp"}
            ],
            "records": [{"name": "Launch", "modified_on": "2024-01-05T00:00:00Z"}]
        }
    }"#;

    fn catalog() -> MemoryCatalog {
        MemoryCatalog::from_json(FIXTURE).unwrap()
    }

    fn task() -> ResourceName {
        ResourceName::new("project_task")
    }

    fn day(d: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, d, 0, 0, 0).unwrap()
    }

    #[test]
    fn newest_modification_respects_since() {
        let c = catalog();
        assert_eq!(c.newest_modification(&task(), None).unwrap(), Some(day(5)));
        assert_eq!(
            c.newest_modification(&task(), Some(day(5))).unwrap(),
            Some(day(5))
        );
        assert_eq!(c.newest_modification(&task(), Some(day(6))).unwrap(), None);
    }

    #[test]
    fn untracked_and_unknown_resources() {
        let c = catalog();
        assert!(matches!(
            c.newest_modification(&ResourceName::new("org_office"), None),
            Err(ResourceError::Untracked(_))
        ));
        assert!(matches!(
            c.newest_modification(&ResourceName::new("nope"), None),
            Err(ResourceError::UnknownResource(_))
        ));
    }

    #[test]
    fn report_fields_skip_unreadable() {
        let fields = catalog().report_fields(&task()).unwrap();
        assert!(!fields.readable.contains(&"secret".to_string()));
        assert_eq!(fields.resolve(), vec!["id", "name", "status", "created_on"]);
    }

    #[test]
    fn select_filters_and_projects() {
        let c = catalog();
        let set = c
            .select(&RecordQuery {
                resource: task(),
                fields: vec!["id".into(), "name".into(), "status".into()],
                filters: vec![
                    FieldFilter::from_param("~.created_on__ge", "2024-01-02T00:00:00Z"),
                    FieldFilter::from_param("~.hours__lt", "20"),
                ],
            })
            .unwrap();

        assert_eq!(set.columns.len(), 3);
        assert!(set.columns[0].is_id);
        assert_eq!(set.columns[1].label, "Task");
        assert_eq!(set.columns[2].label, "Status");
        assert_eq!(set.rows.len(), 2);
        assert_eq!(set.rows[0].values, vec!["2", "Paint fence", "closed"]);
        assert_eq!(set.rows[1].values, vec!["3", "Mow lawn", "-"]);
        assert_eq!(set.rows[1].created_on, Some(day(4)));
    }

    #[test]
    fn resource_without_creation_time_is_selectable() {
        let c = catalog();
        let event = ResourceName::new("org_event");
        assert_eq!(c.newest_modification(&event, None).unwrap(), Some(day(5)));

        let fields = c.report_fields(&event).unwrap();
        assert!(!fields.tracks_creation);
        assert_eq!(fields.resolve(), vec!["name", "modified_on"]);

        let updated = c
            .select(&RecordQuery {
                resource: event.clone(),
                fields: fields.resolve(),
                filters: vec![FieldFilter::from_param("~.modified_on__ge", "2024-01-02T00:00:00Z")],
            })
            .unwrap();
        assert_eq!(updated.rows.len(), 1);
        assert_eq!(updated.rows[0].created_on, None);

        let created = c
            .select(&RecordQuery {
                resource: event,
                fields: fields.resolve(),
                filters: vec![FieldFilter::from_param("~.created_on__ge", "2024-01-02T00:00:00Z")],
            })
            .unwrap();
        assert!(created.is_empty());
    }

    #[test]
    fn numeric_comparison_is_not_lexicographic() {
        let set = catalog()
            .select(&RecordQuery {
                resource: task(),
                fields: vec!["name".into()],
                filters: vec![FieldFilter::from_param("~.hours__gt", "5")],
            })
            .unwrap();
        assert_eq!(set.rows.len(), 1);
        assert_eq!(set.rows[0].values, vec!["Paint fence"]);
    }

    #[test]
    fn like_and_ne_filters() {
        let c = catalog();
        let like = c
            .select(&RecordQuery {
                resource: task(),
                fields: vec!["name".into()],
                filters: vec![FieldFilter::from_param("~.name__like", "*ROOF*")],
            })
            .unwrap();
        assert_eq!(like.rows.len(), 1);

        let ne = c
            .select(&RecordQuery {
                resource: task(),
                fields: vec!["name".into()],
                filters: vec![FieldFilter::from_param("~.status__ne", "open")],
            })
            .unwrap();
        assert_eq!(ne.rows.len(), 2);
    }

    #[test]
    fn unknown_field_is_an_error() {
        let result = catalog().select(&RecordQuery {
            resource: task(),
            fields: vec!["colour".into()],
            filters: vec![],
        });
        assert!(matches!(result, Err(ResourceError::UnknownField { .. })));
    }

    #[test]
    fn poisoned_catalog_rejects_inserts() {
        let c = catalog();
        std::thread::scope(|s| {
            let poisoner = s.spawn(|| {
                let _guard = c.resources.write().unwrap();
                panic!("poison the catalog lock");
            });
            assert!(poisoner.join().is_err());
        });

        let result = c.insert("org_site", MemoryResource::default());
        assert!(matches!(result, Err(ResourceError::Query(_))));
    }

    #[test]
    fn push_record_is_visible_to_queries() {
        let c = catalog();
        c.push_record(
            &task(),
            json!({"id": 4, "name": "New", "modified_on": "2024-02-01T00:00:00Z"})
                .as_object()
                .unwrap()
                .clone(),
        )
        .unwrap();
        assert_eq!(
            c.newest_modification(&task(), None).unwrap(),
            Some(Utc.with_ymd_and_hms(2024, 2, 1, 0, 0, 0).unwrap())
        );
    }

    #[test]
    fn display_name_and_capitalization() {
        let c = catalog();
        assert_eq!(c.display_name(&task()).as_deref(), Some("Tasks"));
        assert_eq!(c.display_name(&ResourceName::new("org_office")), None);
        assert_eq!(capitalize_words("project_task"), "Project Task");
        assert_eq!(c.prefix_selector(&task(), "status"), "~.status");
        assert_eq!(c.prefix_selector(&task(), "~.status"), "~.status");
    }
}
