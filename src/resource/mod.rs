//! The resource collaborator: the data subscribers are notified about.
//!
//! The Matcher asks a [`ResourceCatalog`] whether a resource changed since a
//! checkpoint; the Callback Handler asks it for the filtered, projected rows to
//! render. The query language is deliberately small: a list of
//! `selector op value` filters in the `~.field__op=value` form used on the
//! callback URL.

use std::fmt;

use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::types::ResourceName;

pub mod memory;

pub use memory::{FieldKind, FieldSpec, MemoryCatalog, MemoryResource};

/// Name of the creation timestamp field, always part of a report.
pub const CREATED_ON: &str = "created_on";

/// Name of the modification timestamp field a resource must have to be tracked.
pub const MODIFIED_ON: &str = "modified_on";

/// Selector prefix meaning "a field of the queried resource".
pub const SELF_PREFIX: &str = "~.";

/// Errors from the resource collaborator.
#[derive(Debug, Error)]
pub enum ResourceError {
    /// The resource has no modification timestamp and can never be checked.
    #[error("resource {0} has no modification tracking")]
    Untracked(ResourceName),

    #[error("unknown resource: {0}")]
    UnknownResource(ResourceName),

    #[error("unknown field {field} on resource {resource}")]
    UnknownField {
        resource: ResourceName,
        field: String,
    },

    /// The backing source failed.
    #[error("query failed: {0}")]
    Query(String),
}

/// Comparison operator of a [`FieldFilter`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    /// Case-insensitive substring match; `*` is ignored.
    Like,
}

impl FilterOp {
    fn from_suffix(suffix: &str) -> Option<Self> {
        match suffix {
            "eq" => Some(FilterOp::Eq),
            "ne" => Some(FilterOp::Ne),
            "lt" => Some(FilterOp::Lt),
            "le" => Some(FilterOp::Le),
            "gt" => Some(FilterOp::Gt),
            "ge" => Some(FilterOp::Ge),
            "like" => Some(FilterOp::Like),
            _ => None,
        }
    }

    pub fn suffix(&self) -> &'static str {
        match self {
            FilterOp::Eq => "eq",
            FilterOp::Ne => "ne",
            FilterOp::Lt => "lt",
            FilterOp::Le => "le",
            FilterOp::Gt => "gt",
            FilterOp::Ge => "ge",
            FilterOp::Like => "like",
        }
    }
}

/// One `selector op value` condition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldFilter {
    /// Selector as it appears on the wire, e.g. `~.modified_on`.
    pub selector: String,
    pub op: FilterOp,
    pub value: String,
}

impl FieldFilter {
    pub fn new(selector: impl Into<String>, op: FilterOp, value: impl Into<String>) -> Self {
        FieldFilter {
            selector: selector.into(),
            op,
            value: value.into(),
        }
    }

    /// Parses a query parameter such as `~.modified_on__ge=...`.
    ///
    /// A key without a recognized `__op` suffix is an equality filter.
    pub fn from_param(key: &str, value: &str) -> Self {
        if let Some((selector, suffix)) = key.rsplit_once("__")
            && let Some(op) = FilterOp::from_suffix(suffix)
        {
            return FieldFilter::new(selector, op, value);
        }
        FieldFilter::new(key, FilterOp::Eq, value)
    }

    /// Encodes this filter as a query parameter key/value pair.
    pub fn to_param(&self) -> (String, String) {
        let key = match self.op {
            FilterOp::Eq => self.selector.clone(),
            op => format!("{}__{}", self.selector, op.suffix()),
        };
        (key, self.value.clone())
    }

    /// The field name with any resource prefix removed.
    pub fn field(&self) -> &str {
        self.selector
            .strip_prefix(SELF_PREFIX)
            .unwrap_or(&self.selector)
    }
}

impl fmt::Display for FieldFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (key, value) = self.to_param();
        write!(f, "{key}={value}")
    }
}

/// A filtered, projected read of one resource.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordQuery {
    pub resource: ResourceName,
    pub fields: Vec<String>,
    pub filters: Vec<FieldFilter>,
}

/// Column metadata of a [`RecordSet`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Column {
    pub field: String,
    pub label: String,
    /// Primary key or reference column; not shown in digests.
    pub is_id: bool,
}

/// One row, with values rendered for display in column order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    pub values: Vec<String>,
    pub created_on: Option<DateTime<Utc>>,
}

/// Result of a [`RecordQuery`].
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct RecordSet {
    pub columns: Vec<Column>,
    pub rows: Vec<Record>,
}

impl RecordSet {
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

/// The field lists a resource offers for reports.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ReportFields {
    /// Fields configured specifically for notifications.
    pub notify_fields: Option<Vec<String>>,
    /// Fields configured for list views.
    pub list_fields: Option<Vec<String>>,
    /// Every readable field, in declaration order.
    pub readable: Vec<String>,
    /// Whether rows carry a `created_on` timestamp.
    pub tracks_creation: bool,
}

impl ReportFields {
    /// Picks notify fields, else list fields, else all readable fields, and
    /// appends `created_on` if the resource has it and it is missing.
    pub fn resolve(&self) -> Vec<String> {
        let mut fields = self
            .notify_fields
            .clone()
            .filter(|f| !f.is_empty())
            .or_else(|| self.list_fields.clone().filter(|f| !f.is_empty()))
            .unwrap_or_else(|| self.readable.clone());
        if self.tracks_creation && !fields.iter().any(|f| f == CREATED_ON) {
            fields.push(CREATED_ON.to_string());
        }
        fields
    }
}

/// Read access to monitored resources.
pub trait ResourceCatalog: Send + Sync {
    /// Returns the newest modification timestamp at or after `since`
    /// (`None` means since the beginning), or `None` if nothing changed.
    ///
    /// # Errors
    ///
    /// [`ResourceError::Untracked`] if the resource has no modification
    /// timestamp.
    fn newest_modification(
        &self,
        resource: &ResourceName,
        since: Option<DateTime<Utc>>,
    ) -> Result<Option<DateTime<Utc>>, ResourceError>;

    fn report_fields(&self, resource: &ResourceName) -> Result<ReportFields, ResourceError>;

    /// Human-readable plural name of the resource, if configured.
    fn display_name(&self, resource: &ResourceName) -> Option<String>;

    /// Translates a stored predicate field into a selector for `resource`.
    fn prefix_selector(&self, _resource: &ResourceName, field: &str) -> String {
        if field.starts_with(SELF_PREFIX) {
            field.to_string()
        } else {
            format!("{SELF_PREFIX}{field}")
        }
    }

    /// Runs a filtered, projected query.
    fn select(&self, query: &RecordQuery) -> Result<RecordSet, ResourceError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_operator_suffixes() {
        let f = FieldFilter::from_param("~.modified_on__ge", "2024-01-01T00:00:00Z");
        assert_eq!(f.selector, "~.modified_on");
        assert_eq!(f.op, FilterOp::Ge);
        assert_eq!(f.field(), "modified_on");

        let eq = FieldFilter::from_param("~.status", "open");
        assert_eq!(eq.op, FilterOp::Eq);
        assert_eq!(eq.field(), "status");
    }

    #[test]
    fn unknown_suffix_is_part_of_the_selector() {
        let f = FieldFilter::from_param("~.due__date", "2024");
        assert_eq!(f.selector, "~.due__date");
        assert_eq!(f.op, FilterOp::Eq);
    }

    #[test]
    fn to_param_inverts_from_param() {
        for (key, value) in [("~.created_on__ge", "x"), ("~.name", "y"), ("~.n__like", "z")] {
            let f = FieldFilter::from_param(key, value);
            assert_eq!(f.to_param(), (key.to_string(), value.to_string()));
        }
    }

    #[test]
    fn report_fields_priority() {
        let readable = vec!["name".to_string(), "status".to_string()];
        let all = ReportFields {
            notify_fields: Some(vec!["name".into()]),
            list_fields: Some(vec!["status".into()]),
            readable: readable.clone(),
            tracks_creation: true,
        };
        assert_eq!(all.resolve(), vec!["name", "created_on"]);

        let list_only = ReportFields {
            notify_fields: None,
            list_fields: Some(vec!["status".into(), "created_on".into()]),
            readable: readable.clone(),
            tracks_creation: true,
        };
        assert_eq!(list_only.resolve(), vec!["status", "created_on"]);

        let readable_only = ReportFields {
            notify_fields: Some(vec![]),
            list_fields: None,
            readable: readable.clone(),
            tracks_creation: true,
        };
        assert_eq!(readable_only.resolve(), vec!["name", "status", "created_on"]);

        let without_creation = ReportFields {
            notify_fields: None,
            list_fields: None,
            readable,
            tracks_creation: false,
        };
        assert_eq!(without_creation.resolve(), vec!["name", "status"]);
    }
}
