//! Shared test fixtures and generators.

use std::collections::BTreeSet;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use proptest::prelude::*;
use serde_json::{Map, Value, json};

use crate::delivery::{DeliveryChannel, DeliveryError, OutgoingMessage};
use crate::resource::{FieldSpec, MemoryCatalog, MemoryResource};
use crate::store::NewSubscription;
use crate::template::MiniJinjaTemplates;
use crate::types::{
    DeliveryMethod, Frequency, ResourceName, SubscriberId, Trigger, encode_iso,
};

/// Subscriber used by [`subscription`].
pub const SUBSCRIBER: SubscriberId = SubscriberId(7);

/// A fixed reference instant that subscriptions are created at.
pub fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap()
}

/// Builds a subscription for [`SUBSCRIBER`] notified by email.
///
/// Each resource gets the callback path `<module>/<name>` derived from its
/// table-style name.
pub fn subscription(
    frequency: Frequency,
    triggers: &[Trigger],
    resources: &[&str],
) -> NewSubscription {
    NewSubscription {
        subscriber: SUBSCRIBER,
        frequency,
        triggers: triggers.iter().copied().collect(),
        methods: BTreeSet::from([DeliveryMethod::Email]),
        filter_id: None,
        resources: resources
            .iter()
            .map(|r| (ResourceName::new(*r), r.replacen('_', "/", 1)))
            .collect(),
    }
}

/// A `project_task` row with status `open`.
pub fn task_record(
    id: u64,
    name: &str,
    created_on: DateTime<Utc>,
    modified_on: DateTime<Utc>,
) -> Map<String, Value> {
    let mut row = Map::new();
    row.insert("id".into(), json!(id));
    row.insert("name".into(), json!(name));
    row.insert("status".into(), json!("open"));
    row.insert("created_on".into(), json!(encode_iso(created_on)));
    row.insert("modified_on".into(), json!(encode_iso(modified_on)));
    row
}

/// A catalog with a tracked `project_task` resource (one row, last modified a
/// day before [`t0`]) and an untracked `org_office` resource.
pub fn task_catalog() -> MemoryCatalog {
    let catalog = MemoryCatalog::new();
    let day_before = t0() - chrono::Duration::days(1);
    catalog.insert(
        "project_task",
        MemoryResource {
            label: Some("Tasks".into()),
            fields: vec![
                FieldSpec::id("id"),
                FieldSpec::text("name"),
                FieldSpec::text("status"),
                FieldSpec::timestamp("created_on"),
                FieldSpec::timestamp("modified_on"),
            ],
            notify_fields: None,
            list_fields: Some(vec!["id".into(), "name".into(), "status".into()]),
            records: vec![task_record(1, "Fix roof", day_before, day_before)],
        },
    )
    .unwrap();
    catalog.insert(
        "org_office",
        MemoryResource {
            label: None,
            fields: vec![FieldSpec::id("id"), FieldSpec::text("name")],
            notify_fields: None,
            list_fields: None,
            records: vec![],
        },
    )
    .unwrap();
    catalog
}

/// Minimal templates for every delivery method.
pub fn default_templates() -> MiniJinjaTemplates {
    let body = "{{ system }}: {{ resource }}\
{% if new %} new={{ new }}{% for row in new_records.rows %} [{{ row | join(\"|\") }}]{% endfor %}{% endif %}\
{% if upd %} upd={{ upd }}{% for row in upd_records.rows %} [{{ row | join(\"|\") }}]{% endfor %}{% endif %}";
    MiniJinjaTemplates::in_memory(
        DeliveryMethod::ALL.map(|m| (format!("msg/notify_{}.html", m.template_name()), body)),
    )
}

/// A delivery channel that records what it was asked to send.
#[derive(Debug, Default)]
pub struct RecordingChannel {
    sent: Mutex<Vec<(SubscriberId, OutgoingMessage)>>,
    failure: Option<String>,
}

impl RecordingChannel {
    /// A channel whose every send is rejected with `reason`.
    pub fn failing(reason: &str) -> Self {
        RecordingChannel {
            sent: Mutex::new(Vec::new()),
            failure: Some(reason.to_string()),
        }
    }

    pub fn sent(&self) -> Vec<(SubscriberId, OutgoingMessage)> {
        self.sent.lock().unwrap().clone()
    }
}

#[async_trait]
impl DeliveryChannel for RecordingChannel {
    async fn send(
        &self,
        recipient: SubscriberId,
        message: &OutgoingMessage,
    ) -> Result<(), DeliveryError> {
        if let Some(reason) = &self.failure {
            return Err(DeliveryError::Rejected {
                method: message.method,
                reason: reason.clone(),
            });
        }
        self.sent.lock().unwrap().push((recipient, message.clone()));
        Ok(())
    }
}

pub fn arb_frequency() -> impl Strategy<Value = Frequency> {
    prop_oneof![
        Just(Frequency::Never),
        Just(Frequency::Hourly),
        Just(Frequency::Daily),
        Just(Frequency::Weekly),
    ]
}

pub fn arb_triggers() -> impl Strategy<Value = BTreeSet<Trigger>> {
    prop::collection::btree_set(prop_oneof![Just(Trigger::New), Just(Trigger::Updated)], 0..=2)
}
