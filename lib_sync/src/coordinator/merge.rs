//! Applies a push notification to the current value of a resource.
//!
//! | action    | current value        | result                                   |
//! |-----------|----------------------|------------------------------------------|
//! | replace   | anything             | payload becomes the value                |
//! | create    | list                 | append, or update the item with that id  |
//! | create    | object               | same as update                           |
//! | update    | object               | shallow merge of payload fields          |
//! | update    | list                 | shallow merge into the item with that id |
//! | delete    | list                 | drop items with that id                  |
//! | delete    | record or scalar     | `null`                                   |
//! | other     | any                  | invalidate                               |

use serde_json::Value;

use crate::ingestors::frames::{id_of, Action, NotificationMessage};

/// What to do with a notification.
#[derive(Debug, Clone, PartialEq)]
pub enum MergeOutcome {
    /// The new value of the resource.
    Applied(Value),
    /// The payload cannot be applied safely; drop the value and refetch.
    Invalidate(&'static str),
}

/// Merges `message` into `current`.
pub fn merge(current: Option<&Value>, message: &NotificationMessage) -> MergeOutcome {
    let id = message.resource_id.as_deref();

    match (&message.action, current) {
        (Action::Replace, _) => MergeOutcome::Applied(message.data.clone()),
        (Action::Unknown(_), _) => MergeOutcome::Invalidate("unmapped event"),
        (_, None) => MergeOutcome::Invalidate("no current value"),

        (Action::Create, Some(Value::Array(items))) => {
            if id.is_some_and(|id| position(items, id).is_some()) {
                update_list(items, id, &message.data)
            } else {
                let mut items = items.clone();
                items.push(message.data.clone());
                MergeOutcome::Applied(Value::Array(items))
            }
        }
        (Action::Create | Action::Update, Some(Value::Object(fields))) => {
            match &message.data {
                Value::Object(patch) => {
                    let mut merged = fields.clone();
                    for (name, value) in patch {
                        merged.insert(name.clone(), value.clone());
                    }
                    MergeOutcome::Applied(Value::Object(merged))
                }
                _ => MergeOutcome::Invalidate("non-object patch"),
            }
        }
        (Action::Update, Some(Value::Array(items))) => update_list(items, id, &message.data),
        (Action::Create | Action::Update, Some(_)) => MergeOutcome::Invalidate("scalar value"),

        (Action::Delete, Some(Value::Array(items))) => match id {
            Some(id) => MergeOutcome::Applied(Value::Array(
                items
                    .iter()
                    .filter(|item| id_of(item).as_deref() != Some(id))
                    .cloned()
                    .collect(),
            )),
            None => MergeOutcome::Invalidate("delete without id"),
        },
        (Action::Delete, Some(value)) if value.is_object() => match (id, id_of(value)) {
            (Some(wanted), Some(own)) if wanted != own => {
                MergeOutcome::Invalidate("delete of another record")
            }
            _ => MergeOutcome::Applied(Value::Null),
        },
        (Action::Delete, Some(_)) => MergeOutcome::Applied(Value::Null),
    }
}

fn position(items: &[Value], id: &str) -> Option<usize> {
    items.iter().position(|item| id_of(item).as_deref() == Some(id))
}

fn update_list(items: &[Value], id: Option<&str>, patch: &Value) -> MergeOutcome {
    let Some(index) = id.and_then(|id| position(items, id)) else {
        return MergeOutcome::Invalidate("item not in list");
    };
    let (Value::Object(item), Value::Object(patch)) = (&items[index], patch) else {
        return MergeOutcome::Invalidate("non-object item");
    };

    let mut item = item.clone();
    for (name, value) in patch {
        item.insert(name.clone(), value.clone());
    }
    let mut items = items.to_vec();
    items[index] = Value::Object(item);
    MergeOutcome::Applied(Value::Array(items))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn message(event: &str, data: Value) -> NotificationMessage {
        NotificationMessage {
            resource_type: "orders".into(),
            resource_id: id_of(&data),
            action: Action::from_event(event),
            event: event.into(),
            data,
            timestamp: None,
        }
    }

    #[test]
    fn replace_overwrites_anything() {
        let msg = message("snapshot", json!([1, 2]));
        assert_eq!(merge(None, &msg), MergeOutcome::Applied(json!([1, 2])));
        assert_eq!(
            merge(Some(&json!({"a": 1})), &msg),
            MergeOutcome::Applied(json!([1, 2]))
        );
    }

    #[test]
    fn create_appends_once() {
        let list = json!([{"id": 1, "s": "a"}]);
        let created = merge(Some(&list), &message("created", json!({"id": 2, "s": "b"})));
        assert_eq!(
            created,
            MergeOutcome::Applied(json!([{"id": 1, "s": "a"}, {"id": 2, "s": "b"}]))
        );

        let again = merge(Some(&list), &message("created", json!({"id": 1, "s": "z"})));
        assert_eq!(again, MergeOutcome::Applied(json!([{"id": 1, "s": "z"}])));
    }

    #[test]
    fn update_merges_objects_and_list_items() {
        let record = json!({"id": 5, "status": "open", "total": 10});
        assert_eq!(
            merge(Some(&record), &message("updated", json!({"id": 5, "status": "paid"}))),
            MergeOutcome::Applied(json!({"id": 5, "status": "paid", "total": 10}))
        );

        let list = json!([{"id": 5, "status": "open"}, {"id": 6, "status": "open"}]);
        assert_eq!(
            merge(Some(&list), &message("updated", json!({"id": 6, "status": "paid"}))),
            MergeOutcome::Applied(json!([{"id": 5, "status": "open"}, {"id": 6, "status": "paid"}]))
        );
    }

    #[test]
    fn update_that_cannot_be_applied_invalidates() {
        let list = json!([{"id": 5}]);
        assert!(matches!(
            merge(Some(&list), &message("updated", json!({"id": 9}))),
            MergeOutcome::Invalidate(_)
        ));
        assert!(matches!(
            merge(Some(&json!(42)), &message("updated", json!({"id": 9}))),
            MergeOutcome::Invalidate(_)
        ));
        assert!(matches!(
            merge(None, &message("updated", json!({"id": 9}))),
            MergeOutcome::Invalidate(_)
        ));
    }

    #[test]
    fn delete_removes_by_id_or_nulls_out() {
        let list = json!([{"id": "a"}, {"id": "b"}]);
        assert_eq!(
            merge(Some(&list), &message("deleted", json!({"id": "a"}))),
            MergeOutcome::Applied(json!([{"id": "b"}]))
        );
        assert_eq!(
            merge(Some(&json!(17)), &message("removed", json!({}))),
            MergeOutcome::Applied(Value::Null)
        );
        assert_eq!(
            merge(Some(&json!({"id": "a"})), &message("deleted", json!({"id": "a"}))),
            MergeOutcome::Applied(Value::Null)
        );
        assert!(matches!(
            merge(Some(&json!({"id": "a"})), &message("deleted", json!({"id": "b"}))),
            MergeOutcome::Invalidate(_)
        ));
    }

    #[test]
    fn unmapped_event_invalidates() {
        assert_eq!(
            merge(Some(&json!([])), &message("recalculated", json!({}))),
            MergeOutcome::Invalidate("unmapped event")
        );
    }
}
