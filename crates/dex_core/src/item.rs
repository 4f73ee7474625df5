//! Stored records and operation responses.

use crate::error::{CoreError, CoreResult};
use dex_engine::{TransactionMode, Value};
use serde::{Deserialize, Serialize};

/// Type tag carried by every record dex writes.
pub const ITEM_TYPE: &str = "dex";

/// A stored record: `{ "type": "dex", "key": <key>, "value": <value> }`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Item {
    /// Type tag, `"dex"` for records written by dex.
    #[serde(rename = "type")]
    pub kind: String,
    /// Record key.
    pub key: String,
    /// User value.
    pub value: Value,
}

impl Item {
    /// Creates a tagged item.
    pub fn new(key: impl Into<String>, value: Value) -> Self {
        Self {
            kind: ITEM_TYPE.to_string(),
            key: key.into(),
            value,
        }
    }

    /// Returns true if the item carries the dex type tag.
    pub fn is_tagged(&self) -> bool {
        self.kind == ITEM_TYPE
    }

    /// Converts the item to the JSON record stored by the engine.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::Serialization`] if the value cannot be encoded.
    pub fn to_value(&self) -> CoreResult<Value> {
        Ok(serde_json::to_value(self)?)
    }

    /// Decodes an item from a stored record.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::Serialization`] if the record is not item-shaped.
    pub fn from_value(value: Value) -> CoreResult<Self> {
        Ok(serde_json::from_value(value)?)
    }
}

/// A value handed to `set`.
#[derive(Debug, Clone, PartialEq)]
pub enum StoredValue {
    /// A plain value, wrapped into an [`Item`] before writing.
    Raw(Value),
    /// An already tagged item, written as-is.
    Tagged(Item),
}

impl StoredValue {
    /// Resolves the record to write under `key`.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::KeyMismatch`] if a tagged item carries another key.
    pub fn into_item(self, key: &str) -> CoreResult<Item> {
        match self {
            Self::Raw(value) => Ok(Item::new(key, value)),
            Self::Tagged(item) if item.key == key => Ok(item),
            Self::Tagged(item) => Err(CoreError::KeyMismatch {
                key: key.to_string(),
                item_key: item.key,
            }),
        }
    }
}

impl From<Value> for StoredValue {
    fn from(value: Value) -> Self {
        Self::Raw(value)
    }
}

impl From<Item> for StoredValue {
    fn from(item: Item) -> Self {
        Self::Tagged(item)
    }
}

/// Kind of engine request behind a [`Response`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestKind {
    /// A write.
    Put,
    /// A read.
    Get,
    /// A delete.
    Delete,
}

/// Completion notification of an engine request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestEvent {
    /// Request kind.
    pub kind: RequestKind,
    /// Id of the transaction the request ran in.
    pub transaction: u64,
    /// Mode of that transaction.
    pub mode: TransactionMode,
    /// Object store the request addressed.
    pub store: String,
}

/// Result of a `set`, `get` or `del`.
///
/// `item` is the engine payload: the key for `set`, the stored record for
/// `get`, and `None` for `del` or a missing key.
#[derive(Debug, Clone, PartialEq)]
pub struct Response {
    /// Engine payload.
    pub item: Option<Value>,
    /// Completion notification.
    pub event: RequestEvent,
}

impl Response {
    /// Decodes the payload as a stored record.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::Serialization`] if the payload is not a record.
    pub fn record(&self) -> CoreResult<Option<Item>> {
        self.item.clone().map(Item::from_value).transpose()
    }

    /// Returns the payload when it is a key (the result of `set`).
    pub fn key(&self) -> Option<&str> {
        self.item.as_ref().and_then(Value::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn item_serializes_with_type_tag() {
        let item = Item::new("a", json!({ "n": 1 }));
        assert_eq!(
            item.to_value().unwrap(),
            json!({ "type": "dex", "key": "a", "value": { "n": 1 } })
        );
        assert!(item.is_tagged());
    }

    #[test]
    fn raw_values_are_wrapped() {
        let item = StoredValue::from(json!("hello")).into_item("a").unwrap();
        assert_eq!(item, Item::new("a", json!("hello")));
    }

    #[test]
    fn tagged_items_are_not_wrapped_twice() {
        let tagged = Item::new("a", json!([1, 2]));
        let item = StoredValue::from(tagged.clone()).into_item("a").unwrap();
        assert_eq!(item, tagged);
    }

    #[test]
    fn tagged_item_with_other_key_is_rejected() {
        let result = StoredValue::from(Item::new("b", json!(1))).into_item("a");
        assert!(matches!(result, Err(CoreError::KeyMismatch { .. })));
    }

    #[test]
    fn response_record_decodes_payload() {
        let response = Response {
            item: Some(json!({ "type": "dex", "key": "a", "value": 7 })),
            event: RequestEvent {
                kind: RequestKind::Get,
                transaction: 1,
                mode: TransactionMode::ReadOnly,
                store: "__dex__".into(),
            },
        };
        assert_eq!(response.record().unwrap(), Some(Item::new("a", json!(7))));
        assert_eq!(response.key(), None);
    }

    #[test]
    fn response_record_rejects_foreign_payload() {
        let response = Response {
            item: Some(json!(42)),
            event: RequestEvent {
                kind: RequestKind::Get,
                transaction: 1,
                mode: TransactionMode::ReadOnly,
                store: "__dex__".into(),
            },
        };
        assert!(matches!(
            response.record(),
            Err(CoreError::Serialization { .. })
        ));
    }
}
