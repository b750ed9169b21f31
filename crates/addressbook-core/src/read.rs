//! Read pipeline: list every Book with a projection of its Addresses.
//!
//! The store does the join; this module only reshapes what comes back into
//! a keyed tree:
//!
//! ```text
//! { "root": {
//!     "<book id>": { "name": ..,
//!                    "addresses": { "<address id>": { .., "name": "First Last" } } } } }
//! ```

use addressbook_store::{Connection, Query};
use serde::Serialize;
use serde_json::{Map, Value};

use crate::catalog::{ADDRESS_LIST_FIELDS, BOOK, BOOK_ADDRESSES, KEY_FIELD};
use crate::error::{PipelineError, PipelineResult};
use crate::scope::TransactionScope;
use crate::AddressBook;

pub const ROOT_KEY: &str = "root";

/// Books keyed by id under a single `"root"` entry.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BookTree {
    root: Map<String, Value>,
}

impl BookTree {
    /// Book entries keyed by id.
    pub fn books(&self) -> &Map<String, Value> {
        &self.root
    }

    pub fn book(&self, id: &str) -> Option<&Map<String, Value>> {
        self.root.get(id).and_then(Value::as_object)
    }

    pub fn len(&self) -> usize {
        self.root.len()
    }

    pub fn is_empty(&self) -> bool {
        self.root.is_empty()
    }

    pub fn into_value(self) -> Value {
        let mut out = Map::new();
        out.insert(ROOT_KEY.to_string(), Value::Object(self.root));
        Value::Object(out)
    }
}

impl AddressBook {
    pub async fn list_books_with_addresses(
        &self,
        connection: &Connection,
    ) -> PipelineResult<BookTree> {
        let model = self.catalog().ensure_initialized().await?;
        let mut scope = TransactionScope::begin(self.store().as_ref(), connection).await?;

        let query = Query::new(BOOK)
            .select(model.book.field_names())
            .expand(BOOK_ADDRESSES, ADDRESS_LIST_FIELDS);
        let rows = scope
            .tx()
            .query(&query)
            .await
            .map_err(PipelineError::Query);
        let rows = scope.close(rows).await?;

        tracing::debug!(rows = rows.len(), "book listing fetched");
        Ok(reshape_books(rows))
    }
}

/// Reshape raw Book rows into a [`BookTree`].
///
/// Rows may be semi-nested (one row per Book, `addresses` an array) or flat
/// (one row per Book/Address pair, `addresses` an object or null); rows that
/// share a Book id are merged. Rows without a usable id are skipped.
pub fn reshape_books(rows: Vec<Value>) -> BookTree {
    let mut books = Map::new();

    for row in rows {
        let Value::Object(mut row) = row else {
            tracing::warn!("skipping non-object book row");
            continue;
        };
        let Some(book_key) = row.remove(KEY_FIELD).as_ref().and_then(key_string) else {
            tracing::warn!("skipping book row without id");
            continue;
        };
        let children = match row.remove(BOOK_ADDRESSES) {
            Some(Value::Array(items)) => items,
            Some(Value::Object(item)) => vec![Value::Object(item)],
            _ => Vec::new(),
        };

        let entry = books
            .entry(book_key)
            .or_insert_with(|| Value::Object(Map::new()));
        let Value::Object(book) = entry else {
            continue;
        };
        book.extend(row);

        for child in children {
            let Value::Object(mut address) = child else {
                continue;
            };
            // Flat outer-join rows carry an all-null address for empty books.
            let Some(address_key) = address.remove(KEY_FIELD).as_ref().and_then(key_string)
            else {
                continue;
            };
            let name = display_name(&address);
            address.insert("name".to_string(), Value::String(name));

            let nested = book
                .entry(BOOK_ADDRESSES)
                .or_insert_with(|| Value::Object(Map::new()));
            if let Value::Object(nested) = nested {
                nested.insert(address_key, Value::Object(address));
            }
        }
    }

    BookTree { root: books }
}

fn key_string(value: &Value) -> Option<String> {
    match value {
        Value::Number(n) => Some(n.to_string()),
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        _ => None,
    }
}

fn display_name(address: &Map<String, Value>) -> String {
    let part = |field: &str| {
        address
            .get(field)
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string()
    };
    format!("{} {}", part("first_name"), part("last_name"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use serde_json::json;

    #[test]
    fn reshape_semi_nested_rows() {
        let rows = vec![
            json!({
                "id": 1,
                "name": "Friends",
                "addresses": [
                    {"id": 10, "first_name": "Ada", "last_name": "Lovelace", "phone": "1", "city": "London"},
                    {"id": 11, "first_name": "Alan", "last_name": "Turing", "phone": "2", "city": "Wilmslow"},
                ],
            }),
            json!({"id": 2, "name": "Empty", "addresses": []}),
        ];

        let tree = reshape_books(rows);
        assert_eq!(
            tree.into_value(),
            json!({
                "root": {
                    "1": {
                        "name": "Friends",
                        "addresses": {
                            "10": {"first_name": "Ada", "last_name": "Lovelace", "phone": "1", "city": "London", "name": "Ada Lovelace"},
                            "11": {"first_name": "Alan", "last_name": "Turing", "phone": "2", "city": "Wilmslow", "name": "Alan Turing"},
                        },
                    },
                    "2": {"name": "Empty"},
                }
            })
        );
    }

    #[test]
    fn reshape_flat_rows_merges_by_book() {
        let rows = vec![
            json!({"id": 1, "name": "B", "addresses": {"id": 10, "first_name": "A", "last_name": "B"}}),
            json!({"id": 1, "name": "B", "addresses": {"id": 11, "first_name": "C", "last_name": "D"}}),
            json!({"id": 2, "name": "E", "addresses": {"id": null, "first_name": null, "last_name": null}}),
        ];

        let tree = reshape_books(rows);
        assert_eq!(tree.len(), 2);
        let book = tree.book("1").unwrap();
        let addresses = book["addresses"].as_object().unwrap();
        assert_eq!(addresses.len(), 2);
        assert_eq!(addresses["11"]["name"], "C D");
        assert!(tree.book("2").unwrap().get("addresses").is_none());
    }

    #[test]
    fn reshape_accepts_string_ids_and_skips_garbage() {
        let rows = vec![
            json!({"id": "7", "name": "Seven"}),
            json!({"name": "no id"}),
            json!("not an object"),
        ];
        let tree = reshape_books(rows);
        assert_eq!(tree.len(), 1);
        assert_eq!(tree.book("7").unwrap()["name"], "Seven");
    }

    #[test]
    fn reshape_empty_input_still_has_root() {
        assert_eq!(reshape_books(Vec::new()).into_value(), json!({"root": {}}));
    }

    #[test]
    fn missing_name_parts_become_empty() {
        let rows = vec![json!({"id": 1, "addresses": [{"id": 2, "first_name": "Solo"}]})];
        let tree = reshape_books(rows);
        assert_eq!(tree.book("1").unwrap()["addresses"]["2"]["name"], "Solo ");
    }

    fn book_rows() -> impl Strategy<Value = Vec<Value>> {
        let address = ("[a-z]{0,8}", "[a-z]{0,8}", "[0-9]{0,6}", "[A-Z][a-z]{0,8}");
        let book = (
            "[A-Za-z ]{0,16}",
            prop::collection::vec(address, 0..4),
        );
        prop::collection::vec(book, 0..6).prop_map(|books| {
            let mut next_id = 0u64;
            books
                .into_iter()
                .map(|(name, addresses)| {
                    next_id += 1;
                    let book_id = next_id;
                    let addresses: Vec<Value> = addresses
                        .into_iter()
                        .map(|(first, last, phone, city)| {
                            next_id += 1;
                            json!({"id": next_id, "first_name": first, "last_name": last, "phone": phone, "city": city})
                        })
                        .collect();
                    json!({"id": book_id, "name": name, "addresses": addresses})
                })
                .collect()
        })
    }

    proptest! {
        #[test]
        fn ids_are_promoted_and_names_derived(rows in book_rows()) {
            let tree = reshape_books(rows.clone());
            prop_assert_eq!(tree.len(), rows.len());

            for row in &rows {
                let id = row["id"].to_string();
                let book = tree.book(&id).expect("book keyed by id");
                prop_assert!(!book.contains_key("id"));
                prop_assert_eq!(&book["name"], &row["name"]);

                let expected = row["addresses"].as_array().unwrap();
                match book.get("addresses") {
                    None => prop_assert!(expected.is_empty()),
                    Some(nested) => {
                        let nested = nested.as_object().unwrap();
                        prop_assert_eq!(nested.len(), expected.len());
                        for source in expected {
                            let entry = &nested[&source["id"].to_string()];
                            prop_assert!(entry.get("id").is_none());
                            let name = format!(
                                "{} {}",
                                source["first_name"].as_str().unwrap(),
                                source["last_name"].as_str().unwrap()
                            );
                            prop_assert_eq!(entry["name"].as_str().unwrap(), name.as_str());
                        }
                    }
                }
            }
        }

        #[test]
        fn reshape_is_deterministic(rows in book_rows()) {
            prop_assert_eq!(reshape_books(rows.clone()), reshape_books(rows));
        }
    }
}
