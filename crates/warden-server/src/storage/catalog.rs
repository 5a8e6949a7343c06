//! In-memory document catalog.
//!
//! The catalog maps namespaces to collections. Collections are held behind
//! `Arc` so that cloning a catalog to build the next snapshot only copies the
//! collections a mutation actually touches.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use super::{Document, split_namespace};

/// Documents of one collection, keyed by `_id`.
pub type Collection = BTreeMap<String, Document>;

/// A single document change with its pre- and post-image.
///
/// `before == None` is an insert, `after == None` a delete.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocWrite {
    pub ns: String,
    pub id: String,
    #[serde(default)]
    pub before: Option<Document>,
    #[serde(default)]
    pub after: Option<Document>,
}

impl DocWrite {
    pub fn insert(ns: impl Into<String>, id: impl Into<String>, doc: Document) -> Self {
        Self {
            ns: ns.into(),
            id: id.into(),
            before: None,
            after: Some(doc),
        }
    }

    pub fn replace(
        ns: impl Into<String>,
        id: impl Into<String>,
        before: Document,
        after: Document,
    ) -> Self {
        Self {
            ns: ns.into(),
            id: id.into(),
            before: Some(before),
            after: Some(after),
        }
    }

    pub fn delete(ns: impl Into<String>, id: impl Into<String>, before: Document) -> Self {
        Self {
            ns: ns.into(),
            id: id.into(),
            before: Some(before),
            after: None,
        }
    }
}

/// Namespace to collection map.
///
/// A collection exists while it holds at least one document.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Catalog {
    collections: BTreeMap<String, Arc<Collection>>,
}

impl Catalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_collections(collections: BTreeMap<String, Collection>) -> Self {
        Self {
            collections: collections
                .into_iter()
                .filter(|(_, docs)| !docs.is_empty())
                .map(|(ns, docs)| (ns, Arc::new(docs)))
                .collect(),
        }
    }

    pub fn get(&self, ns: &str, id: &str) -> Option<&Document> {
        self.collections.get(ns).and_then(|docs| docs.get(id))
    }

    pub fn collection(&self, ns: &str) -> Option<&Collection> {
        self.collections.get(ns).map(|docs| docs.as_ref())
    }

    pub fn contains_collection(&self, ns: &str) -> bool {
        self.collections.contains_key(ns)
    }

    /// Collections of one database, as `(collection name, documents)`.
    pub fn collections_in<'a>(
        &'a self,
        db: &'a str,
    ) -> impl Iterator<Item = (&'a str, &'a Collection)> + 'a {
        self.collections.iter().filter_map(move |(ns, docs)| {
            let (ns_db, collection) = split_namespace(ns)?;
            (ns_db == db).then_some((collection, docs.as_ref()))
        })
    }

    /// Every namespace with its documents, ordered by namespace.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &Collection)> {
        self.collections
            .iter()
            .map(|(ns, docs)| (ns.as_str(), docs.as_ref()))
    }

    pub fn apply(&mut self, write: &DocWrite) {
        self.put(&write.ns, &write.id, write.after.clone());
    }

    pub fn undo(&mut self, write: &DocWrite) {
        self.put(&write.ns, &write.id, write.before.clone());
    }

    fn put(&mut self, ns: &str, id: &str, doc: Option<Document>) {
        match doc {
            Some(doc) => {
                let docs = self.collections.entry(ns.to_string()).or_default();
                Arc::make_mut(docs).insert(id.to_string(), doc);
            }
            None => {
                let Some(docs) = self.collections.get_mut(ns) else {
                    return;
                };
                Arc::make_mut(docs).remove(id);
                if docs.is_empty() {
                    self.collections.remove(ns);
                }
            }
        }
    }
}
