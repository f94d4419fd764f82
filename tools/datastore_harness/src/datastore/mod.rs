//! Entity model shared by the RPC payloads, the local backend and the
//! service API.

pub mod local;
pub mod service;
pub mod store;
pub mod wire;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeyId {
    Id(i64),
    Name(String),
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Key {
    pub kind: String,
    /// `None` until the backend allocates an id on put.
    pub id: Option<KeyId>,
    pub parent: Option<Box<Key>>,
}

impl Key {
    pub fn named(kind: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            id: Some(KeyId::Name(name.into())),
            parent: None,
        }
    }

    pub fn with_id(kind: impl Into<String>, id: i64) -> Self {
        Self {
            kind: kind.into(),
            id: Some(KeyId::Id(id)),
            parent: None,
        }
    }

    pub fn incomplete(kind: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            id: None,
            parent: None,
        }
    }

    pub fn child_of(mut self, parent: Key) -> Self {
        self.parent = Some(Box::new(parent));
        self
    }

    pub fn is_complete(&self) -> bool {
        self.id.is_some() && self.parent.iter().all(|parent| parent.is_complete())
    }

    /// Root of the parent chain; keys sharing a root form one entity group.
    pub fn root(&self) -> &Key {
        let mut current = self;
        while let Some(parent) = current.parent.as_deref() {
            current = parent;
        }
        current
    }

    /// True when `ancestor` is this key or appears in its parent chain.
    pub fn has_ancestor(&self, ancestor: &Key) -> bool {
        let mut current = Some(self);
        while let Some(key) = current {
            if key == ancestor {
                return true;
            }
            current = key.parent.as_deref();
        }
        false
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(parent) = &self.parent {
            write!(f, "{parent}/")?;
        }
        match &self.id {
            Some(KeyId::Id(id)) => write!(f, "{}({id})", self.kind),
            Some(KeyId::Name(name)) => write!(f, "{}(\"{name}\")", self.kind),
            None => write!(f, "{}(no-id-yet)", self.kind),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entity {
    pub key: Key,
    #[serde(default)]
    pub properties: BTreeMap<String, Value>,
}

impl Entity {
    pub fn new(key: Key) -> Self {
        Self {
            key,
            properties: BTreeMap::new(),
        }
    }

    pub fn with_property(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.properties.insert(name.into(), value.into());
        self
    }

    pub fn set_property(&mut self, name: impl Into<String>, value: impl Into<Value>) {
        self.properties.insert(name.into(), value.into());
    }

    pub fn property(&self, name: &str) -> Option<&Value> {
        self.properties.get(name)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Filter {
    pub property: String,
    pub value: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Query {
    pub kind: String,
    pub ancestor: Option<Key>,
    #[serde(default)]
    pub filters: Vec<Filter>,
}

impl Query {
    pub fn new(kind: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            ancestor: None,
            filters: Vec::new(),
        }
    }

    pub fn with_ancestor(mut self, ancestor: Key) -> Self {
        self.ancestor = Some(ancestor);
        self
    }

    pub fn filter_eq(mut self, property: impl Into<String>, value: impl Into<Value>) -> Self {
        self.filters.push(Filter {
            property: property.into(),
            value: value.into(),
        });
        self
    }

    pub fn matches(&self, entity: &Entity) -> bool {
        if entity.key.kind != self.kind {
            return false;
        }
        if let Some(ancestor) = &self.ancestor {
            if !entity.key.has_ancestor(ancestor) {
                return false;
            }
        }
        self.filters
            .iter()
            .all(|filter| entity.property(&filter.property) == Some(&filter.value))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Transaction {
    pub handle: u64,
    pub app_id: String,
}
