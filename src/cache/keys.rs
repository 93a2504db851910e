//! Query identities.
//!
//! A `QueryIdentity` is an ordered tuple of JSON primitives whose first element
//! names the resource (`["shopping", "L1"]`). Equality and hashing go through
//! the canonical serialization, so two identities built from structurally equal
//! parts are the same cache slot. `QueryKey<T>` pins the value type stored
//! under an identity.

use std::fmt;
use std::hash::{Hash, Hasher};
use std::marker::PhantomData;
use std::sync::Arc;

use serde_json::Value;

/// Logical resource names; always the first element of an identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Resource {
    Tasks,
    Shopping,
    Activity,
    Categories,
}

impl Resource {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Tasks => "tasks",
            Self::Shopping => "shopping",
            Self::Activity => "activity",
            Self::Categories => "categories",
        }
    }
}

impl fmt::Display for Resource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Canonical key identifying one cacheable unit of server data.
#[derive(Clone)]
pub struct QueryIdentity {
    parts: Vec<Value>,
    canonical: String,
}

impl QueryIdentity {
    pub fn new(parts: Vec<Value>) -> Self {
        // serde_json objects are BTreeMap-backed, so key order is canonical.
        let canonical = Value::Array(parts.clone()).to_string();
        Self { parts, canonical }
    }

    /// Identity consisting of just the resource name, used as an
    /// invalidation prefix for the whole resource.
    pub fn resource(resource: Resource) -> Self {
        Self::new(vec![Value::from(resource.as_str())])
    }

    /// Append one element.
    pub fn with(mut self, part: impl Into<Value>) -> Self {
        self.parts.push(part.into());
        self.canonical = Value::Array(self.parts.clone()).to_string();
        self
    }

    pub fn parts(&self) -> &[Value] {
        &self.parts
    }

    pub fn canonical(&self) -> &str {
        &self.canonical
    }

    /// First element when it is a string.
    pub fn resource_name(&self) -> Option<&str> {
        self.parts.first().and_then(Value::as_str)
    }

    /// True when `prefix` equals the leading elements of `self`.
    pub fn starts_with(&self, prefix: &QueryIdentity) -> bool {
        prefix.parts.len() <= self.parts.len()
            && prefix
                .parts
                .iter()
                .zip(self.parts.iter())
                .all(|(a, b)| a == b)
    }
}

impl PartialEq for QueryIdentity {
    fn eq(&self, other: &Self) -> bool {
        self.canonical == other.canonical
    }
}

impl Eq for QueryIdentity {}

impl Hash for QueryIdentity {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.canonical.hash(state);
    }
}

impl fmt::Debug for QueryIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "QueryIdentity({})", self.canonical)
    }
}

impl fmt::Display for QueryIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.canonical)
    }
}

/// An identity bound to the type of value cached under it.
pub struct QueryKey<T> {
    identity: QueryIdentity,
    _value: PhantomData<fn() -> T>,
}

impl<T> QueryKey<T> {
    pub fn new(identity: QueryIdentity) -> Self {
        Self {
            identity,
            _value: PhantomData,
        }
    }

    pub fn identity(&self) -> &QueryIdentity {
        &self.identity
    }
}

impl<T> Clone for QueryKey<T> {
    fn clone(&self) -> Self {
        Self::new(self.identity.clone())
    }
}

impl<T> fmt::Debug for QueryKey<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "QueryKey<{}>({})",
            std::any::type_name::<T>(),
            self.identity
        )
    }
}

/// Selects the cache entries an invalidation applies to.
#[derive(Clone)]
pub enum QueryMatcher {
    /// Only the identity itself.
    Exact(QueryIdentity),
    /// The identity and every identity it prefixes.
    Prefix(QueryIdentity),
    Predicate(Arc<dyn Fn(&QueryIdentity) -> bool + Send + Sync>),
}

impl QueryMatcher {
    pub fn predicate(f: impl Fn(&QueryIdentity) -> bool + Send + Sync + 'static) -> Self {
        Self::Predicate(Arc::new(f))
    }

    pub fn matches(&self, identity: &QueryIdentity) -> bool {
        match self {
            Self::Exact(target) => identity == target,
            Self::Prefix(prefix) => identity.starts_with(prefix),
            Self::Predicate(f) => f(identity),
        }
    }
}

impl From<&QueryIdentity> for QueryMatcher {
    /// Identities invalidate hierarchically.
    fn from(identity: &QueryIdentity) -> Self {
        Self::Prefix(identity.clone())
    }
}

impl From<Resource> for QueryMatcher {
    fn from(resource: Resource) -> Self {
        Self::Prefix(QueryIdentity::resource(resource))
    }
}

impl fmt::Debug for QueryMatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Exact(identity) => write!(f, "Exact({identity})"),
            Self::Prefix(identity) => write!(f, "Prefix({identity})"),
            Self::Predicate(_) => f.write_str("Predicate(..)"),
        }
    }
}
