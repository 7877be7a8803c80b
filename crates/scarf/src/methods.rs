//! Method table with dotted-name lookup
//!
//! Names like `"nested.method"` resolve by descending one namespace per
//! segment. Lookup failure at any depth reports the full requested name.

use crate::handler::Handler;
use crate::{Result, ScarfError};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, warn};

/// Entry at one level of the method tree
#[derive(Clone)]
enum MethodEntry {
    /// Callable handler
    Handler(Arc<dyn Handler>),
    /// Nested level of names
    Namespace(MethodTable),
}

/// Tree of named handlers
///
/// Read-only once handed to a [`Server`](crate::Server).
#[derive(Clone, Default)]
pub struct MethodTable {
    entries: HashMap<String, MethodEntry>,
}

impl MethodTable {
    /// Create an empty method table
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler under a dotted path
    ///
    /// Missing intermediate namespaces are created. A handler that sits where
    /// a namespace is needed gets replaced.
    pub fn insert<H>(&mut self, path: &str, handler: H) -> &mut Self
    where
        H: Handler + 'static,
    {
        self.insert_entry(path, MethodEntry::Handler(Arc::new(handler)));
        self
    }

    /// Mount a whole table under a dotted path
    pub fn namespace(&mut self, path: &str, table: MethodTable) -> &mut Self {
        self.insert_entry(path, MethodEntry::Namespace(table));
        self
    }

    /// Builder form of [`MethodTable::insert`]
    pub fn with_method<H>(mut self, path: &str, handler: H) -> Self
    where
        H: Handler + 'static,
    {
        self.insert(path, handler);
        self
    }

    /// Builder form of [`MethodTable::namespace`]
    pub fn with_namespace(mut self, path: &str, table: MethodTable) -> Self {
        self.namespace(path, table);
        self
    }

    fn insert_entry(&mut self, path: &str, entry: MethodEntry) {
        let (head, rest) = match path.split_once('.') {
            Some((head, rest)) => (head, Some(rest)),
            None => (path, None),
        };

        match rest {
            None => {
                debug!("Registered method: {}", path);
                self.entries.insert(head.to_string(), entry);
            }
            Some(rest) => {
                let slot = self
                    .entries
                    .entry(head.to_string())
                    .or_insert_with(|| MethodEntry::Namespace(MethodTable::new()));
                if matches!(slot, MethodEntry::Handler(_)) {
                    warn!("Replacing handler {:?} with a namespace", head);
                    *slot = MethodEntry::Namespace(MethodTable::new());
                }
                if let MethodEntry::Namespace(table) = slot {
                    table.insert_entry(rest, entry);
                }
            }
        }
    }

    /// Resolve a dotted name to its handler
    pub fn resolve(&self, name: &str) -> Result<Arc<dyn Handler>> {
        self.lookup(name)
            .ok_or_else(|| ScarfError::MethodNotFound(name.to_string()))
    }

    fn lookup(&self, path: &str) -> Option<Arc<dyn Handler>> {
        let (head, rest) = match path.split_once('.') {
            Some((head, rest)) => (head, Some(rest)),
            None => (path, None),
        };
        if head.is_empty() {
            return None;
        }

        match (self.entries.get(head)?, rest) {
            (MethodEntry::Handler(handler), None) => Some(Arc::clone(handler)),
            (MethodEntry::Namespace(table), Some(rest)) => table.lookup(rest),
            _ => None,
        }
    }

    /// Check if a dotted name resolves to a handler
    pub fn contains(&self, name: &str) -> bool {
        self.lookup(name).is_some()
    }

    /// Number of handlers in the whole tree
    pub fn len(&self) -> usize {
        self.entries
            .values()
            .map(|entry| match entry {
                MethodEntry::Handler(_) => 1,
                MethodEntry::Namespace(table) => table.len(),
            })
            .sum()
    }

    /// Check if the tree holds no handlers
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Every resolvable dotted name, sorted
    pub fn names(&self) -> Vec<String> {
        let mut names = Vec::new();
        self.collect_names("", &mut names);
        names.sort();
        names
    }

    fn collect_names(&self, prefix: &str, names: &mut Vec<String>) {
        for (key, entry) in &self.entries {
            let name = if prefix.is_empty() {
                key.clone()
            } else {
                format!("{}.{}", prefix, key)
            };
            match entry {
                MethodEntry::Handler(_) => names.push(name),
                MethodEntry::Namespace(table) => table.collect_names(&name, names),
            }
        }
    }
}

impl std::fmt::Debug for MethodTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MethodTable")
            .field("methods", &self.names())
            .finish()
    }
}
