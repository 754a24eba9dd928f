//! Table graph: tables of a remote store and the foreign-key edges between them
//!
//! The graph is built once per run from the store's table listing and is
//! read-only afterwards, so it can be shared across workers behind an `Arc`.
//!
//! # Edge direction
//!
//! An [`Edge`] `A -> B` means *A references B*: A has a column pointing at
//! B's key. The resolver turns that into "B is extracted in an earlier wave
//! than A", so a sample of A can always be joined against an already-present
//! sample of B.
//!
//! ```text
//! order_items ──order_id──▶ orders
//!      │
//!      └──────customer_id─▶ customers
//! ```
//!
//! Table names are case-insensitive. Lookups accept any casing; everything
//! the graph returns uses the name as the store reported it.
//!
//! # Declared and inferred edges
//!
//! Declared foreign keys come from the table descriptors. When the store does
//! not expose constraints, [`TableGraph::with_inferred_foreign_keys`] adds
//! edges by naming convention (`customer_id` -> `customers.id`). Declared
//! keys always take precedence over inferred ones.

use crate::error::{Result, SyncError};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// One column of a table schema.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Column {
    pub name: String,
    #[serde(rename = "type", default)]
    pub data_type: String,
    #[serde(default = "default_nullable")]
    pub nullable: bool,
}

fn default_nullable() -> bool {
    true
}

/// `column` of the owning table references `referenced_table.referenced_column`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForeignKey {
    pub column: String,
    pub referenced_table: String,
    #[serde(default = "default_key_column")]
    pub referenced_column: String,
}

fn default_key_column() -> String {
    "id".to_string()
}

/// A table as listed by the remote store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableDescriptor {
    pub name: String,
    #[serde(default)]
    pub schema: Vec<Column>,
    /// Advisory only; may be stale
    #[serde(default)]
    pub estimated_row_count: Option<u64>,
    #[serde(default)]
    pub foreign_keys: Vec<ForeignKey>,
}

impl TableDescriptor {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            schema: Vec::new(),
            estimated_row_count: None,
            foreign_keys: Vec::new(),
        }
    }

    pub fn with_column(mut self, name: impl Into<String>, data_type: impl Into<String>) -> Self {
        self.schema.push(Column {
            name: name.into(),
            data_type: data_type.into(),
            nullable: true,
        });
        self
    }

    pub fn with_foreign_key(
        mut self,
        column: impl Into<String>,
        referenced_table: impl Into<String>,
        referenced_column: impl Into<String>,
    ) -> Self {
        self.foreign_keys.push(ForeignKey {
            column: column.into(),
            referenced_table: referenced_table.into(),
            referenced_column: referenced_column.into(),
        });
        self
    }

    pub fn with_estimated_rows(mut self, rows: u64) -> Self {
        self.estimated_row_count = Some(rows);
        self
    }

    pub fn has_column(&self, name: &str) -> bool {
        self.schema.iter().any(|c| c.name.eq_ignore_ascii_case(name))
    }

    fn declares_key_on(&self, column: &str) -> bool {
        self.foreign_keys
            .iter()
            .any(|fk| fk.column.eq_ignore_ascii_case(column))
    }
}

/// `from` references `to`; `to` must be extracted first.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Edge {
    pub from: String,
    pub to: String,
}

impl Edge {
    pub fn new(from: impl Into<String>, to: impl Into<String>) -> Self {
        Self {
            from: from.into(),
            to: to.into(),
        }
    }
}

/// A foreign key pointing at a table the graph does not contain.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct DanglingReference {
    pub table: String,
    pub column: String,
    pub referenced_table: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EdgeOrigin {
    Declared,
    Inferred,
}

fn key(name: &str) -> String {
    name.to_lowercase()
}

/// Tables keyed by lowercase name plus the dependency edges between them.
#[derive(Debug, Clone, Default)]
pub struct TableGraph {
    tables: BTreeMap<String, TableDescriptor>,
    /// (from key, to key) -> origin
    edges: BTreeMap<(String, String), EdgeOrigin>,
    dangling: Vec<DanglingReference>,
}

impl TableGraph {
    /// Build a graph from the store's listing, turning declared foreign keys
    /// into edges. Fails on two tables whose names differ only by case.
    pub fn new(tables: impl IntoIterator<Item = TableDescriptor>) -> Result<Self> {
        let mut graph = Self::default();
        for table in tables {
            let k = key(&table.name);
            if graph.tables.contains_key(&k) {
                return Err(SyncError::DuplicateTable(table.name));
            }
            graph.tables.insert(k, table);
        }

        let mut declared = Vec::new();
        for (from, table) in &graph.tables {
            for fk in &table.foreign_keys {
                let to = key(&fk.referenced_table);
                if !graph.tables.contains_key(&to) {
                    graph.dangling.push(DanglingReference {
                        table: table.name.clone(),
                        column: fk.column.clone(),
                        referenced_table: fk.referenced_table.clone(),
                    });
                } else if to != *from {
                    declared.push((from.clone(), to));
                }
            }
        }
        for pair in declared {
            graph.edges.insert(pair, EdgeOrigin::Declared);
        }
        graph.dangling.sort();
        Ok(graph)
    }

    /// Add edges for `<stem>_id` columns whose stem names another table
    /// (`stem`, `stems` or `stemes`) that has an `id` column.
    ///
    /// Columns that already carry a declared foreign key are left alone, and
    /// a table never depends on itself.
    pub fn with_inferred_foreign_keys(mut self) -> Self {
        let mut inferred = Vec::new();
        for (from, table) in &self.tables {
            for column in &table.schema {
                let lower = column.name.to_lowercase();
                let Some(stem) = lower.strip_suffix("_id") else {
                    continue;
                };
                if stem.is_empty() || table.declares_key_on(&column.name) {
                    continue;
                }
                let target = [stem.to_string(), format!("{stem}s"), format!("{stem}es")]
                    .into_iter()
                    .find(|candidate| {
                        self.tables
                            .get(candidate)
                            .is_some_and(|t| t.has_column("id"))
                    });
                if let Some(to) = target {
                    if to != *from {
                        inferred.push((from.clone(), to));
                    }
                }
            }
        }
        for pair in inferred {
            self.edges.entry(pair).or_insert(EdgeOrigin::Inferred);
        }
        self
    }

    /// Keep tables matching `include` (all when empty) and not matching
    /// `exclude`. Edges to removed tables are dropped, so those dependencies
    /// count as satisfied.
    pub fn retain(&self, include: &[String], exclude: &[String]) -> Self {
        let include: BTreeSet<String> = include.iter().map(|n| key(n)).collect();
        let exclude: BTreeSet<String> = exclude.iter().map(|n| key(n)).collect();
        let keep = self
            .tables
            .keys()
            .filter(|k| (include.is_empty() || include.contains(*k)) && !exclude.contains(*k))
            .cloned()
            .collect::<BTreeSet<_>>();
        self.restricted(&keep)
    }

    /// The subgraph over `names` (any casing). Unknown names are ignored.
    pub fn subgraph<I, S>(&self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let keep = names
            .into_iter()
            .map(|n| key(n.as_ref()))
            .filter(|k| self.tables.contains_key(k))
            .collect::<BTreeSet<_>>();
        self.restricted(&keep)
    }

    fn restricted(&self, keep: &BTreeSet<String>) -> Self {
        Self {
            tables: self
                .tables
                .iter()
                .filter(|(k, _)| keep.contains(*k))
                .map(|(k, t)| (k.clone(), t.clone()))
                .collect(),
            edges: self
                .edges
                .iter()
                .filter(|((from, to), _)| keep.contains(from) && keep.contains(to))
                .map(|(pair, origin)| (pair.clone(), *origin))
                .collect(),
            dangling: self
                .dangling
                .iter()
                .filter(|d| keep.contains(&key(&d.table)))
                .cloned()
                .collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.tables.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tables.is_empty()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tables.contains_key(&key(name))
    }

    pub fn get(&self, name: &str) -> Option<&TableDescriptor> {
        self.tables.get(&key(name))
    }

    /// All tables, ordered by lowercase name.
    pub fn tables(&self) -> impl Iterator<Item = &TableDescriptor> {
        self.tables.values()
    }

    pub fn table_names(&self) -> Vec<&str> {
        self.tables.values().map(|t| t.name.as_str()).collect()
    }

    fn name_of<'a>(&'a self, k: &'a str) -> &'a str {
        self.tables.get(k).map_or(k, |t| t.name.as_str())
    }

    /// Every edge, sorted.
    pub fn edges(&self) -> Vec<Edge> {
        self.edges
            .keys()
            .map(|(from, to)| Edge::new(self.name_of(from), self.name_of(to)))
            .collect()
    }

    pub fn edge_count(&self) -> usize {
        self.edges.len()
    }

    /// Whether the edge exists only by naming convention.
    pub fn is_inferred(&self, edge: &Edge) -> bool {
        self.edges.get(&(key(&edge.from), key(&edge.to))) == Some(&EdgeOrigin::Inferred)
    }

    /// Tables that `name` references directly.
    pub fn dependencies_of(&self, name: &str) -> Vec<&str> {
        let k = key(name);
        self.edges
            .keys()
            .filter(|(from, _)| *from == k)
            .map(|(_, to)| self.name_of(to))
            .collect()
    }

    /// Every table that reaches `name` through one or more edges.
    pub fn transitive_dependents(&self, name: &str) -> BTreeSet<String> {
        let mut seen = BTreeSet::new();
        let mut stack = vec![key(name)];
        while let Some(current) = stack.pop() {
            for (from, to) in self.edges.keys() {
                if *to == current && seen.insert(from.clone()) {
                    stack.push(from.clone());
                }
            }
        }
        seen.into_iter()
            .map(|k| self.name_of(&k).to_string())
            .collect()
    }

    /// Foreign keys that point outside the graph.
    pub fn dangling_references(&self) -> &[DanglingReference] {
        &self.dangling
    }
}
