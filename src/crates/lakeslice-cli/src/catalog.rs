//! Fixture catalogs: a YAML description of tables (and optionally their rows)
//! served through the in-memory store
//!
//! ```yaml
//! tables:
//!   - name: customers
//!     schema: [{ name: id, type: INTEGER }, { name: signed_up, type: DATE }]
//!     generate: 500
//!   - name: orders
//!     schema: [{ name: id, type: INTEGER }, { name: customer_id, type: INTEGER }]
//!     foreign_keys: [{ column: customer_id, referenced_table: customers }]
//!     rows:
//!       - { id: 1, customer_id: 7 }
//! queries:
//!   - sql: SELECT * FROM orders WHERE id > 100
//!     rows: []
//! ```

use anyhow::{Context, Result};
use lakeslice_core::{InMemoryStore, Row, TableDescriptor};
use serde::Deserialize;
use serde_json::Value;
use std::path::Path;
use tracing::debug;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Catalog {
    #[serde(default)]
    pub tables: Vec<CatalogTable>,
    #[serde(default)]
    pub queries: Vec<CannedQuery>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CatalogTable {
    #[serde(flatten)]
    pub descriptor: TableDescriptor,

    #[serde(default)]
    pub rows: Vec<Row>,

    /// Synthesize this many rows from the schema when `rows` is empty
    #[serde(default)]
    pub generate: Option<u64>,
}

/// Result rows for a `query` sampling spec with exactly this SQL.
#[derive(Debug, Clone, Deserialize)]
pub struct CannedQuery {
    pub sql: String,
    #[serde(default)]
    pub rows: Vec<Row>,
}

impl Catalog {
    pub fn from_yaml(content: &str) -> Result<Self> {
        serde_yaml::from_str(content).context("Failed to parse catalog")
    }

    pub async fn load(path: &Path) -> Result<Self> {
        let content = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("Failed to read catalog {}", path.display()))?;
        Self::from_yaml(&content).with_context(|| format!("In catalog {}", path.display()))
    }

    pub fn into_store(self) -> InMemoryStore {
        let store = InMemoryStore::new();
        for table in self.tables {
            let rows = match table.generate {
                Some(count) if table.rows.is_empty() => generate_rows(&table.descriptor, count),
                _ => table.rows,
            };
            debug!(table = %table.descriptor.name, rows = rows.len(), "Loaded fixture table");
            store.insert_table(table.descriptor, rows);
        }
        for query in self.queries {
            store.register_query(&query.sql, query.rows);
        }
        store
    }
}

/// Deterministic rows shaped by the schema: `id` counts from 1, foreign-key
/// columns cycle through 1..=10, other columns get a value matching their type.
fn generate_rows(table: &TableDescriptor, count: u64) -> Vec<Row> {
    (0..count)
        .map(|i| {
            let mut row = Row::new();
            row.insert("id".to_string(), Value::from(i + 1));
            for fk in &table.foreign_keys {
                row.insert(fk.column.clone(), Value::from(i % 10 + 1));
            }
            for column in &table.schema {
                if row.contains_key(&column.name) {
                    continue;
                }
                row.insert(column.name.clone(), synthesize(&column.data_type, &column.name, i));
            }
            row
        })
        .collect()
}

fn synthesize(data_type: &str, column: &str, i: u64) -> Value {
    let ty = data_type.to_ascii_uppercase();
    if ty.contains("INT") || ty.contains("NUMERIC") || ty.contains("DECIMAL") {
        Value::from(i * 7 % 1000)
    } else if ty.contains("FLOAT") || ty.contains("DOUBLE") || ty.contains("REAL") {
        Value::from(i as f64 * 1.5)
    } else if ty.contains("BOOL") {
        Value::from(i % 2 == 0)
    } else if ty.contains("TIMESTAMP") {
        Value::from(format!("{}T{:02}:00:00Z", date(i), i % 24))
    } else if ty.contains("DATE") {
        Value::from(date(i))
    } else {
        Value::from(format!("{}_{}", column, i % 5))
    }
}

fn date(i: u64) -> String {
    format!("2024-{:02}-{:02}", (i / 28) % 12 + 1, i % 28 + 1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use lakeslice_core::RemoteStore;

    const SHOP: &str = r#"
tables:
  - name: customers
    schema:
      - { name: id, type: INTEGER }
      - { name: signed_up, type: DATE }
      - { name: region, type: VARCHAR }
    generate: 30
  - name: orders
    schema:
      - { name: id, type: INTEGER }
      - { name: customer_id, type: INTEGER }
    foreign_keys:
      - { column: customer_id, referenced_table: customers }
    rows:
      - { id: 1, customer_id: 3 }
      - { id: 2, customer_id: 4 }
queries:
  - sql: SELECT * FROM orders WHERE id = 1
    rows:
      - { id: 1, customer_id: 3 }
"#;

    #[tokio::test]
    async fn test_catalog_into_store() {
        let store = Catalog::from_yaml(SHOP).unwrap().into_store();
        assert_eq!(store.table_count(), 2);
        assert_eq!(store.row_count("customers"), Some(30));
        assert_eq!(store.row_count("orders"), Some(2));

        let tables = store.list_tables().await.unwrap();
        let orders = tables.iter().find(|t| t.name == "orders").unwrap();
        assert_eq!(orders.foreign_keys[0].referenced_column, "id");
        assert_eq!(orders.estimated_row_count, Some(2));
    }

    #[test]
    fn test_generated_rows_follow_schema() {
        let catalog = Catalog::from_yaml(SHOP).unwrap();
        let rows = generate_rows(&catalog.tables[0].descriptor, 3);

        assert_eq!(rows[0]["id"], Value::from(1));
        assert_eq!(rows[2]["id"], Value::from(3));
        assert_eq!(rows[1]["signed_up"], Value::from("2024-01-02"));
        assert_eq!(rows[0]["region"], Value::from("region_0"));
        assert_eq!(generate_rows(&catalog.tables[0].descriptor, 3), rows);
    }

    #[test]
    fn test_malformed_catalog() {
        assert!(Catalog::from_yaml("tables: [ { schema: [] } ]").is_err());
    }
}
