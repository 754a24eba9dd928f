//! Sampling specs and their three-level resolution
//!
//! A table's sampling spec is assembled from up to three partial specs,
//! highest precedence first:
//!
//! ```text
//! caller override      (explicit per-call argument)
//!        │ field by field
//! per-table override   ([table_overrides.<table>] in configuration)
//!        │ field by field
//! global default       ([sampling] in configuration)
//! ```
//!
//! The merge is per field, so an override that only sets `strategy = "recent"`
//! keeps the default `row_budget`. The merged [`SampleSpecPatch`] is then
//! validated once into a [`SampleSpec`], whose variants carry exactly the
//! fields their strategy needs.

use crate::error::SampleSpecError;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

/// How rows are chosen from a table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Strategy {
    Random,
    Recent,
    Head,
    Tail,
    Stratified,
    Query,
    Full,
}

impl Strategy {
    pub const ALL: [Strategy; 7] = [
        Strategy::Random,
        Strategy::Recent,
        Strategy::Head,
        Strategy::Tail,
        Strategy::Stratified,
        Strategy::Query,
        Strategy::Full,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Strategy::Random => "random",
            Strategy::Recent => "recent",
            Strategy::Head => "head",
            Strategy::Tail => "tail",
            Strategy::Stratified => "stratified",
            Strategy::Query => "query",
            Strategy::Full => "full",
        }
    }
}

impl fmt::Display for Strategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Strategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Strategy::ALL
            .into_iter()
            .find(|strategy| strategy.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| {
                format!(
                    "unknown sampling strategy '{}' (expected one of: {})",
                    s,
                    Strategy::ALL.map(|st| st.as_str()).join(", ")
                )
            })
    }
}

/// A partial spec: any subset of fields, used at every precedence level.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SampleSpecPatch {
    pub strategy: Option<Strategy>,
    pub row_budget: Option<u64>,
    pub date_column: Option<String>,
    pub stratify_column: Option<String>,
    pub custom_query: Option<String>,
    pub seed: Option<u64>,
}

impl SampleSpecPatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn strategy(strategy: Strategy) -> Self {
        Self {
            strategy: Some(strategy),
            ..Self::default()
        }
    }

    pub fn with_row_budget(mut self, rows: u64) -> Self {
        self.row_budget = Some(rows);
        self
    }

    pub fn with_date_column(mut self, column: impl Into<String>) -> Self {
        self.date_column = Some(column.into());
        self
    }

    pub fn with_stratify_column(mut self, column: impl Into<String>) -> Self {
        self.stratify_column = Some(column.into());
        self
    }

    pub fn with_custom_query(mut self, sql: impl Into<String>) -> Self {
        self.custom_query = Some(sql.into());
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    /// `self` layered over `lower`: every field set here wins.
    pub fn over(&self, lower: &SampleSpecPatch) -> SampleSpecPatch {
        SampleSpecPatch {
            strategy: self.strategy.or(lower.strategy),
            row_budget: self.row_budget.or(lower.row_budget),
            date_column: self.date_column.clone().or_else(|| lower.date_column.clone()),
            stratify_column: self
                .stratify_column
                .clone()
                .or_else(|| lower.stratify_column.clone()),
            custom_query: self.custom_query.clone().or_else(|| lower.custom_query.clone()),
            seed: self.seed.or(lower.seed),
        }
    }

    /// Check strategy-specific requirements and produce the concrete spec.
    /// Fields the strategy does not use are dropped.
    pub fn validate(&self, table: &str) -> Result<SampleSpec, SampleSpecError> {
        let strategy = self.strategy.ok_or_else(|| SampleSpecError::MissingStrategy {
            table: table.to_string(),
        })?;

        let missing = |field: &'static str| SampleSpecError::MissingField {
            table: table.to_string(),
            strategy: strategy.to_string(),
            field,
        };
        let row_budget = || -> Result<u64, SampleSpecError> {
            match self.row_budget {
                None => Err(missing("row_budget")),
                Some(0) => Err(SampleSpecError::InvalidField {
                    table: table.to_string(),
                    field: "row_budget",
                    reason: "must be greater than zero".to_string(),
                }),
                Some(rows) => Ok(rows),
            }
        };
        let text = |value: &Option<String>, field: &'static str| -> Result<String, SampleSpecError> {
            match value.as_deref().map(str::trim) {
                Some(v) if !v.is_empty() => Ok(v.to_string()),
                _ => Err(missing(field)),
            }
        };

        Ok(match strategy {
            Strategy::Random => SampleSpec::Random {
                row_budget: row_budget()?,
                seed: self.seed,
            },
            Strategy::Recent => SampleSpec::Recent {
                row_budget: row_budget()?,
                date_column: text(&self.date_column, "date_column")?,
            },
            Strategy::Head => SampleSpec::Head {
                row_budget: row_budget()?,
            },
            Strategy::Tail => SampleSpec::Tail {
                row_budget: row_budget()?,
            },
            Strategy::Stratified => SampleSpec::Stratified {
                row_budget: row_budget()?,
                stratify_column: text(&self.stratify_column, "stratify_column")?,
            },
            Strategy::Query => SampleSpec::Query {
                row_budget: row_budget()?,
                custom_query: text(&self.custom_query, "custom_query")?,
            },
            Strategy::Full => SampleSpec::Full,
        })
    }
}

/// A validated sampling spec for one table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SampleSpec {
    Random { row_budget: u64, seed: Option<u64> },
    Recent { row_budget: u64, date_column: String },
    Head { row_budget: u64 },
    Tail { row_budget: u64 },
    Stratified { row_budget: u64, stratify_column: String },
    /// `row_budget` caps the rows taken from the query's result
    Query { row_budget: u64, custom_query: String },
    Full,
}

impl SampleSpec {
    pub fn strategy(&self) -> Strategy {
        match self {
            SampleSpec::Random { .. } => Strategy::Random,
            SampleSpec::Recent { .. } => Strategy::Recent,
            SampleSpec::Head { .. } => Strategy::Head,
            SampleSpec::Tail { .. } => Strategy::Tail,
            SampleSpec::Stratified { .. } => Strategy::Stratified,
            SampleSpec::Query { .. } => Strategy::Query,
            SampleSpec::Full => Strategy::Full,
        }
    }

    /// `None` only for [`SampleSpec::Full`].
    pub fn row_budget(&self) -> Option<u64> {
        match self {
            SampleSpec::Random { row_budget, .. }
            | SampleSpec::Recent { row_budget, .. }
            | SampleSpec::Head { row_budget }
            | SampleSpec::Tail { row_budget }
            | SampleSpec::Stratified { row_budget, .. }
            | SampleSpec::Query { row_budget, .. } => Some(*row_budget),
            SampleSpec::Full => None,
        }
    }
}

impl fmt::Display for SampleSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SampleSpec::Random { row_budget, seed } => match seed {
                Some(seed) => write!(f, "random({row_budget} rows, seed {seed})"),
                None => write!(f, "random({row_budget} rows)"),
            },
            SampleSpec::Recent {
                row_budget,
                date_column,
            } => write!(f, "recent({row_budget} rows by {date_column})"),
            SampleSpec::Head { row_budget } => write!(f, "head({row_budget} rows)"),
            SampleSpec::Tail { row_budget } => write!(f, "tail({row_budget} rows)"),
            SampleSpec::Stratified {
                row_budget,
                stratify_column,
            } => write!(f, "stratified({row_budget} rows by {stratify_column})"),
            SampleSpec::Query { row_budget, .. } => write!(f, "query(<= {row_budget} rows)"),
            SampleSpec::Full => f.write_str("full"),
        }
    }
}

/// Resolves a table's spec from the global default and per-table overrides.
#[derive(Debug, Clone, Default)]
pub struct SampleSpecResolver {
    default: SampleSpecPatch,
    /// Keyed by lowercase table name
    overrides: HashMap<String, SampleSpecPatch>,
}

impl SampleSpecResolver {
    pub fn new<I, S>(default: SampleSpecPatch, overrides: I) -> Self
    where
        I: IntoIterator<Item = (S, SampleSpecPatch)>,
        S: AsRef<str>,
    {
        Self {
            default,
            overrides: overrides
                .into_iter()
                .map(|(table, patch)| (table.as_ref().to_lowercase(), patch))
                .collect(),
        }
    }

    pub fn default_spec(&self) -> &SampleSpecPatch {
        &self.default
    }

    pub fn override_for(&self, table: &str) -> Option<&SampleSpecPatch> {
        self.overrides.get(&table.to_lowercase())
    }

    /// The merged, unvalidated patch for `table`.
    pub fn merged(&self, table: &str, caller: Option<&SampleSpecPatch>) -> SampleSpecPatch {
        let mut merged = self.default.clone();
        if let Some(table_override) = self.override_for(table) {
            merged = table_override.over(&merged);
        }
        if let Some(caller) = caller {
            merged = caller.over(&merged);
        }
        merged
    }

    /// Merge and validate. Fails before any remote work for the table.
    pub fn resolve(
        &self,
        table: &str,
        caller: Option<&SampleSpecPatch>,
    ) -> Result<SampleSpec, SampleSpecError> {
        self.merged(table, caller).validate(table)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn random_1000() -> SampleSpecPatch {
        SampleSpecPatch::strategy(Strategy::Random).with_row_budget(1000)
    }

    #[test]
    fn test_override_inherits_row_budget() {
        let resolver = SampleSpecResolver::new(
            random_1000(),
            [("T", SampleSpecPatch::strategy(Strategy::Recent).with_date_column("ts"))],
        );
        let spec = resolver.resolve("t", None).unwrap();
        assert_eq!(
            spec,
            SampleSpec::Recent {
                row_budget: 1000,
                date_column: "ts".to_string()
            }
        );
    }

    #[test]
    fn test_caller_override_wins_per_field() {
        let resolver = SampleSpecResolver::new(
            random_1000().with_seed(7),
            [("events", SampleSpecPatch::new().with_row_budget(50))],
        );
        let caller = SampleSpecPatch::new().with_row_budget(10);
        assert_eq!(
            resolver.resolve("events", Some(&caller)).unwrap(),
            SampleSpec::Random {
                row_budget: 10,
                seed: Some(7)
            }
        );
        assert_eq!(resolver.resolve("events", None).unwrap().row_budget(), Some(50));
        assert_eq!(resolver.resolve("other", None).unwrap().row_budget(), Some(1000));
    }

    #[test]
    fn test_recent_without_date_column_fails() {
        let resolver = SampleSpecResolver::new(
            random_1000(),
            [("events", SampleSpecPatch::strategy(Strategy::Recent))],
        );
        let err = resolver.resolve("events", None).unwrap_err();
        assert_eq!(
            err,
            SampleSpecError::MissingField {
                table: "events".to_string(),
                strategy: "recent".to_string(),
                field: "date_column",
            }
        );
    }

    #[test]
    fn test_missing_fields_per_strategy() {
        for (patch, field) in [
            (SampleSpecPatch::strategy(Strategy::Head), "row_budget"),
            (
                SampleSpecPatch::strategy(Strategy::Stratified).with_row_budget(5),
                "stratify_column",
            ),
            (
                SampleSpecPatch::strategy(Strategy::Query).with_row_budget(5),
                "custom_query",
            ),
            (
                SampleSpecPatch::strategy(Strategy::Recent)
                    .with_row_budget(5)
                    .with_date_column("   "),
                "date_column",
            ),
        ] {
            match patch.validate("t") {
                Err(SampleSpecError::MissingField { field: f, .. }) => assert_eq!(f, field),
                other => panic!("expected missing {field}, got {other:?}"),
            }
        }
    }

    #[test]
    fn test_no_strategy_anywhere() {
        let err = SampleSpecResolver::default().resolve("t", None).unwrap_err();
        assert!(matches!(err, SampleSpecError::MissingStrategy { .. }));
    }

    #[test]
    fn test_zero_budget_is_invalid() {
        let err = SampleSpecPatch::strategy(Strategy::Tail)
            .with_row_budget(0)
            .validate("t")
            .unwrap_err();
        assert!(matches!(err, SampleSpecError::InvalidField { field: "row_budget", .. }));
    }

    #[test]
    fn test_full_needs_nothing_and_drops_extras() {
        let spec = SampleSpecPatch::strategy(Strategy::Full)
            .with_date_column("ts")
            .validate("t")
            .unwrap();
        assert_eq!(spec, SampleSpec::Full);
        assert_eq!(spec.row_budget(), None);
    }

    #[test]
    fn test_strategy_parsing() {
        assert_eq!("Stratified".parse::<Strategy>().unwrap(), Strategy::Stratified);
        assert!("reservoir".parse::<Strategy>().is_err());
    }

    #[test]
    fn test_patch_deserialization_rejects_unknown_keys() {
        let patch: SampleSpecPatch =
            serde_json::from_str(r#"{"strategy":"recent","date_column":"ts"}"#).unwrap();
        assert_eq!(patch.strategy, Some(Strategy::Recent));
        assert!(serde_json::from_str::<SampleSpecPatch>(r#"{"rows":5}"#).is_err());
    }
}
