//! Fixed query descriptor handed over by the (out of scope) SQL front end.

use std::collections::BTreeMap;

use nq_common::{NqError, Result};
use serde::{Deserialize, Serialize};

/// One equi-join step: `left.left_key = right.right_key`.
///
/// Steps are chained left to right; for step k > 0 the left input at execution time is the
/// output of step k - 1, and `left` names the base table that carries `left_key` into it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JoinStep {
    pub left: String,
    pub left_key: String,
    pub right: String,
    pub right_key: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AggFunc {
    /// Arithmetic mean over non-null values.
    Avg,
    /// Number of distinct non-null values.
    CountDistinct,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AggregateSpec {
    pub func: AggFunc,
    /// Source column, possibly alias-qualified (`u.age`).
    pub column: String,
    pub alias: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderBy {
    pub column: String,
    pub descending: bool,
}

impl OrderBy {
    pub fn asc(column: impl Into<String>) -> Self {
        Self {
            column: column.into(),
            descending: false,
        }
    }

    pub fn desc(column: impl Into<String>) -> Self {
        Self {
            column: column.into(),
            descending: true,
        }
    }
}

/// Immutable input to planning and execution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryDescriptor {
    /// Base table name -> alias.
    pub tables: BTreeMap<String, String>,
    pub joins: Vec<JoinStep>,
    pub group_by: Vec<String>,
    pub aggregates: Vec<AggregateSpec>,
    /// Final projection; names are group-by columns or aggregate aliases.
    pub select: Vec<String>,
    pub order_by: Vec<OrderBy>,
    /// Base table name -> exact columns the query reads from it.
    pub needed_columns: BTreeMap<String, Vec<String>>,
}

impl QueryDescriptor {
    /// Songs ⋈ Listens ⋈ Users, average listener age and distinct listeners per song.
    pub fn listens_by_song() -> Self {
        let tables = [("Songs", "s"), ("Listens", "l"), ("Users", "u")]
            .into_iter()
            .map(|(t, a)| (t.to_string(), a.to_string()))
            .collect();
        let needed_columns = [
            ("Songs", vec!["song_id", "title"]),
            ("Listens", vec!["song_id", "user_id"]),
            ("Users", vec!["user_id", "age"]),
        ]
        .into_iter()
        .map(|(t, cols)| {
            (
                t.to_string(),
                cols.into_iter().map(str::to_string).collect(),
            )
        })
        .collect();
        Self {
            tables,
            joins: vec![
                JoinStep {
                    left: "Songs".to_string(),
                    left_key: "song_id".to_string(),
                    right: "Listens".to_string(),
                    right_key: "song_id".to_string(),
                },
                JoinStep {
                    left: "Listens".to_string(),
                    left_key: "user_id".to_string(),
                    right: "Users".to_string(),
                    right_key: "user_id".to_string(),
                },
            ],
            group_by: vec!["s.song_id".to_string(), "s.title".to_string()],
            aggregates: vec![
                AggregateSpec {
                    func: AggFunc::Avg,
                    column: "u.age".to_string(),
                    alias: "avg_age".to_string(),
                },
                AggregateSpec {
                    func: AggFunc::CountDistinct,
                    column: "l.user_id".to_string(),
                    alias: "count_distinct_users".to_string(),
                },
            ],
            select: vec![
                "s.song_id".to_string(),
                "avg_age".to_string(),
                "count_distinct_users".to_string(),
            ],
            order_by: vec![
                OrderBy::desc("count_distinct_users"),
                OrderBy::asc("s.song_id"),
            ],
            needed_columns,
        }
    }

    /// Base tables in first-use order of the join chain.
    pub fn base_tables(&self) -> Vec<String> {
        let mut out: Vec<String> = Vec::new();
        for step in &self.joins {
            for t in [&step.left, &step.right] {
                if !out.contains(t) {
                    out.push(t.clone());
                }
            }
        }
        out
    }

    pub fn columns_for(&self, table: &str) -> Result<&[String]> {
        self.needed_columns
            .get(table)
            .map(Vec::as_slice)
            .ok_or_else(|| NqError::Planning(format!("no needed columns declared for {table}")))
    }

    /// Shape checks that need no table metadata.
    pub fn validate(&self) -> Result<()> {
        if self.joins.is_empty() {
            return Err(NqError::Planning("query has no join steps".to_string()));
        }
        for (i, step) in self.joins.iter().enumerate() {
            for t in [&step.left, &step.right] {
                if !self.tables.contains_key(t) {
                    return Err(NqError::Planning(format!(
                        "join step {} references unknown table {t}",
                        i + 1
                    )));
                }
            }
            if i > 0 && self.joins[..i].iter().all(|s| s.left != step.left && s.right != step.left) {
                return Err(NqError::Planning(format!(
                    "join step {} left table {} is not part of the previous result",
                    i + 1,
                    step.left
                )));
            }
            let left_cols = self.columns_for(&step.left)?;
            let right_cols = self.columns_for(&step.right)?;
            if !left_cols.contains(&step.left_key) || !right_cols.contains(&step.right_key) {
                return Err(NqError::Planning(format!(
                    "join step {} keys must be among the needed columns",
                    i + 1
                )));
            }
        }
        Ok(())
    }

    /// Canonical SQL text this descriptor stands for. Display only; never parsed.
    pub fn sql(&self) -> String {
        let alias = |t: &str| self.tables.get(t).cloned().unwrap_or_else(|| t.to_string());
        let aggs = self
            .aggregates
            .iter()
            .map(|a| match a.func {
                AggFunc::Avg => format!("AVG({}) AS {}", a.column, a.alias),
                AggFunc::CountDistinct => format!("COUNT(DISTINCT {}) AS {}", a.column, a.alias),
            })
            .collect::<Vec<_>>();
        let select = self
            .select
            .iter()
            .map(|c| {
                self.aggregates
                    .iter()
                    .position(|a| &a.alias == c)
                    .map_or_else(|| c.clone(), |i| aggs[i].clone())
            })
            .collect::<Vec<_>>()
            .join(", ");

        let mut from = String::new();
        if let Some(first) = self.joins.first() {
            from.push_str(&format!("{} {}", first.left, alias(&first.left)));
        }
        for step in &self.joins {
            from.push_str(&format!(
                "\nJOIN {} {} ON {}.{} = {}.{}",
                step.right,
                alias(&step.right),
                alias(&step.left),
                step.left_key,
                alias(&step.right),
                step.right_key
            ));
        }
        let order = self
            .order_by
            .iter()
            .map(|o| format!("{} {}", o.column, if o.descending { "DESC" } else { "ASC" }))
            .collect::<Vec<_>>()
            .join(", ");
        format!(
            "SELECT {select}\nFROM {from}\nGROUP BY {}\nORDER BY {order};",
            self.group_by.join(", ")
        )
    }
}

/// Strip an alias qualifier: `s.song_id` -> `song_id`.
pub fn unqualified(column: &str) -> &str {
    column.rsplit_once('.').map_or(column, |(_, c)| c)
}
