//! Implicit row locking for reads
//!
//! `SelectForUpdate` appends `FOR UPDATE` to a `SELECT` so concurrent
//! writers queue on the rows it reads instead of failing at commit with a
//! serialization conflict. A statement qualifies only when locking makes
//! sense for it:
//!
//! - the transaction is not read-only
//! - it does not read at a point in time (`AS OF SYSTEM TIME`)
//! - it does not already lock (`FOR UPDATE`, `FOR NO KEY UPDATE`, `FOR SHARE`,
//!   `FOR KEY SHARE`, including `SKIP LOCKED`/`NOWAIT` forms)
//! - it calls no aggregate function
//! - it has no `GROUP BY`, `HAVING` or `DISTINCT`
//! - it reads no system catalog schema
//!
//! When the statement ends with `;` the clause goes in front of the first
//! `;` and every terminator after it is kept as written.

use once_cell::sync::Lazy;
use regex::Regex;
use sqlreplay_core::{Error, Result};
use std::collections::HashSet;

use crate::QueryProcessor;

/// Aggregate function names that disqualify a statement from row locking
pub const AGGREGATE_FUNCTIONS: &[&str] = &[
    "array_agg",
    "avg",
    "bit_and",
    "bit_or",
    "bool_and",
    "bool_or",
    "concat_agg",
    "corr",
    "count",
    "count_rows",
    "covar_pop",
    "covar_samp",
    "every",
    "json_agg",
    "json_object_agg",
    "max",
    "min",
    "percentile_cont",
    "percentile_disc",
    "regr_avgx",
    "regr_avgy",
    "regr_count",
    "regr_intercept",
    "regr_r2",
    "regr_slope",
    "regr_sxx",
    "regr_sxy",
    "regr_syy",
    "sqrdiff",
    "st_collect",
    "st_extent",
    "st_makeline",
    "st_memcollect",
    "st_memunion",
    "st_union",
    "stddev",
    "stddev_pop",
    "stddev_samp",
    "string_agg",
    "sum",
    "sum_int",
    "var_pop",
    "var_samp",
    "variance",
    "xor_agg",
];

const SYSTEM_SCHEMAS: &[&str] = &[
    "crdb_internal.",
    "information_schema.",
    "pg_catalog.",
    "pg_extension.",
];

const LOCKING_CLAUSE: &str = " FOR UPDATE";

const LOCKING_STRENGTHS: &[&str] = &[
    "for update",
    "for no key update",
    "for share",
    "for key share",
];

const GROUPING_CLAUSES: &[&str] = &["group by", "having", "distinct"];

static AGGREGATES: Lazy<HashSet<&'static str>> =
    Lazy::new(|| AGGREGATE_FUNCTIONS.iter().copied().collect());

// identifier immediately followed by an opening parenthesis
static FUNCTION_CALL: Lazy<Regex> = Lazy::new(|| Regex::new(r"(\w+)\(").expect("valid regex"));

/// Processor that adds `FOR UPDATE` to qualifying `SELECT` statements
#[derive(Debug, Clone, Copy, Default)]
pub struct SelectForUpdate;

impl SelectForUpdate {
    fn qualifies(read_only: bool, lowered: &str) -> bool {
        lowered.starts_with("select")
            && !read_only
            && !lowered.contains("as of system time")
            && !LOCKING_STRENGTHS.iter().any(|clause| lowered.contains(clause))
            && !has_aggregate_function(lowered)
            && !GROUPING_CLAUSES.iter().any(|clause| lowered.contains(clause))
            && !SYSTEM_SCHEMAS.iter().any(|schema| lowered.contains(schema))
    }
}

impl QueryProcessor for SelectForUpdate {
    fn process(&self, read_only: bool, sql: &str) -> String {
        if !Self::qualifies(read_only, &sql.to_lowercase()) {
            return sql.to_string();
        }
        if sql.ends_with(';') {
            sql.replacen(';', &format!("{};", LOCKING_CLAUSE), 1)
        } else {
            format!("{}{}", sql, LOCKING_CLAUSE)
        }
    }

    fn name(&self) -> &'static str {
        "select-for-update"
    }
}

fn has_aggregate_function(lowered: &str) -> bool {
    FUNCTION_CALL
        .captures_iter(lowered)
        .filter_map(|caps| caps.get(1))
        .any(|name| AGGREGATES.contains(name.as_str()))
}

/// Apply the row-locking rewrite to possibly absent statement text
///
/// Absent text is an `InvalidArgument` error; empty text comes back empty.
pub fn rewrite(read_only: bool, sql: Option<&str>) -> Result<String> {
    let sql = sql.ok_or_else(|| Error::InvalidArgument("query is null".into()))?;
    Ok(SelectForUpdate.process(read_only, sql))
}
