//! Full-text search vectors over operation data.
//!
//! Vectors are computed by Postgres from the `search_scope` object stored with
//! each `operation_data` row, and only for the hashes a publish actually wrote.

use apihub_common::error::{codes, ApiError};
use apihub_common::types::{ApiType, OperationData, OperationEntry};
use sqlx::PgConnection;
use std::collections::{BTreeMap, BTreeSet};

pub const REST_SCOPES: [&str; 5] = ["request", "response", "annotation", "properties", "examples"];
pub const GRAPHQL_SCOPES: [&str; 3] = ["argument", "property", "annotation"];

/// `search_scope` must be an object of strings
pub fn validate_scopes(data: &[OperationData]) -> Result<(), ApiError> {
    for item in data {
        let valid = item
            .search_scope
            .as_object()
            .map(|scopes| scopes.values().all(|v| v.is_string()))
            .unwrap_or(false);
        if !valid {
            return Err(ApiError::new(codes::INVALID_VALUE)
                .param("field", "search_scope")
                .param("value", &item.data_hash)
                .debug("search_scope must be an object of strings"));
        }
    }
    Ok(())
}

/// Split written hashes by the api type of the operations using them
pub fn hashes_by_type(
    operations: &[OperationEntry],
    written: &BTreeSet<String>,
) -> BTreeMap<ApiType, Vec<String>> {
    let mut by_type: BTreeMap<ApiType, BTreeSet<String>> = BTreeMap::new();
    for op in operations {
        if written.contains(&op.data_hash) {
            by_type.entry(op.api_type).or_default().insert(op.data_hash.clone());
        }
    }
    by_type
        .into_iter()
        .map(|(api_type, hashes)| (api_type, hashes.into_iter().collect()))
        .collect()
}

fn scope_columns(scopes: &[&str]) -> (String, String, String) {
    let columns: Vec<String> = scopes.iter().map(|s| format!("scope_{}", s)).collect();
    let values: Vec<String> = scopes
        .iter()
        .map(|s| format!("to_tsvector('simple', COALESCE(d.search_scope ->> '{}', ''))", s))
        .collect();
    let updates: Vec<String> = columns
        .iter()
        .map(|c| format!("{} = EXCLUDED.{}", c, c))
        .collect();
    (columns.join(", "), values.join(", "), updates.join(", "))
}

async fn upsert_typed(
    conn: &mut PgConnection,
    table: &str,
    scopes: &[&str],
    hashes: &[String],
) -> Result<u64, sqlx::Error> {
    if hashes.is_empty() {
        return Ok(0);
    }
    let (columns, values, updates) = scope_columns(scopes);
    let query = format!(
        "INSERT INTO {table} (data_hash, {columns}) \
         SELECT d.data_hash, {values} FROM operation_data d WHERE d.data_hash = ANY($1) \
         ON CONFLICT (data_hash) DO UPDATE SET {updates}"
    );
    Ok(sqlx::query(&query).bind(hashes).execute(&mut *conn).await?.rows_affected())
}

/// Refresh the per-type and cross-type vectors of the written hashes
pub async fn refresh_vectors(
    conn: &mut PgConnection,
    operations: &[OperationEntry],
    written: &BTreeSet<String>,
) -> Result<u64, sqlx::Error> {
    if written.is_empty() {
        return Ok(0);
    }

    let by_type = hashes_by_type(operations, written);
    let mut rows = 0;
    for (api_type, hashes) in &by_type {
        rows += match api_type {
            ApiType::Rest => upsert_typed(conn, "ts_rest_operation_data", &REST_SCOPES, hashes).await?,
            ApiType::Graphql => {
                upsert_typed(conn, "ts_graphql_operation_data", &GRAPHQL_SCOPES, hashes).await?
            },
        };
    }

    let all: Vec<String> = written.iter().cloned().collect();
    rows += sqlx::query(
        r#"
        INSERT INTO ts_operation_data (data_hash, scope_all)
        SELECT d.data_hash,
               to_tsvector('simple', COALESCE(
                   (SELECT string_agg(value, ' ' ORDER BY key) FROM jsonb_each_text(d.search_scope)),
                   ''))
        FROM operation_data d
        WHERE d.data_hash = ANY($1)
        ON CONFLICT (data_hash) DO UPDATE SET scope_all = EXCLUDED.scope_all
        "#,
    )
    .bind(&all)
    .execute(&mut *conn)
    .await?
    .rows_affected();

    Ok(rows)
}
