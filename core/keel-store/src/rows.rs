//! Row-level statements for entity tables and join tables.
//!
//! Every function takes `&Connection` so it can run on a plain connection or,
//! through deref, on a `Transaction`. Soft-deleted rows are invisible to all
//! reads and writes here except `hard_delete`.

use crate::sql::{quote_ident, to_sql_value, SqlFragment};
use crate::{StoreError, StoreResult};
use keel_model::{EntityDefinition, FieldType, JoinTable, KeyGeneration};
use keel_types::{generate_key, Record, Value};
use rusqlite::types::{Value as SqlValue, ValueRef};
use rusqlite::{params_from_iter, Connection, Row};
use tracing::debug;

// ── Reads ────────────────────────────────────────────────────────

/// Live rows of `def` matching `filter`, ordered by primary key.
pub fn select(
    conn: &Connection,
    def: &EntityDefinition,
    filter: Option<&SqlFragment>,
) -> StoreResult<Vec<Record>> {
    let columns = readable_columns(def);
    let scope = live(def, filter.cloned());
    let sql = format!(
        "SELECT {} FROM {} WHERE {} ORDER BY {}",
        columns.iter().map(|c| quote_ident(c)).collect::<Vec<_>>().join(", "),
        quote_ident(&def.table),
        scope.sql,
        quote_ident(def.pk()),
    );
    let mut stmt = conn.prepare(&sql)?;
    let mut rows = stmt.query(params_from_iter(scope.bound()))?;
    let mut out = Vec::new();
    while let Some(row) = rows.next()? {
        out.push(decode_row(def, &columns, row)?);
    }
    Ok(out)
}

/// The live row with the given key.
pub fn find(conn: &Connection, def: &EntityDefinition, key: &Value) -> StoreResult<Option<Record>> {
    let mut found = select(conn, def, Some(&key_predicate(def, key)))?;
    Ok(found.pop())
}

/// Keys of live rows matching `filter`.
pub fn keys_where(
    conn: &Connection,
    def: &EntityDefinition,
    filter: &SqlFragment,
) -> StoreResult<Vec<Value>> {
    let scope = live(def, Some(filter.clone()));
    let sql = format!(
        "SELECT {pk} FROM {table} WHERE {cond} ORDER BY {pk}",
        pk = quote_ident(def.pk()),
        table = quote_ident(&def.table),
        cond = scope.sql,
    );
    let mut stmt = conn.prepare(&sql)?;
    let pk_type = def.column_type(def.pk());
    let mut rows = stmt.query(params_from_iter(scope.bound()))?;
    let mut keys = Vec::new();
    while let Some(row) = rows.next()? {
        keys.push(decode_column(pk_type, row.get_ref(0)?)?);
    }
    Ok(keys)
}

/// Number of live rows matching `filter`.
pub fn count_where(
    conn: &Connection,
    def: &EntityDefinition,
    filter: &SqlFragment,
) -> StoreResult<usize> {
    let scope = live(def, Some(filter.clone()));
    let sql = format!(
        "SELECT COUNT(*) FROM {} WHERE {}",
        quote_ident(&def.table),
        scope.sql
    );
    let count: i64 = conn.query_row(&sql, params_from_iter(scope.bound()), |row| row.get(0))?;
    Ok(usize::try_from(count).unwrap_or_default())
}

// ── Writes ───────────────────────────────────────────────────────

/// Inserts a row and returns its key.
///
/// `auto` keys come from the rowid unless supplied, `uuid` keys are
/// generated (v7) unless supplied, `manual` keys must be supplied.
pub fn insert(conn: &Connection, def: &EntityDefinition, values: &Record) -> StoreResult<Value> {
    let mut values = values.clone();
    let supplied = values.get(def.pk()).filter(|v| !v.is_null()).cloned();
    let key = match (def.primary_key.generation, supplied) {
        (_, Some(key)) => Some(key),
        (KeyGeneration::Uuid, None) => {
            let key = Value::Text(generate_key());
            values.insert(def.pk(), key.clone());
            Some(key)
        }
        (KeyGeneration::Auto, None) => {
            values.remove(def.pk());
            None
        }
        (KeyGeneration::Manual, None) => {
            return Err(StoreError::InvalidData(format!(
                "{} requires a client-supplied `{}`",
                def.name,
                def.pk()
            )));
        }
    };

    let table = quote_ident(&def.table);
    let sql = if values.is_empty() {
        format!("INSERT INTO {table} DEFAULT VALUES")
    } else {
        let columns: Vec<String> = values.keys().map(|c| quote_ident(c)).collect();
        let marks = vec!["?"; columns.len()].join(", ");
        format!("INSERT INTO {table} ({}) VALUES ({marks})", columns.join(", "))
    };
    let bound: Vec<SqlValue> = values.iter().map(|(_, v)| to_sql_value(v)).collect();
    conn.execute(&sql, params_from_iter(bound))?;

    let key = key.unwrap_or_else(|| Value::Int(conn.last_insert_rowid()));
    debug!(entity = %def.name, key = %key, "inserted row");
    Ok(key)
}

/// Updates the live row with `key` (and matching `scope`, if given) and
/// returns the number of rows matched. An empty update only checks that the
/// row exists.
pub fn update(
    conn: &Connection,
    def: &EntityDefinition,
    key: &Value,
    values: &Record,
    scope: Option<&SqlFragment>,
) -> StoreResult<usize> {
    let target = scoped_key(def, key, scope);
    let assignments: Vec<(&String, &Value)> =
        values.iter().filter(|(c, _)| c.as_str() != def.pk()).collect();
    if assignments.is_empty() {
        return count_where(conn, def, &target);
    }

    let scope = live(def, Some(target));
    let set = assignments
        .iter()
        .map(|(c, _)| format!("{} = ?", quote_ident(c)))
        .collect::<Vec<_>>()
        .join(", ");
    let sql = format!("UPDATE {} SET {set} WHERE {}", quote_ident(&def.table), scope.sql);
    let bound: Vec<SqlValue> = assignments
        .iter()
        .map(|(_, v)| to_sql_value(v))
        .chain(scope.bound())
        .collect();
    Ok(conn.execute(&sql, params_from_iter(bound))?)
}

/// Deletes the live row with `key`: stamps the soft-delete marker with
/// `now` when the entity has one, otherwise removes the row.
pub fn delete(
    conn: &Connection,
    def: &EntityDefinition,
    key: &Value,
    scope: Option<&SqlFragment>,
    now: &str,
) -> StoreResult<usize> {
    let target = live(def, Some(scoped_key(def, key, scope)));
    let table = quote_ident(&def.table);
    let affected = match def.soft_delete_field() {
        Some(marker) => {
            let sql = format!("UPDATE {table} SET {} = ? WHERE {}", quote_ident(marker), target.sql);
            let bound: Vec<SqlValue> = std::iter::once(SqlValue::Text(now.to_string()))
                .chain(target.bound())
                .collect();
            conn.execute(&sql, params_from_iter(bound))?
        }
        None => {
            let sql = format!("DELETE FROM {table} WHERE {}", target.sql);
            conn.execute(&sql, params_from_iter(target.bound()))?
        }
    };
    debug!(entity = %def.name, key = %key, affected, "deleted row");
    Ok(affected)
}

/// Clears `column` on every live row where it equals `value`.
pub fn set_null(
    conn: &Connection,
    def: &EntityDefinition,
    column: &str,
    value: &Value,
) -> StoreResult<usize> {
    let col = quote_ident(column);
    let target = live(def, Some(SqlFragment::new(format!("{col} = ?"), vec![value.clone()])));
    let sql = format!("UPDATE {} SET {col} = NULL WHERE {}", quote_ident(&def.table), target.sql);
    Ok(conn.execute(&sql, params_from_iter(target.bound()))?)
}

// ── Join tables ──────────────────────────────────────────────────

/// Links `source` to `target`; an existing link is left as is.
pub fn link(conn: &Connection, join: &JoinTable, source: &Value, target: &Value) -> StoreResult<()> {
    let exists: i64 = conn.query_row(
        &format!(
            "SELECT COUNT(*) FROM {} WHERE {} = ? AND {} = ?",
            quote_ident(&join.table),
            quote_ident(&join.source_column),
            quote_ident(&join.target_column),
        ),
        params_from_iter([to_sql_value(source), to_sql_value(target)]),
        |row| row.get(0),
    )?;
    if exists == 0 {
        conn.execute(
            &format!(
                "INSERT INTO {} ({}, {}) VALUES (?, ?)",
                quote_ident(&join.table),
                quote_ident(&join.source_column),
                quote_ident(&join.target_column),
            ),
            params_from_iter([to_sql_value(source), to_sql_value(target)]),
        )?;
    }
    Ok(())
}

/// Removes the link between `source` and `target`. Join rows are always
/// hard-deleted.
pub fn unlink(conn: &Connection, join: &JoinTable, source: &Value, target: &Value) -> StoreResult<usize> {
    Ok(conn.execute(
        &format!(
            "DELETE FROM {} WHERE {} = ? AND {} = ?",
            quote_ident(&join.table),
            quote_ident(&join.source_column),
            quote_ident(&join.target_column),
        ),
        params_from_iter([to_sql_value(source), to_sql_value(target)]),
    )?)
}

/// Removes every link of `source` whose target is not in `keep`.
pub fn unlink_except(
    conn: &Connection,
    join: &JoinTable,
    source: &Value,
    keep: &[Value],
) -> StoreResult<usize> {
    let mut sql = format!(
        "DELETE FROM {} WHERE {} = ?",
        quote_ident(&join.table),
        quote_ident(&join.source_column),
    );
    if !keep.is_empty() {
        sql.push_str(&format!(
            " AND {} NOT IN ({})",
            quote_ident(&join.target_column),
            vec!["?"; keep.len()].join(", ")
        ));
    }
    let bound: Vec<SqlValue> = std::iter::once(source)
        .chain(keep)
        .map(to_sql_value)
        .collect();
    Ok(conn.execute(&sql, params_from_iter(bound))?)
}

/// Removes every join row whose `column` equals `key`.
pub fn unlink_all(conn: &Connection, join: &JoinTable, column: &str, key: &Value) -> StoreResult<usize> {
    Ok(conn.execute(
        &format!(
            "DELETE FROM {} WHERE {} = ?",
            quote_ident(&join.table),
            quote_ident(column)
        ),
        params_from_iter([to_sql_value(key)]),
    )?)
}

/// Target keys linked to `source`, in join-row order.
pub fn linked_targets(conn: &Connection, join: &JoinTable, source: &Value) -> StoreResult<Vec<Value>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {} FROM {} WHERE {} = ? ORDER BY rowid",
        quote_ident(&join.target_column),
        quote_ident(&join.table),
        quote_ident(&join.source_column),
    ))?;
    let mut rows = stmt.query(params_from_iter([to_sql_value(source)]))?;
    let mut out = Vec::new();
    while let Some(row) = rows.next()? {
        out.push(decode_column(None, row.get_ref(0)?)?);
    }
    Ok(out)
}

// ── Helpers ──────────────────────────────────────────────────────

/// `pk = ?`
pub fn key_predicate(def: &EntityDefinition, key: &Value) -> SqlFragment {
    SqlFragment::new(format!("{} = ?", quote_ident(def.pk())), vec![key.clone()])
}

fn scoped_key(def: &EntityDefinition, key: &Value, scope: Option<&SqlFragment>) -> SqlFragment {
    match scope {
        Some(scope) => key_predicate(def, key).and(scope.clone()),
        None => key_predicate(def, key),
    }
}

/// Adds the soft-delete visibility condition to a filter.
fn live(def: &EntityDefinition, filter: Option<SqlFragment>) -> SqlFragment {
    let visible = def
        .soft_delete_field()
        .map(|marker| SqlFragment::new(format!("{} IS NULL", quote_ident(marker)), Vec::new()));
    SqlFragment::all(filter.into_iter().chain(visible))
}

/// Stored columns minus the soft-delete marker, which is never returned.
fn readable_columns(def: &EntityDefinition) -> Vec<&str> {
    def.columns()
        .into_iter()
        .filter(|c| Some(*c) != def.soft_delete_field())
        .collect()
}

fn decode_row(def: &EntityDefinition, columns: &[&str], row: &Row<'_>) -> StoreResult<Record> {
    let mut record = Record::new();
    for (i, column) in columns.iter().enumerate() {
        let value = decode_column(def.column_type(column), row.get_ref(i)?)?;
        record.insert(*column, value);
    }
    Ok(record)
}

/// Decodes a stored value by its declared type. Untyped columns decode by
/// storage class.
fn decode_column(ty: Option<FieldType>, raw: ValueRef<'_>) -> StoreResult<Value> {
    let value = match (ty, raw) {
        (_, ValueRef::Null) => Value::Null,
        (Some(FieldType::Bool), ValueRef::Integer(i)) => Value::Bool(i != 0),
        (Some(FieldType::Float | FieldType::Decimal), ValueRef::Integer(i)) => Value::Float(i as f64),
        (Some(FieldType::Json), ValueRef::Text(bytes)) => {
            let text = std::str::from_utf8(bytes)
                .map_err(|e| StoreError::InvalidData(format!("non-UTF-8 JSON column: {e}")))?;
            Value::from_json(serde_json::from_str(text)?)
        }
        (_, ValueRef::Integer(i)) => Value::Int(i),
        (_, ValueRef::Real(f)) => Value::Float(f),
        (_, ValueRef::Text(bytes)) => Value::Text(
            std::str::from_utf8(bytes)
                .map_err(|e| StoreError::InvalidData(format!("non-UTF-8 text column: {e}")))?
                .to_string(),
        ),
        (_, ValueRef::Blob(_)) => {
            return Err(StoreError::InvalidData("blob columns are not supported".into()));
        }
    };
    Ok(value)
}
