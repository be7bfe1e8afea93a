use metarepo_core::{BatchedStatement, DeleteError, SqlValue, StorageSession};
use rusqlite::types::Value;
use rusqlite::{params_from_iter, Connection};

/// [`StorageSession`] over a borrowed connection, usually a transaction.
pub struct SqliteSession<'c> {
    conn: &'c Connection,
}

impl<'c> SqliteSession<'c> {
    #[must_use]
    pub fn new(conn: &'c Connection) -> Self {
        Self { conn }
    }
}

fn to_value(value: &SqlValue) -> Value {
    match value {
        SqlValue::Null => Value::Null,
        SqlValue::Integer(value) => Value::Integer(*value),
        SqlValue::Text(value) => Value::Text(value.clone()),
    }
}

impl StorageSession for SqliteSession<'_> {
    fn quote_identifier(&self, identifier: &str) -> String {
        format!("\"{}\"", identifier.replace('"', "\"\""))
    }

    fn execute(&mut self, sql: &str, params: &[SqlValue]) -> metarepo_core::Result<usize> {
        let mut stmt = self.conn.prepare_cached(sql).map_err(DeleteError::storage)?;
        stmt.execute(params_from_iter(params.iter().map(to_value))).map_err(DeleteError::storage)
    }

    fn execute_batched(&mut self, statement: &BatchedStatement) -> metarepo_core::Result<usize> {
        let mut stmt = self.conn.prepare_cached(&statement.sql).map_err(DeleteError::storage)?;
        let mut affected = 0;
        for params in &statement.executions {
            affected += stmt
                .execute(params_from_iter(params.iter().map(to_value)))
                .map_err(DeleteError::storage)?;
        }
        tracing::trace!(sql = %statement.sql, executions = statement.executions.len(), affected, "executed batch");
        Ok(affected)
    }
}
