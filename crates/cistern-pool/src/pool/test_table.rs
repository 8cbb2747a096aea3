//! Automatic test table setup

use cistern_core::{CisternError, Connection, Result};

/// Make sure `table` exists and is empty, creating it when missing.
///
/// A pre-existing table with rows would make every test query return data
/// the pool never wrote, so it is rejected.
pub(crate) async fn ensure_test_table(conn: &dyn Connection, table: &str) -> Result<()> {
    if conn.table_exists(table).await? {
        let contents = conn.query(&format!("SELECT * FROM {table}"), &[]).await?;
        if contents.has_rows() {
            return Err(CisternError::Configuration(format!(
                "automatic test table {table} already exists and contains {} row(s); \
                 drop it or configure a different table",
                contents.row_count()
            )));
        }
        tracing::debug!(table, "automatic test table already exists");
        return Ok(());
    }

    conn.execute(&format!("CREATE TABLE {table} ( a CHAR(1) )"), &[])
        .await?;
    tracing::info!(table, "created automatic test table");
    Ok(())
}
