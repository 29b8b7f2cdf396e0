use sqlite as sql;

/// Run an SQL query inside a transaction.
/// Commits the transaction on success, and rolls back on error.
pub fn transaction<T, E: From<sql::Error>>(
    db: &sql::Connection,
    query: impl FnOnce(&sql::Connection) -> Result<T, E>,
) -> Result<T, E> {
    db.execute("BEGIN")?;

    match query(db) {
        Ok(result) => {
            db.execute("COMMIT")?;
            Ok(result)
        }
        Err(err) => {
            db.execute("ROLLBACK")?;
            Err(err)
        }
    }
}

/// Run a `SELECT COUNT(*) ..` query with the given bindings and return the count.
pub fn count<'a>(
    db: &sql::Connection,
    query: &str,
    bindings: impl IntoIterator<Item = &'a str>,
) -> Result<usize, sql::Error> {
    let mut stmt = db.prepare(query)?;
    for (i, value) in bindings.into_iter().enumerate() {
        stmt.bind((i + 1, value))?;
    }
    match stmt.into_iter().next() {
        Some(row) => Ok(row?.read::<i64, _>(0) as usize),
        None => Ok(0),
    }
}
