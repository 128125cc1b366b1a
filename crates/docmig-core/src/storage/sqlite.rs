use async_trait::async_trait;
use rusqlite::functions::FunctionFlags;
use rusqlite::types::Type;
use rusqlite::OptionalExtension;
use tokio_rusqlite::Connection;

use super::{assign_id, BufferedCursor, DocumentCursor, DocumentStore};
use crate::error::{MigrationError, Result};
use crate::filter::{Filter, FindQuery};
use crate::ledger::{RunFilter, RunRecord};
use crate::ops::{OpEffect, WriteOp, WriteSummary};
use crate::types::{Document, DocumentId};

/// SQLite-backed document store using bundled SQLite (zero system dependencies).
///
/// Documents are stored as JSON text. Filters are evaluated by the
/// `doc_match(body, filter_json)` SQL function registered on the connection,
/// so matching semantics are identical to [`Filter::matches`] and `LIMIT`
/// applies to matching rows only.
pub struct SqliteStore {
    conn: Connection,
}

impl SqliteStore {
    pub async fn new(path: &str) -> Result<Self> {
        let conn = if path == ":memory:" {
            Connection::open_in_memory()
                .await
                .map_err(|e: rusqlite::Error| MigrationError::Storage(e.to_string()))?
        } else {
            Connection::open(path)
                .await
                .map_err(|e: rusqlite::Error| MigrationError::Storage(e.to_string()))?
        };

        let store = SqliteStore { conn };
        store.initialize().await?;
        Ok(store)
    }
}

fn storage_error(e: tokio_rusqlite::Error) -> MigrationError {
    MigrationError::Storage(e.to_string())
}

fn decode_body(body: &str) -> std::result::Result<Document, rusqlite::Error> {
    serde_json::from_str(body)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(0, Type::Text, Box::new(e)))
}

fn encode_body(doc: &Document) -> std::result::Result<String, rusqlite::Error> {
    serde_json::to_string(doc).map_err(|e| rusqlite::Error::ToSqlConversionFailure(Box::new(e)))
}

type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

fn register_functions(conn: &rusqlite::Connection) -> std::result::Result<(), rusqlite::Error> {
    conn.create_scalar_function(
        "doc_match",
        2,
        FunctionFlags::SQLITE_UTF8 | FunctionFlags::SQLITE_DETERMINISTIC,
        |ctx| {
            // The filter argument is a bound parameter, constant for the
            // statement, so it is parsed once and kept as auxiliary data.
            let filter = ctx.get_or_create_aux(1, |raw| -> std::result::Result<Filter, BoxError> {
                Ok(serde_json::from_str(raw.as_str()?)?)
            })?;
            let body: String = ctx.get(0)?;
            let doc: Document = serde_json::from_str(&body)
                .map_err(|e| rusqlite::Error::UserFunctionError(Box::new(e)))?;
            Ok(filter.matches(&doc))
        },
    )
}

#[async_trait]
impl DocumentStore for SqliteStore {
    async fn initialize(&self) -> Result<()> {
        self.conn
            .call(|conn| -> std::result::Result<(), rusqlite::Error> {
                // WAL keeps the live application's reads unblocked while a job writes
                conn.execute_batch(
                    "
                    PRAGMA journal_mode = WAL;
                    PRAGMA synchronous = NORMAL;
                    PRAGMA busy_timeout = 5000;
                    ",
                )?;

                conn.execute_batch(
                    "
                    CREATE TABLE IF NOT EXISTS documents (
                        collection TEXT NOT NULL,
                        id TEXT NOT NULL,
                        body TEXT NOT NULL,
                        PRIMARY KEY (collection, id)
                    );
                    CREATE TABLE IF NOT EXISTS migration_runs (
                        seq INTEGER PRIMARY KEY AUTOINCREMENT,
                        id TEXT NOT NULL UNIQUE,
                        job_id TEXT NOT NULL,
                        state TEXT NOT NULL,
                        record TEXT NOT NULL
                    );
                    CREATE INDEX IF NOT EXISTS idx_runs_job_id ON migration_runs(job_id);
                    ",
                )?;

                register_functions(conn)
            })
            .await
            .map_err(storage_error)
    }

    async fn insert_many(&self, collection: &str, docs: Vec<Document>) -> Result<Vec<DocumentId>> {
        let collection = collection.to_string();
        let mut rows = Vec::with_capacity(docs.len());
        for mut doc in docs {
            let id = assign_id(&mut doc)?;
            let body = serde_json::to_string(&doc)?;
            rows.push((id, body));
        }

        self.conn
            .call(move |conn| -> std::result::Result<Vec<DocumentId>, rusqlite::Error> {
                let tx = conn.transaction()?;
                {
                    let mut stmt = tx.prepare(
                        "INSERT INTO documents (collection, id, body) VALUES (?1, ?2, ?3)",
                    )?;
                    for (id, body) in &rows {
                        stmt.execute(rusqlite::params![collection, id.as_str(), body])?;
                    }
                }
                tx.commit()?;
                Ok(rows.into_iter().map(|(id, _)| id).collect())
            })
            .await
            .map_err(storage_error)
    }

    async fn get(&self, collection: &str, id: &DocumentId) -> Result<Option<Document>> {
        let collection = collection.to_string();
        let id = id.clone();

        self.conn
            .call(move |conn| -> std::result::Result<Option<Document>, rusqlite::Error> {
                let body = conn
                    .query_row(
                        "SELECT body FROM documents WHERE collection = ?1 AND id = ?2",
                        rusqlite::params![collection, id.as_str()],
                        |row| row.get::<_, String>(0),
                    )
                    .optional()?;
                body.as_deref().map(decode_body).transpose()
            })
            .await
            .map_err(storage_error)
    }

    async fn find(&self, collection: &str, query: &FindQuery) -> Result<Box<dyn DocumentCursor>> {
        let collection = collection.to_string();
        let filter_json = serde_json::to_string(&query.filter)?;
        // LIMIT -1 means unbounded in SQLite
        let limit = query.limit.map(|l| l as i64).unwrap_or(-1);

        let docs = self
            .conn
            .call(move |conn| -> std::result::Result<Vec<Document>, rusqlite::Error> {
                let mut stmt = conn.prepare(
                    "SELECT body FROM documents
                     WHERE collection = ?1 AND doc_match(body, ?2)
                     ORDER BY id LIMIT ?3",
                )?;
                let rows = stmt.query_map(rusqlite::params![collection, filter_json, limit], |row| {
                    row.get::<_, String>(0)
                })?;
                let mut docs = Vec::new();
                for row in rows {
                    docs.push(decode_body(&row?)?);
                }
                Ok(docs)
            })
            .await
            .map_err(storage_error)?;

        let docs = docs.into_iter().map(|doc| query.shape(doc)).collect();
        Ok(Box::new(BufferedCursor::new(docs)))
    }

    async fn count(&self, collection: &str, filter: &Filter) -> Result<u64> {
        let collection = collection.to_string();
        let filter_json = serde_json::to_string(filter)?;

        self.conn
            .call(move |conn| -> std::result::Result<u64, rusqlite::Error> {
                let count: i64 = conn.query_row(
                    "SELECT COUNT(*) FROM documents WHERE collection = ?1 AND doc_match(body, ?2)",
                    rusqlite::params![collection, filter_json],
                    |row| row.get(0),
                )?;
                Ok(count as u64)
            })
            .await
            .map_err(storage_error)
    }

    async fn bulk_write(&self, collection: &str, ops: &[WriteOp]) -> Result<WriteSummary> {
        let collection = collection.to_string();
        let ops = ops.to_vec();

        // A storage error rolls back the whole batch, so a failed flush
        // leaves no partial writes behind.
        self.conn
            .call(move |conn| -> std::result::Result<WriteSummary, rusqlite::Error> {
                let tx = conn.transaction()?;
                let mut summary = WriteSummary::default();
                for (index, op) in ops.iter().enumerate() {
                    let id = op.id().as_str();
                    let body = tx
                        .query_row(
                            "SELECT body FROM documents WHERE collection = ?1 AND id = ?2",
                            rusqlite::params![collection, id],
                            |row| row.get::<_, String>(0),
                        )
                        .optional()?;
                    let mut doc = body.as_deref().map(decode_body).transpose()?;

                    let effect = summary.apply_op(index, op, doc.as_mut());
                    match (effect, doc) {
                        (OpEffect::Modified, Some(doc)) => {
                            tx.execute(
                                "UPDATE documents SET body = ?3 WHERE collection = ?1 AND id = ?2",
                                rusqlite::params![collection, id, encode_body(&doc)?],
                            )?;
                        }
                        (OpEffect::Deleted, _) => {
                            tx.execute(
                                "DELETE FROM documents WHERE collection = ?1 AND id = ?2",
                                rusqlite::params![collection, id],
                            )?;
                        }
                        _ => {}
                    }
                }
                tx.commit()?;
                Ok(summary)
            })
            .await
            .map_err(storage_error)
    }

    async fn append_run(&self, record: &RunRecord) -> Result<()> {
        let encoded = serde_json::to_string(record)?;
        let id = record.id.clone();
        let job_id = record.job_id.clone();
        let state = record.state.to_string();

        self.conn
            .call(move |conn| -> std::result::Result<(), rusqlite::Error> {
                conn.execute(
                    "INSERT INTO migration_runs (id, job_id, state, record) VALUES (?1, ?2, ?3, ?4)",
                    rusqlite::params![id, job_id, state, encoded],
                )?;
                Ok(())
            })
            .await
            .map_err(storage_error)
    }

    async fn query_runs(&self, filter: &RunFilter) -> Result<Vec<RunRecord>> {
        let filter = filter.clone();

        self.conn
            .call(move |conn| -> std::result::Result<Vec<RunRecord>, rusqlite::Error> {
                let mut sql = "SELECT record FROM migration_runs WHERE 1=1".to_string();
                let mut params: Vec<Box<dyn rusqlite::types::ToSql>> = Vec::new();

                if let Some(ref job_id) = filter.job_id {
                    sql.push_str(&format!(" AND job_id = ?{}", params.len() + 1));
                    params.push(Box::new(job_id.clone()));
                }
                if let Some(state) = filter.state {
                    sql.push_str(&format!(" AND state = ?{}", params.len() + 1));
                    params.push(Box::new(state.to_string()));
                }

                sql.push_str(" ORDER BY seq DESC");

                if let Some(limit) = filter.limit {
                    sql.push_str(&format!(" LIMIT ?{}", params.len() + 1));
                    params.push(Box::new(limit as i64));
                }

                let mut stmt = conn.prepare(&sql)?;
                let param_refs: Vec<&dyn rusqlite::types::ToSql> =
                    params.iter().map(|p| p.as_ref()).collect();

                let rows = stmt.query_map(param_refs.as_slice(), |row| row.get::<_, String>(0))?;

                let mut records = Vec::new();
                for row in rows {
                    let record: RunRecord = serde_json::from_str(&row?).map_err(|e| {
                        rusqlite::Error::FromSqlConversionFailure(0, Type::Text, Box::new(e))
                    })?;
                    records.push(record);
                }
                Ok(records)
            })
            .await
            .map_err(storage_error)
    }
}
