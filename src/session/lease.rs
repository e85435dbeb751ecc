use tracing::debug;

use crate::engine::{Connection, QueryOutput};
use crate::errors::{BackendError, DbError};

const BEGIN: &str = "BEGIN";
const COMMIT: &str = "COMMIT";
const ROLLBACK: &str = "ROLLBACK";

/// A probed connection leased to one unit of work.
///
/// The first `execute` opens a transaction; it stays open until `commit`,
/// `rollback` or `close`. A closed session rejects further work with
/// [`DbError::SessionClosed`].
#[derive(Debug)]
pub struct Session<K> {
    conn: Option<K>,
    generation: u64,
    in_transaction: bool,
    echo: bool,
}

impl<K: Connection> Session<K> {
    pub(crate) fn new(conn: K, generation: u64, echo: bool) -> Self {
        Self {
            conn: Some(conn),
            generation,
            in_transaction: false,
            echo,
        }
    }

    pub async fn execute(&mut self, statement: &str) -> Result<QueryOutput, DbError> {
        let conn = self.conn.as_mut().ok_or(DbError::SessionClosed)?;

        if !self.in_transaction {
            conn.execute(BEGIN).await?;
            self.in_transaction = true;
        }

        if self.echo {
            debug!(generation = self.generation, "{statement}");
        }

        Ok(conn.execute(statement).await?)
    }

    /// No-op when nothing has been executed since the last transaction ended.
    pub async fn commit(&mut self) -> Result<(), DbError> {
        if self.conn.is_none() {
            return Err(DbError::SessionClosed);
        }
        Ok(self.end_transaction(COMMIT).await?)
    }

    pub async fn rollback(&mut self) -> Result<(), DbError> {
        if self.conn.is_none() {
            return Err(DbError::SessionClosed);
        }
        Ok(self.end_transaction(ROLLBACK).await?)
    }

    /// Roll back any open transaction and hand the connection back.
    /// Closing twice is fine.
    pub async fn close(&mut self) -> Result<(), DbError> {
        let rolled_back = self.end_transaction(ROLLBACK).await;
        let closed = self.shutdown().await;
        rolled_back?;
        Ok(closed?)
    }

    pub fn is_closed(&self) -> bool {
        self.conn.is_none()
    }

    pub fn in_transaction(&self) -> bool {
        self.in_transaction
    }

    /// Generation of the engine this session's connection came from.
    pub fn engine_generation(&self) -> u64 {
        self.generation
    }

    /// The transaction counts as ended even when the statement fails; the
    /// server aborts it either way.
    pub(super) async fn end_transaction(&mut self, statement: &'static str) -> Result<(), BackendError> {
        if !std::mem::take(&mut self.in_transaction) {
            return Ok(());
        }
        match self.conn.as_mut() {
            Some(conn) => conn.execute(statement).await.map(drop),
            None => Ok(()),
        }
    }

    pub(super) async fn rollback_quietly(&mut self) -> Result<(), BackendError> {
        self.end_transaction(ROLLBACK).await
    }

    pub(super) async fn shutdown(&mut self) -> Result<(), BackendError> {
        match self.conn.take() {
            Some(conn) => conn.close().await,
            None => Ok(()),
        }
    }
}
