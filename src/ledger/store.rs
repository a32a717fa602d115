use std::path::Path;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use rusqlite::{Connection, params};
use tokio::sync::Mutex;

use crate::error::EngineError;
use crate::model::{EventKind, LedgerEvent, Payment, PaymentId};

pub type Db = Arc<Mutex<Connection>>;

/// Append-only event store with a projection snapshot table.
///
/// The primary key on `(payment_id, seq)` is the conditional append: two
/// writers racing the same sequence slot cannot both commit, so a second
/// engine instance degrades to an error instead of a lost update.
#[derive(Clone)]
pub struct EventStore {
    db: Db,
}

impl EventStore {
    pub fn open(path: &Path) -> Result<Self, EngineError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| EngineError::Storage(format!("creating ledger dir: {e}")))?;
            }
        }
        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode = WAL; PRAGMA synchronous = FULL;")?;
        migrate(&conn)?;
        Ok(EventStore { db: Arc::new(Mutex::new(conn)) })
    }

    /// In-memory store for tests and the demo command.
    pub fn open_in_memory() -> Result<Self, EngineError> {
        let conn = Connection::open_in_memory()?;
        migrate(&conn)?;
        Ok(EventStore { db: Arc::new(Mutex::new(conn)) })
    }

    /// Durably append one event and refresh the projection snapshot in the
    /// same transaction.
    pub async fn append(&self, event: &LedgerEvent, projected: &Payment) -> Result<(), EngineError> {
        let mut conn = self.db.lock().await;
        let tx = conn.transaction()?;
        insert_event(&tx, event)?;
        upsert_payment(&tx, projected)?;
        tx.commit()?;
        Ok(())
    }

    /// Admission: append the `Admitted` event, snapshot, and the client
    /// token in one transaction so a crash cannot split them.
    pub async fn append_with_token(
        &self,
        event: &LedgerEvent,
        projected: &Payment,
        token: &str,
        command_kind: &str,
    ) -> Result<(), EngineError> {
        let mut conn = self.db.lock().await;
        let tx = conn.transaction()?;
        insert_event(&tx, event)?;
        upsert_payment(&tx, projected)?;
        tx.execute(
            "INSERT INTO command_tokens (token, kind, payment_id) VALUES (?1, ?2, ?3)",
            params![token, command_kind, event.payment_id],
        )
        .map_err(|e| map_conflict(e, "client token already recorded"))?;
        tx.commit()?;
        Ok(())
    }

    /// Payment id previously accepted under `(token, command_kind)`, if any.
    pub async fn lookup_token(
        &self,
        token: &str,
        command_kind: &str,
    ) -> Result<Option<PaymentId>, EngineError> {
        let conn = self.db.lock().await;
        let found = conn
            .query_row(
                "SELECT payment_id FROM command_tokens WHERE token = ?1 AND kind = ?2",
                params![token, command_kind],
                |row| row.get::<_, String>(0),
            )
            .map(Some)
            .or_else(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => Ok(None),
                other => Err(other),
            })?;
        Ok(found)
    }

    /// Any payment id recorded under `token` regardless of command kind.
    pub async fn lookup_token_any_kind(
        &self,
        token: &str,
    ) -> Result<Option<(String, PaymentId)>, EngineError> {
        let conn = self.db.lock().await;
        let found = conn
            .query_row(
                "SELECT kind, payment_id FROM command_tokens WHERE token = ?1",
                params![token],
                |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)),
            )
            .map(Some)
            .or_else(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => Ok(None),
                other => Err(other),
            })?;
        Ok(found)
    }

    /// Stored projection snapshots, one per payment. Cold start folds only
    /// the event suffix newer than each snapshot.
    pub async fn load_payments(&self) -> Result<Vec<Payment>, EngineError> {
        let conn = self.db.lock().await;
        let mut stmt = conn.prepare("SELECT snapshot FROM payments")?;
        let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
        let mut payments = Vec::new();
        for row in rows {
            let payment: Payment = serde_json::from_str(&row?)?;
            payments.push(payment);
        }
        Ok(payments)
    }

    pub async fn load_events(&self, payment_id: &str) -> Result<Vec<LedgerEvent>, EngineError> {
        let conn = self.db.lock().await;
        let mut stmt = conn.prepare(
            "SELECT seq, at, payload FROM events WHERE payment_id = ?1 ORDER BY seq ASC",
        )?;
        let rows = stmt.query_map(params![payment_id], |row| {
            Ok((row.get::<_, i64>(0)?, row.get::<_, i64>(1)?, row.get::<_, String>(2)?))
        })?;
        let mut events = Vec::new();
        for row in rows {
            let (seq, at_ms, payload) = row?;
            events.push(decode_event(payment_id, seq, at_ms, &payload)?);
        }
        Ok(events)
    }

    /// Every event in the store, ordered per payment. Used for the startup fold.
    pub async fn load_all_events(&self) -> Result<Vec<LedgerEvent>, EngineError> {
        let conn = self.db.lock().await;
        let mut stmt = conn.prepare(
            "SELECT payment_id, seq, at, payload FROM events ORDER BY payment_id, seq ASC",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, i64>(1)?,
                row.get::<_, i64>(2)?,
                row.get::<_, String>(3)?,
            ))
        })?;
        let mut events = Vec::new();
        for row in rows {
            let (payment_id, seq, at_ms, payload) = row?;
            events.push(decode_event(&payment_id, seq, at_ms, &payload)?);
        }
        Ok(events)
    }
}

fn migrate(conn: &Connection) -> Result<(), EngineError> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS events (
            payment_id  TEXT    NOT NULL,
            seq         INTEGER NOT NULL,
            at          INTEGER NOT NULL,
            kind        TEXT    NOT NULL,
            payload     TEXT    NOT NULL,
            PRIMARY KEY (payment_id, seq)
        );

        CREATE TABLE IF NOT EXISTS payments (
            id          TEXT PRIMARY KEY,
            state       TEXT    NOT NULL,
            created_at  INTEGER NOT NULL,
            last_seq    INTEGER NOT NULL,
            snapshot    TEXT    NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_payments_state ON payments(state, created_at);

        CREATE TABLE IF NOT EXISTS command_tokens (
            token       TEXT NOT NULL,
            kind        TEXT NOT NULL,
            payment_id  TEXT NOT NULL,
            PRIMARY KEY (token)
        );
        ",
    )?;
    Ok(())
}

fn insert_event(tx: &rusqlite::Transaction<'_>, event: &LedgerEvent) -> Result<(), EngineError> {
    let payload = serde_json::to_string(&event.kind)?;
    tx.execute(
        "INSERT INTO events (payment_id, seq, at, kind, payload) VALUES (?1, ?2, ?3, ?4, ?5)",
        params![
            event.payment_id,
            event.seq as i64,
            event.at.timestamp_millis(),
            event.kind.name(),
            payload
        ],
    )
    .map_err(|e| map_conflict(e, "conditional append conflict: sequence slot already written"))?;
    Ok(())
}

fn upsert_payment(tx: &rusqlite::Transaction<'_>, payment: &Payment) -> Result<(), EngineError> {
    let snapshot = serde_json::to_string(payment)?;
    tx.execute(
        "INSERT INTO payments (id, state, created_at, last_seq, snapshot)
         VALUES (?1, ?2, ?3, ?4, ?5)
         ON CONFLICT(id) DO UPDATE SET
             state = excluded.state,
             last_seq = excluded.last_seq,
             snapshot = excluded.snapshot",
        params![
            payment.id,
            format!("{:?}", payment.state),
            payment.created_at.timestamp_millis(),
            payment.last_seq as i64,
            snapshot
        ],
    )?;
    Ok(())
}

fn decode_event(
    payment_id: &str,
    seq: i64,
    at_ms: i64,
    payload: &str,
) -> Result<LedgerEvent, EngineError> {
    let kind: EventKind = serde_json::from_str(payload)?;
    let at: DateTime<Utc> = DateTime::from_timestamp_millis(at_ms)
        .ok_or_else(|| EngineError::Storage(format!("bad timestamp {at_ms} for {payment_id}")))?;
    Ok(LedgerEvent { seq: seq as u64, payment_id: payment_id.to_string(), at, kind })
}

fn map_conflict(err: rusqlite::Error, message: &str) -> EngineError {
    match &err {
        rusqlite::Error::SqliteFailure(e, _)
            if e.code == rusqlite::ErrorCode::ConstraintViolation =>
        {
            EngineError::Storage(format!("{message}: {err}"))
        }
        _ => EngineError::from(err),
    }
}

#[cfg(test)]
mod tests {
    use chrono::{TimeZone, Utc};

    use super::*;
    use crate::ledger::projection;
    use crate::model::Amount;

    fn admitted(payment_id: &str) -> LedgerEvent {
        LedgerEvent {
            seq: 0,
            payment_id: payment_id.into(),
            at: Utc.timestamp_opt(1_700_000_000, 0).unwrap(),
            kind: EventKind::Admitted {
                user: "alice".into(),
                merchant: "acme".into(),
                principal: Amount::from_micros(5_000_000),
                currency: "USDC".into(),
                source_chain: "base".into(),
                destination_chain: "base".into(),
                strategy_id: "tbill".into(),
            },
        }
    }

    #[tokio::test]
    async fn append_and_reload_round_trips() {
        let store = EventStore::open_in_memory().unwrap();
        let event = admitted("pay-1");
        let payment = projection::apply(None, &event).unwrap();
        store.append(&event, &payment).await.unwrap();

        let deposit = LedgerEvent {
            seq: 1,
            payment_id: "pay-1".into(),
            at: Utc.timestamp_opt(1_700_000_010, 0).unwrap(),
            kind: EventKind::EscrowDeposited { escrow_ref: "esc-1".into() },
        };
        let payment = projection::apply(Some(payment), &deposit).unwrap();
        store.append(&deposit, &payment).await.unwrap();

        let events = store.load_events("pay-1").await.unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(projection::fold(&events).unwrap(), payment);
    }

    #[tokio::test]
    async fn conditional_append_rejects_reused_sequence() {
        let store = EventStore::open_in_memory().unwrap();
        let event = admitted("pay-1");
        let payment = projection::apply(None, &event).unwrap();
        store.append(&event, &payment).await.unwrap();

        let conflict = store.append(&event, &payment).await.unwrap_err();
        assert!(matches!(conflict, EngineError::Storage(_)));
        assert_eq!(store.load_events("pay-1").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn admission_records_token_atomically() {
        let store = EventStore::open_in_memory().unwrap();
        let event = admitted("pay-1");
        let payment = projection::apply(None, &event).unwrap();
        store.append_with_token(&event, &payment, "tok-1", "create").await.unwrap();

        assert_eq!(
            store.lookup_token("tok-1", "create").await.unwrap().as_deref(),
            Some("pay-1")
        );
        assert_eq!(store.lookup_token("tok-1", "release").await.unwrap(), None);

        // Reusing the token for another admission fails and writes nothing.
        let second = admitted("pay-2");
        let projected = projection::apply(None, &second).unwrap();
        let err = store.append_with_token(&second, &projected, "tok-1", "create").await;
        assert!(err.is_err());
        assert!(store.load_events("pay-2").await.unwrap().is_empty());
    }
}
