//! Durable record store for users, payment intents and wallet links.
//!
//! Backed by SQLite through `sqlx`. Each mutation is a single statement, so
//! concurrent writers to the same row resolve as last-write-wins.

use std::str::FromStr;

use chrono::{DateTime, NaiveDate, SecondsFormat, Utc};
use serde::Serialize;
use sqlx::{
    Row, SqlitePool,
    sqlite::{
        SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteRow, SqliteSynchronous,
    },
};
use tracing::info;

use crate::pricing::{MediaKind, Quality};

const DATE_FORMAT: &str = "%Y-%m-%d";

const SCHEMA: [&str; 4] = [
    r#"
    CREATE TABLE IF NOT EXISTS users (
        id TEXT PRIMARY KEY,
        email TEXT,
        is_subscribed INTEGER NOT NULL DEFAULT 0,
        last_free_image_date TEXT
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS payment_intents (
        id TEXT PRIMARY KEY,
        user_id TEXT NOT NULL,
        type TEXT NOT NULL,
        quality TEXT NOT NULL,
        amount REAL NOT NULL,
        currency TEXT NOT NULL,
        status TEXT NOT NULL,
        created_at TEXT NOT NULL
    )
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS payment_intents_lookup
        ON payment_intents (user_id, type, quality, created_at)
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS wallets (
        user_id TEXT PRIMARY KEY,
        address TEXT NOT NULL
    )
    "#,
];

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("payment intent {0} already exists")]
    DuplicateIntent(String),

    #[error("corrupt record: {0}")]
    Corrupt(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct User {
    pub id: String,
    pub email: Option<String>,
    pub is_subscribed: bool,
    pub last_free_image_date: Option<NaiveDate>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum IntentStatus {
    Pending,
    Paid,
}

impl IntentStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Paid => "paid",
        }
    }

    fn parse(value: &str) -> Option<Self> {
        match value {
            "pending" => Some(Self::Pending),
            "paid" => Some(Self::Paid),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PaymentIntent {
    pub id: String,
    pub user_id: String,
    pub kind: MediaKind,
    pub quality: Quality,
    pub amount: f64,
    pub currency: String,
    pub status: IntentStatus,
    pub created_at: DateTime<Utc>,
}

/// Handle to the record store. Cheap to clone; clones share one pool.
#[derive(Clone)]
pub struct Store {
    pool: SqlitePool,
}

impl Store {
    /// Open (creating if needed) the database at `database_url` and make
    /// sure the schema exists.
    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let in_memory = database_url.contains(":memory:");
        let options = SqliteConnectOptions::from_str(database_url)?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Full);

        // An in-memory database lives and dies with its one connection.
        let pool_options = if in_memory {
            SqlitePoolOptions::new()
                .max_connections(1)
                .idle_timeout(None)
                .max_lifetime(None)
        } else {
            SqlitePoolOptions::new().max_connections(5)
        };

        let pool = pool_options.connect_with(options).await?;
        let store = Self { pool };
        store.migrate().await?;
        info!("Record store ready at {database_url}");
        Ok(store)
    }

    async fn migrate(&self) -> Result<(), StoreError> {
        for statement in SCHEMA {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        Ok(())
    }

    pub async fn get_user(&self, id: &str) -> Result<Option<User>, StoreError> {
        let row = sqlx::query(
            "SELECT id, email, is_subscribed, last_free_image_date FROM users WHERE id = ?",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(parse_user_row).transpose()
    }

    /// Insert the user unless it already exists.
    pub async fn ensure_user(&self, id: &str) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT OR IGNORE INTO users (id, email, is_subscribed, last_free_image_date) \
             VALUES (?, NULL, 0, NULL)",
        )
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn set_subscription(&self, id: &str) -> Result<(), StoreError> {
        sqlx::query("UPDATE users SET is_subscribed = 1 WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Take the daily free image for `date`. Check and write are one
    /// statement, so of several concurrent claims exactly one returns `true`.
    /// Subscribed users never claim.
    pub async fn claim_free_image(&self, id: &str, date: NaiveDate) -> Result<bool, StoreError> {
        let date = date.format(DATE_FORMAT).to_string();
        let result = sqlx::query(
            "UPDATE users SET last_free_image_date = ? \
             WHERE id = ? AND is_subscribed = 0 \
             AND (last_free_image_date IS NULL OR last_free_image_date <> ?)",
        )
        .bind(date.as_str())
        .bind(id)
        .bind(date.as_str())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    pub async fn create_payment_intent(&self, intent: &PaymentIntent) -> Result<(), StoreError> {
        let result = sqlx::query(
            "INSERT INTO payment_intents \
             (id, user_id, type, quality, amount, currency, status, created_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&intent.id)
        .bind(&intent.user_id)
        .bind(intent.kind.as_str())
        .bind(intent.quality.as_str())
        .bind(intent.amount)
        .bind(&intent.currency)
        .bind(intent.status.as_str())
        .bind(format_timestamp(intent.created_at))
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => Ok(()),
            Err(sqlx::Error::Database(error)) if error.is_unique_violation() => {
                Err(StoreError::DuplicateIntent(intent.id.clone()))
            }
            Err(error) => Err(error.into()),
        }
    }

    pub async fn get_payment_intent(&self, id: &str) -> Result<Option<PaymentIntent>, StoreError> {
        let row = sqlx::query(
            "SELECT id, user_id, type, quality, amount, currency, status, created_at \
             FROM payment_intents WHERE id = ?",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(parse_intent_row).transpose()
    }

    /// Flip a pending intent to paid. Returns `false` when nothing changed
    /// (unknown id, or already paid).
    pub async fn mark_intent_paid(&self, id: &str) -> Result<bool, StoreError> {
        let result =
            sqlx::query("UPDATE payment_intents SET status = 'paid' WHERE id = ? AND status = 'pending'")
                .bind(id)
                .execute(&self.pool)
                .await?;
        Ok(result.rows_affected() > 0)
    }

    /// True iff the newest intent for this exact tuple is paid.
    pub async fn has_paid_for(
        &self,
        user_id: &str,
        kind: MediaKind,
        quality: Quality,
    ) -> Result<bool, StoreError> {
        let status: Option<String> = sqlx::query_scalar(
            "SELECT status FROM payment_intents \
             WHERE user_id = ? AND type = ? AND quality = ? \
             ORDER BY created_at DESC, rowid DESC LIMIT 1",
        )
        .bind(user_id)
        .bind(kind.as_str())
        .bind(quality.as_str())
        .fetch_optional(&self.pool)
        .await?;

        Ok(status.as_deref() == Some(IntentStatus::Paid.as_str()))
    }

    pub async fn set_wallet_address(&self, user_id: &str, address: &str) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO wallets (user_id, address) VALUES (?, ?) \
             ON CONFLICT(user_id) DO UPDATE SET address = excluded.address",
        )
        .bind(user_id)
        .bind(address)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn get_wallet_address(&self, user_id: &str) -> Result<Option<String>, StoreError> {
        let address = sqlx::query_scalar("SELECT address FROM wallets WHERE user_id = ?")
            .bind(user_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(address)
    }
}

fn format_timestamp(value: DateTime<Utc>) -> String {
    // Fixed width so text ordering matches time ordering.
    value.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_user_row(row: SqliteRow) -> Result<User, StoreError> {
    let id: String = row.try_get("id")?;
    let last_free_image_date = row
        .try_get::<Option<String>, _>("last_free_image_date")?
        .map(|value| {
            NaiveDate::parse_from_str(&value, DATE_FORMAT)
                .map_err(|_| StoreError::Corrupt(format!("user {id} has free date {value:?}")))
        })
        .transpose()?;

    Ok(User {
        email: row.try_get("email")?,
        is_subscribed: row.try_get::<i64, _>("is_subscribed")? != 0,
        last_free_image_date,
        id,
    })
}

fn parse_intent_row(row: SqliteRow) -> Result<PaymentIntent, StoreError> {
    let id: String = row.try_get("id")?;
    let corrupt = |field: &str, value: &str| {
        StoreError::Corrupt(format!("payment intent {id} has {field} {value:?}"))
    };

    let quality: String = row.try_get("quality")?;
    let status: String = row.try_get("status")?;
    let created_at: String = row.try_get("created_at")?;

    Ok(PaymentIntent {
        user_id: row.try_get("user_id")?,
        kind: MediaKind::parse(&row.try_get::<String, _>("type")?),
        quality: Quality::parse(Some(&quality)).ok_or_else(|| corrupt("quality", &quality))?,
        amount: row.try_get("amount")?,
        currency: row.try_get("currency")?,
        status: IntentStatus::parse(&status).ok_or_else(|| corrupt("status", &status))?,
        created_at: DateTime::parse_from_rfc3339(&created_at)
            .map_err(|_| corrupt("created_at", &created_at))?
            .with_timezone(&Utc),
        id,
    })
}

#[cfg(test)]
mod tests {
    use chrono::Duration;

    use super::*;

    async fn memory_store() -> Store {
        Store::connect("sqlite::memory:")
            .await
            .expect("Failed to open in-memory store")
    }

    fn intent(id: &str, kind: MediaKind, quality: Quality, created_at: DateTime<Utc>) -> PaymentIntent {
        PaymentIntent {
            id: id.to_string(),
            user_id: "1001".to_string(),
            kind,
            quality,
            amount: 1.0,
            currency: "USDC".to_string(),
            status: IntentStatus::Pending,
            created_at,
        }
    }

    #[tokio::test]
    async fn ensure_user_is_idempotent() {
        let store = memory_store().await;
        assert!(store.get_user("1001").await.unwrap().is_none());

        store.ensure_user("1001").await.unwrap();
        store.set_subscription("1001").await.unwrap();
        store.ensure_user("1001").await.unwrap();

        let user = store.get_user("1001").await.unwrap().unwrap();
        assert!(user.is_subscribed, "ensure must not reset an existing user");
        assert_eq!(user.last_free_image_date, None);
    }

    #[tokio::test]
    async fn free_image_is_claimed_once_per_day() {
        let store = memory_store().await;
        store.ensure_user("1001").await.unwrap();
        let today = NaiveDate::from_ymd_opt(2026, 10, 17).unwrap();
        let tomorrow = NaiveDate::from_ymd_opt(2026, 10, 18).unwrap();

        assert!(store.claim_free_image("1001", today).await.unwrap());
        assert!(!store.claim_free_image("1001", today).await.unwrap());

        let user = store.get_user("1001").await.unwrap().unwrap();
        assert_eq!(user.last_free_image_date, Some(today));

        assert!(store.claim_free_image("1001", tomorrow).await.unwrap());
        assert!(!store.claim_free_image("missing", today).await.unwrap());
    }

    #[tokio::test]
    async fn concurrent_free_image_claims_grant_exactly_one() {
        let store = memory_store().await;
        store.ensure_user("1001").await.unwrap();
        let today = NaiveDate::from_ymd_opt(2026, 10, 17).unwrap();

        let (first, second) = tokio::join!(
            store.claim_free_image("1001", today),
            store.claim_free_image("1001", today)
        );
        assert_eq!(
            [first.unwrap(), second.unwrap()].iter().filter(|won| **won).count(),
            1
        );
    }

    #[tokio::test]
    async fn subscribers_never_claim_the_free_image() {
        let store = memory_store().await;
        store.ensure_user("1001").await.unwrap();
        store.set_subscription("1001").await.unwrap();
        let today = NaiveDate::from_ymd_opt(2026, 10, 17).unwrap();

        assert!(!store.claim_free_image("1001", today).await.unwrap());
        let user = store.get_user("1001").await.unwrap().unwrap();
        assert_eq!(user.last_free_image_date, None);
    }

    #[tokio::test]
    async fn duplicate_intent_id_is_rejected() {
        let store = memory_store().await;
        let first = intent("pi_same", MediaKind::Video, Quality::High, Utc::now());
        store.create_payment_intent(&first).await.unwrap();

        let error = store.create_payment_intent(&first).await.unwrap_err();
        assert!(matches!(error, StoreError::DuplicateIntent(id) if id == "pi_same"));
    }

    #[tokio::test]
    async fn marking_paid_is_one_way_and_keeps_terms() {
        let store = memory_store().await;
        let created = intent("pi_1", MediaKind::Image, Quality::Medium, Utc::now());
        store.create_payment_intent(&created).await.unwrap();

        assert!(store.mark_intent_paid("pi_1").await.unwrap());
        assert!(!store.mark_intent_paid("pi_1").await.unwrap());
        assert!(!store.mark_intent_paid("pi_missing").await.unwrap());

        let stored = store.get_payment_intent("pi_1").await.unwrap().unwrap();
        assert_eq!(stored.status, IntentStatus::Paid);
        assert_eq!(stored.amount, 1.0);
        assert_eq!(stored.kind, MediaKind::Image);
        assert_eq!(stored.quality, Quality::Medium);
        assert_eq!(stored.currency, "USDC");
    }

    #[tokio::test]
    async fn has_paid_for_follows_the_newest_intent() {
        let store = memory_store().await;
        let earlier = Utc::now() - Duration::minutes(5);

        assert!(!store.has_paid_for("1001", MediaKind::Video, Quality::High).await.unwrap());

        store
            .create_payment_intent(&intent("pi_old", MediaKind::Video, Quality::High, earlier))
            .await
            .unwrap();
        store.mark_intent_paid("pi_old").await.unwrap();
        assert!(store.has_paid_for("1001", MediaKind::Video, Quality::High).await.unwrap());

        // Other tuples are unaffected.
        assert!(!store.has_paid_for("1001", MediaKind::Video, Quality::Low).await.unwrap());
        assert!(!store.has_paid_for("1001", MediaKind::Image, Quality::High).await.unwrap());

        store
            .create_payment_intent(&intent("pi_new", MediaKind::Video, Quality::High, Utc::now()))
            .await
            .unwrap();
        assert!(!store.has_paid_for("1001", MediaKind::Video, Quality::High).await.unwrap());
    }

    #[tokio::test]
    async fn same_timestamp_intents_break_ties_by_insertion_order() {
        let store = memory_store().await;
        let at = Utc::now();
        store
            .create_payment_intent(&intent("pi_a", MediaKind::Image, Quality::Low, at))
            .await
            .unwrap();
        store.mark_intent_paid("pi_a").await.unwrap();
        store
            .create_payment_intent(&intent("pi_b", MediaKind::Image, Quality::Low, at))
            .await
            .unwrap();

        assert!(!store.has_paid_for("1001", MediaKind::Image, Quality::Low).await.unwrap());
    }

    #[tokio::test]
    async fn wallet_link_keeps_only_the_latest_address() {
        let store = memory_store().await;
        let first = "0x1111111111111111111111111111111111111111";
        let second = "0xAbCdEf0000000000000000000000000000000002";

        assert_eq!(store.get_wallet_address("1001").await.unwrap(), None);
        store.set_wallet_address("1001", first).await.unwrap();
        store.set_wallet_address("1001", second).await.unwrap();

        assert_eq!(
            store.get_wallet_address("1001").await.unwrap().as_deref(),
            Some(second)
        );
    }

    #[tokio::test]
    async fn records_survive_reopening_a_file_database() {
        let dir = tempfile::tempdir().unwrap();
        let url = format!("sqlite://{}", dir.path().join("app.db").display());

        {
            let store = Store::connect(&url).await.unwrap();
            store.ensure_user("7").await.unwrap();
            store.set_wallet_address("7", "0x2222222222222222222222222222222222222222").await.unwrap();
        }

        let reopened = Store::connect(&url).await.unwrap();
        assert!(reopened.get_user("7").await.unwrap().is_some());
        assert!(reopened.get_wallet_address("7").await.unwrap().is_some());
    }
}
