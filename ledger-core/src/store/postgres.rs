//! Postgres account store
//!
//! Uses the default READ COMMITTED isolation. Mutual exclusion on a balance
//! comes from `SELECT ... FOR UPDATE` on the account row, held until the
//! enclosing transaction commits or rolls back.

use super::{AccountStore, UnitOfWork};
use crate::{
    config::DatabaseConfig,
    error::{Error, Result, StoreContext},
    types::{Account, AccountId, Charge, NewAccount, NewCharge, TransactionId, TransactionKind},
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::{Postgres, Row, Transaction};
use std::time::Duration;
use tracing::info;

const INSERT_ACCOUNT_SQL: &str = r#"
    INSERT INTO accounts (id, email, currency, balance)
    VALUES ($1, $2, $3, 0)
"#;

const SELECT_ACCOUNT_SQL: &str = r#"
    SELECT email, currency, balance
    FROM accounts
    WHERE id = $1
"#;

const SELECT_CHARGES_SQL: &str = r#"
    SELECT transaction_id, account_id, type, amount, created_at
    FROM charges
    WHERE account_id = $1
    ORDER BY created_at, transaction_id
"#;

const INSERT_TRANSACTION_SQL: &str = r#"
    INSERT INTO transactions (type)
    VALUES ($1)
    RETURNING id
"#;

const INSERT_CHARGE_SQL: &str = r#"
    INSERT INTO charges (type, amount, transaction_id, account_id, created_at)
    VALUES ($1, $2, $3, $4, clock_timestamp())
"#;

const SELECT_FOR_UPDATE_SQL: &str = r#"
    SELECT balance
    FROM accounts
    WHERE id = $1
    FOR UPDATE
"#;

const UPDATE_BALANCE_SQL: &str = r#"
    UPDATE accounts
    SET balance = $1
    WHERE id = $2
"#;

/// SQLSTATE `foreign_key_violation`
const FOREIGN_KEY_VIOLATION: &str = "23503";

/// [`AccountStore`] backed by a bounded Postgres pool
#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    /// Connect a pool and verify the database answers
    pub async fn connect(config: &DatabaseConfig) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .acquire_timeout(Duration::from_secs(config.acquire_timeout_secs))
            .connect(&config.url)
            .await
            .context("connect pool")?;

        let store = Self { pool };
        store.health_check().await?;

        info!(
            max_connections = config.max_connections,
            "Postgres account store ready"
        );
        Ok(store)
    }

    /// Wrap an existing pool
    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Underlying pool
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Round-trip a trivial query
    pub async fn health_check(&self) -> Result<()> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .context("health check")?;
        Ok(())
    }
}

fn charge_from_row(row: &PgRow) -> Result<Charge> {
    let leg: String = row.try_get("type").context("decode charge type")?;
    let created_at: DateTime<Utc> = row.try_get("created_at").context("decode charge time")?;

    Ok(Charge {
        transaction_id: TransactionId(row.try_get("transaction_id").context("decode charge")?),
        account_id: AccountId::new(row.try_get("account_id").context("decode charge")?),
        leg: leg.parse().map_err(Error::Internal)?,
        amount: row.try_get("amount").context("decode charge amount")?,
        created_at,
    })
}

#[async_trait]
impl AccountStore for PgStore {
    async fn insert_account(&self, account: &NewAccount) -> Result<()> {
        sqlx::query(INSERT_ACCOUNT_SQL)
            .bind(account.id.as_i64())
            .bind(&account.email)
            .bind(&account.currency)
            .execute(&self.pool)
            .await
            .context("insert account")?;
        Ok(())
    }

    async fn fetch_account(&self, id: AccountId) -> Result<Option<Account>> {
        let row = sqlx::query(SELECT_ACCOUNT_SQL)
            .bind(id.as_i64())
            .fetch_optional(&self.pool)
            .await
            .context("select account")?;

        let Some(row) = row else {
            return Ok(None);
        };

        Ok(Some(Account {
            id,
            email: row.try_get("email").context("decode account")?,
            currency: row.try_get("currency").context("decode account")?,
            balance: row.try_get("balance").context("decode account")?,
        }))
    }

    async fn fetch_charges(&self, id: AccountId) -> Result<Vec<Charge>> {
        let rows = sqlx::query(SELECT_CHARGES_SQL)
            .bind(id.as_i64())
            .fetch_all(&self.pool)
            .await
            .context("select charges")?;

        rows.iter().map(charge_from_row).collect()
    }

    async fn begin(&self) -> Result<Box<dyn UnitOfWork>> {
        let tx = self.pool.begin().await.context("begin transaction")?;
        Ok(Box::new(PgUnitOfWork { tx }))
    }
}

/// Unit of work wrapping one Postgres transaction.
///
/// `sqlx` rolls an un-finished transaction back when it is dropped.
pub struct PgUnitOfWork {
    tx: Transaction<'static, Postgres>,
}

#[async_trait]
impl UnitOfWork for PgUnitOfWork {
    async fn insert_transaction(&mut self, kind: TransactionKind) -> Result<TransactionId> {
        let id: i64 = sqlx::query_scalar(INSERT_TRANSACTION_SQL)
            .bind(kind.as_str())
            .fetch_one(&mut *self.tx)
            .await
            .context("insert transaction")?;
        Ok(TransactionId(id))
    }

    async fn insert_charge(&mut self, charge: &NewCharge) -> Result<()> {
        let result = sqlx::query(INSERT_CHARGE_SQL)
            .bind(charge.leg.as_str())
            .bind(charge.amount)
            .bind(charge.transaction_id.0)
            .bind(charge.account_id.as_i64())
            .execute(&mut *self.tx)
            .await;

        // The only foreign key a valid transaction id can violate is the account's
        if let Err(sqlx::Error::Database(db)) = &result {
            if db.code().as_deref() == Some(FOREIGN_KEY_VIOLATION) {
                return Err(Error::NotFound(charge.account_id));
            }
        }
        result.context("insert charge")?;
        Ok(())
    }

    async fn lock_balance(&mut self, id: AccountId) -> Result<Decimal> {
        let balance: Option<Decimal> = sqlx::query_scalar(SELECT_FOR_UPDATE_SQL)
            .bind(id.as_i64())
            .fetch_optional(&mut *self.tx)
            .await
            .context("select account for update")?;
        balance.ok_or(Error::NotFound(id))
    }

    async fn set_balance(&mut self, id: AccountId, balance: Decimal) -> Result<()> {
        let result = sqlx::query(UPDATE_BALANCE_SQL)
            .bind(balance)
            .bind(id.as_i64())
            .execute(&mut *self.tx)
            .await
            .context("update balance")?;

        if result.rows_affected() != 1 {
            return Err(Error::NotFound(id));
        }
        Ok(())
    }

    async fn commit(self: Box<Self>) -> Result<()> {
        self.tx.commit().await.context("commit transaction")
    }

    async fn rollback(self: Box<Self>) -> Result<()> {
        self.tx.rollback().await.context("rollback transaction")
    }
}
