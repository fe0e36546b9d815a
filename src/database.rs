use anyhow::Result;
use async_trait::async_trait;
use ethers::types::Address;
use sqlx::{postgres::PgPoolOptions, Connection, Pool, Postgres, Row};
use std::str::FromStr;
use std::time::Duration;
use tokio_retry::strategy::ExponentialBackoff;
use tokio_retry::Retry;

use crate::error::ForgeError;
use crate::storage::ContractStore;
use crate::types::{BlockCursor, ChainId, Contract};

/// PostgreSQL connection pool type alias.
pub type DbPool = Pool<Postgres>;

/// Database schema name
pub const SCHEMA: &str = "graph_forge";

const MAX_CONNECT_ATTEMPTS: usize = 10;

/// Connects with exponential backoff (200ms, 400ms, ... capped at ~12.8s) and makes sure the
/// schema exists before handing the pool out.
pub async fn connect(database_url: &str, max_connections: u32) -> Result<DbPool> {
    // Force UTF-8 client encoding FIRST to avoid sqlx choking on non-ASCII server messages
    std::env::set_var("PGCLIENTENCODING", "UTF8");

    let strategy = ExponentialBackoff::from_millis(2)
        .factor(100)
        .max_delay(Duration::from_millis(12_800))
        .take(MAX_CONNECT_ATTEMPTS - 1);

    let mut attempt = 0usize;
    Retry::spawn(strategy, || {
        attempt += 1;
        let current = attempt;
        async move {
            let outcome = async {
                let pool = PgPoolOptions::new()
                    .max_connections(max_connections)
                    .acquire_timeout(Duration::from_secs(5))
                    .connect(database_url)
                    .await?;
                initialize_database(&pool).await?;
                Ok::<_, anyhow::Error>(pool)
            }
            .await;
            match &outcome {
                Ok(_) => log::info!(
                    "✅ Connected to database (attempt {}/{}).",
                    current,
                    MAX_CONNECT_ATTEMPTS
                ),
                Err(e) => log::warn!(
                    "DB connect/init attempt {}/{} failed: {}",
                    current,
                    MAX_CONNECT_ATTEMPTS,
                    e
                ),
            }
            outcome
        }
    })
    .await
}

pub async fn initialize_database(pool: &DbPool) -> Result<()> {
    const MIGRATION_LOCK_ID: i64 = 0x4752_4146_4F52_4745; // "GRAFORGE" in hex

    let mut conn = pool.acquire().await?;
    let mut tx = conn.begin().await?;

    log::info!("Acquiring database migration lock...");
    sqlx::query("SELECT pg_advisory_xact_lock($1)")
        .bind(MIGRATION_LOCK_ID)
        .execute(tx.as_mut())
        .await?;

    sqlx::query(&format!("CREATE SCHEMA IF NOT EXISTS {}", SCHEMA))
        .execute(tx.as_mut())
        .await?;
    create_tables(&mut tx).await?;

    tx.commit().await?;
    log::info!("Database initialization complete, transaction committed.");
    Ok(())
}

async fn create_tables(tx: &mut sqlx::Transaction<'_, Postgres>) -> Result<()> {
    sqlx::query(&format!(
        "CREATE TABLE IF NOT EXISTS {}.forge_block (
            id BIGSERIAL PRIMARY KEY,
            chain_id BIGINT NOT NULL,
            block_number BIGINT NOT NULL,
            is_handled BOOLEAN NOT NULL DEFAULT FALSE,
            created_at TIMESTAMPTZ DEFAULT NOW(),
            UNIQUE(chain_id, block_number)
        )",
        SCHEMA
    ))
    .execute(tx.as_mut())
    .await?;

    // Cursor lookups only ever scan the unhandled tail
    sqlx::query(&format!(
        "CREATE INDEX IF NOT EXISTS idx_forge_block_unhandled
            ON {}.forge_block(chain_id, block_number) WHERE NOT is_handled",
        SCHEMA
    ))
    .execute(tx.as_mut())
    .await?;

    sqlx::query(&format!(
        "CREATE TABLE IF NOT EXISTS {}.deployment (
            id BIGSERIAL PRIMARY KEY,
            chain_id BIGINT NOT NULL,
            contract_address VARCHAR(42) NOT NULL,
            creator VARCHAR(42) NOT NULL,
            tx_hash VARCHAR(66) NOT NULL,
            block_number BIGINT NOT NULL,
            deployed_at TIMESTAMPTZ,
            factory VARCHAR(42),
            creation_bytecode BYTEA,
            UNIQUE(chain_id, contract_address)
        )",
        SCHEMA
    ))
    .execute(tx.as_mut())
    .await?;

    sqlx::query(&format!(
        "CREATE TABLE IF NOT EXISTS {schema}.contract (
            id BIGSERIAL PRIMARY KEY,
            network VARCHAR(20) NOT NULL,
            chain_id BIGINT NOT NULL,
            address VARCHAR(42) NOT NULL,
            token_type VARCHAR(10) NOT NULL,
            deployment_id BIGINT REFERENCES {schema}.deployment(id),
            discovered_at_block BIGINT,
            created_at TIMESTAMPTZ DEFAULT NOW(),
            UNIQUE(chain_id, address)
        )",
        schema = SCHEMA
    ))
    .execute(tx.as_mut())
    .await?;

    sqlx::query(&format!(
        "CREATE TABLE IF NOT EXISTS {schema}.forge_deployment (
            id BIGSERIAL PRIMARY KEY,
            forge_block_id BIGINT REFERENCES {schema}.forge_block(id),
            contract_id BIGINT NOT NULL UNIQUE REFERENCES {schema}.contract(id),
            created_at TIMESTAMPTZ DEFAULT NOW()
        )",
        schema = SCHEMA
    ))
    .execute(tx.as_mut())
    .await?;

    Ok(())
}

fn parse_address(raw: &str) -> Result<Address, ForgeError> {
    Address::from_str(raw).map_err(|e| ForgeError::Persistence(format!("bad address '{}': {}", raw, e)))
}

/// [`ContractStore`] backed by PostgreSQL.
#[derive(Clone)]
pub struct PgStore {
    pool: DbPool,
}

impl PgStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &DbPool {
        &self.pool
    }
}

#[async_trait]
impl ContractStore for PgStore {
    async fn save_contract(&self, contract: &Contract) -> crate::error::Result<i64> {
        let mut tx = self.pool.begin().await?;
        let chain_id = contract.chain_id() as i64;

        let deployment_id: Option<i64> = match &contract.deployment {
            Some(d) => {
                let row = sqlx::query(&format!(
                    "INSERT INTO {schema}.deployment
                        (chain_id, contract_address, creator, tx_hash, block_number, deployed_at, factory, creation_bytecode)
                     VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
                     ON CONFLICT (chain_id, contract_address) DO UPDATE SET
                        creator = EXCLUDED.creator,
                        tx_hash = EXCLUDED.tx_hash,
                        block_number = EXCLUDED.block_number,
                        deployed_at = COALESCE(EXCLUDED.deployed_at, {schema}.deployment.deployed_at),
                        factory = COALESCE(EXCLUDED.factory, {schema}.deployment.factory),
                        creation_bytecode = EXCLUDED.creation_bytecode
                     RETURNING id",
                    schema = SCHEMA
                ))
                .bind(chain_id)
                .bind(format!("{:?}", contract.address))
                .bind(format!("{:?}", d.creator))
                .bind(format!("{:?}", d.tx_hash))
                .bind(d.block_number as i64)
                .bind(d.timestamp)
                .bind(d.factory.map(|f| format!("{:?}", f)))
                .bind(d.creation_bytecode.to_vec())
                .fetch_one(&mut *tx)
                .await?;
                Some(row.try_get::<i64, _>("id")?)
            }
            None => None,
        };

        let row = sqlx::query(&format!(
            "INSERT INTO {schema}.contract (network, chain_id, address, token_type, deployment_id, discovered_at_block)
             VALUES ($1, $2, $3, $4, $5, $6)
             ON CONFLICT (chain_id, address) DO UPDATE SET
                token_type = EXCLUDED.token_type,
                deployment_id = COALESCE(EXCLUDED.deployment_id, {schema}.contract.deployment_id)
             RETURNING id",
            schema = SCHEMA
        ))
        .bind(contract.network.name())
        .bind(chain_id)
        .bind(format!("{:?}", contract.address))
        .bind(contract.token_type.as_str())
        .bind(deployment_id)
        .bind(contract.discovered_at_block as i64)
        .fetch_one(&mut *tx)
        .await?;
        let id = row.try_get::<i64, _>("id")?;

        tx.commit().await?;
        Ok(id)
    }

    async fn save_block(&self, number: u64, chain_id: ChainId) -> crate::error::Result<i64> {
        // The no-op update makes RETURNING yield the existing row on conflict
        let row = sqlx::query(&format!(
            "INSERT INTO {}.forge_block (chain_id, block_number)
             VALUES ($1, $2)
             ON CONFLICT (chain_id, block_number) DO UPDATE SET chain_id = EXCLUDED.chain_id
             RETURNING id",
            SCHEMA
        ))
        .bind(chain_id as i64)
        .bind(number as i64)
        .fetch_one(&self.pool)
        .await?;
        Ok(row.try_get::<i64, _>("id")?)
    }

    async fn save_contract_forge(&self, block_id: Option<i64>, contract_id: i64) -> crate::error::Result<()> {
        sqlx::query(&format!(
            "INSERT INTO {}.forge_deployment (forge_block_id, contract_id)
             VALUES ($1, $2)
             ON CONFLICT (contract_id) DO NOTHING",
            SCHEMA
        ))
        .bind(block_id)
        .bind(contract_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn block_handled(&self, number: u64, chain_id: ChainId) -> crate::error::Result<()> {
        let result = sqlx::query(&format!(
            "UPDATE {}.forge_block SET is_handled = TRUE WHERE chain_id = $1 AND block_number = $2",
            SCHEMA
        ))
        .bind(chain_id as i64)
        .bind(number as i64)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(ForgeError::Persistence(format!(
                "block {} on chain {} was never saved",
                number, chain_id
            )));
        }
        Ok(())
    }

    async fn last_block(&self, chain_id: ChainId) -> crate::error::Result<Option<BlockCursor>> {
        let unhandled = sqlx::query(&format!(
            "SELECT block_number, is_handled FROM {}.forge_block
             WHERE chain_id = $1 AND NOT is_handled
             ORDER BY block_number ASC LIMIT 1",
            SCHEMA
        ))
        .bind(chain_id as i64)
        .fetch_optional(&self.pool)
        .await?;

        let row = match unhandled {
            Some(row) => Some(row),
            None => {
                sqlx::query(&format!(
                    "SELECT block_number, is_handled FROM {}.forge_block
                     WHERE chain_id = $1
                     ORDER BY block_number DESC LIMIT 1",
                    SCHEMA
                ))
                .bind(chain_id as i64)
                .fetch_optional(&self.pool)
                .await?
            }
        };

        row.map(|r| {
            Ok::<_, ForgeError>(BlockCursor {
                chain_id,
                block_number: r.try_get::<i64, _>("block_number")? as u64,
                is_handled: r.try_get::<bool, _>("is_handled")?,
            })
        })
        .transpose()
    }

    async fn initialized(&self, contract: &Contract) -> crate::error::Result<bool> {
        let row = sqlx::query(&format!(
            "SELECT EXISTS(
                SELECT 1 FROM {schema}.forge_deployment fd
                JOIN {schema}.contract c ON c.id = fd.contract_id
                WHERE c.chain_id = $1 AND c.address = $2
             ) AS initialized",
            schema = SCHEMA
        ))
        .bind(contract.chain_id() as i64)
        .bind(format!("{:?}", contract.address))
        .fetch_one(&self.pool)
        .await?;
        Ok(row.try_get::<bool, _>("initialized")?)
    }

    async fn persisted_contracts(&self, chain_id: ChainId) -> crate::error::Result<Vec<Address>> {
        let rows = sqlx::query(&format!(
            "SELECT c.address FROM {schema}.contract c
             JOIN {schema}.forge_deployment fd ON fd.contract_id = c.id
             WHERE c.chain_id = $1",
            schema = SCHEMA
        ))
        .bind(chain_id as i64)
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|r| {
                let raw: String = r.try_get("address")?;
                parse_address(&raw)
            })
            .collect()
    }
}
