//! Plugin-scoped stores.
//!
//! Each plugin writes to tables named `{prefix}_{name}`. Its DDL is
//! templated with the `{prefix}` placeholder, applied at most once per
//! migration index and tracked in `plugin_migrations` together with a
//! content checksum. DDL touching a shared chain table is refused.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use sqlx::PgPool;
use tracing::{debug, info, warn};

use chainsight_core::error::{StorageError, StorageResult};
use chainsight_core::ports::{PluginStore, PluginStoreProvider};

use super::database::Database;
use super::helpers::{db_error, is_identifier, tx_error};

/// Shared tables no plugin may alter, drop, truncate or rename.
const PROTECTED_TABLES: [&str; 6] = [
    "runtime_versions",
    "chain_metadata",
    "missing_blocks",
    "daemon_heartbeats",
    "plugin_migrations",
    "_sqlx_migrations",
];

/// Sharded tables, protected together with every `{base}_{shard}`.
const PROTECTED_SHARDED: [&str; 4] = ["blocks", "extrinsics", "events", "logs"];

/// Whether `name` designates a shared chain table.
pub fn is_protected_table(name: &str) -> bool {
    let name = name.trim_matches('"').to_ascii_lowercase();
    let name = name.strip_prefix("public.").unwrap_or(&name);
    let name = name.trim_matches('"');

    if PROTECTED_TABLES.contains(&name) {
        return true;
    }
    PROTECTED_SHARDED.iter().any(|base| {
        name == *base
            || name
                .strip_prefix(base)
                .and_then(|rest| rest.strip_prefix('_'))
                .is_some_and(|shard| !shard.is_empty() && shard.bytes().all(|b| b.is_ascii_digit()))
    })
}

/// Substitute the `{prefix}` placeholder.
pub fn render_ddl(template: &str, prefix: &str) -> String {
    template.replace("{prefix}", prefix)
}

#[derive(Debug, PartialEq)]
enum Token {
    Word(String),
    Comma,
    End,
}

fn tokenize(sql: &str) -> Vec<Token> {
    let mut tokens = Vec::new();
    let mut word = String::new();
    let flush = |word: &mut String, tokens: &mut Vec<Token>| {
        if !word.is_empty() {
            tokens.push(Token::Word(std::mem::take(word).to_ascii_lowercase()));
        }
    };

    for c in sql.chars() {
        match c {
            c if c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '"') => word.push(c),
            ',' => {
                flush(&mut word, &mut tokens);
                tokens.push(Token::Comma);
            }
            ';' => {
                flush(&mut word, &mut tokens);
                tokens.push(Token::End);
            }
            _ => flush(&mut word, &mut tokens),
        }
    }
    flush(&mut word, &mut tokens);
    tokens
}

fn is_word(token: Option<&Token>, expected: &str) -> bool {
    matches!(token, Some(Token::Word(w)) if w == expected)
}

const FILLER: [&str; 4] = ["table", "if", "exists", "only"];

/// Collect the comma-separated table list starting at `tokens[*i]`.
fn table_list(tokens: &[Token], i: &mut usize, targets: &mut Vec<String>) {
    while *i < tokens.len() {
        match &tokens[*i] {
            Token::Word(w) if FILLER.contains(&w.as_str()) => *i += 1,
            Token::Comma => *i += 1,
            Token::Word(w) => {
                targets.push(w.clone());
                *i += 1;
                if !matches!(tokens.get(*i), Some(Token::Comma)) {
                    return;
                }
            }
            Token::End => return,
        }
    }
}

/// Table names targeted by `ALTER TABLE`, `DROP TABLE`, `TRUNCATE` and
/// `RENAME TO` clauses.
fn ddl_targets(sql: &str) -> Vec<String> {
    let tokens = tokenize(sql);
    let mut targets = Vec::new();
    let mut i = 0;

    while i < tokens.len() {
        let Token::Word(word) = &tokens[i] else {
            i += 1;
            continue;
        };

        match word.as_str() {
            "alter" | "drop" if is_word(tokens.get(i + 1), "table") => {
                i += 1;
                table_list(&tokens, &mut i, &mut targets);
            }
            "truncate" => {
                i += 1;
                table_list(&tokens, &mut i, &mut targets);
            }
            "rename" if is_word(tokens.get(i + 1), "to") => {
                if let Some(Token::Word(w)) = tokens.get(i + 2) {
                    targets.push(w.clone());
                }
                i += 3;
            }
            _ => i += 1,
        }
    }
    targets
}

/// Refuse DDL that would modify a shared chain table.
pub fn check_ddl(sql: &str) -> StorageResult<()> {
    match ddl_targets(sql).into_iter().find(|t| is_protected_table(t)) {
        Some(table) => Err(StorageError::ProtectedTable(table)),
        None => Ok(()),
    }
}

fn checksum(content: &str) -> String {
    let mut hasher = DefaultHasher::new();
    content.hash(&mut hasher);
    format!("{:016x}", hasher.finish())
}

/// Build an insert of a JSON object into `table`, letting Postgres cast
/// each field to its column type.
fn insert_sql(table: &str, row: &Value) -> StorageResult<String> {
    let object = row.as_object().ok_or_else(|| {
        StorageError::SerializationError(format!("{table}: row must be a JSON object"))
    })?;
    if object.is_empty() {
        return Err(StorageError::SerializationError(format!(
            "{table}: row has no columns"
        )));
    }
    if let Some(bad) = object.keys().find(|k| !is_identifier(k)) {
        return Err(StorageError::SerializationError(format!(
            "{table}: invalid column name {bad:?}"
        )));
    }

    let columns = object.keys().map(String::as_str).collect::<Vec<_>>().join(", ");
    Ok(format!(
        "INSERT INTO {table} ({columns}) SELECT {columns} FROM jsonb_populate_record(NULL::{table}, $1)"
    ))
}

// =============================================================================
// Store
// =============================================================================

/// Store handed to one plugin.
pub struct PgPluginStore {
    pool: PgPool,
    prefix: String,
}

impl PgPluginStore {
    /// Ensure `table` belongs to this plugin.
    fn owned(&self, table: &str) -> StorageResult<()> {
        let owned = table
            .strip_prefix(&self.prefix)
            .and_then(|rest| rest.strip_prefix('_'))
            .is_some_and(|rest| !rest.is_empty());
        if !owned || !is_identifier(table) || is_protected_table(table) {
            return Err(StorageError::ProtectedTable(table.to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl PluginStore for PgPluginStore {
    fn prefix(&self) -> &str {
        &self.prefix
    }

    async fn apply_migration(&self, index: usize, ddl: &str) -> StorageResult<()> {
        let rendered = render_ddl(ddl, &self.prefix);
        check_ddl(&rendered)?;
        let sum = checksum(&rendered);

        let existing: Option<(String,)> = sqlx::query_as(
            "SELECT checksum FROM plugin_migrations WHERE plugin = $1 AND migration_index = $2",
        )
        .bind(&self.prefix)
        .bind(index as i32)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_error)?;

        if let Some((applied,)) = existing {
            if applied != sum {
                warn!(
                    plugin = %self.prefix,
                    migration = index,
                    expected = %sum,
                    found = %applied,
                    "⚠️  Plugin migration changed after being applied"
                );
            }
            debug!(plugin = %self.prefix, migration = index, "Migration already applied, skipping");
            return Ok(());
        }

        info!(plugin = %self.prefix, migration = index, "🗄️  Applying plugin migration");

        let mut tx = self.pool.begin().await.map_err(tx_error)?;
        sqlx::Executor::execute(&mut *tx, sqlx::raw_sql(&rendered))
            .await
            .map_err(|e| StorageError::MigrationError(format!("{}#{index}: {e}", self.prefix)))?;
        sqlx::query(
            "INSERT INTO plugin_migrations (plugin, migration_index, checksum) VALUES ($1, $2, $3)",
        )
        .bind(&self.prefix)
        .bind(index as i32)
        .bind(&sum)
        .execute(&mut *tx)
        .await
        .map_err(db_error)?;
        tx.commit().await.map_err(tx_error)?;

        Ok(())
    }

    async fn insert(&self, table: &str, row: Value) -> StorageResult<()> {
        self.owned(table)?;
        let sql = insert_sql(table, &row)?;
        sqlx::query(&sql)
            .bind(&row)
            .execute(&self.pool)
            .await
            .map_err(db_error)?;
        Ok(())
    }
}

/// Hands every plugin a store prefixed with its name.
pub struct PgPluginStores {
    pool: PgPool,
}

impl PgPluginStores {
    pub fn new(db: &Database) -> Self {
        Self {
            pool: db.pool().clone(),
        }
    }
}

impl PluginStoreProvider for PgPluginStores {
    fn store_for(&self, plugin: &str) -> Arc<dyn PluginStore> {
        Arc::new(PgPluginStore {
            pool: self.pool.clone(),
            prefix: plugin.to_lowercase(),
        })
    }
}
