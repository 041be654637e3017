//! SurrealDB connection setup for the durable work queue.
//!
//! Three ways in: an embedded in-memory store, a plain URL
//! (`SURREALDB_URL`), or an authenticated endpoint described by
//! [`CloudConfig`]. Whichever is used, the connection is pointed at its
//! namespace/database and migrated before it is returned.

use std::env;

use surrealdb::engine::any::Any;
use surrealdb::opt::auth::{Database, Root};
use surrealdb::Surreal;
use tracing::{info, instrument};

use crate::error::StateError;
use crate::migrations;
use crate::Result;

const DEFAULT_NAMESPACE: &str = "depflow";
const DEFAULT_DATABASE: &str = "queue";

/// Which credentials a [`CloudConfig`] signs in with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AuthScope {
    /// Database-level user, limited to the configured namespace/database.
    #[default]
    Database,
    /// Root user.
    Root,
}

/// An authenticated SurrealDB endpoint.
#[derive(Debug, Clone)]
pub struct CloudConfig {
    /// e.g. `wss://queue.example.surrealdb.cloud`
    pub endpoint: String,
    pub username: String,
    pub password: String,
    pub namespace: String,
    pub database: String,
    pub scope: AuthScope,
}

impl CloudConfig {
    pub fn new(
        endpoint: impl Into<String>,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        Self {
            endpoint: endpoint.into(),
            username: username.into(),
            password: password.into(),
            namespace: DEFAULT_NAMESPACE.to_string(),
            database: DEFAULT_DATABASE.to_string(),
            scope: AuthScope::Database,
        }
    }

    /// Read `SURREALDB_ENDPOINT`, `SURREALDB_USERNAME`, `SURREALDB_PASSWORD`
    /// and optionally `SURREALDB_NAMESPACE`, `SURREALDB_DATABASE`,
    /// `SURREALDB_ROOT`.
    ///
    /// `Ok(None)` when no endpoint is configured; an endpoint without
    /// credentials is an error.
    pub fn from_env() -> Result<Option<Self>> {
        let Ok(endpoint) = env::var("SURREALDB_ENDPOINT") else {
            return Ok(None);
        };
        let required = |name: &str| {
            env::var(name).map_err(|_| {
                StateError::Connection(format!("SURREALDB_ENDPOINT is set but {name} is not"))
            })
        };
        let mut config = Self::new(
            endpoint,
            required("SURREALDB_USERNAME")?,
            required("SURREALDB_PASSWORD")?,
        );
        if let Ok(ns) = env::var("SURREALDB_NAMESPACE") {
            config.namespace = ns;
        }
        if let Ok(db) = env::var("SURREALDB_DATABASE") {
            config.database = db;
        }
        if env::var("SURREALDB_ROOT").is_ok_and(|v| v.eq_ignore_ascii_case("true")) {
            config.scope = AuthScope::Root;
        }
        Ok(Some(config))
    }
}

fn connection_error(context: &str, err: impl std::fmt::Display) -> StateError {
    StateError::Connection(format!("{context}: {err}"))
}

/// Embedded in-memory store (tests, single-process runs).
pub async fn connect_in_memory() -> Result<Surreal<Any>> {
    connect_url("mem://").await
}

/// Unauthenticated connection to `url`, default namespace/database.
#[instrument]
pub async fn connect_url(url: &str) -> Result<Surreal<Any>> {
    let db = surrealdb::engine::any::connect(url)
        .await
        .map_err(|e| connection_error(&format!("connect {url}"), e))?;
    db.use_ns(DEFAULT_NAMESPACE)
        .use_db(DEFAULT_DATABASE)
        .await
        .map_err(|e| connection_error("select namespace", e))?;

    migrations::init_schema(&db).await?;
    info!(url, "work queue store ready");
    Ok(db)
}

#[instrument(skip(config), fields(endpoint = %config.endpoint, namespace = %config.namespace))]
pub async fn connect_cloud(config: &CloudConfig) -> Result<Surreal<Any>> {
    let db = surrealdb::engine::any::connect(&config.endpoint)
        .await
        .map_err(|e| connection_error(&format!("connect {}", config.endpoint), e))?;

    let signed_in = match config.scope {
        AuthScope::Root => {
            db.signin(Root {
                username: &config.username,
                password: &config.password,
            })
            .await
        }
        AuthScope::Database => {
            db.signin(Database {
                namespace: &config.namespace,
                database: &config.database,
                username: &config.username,
                password: &config.password,
            })
            .await
        }
    };
    signed_in.map_err(|e| connection_error("sign in", e))?;

    db.use_ns(&config.namespace)
        .use_db(&config.database)
        .await
        .map_err(|e| connection_error("select namespace", e))?;

    migrations::init_schema(&db).await?;
    info!(scope = ?config.scope, "work queue store ready");
    Ok(db)
}

/// Pick a connection from the environment: an authenticated endpoint, then
/// `SURREALDB_URL`, then the in-memory store.
pub async fn connect_from_env() -> Result<Surreal<Any>> {
    if let Some(config) = CloudConfig::from_env()? {
        return connect_cloud(&config).await;
    }
    if let Ok(url) = env::var("SURREALDB_URL") {
        return connect_url(&url).await;
    }
    info!("no SurrealDB endpoint configured, using the in-memory store");
    connect_in_memory().await
}
