use anyhow::{Context, Result};
use mongodb::bson::doc;
use mongodb::options::{ClientOptions, Credential, ServerAddress, Tls, TlsOptions};
use postgres_native_tls::MakeTlsConnector;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;
use tokio_postgres::{Client, NoTls};

use crate::error::AdapterError;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(15);

/// Backend family a connection speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DatabaseType {
    #[serde(rename = "sql", alias = "postgres", alias = "postgresql")]
    Sql,
    #[serde(rename = "mongodb", alias = "mongo")]
    MongoDb,
}

impl DatabaseType {
    pub fn as_str(&self) -> &'static str {
        match self {
            DatabaseType::Sql => "sql",
            DatabaseType::MongoDb => "mongodb",
        }
    }

    pub fn default_port(&self) -> u16 {
        match self {
            DatabaseType::Sql => 5432,
            DatabaseType::MongoDb => 27017,
        }
    }
}

impl fmt::Display for DatabaseType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DatabaseType {
    type Err = AdapterError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "sql" | "postgres" | "postgresql" => Ok(DatabaseType::Sql),
            "mongodb" | "mongo" => Ok(DatabaseType::MongoDb),
            _ => Err(AdapterError::UnsupportedDatabaseType(s.to_string())),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionConfig {
    pub name: String,
    #[serde(default = "default_database_type")]
    pub database_type: DatabaseType,
    pub host: String,
    #[serde(default)]
    pub port: Option<u16>,
    pub database: String,
    #[serde(default)]
    pub username: String,
    #[serde(skip_serializing, default)]
    pub password: String,
    #[serde(default)]
    pub ssl_mode: SslMode,
    /// Accept invalid/self-signed certificates. Use with caution.
    #[serde(default)]
    pub accept_invalid_certs: bool,
    /// Optional path to a custom CA certificate file (PEM format).
    #[serde(default)]
    pub ca_cert_path: Option<String>,
    /// MongoDB authentication database (`authSource`). Defaults to `database`.
    #[serde(default)]
    pub auth_source: Option<String>,
}

fn default_database_type() -> DatabaseType {
    DatabaseType::Sql
}

/// SSL/TLS connection modes.
///
/// These match the standard PostgreSQL sslmode parameter. MongoDB has no
/// opportunistic mode, so `Prefer` connects without TLS there.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq)]
pub enum SslMode {
    Disable,
    #[default]
    Prefer,
    Require,
    VerifyCa,
    VerifyFull,
}

impl ConnectionConfig {
    pub fn port(&self) -> u16 {
        self.port
            .unwrap_or_else(|| self.database_type.default_port())
    }

    pub fn connection_string(&self) -> String {
        let sslmode = match self.ssl_mode {
            SslMode::Disable => "disable",
            SslMode::Prefer => "prefer",
            SslMode::Require => "require",
            SslMode::VerifyCa => "verify-ca",
            SslMode::VerifyFull => "verify-full",
        };
        format!(
            "host={} port={} dbname={} user={} password={} sslmode={} connect_timeout=10",
            quote_conn_value(&self.host),
            self.port(),
            quote_conn_value(&self.database),
            quote_conn_value(&self.username),
            quote_conn_value(&self.password),
            sslmode
        )
    }

    pub fn display_string(&self) -> String {
        format!(
            "{}://{}@{}:{}/{}",
            self.database_type,
            self.username,
            self.host,
            self.port(),
            self.database
        )
    }

    /// Environment variable consulted for the password before prompting.
    pub fn password_env_var(&self) -> &'static str {
        match self.database_type {
            DatabaseType::Sql => "PGPASSWORD",
            DatabaseType::MongoDb => "MONGODB_PASSWORD",
        }
    }

    /// MongoDB client options equivalent to this config.
    pub fn mongodb_options(&self) -> ClientOptions {
        let mut options = ClientOptions::default();
        options.hosts = vec![ServerAddress::Tcp {
            host: self.host.clone(),
            port: Some(self.port()),
        }];
        options.app_name = Some(env!("CARGO_PKG_NAME").to_string());
        options.connect_timeout = Some(CONNECT_TIMEOUT);
        options.server_selection_timeout = Some(CONNECT_TIMEOUT);
        options.default_database = Some(self.database.clone());

        if !self.username.is_empty() {
            let mut credential = Credential::default();
            credential.username = Some(self.username.clone());
            credential.password = Some(self.password.clone());
            credential.source = Some(
                self.auth_source
                    .clone()
                    .unwrap_or_else(|| self.database.clone()),
            );
            options.credential = Some(credential);
        }

        options.tls = match self.ssl_mode {
            SslMode::Disable | SslMode::Prefer => None,
            SslMode::Require | SslMode::VerifyCa | SslMode::VerifyFull => {
                let mut tls = TlsOptions::default();
                if self.accept_invalid_certs && self.ssl_mode == SslMode::Require {
                    tls.allow_invalid_certificates = Some(true);
                }
                tls.ca_file_path = self.ca_cert_path.as_ref().map(PathBuf::from);
                Some(Tls::Enabled(tls))
            }
        };

        options
    }
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            name: String::from("Local PostgreSQL"),
            database_type: DatabaseType::Sql,
            host: String::from("localhost"),
            port: None,
            database: String::from("postgres"),
            username: String::from("postgres"),
            password: String::new(),
            ssl_mode: SslMode::default(),
            accept_invalid_certs: false,
            ca_cert_path: None,
            auth_source: None,
        }
    }
}

/// Live backend client.
pub enum ConnectionHandle {
    Postgres {
        client: Client,
        /// Connector used for the session, reused to send cancel requests.
        tls: Option<MakeTlsConnector>,
    },
    MongoDb(mongodb::Client),
}

/// An open backend connection plus its metadata.
///
/// Owned by whoever opened it; adapters only borrow it for one query.
pub struct DbConnection {
    handle: ConnectionHandle,
    pub host: String,
    pub database: String,
}

impl DbConnection {
    pub fn postgres(
        client: Client,
        tls: Option<MakeTlsConnector>,
        host: impl Into<String>,
        database: impl Into<String>,
    ) -> Self {
        Self {
            handle: ConnectionHandle::Postgres { client, tls },
            host: host.into(),
            database: database.into(),
        }
    }

    pub fn mongodb(
        client: mongodb::Client,
        host: impl Into<String>,
        database: impl Into<String>,
    ) -> Self {
        Self {
            handle: ConnectionHandle::MongoDb(client),
            host: host.into(),
            database: database.into(),
        }
    }

    pub fn database_type(&self) -> DatabaseType {
        match self.handle {
            ConnectionHandle::Postgres { .. } => DatabaseType::Sql,
            ConnectionHandle::MongoDb(_) => DatabaseType::MongoDb,
        }
    }

    pub fn handle(&self) -> &ConnectionHandle {
        &self.handle
    }
}

impl fmt::Debug for DbConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DbConnection")
            .field("database_type", &self.database_type())
            .field("host", &self.host)
            .field("database", &self.database)
            .finish()
    }
}

/// Open a connection for the given config.
pub async fn connect(config: &ConnectionConfig) -> Result<DbConnection> {
    match config.database_type {
        DatabaseType::Sql => {
            let (client, tls) = create_client(config).await?;
            Ok(DbConnection::postgres(
                client,
                tls,
                config.host.clone(),
                config.database.clone(),
            ))
        }
        DatabaseType::MongoDb => {
            let client = mongodb::Client::with_options(config.mongodb_options())
                .context("Invalid MongoDB client options")?;
            // The driver connects lazily; ping so bad credentials fail here.
            tokio::time::timeout(
                CONNECT_TIMEOUT,
                client.database(&config.database).run_command(doc! { "ping": 1 }),
            )
            .await
            .map_err(|_| anyhow::anyhow!("Connection timed out after 15s"))?
            .context("Failed to connect to MongoDB")?;
            Ok(DbConnection::mongodb(
                client,
                config.host.clone(),
                config.database.clone(),
            ))
        }
    }
}

/// Create a PostgreSQL client, returning the TLS connector used (if any).
pub async fn create_client(config: &ConnectionConfig) -> Result<(Client, Option<MakeTlsConnector>)> {
    let conn_string = config.connection_string();

    match config.ssl_mode {
        SslMode::Disable => {
            let (client, connection) =
                tokio::time::timeout(CONNECT_TIMEOUT, tokio_postgres::connect(&conn_string, NoTls))
                    .await
                    .map_err(|_| anyhow::anyhow!("Connection timed out after 15s"))?
                    .context("Failed to connect to PostgreSQL")?;
            tokio::spawn(async move {
                if let Err(e) = connection.await {
                    tracing::error!("PostgreSQL connection error: {}", e);
                }
            });
            Ok((client, None))
        }
        mode => {
            // Prefer/Require verify only when asked; VerifyCa/VerifyFull always do.
            let strict = matches!(mode, SslMode::VerifyCa | SslMode::VerifyFull);
            let tls = build_tls_connector(config, strict)?;
            let (client, connection) = tokio::time::timeout(
                CONNECT_TIMEOUT,
                tokio_postgres::connect(&conn_string, tls.clone()),
            )
            .await
            .map_err(|_| anyhow::anyhow!("Connection timed out after 15s"))?
            .context("Failed to connect to PostgreSQL")?;
            tokio::spawn(async move {
                if let Err(e) = connection.await {
                    tracing::error!("PostgreSQL connection error: {}", e);
                }
            });
            Ok((client, Some(tls)))
        }
    }
}

/// Build a TLS connector with appropriate certificate configuration.
fn build_tls_connector(config: &ConnectionConfig, strict_verify: bool) -> Result<MakeTlsConnector> {
    let mut builder = native_tls::TlsConnector::builder();

    if config.accept_invalid_certs && !strict_verify {
        builder.danger_accept_invalid_certs(true);
        builder.danger_accept_invalid_hostnames(true);
    } else if let Some(ca_path) = &config.ca_cert_path {
        let pem = std::fs::read(ca_path)
            .with_context(|| format!("Failed to read CA certificate file: {}", ca_path))?;
        for block in split_pem_certificates(&pem)? {
            let cert = native_tls::Certificate::from_pem(block.as_bytes())
                .context("Failed to parse certificate")?;
            builder.add_root_certificate(cert);
        }
    }
    // Otherwise the system trust store applies.

    let connector = builder.build().context("Failed to build TLS connector")?;
    Ok(MakeTlsConnector::new(connector))
}

/// Split a PEM bundle into individual certificate blocks.
fn split_pem_certificates(pem_data: &[u8]) -> Result<Vec<String>> {
    let pem_str =
        std::str::from_utf8(pem_data).context("CA certificate file is not valid UTF-8")?;

    let mut certs = Vec::new();
    let mut current: Option<String> = None;

    for line in pem_str.lines() {
        let line = line.trim();
        if line.contains("-----BEGIN CERTIFICATE-----") {
            current = Some(format!("{}\n", line));
        } else if let Some(block) = current.as_mut() {
            block.push_str(line);
            block.push('\n');
            if line.contains("-----END CERTIFICATE-----") {
                certs.extend(current.take());
            }
        }
    }

    if certs.is_empty() {
        anyhow::bail!("No valid certificates found in PEM data");
    }

    Ok(certs)
}

/// Quote a value for use in a libpq key=value connection string.
/// Wraps in single quotes and escapes backslashes and single quotes.
fn quote_conn_value(value: &str) -> String {
    let escaped = value.replace('\\', "\\\\").replace('\'', "\\'");
    format!("'{}'", escaped)
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct SavedConnections {
    #[serde(default)]
    connections: Vec<ConnectionConfig>,
}

pub fn get_config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(env!("CARGO_PKG_NAME"))
        .join("connections.toml")
}

pub fn load_saved_connections() -> Result<Vec<ConnectionConfig>> {
    load_connections_from(&get_config_path())
}

pub fn load_connections_from(path: &std::path::Path) -> Result<Vec<ConnectionConfig>> {
    if !path.exists() {
        return Ok(vec![]);
    }
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    let saved: SavedConnections =
        toml::from_str(&content).with_context(|| format!("Invalid {}", path.display()))?;
    Ok(saved.connections)
}
