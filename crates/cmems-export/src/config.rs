//! Export configuration
//!
//! Every value has a `DEFAULT_*` fallback; environment variables (optionally
//! from a `.env` file) override them.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::remote::RemoteLayout;

// ============================================================================
// FTP
// ============================================================================

/// Default FTP port.
pub const DEFAULT_FTP_PORT: u16 = 21;

// ============================================================================
// Catalog database
// ============================================================================

/// Default catalog database URL for local development.
pub const DEFAULT_DATABASE_URL: &str = "postgresql://localhost/cmems";

/// Default maximum catalog connections. A run is sequential, so few are needed.
pub const DEFAULT_DATABASE_MAX_CONNECTIONS: u32 = 4;

/// Default minimum catalog connections.
pub const DEFAULT_DATABASE_MIN_CONNECTIONS: u32 = 1;

/// Default catalog connection timeout in seconds.
pub const DEFAULT_DATABASE_CONNECT_TIMEOUT_SECS: u64 = 10;

// ============================================================================
// Product
// ============================================================================

pub const DEFAULT_PRODUCT_ID: &str = "INSITU_GLO_CARBON_NRT_OBSERVATIONS_013_049";

/// Dataset folder that uploads are pushed to.
pub const DEFAULT_DATASET_ID: &str = "NRT_202003";

/// Dataset name under which the public server exposes the files.
pub const DEFAULT_PUBLIC_ALIAS: &str = "NRT";

pub const DEFAULT_SERVER_LOCATION: &str = "ftp://nrt.cmems-du.eu/Core";

pub const DEFAULT_PUSHING_ENTITY: &str = "CopernicusMarine-InSitu-Global";

pub const DEFAULT_INSTITUTION: &str = "University of Bergen Geophysical Institute";

/// EDMO code of the providing institution, listed in the platform index.
pub const DEFAULT_INSTITUTION_EDMO: &str = "4595";

pub const DEFAULT_CATALOG_ID: &str = "COP-GLOBAL-01";

/// Local folder holding rendered files, the index and delivery notes.
pub const DEFAULT_LOCAL_FOLDER: &str = "latest";

// ============================================================================
// Polling & retention
// ============================================================================

pub const DEFAULT_POLL_INTERVAL_SECS: u64 = 10;

pub const DEFAULT_POLL_MAX_ATTEMPTS: u32 = 50;

pub const DEFAULT_RETENTION_DAYS: u32 = 30;

/// Full configuration of one export deployment
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExportConfig {
    pub ftp: FtpConfig,
    pub database: DbConfig,
    pub product: ProductConfig,
    pub poll: PollConfig,
    /// Age in days after which confirmed files are withdrawn
    pub retention_days: u32,
}

/// Push server credentials
#[derive(Clone, Serialize, Deserialize)]
pub struct FtpConfig {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: String,
}

impl std::fmt::Debug for FtpConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FtpConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

impl Default for FtpConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: DEFAULT_FTP_PORT,
            username: "anonymous".to_string(),
            password: String::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DbConfig {
    pub url: String,
    pub max_connections: u32,
    pub min_connections: u32,
    pub connect_timeout_secs: u64,
    pub idle_timeout_secs: Option<u64>,
}

impl Default for DbConfig {
    fn default() -> Self {
        Self {
            url: DEFAULT_DATABASE_URL.to_string(),
            max_connections: DEFAULT_DATABASE_MAX_CONNECTIONS,
            min_connections: DEFAULT_DATABASE_MIN_CONNECTIONS,
            connect_timeout_secs: DEFAULT_DATABASE_CONNECT_TIMEOUT_SECS,
            idle_timeout_secs: None,
        }
    }
}

/// Identity of the delivered product and how the public server names it
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProductConfig {
    pub product_id: String,
    pub dataset_id: String,
    pub public_alias: String,
    pub server_location: String,
    pub pushing_entity: String,
    pub institution: String,
    pub institution_edmo: String,
    pub catalog_id: String,
    pub local_folder: PathBuf,
}

impl Default for ProductConfig {
    fn default() -> Self {
        Self {
            product_id: DEFAULT_PRODUCT_ID.to_string(),
            dataset_id: DEFAULT_DATASET_ID.to_string(),
            public_alias: DEFAULT_PUBLIC_ALIAS.to_string(),
            server_location: DEFAULT_SERVER_LOCATION.to_string(),
            pushing_entity: DEFAULT_PUSHING_ENTITY.to_string(),
            institution: DEFAULT_INSTITUTION.to_string(),
            institution_edmo: DEFAULT_INSTITUTION_EDMO.to_string(),
            catalog_id: DEFAULT_CATALOG_ID.to_string(),
            local_folder: PathBuf::from(DEFAULT_LOCAL_FOLDER),
        }
    }
}

impl ProductConfig {
    pub fn layout(&self) -> RemoteLayout {
        RemoteLayout::new(&self.product_id, &self.dataset_id)
    }

    /// Local folder for delivery notes
    pub fn notification_folder(&self) -> PathBuf {
        self.local_folder.join("DNT")
    }
}

/// Bounded wait for the ingestion response
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct PollConfig {
    pub interval_secs: u64,
    pub max_attempts: u32,
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            interval_secs: DEFAULT_POLL_INTERVAL_SECS,
            max_attempts: DEFAULT_POLL_MAX_ATTEMPTS,
        }
    }
}

impl PollConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }
}

impl Default for ExportConfig {
    fn default() -> Self {
        Self {
            ftp: FtpConfig::default(),
            database: DbConfig::default(),
            product: ProductConfig::default(),
            poll: PollConfig::default(),
            retention_days: DEFAULT_RETENTION_DAYS,
        }
    }
}

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|s| s.parse().ok())
}

impl ExportConfig {
    /// Load from `.env` and the environment, then validate
    pub fn load() -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();

        let config = Self::from_env();
        config.validate()?;

        Ok(config)
    }

    /// Read the environment without validating
    pub fn from_env() -> Self {
        let defaults = Self::default();

        Self {
            ftp: FtpConfig {
                host: env_or("CMEMS_FTP_HOST", &defaults.ftp.host),
                port: env_parse("CMEMS_FTP_PORT").unwrap_or(defaults.ftp.port),
                username: env_or("CMEMS_FTP_USER", &defaults.ftp.username),
                password: env_or("CMEMS_FTP_PASSWORD", &defaults.ftp.password),
            },
            database: DbConfig {
                url: env_or("DATABASE_URL", &defaults.database.url),
                max_connections: env_parse("DB_MAX_CONNECTIONS")
                    .unwrap_or(defaults.database.max_connections),
                min_connections: env_parse("DB_MIN_CONNECTIONS")
                    .unwrap_or(defaults.database.min_connections),
                connect_timeout_secs: env_parse("DB_CONNECT_TIMEOUT")
                    .unwrap_or(defaults.database.connect_timeout_secs),
                idle_timeout_secs: env_parse("DB_IDLE_TIMEOUT"),
            },
            product: ProductConfig {
                product_id: env_or("CMEMS_PRODUCT_ID", &defaults.product.product_id),
                dataset_id: env_or("CMEMS_DATASET_ID", &defaults.product.dataset_id),
                public_alias: env_or("CMEMS_PUBLIC_ALIAS", &defaults.product.public_alias),
                server_location: env_or("CMEMS_SERVER_LOCATION", &defaults.product.server_location),
                pushing_entity: env_or("CMEMS_PUSHING_ENTITY", &defaults.product.pushing_entity),
                institution: env_or("CMEMS_INSTITUTION", &defaults.product.institution),
                institution_edmo: env_or("CMEMS_INSTITUTION_EDMO", &defaults.product.institution_edmo),
                catalog_id: env_or("CMEMS_CATALOG_ID", &defaults.product.catalog_id),
                local_folder: std::env::var("CMEMS_LOCAL_FOLDER")
                    .map(PathBuf::from)
                    .unwrap_or(defaults.product.local_folder),
            },
            poll: PollConfig {
                interval_secs: env_parse("CMEMS_POLL_INTERVAL_SECS")
                    .unwrap_or(defaults.poll.interval_secs),
                max_attempts: env_parse("CMEMS_POLL_MAX_ATTEMPTS")
                    .unwrap_or(defaults.poll.max_attempts),
            },
            retention_days: env_parse("CMEMS_RETENTION_DAYS").unwrap_or(defaults.retention_days),
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.ftp.host.is_empty() {
            anyhow::bail!("CMEMS_FTP_HOST cannot be empty");
        }
        if self.ftp.port == 0 {
            anyhow::bail!("FTP port must be greater than 0");
        }

        if self.database.url.is_empty() {
            anyhow::bail!("Database URL cannot be empty");
        }
        if self.database.max_connections == 0 {
            anyhow::bail!("Database max_connections must be greater than 0");
        }
        if self.database.min_connections > self.database.max_connections {
            anyhow::bail!("Database min_connections cannot exceed max_connections");
        }

        for (name, value) in [
            ("product id", &self.product.product_id),
            ("dataset id", &self.product.dataset_id),
            ("public alias", &self.product.public_alias),
        ] {
            if value.is_empty() || value.contains('/') {
                anyhow::bail!("Invalid {}: '{}'", name, value);
            }
        }

        if self.poll.max_attempts == 0 {
            anyhow::bail!("Poll max_attempts must be greater than 0");
        }
        if self.retention_days == 0 {
            anyhow::bail!("Retention window must be at least one day");
        }

        Ok(())
    }
}
