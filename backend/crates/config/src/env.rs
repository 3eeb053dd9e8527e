use relay_common::error::{RelayError, RelayResult};
use serde::Deserialize;
use std::env;
use std::str::FromStr;

/// Longest accepted sync interval (one week).
pub const MAX_INTERVAL_MINUTES: u64 = 7 * 24 * 60;
/// Longest accepted first-run lookback (one year).
pub const MAX_LOOKBACK_HOURS: i64 = 366 * 24;
/// Longest accepted timeout for a single database or HTTP call.
pub const MAX_TIMEOUT_SECS: u64 = 3600;

/// Connection parameters for the Sage 200c SQL Server instance.
#[derive(Debug, Clone, Deserialize)]
pub struct SourceDbConfig {
    pub host: String,
    pub port: u16,
    /// Database name. A `{company}` placeholder is replaced with the source
    /// company of each mapping, for installs with one database per company.
    pub database: String,
    pub username: String,
    pub password: String,
    /// Require TLS to SQL Server. Sage installs usually run without it.
    pub encrypt: bool,
}

impl SourceDbConfig {
    pub fn is_complete(&self) -> bool {
        !self.host.is_empty()
            && !self.database.is_empty()
            && !self.username.is_empty()
            && !self.password.is_empty()
    }

    pub fn database_for(&self, company: &str) -> String {
        self.database.replace("{company}", company)
    }
}

/// Bitrix24 webhook endpoint plus connector tuning.
#[derive(Debug, Clone, Deserialize)]
pub struct BitrixConfig {
    pub endpoint: String,
    pub client_code: String,
    pub min_spacing_ms: u64,
    pub max_retries: u32,
    pub retry_base_ms: u64,
    pub timeout_secs: u64,
}

/// One source company synchronized into one target company.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct CompanyMapping {
    pub source_company: String,
    pub target_company: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SyncSettings {
    pub interval_minutes: u64,
    pub batch_size: i64,
    pub lookback_hours: i64,
    pub advance_every: usize,
    pub io_timeout_secs: u64,
    pub source_label: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    /// State database holding the sync watermarks.
    pub database_url: String,
    pub source_db: SourceDbConfig,
    pub bitrix: BitrixConfig,
    pub companies: Vec<CompanyMapping>,
    pub sync: SyncSettings,
    pub log_level: String,
}

impl AppConfig {
    /// Load configuration from environment variables.
    /// Loads `.env` file if present, then reads the vars. Call [`AppConfig::validate`]
    /// before starting any worker.
    pub fn from_env() -> RelayResult<Self> {
        // Best-effort .env load; ignore if missing
        let _ = dotenvy::dotenv();

        let companies = match get_var_opt("COMPANY_MAPPINGS") {
            Some(raw) => parse_company_mappings(&raw)?,
            None => match (get_var_opt("EMPRESA_SAGE"), get_var_opt("EMPRESA_BITRIX")) {
                (Some(source_company), Some(target_company)) => vec![CompanyMapping {
                    source_company,
                    target_company,
                }],
                _ => Vec::new(),
            },
        };

        Ok(Self {
            database_url: get_var("DATABASE_URL")?,
            source_db: SourceDbConfig {
                host: get_var_or("SAGE_DB_HOST", ""),
                port: get_parsed_or("SAGE_DB_PORT", 1433)?,
                database: get_var_or("SAGE_DB_NAME", ""),
                username: get_var_or("SAGE_DB_USER", ""),
                password: get_var_or("SAGE_DB_PASSWORD", ""),
                encrypt: get_parsed_or("SAGE_DB_ENCRYPT", false)?,
            },
            bitrix: BitrixConfig {
                endpoint: get_var_or("BITRIX_ENDPOINT", "")
                    .trim_end_matches('/')
                    .to_owned(),
                client_code: get_var_or("BITRIX_CLIENT_CODE", ""),
                min_spacing_ms: get_parsed_or("BITRIX_MIN_SPACING_MS", 100)?,
                max_retries: get_parsed_or("BITRIX_MAX_RETRIES", 3)?,
                retry_base_ms: get_parsed_or("BITRIX_RETRY_BASE_MS", 1000)?,
                timeout_secs: get_parsed_or("BITRIX_TIMEOUT_SECS", 30)?,
            },
            companies,
            sync: SyncSettings {
                interval_minutes: get_parsed_or("SYNC_INTERVAL_MINUTES", 5)?,
                batch_size: get_parsed_or("SYNC_BATCH_SIZE", 100)?,
                lookback_hours: get_parsed_or("SYNC_LOOKBACK_HOURS", 24)?,
                advance_every: get_parsed_or("SYNC_ADVANCE_EVERY", 1)?,
                io_timeout_secs: get_parsed_or("SYNC_IO_TIMEOUT_SECS", 30)?,
                source_label: get_var_or("SOURCE_LABEL", "Sage 200c"),
            },
            log_level: get_var_or("LOG_LEVEL", "info"),
        })
    }

    /// Structural validation; the sync core refuses to start on any error here.
    pub fn validate(&self) -> RelayResult<()> {
        if self.bitrix.client_code.is_empty() {
            return Err(invalid("client code (BITRIX_CLIENT_CODE) is required"));
        }
        if !self.source_db.is_complete() {
            return Err(invalid("source database configuration is incomplete"));
        }
        if self.bitrix.endpoint.is_empty() {
            return Err(invalid("BITRIX_ENDPOINT is required"));
        }
        if self.companies.is_empty() {
            return Err(invalid("at least one company mapping is required"));
        }
        if !(1..=MAX_INTERVAL_MINUTES).contains(&self.sync.interval_minutes) {
            return Err(invalid(&format!(
                "SYNC_INTERVAL_MINUTES must be between 1 and {MAX_INTERVAL_MINUTES}"
            )));
        }
        if self.sync.batch_size <= 0 {
            return Err(invalid("SYNC_BATCH_SIZE must be greater than zero"));
        }
        if !(0..=MAX_LOOKBACK_HOURS).contains(&self.sync.lookback_hours) {
            return Err(invalid(&format!(
                "SYNC_LOOKBACK_HOURS must be between 0 and {MAX_LOOKBACK_HOURS}"
            )));
        }
        if self.sync.advance_every == 0 {
            return Err(invalid("SYNC_ADVANCE_EVERY must be greater than zero"));
        }
        if !(1..=MAX_TIMEOUT_SECS).contains(&self.sync.io_timeout_secs) {
            return Err(invalid(&format!(
                "SYNC_IO_TIMEOUT_SECS must be between 1 and {MAX_TIMEOUT_SECS}"
            )));
        }
        if !(1..=MAX_TIMEOUT_SECS).contains(&self.bitrix.timeout_secs) {
            return Err(invalid(&format!(
                "BITRIX_TIMEOUT_SECS must be between 1 and {MAX_TIMEOUT_SECS}"
            )));
        }
        Ok(())
    }
}

/// Parse `source:target` pairs separated by commas.
pub fn parse_company_mappings(raw: &str) -> RelayResult<Vec<CompanyMapping>> {
    let mut mappings = Vec::new();

    for entry in raw.split(',').map(str::trim).filter(|s| !s.is_empty()) {
        let (source, target) = entry
            .split_once(':')
            .map(|(s, t)| (s.trim(), t.trim()))
            .filter(|(s, t)| !s.is_empty() && !t.is_empty())
            .ok_or_else(|| {
                invalid(&format!(
                    "COMPANY_MAPPINGS entry '{entry}' must look like source:target"
                ))
            })?;

        mappings.push(CompanyMapping {
            source_company: source.to_owned(),
            target_company: target.to_owned(),
        });
    }

    if mappings.is_empty() {
        return Err(invalid("COMPANY_MAPPINGS is set but contains no mappings"));
    }

    Ok(mappings)
}

fn invalid(msg: &str) -> RelayError {
    RelayError::ConfigInvalid(msg.to_owned())
}

fn get_var(key: &str) -> RelayResult<String> {
    get_var_opt(key).ok_or_else(|| invalid(&format!("{key} is required but not set")))
}

fn get_var_opt(key: &str) -> Option<String> {
    env::var(key).ok().filter(|v| !v.trim().is_empty())
}

fn get_var_or(key: &str, default: &str) -> String {
    get_var_opt(key).unwrap_or_else(|| default.to_owned())
}

fn get_parsed_or<T>(key: &str, default: T) -> RelayResult<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match get_var_opt(key) {
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|e| invalid(&format!("invalid {key}: {e}"))),
        None => Ok(default),
    }
}
