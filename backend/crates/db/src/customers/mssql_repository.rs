use std::time::Duration;

use async_trait::async_trait;
use chrono::{NaiveDateTime, TimeZone, Utc};
use tiberius::{AuthMethod, Client, Config, EncryptionLevel, Query, Row};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio_util::compat::{Compat, TokioAsyncWriteCompatExt};

use crate::customers::models::{join_address, non_blank, SourceRecord};
use crate::customers::repositories::ChangeFeed;
use crate::sync::models::Watermark;
use relay_common::error::{RelayError, RelayResult};
use relay_config::SourceDbConfig;

type SqlClient = Client<Compat<TcpStream>>;

// `DateTimeModified` is a `datetime` (1/300 s ticks). Casting the cursor back to
// `datetime` keeps the last row of a page from comparing greater than itself.
// The binary collation orders account numbers the way `Watermark` does.
const CHANGED_CUSTOMERS: &str = "
    SELECT TOP (@P1)
        c.CustomerAccountNumber,
        c.CustomerName,
        c.TelephoneNumber,
        c.EmailAddress,
        a.Address1,
        a.Address2,
        a.City,
        a.PostCode,
        a.Country,
        c.DateTimeModified
    FROM SLCustomers c
    LEFT JOIN PLPostalAddresses a ON c.MainAddressID = a.PostalAddressID
    WHERE c.DateTimeModified > CAST(@P2 AS datetime)
       OR (c.DateTimeModified = CAST(@P2 AS datetime)
           AND c.CustomerAccountNumber COLLATE Latin1_General_BIN2 > @P3)
    ORDER BY c.DateTimeModified ASC,
             c.CustomerAccountNumber COLLATE Latin1_General_BIN2 ASC";

/// Change feed over a Sage 200c company database (`SLCustomers`).
///
/// Holds at most one connection. It is opened on first use and dropped after
/// any error, so an offline ledger shows up as a failed cycle and the next
/// cycle reconnects.
pub struct MssqlCustomerFeed {
    config: Config,
    company: String,
    database: String,
    connect_timeout: Duration,
    client: Mutex<Option<SqlClient>>,
}

impl MssqlCustomerFeed {
    pub fn new(source: &SourceDbConfig, company: impl Into<String>, connect_timeout: Duration) -> Self {
        let company = company.into();
        let database = source.database_for(&company);

        let mut config = Config::new();
        config.host(&source.host);
        config.port(source.port);
        config.database(&database);
        config.authentication(AuthMethod::sql_server(&source.username, &source.password));
        config.application_name("relay-sync");
        if source.encrypt {
            config.encryption(EncryptionLevel::Required);
            config.trust_cert();
        } else {
            config.encryption(EncryptionLevel::NotSupported);
        }

        tracing::info!(
            host = %source.host,
            port = source.port,
            database = %database,
            company = %company,
            "configuring source database"
        );

        Self::with_config(config, company, database, connect_timeout)
    }

    fn with_config(config: Config, company: String, database: String, connect_timeout: Duration) -> Self {
        Self {
            config,
            company,
            database,
            connect_timeout,
            client: Mutex::new(None),
        }
    }

    pub fn company(&self) -> &str {
        &self.company
    }

    /// Connection check that also reports how many customers the ledger holds.
    pub async fn count_customers(&self) -> RelayResult<i64> {
        let mut slot = self.client.lock().await;
        let mut client = self.take_or_connect(&mut slot).await?;

        let row = client
            .simple_query("SELECT COUNT(*) AS total FROM SLCustomers")
            .await
            .map_err(db_error)?
            .into_row()
            .await
            .map_err(db_error)?;
        *slot = Some(client);

        let total: Option<i32> = match &row {
            Some(row) => row.try_get("total").map_err(db_error)?,
            None => None,
        };
        Ok(total.map(i64::from).unwrap_or_default())
    }

    async fn take_or_connect(&self, slot: &mut Option<SqlClient>) -> RelayResult<SqlClient> {
        match slot.take() {
            Some(client) => Ok(client),
            None => self.connect().await,
        }
    }

    async fn connect(&self) -> RelayResult<SqlClient> {
        let addr = self.config.get_addr();
        let tcp = tokio::time::timeout(self.connect_timeout, TcpStream::connect(addr.as_str()))
            .await
            .map_err(|_| {
                RelayError::Database(format!(
                    "connecting to {addr} timed out after {:?}",
                    self.connect_timeout
                ))
            })?
            .map_err(|e| RelayError::Database(format!("connecting to {addr}: {e}")))?;
        tcp.set_nodelay(true).map_err(db_error)?;

        let client = Client::connect(self.config.clone(), tcp.compat_write())
            .await
            .map_err(db_error)?;
        tracing::debug!(company = %self.company, database = %self.database, "source database connected");
        Ok(client)
    }

    fn map_row(row: &Row) -> RelayResult<SourceRecord> {
        let code = text(row, "CustomerAccountNumber")?.unwrap_or_default();
        let modified: NaiveDateTime = row
            .try_get("DateTimeModified")
            .map_err(db_error)?
            .ok_or_else(|| RelayError::Database(format!("customer {code} has no DateTimeModified")))?;

        Ok(SourceRecord {
            code,
            name: non_blank(text(row, "CustomerName")?),
            phone: non_blank(text(row, "TelephoneNumber")?),
            // SLCustomers carries no mobile number.
            mobile: None,
            email: non_blank(text(row, "EmailAddress")?),
            address: join_address(text(row, "Address1")?, text(row, "Address2")?),
            city: non_blank(text(row, "City")?),
            postal_code: non_blank(text(row, "PostCode")?),
            country: non_blank(text(row, "Country")?),
            // Sage stores wall-clock time without a zone; it is kept as-is.
            modified_at: Utc.from_utc_datetime(&modified),
        })
    }
}

#[async_trait]
impl ChangeFeed for MssqlCustomerFeed {
    async fn fetch_changed(&self, since: &Watermark, limit: i64) -> RelayResult<Vec<SourceRecord>> {
        let mut slot = self.client.lock().await;
        let mut client = self.take_or_connect(&mut slot).await?;

        let mut query = Query::new(CHANGED_CUSTOMERS);
        query.bind(limit);
        query.bind(since.modified_at.naive_utc());
        query.bind(since.code.clone());

        let rows = query
            .query(&mut client)
            .await
            .map_err(db_error)?
            .into_first_result()
            .await
            .map_err(db_error)?;
        *slot = Some(client);

        let records = rows.iter().map(Self::map_row).collect::<RelayResult<Vec<_>>>()?;
        tracing::debug!(
            company = %self.company,
            since = %since.modified_at,
            count = records.len(),
            "fetched changed customers"
        );
        Ok(records)
    }
}

fn text(row: &Row, column: &str) -> RelayResult<Option<String>> {
    row.try_get::<&str, _>(column)
        .map(|value| value.map(str::to_owned))
        .map_err(|e| RelayError::Database(format!("{column}: {e}")))
}

fn db_error(e: impl std::fmt::Display) -> RelayError {
    RelayError::Database(e.to_string())
}
