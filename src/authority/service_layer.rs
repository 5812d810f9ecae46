//! Service Layer inventory authority
//!
//! Uses stored SQL queries (`SQLQueries('<name>')/List`). The primary lookup
//! is scoped to the source warehouse; when it comes back empty a second,
//! warehouse-less lookup tells "not found" apart from "exists elsewhere".

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::NaiveDate;
use serde::Deserialize;
use serde_json::Value;
use tracing::debug;

use super::{AuthorityError, AuthorityVerdict, InventoryAuthority, UnitQuery};
use crate::config::AuthorityConfig;
use crate::erp::{ErpError, ServiceLayerClient};
use crate::transfer::types::{Tracking, UnitDates};

impl From<ErpError> for AuthorityError {
    fn from(e: ErpError) -> Self {
        if e.is_transient() {
            AuthorityError::Transient(e.to_string())
        } else {
            AuthorityError::Malformed(e.to_string())
        }
    }
}

/// One row returned by the validation queries
#[derive(Debug, Default, Deserialize)]
struct StockRow {
    #[serde(
        rename = "DistNumber",
        alias = "SerialNumber",
        alias = "BatchNum",
        alias = "BatchNumber",
        default
    )]
    number: Option<String>,
    #[serde(rename = "ItemCode", default)]
    item_code: Option<String>,
    #[serde(rename = "ItemName", default)]
    item_name: Option<String>,
    #[serde(rename = "WhsCode", default)]
    whs_code: Option<String>,
    #[serde(rename = "Quantity", default)]
    quantity: Option<f64>,
    #[serde(rename = "AvailableInWarehouse", default)]
    available_flag: Option<i64>,
    #[serde(rename = "MnfDate", alias = "ManufactureDate", default)]
    manufacture: Option<String>,
    #[serde(rename = "ExpDate", alias = "ExpiryDate", default)]
    expiry: Option<String>,
    #[serde(rename = "InDate", alias = "AdmissionDate", default)]
    admission: Option<String>,
}

fn parse_date(raw: Option<&str>) -> Option<NaiveDate> {
    let raw = raw?;
    NaiveDate::parse_from_str(raw.get(..10)?, "%Y-%m-%d").ok()
}

fn same_code(a: &str, b: &str) -> bool {
    a.trim().eq_ignore_ascii_case(b.trim())
}

impl StockRow {
    fn parse(value: Value) -> Result<Self, AuthorityError> {
        serde_json::from_value(value).map_err(|e| AuthorityError::Malformed(e.to_string()))
    }

    fn dates(&self) -> UnitDates {
        UnitDates {
            manufacture: parse_date(self.manufacture.as_deref()),
            expiry: parse_date(self.expiry.as_deref()),
            admission: parse_date(self.admission.as_deref()),
        }
    }

    /// Turn a row into a verdict for `query`
    fn verdict(&self, query: &UnitQuery, scoped_to_source: bool) -> AuthorityVerdict {
        let item_matches = self
            .item_code
            .as_deref()
            .is_none_or(|code| same_code(code, &query.item_code));
        let available_in_source = match (self.available_flag, self.whs_code.as_deref()) {
            (Some(flag), _) => flag != 0,
            (None, Some(whs)) => same_code(whs, &query.source_warehouse),
            (None, None) => scoped_to_source,
        };
        let available_quantity = match query.tracking {
            Tracking::Serial => Some(1),
            Tracking::Batch => self.quantity.map(|q| q.max(0.0).floor() as u32),
        };

        AuthorityVerdict {
            exists: true,
            item_matches,
            available_in_source,
            canonical_identifier: self.number.clone(),
            actual_item: self.item_code.clone(),
            located_in: self.whs_code.clone(),
            available_quantity,
            item_description: self.item_name.clone(),
            dates: self.dates(),
        }
    }
}

pub struct ServiceLayerAuthority {
    client: Arc<ServiceLayerClient>,
    config: AuthorityConfig,
}

impl ServiceLayerAuthority {
    pub fn new(client: Arc<ServiceLayerClient>, config: AuthorityConfig) -> Self {
        Self { client, config }
    }

    fn query_name(&self, tracking: Tracking) -> &str {
        match tracking {
            Tracking::Serial => &self.config.series_query,
            Tracking::Batch => &self.config.batch_query,
        }
    }

    fn identifier_param(tracking: Tracking) -> &'static str {
        match tracking {
            Tracking::Serial => "series",
            Tracking::Batch => "batch",
        }
    }

    async fn lookup(
        &self,
        query: &UnitQuery,
        warehouse: Option<&str>,
    ) -> Result<Option<StockRow>, AuthorityError> {
        let mut params = vec![
            (Self::identifier_param(query.tracking), query.identifier.as_str()),
            ("itemCode", query.item_code.as_str()),
        ];
        if let Some(whs) = warehouse {
            params.push(("whsCode", whs));
        }

        let rows = self
            .client
            .query(self.query_name(query.tracking), &params)
            .await?;
        rows.into_iter().next().map(StockRow::parse).transpose()
    }

    /// All queries serial, same item and warehouse
    fn bulk_compatible(queries: &[UnitQuery]) -> bool {
        let Some(first) = queries.first() else {
            return false;
        };
        queries.iter().all(|q| {
            q.tracking == Tracking::Serial
                && q.item_code == first.item_code
                && q.source_warehouse == first.source_warehouse
                && !q.identifier.contains(',')
        })
    }

    async fn bulk_lookup(
        &self,
        query_name: &str,
        queries: &[UnitQuery],
    ) -> Result<Vec<AuthorityVerdict>, AuthorityError> {
        let first = &queries[0];
        let series = queries
            .iter()
            .map(|q| q.identifier.as_str())
            .collect::<Vec<_>>()
            .join(",");
        let params = [
            ("series", series.as_str()),
            ("itemCode", first.item_code.as_str()),
            ("whsCode", first.source_warehouse.as_str()),
        ];

        let rows = self.client.query(query_name, &params).await?;
        let mut found: HashMap<String, StockRow> = HashMap::with_capacity(rows.len());
        for value in rows {
            let row = StockRow::parse(value)?;
            if let Some(number) = row.number.as_deref() {
                found.insert(number.trim().to_uppercase(), row);
            }
        }

        debug!(
            requested = queries.len(),
            found = found.len(),
            "Bulk serial lookup"
        );

        Ok(queries
            .iter()
            .map(|q| match found.get(&q.identifier.trim().to_uppercase()) {
                Some(row) => row.verdict(q, false),
                None => AuthorityVerdict::not_found(),
            })
            .collect())
    }
}

#[async_trait]
impl InventoryAuthority for ServiceLayerAuthority {
    fn name(&self) -> &'static str {
        "service_layer"
    }

    async fn validate(&self, query: &UnitQuery) -> Result<AuthorityVerdict, AuthorityError> {
        if let Some(row) = self.lookup(query, Some(&query.source_warehouse)).await? {
            return Ok(row.verdict(query, true));
        }

        match self.lookup(query, None).await? {
            Some(row) => {
                let mut verdict = row.verdict(query, false);
                verdict.available_in_source = false;
                Ok(verdict)
            }
            None => Ok(AuthorityVerdict::not_found()),
        }
    }

    fn supports_bulk(&self) -> bool {
        self.config.bulk_series_query.is_some()
    }

    async fn validate_bulk(
        &self,
        queries: &[UnitQuery],
    ) -> Result<Vec<AuthorityVerdict>, AuthorityError> {
        if let Some(name) = self.config.bulk_series_query.as_deref()
            && Self::bulk_compatible(queries)
        {
            return self.bulk_lookup(name, queries).await;
        }

        let mut verdicts = Vec::with_capacity(queries.len());
        for query in queries {
            verdicts.push(self.validate(query).await?);
        }
        Ok(verdicts)
    }
}
