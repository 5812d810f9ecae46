//! Service Layer stock transfer posting

use std::sync::Arc;

use async_trait::async_trait;
use chrono::NaiveDate;
use serde_json::{Value, json};
use tracing::{error, info, warn};

use super::{PostingAdapter, PostingError, PostingOutcome};
use crate::erp::{ErpError, ServiceLayerClient};
use crate::transfer::state::QcStatus;
use crate::transfer::types::{Tracking, TransferDocument, TransferLine, TransferUnit};

const STOCK_TRANSFERS: &str = "StockTransfers";

impl From<ErpError> for PostingError {
    fn from(e: ErpError) -> Self {
        match e {
            ErpError::Malformed(msg) => PostingError::Malformed(msg),
            other => PostingError::Transport(other.to_string()),
        }
    }
}

/// Journal memo identifying our document in the ERP
pub fn journal_memo(transfer_number: &str) -> String {
    format!("Serial Item Transfer - {}", transfer_number)
}

fn date(d: Option<NaiveDate>) -> Value {
    match d {
        Some(d) => Value::String(d.format("%Y-%m-%d").to_string()),
        None => Value::Null,
    }
}

fn postable_units(line: &TransferLine) -> impl Iterator<Item = &TransferUnit> {
    line.valid_units()
        .filter(|u| u.qc_status == QcStatus::Approved)
}

fn serial_entry(unit: &TransferUnit) -> Value {
    let identifier = unit.posting_identifier();
    json!({
        "InternalSerialNumber": identifier,
        "ManufacturerSerialNumber": identifier,
        "ManufactureDate": date(unit.dates.manufacture),
        "ExpiryDate": date(unit.dates.expiry),
        "ReceptionDate": date(unit.dates.admission),
    })
}

fn batch_entry(unit: &TransferUnit) -> Value {
    json!({
        "BatchNumber": unit.posting_identifier(),
        "Quantity": unit.quantity,
        "ManufacturingDate": date(unit.dates.manufacture),
        "ExpiryDate": date(unit.dates.expiry),
        "AddmisionDate": date(unit.dates.admission),
    })
}

/// Build the StockTransfers payload
pub fn build_payload(document: &TransferDocument) -> Value {
    let lines: Vec<Value> = document
        .lines
        .iter()
        .enumerate()
        .map(|(index, line)| {
            let units: Vec<&TransferUnit> = postable_units(line).collect();
            let quantity = units.iter().fold(0u32, |total, u| total.saturating_add(u.quantity));
            let mut entry = json!({
                "LineNum": index,
                "ItemCode": line.item_code,
                "Quantity": quantity,
                "FromWarehouseCode": document.source_warehouse,
                "WarehouseCode": document.destination_warehouse,
                "UoMCode": line.unit_of_measure,
            });
            let (key, numbers): (&str, Vec<Value>) = match line.tracking {
                Tracking::Serial => ("SerialNumbers", units.iter().map(|u| serial_entry(u)).collect()),
                Tracking::Batch => ("BatchNumbers", units.iter().map(|u| batch_entry(u)).collect()),
            };
            entry[key] = Value::Array(numbers);
            entry
        })
        .collect();

    json!({
        "DocDate": document.created_at.format("%Y-%m-%d").to_string(),
        "Comments": format!(
            "Serial Item Transfer {} - user {}",
            document.transfer_number, document.created_by
        ),
        "JournalMemo": journal_memo(&document.transfer_number),
        "FromWarehouse": document.source_warehouse,
        "ToWarehouse": document.destination_warehouse,
        "StockTransferLines": lines,
    })
}

/// Read `DocNum` (number or string)
fn doc_num(value: &Value) -> Option<String> {
    match value.get("DocNum")? {
        Value::Number(n) => Some(n.to_string()),
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        _ => None,
    }
}

/// Classify an HTTP answer to a posting request
fn classify(status: u16, body: &str) -> PostingOutcome {
    if (200..300).contains(&status) {
        let parsed = serde_json::from_str::<Value>(body).ok();
        return match parsed.as_ref().and_then(doc_num) {
            Some(reference) => PostingOutcome::Posted { reference },
            None => PostingOutcome::Unknown {
                error: format!("HTTP {} without DocNum", status),
            },
        };
    }
    match status {
        408 | 429 => PostingOutcome::Unknown {
            error: format!("HTTP {}: {}", status, body),
        },
        400..=499 => PostingOutcome::Rejected {
            error: body.trim().to_string(),
        },
        _ => PostingOutcome::Unknown {
            error: format!("HTTP {}: {}", status, body),
        },
    }
}

pub struct ServiceLayerPosting {
    client: Arc<ServiceLayerClient>,
}

impl ServiceLayerPosting {
    pub fn new(client: Arc<ServiceLayerClient>) -> Self {
        Self { client }
    }
}

#[async_trait]
impl PostingAdapter for ServiceLayerPosting {
    fn name(&self) -> &'static str {
        "service_layer"
    }

    async fn post(&self, document: &TransferDocument) -> PostingOutcome {
        let payload = build_payload(document);
        let outcome = match self.client.post_json(STOCK_TRANSFERS, &payload).await {
            Ok(response) => classify(response.status, &response.body),
            Err(e) => PostingOutcome::Unknown {
                error: e.to_string(),
            },
        };

        match &outcome {
            PostingOutcome::Posted { reference } => info!(
                transfer_number = %document.transfer_number,
                reference = %reference,
                "Stock transfer created"
            ),
            PostingOutcome::Rejected { error } => error!(
                transfer_number = %document.transfer_number,
                error = %error,
                "Stock transfer rejected by ERP"
            ),
            PostingOutcome::Unknown { error } => warn!(
                transfer_number = %document.transfer_number,
                error = %error,
                "Stock transfer outcome unknown"
            ),
        }
        outcome
    }

    async fn lookup(&self, transfer_number: &str) -> Result<Option<String>, PostingError> {
        let filter = format!(
            "JournalMemo eq '{}'",
            journal_memo(transfer_number).replace('\'', "''")
        );
        let response = self
            .client
            .get(STOCK_TRANSFERS, &[("$filter", filter.as_str()), ("$select", "DocNum")])
            .await?
            .error_for_status()?;
        let body: Value = response.json()?;

        Ok(body
            .get("value")
            .and_then(Value::as_array)
            .and_then(|rows| rows.first())
            .and_then(doc_num))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transfer::types::{AddLineUnits, NewDocument, UnitOutcome};

    fn approved_document() -> TransferDocument {
        let mut document = TransferDocument::new(7, &NewDocument::new("WH01", "WH02"));
        document.transfer_number = "SIT-20261014083005-AB12".into();

        let mut serial_line =
            TransferLine::new(document.id, &AddLineUnits::serials("SN-ITEM", 2, &["x"]));
        for id in ["SN-1", "SN-2", "SN-3"] {
            let mut unit = TransferUnit::new(serial_line.id, id, 1);
            unit.outcome = UnitOutcome::Valid;
            unit.qc_status = QcStatus::Approved;
            serial_line.units.push(unit);
        }
        serial_line.units[2].outcome = UnitOutcome::Invalid;
        serial_line.units[2].qc_status = QcStatus::Pending;
        serial_line.units[0].canonical_identifier = Some("SN-0001".into());

        let mut batch_spec = AddLineUnits::serials("RM-1", 5, &["x"]);
        batch_spec.tracking = Tracking::Batch;
        let mut batch_line = TransferLine::new(document.id, &batch_spec);
        let mut lot = TransferUnit::new(batch_line.id, "LOT-7", 5);
        lot.outcome = UnitOutcome::Valid;
        lot.qc_status = QcStatus::Approved;
        lot.dates.expiry = NaiveDate::from_ymd_opt(2027, 1, 31);
        batch_line.units.push(lot);

        document.lines = vec![serial_line, batch_line];
        document
    }

    #[test]
    fn test_payload_shape() {
        let payload = build_payload(&approved_document());
        assert_eq!(
            payload["JournalMemo"],
            "Serial Item Transfer - SIT-20261014083005-AB12"
        );
        assert_eq!(payload["FromWarehouse"], "WH01");
        assert_eq!(payload["ToWarehouse"], "WH02");

        let lines = payload["StockTransferLines"].as_array().unwrap();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0]["Quantity"], 2);
        let serials = lines[0]["SerialNumbers"].as_array().unwrap();
        assert_eq!(serials.len(), 2);
        assert_eq!(serials[0]["InternalSerialNumber"], "SN-0001");

        assert_eq!(lines[1]["Quantity"], 5);
        assert_eq!(lines[1]["BatchNumbers"][0]["BatchNumber"], "LOT-7");
        assert_eq!(lines[1]["BatchNumbers"][0]["ExpiryDate"], "2027-01-31");
        assert!(lines[1].get("SerialNumbers").is_none());
    }

    #[test]
    fn test_classify_outcomes() {
        assert_eq!(
            classify(201, r#"{"DocEntry":55,"DocNum":9001}"#),
            PostingOutcome::Posted {
                reference: "9001".into()
            }
        );
        assert!(matches!(
            classify(400, r#"{"error":{"message":{"value":"Quantity falls into negative inventory"}}}"#),
            PostingOutcome::Rejected { .. }
        ));
        assert!(matches!(classify(503, "busy"), PostingOutcome::Unknown { .. }));
        assert!(matches!(classify(429, ""), PostingOutcome::Unknown { .. }));
        assert!(matches!(classify(201, "not json"), PostingOutcome::Unknown { .. }));
    }

    #[test]
    fn test_doc_num_variants() {
        assert_eq!(doc_num(&json!({"DocNum": 12})), Some("12".into()));
        assert_eq!(doc_num(&json!({"DocNum": "A-12"})), Some("A-12".into()));
        assert_eq!(doc_num(&json!({"DocNum": null})), None);
    }
}
