//! # Batch Intake & Decomposition
//!
//! Validates submitted rows and writes the whole batch graph (batch, products, image
//! units, expected total) in one store call. Nothing is dispatched here; the returned
//! [`Batch`] is handed to the dispatcher by the caller.
//!
//! Row faults reject only their row and are collected into the [`IntakeReport`]. The
//! batch as a whole is rejected only when there is nothing to accept.

use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, info, warn};
use url::Url;
use uuid::Uuid;

use super::csv_ingress::IntakeRow;
use crate::constants::events;
use crate::error::{Result, RowError, RowErrorReason, ValidationError};
use crate::events::{EventPublisher, LifecycleEvent};
use crate::logging::log_batch_operation;
use crate::models::{Batch, NewBatch, NewImageUnit, NewProduct};
use crate::store::BatchStore;

/// Synchronous answer to a submission; processing continues asynchronously
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IntakeReport {
    pub batch_uuid: Uuid,
    pub product_count: usize,
    pub unit_count: usize,
    pub row_errors: Vec<RowError>,
}

#[derive(Debug, Clone)]
pub struct BatchIntake {
    store: Arc<dyn BatchStore>,
    publisher: EventPublisher,
}

impl BatchIntake {
    pub fn new(store: Arc<dyn BatchStore>, publisher: EventPublisher) -> Self {
        Self { store, publisher }
    }

    /// Validate and persist a batch. Returns the stored batch with its report.
    pub async fn intake(
        &self,
        rows: &[IntakeRow],
        input_artifact: Option<String>,
    ) -> Result<(Batch, IntakeReport)> {
        let (new_batch, row_errors) = decompose(rows, input_artifact)?;

        let batch = self.store.create_batch(&new_batch).await?;
        let report = IntakeReport {
            batch_uuid: batch.batch_uuid,
            product_count: new_batch.products.len(),
            unit_count: batch.expected_total as usize,
            row_errors,
        };

        if !report.row_errors.is_empty() {
            warn!(
                batch_uuid = %batch.batch_uuid,
                rejected_rows = report.row_errors.len(),
                "Batch accepted with rejected rows"
            );
        }
        log_batch_operation(
            "intake",
            batch.batch_uuid,
            batch.status.as_str(),
            Some(&format!(
                "{} products, {} units",
                report.product_count, report.unit_count
            )),
        );
        self.publisher.publish(LifecycleEvent::batch(
            events::BATCH_SUBMITTED,
            batch.batch_uuid,
            json!({
                "product_count": report.product_count,
                "unit_count": report.unit_count,
                "rejected_rows": report.row_errors.len(),
            }),
        ));

        Ok((batch, report))
    }
}

/// Split rows into an accepted batch graph and per-row errors.
///
/// Serials are unique among accepted rows: a row whose serial repeats one already
/// accepted is rejected as a duplicate.
pub fn decompose(
    rows: &[IntakeRow],
    input_artifact: Option<String>,
) -> std::result::Result<(NewBatch, Vec<RowError>), ValidationError> {
    if rows.is_empty() {
        return Err(ValidationError::EmptyBatch);
    }

    let mut batch = NewBatch::new(input_artifact);
    let mut row_errors = Vec::new();
    let mut seen_serials = HashSet::new();

    for (index, row) in rows.iter().enumerate() {
        let row_number = index + 1;
        match validate_row(row, &seen_serials) {
            Ok((serial, name, locations)) => {
                seen_serials.insert(serial);
                batch.products.push(NewProduct {
                    product_uuid: Uuid::new_v4(),
                    serial,
                    name,
                    position: batch.products.len() as i32,
                    units: locations
                        .into_iter()
                        .map(|source_url| NewImageUnit {
                            image_unit_uuid: Uuid::new_v4(),
                            source_url,
                        })
                        .collect(),
                });
            }
            Err(reason) => {
                debug!(row = row_number, reason = %reason, "Row rejected");
                row_errors.push(RowError {
                    row: row_number,
                    serial: Some(row.serial.trim().to_string()).filter(|s| !s.is_empty()),
                    reason,
                });
            }
        }
    }

    if batch.products.is_empty() {
        return Err(ValidationError::AllRowsRejected { row_errors });
    }

    info!(
        batch_uuid = %batch.batch_uuid,
        products = batch.products.len(),
        units = batch.expected_total(),
        "📋 Batch decomposed"
    );
    Ok((batch, row_errors))
}

fn validate_row(
    row: &IntakeRow,
    seen_serials: &HashSet<i64>,
) -> std::result::Result<(i64, String, Vec<String>), RowErrorReason> {
    let raw_serial = row.serial.trim();
    let serial = raw_serial
        .parse::<i64>()
        .ok()
        .filter(|s| *s > 0)
        .ok_or_else(|| RowErrorReason::MalformedSerial {
            value: raw_serial.to_string(),
        })?;
    if seen_serials.contains(&serial) {
        return Err(RowErrorReason::DuplicateSerial {
            value: raw_serial.to_string(),
        });
    }

    let name = row.name.trim();
    if name.is_empty() {
        return Err(RowErrorReason::BlankName);
    }

    let locations = row
        .image_locations
        .iter()
        .map(|location| validate_location(location.trim()))
        .collect::<std::result::Result<Vec<_>, _>>()?;

    Ok((serial, name.to_string(), locations))
}

fn validate_location(location: &str) -> std::result::Result<String, RowErrorReason> {
    let malformed = |detail: &str| RowErrorReason::MalformedLocation {
        location: location.to_string(),
        detail: detail.to_string(),
    };

    let url = Url::parse(location).map_err(|e| malformed(&e.to_string()))?;
    if !matches!(url.scheme(), "http" | "https") {
        return Err(malformed("scheme must be http or https"));
    }
    if url.host_str().is_none() {
        return Err(malformed("missing host"));
    }
    Ok(location.to_string())
}
