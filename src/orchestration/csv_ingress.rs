//! # CSV Ingress
//!
//! Turns an uploaded product sheet into [`IntakeRow`]s. Only structure is checked here
//! (header present, required columns present, records decodable); per-row content is
//! validated by [`super::batch_intake`], which reports bad rows individually.
//!
//! ## Expected layout
//!
//! ```text
//! S. No.,Product Name,Input Image Urls
//! 1,SKU1,"https://a.test/1.jpg,https://a.test/2.jpg"
//! 2,SKU2,https://b.test/1.jpg
//! ```
//!
//! Header names are matched case-insensitively with punctuation and spacing ignored, so
//! `S. No.`, `s_no` and `SNo` all name the serial column.

use std::io::Read;

use serde::{Deserialize, Serialize};

use crate::constants::LOCATION_DELIMITER;
use crate::error::ValidationError;

/// One submitted product row before validation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IntakeRow {
    pub serial: String,
    pub name: String,
    pub image_locations: Vec<String>,
}

impl IntakeRow {
    pub fn new(
        serial: impl Into<String>,
        name: impl Into<String>,
        image_locations: impl IntoIterator<Item = impl Into<String>>,
    ) -> Self {
        Self {
            serial: serial.into(),
            name: name.into(),
            image_locations: image_locations.into_iter().map(Into::into).collect(),
        }
    }
}

const SERIAL_ALIASES: &[&str] = &["sno", "serial", "serialno", "serialnumber"];
const NAME_ALIASES: &[&str] = &["productname", "name", "product"];
const LOCATION_ALIASES: &[&str] = &[
    "inputimageurls",
    "inputimageurl",
    "imageurls",
    "imagelocations",
];

fn normalize_header(header: &str) -> String {
    header
        .chars()
        .filter(|c| c.is_alphanumeric())
        .flat_map(char::to_lowercase)
        .collect()
}

fn find_column(
    headers: &[String],
    aliases: &[&str],
    display_name: &str,
) -> Result<usize, ValidationError> {
    headers
        .iter()
        .position(|h| aliases.contains(&h.as_str()))
        .ok_or_else(|| ValidationError::MissingColumn {
            column: display_name.to_string(),
        })
}

/// Split a location cell on the delimiter, dropping blank fragments
pub fn split_locations(cell: &str) -> Vec<String> {
    cell.split(LOCATION_DELIMITER)
        .map(str::trim)
        .filter(|fragment| !fragment.is_empty())
        .map(str::to_string)
        .collect()
}

/// Parse a CSV product sheet. Fully blank records are skipped.
pub fn parse_batch_csv<R: Read>(reader: R) -> Result<Vec<IntakeRow>, ValidationError> {
    let mut csv_reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .flexible(true)
        .trim(csv::Trim::All)
        .from_reader(reader);

    let headers: Vec<String> = csv_reader
        .headers()?
        .iter()
        .map(normalize_header)
        .collect();
    if headers.iter().all(String::is_empty) {
        return Err(ValidationError::MalformedInput(
            "missing header row".to_string(),
        ));
    }

    let serial_idx = find_column(&headers, SERIAL_ALIASES, "S. No.")?;
    let name_idx = find_column(&headers, NAME_ALIASES, "Product Name")?;
    let location_idx = find_column(&headers, LOCATION_ALIASES, "Input Image Urls")?;

    let mut rows = Vec::new();
    for record in csv_reader.records() {
        let record = record?;
        if record.iter().all(str::is_empty) {
            continue;
        }
        rows.push(IntakeRow {
            serial: record.get(serial_idx).unwrap_or_default().to_string(),
            name: record.get(name_idx).unwrap_or_default().to_string(),
            image_locations: split_locations(record.get(location_idx).unwrap_or_default()),
        });
    }

    Ok(rows)
}
