//! Export artifact assembly: one CSV row per product, in submission order.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

use crate::constants::{EXPORT_HEADERS, LOCATION_DELIMITER};
use crate::models::{ImageUnit, Product};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExportRow {
    pub serial: i64,
    pub name: String,
    pub input_urls: Vec<String>,
    /// Positionally aligned with `input_urls`; empty where a unit produced no output
    pub output_urls: Vec<String>,
}

/// Join products with their units. `units` must be ordered within each product.
pub fn build_export_rows(products: &[Product], units: &[ImageUnit]) -> Vec<ExportRow> {
    let mut by_product: HashMap<Uuid, Vec<&ImageUnit>> = HashMap::new();
    for unit in units {
        by_product.entry(unit.product_uuid).or_default().push(unit);
    }

    products
        .iter()
        .map(|product| {
            let product_units = by_product
                .get(&product.product_uuid)
                .map(Vec::as_slice)
                .unwrap_or_default();
            ExportRow {
                serial: product.serial,
                name: product.name.clone(),
                input_urls: product_units.iter().map(|u| u.source_url.clone()).collect(),
                output_urls: product_units
                    .iter()
                    .map(|u| u.output_url.clone().unwrap_or_default())
                    .collect(),
            }
        })
        .collect()
}

fn join(urls: &[String]) -> String {
    urls.join(&LOCATION_DELIMITER.to_string())
}

/// Serialise rows as CSV with the export header
pub fn render_csv(rows: &[ExportRow]) -> Result<Vec<u8>, csv::Error> {
    let mut writer = csv::Writer::from_writer(Vec::new());
    writer.write_record(EXPORT_HEADERS)?;
    for row in rows {
        writer.write_record([
            row.serial.to_string(),
            row.name.clone(),
            join(&row.input_urls),
            join(&row.output_urls),
        ])?;
    }
    writer
        .into_inner()
        .map_err(|e| csv::Error::from(e.into_error()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state_machine::UnitState;
    use chrono::Utc;

    fn product(serial: i64, position: i32) -> Product {
        Product {
            product_uuid: Uuid::new_v4(),
            batch_uuid: Uuid::nil(),
            serial,
            name: format!("SKU{serial}"),
            position,
            created_at: Utc::now(),
        }
    }

    fn unit(product: &Product, source: &str, output: Option<&str>) -> ImageUnit {
        let now = Utc::now();
        ImageUnit {
            image_unit_uuid: Uuid::new_v4(),
            product_uuid: product.product_uuid,
            batch_uuid: Uuid::nil(),
            source_url: source.to_string(),
            output_url: output.map(str::to_string),
            status: if output.is_some() {
                UnitState::Completed
            } else {
                UnitState::Failed
            },
            error_message: None,
            attempts: 1,
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn test_rows_follow_product_order_and_align_outputs() {
        let a = product(1, 0);
        let b = product(2, 1);
        let c = product(3, 2);
        let units = vec![
            unit(&a, "http://x/1.png", Some("file:///o/1.png")),
            unit(&a, "http://x/2.png", None),
            unit(&b, "http://y/1.png", Some("file:///o/3.png")),
        ];

        let rows = build_export_rows(&[a, b, c], &units);
        assert_eq!(rows.len(), 3);
        assert_eq!(rows[0].output_urls, vec!["file:///o/1.png", ""]);
        assert_eq!(rows[1].input_urls, vec!["http://y/1.png"]);
        assert!(rows[2].input_urls.is_empty());
    }

    #[test]
    fn test_render_csv() {
        let rows = vec![ExportRow {
            serial: 1,
            name: "SKU1".to_string(),
            input_urls: vec!["http://x/1.png".to_string(), "http://x/2.png".to_string()],
            output_urls: vec!["file:///o/1.png".to_string(), String::new()],
        }];

        let csv = String::from_utf8(render_csv(&rows).unwrap()).unwrap();
        let mut lines = csv.lines();
        assert_eq!(
            lines.next(),
            Some("S. No.,Product Name,Input Image Urls,Output Image Urls")
        );
        assert_eq!(
            lines.next(),
            Some("1,SKU1,\"http://x/1.png,http://x/2.png\",\"file:///o/1.png,\"")
        );
    }
}
