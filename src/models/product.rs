//! # Product Model
//!
//! One row of a submitted batch. Created by intake, immutable afterwards.
//!
//! Maps to `imagebatch_products`; `position` preserves submission order so the export
//! lists products in the order the caller sent them.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, FromRow)]
pub struct Product {
    pub product_uuid: Uuid,
    pub batch_uuid: Uuid,
    pub serial: i64,
    pub name: String,
    pub position: i32,
    pub created_at: DateTime<Utc>,
}
