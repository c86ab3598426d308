//! # Worker
//!
//! Everything that runs on the consuming side of the queue: the per-unit
//! [`ImageProcessor`], the collaborators it is built from ([`SourceFetcher`],
//! [`ImageTransform`], [`OutputStore`]) and the lane-polling [`WorkerPool`].

pub mod fetcher;
pub mod image_processor;
pub mod output_store;
pub mod transform;
pub mod worker_pool;

pub use fetcher::{FetchedImage, HttpSourceFetcher, SourceFetcher};
pub use image_processor::{ImageProcessor, ProcessingOutcome};
pub use output_store::{FilesystemOutputStore, OutputStore};
pub use transform::{DownscaleTransform, ImageTransform, TransformedImage};
pub use worker_pool::{MessageDisposition, WorkerPool, WorkerPoolHandle};
