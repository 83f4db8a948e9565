pub mod call;
pub mod http;
pub mod traits;

pub use call::{Call, CallCanceller, CallOutcome};
pub use http::{HttpIngestion, HttpIngestionError};
pub use traits::{Ingestion, IngestionError};
