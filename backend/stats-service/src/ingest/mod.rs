pub mod upload;
pub mod validator;

pub use upload::{IngestError, IngestService, UploadSummary};
pub use validator::{validate, Column, ColumnLayout, RowRejection};
