pub mod scale_parameters;
pub mod scale_record;

pub use scale_parameters::{Direction, ScaleDefaults, ScaleParameters, ScaleRequest};
pub use scale_record::{IdSequence, ScaleRecord, ScaleRecordMetadata, source_digest};
