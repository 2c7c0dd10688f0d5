pub mod models;
pub mod service;

pub use models::{
    extract_cut_number, extract_teeth_from_context, extract_test_case_id, ApiError, ApiResult,
    AttachmentMeta, Observation, ObservationScope,
};
pub use service::{HttpInspectionApi, InspectionApi};
