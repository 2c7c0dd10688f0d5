use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ObservationScope {
    /// Blank received from the supplier, before any cutting
    Incoming,
    Cut,
}

impl ObservationScope {
    /// A missing or zero cut number means an incoming inspection
    pub fn for_cut(cut_number: Option<u32>) -> Self {
        match cut_number {
            None | Some(0) => ObservationScope::Incoming,
            Some(_) => ObservationScope::Cut,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ObservationScope::Incoming => "incoming",
            ObservationScope::Cut => "cut",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Observation {
    pub id: u64,
    pub test_case_id: u64,
    pub scope: ObservationScope,
    pub cut_number: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttachmentMeta {
    pub id: Option<u64>,
    pub observation_id: u64,
    pub tag: u32,
    pub file_name: String,
}

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("Request failed with status {status}: {body}")]
    Status { status: u16, body: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON parsing error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Parse error: {0}")]
    Parse(#[from] anyhow::Error),
}

pub type ApiResult<T> = Result<T, ApiError>;

fn lookup<'a>(value: &'a Value, path: &[&str]) -> ApiResult<&'a Value> {
    path.iter().try_fold(value, |node, key| {
        node.get(key)
            .ok_or_else(|| anyhow::anyhow!("Missing expected key in context JSON: {}", path.join(".")).into())
    })
}

/// Tooth count from `sample.design.attribute_values["Number of Teeth"]`
pub fn extract_teeth_from_context(ctx: &Value) -> ApiResult<u32> {
    let teeth = lookup(ctx, &["sample", "design", "attribute_values", "Number of Teeth"])?;
    let teeth = teeth
        .as_f64()
        .ok_or_else(|| anyhow::anyhow!("Number of Teeth is not numeric: {}", teeth))?;
    if teeth < 1.0 || teeth > f64::from(u32::MAX) {
        return Err(anyhow::anyhow!("Invalid teeth count: {}", teeth).into());
    }
    Ok(teeth as u32)
}

pub fn extract_test_case_id(ctx: &Value) -> ApiResult<u64> {
    let id = lookup(ctx, &["test_case", "id"])?;
    id.as_u64()
        .ok_or_else(|| anyhow::anyhow!("test_case.id is not an integer: {}", id).into())
}

pub fn extract_cut_number(ctx: &Value) -> Option<u32> {
    ctx.get("test_case")?
        .get("cut_number")?
        .as_u64()
        .and_then(|n| u32::try_from(n).ok())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn context(teeth: Value) -> Value {
        json!({
            "sample": { "design": { "attribute_values": { "Number of Teeth": teeth } } },
            "test_case": { "id": 812, "cut_number": 3 }
        })
    }

    #[test]
    fn teeth_accepts_integral_numbers() {
        assert_eq!(extract_teeth_from_context(&context(json!(72))).expect("teeth"), 72);
        assert_eq!(extract_teeth_from_context(&context(json!(48.0))).expect("teeth"), 48);
    }

    #[test]
    fn teeth_rejects_missing_text_and_non_positive() {
        assert!(extract_teeth_from_context(&json!({ "sample": {} })).is_err());
        assert!(extract_teeth_from_context(&context(json!("72"))).is_err());
        assert!(extract_teeth_from_context(&context(json!(0))).is_err());
        assert!(extract_teeth_from_context(&context(json!(-4))).is_err());
    }

    #[test]
    fn test_case_fields() {
        let ctx = context(json!(72));
        assert_eq!(extract_test_case_id(&ctx).expect("id"), 812);
        assert_eq!(extract_cut_number(&ctx), Some(3));
        assert_eq!(extract_cut_number(&json!({ "test_case": { "id": 1 } })), None);
    }

    #[test]
    fn scope_from_cut_number() {
        assert_eq!(ObservationScope::for_cut(None), ObservationScope::Incoming);
        assert_eq!(ObservationScope::for_cut(Some(0)), ObservationScope::Incoming);
        assert_eq!(ObservationScope::for_cut(Some(2)), ObservationScope::Cut);
    }
}
