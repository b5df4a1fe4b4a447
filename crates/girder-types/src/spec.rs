use crate::tenant::TenantId;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// How the spec was authored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SpecMode {
    /// Structured wizard input.
    Guided,
    /// Free-text goal description.
    Freeform,
    /// A structured plan document pasted or uploaded from elsewhere.
    Imported,
}

/// Opaque reference to an uploaded attachment blob.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttachmentRef {
    pub blob_id: String,
    pub filename: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_type: Option<String>,
}

/// The source-of-truth input for a build. Immutable once a plan has been
/// generated from it; owned by exactly one tenant.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Spec {
    pub id: String,
    pub tenant_id: TenantId,
    pub title: String,
    pub mode: SpecMode,
    #[serde(default)]
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub guided_input: Option<Value>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub attachments: Vec<AttachmentRef>,
    pub created_at: chrono::DateTime<chrono::Utc>,
}

impl Spec {
    pub fn new(tenant_id: TenantId, title: String, mode: SpecMode, description: String) -> Self {
        Self {
            id: crate::id::new_spec_id(),
            tenant_id,
            title,
            mode,
            description,
            guided_input: None,
            attachments: Vec::new(),
            created_at: chrono::Utc::now(),
        }
    }

    /// The text the plan parser sees: guided input is rendered ahead of the
    /// free-text description so structured fields win on conflict.
    pub fn plan_input(&self) -> String {
        match &self.guided_input {
            Some(value) => format!("{}\n{}", render_guided(value), self.description),
            None => self.description.clone(),
        }
    }
}

fn render_guided(value: &Value) -> String {
    match value {
        Value::Object(map) => map
            .iter()
            .map(|(k, v)| match v {
                Value::String(s) => format!("{}: {}", k, s),
                other => format!("{}: {}", k, other),
            })
            .collect::<Vec<_>>()
            .join("\n"),
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn plan_input_prepends_guided_fields() {
        let mut spec = Spec::new(
            TenantId::new("acme"),
            "site".into(),
            SpecMode::Guided,
            "make it fast".into(),
        );
        spec.guided_input = Some(json!({"goal": "landing page"}));
        let input = spec.plan_input();
        assert!(input.starts_with("goal: landing page"));
        assert!(input.ends_with("make it fast"));
    }
}
