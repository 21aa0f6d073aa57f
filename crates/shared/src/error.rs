use serde::{Deserialize, Serialize};

/// Error body shape the backend returns. Some routes use `error`, some use
/// `message`, some return a bare string; `best_message` flattens all of
/// them to something worth surfacing inline.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ApiErrorBody {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl ApiErrorBody {
    /// Picks the most useful human-readable message out of a failed
    /// response body, falling back to the raw text or the status code.
    pub fn best_message(status: u16, body: &str) -> String {
        if let Ok(parsed) = serde_json::from_str::<ApiErrorBody>(body) {
            if let Some(error) = parsed.error.filter(|e| !e.is_empty()) {
                return error;
            }
            if let Some(message) = parsed.message.filter(|m| !m.is_empty()) {
                return message;
            }
        }
        if let Ok(text) = serde_json::from_str::<String>(body) {
            if !text.is_empty() {
                return text;
            }
        }
        if !body.is_empty() {
            return body.to_string();
        }
        format!("request failed with status {status}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prefers_error_field_over_message() {
        let body = r#"{"error":"nope","message":"other"}"#;
        assert_eq!(ApiErrorBody::best_message(400, body), "nope");
    }

    #[test]
    fn unwraps_bare_json_strings() {
        assert_eq!(ApiErrorBody::best_message(400, r#""denied""#), "denied");
    }

    #[test]
    fn falls_back_to_raw_text_then_status() {
        assert_eq!(ApiErrorBody::best_message(500, "boom"), "boom");
        assert_eq!(
            ApiErrorBody::best_message(502, ""),
            "request failed with status 502"
        );
    }
}
