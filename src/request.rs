use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use uuid::Uuid;

/// Rejections raised at the pipeline boundary. Everything past this point
/// degrades instead of failing.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum RequestError {
    #[error("missing scene source in request")]
    MissingSource,
    #[error("step index must be a positive integer")]
    InvalidStep,
}

/// Inbound payload before validation.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct RenderPayload {
    #[serde(default)]
    pub code: Option<String>,
    #[serde(default, alias = "message_id", alias = "messageId")]
    pub request_id: Option<String>,
    #[serde(default)]
    pub step: Option<u32>,
}

/// One accepted render call. Immutable once constructed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderRequest {
    request_id: String,
    step: u32,
    source: String,
}

impl RenderRequest {
    pub fn new(
        source: impl Into<String>,
        request_id: Option<&str>,
        step: Option<u32>,
    ) -> Result<Self, RequestError> {
        let source = source.into();
        if source.trim().is_empty() {
            return Err(RequestError::MissingSource);
        }
        let step = step.unwrap_or(1);
        if step == 0 {
            return Err(RequestError::InvalidStep);
        }
        let request_id = match request_id.map(str::trim).filter(|id| !id.is_empty()) {
            Some(id) => base_request_id(id).to_string(),
            None => Uuid::new_v4().to_string(),
        };
        Ok(Self {
            request_id,
            step,
            source,
        })
    }

    pub fn from_payload(payload: RenderPayload) -> Result<Self, RequestError> {
        let source = payload.code.ok_or(RequestError::MissingSource)?;
        Self::new(source, payload.request_id.as_deref(), payload.step)
    }

    pub fn request_id(&self) -> &str {
        &self.request_id
    }

    pub fn step(&self) -> u32 {
        self.step
    }

    pub fn source(&self) -> &str {
        &self.source
    }
}

/// Strips a trailing `_step<N>` suffix some clients append to the id.
pub fn base_request_id(id: &str) -> &str {
    match id.rfind("_step") {
        Some(idx) => {
            let digits = &id[idx + "_step".len()..];
            if idx > 0 && !digits.is_empty() && digits.bytes().all(|b| b.is_ascii_digit()) {
                &id[..idx]
            } else {
                id
            }
        }
        None => id,
    }
}

const MAX_VERBATIM_ID_LEN: usize = 64;

/// File- and URL-safe form of a request id, distinct for distinct ids.
/// Short ids of ASCII letters, digits, `-` and `_` are kept as they are;
/// anything else becomes `h.<sha256 hex>`, which contains a `.` and so can
/// never equal a verbatim id.
pub fn storage_id(id: &str) -> String {
    let verbatim = !id.is_empty()
        && id.len() <= MAX_VERBATIM_ID_LEN
        && id
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_');
    if verbatim {
        id.to_string()
    } else {
        format!("h.{:x}", Sha256::digest(id.as_bytes()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_blank_source() {
        assert_eq!(
            RenderRequest::new("   \n", Some("abc"), None),
            Err(RequestError::MissingSource)
        );
        assert_eq!(
            RenderRequest::from_payload(RenderPayload::default()),
            Err(RequestError::MissingSource)
        );
    }

    #[test]
    fn rejects_step_zero() {
        assert_eq!(
            RenderRequest::new("x", None, Some(0)),
            Err(RequestError::InvalidStep)
        );
    }

    #[test]
    fn generates_id_and_defaults_step() {
        let request = RenderRequest::new("x", None, None).unwrap();
        assert_eq!(request.step(), 1);
        assert!(Uuid::parse_str(request.request_id()).is_ok());
    }

    #[test]
    fn strips_step_suffix_from_id() {
        assert_eq!(base_request_id("42_step3"), "42");
        assert_eq!(base_request_id("my_stepper"), "my_stepper");
        assert_eq!(base_request_id("_step2"), "_step2");
        let request = RenderRequest::new("x", Some("chat-9_step2"), Some(2)).unwrap();
        assert_eq!(request.request_id(), "chat-9");
    }

    #[test]
    fn storage_ids_are_path_safe_and_distinct() {
        assert_eq!(storage_id("chat-9_a"), "chat-9_a");
        let ids = ["user:1", "user/1", "user_1", "../../x", ""];
        let encoded: Vec<String> = ids.iter().map(|id| storage_id(id)).collect();
        for (idx, name) in encoded.iter().enumerate() {
            assert!(!name.contains('/'), "{name}");
            assert!(!name.starts_with('.'), "{name}");
            assert!(encoded[idx + 1..].iter().all(|other| other != name));
        }
        let long = "a".repeat(300);
        assert_eq!(storage_id(&long).len(), 2 + 64);
    }

    #[test]
    fn payload_accepts_legacy_field_names() {
        let payload: RenderPayload =
            serde_json::from_str(r#"{"code":"x","messageId":"m1","step":4}"#).unwrap();
        let request = RenderRequest::from_payload(payload).unwrap();
        assert_eq!(request.request_id(), "m1");
        assert_eq!(request.step(), 4);
    }
}
