use crate::service::ServiceError;
use serde::Serialize;
use tracing::error;

pub const CONTENT_TYPE_JSON: &str = "application/json";
pub const CONTENT_TYPE_OCTET: &str = "application/octet-stream";

/// A protocol-shaped HTTP response, independent of the server library.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    pub status: u16,
    pub content_type: Option<&'static str>,
    pub body: Vec<u8>,
}

#[derive(Serialize)]
struct ErrorBody<'a> {
    error: &'a str,
}

impl Reply {
    pub fn empty(status: u16) -> Self {
        Self {
            status,
            content_type: None,
            body: Vec::new(),
        }
    }

    pub fn octet(data: Vec<u8>) -> Self {
        Self {
            status: 200,
            content_type: Some(CONTENT_TYPE_OCTET),
            body: data,
        }
    }

    pub fn json<T: Serialize>(status: u16, value: &T) -> Self {
        match serde_json::to_vec(value) {
            Ok(body) => Self {
                status,
                content_type: Some(CONTENT_TYPE_JSON),
                body,
            },
            Err(e) => {
                error!("failed to encode response: {e}");
                Self::error(500, "internal server error")
            }
        }
    }

    /// `{"error": msg}` with the given status.
    pub fn error(status: u16, msg: &str) -> Self {
        let body = serde_json::to_vec(&ErrorBody { error: msg })
            .unwrap_or_else(|_| br#"{"error":"internal server error"}"#.to_vec());
        Self {
            status,
            content_type: Some(CONTENT_TYPE_JSON),
            body,
        }
    }
}

impl ServiceError {
    pub fn status(&self) -> u16 {
        match self {
            ServiceError::NotFound(_) => 404,
            ServiceError::Conflict(_) => 423,
            ServiceError::LockMismatch(_) => 409,
            ServiceError::InvalidInput(_) => 400,
            ServiceError::Internal(_) => 500,
        }
    }
}

impl From<ServiceError> for Reply {
    fn from(err: ServiceError) -> Self {
        let status = err.status();
        match &err {
            // The holder's record is the body so the client can report who holds it.
            ServiceError::Conflict(held) | ServiceError::LockMismatch(held) => {
                Reply::json(status, held)
            }
            ServiceError::Internal(detail) => {
                error!("{detail}");
                Reply::error(status, "internal server error")
            }
            ServiceError::NotFound(_) | ServiceError::InvalidInput(_) => {
                Reply::error(status, &err.to_string())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nahcloud_store::LockRecord;

    fn body_json(reply: &Reply) -> serde_json::Value {
        serde_json::from_slice(&reply.body).unwrap()
    }

    #[test]
    fn conflict_carries_holder_record() {
        let held = LockRecord::new("r1").with_who("alice");
        let reply = Reply::from(ServiceError::Conflict(held));
        assert_eq!(reply.status, 423);
        assert_eq!(reply.content_type, Some(CONTENT_TYPE_JSON));
        let json = body_json(&reply);
        assert_eq!(json["ID"], "r1");
        assert_eq!(json["Who"], "alice");
    }

    #[test]
    fn mismatch_is_409_with_holder_record() {
        let reply = Reply::from(ServiceError::LockMismatch(LockRecord::new("r1")));
        assert_eq!(reply.status, 409);
        assert_eq!(body_json(&reply)["ID"], "r1");
    }

    #[test]
    fn internal_detail_is_not_leaked() {
        let reply = Reply::from(ServiceError::Internal("disk on fire at /srv".to_owned()));
        assert_eq!(reply.status, 500);
        assert_eq!(body_json(&reply)["error"], "internal server error");
    }

    #[test]
    fn client_errors_have_error_body() {
        let reply = Reply::from(ServiceError::InvalidInput("bad".to_owned()));
        assert_eq!(reply.status, 400);
        assert!(body_json(&reply)["error"]
            .as_str()
            .unwrap()
            .contains("bad"));

        let reply = Reply::from(ServiceError::NotFound("prod".to_owned()));
        assert_eq!(reply.status, 404);
        assert!(body_json(&reply)["error"]
            .as_str()
            .unwrap()
            .contains("prod"));
    }

    #[test]
    fn empty_reply_has_no_content_type() {
        let reply = Reply::empty(200);
        assert!(reply.body.is_empty());
        assert_eq!(reply.content_type, None);
    }
}
