//! Privileged Request Protocol
//!
//! One JSON object per line in each direction. A request carries an id, a
//! method and a method-specific payload; the matching response carries the
//! same id and either a payload or an error envelope.

use crate::domain::ports::{FormatRequest, PrepareRequest};
use crate::error::{Error, Result};
use crate::storage::ProviderSpec;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

// =============================================================================
// Methods and Payloads
// =============================================================================

/// Privileged operations the helper understands
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Method {
    /// Liveness check, answered by the helper itself
    Ping,
    BdevScan,
    BdevPrepare,
    BdevFormat,
    ScmScan,
    ScmPrepare,
    ScmFormat,
}

impl Method {
    /// The method naming an operation on a provider
    pub fn for_call(spec: &ProviderSpec, op: &Operation) -> Self {
        match (spec.is_bdev(), op) {
            (true, Operation::Scan) => Method::BdevScan,
            (true, Operation::Prepare(_)) => Method::BdevPrepare,
            (true, Operation::Format(_)) => Method::BdevFormat,
            (false, Operation::Scan) => Method::ScmScan,
            (false, Operation::Prepare(_)) => Method::ScmPrepare,
            (false, Operation::Format(_)) => Method::ScmFormat,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Method::Ping => "Ping",
            Method::BdevScan => "BdevScan",
            Method::BdevPrepare => "BdevPrepare",
            Method::BdevFormat => "BdevFormat",
            Method::ScmScan => "ScmScan",
            Method::ScmPrepare => "ScmPrepare",
            Method::ScmFormat => "ScmFormat",
        }
    }
}

impl std::fmt::Display for Method {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Provider operation with its arguments
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", content = "request", rename_all = "lowercase")]
pub enum Operation {
    Scan,
    Prepare(PrepareRequest),
    Format(FormatRequest),
}

/// Payload of every provider method: which provider to build and what to run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderCall {
    pub spec: ProviderSpec,
    pub op: Operation,
}

impl ProviderCall {
    pub fn method(&self) -> Method {
        Method::for_call(&self.spec, &self.op)
    }
}

// =============================================================================
// Envelopes
// =============================================================================

/// Request sent to the helper
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PrivilegedRequest {
    pub id: u64,
    pub method: Method,
    #[serde(default)]
    pub payload: Value,
}

impl PrivilegedRequest {
    pub fn new(id: u64, method: Method, payload: Value) -> Self {
        Self {
            id,
            method,
            payload,
        }
    }

    /// Build a provider request with its method derived from the call
    pub fn call(id: u64, call: &ProviderCall) -> Result<Self> {
        Ok(Self::new(id, call.method(), serde_json::to_value(call)?))
    }
}

/// Successful response from the helper or the local handler
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PrivilegedResponse {
    pub id: u64,
    pub payload: Value,
}

impl PrivilegedResponse {
    pub fn new(id: u64, payload: Value) -> Self {
        Self { id, payload }
    }

    /// Decode the payload into the type the method returns
    pub fn decode<T: DeserializeOwned>(self) -> Result<T> {
        decode_payload(self.payload)
    }
}

/// Category of an error reported by the helper
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RemoteErrorKind {
    Provider,
    Privilege,
    Configuration,
    Protocol,
    Internal,
}

/// Error envelope carried back over the channel
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteError {
    pub kind: RemoteErrorKind,
    pub message: String,
    /// Provider that raised the error
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
}

impl From<&Error> for RemoteError {
    fn from(err: &Error) -> Self {
        let (kind, message, source) = match err {
            Error::Provider { provider, reason } => {
                (RemoteErrorKind::Provider, reason.clone(), Some(provider.clone()))
            }
            Error::Privilege { operation } => (RemoteErrorKind::Privilege, operation.clone(), None),
            Error::Configuration(msg) => (RemoteErrorKind::Configuration, msg.clone(), None),
            Error::Protocol(msg) => (RemoteErrorKind::Protocol, msg.clone(), None),
            other => (RemoteErrorKind::Internal, other.to_string(), None),
        };
        Self {
            kind,
            message,
            source,
        }
    }
}

impl RemoteError {
    /// Rebuild the error on the caller side
    pub fn into_error(self, helper: &str) -> Error {
        match self.kind {
            RemoteErrorKind::Provider => Error::Provider {
                provider: self.source.unwrap_or_else(|| helper.to_string()),
                reason: self.message,
            },
            RemoteErrorKind::Privilege => Error::Privilege {
                operation: self.message,
            },
            RemoteErrorKind::Configuration => Error::Configuration(self.message),
            RemoteErrorKind::Protocol => Error::Protocol(self.message),
            RemoteErrorKind::Internal => Error::Provider {
                provider: helper.to_string(),
                reason: self.message,
            },
        }
    }
}

/// Response line as it appears on the wire
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WireResponse {
    pub id: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<RemoteError>,
}

impl WireResponse {
    pub fn ok(id: u64, payload: Value) -> Self {
        Self {
            id,
            payload: Some(payload),
            error: None,
        }
    }

    pub fn err(id: u64, err: &Error) -> Self {
        Self {
            id,
            payload: None,
            error: Some(err.into()),
        }
    }
}

// =============================================================================
// Line Codec
// =============================================================================

/// Serialize a message as a single line, newline included
pub fn encode_line<T: Serialize>(message: &T) -> Result<String> {
    let mut line = serde_json::to_string(message)?;
    line.push('\n');
    Ok(line)
}

pub fn decode_request(line: &str) -> Result<PrivilegedRequest> {
    serde_json::from_str(line.trim_end())
        .map_err(|e| Error::Protocol(format!("malformed request: {}", e)))
}

/// Decode a response line for the request `expected_id`
///
/// A helper-reported error comes back as `Err` with its original category;
/// anything unparseable or mismatched is a protocol error.
pub fn decode_response(line: &str, expected_id: u64, helper: &str) -> Result<PrivilegedResponse> {
    let wire: WireResponse = serde_json::from_str(line.trim_end())
        .map_err(|e| Error::Protocol(format!("malformed response: {}", e)))?;

    if wire.id != expected_id {
        return Err(Error::Protocol(format!(
            "response id {} does not match request id {}",
            wire.id, expected_id
        )));
    }

    match (wire.payload, wire.error) {
        (_, Some(err)) => Err(err.into_error(helper)),
        (Some(payload), None) => Ok(PrivilegedResponse::new(wire.id, payload)),
        (None, None) => Err(Error::Protocol(format!(
            "response {} has neither payload nor error",
            wire.id
        ))),
    }
}

pub fn decode_payload<T: DeserializeOwned>(payload: Value) -> Result<T> {
    serde_json::from_value(payload).map_err(|e| Error::Protocol(format!("unexpected payload: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BdevConfig;
    use crate::domain::ports::BdevClass;
    use assert_matches::assert_matches;
    use serde_json::json;

    fn nvme_spec() -> ProviderSpec {
        ProviderSpec::Bdev(BdevConfig {
            class: Some(BdevClass::Nvme),
            device_list: vec!["0000:81:00.0".into()],
            ..Default::default()
        })
    }

    #[test]
    fn test_method_for_call() {
        assert_eq!(Method::for_call(&nvme_spec(), &Operation::Scan), Method::BdevScan);
        assert_eq!(
            Method::for_call(&ProviderSpec::Scm, &Operation::Format(FormatRequest::default())),
            Method::ScmFormat
        );
        assert_eq!(Method::ScmPrepare.to_string(), "ScmPrepare");
    }

    #[test]
    fn test_request_line() {
        let call = ProviderCall {
            spec: ProviderSpec::Scm,
            op: Operation::Prepare(PrepareRequest {
                reset: true,
                ..Default::default()
            }),
        };
        let req = PrivilegedRequest::call(7, &call).unwrap();
        let line = encode_line(&req).unwrap();
        assert!(line.ends_with('\n'));
        assert_eq!(line.matches('\n').count(), 1);

        let decoded = decode_request(&line).unwrap();
        assert_eq!(decoded.id, 7);
        assert_eq!(decoded.method, Method::ScmPrepare);
        let back: ProviderCall = decode_payload(decoded.payload).unwrap();
        assert_eq!(back, call);
    }

    #[test]
    fn test_decode_response_payload() {
        let line = r#"{"id":3,"payload":{"prepared":["a"],"reboot_required":false}}"#;
        let resp = decode_response(line, 3, "storage_admin").unwrap();
        assert_eq!(resp.payload["prepared"], json!(["a"]));
    }

    #[test]
    fn test_decode_response_errors() {
        assert_matches!(
            decode_response("not json", 1, "storage_admin"),
            Err(Error::Protocol(_))
        );
        assert_matches!(
            decode_response(r#"{"id":2,"payload":{}}"#, 1, "storage_admin"),
            Err(Error::Protocol(msg)) if msg.contains("does not match")
        );
        assert_matches!(
            decode_response(r#"{"id":1}"#, 1, "storage_admin"),
            Err(Error::Protocol(_))
        );
    }

    #[test]
    fn test_remote_error_preserves_category() {
        let original = Error::provider("bdev-nvme", "namespace busy");
        let line = encode_line(&WireResponse::err(4, &original)).unwrap();

        assert_matches!(
            decode_response(&line, 4, "storage_admin"),
            Err(Error::Provider { provider, reason }) if provider == "bdev-nvme" && reason == "namespace busy"
        );

        let denied = encode_line(&WireResponse::err(5, &Error::privilege("scm format"))).unwrap();
        assert_matches!(
            decode_response(&denied, 5, "storage_admin"),
            Err(Error::Privilege { operation }) if operation == "scm format"
        );
    }

    #[test]
    fn test_internal_error_attributed_to_helper() {
        let io = Error::Io(std::io::Error::new(std::io::ErrorKind::Other, "disk gone"));
        let line = encode_line(&WireResponse::err(9, &io)).unwrap();
        assert_matches!(
            decode_response(&line, 9, "storage_admin"),
            Err(Error::Provider { provider, .. }) if provider == "storage_admin"
        );
    }

    #[test]
    fn test_decode_payload_mismatch() {
        let result: Result<ProviderCall> = decode_payload(json!({"spec": 3}));
        assert_matches!(result, Err(Error::Protocol(_)));
    }
}
