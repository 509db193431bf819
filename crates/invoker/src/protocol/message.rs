//! Request and response envelopes.

use std::fmt;
use std::time::Duration;

use ares_registry::ServiceDescriptor;
use bytes::Bytes;
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::protocol::Serialization;

/// Which side of an exchange an envelope belongs to.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum EnvelopeKind {
    /// Outbound call.
    Request,
    /// Inbound reply.
    Response,
}

impl fmt::Display for EnvelopeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Request => f.write_str("request"),
            Self::Response => f.write_str("response"),
        }
    }
}

/// Anything that travels inside one frame.
pub trait Envelope: Serialize + DeserializeOwned + Send + 'static {
    /// Kind of this envelope.
    const KIND: EnvelopeKind;

    /// Id correlating the request with its response.
    fn correlation_id(&self) -> Uuid;
}

/// One outbound call.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct InvocationRequest {
    /// Unique per outstanding call.
    pub correlation_id: Uuid,
    /// Remote service being called.
    pub target_service: ServiceDescriptor,
    /// Remote operation.
    pub method_name: String,
    /// Serialized arguments, in order.
    pub arguments: Vec<Bytes>,
    /// Invoking application.
    pub caller_application_name: String,
    /// How long the caller waits. Zero means the configured default.
    pub timeout_millis: u64,
}

impl InvocationRequest {
    /// Create a request with a fresh correlation id and no arguments.
    pub fn new(target_service: ServiceDescriptor, method_name: impl Into<String>) -> Self {
        Self {
            correlation_id: Uuid::new_v4(),
            target_service,
            method_name: method_name.into(),
            arguments: Vec::new(),
            caller_application_name: String::new(),
            timeout_millis: 0,
        }
    }

    /// Append an already serialized argument.
    #[must_use]
    pub fn arg(mut self, argument: impl Into<Bytes>) -> Self {
        self.arguments.push(argument.into());
        self
    }

    /// Serialize and append an argument.
    ///
    /// # Errors
    ///
    /// Returns an error if the value cannot be serialized.
    pub fn arg_value<T: Serialize>(mut self, serialization: Serialization, value: &T) -> Result<Self> {
        self.arguments.push(serialization.serialize(value)?);
        Ok(self)
    }

    /// Set the calling application.
    #[must_use]
    pub fn caller(mut self, app_name: impl Into<String>) -> Self {
        self.caller_application_name = app_name.into();
        self
    }

    /// Set the call timeout.
    #[must_use]
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout_millis = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX);
        self
    }

    /// Effective timeout, falling back to `default` when unset.
    #[must_use]
    pub const fn effective_timeout(&self, default: Duration) -> Duration {
        if self.timeout_millis == 0 {
            default
        } else {
            Duration::from_millis(self.timeout_millis)
        }
    }
}

impl Envelope for InvocationRequest {
    const KIND: EnvelopeKind = EnvelopeKind::Request;

    fn correlation_id(&self) -> Uuid {
        self.correlation_id
    }
}

/// Wire-level outcome of a call.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub enum ResponseStatus {
    /// The method returned normally.
    Success,
    /// The method failed on the provider.
    RemoteException,
    /// The provider could not decode or dispatch the request.
    ProtocolError,
}

/// Error information carried inside a response.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct ErrorInfo {
    /// Error code for categorization.
    pub code: String,
    /// Human-readable error message.
    pub message: String,
}

impl ErrorInfo {
    /// Create error information.
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
        }
    }
}

/// One inbound reply.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct InvocationResponse {
    /// Echo of the request's correlation id.
    pub correlation_id: Uuid,
    /// Wire-level status.
    pub status: ResponseStatus,
    /// Serialized return value on success.
    pub result: Option<Bytes>,
    /// Failure cause otherwise.
    pub error: Option<ErrorInfo>,
}

impl InvocationResponse {
    /// Successful reply.
    pub fn success(correlation_id: Uuid, result: impl Into<Bytes>) -> Self {
        Self {
            correlation_id,
            status: ResponseStatus::Success,
            result: Some(result.into()),
            error: None,
        }
    }

    /// The remote method failed.
    pub fn remote_exception(correlation_id: Uuid, error: ErrorInfo) -> Self {
        Self {
            correlation_id,
            status: ResponseStatus::RemoteException,
            result: None,
            error: Some(error),
        }
    }

    /// The provider rejected the request.
    pub fn protocol_error(correlation_id: Uuid, message: impl Into<String>) -> Self {
        Self {
            correlation_id,
            status: ResponseStatus::ProtocolError,
            result: None,
            error: Some(ErrorInfo::new("PROTOCOL", message)),
        }
    }

    /// Whether the remote method returned normally.
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.status == ResponseStatus::Success
    }

    /// Unwrap the return value, turning a remote failure into an error.
    ///
    /// # Errors
    ///
    /// Returns `Error::Remote` for a remote exception and `Error::Protocol` for
    /// a provider-side protocol failure.
    pub fn into_result(self) -> Result<Bytes> {
        match self.status {
            ResponseStatus::Success => Ok(self.result.unwrap_or_default()),
            ResponseStatus::RemoteException => Err(Error::Remote(
                self.error
                    .unwrap_or_else(|| ErrorInfo::new("UNKNOWN", "remote failure")),
            )),
            ResponseStatus::ProtocolError => Err(crate::error::ProtocolError::Rejected(
                self.error.map(|e| e.message).unwrap_or_default(),
            )
            .into()),
        }
    }

    /// Decode the return value.
    ///
    /// # Errors
    ///
    /// Returns the remote failure, or a codec error if the value has another shape.
    pub fn into_value<T: DeserializeOwned>(self, serialization: Serialization) -> Result<T> {
        let bytes = self.into_result()?;
        serialization.deserialize(&bytes)
    }
}

impl Envelope for InvocationResponse {
    const KIND: EnvelopeKind = EnvelopeKind::Response;

    fn correlation_id(&self) -> Uuid {
        self.correlation_id
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_requests_get_distinct_ids() {
        let svc = ServiceDescriptor::new("echo");
        let a = InvocationRequest::new(svc.clone(), "say");
        let b = InvocationRequest::new(svc, "say");
        assert_ne!(a.correlation_id, b.correlation_id);
    }

    #[test]
    fn test_effective_timeout() {
        let default = Duration::from_secs(3);
        let req = InvocationRequest::new(ServiceDescriptor::new("echo"), "say");
        assert_eq!(req.effective_timeout(default), default);

        let req = req.timeout(Duration::from_millis(250));
        assert_eq!(req.effective_timeout(default), Duration::from_millis(250));
    }

    #[test]
    fn test_into_result_maps_status() {
        let id = Uuid::new_v4();
        assert_eq!(
            InvocationResponse::success(id, Bytes::from_static(b"ok"))
                .into_result()
                .unwrap(),
            Bytes::from_static(b"ok")
        );

        let remote = InvocationResponse::remote_exception(id, ErrorInfo::new("NPE", "null"));
        assert!(matches!(remote.into_result(), Err(Error::Remote(info)) if info.code == "NPE"));

        let rejected = InvocationResponse::protocol_error(id, "bad frame");
        assert!(matches!(rejected.into_result(), Err(Error::Protocol(_))));
    }

    #[test]
    fn test_typed_arguments_and_result() {
        let ser = Serialization::Cbor;
        let req = InvocationRequest::new(ServiceDescriptor::new("math"), "add")
            .arg_value(ser, &2_i64)
            .unwrap()
            .arg_value(ser, &3_i64)
            .unwrap();
        assert_eq!(req.arguments.len(), 2);

        let sum: i64 = ser.deserialize(&req.arguments[0]).unwrap();
        assert_eq!(sum, 2);

        let resp = InvocationResponse::success(req.correlation_id, ser.serialize(&5_i64).unwrap());
        assert_eq!(resp.into_value::<i64>(ser).unwrap(), 5);
    }
}
