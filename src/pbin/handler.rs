//! Request Handlers
//!
//! The same request is executed either in-process (forwarding not needed)
//! or inside the helper after it has been read off the channel.

use super::protocol::{
    decode_payload, decode_request, encode_line, Method, Operation, PrivilegedRequest,
    PrivilegedResponse, ProviderCall, WireResponse,
};
use crate::domain::ports::{StorageProviderRef, SystemExtRef};
use crate::error::{Error, Result};
use crate::storage::{ProviderFactory, ProviderSpec};
use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, warn};

/// Executes privileged requests
#[async_trait]
pub trait RequestHandler: Send + Sync {
    async fn handle(&self, request: &PrivilegedRequest) -> Result<PrivilegedResponse>;
}

/// Runs requests against an already-built provider in this process
pub struct LocalHandler {
    provider: StorageProviderRef,
}

impl LocalHandler {
    pub fn new(provider: StorageProviderRef) -> Self {
        Self { provider }
    }
}

#[async_trait]
impl RequestHandler for LocalHandler {
    async fn handle(&self, request: &PrivilegedRequest) -> Result<PrivilegedResponse> {
        let provider = self.provider.clone();
        execute(request, move |_| Ok(provider)).await
    }
}

/// Builds a provider per request from the spec it carries; used by the helper
pub struct HelperDispatcher {
    ext: SystemExtRef,
}

impl HelperDispatcher {
    pub fn new(ext: SystemExtRef) -> Self {
        Self { ext }
    }
}

#[async_trait]
impl RequestHandler for HelperDispatcher {
    async fn handle(&self, request: &PrivilegedRequest) -> Result<PrivilegedResponse> {
        let ext = self.ext.clone();
        execute(request, move |spec| ProviderFactory::create(spec, ext)).await
    }
}

async fn execute<F>(request: &PrivilegedRequest, provider_for: F) -> Result<PrivilegedResponse>
where
    F: FnOnce(&ProviderSpec) -> Result<StorageProviderRef> + Send,
{
    if request.method == Method::Ping {
        return Ok(PrivilegedResponse::new(request.id, pong()));
    }

    let call: ProviderCall = decode_payload(request.payload.clone())?;
    if call.method() != request.method {
        return Err(Error::Protocol(format!(
            "method {} does not match payload for {}",
            request.method,
            call.method()
        )));
    }

    let provider = provider_for(&call.spec)?;
    debug!(id = request.id, method = %request.method, provider = %provider.name(), "Executing request");

    let payload = match &call.op {
        Operation::Scan => serde_json::to_value(provider.scan().await?)?,
        Operation::Prepare(req) => serde_json::to_value(provider.prepare(req).await?)?,
        Operation::Format(req) => serde_json::to_value(provider.format(req).await?)?,
    };
    Ok(PrivilegedResponse::new(request.id, payload))
}

fn pong() -> Value {
    json!({ "name": crate::NAME, "version": crate::VERSION })
}

/// Answer requests line by line until the reader reaches end of input
///
/// Every request gets exactly one response line. Returns the number of
/// requests answered.
pub async fn serve<R, W, H>(reader: R, mut writer: W, handler: &H) -> Result<usize>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
    H: RequestHandler + ?Sized,
{
    let mut lines = reader.lines();
    let mut served = 0;

    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }

        let reply = match decode_request(&line) {
            Ok(request) => match handler.handle(&request).await {
                Ok(response) => WireResponse::ok(response.id, response.payload),
                Err(e) => {
                    warn!(id = request.id, method = %request.method, error = %e, "Request failed");
                    WireResponse::err(request.id, &e)
                }
            },
            Err(e) => {
                warn!(error = %e, "Rejecting malformed request");
                WireResponse::err(0, &e)
            }
        };

        writer.write_all(encode_line(&reply)?.as_bytes()).await?;
        writer.flush().await?;
        served += 1;
    }

    Ok(served)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::ports::{
        DeviceInfo, FormatRequest, Inventory, PrepareRequest, ScmClass, StorageClass,
    };
    use crate::pbin::protocol::decode_response;
    use crate::storage::{MockOp, MockProvider};
    use crate::system::MockExt;
    use assert_matches::assert_matches;
    use std::sync::Arc;
    use tokio::io::BufReader;

    fn scm_call(op: Operation) -> PrivilegedRequest {
        PrivilegedRequest::call(
            1,
            &ProviderCall {
                spec: ProviderSpec::Scm,
                op,
            },
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_local_handler_scan() {
        let mock = MockProvider::new("mock-scm", StorageClass::Scm(ScmClass::Ram))
            .with_devices(vec![DeviceInfo::bare("/dev/pmem0")]);
        let handler = LocalHandler::new(Arc::new(mock));

        let resp = handler.handle(&scm_call(Operation::Scan)).await.unwrap();
        let inv: Inventory = resp.decode().unwrap();
        assert_eq!(inv.devices.len(), 1);
    }

    #[tokio::test]
    async fn test_method_payload_mismatch() {
        let handler = LocalHandler::new(Arc::new(MockProvider::new(
            "mock-scm",
            StorageClass::Scm(ScmClass::Ram),
        )));
        let mut req = scm_call(Operation::Scan);
        req.method = Method::BdevFormat;

        assert_matches!(handler.handle(&req).await, Err(Error::Protocol(_)));
    }

    #[tokio::test]
    async fn test_dispatcher_privilege_error() {
        // Helper running without privilege reports it rather than failing silently
        let handler = HelperDispatcher::new(Arc::new(MockExt::new(false)));
        let req = scm_call(Operation::Format(FormatRequest {
            mount_point: Some("/mnt/storctl".into()),
            ..Default::default()
        }));

        assert_matches!(handler.handle(&req).await, Err(Error::Privilege { .. }));
    }

    #[tokio::test]
    async fn test_serve_answers_each_line() {
        let mock = Arc::new(MockProvider::new("mock-scm", StorageClass::Scm(ScmClass::Ram)));
        mock.fail(MockOp::Prepare, "region locked");
        let handler = LocalHandler::new(mock);

        let ping = PrivilegedRequest::new(1, Method::Ping, Value::Null);
        let mut prepare = scm_call(Operation::Prepare(PrepareRequest::default()));
        prepare.id = 2;

        let mut input = String::new();
        input.push_str(&encode_line(&ping).unwrap());
        input.push('\n');
        input.push_str("garbage\n");
        input.push_str(&encode_line(&prepare).unwrap());

        let mut output = Vec::new();
        let served = serve(BufReader::new(input.as_bytes()), &mut output, &handler)
            .await
            .unwrap();
        assert_eq!(served, 3);

        let text = String::from_utf8(output).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 3);

        let pong = decode_response(lines[0], 1, "storage_admin").unwrap();
        assert_eq!(pong.payload["version"], crate::VERSION);
        assert_matches!(decode_response(lines[1], 0, "storage_admin"), Err(Error::Protocol(_)));
        assert_matches!(
            decode_response(lines[2], 2, "storage_admin"),
            Err(Error::Provider { reason, .. }) if reason == "region locked"
        );
    }
}
