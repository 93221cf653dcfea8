//! Privileged Request Forwarder
//!
//! Sends requests to the helper over its stdin/stdout, or runs them in
//! process when the policy says forwarding is not needed.

use super::handler::RequestHandler;
use super::policy::{ForwardingPolicy, HelperDescriptor};
use super::protocol::{
    decode_response, encode_line, Method, PrivilegedRequest, PrivilegedResponse, ProviderCall,
};
use crate::error::{Error, ForwardingCause, Result};
use crate::metrics;
use serde_json::Value;
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::io::ErrorKind;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::Mutex;
use tokio::time::{timeout_at, Instant};
use tracing::{debug, info, warn};

/// A live helper and its channel
struct HelperProcess {
    child: Child,
    stdin: ChildStdin,
    stdout: BufReader<ChildStdout>,
}

impl HelperProcess {
    async fn round_trip(&mut self, line: &str, helper: &str) -> Result<String> {
        let channel = |e: std::io::Error| Error::Forwarding {
            helper: helper.to_string(),
            cause: ForwardingCause::Channel,
            reason: e.to_string(),
        };

        self.stdin.write_all(line.as_bytes()).await.map_err(channel)?;
        self.stdin.flush().await.map_err(channel)?;

        let mut reply = String::new();
        let read = self.stdout.read_line(&mut reply).await.map_err(|e| match e.kind() {
            ErrorKind::InvalidData => {
                Error::Protocol(format!("{} sent a non UTF-8 response: {}", helper, e))
            }
            _ => channel(e),
        })?;
        if read == 0 {
            let status = match self.child.try_wait() {
                Ok(Some(status)) => status.to_string(),
                _ => "closed its output".to_string(),
            };
            return Err(Error::Forwarding {
                helper: helper.to_string(),
                cause: ForwardingCause::Exited,
                reason: format!("helper exited before answering ({})", status),
            });
        }
        Ok(reply)
    }

    async fn terminate(mut self) {
        if let Err(e) = self.child.start_kill() {
            debug!(error = %e, "Helper already gone");
            return;
        }
        if let Err(e) = self.child.wait().await {
            debug!(error = %e, "Failed to reap helper");
        }
    }
}

/// Forwards privileged requests to the helper process
pub struct Forwarder {
    policy: ForwardingPolicy,
    helper: HelperDescriptor,
    timeout: Duration,
    next_id: AtomicU64,
    process: Mutex<Option<HelperProcess>>,
    launches: AtomicUsize,
}

impl Forwarder {
    pub fn new(policy: ForwardingPolicy, helper: HelperDescriptor, timeout: Duration) -> Self {
        Self {
            policy,
            helper,
            timeout,
            next_id: AtomicU64::new(1),
            process: Mutex::new(None),
            launches: AtomicUsize::new(0),
        }
    }

    pub fn policy(&self) -> ForwardingPolicy {
        self.policy
    }

    pub fn helper(&self) -> &HelperDescriptor {
        &self.helper
    }

    /// Number of helper processes launched so far
    pub fn launches(&self) -> usize {
        self.launches.load(Ordering::SeqCst)
    }

    /// Build a provider request with a fresh id
    pub fn request(&self, call: &ProviderCall) -> Result<PrivilegedRequest> {
        PrivilegedRequest::call(self.next_id.fetch_add(1, Ordering::SeqCst), call)
    }

    /// Execute a request, through the helper when the policy requires it
    pub async fn execute(
        &self,
        local: &dyn RequestHandler,
        request: PrivilegedRequest,
    ) -> Result<PrivilegedResponse> {
        let method = request.method;

        if !self.policy.should_forward() {
            debug!(id = request.id, method = %method, policy = %self.policy, "Executing locally");
            let result = local.handle(&request).await;
            metrics::record_request(method, "local", &result);
            return result;
        }

        let result = self.forward(request).await;
        metrics::record_request(method, "forwarded", &result);
        result
    }

    /// Check that the helper answers; always forwards
    pub async fn ping(&self) -> Result<Value> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let response = self
            .forward(PrivilegedRequest::new(id, Method::Ping, Value::Null))
            .await?;
        Ok(response.payload)
    }

    /// Terminate the helper if one is running
    pub async fn shutdown(&self) {
        if let Some(process) = self.process.lock().await.take() {
            info!(helper = %self.helper.name, "Stopping privileged helper");
            process.terminate().await;
        }
    }

    /// Send one request to the helper
    ///
    /// The timeout covers waiting for the channel as well as the round trip.
    async fn forward(&self, request: PrivilegedRequest) -> Result<PrivilegedResponse> {
        let deadline = Instant::now() + self.timeout;
        let line = encode_line(&request)?;

        let mut slot = match timeout_at(deadline, self.process.lock()).await {
            Ok(slot) => slot,
            Err(_) => {
                debug!(id = request.id, method = %request.method, "Timed out waiting for the helper channel");
                return Err(self.timed_out());
            }
        };

        let mut process = match slot.take() {
            Some(process) => process,
            None => self.launch()?,
        };

        debug!(id = request.id, method = %request.method, helper = %self.helper.name, "Forwarding request");

        let outcome = match timeout_at(deadline, process.round_trip(&line, &self.helper.name)).await {
            Ok(Ok(reply)) => decode_response(&reply, request.id, &self.helper.name),
            Ok(Err(e)) => Err(e),
            Err(_) => Err(self.timed_out()),
        };

        match &outcome {
            // The channel is out of step or dead; never reuse it
            Err(e @ Error::Forwarding { .. }) | Err(e @ Error::Protocol(_)) => {
                warn!(id = request.id, method = %request.method, error = %e, "Discarding privileged helper");
                process.terminate().await;
            }
            _ => *slot = Some(process),
        }

        outcome
    }

    fn timed_out(&self) -> Error {
        Error::Forwarding {
            helper: self.helper.name.clone(),
            cause: ForwardingCause::Timeout,
            reason: format!("no response within {:?}", self.timeout),
        }
    }

    fn launch(&self) -> Result<HelperProcess> {
        let program = self.helper.locate()?;
        let launch_err = |reason: String| Error::Forwarding {
            helper: self.helper.name.clone(),
            cause: ForwardingCause::Launch,
            reason,
        };

        let mut child = Command::new(&program)
            .args(&self.helper.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| launch_err(format!("{}: {}", program.display(), e)))?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| launch_err("helper stdin not captured".into()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| launch_err("helper stdout not captured".into()))?;

        self.launches.fetch_add(1, Ordering::SeqCst);
        info!(helper = %self.helper.name, program = %program.display(), pid = ?child.id(), "Launched privileged helper");

        Ok(HelperProcess {
            child,
            stdin,
            stdout: BufReader::new(stdout),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::ports::{Inventory, ScmClass, StorageClass};
    use crate::pbin::handler::LocalHandler;
    use crate::pbin::protocol::Operation;
    use crate::storage::{MockProvider, ProviderSpec};
    use assert_matches::assert_matches;
    use std::sync::Arc;

    fn scan_call() -> ProviderCall {
        ProviderCall {
            spec: ProviderSpec::Scm,
            op: Operation::Scan,
        }
    }

    fn local() -> LocalHandler {
        LocalHandler::new(Arc::new(MockProvider::new(
            "mock-scm",
            StorageClass::Scm(ScmClass::Ram),
        )))
    }

    /// Helper implemented as a shell script
    fn sh_helper(script: &str) -> HelperDescriptor {
        HelperDescriptor::named("sh-helper")
            .with_program("/bin/sh")
            .with_args(["-c", script])
    }

    fn forwarding(helper: HelperDescriptor, timeout: Duration) -> Forwarder {
        Forwarder::new(ForwardingPolicy::new(false, false), helper, timeout)
    }

    #[tokio::test]
    async fn test_disabled_runs_locally() {
        let fwd = Forwarder::new(
            ForwardingPolicy::new(true, false),
            HelperDescriptor::named("storctl-no-such-helper-binary"),
            Duration::from_secs(1),
        );
        let handler = local();

        let req = fwd.request(&scan_call()).unwrap();
        let inv: Inventory = fwd.execute(&handler, req).await.unwrap().decode().unwrap();
        assert_eq!(inv.class, StorageClass::Scm(ScmClass::Ram));
        assert_eq!(fwd.launches(), 0);
    }

    #[tokio::test]
    async fn test_privileged_runs_locally() {
        let fwd = Forwarder::new(
            ForwardingPolicy::new(false, true),
            HelperDescriptor::named("storctl-no-such-helper-binary"),
            Duration::from_secs(1),
        );
        let req = fwd.request(&scan_call()).unwrap();
        assert!(fwd.execute(&local(), req).await.is_ok());
        assert_eq!(fwd.launches(), 0);
    }

    #[tokio::test]
    async fn test_missing_helper() {
        let fwd = forwarding(
            HelperDescriptor::named("storctl-no-such-helper-binary"),
            Duration::from_secs(1),
        );
        let req = fwd.request(&scan_call()).unwrap();
        assert_matches!(
            fwd.execute(&local(), req).await,
            Err(Error::Forwarding { cause: ForwardingCause::Launch, .. })
        );
    }

    #[tokio::test]
    async fn test_helper_reused_across_calls() {
        // Echo a success response carrying each request's id
        let script = r#"while read -r line; do
            id=$(printf '%s' "$line" | sed 's/.*"id":\([0-9]*\).*/\1/')
            printf '{"id":%s,"payload":{"ok":true}}\n' "$id"
        done"#;
        let fwd = forwarding(sh_helper(script), Duration::from_secs(5));

        for _ in 0..3 {
            let req = fwd.request(&scan_call()).unwrap();
            let resp = fwd.execute(&local(), req).await.unwrap();
            assert_eq!(resp.payload["ok"], true);
        }
        assert_eq!(fwd.launches(), 1);
        fwd.shutdown().await;
    }

    #[tokio::test]
    async fn test_helper_exit_mid_request() {
        let fwd = forwarding(sh_helper("read -r line; exit 3"), Duration::from_secs(5));

        let req = fwd.request(&scan_call()).unwrap();
        assert_matches!(
            fwd.execute(&local(), req).await,
            Err(Error::Forwarding { cause: ForwardingCause::Exited, .. })
        );

        // A fresh helper is launched for the next call
        let req = fwd.request(&scan_call()).unwrap();
        assert!(fwd.execute(&local(), req).await.is_err());
        assert_eq!(fwd.launches(), 2);
    }

    #[tokio::test]
    async fn test_timeout_discards_helper() {
        let fwd = forwarding(sh_helper("sleep 30"), Duration::from_millis(200));

        let req = fwd.request(&scan_call()).unwrap();
        let err = fwd.execute(&local(), req).await.unwrap_err();
        assert!(err.is_timeout());
        assert!(fwd.process.lock().await.is_none());
    }

    #[tokio::test]
    async fn test_timeout_includes_channel_wait() {
        // Each answer takes longer than half the timeout, so queued callers
        // must give up instead of waiting their turn
        let script = r#"while read -r line; do
            sleep 1
            id=$(printf '%s' "$line" | sed 's/.*"id":\([0-9]*\).*/\1/')
            printf '{"id":%s,"payload":{"ok":true}}\n' "$id"
        done"#;
        let timeout = Duration::from_millis(1500);
        let fwd = forwarding(sh_helper(script), timeout);
        let handler = local();
        let (fwd, handler) = (&fwd, &handler);

        let calls = (0..3).map(|_| {
            let req = fwd.request(&scan_call()).unwrap();
            async move {
                let started = std::time::Instant::now();
                let result = fwd.execute(handler, req).await;
                (started.elapsed(), result)
            }
        });
        let results = futures::future::join_all(calls).await;

        for (elapsed, _) in &results {
            assert!(*elapsed < timeout + Duration::from_millis(700), "took {:?}", elapsed);
        }
        assert_eq!(results.iter().filter(|(_, r)| r.is_ok()).count(), 1);
        assert!(results
            .iter()
            .filter_map(|(_, r)| r.as_ref().err())
            .all(|e| e.is_timeout()));
        fwd.shutdown().await;
    }

    #[tokio::test]
    async fn test_non_utf8_response_is_protocol_error() {
        let fwd = forwarding(
            sh_helper(r"while read -r line; do printf '\377\376\n'; done"),
            Duration::from_secs(5),
        );
        let req = fwd.request(&scan_call()).unwrap();
        assert_matches!(fwd.execute(&local(), req).await, Err(Error::Protocol(_)));
        assert!(fwd.process.lock().await.is_none());
    }

    #[tokio::test]
    async fn test_malformed_response() {
        let fwd = forwarding(
            sh_helper("while read -r line; do echo 'not json'; done"),
            Duration::from_secs(5),
        );
        let req = fwd.request(&scan_call()).unwrap();
        assert_matches!(fwd.execute(&local(), req).await, Err(Error::Protocol(_)));
        assert!(fwd.process.lock().await.is_none());
    }

    #[tokio::test]
    async fn test_helper_error_passthrough_keeps_helper() {
        let script = r#"while read -r line; do
            id=$(printf '%s' "$line" | sed 's/.*"id":\([0-9]*\).*/\1/')
            printf '{"id":%s,"error":{"kind":"privilege","message":"scm format"}}\n' "$id"
        done"#;
        let fwd = forwarding(sh_helper(script), Duration::from_secs(5));

        let req = fwd.request(&scan_call()).unwrap();
        assert_matches!(
            fwd.execute(&local(), req).await,
            Err(Error::Privilege { operation }) if operation == "scm format"
        );
        assert!(fwd.process.lock().await.is_some());
        fwd.shutdown().await;
        assert!(fwd.process.lock().await.is_none());
    }
}
