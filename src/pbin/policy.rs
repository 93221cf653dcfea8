//! Forwarding Policy and Helper Location

use super::{DISABLE_REQ_FWD_ENV, HELPER_NAME};
use crate::domain::ports::SystemExt;
use crate::error::{Error, ForwardingCause, Result};
use std::ffi::OsString;
use std::path::PathBuf;

/// Whether privileged requests cross the process boundary
///
/// Resolved once when the forwarder is built; request handling never
/// re-reads the environment or re-checks privilege.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ForwardingPolicy {
    /// Forwarding switched off by the environment
    pub forwarding_disabled: bool,
    /// The current process already holds administrative privilege
    pub privileged: bool,
}

impl ForwardingPolicy {
    pub fn new(forwarding_disabled: bool, privileged: bool) -> Self {
        Self {
            forwarding_disabled,
            privileged,
        }
    }

    /// Read the disable switch (presence only) and the process privilege
    pub fn resolve(ext: &dyn SystemExt) -> Self {
        Self::resolve_with(|name| std::env::var_os(name), ext)
    }

    /// As `resolve`, reading the environment through `lookup`
    ///
    /// Any value disables forwarding, including an empty one or "0".
    pub fn resolve_with<F>(lookup: F, ext: &dyn SystemExt) -> Self
    where
        F: FnOnce(&str) -> Option<OsString>,
    {
        Self::new(lookup(DISABLE_REQ_FWD_ENV).is_some(), ext.is_privileged())
    }

    pub fn should_forward(&self) -> bool {
        !self.forwarding_disabled && !self.privileged
    }
}

impl std::fmt::Display for ForwardingPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.should_forward() {
            write!(f, "forward")
        } else if self.privileged {
            write!(f, "local (privileged)")
        } else {
            write!(f, "local (forwarding disabled)")
        }
    }
}

/// How to find and launch the privileged helper
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HelperDescriptor {
    /// Executable name looked up on PATH
    pub name: String,
    /// Explicit program, bypassing the PATH lookup
    pub program: Option<PathBuf>,
    /// Arguments passed at launch
    pub args: Vec<String>,
}

impl Default for HelperDescriptor {
    fn default() -> Self {
        Self::named(HELPER_NAME)
    }
}

impl HelperDescriptor {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            program: None,
            args: Vec::new(),
        }
    }

    pub fn with_program(mut self, program: impl Into<PathBuf>) -> Self {
        self.program = Some(program.into());
        self
    }

    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    /// Resolve the executable to launch
    pub fn locate(&self) -> Result<PathBuf> {
        if let Some(program) = &self.program {
            return Ok(program.clone());
        }
        which::which(&self.name).map_err(|e| Error::Forwarding {
            helper: self.name.clone(),
            cause: ForwardingCause::Launch,
            reason: format!("not found on PATH: {}", e),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::system::MockExt;
    use assert_matches::assert_matches;

    #[test]
    fn test_should_forward() {
        assert!(ForwardingPolicy::new(false, false).should_forward());
        assert!(!ForwardingPolicy::new(true, false).should_forward());
        assert!(!ForwardingPolicy::new(false, true).should_forward());
        assert!(!ForwardingPolicy::new(true, true).should_forward());
    }

    #[test]
    fn test_resolve_uses_privilege() {
        // The disable switch is process-wide; only assert on privilege here
        let policy = ForwardingPolicy::resolve(&MockExt::new(true));
        assert!(policy.privileged);
        assert!(!policy.should_forward());
    }

    #[test]
    fn test_disable_switch_is_presence_only() {
        let ext = MockExt::new(false);
        for value in ["", "0", "false", "1"] {
            let policy = ForwardingPolicy::resolve_with(
                |name| (name == DISABLE_REQ_FWD_ENV).then(|| OsString::from(value)),
                &ext,
            );
            assert!(policy.forwarding_disabled, "value {:?}", value);
            assert!(!policy.should_forward());
        }

        let unset = ForwardingPolicy::resolve_with(|_| None, &ext);
        assert!(!unset.forwarding_disabled);
        assert!(unset.should_forward());
    }

    #[test]
    fn test_policy_display() {
        assert_eq!(ForwardingPolicy::new(false, false).to_string(), "forward");
        assert_eq!(ForwardingPolicy::new(true, false).to_string(), "local (forwarding disabled)");
    }

    #[test]
    fn test_locate() {
        let explicit = HelperDescriptor::named("anything").with_program("/opt/bin/helper");
        assert_eq!(explicit.locate().unwrap(), PathBuf::from("/opt/bin/helper"));

        let missing = HelperDescriptor::named("storctl-no-such-helper-binary");
        assert_matches!(
            missing.locate(),
            Err(Error::Forwarding { cause: ForwardingCause::Launch, .. })
        );
    }
}
