//! Read-only build configuration.
//!
//! How these values are obtained (config files, flags, environment) is the
//! caller's business; this crate only consumes them. The structs derive
//! `Deserialize` so external readers can fill them directly.

use std::collections::{BTreeMap, BTreeSet};

use serde::Deserialize;

/// Top-level switches plus the remote execution settings.
#[derive(Clone, Debug, Default, Deserialize)]
pub struct BuildConfig {
    /// Execute eligible edges on a REAPI cluster.
    #[serde(default)]
    pub cloud_run: bool,
    /// Delegate edges to peers through the shared-build proxy instead.
    #[serde(default)]
    pub share_run: bool,
    #[serde(default)]
    pub rbe_config: RbeConfig,
}

#[derive(Clone, Debug, Deserialize)]
pub struct RbeConfig {
    /// Remote endpoint, `grpc://host:port`. CAS, AC and Execution share it.
    #[serde(default)]
    pub grpc_url: String,
    /// Shared-build proxy, `host:port`.
    #[serde(default)]
    pub shareproxy_addr: String,
    /// REAPI instance name, usually empty.
    #[serde(default)]
    pub instance_name: String,
    /// Absolute project root; inputs outside it never enter an input tree.
    #[serde(default)]
    pub project_root: String,
    /// Absolute directory the build is driven from.
    #[serde(default)]
    pub cwd: String,
    /// Our own IPv4 address, used in shared-build command ids.
    #[serde(default)]
    pub self_ipv4_addr: String,
    /// Worker count requested from the shared-build proxy.
    #[serde(default)]
    pub worker_num: i32,
    /// Platform properties stamped onto every Command, e.g.
    /// `container-image` -> `docker://...`.
    #[serde(default)]
    pub rbe_properties: BTreeMap<String, String>,
    /// Rules that must run locally.
    #[serde(default)]
    pub local_only_rules: BTreeSet<String>,
    /// Substring filters: any match against the command or rule name keeps
    /// the edge local.
    #[serde(default)]
    pub fuzzy_rules: BTreeSet<String>,
    /// Rule names declared remote-capable by the configuration. Carried
    /// for external consumers; the classifier keys off the command line.
    #[serde(default)]
    pub remote_exec_rules: BTreeSet<String>,
    /// Retries per RPC after the initial attempt.
    #[serde(default = "default_retry_limit")]
    pub retry_limit: u32,
    /// Base retry delay in milliseconds.
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,
    /// Per-attempt timeout in seconds; 0 means none.
    #[serde(default)]
    pub request_timeout_secs: u64,
}

fn default_retry_limit() -> u32 {
    4
}

fn default_retry_delay_ms() -> u64 {
    1000
}

impl Default for RbeConfig {
    fn default() -> Self {
        RbeConfig {
            grpc_url: String::new(),
            shareproxy_addr: String::new(),
            instance_name: String::new(),
            project_root: String::new(),
            cwd: String::new(),
            self_ipv4_addr: String::new(),
            worker_num: 0,
            rbe_properties: BTreeMap::new(),
            local_only_rules: BTreeSet::new(),
            fuzzy_rules: BTreeSet::new(),
            remote_exec_rules: BTreeSet::new(),
            retry_limit: default_retry_limit(),
            retry_delay_ms: default_retry_delay_ms(),
            request_timeout_secs: 0,
        }
    }
}

impl RbeConfig {
    pub fn retry_policy(&self) -> nimbus_reapi::RetryPolicy {
        let timeout = if self.request_timeout_secs == 0 {
            None
        } else {
            Some(std::time::Duration::from_secs(self.request_timeout_secs))
        };
        nimbus_reapi::RetryPolicy::new(
            self.retry_limit,
            std::time::Duration::from_millis(self.retry_delay_ms),
        )
        .with_request_timeout(timeout)
    }
}

/// Tool identity sent in the request metadata of every RPC.
pub const TOOL_NAME: &str = "nimbus-remote";
pub const TOOL_VERSION: &str = env!("CARGO_PKG_VERSION");

/// `<hostname>:<parent-pid>`, identifying this build invocation.
pub fn tool_invocation_id() -> String {
    format!("{}:{}", hostname(), std::os::unix::process::parent_id())
}

fn hostname() -> String {
    let mut buffer = [0u8; 256];
    // gethostname wants a writable C buffer; the result is NUL-terminated.
    let rc = unsafe { libc::gethostname(buffer.as_mut_ptr() as *mut libc::c_char, buffer.len()) };
    if rc != 0 {
        return String::new();
    }
    let end = buffer.iter().position(|&b| b == 0).unwrap_or(buffer.len());
    String::from_utf8_lossy(&buffer[..end]).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invocation_id_has_host_and_pid() {
        let id = tool_invocation_id();
        let (_host, pid) = id.rsplit_once(':').expect("must contain a colon");
        pid.parse::<u32>().expect("pid part must be numeric");
    }

    #[test]
    fn retry_policy_honors_zero_timeout() {
        let config = RbeConfig::default();
        assert!(config.retry_policy().request_timeout.is_none());
        let config = RbeConfig {
            request_timeout_secs: 30,
            ..Default::default()
        };
        assert_eq!(
            config.retry_policy().request_timeout,
            Some(std::time::Duration::from_secs(30))
        );
    }
}
