//! Process configuration from environment variables.
//!
//! | Variable | Default |
//! |---|---|
//! | `LISTEN_ADDR` | `127.0.0.1:8080` |
//! | `CONTROL_ADDR` | `127.0.0.1:8081` |
//! | `CONTROL_API_KEY` | unset |
//! | `REGISTRY_NAME` | `tcp_balancing_targets` |
//! | `MEMBERS` | `primary,standby` (must include `primary`) |
//! | `MEMBER_BACKLOG` | `1024` |
//! | `REUSE_PORT` | `true` when `MEMBERS` hosts both roles, else `false` |
//! | `WORKER_THREADS` | available cores |
//! | `CPU_PINNING` | `true` |

use std::env;
use std::str::FromStr;

use standby_ebpf_common::map_names;

use crate::admission::AdmissionConfig;
use crate::control::ControlConfig;
use crate::error::{Result, StandbyError};
use crate::member::{parse_roles, Role, DEFAULT_MEMBER_BACKLOG};
use crate::runtime::RuntimeConfig;

pub const ENV_LISTEN_ADDR: &str = "LISTEN_ADDR";
pub const ENV_CONTROL_ADDR: &str = "CONTROL_ADDR";
pub const ENV_CONTROL_API_KEY: &str = "CONTROL_API_KEY";
pub const ENV_REGISTRY_NAME: &str = "REGISTRY_NAME";
pub const ENV_MEMBERS: &str = "MEMBERS";
pub const ENV_MEMBER_BACKLOG: &str = "MEMBER_BACKLOG";
pub const ENV_REUSE_PORT: &str = "REUSE_PORT";
pub const ENV_WORKER_THREADS: &str = "WORKER_THREADS";
pub const ENV_CPU_PINNING: &str = "CPU_PINNING";

/// Everything `main` needs to wire the process together.
#[derive(Debug, Clone)]
pub struct StandbyConfig {
    pub admission: AdmissionConfig,
    pub control: ControlConfig,
    pub runtime: RuntimeConfig,
    /// Name the registry is pinned under
    pub registry_name: String,
    /// Members this process hosts, in registration order
    pub members: Vec<Role>,
    pub member_backlog: usize,
}

impl Default for StandbyConfig {
    fn default() -> Self {
        Self {
            admission: AdmissionConfig::default(),
            control: ControlConfig::default(),
            runtime: RuntimeConfig::default(),
            registry_name: map_names::TCP_BALANCING_TARGETS.to_owned(),
            members: vec![Role::Primary, Role::Standby],
            member_backlog: DEFAULT_MEMBER_BACKLOG,
        }
    }
}

impl StandbyConfig {
    /// Read the process environment.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Build from an arbitrary key lookup. Unset keys keep their defaults;
    /// set-but-malformed keys are an error.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(addr) = parsed(&lookup, ENV_LISTEN_ADDR)? {
            config.admission.listen_addr = addr;
        }
        if let Some(addr) = parsed(&lookup, ENV_CONTROL_ADDR)? {
            config.control.listen_addr = addr;
        }
        config.control.api_key = lookup(ENV_CONTROL_API_KEY).filter(|k| !k.is_empty());

        if let Some(name) = lookup(ENV_REGISTRY_NAME).filter(|n| !n.trim().is_empty()) {
            config.registry_name = name.trim().to_owned();
        }
        if let Some(list) = lookup(ENV_MEMBERS) {
            config.members = parse_roles(&list)?;
        }
        if !config.members.contains(&Role::Primary) {
            return Err(StandbyError::Config {
                key: ENV_MEMBERS,
                reason: format!("{:?} does not host the primary", config.members),
            });
        }

        // Each process decides against its own registry, so the port is only
        // shared when this process already hosts the whole group.
        config.admission.reuse_port = match lookup(ENV_REUSE_PORT) {
            Some(reuse) => parse_flag(&reuse),
            None => config.members.contains(&Role::Standby),
        };
        if let Some(backlog) = parsed(&lookup, ENV_MEMBER_BACKLOG)? {
            config.member_backlog = backlog;
        }

        if let Some(threads) = parsed(&lookup, ENV_WORKER_THREADS)? {
            config.runtime.worker_threads = threads;
        }
        if let Some(pinning) = lookup(ENV_CPU_PINNING) {
            config.runtime.enable_cpu_pinning = parse_flag(&pinning);
        }

        Ok(config)
    }
}

fn parsed<F, T>(lookup: &F, key: &'static str) -> Result<Option<T>>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match lookup(key) {
        None => Ok(None),
        Some(raw) => raw.trim().parse().map(Some).map_err(|e: T::Err| StandbyError::Config {
            key,
            reason: format!("{:?}: {}", raw, e),
        }),
    }
}

/// Anything but `0` / `false` / `no` / `off` is on.
fn parse_flag(raw: &str) -> bool {
    !matches!(raw.trim().to_ascii_lowercase().as_str(), "0" | "false" | "no" | "off")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn from_pairs(pairs: &[(&str, &str)]) -> Result<StandbyConfig> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        StandbyConfig::from_lookup(|key| map.get(key).cloned())
    }

    #[test]
    fn test_defaults() {
        let config = from_pairs(&[]).unwrap();
        assert_eq!(config.admission.listen_addr.port(), 8080);
        assert_eq!(config.control.listen_addr.port(), 8081);
        assert_eq!(config.registry_name, "tcp_balancing_targets");
        assert_eq!(config.members, vec![Role::Primary, Role::Standby]);
        assert_eq!(config.member_backlog, 1024);
        assert!(config.admission.reuse_port);
        assert!(config.control.api_key.is_none());
    }

    #[test]
    fn test_overrides() {
        let config = from_pairs(&[
            ("LISTEN_ADDR", "0.0.0.0:9000"),
            ("CONTROL_ADDR", "127.0.0.1:9001"),
            ("CONTROL_API_KEY", "k"),
            ("REGISTRY_NAME", " edge_targets "),
            ("MEMBERS", "primary"),
            ("MEMBER_BACKLOG", "16"),
            ("REUSE_PORT", "off"),
            ("WORKER_THREADS", "3"),
            ("CPU_PINNING", "false"),
        ])
        .unwrap();

        assert_eq!(config.admission.listen_addr, "0.0.0.0:9000".parse().unwrap());
        assert_eq!(config.control.listen_addr.port(), 9001);
        assert_eq!(config.control.api_key.as_deref(), Some("k"));
        assert_eq!(config.registry_name, "edge_targets");
        assert_eq!(config.members, vec![Role::Primary]);
        assert_eq!(config.member_backlog, 16);
        assert!(!config.admission.reuse_port);
        assert_eq!(config.runtime.worker_threads, 3);
        assert!(!config.runtime.enable_cpu_pinning);
    }

    #[test]
    fn test_malformed_values_are_errors() {
        let err = from_pairs(&[("LISTEN_ADDR", "not-an-addr")]).unwrap_err();
        assert!(matches!(err, StandbyError::Config { key: "LISTEN_ADDR", .. }));

        assert!(from_pairs(&[("MEMBER_BACKLOG", "-1")]).is_err());
        assert!(matches!(
            from_pairs(&[("MEMBERS", "primary,leader")]),
            Err(StandbyError::InvalidRole(_))
        ));
    }

    #[test]
    fn test_members_must_host_the_primary() {
        for list in ["standby", "", " , "] {
            let err = from_pairs(&[("MEMBERS", list)]).unwrap_err();
            assert!(matches!(err, StandbyError::Config { key: "MEMBERS", .. }), "{:?}", list);
        }
        assert!(from_pairs(&[("MEMBERS", "standby,primary")]).is_ok());
    }

    #[test]
    fn test_partial_group_does_not_share_its_port() {
        let primary_only = from_pairs(&[("MEMBERS", "primary")]).unwrap();
        assert!(!primary_only.admission.reuse_port);

        let both = from_pairs(&[("MEMBERS", "primary,standby")]).unwrap();
        assert!(both.admission.reuse_port);

        let forced = from_pairs(&[("MEMBERS", "primary"), ("REUSE_PORT", "1")]).unwrap();
        assert!(forced.admission.reuse_port);
    }

    #[test]
    fn test_flags() {
        assert!(parse_flag("1"));
        assert!(parse_flag("yes"));
        assert!(!parse_flag("0"));
        assert!(!parse_flag(" FALSE "));
        assert!(!parse_flag("off"));
    }
}
