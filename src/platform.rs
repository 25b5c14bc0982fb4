// src/platform.rs

//! Platforms, host selection and the shared unreachable-host set.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use thiserror::Error;
use tracing::{debug, info};

use crate::config::model::PlatformConfig;
use crate::subproc::context::RemoteTools;

/// Hosts found unreachable (exit 255 from ssh/rsync).
///
/// Shared between the pool and the event manager; grows until
/// [`BadHosts::clear`] is called.
#[derive(Debug, Clone, Default)]
pub struct BadHosts(Arc<Mutex<HashSet<String>>>);

impl BadHosts {
    pub fn new() -> Self {
        Self::default()
    }

    fn with<R>(&self, f: impl FnOnce(&mut HashSet<String>) -> R) -> R {
        let mut guard = self.0.lock().unwrap_or_else(|e| e.into_inner());
        f(&mut guard)
    }

    pub fn add(&self, host: &str) {
        self.with(|set| set.insert(host.to_string()));
    }

    pub fn contains(&self, host: &str) -> bool {
        self.with(|set| set.contains(host))
    }

    pub fn remove_all<'a>(&self, hosts: impl IntoIterator<Item = &'a String>) {
        self.with(|set| {
            for h in hosts {
                set.remove(h);
            }
        });
    }

    pub fn clear(&self) {
        self.with(|set| set.clear());
    }

    pub fn len(&self) -> usize {
        self.with(|set| set.len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Host and user facts the engine needs but does not own.
pub trait HostResolver: Send + Sync {
    fn local_host(&self) -> String;
    fn user(&self) -> String;
    fn is_remote_host(&self, host: &str) -> bool;
}

/// Resolver backed by the local host name and `$USER`.
#[derive(Debug, Clone)]
pub struct LocalHostResolver {
    host: String,
    user: String,
}

impl LocalHostResolver {
    pub fn new() -> Self {
        let host = hostname::get()
            .ok()
            .and_then(|h| h.into_string().ok())
            .unwrap_or_else(|| "localhost".to_string());
        let user = std::env::var("USER")
            .or_else(|_| std::env::var("LOGNAME"))
            .unwrap_or_else(|_| "unknown".to_string());
        Self { host, user }
    }
}

impl Default for LocalHostResolver {
    fn default() -> Self {
        Self::new()
    }
}

impl HostResolver for LocalHostResolver {
    fn local_host(&self) -> String {
        self.host.clone()
    }

    fn user(&self) -> String {
        self.user.clone()
    }

    fn is_remote_host(&self, host: &str) -> bool {
        !(host.is_empty()
            || host == "localhost"
            || host == "127.0.0.1"
            || host == self.host
            || self.host.split('.').next() == Some(host))
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("no hosts available for platform '{platform}' (all unreachable)")]
pub struct NoHostsError {
    pub platform: String,
}

/// A named set of hosts plus the tools and policies used to reach them.
#[derive(Debug, Clone, PartialEq)]
pub struct Platform {
    pub name: String,
    pub config: PlatformConfig,
}

impl Platform {
    pub fn new(name: impl Into<String>, config: PlatformConfig) -> Self {
        Self {
            name: name.into(),
            config,
        }
    }

    pub fn localhost() -> Self {
        Self::new("localhost", PlatformConfig::default())
    }

    pub fn hosts(&self) -> &[String] {
        &self.config.hosts
    }

    pub fn remote_tools(&self) -> RemoteTools {
        RemoteTools {
            ssh_command: self.config.ssh_command.clone(),
            rsync_command: self.config.retrieve_job_logs_command.clone(),
        }
    }

    pub fn is_remote(&self, resolver: &dyn HostResolver) -> bool {
        self.hosts().iter().any(|h| resolver.is_remote_host(h))
    }

    /// First configured host not currently marked bad.
    pub fn select_host(&self, bad_hosts: &BadHosts) -> Result<String, NoHostsError> {
        let chosen = self
            .hosts()
            .iter()
            .find(|h| !bad_hosts.contains(h))
            .cloned();
        match chosen {
            Some(host) => {
                debug!(platform = %self.name, %host, "selected host");
                Ok(host)
            }
            None => Err(NoHostsError {
                platform: self.name.clone(),
            }),
        }
    }

    /// Like [`Platform::select_host`], but when every host is bad, forget the
    /// platform's hosts once and try again.
    pub fn select_host_or_reset(&self, bad_hosts: &BadHosts) -> Result<String, NoHostsError> {
        match self.select_host(bad_hosts) {
            Ok(host) => Ok(host),
            Err(_) => {
                info!(platform = %self.name, "all hosts unreachable; resetting bad hosts for platform");
                bad_hosts.remove_all(self.hosts());
                self.select_host(bad_hosts)
            }
        }
    }
}
