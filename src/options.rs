//! Per-cluster configuration.

use std::time::Duration;

use serde::Deserialize;
use typed_builder::TypedBuilder;

use crate::error::{Error, Result};

/// Configuration snapshot for one cluster, obtained from the metadata
/// collaborator when a cluster is (re)loaded.
///
/// Timeouts and ages are in seconds; a value of `0` disables the check.
#[derive(Clone, Debug, Deserialize, PartialEq, TypedBuilder)]
#[serde(default, deny_unknown_fields)]
#[non_exhaustive]
pub struct ClusterOptions {
    /// Maximum age of a cached connection before it is dropped and
    /// re-established at the start of the next call.
    #[builder(default = 0)]
    pub connection_lifetime: u64,

    /// Maximum seconds between query submission and completion.
    #[builder(default = 0)]
    pub query_timeout: u64,

    /// Maximum seconds for socket connection plus login.
    #[builder(default = 0)]
    pub connect_timeout: u64,

    /// Use text format for parameters and results even where binary transfer
    /// would be possible.
    #[builder(default = false)]
    pub disable_binary: bool,

    /// TCP keepalive idle time, passed through to the transport. `0` leaves
    /// the system default.
    #[builder(default = 0)]
    pub keepalive_idle: u64,

    /// TCP keepalive probe interval, passed through to the transport.
    #[builder(default = 0)]
    pub keepalive_interval: u64,

    /// TCP keepalive probe count, passed through to the transport.
    #[builder(default = 0)]
    pub keepalive_count: u32,

    /// Which principal identity keys user-mapping lookup and the connection
    /// cache when a partition connect string does not name a user.
    #[builder(default)]
    pub default_user: DefaultUser,
}

impl Default for ClusterOptions {
    fn default() -> Self {
        Self::builder().build()
    }
}

/// The principal used for partitions whose connect string omits a user.
#[derive(Clone, Copy, Debug, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum DefaultUser {
    /// The effective user of the embedding session (the default).
    #[default]
    CurrentUser,
    /// The authenticated session user.
    SessionUser,
}

impl ClusterOptions {
    /// Builds options from the key/value rows the metadata collaborator
    /// stores per cluster. Unknown keys are rejected.
    pub fn from_pairs<'a, I>(pairs: I) -> Result<Self>
    where
        I: IntoIterator<Item = (&'a str, &'a str)>,
    {
        let mut options = Self::default();
        for (key, value) in pairs {
            match key {
                "connection_lifetime" => options.connection_lifetime = parse_seconds(key, value)?,
                "query_timeout" => options.query_timeout = parse_seconds(key, value)?,
                "connect_timeout" => options.connect_timeout = parse_seconds(key, value)?,
                "disable_binary" => options.disable_binary = parse_bool(key, value)?,
                "keepalive_idle" => options.keepalive_idle = parse_seconds(key, value)?,
                "keepalive_interval" => options.keepalive_interval = parse_seconds(key, value)?,
                "keepalive_count" => {
                    options.keepalive_count = value.parse().map_err(|_| bad_value(key, value))?
                }
                "default_user" => {
                    options.default_user = match value {
                        "current_user" => DefaultUser::CurrentUser,
                        "session_user" => DefaultUser::SessionUser,
                        _ => return Err(bad_value(key, value)),
                    }
                }
                _ => {
                    return Err(Error::config(format!(
                        "unknown cluster configuration key \"{key}\""
                    )))
                }
            }
        }
        Ok(options)
    }

    pub(crate) fn connect_deadline(&self) -> Option<Duration> {
        (self.connect_timeout > 0).then(|| Duration::from_secs(self.connect_timeout))
    }

    pub(crate) fn query_deadline(&self) -> Option<Duration> {
        (self.query_timeout > 0).then(|| Duration::from_secs(self.query_timeout))
    }

    pub(crate) fn lifetime(&self) -> Option<Duration> {
        (self.connection_lifetime > 0).then(|| Duration::from_secs(self.connection_lifetime))
    }
}

fn parse_seconds(key: &str, value: &str) -> Result<u64> {
    value.parse().map_err(|_| bad_value(key, value))
}

/// Accepts the spellings PostgreSQL accepts for booleans in configuration.
fn parse_bool(key: &str, value: &str) -> Result<bool> {
    match value.to_ascii_lowercase().as_str() {
        "1" | "t" | "true" | "on" | "yes" => Ok(true),
        "0" | "f" | "false" | "off" | "no" => Ok(false),
        _ => Err(bad_value(key, value)),
    }
}

fn bad_value(key: &str, value: &str) -> Error {
    Error::config(format!("invalid value \"{value}\" for \"{key}\""))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn from_pairs_round_trip() {
        let options = ClusterOptions::from_pairs([
            ("connection_lifetime", "1800"),
            ("query_timeout", "30"),
            ("disable_binary", "on"),
            ("default_user", "session_user"),
        ])
        .unwrap();
        assert_eq!(options.connection_lifetime, 1800);
        assert_eq!(options.query_timeout, 30);
        assert!(options.disable_binary);
        assert_eq!(options.default_user, DefaultUser::SessionUser);
        assert_eq!(options.connect_timeout, 0);
        assert!(options.connect_deadline().is_none());
    }

    #[test]
    fn unknown_key_is_rejected() {
        let err = ClusterOptions::from_pairs([("querytimeout", "30")]).unwrap_err();
        assert!(err.to_string().contains("querytimeout"));
    }

    #[test]
    fn builder_defaults_match_default() {
        assert_eq!(ClusterOptions::builder().build(), ClusterOptions::default());
    }
}
