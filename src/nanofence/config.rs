/*
 * Copyright (C) 2024 The Nanocloud Authors
 *
 * Licensed under the Apache License, Version 2.0 (the "License");
 * you may not use this file except in compliance with the License.
 * You may obtain a copy of the License at
 *
 * http://www.apache.org/licenses/LICENSE-2.0
 *
 * Unless required by applicable law or agreed to in writing, software
 * distributed under the License is distributed on an "AS IS" BASIS,
 * WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 * See the License for the specific language governing permissions and
 * limitations under the License.
 */

use crate::nanofence::logger::{LogFormat, LogLevel};
use crate::nanofence::util::error::{with_context, DynError};
use std::env;
use std::net::SocketAddr;
use std::time::Duration;

/// Shortest poll interval accepted; shorter values are clamped up to protect
/// the backend from query floods.
pub const MIN_POLL_INTERVAL: Duration = Duration::from_secs(5);

/// Tunables recognised by the controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Config {
    BackendEndpoint,
    BackendTimeout,
    PollInterval,
    CacheTtl,
    CacheSweepInterval,
    ActionTimeout,
    ActionBackoff,
    Workers,
    FencingLabel,
    Driver,
    Listen,
    LogFormat,
    LogLevel,
}

impl Config {
    /// Returns the associated environment variable for the config parameter.
    pub fn env_var(&self) -> &'static str {
        match self {
            Config::BackendEndpoint => "NANOFENCE_BACKEND_ENDPOINT",
            Config::BackendTimeout => "NANOFENCE_BACKEND_TIMEOUT",
            Config::PollInterval => "NANOFENCE_POLL_INTERVAL",
            Config::CacheTtl => "NANOFENCE_CACHE_TTL",
            Config::CacheSweepInterval => "NANOFENCE_CACHE_SWEEP_INTERVAL",
            Config::ActionTimeout => "NANOFENCE_ACTION_TIMEOUT",
            Config::ActionBackoff => "NANOFENCE_ACTION_BACKOFF",
            Config::Workers => "NANOFENCE_WORKERS",
            Config::FencingLabel => "NANOFENCE_FENCING_LABEL",
            Config::Driver => "NANOFENCE_DRIVER",
            Config::Listen => "NANOFENCE_LISTEN",
            Config::LogFormat => "NANOFENCE_LOG_FORMAT",
            Config::LogLevel => "NANOFENCE_LOG_LEVEL",
        }
    }

    /// Returns the default used when the environment variable is unset.
    /// `None` means the default is derived from other parameters.
    pub fn default_value(&self) -> Option<&'static str> {
        match self {
            Config::BackendEndpoint => Some("http://127.0.0.1:9501"),
            Config::BackendTimeout => Some("10s"),
            Config::PollInterval => Some("30s"),
            Config::CacheTtl => Some("5m"),
            Config::CacheSweepInterval => None,
            Config::ActionTimeout => Some("5m"),
            Config::ActionBackoff => Some("10s"),
            Config::Workers => Some("4"),
            Config::FencingLabel => Some("nanofence.io/node-fencing"),
            Config::Driver => Some("csi.nanocloud.io"),
            Config::Listen => Some("0.0.0.0:9808"),
            Config::LogFormat => Some("text"),
            Config::LogLevel => Some("info"),
        }
    }
}

/// Typed snapshot of every tunable.
#[derive(Debug, Clone, PartialEq)]
pub struct FencingConfig {
    pub backend_endpoint: String,
    pub backend_timeout: Duration,
    pub poll_interval: Duration,
    pub cache_ttl: Duration,
    pub cache_sweep_interval: Duration,
    pub action_timeout: Duration,
    pub action_backoff: Duration,
    pub workers: usize,
    pub fencing_label: String,
    pub driver: String,
    pub listen: SocketAddr,
    pub log_format: LogFormat,
    pub log_level: LogLevel,
}

impl FencingConfig {
    pub fn from_env() -> Result<Self, DynError> {
        Self::from_lookup(|name| env::var(name).ok())
    }

    /// Builds the configuration from an arbitrary variable source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, DynError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let raw = |param: Config| -> Option<String> {
            lookup(param.env_var())
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
                .or_else(|| param.default_value().map(str::to_string))
        };
        let duration = |param: Config| -> Result<Option<Duration>, DynError> {
            raw(param)
                .map(|value| {
                    humantime::parse_duration(&value)
                        .map_err(|err| with_context(err, invalid(param, &value)))
                })
                .transpose()
        };
        let required = |param: Config| -> Result<String, DynError> {
            raw(param).ok_or_else(|| format!("{} must be set", param.env_var()).into())
        };
        let required_duration = |param: Config| -> Result<Duration, DynError> {
            duration(param)?.ok_or_else(|| format!("{} must be set", param.env_var()).into())
        };

        let cache_ttl = required_duration(Config::CacheTtl)?;
        if cache_ttl.is_zero() {
            return Err(format!("{} must be greater than zero", Config::CacheTtl.env_var()).into());
        }
        let cache_sweep_interval = duration(Config::CacheSweepInterval)?
            .filter(|interval| !interval.is_zero())
            .unwrap_or_else(|| cache_ttl.saturating_mul(5));

        let workers_raw = required(Config::Workers)?;
        let workers = workers_raw
            .parse::<usize>()
            .map_err(|err| with_context(err, invalid(Config::Workers, &workers_raw)))?
            .max(1);

        let listen_raw = required(Config::Listen)?;
        let listen = listen_raw
            .parse::<SocketAddr>()
            .map_err(|err| with_context(err, invalid(Config::Listen, &listen_raw)))?;

        let format_raw = required(Config::LogFormat)?;
        let log_format = format_raw
            .parse::<LogFormat>()
            .map_err(|err| with_context(err, invalid(Config::LogFormat, &format_raw)))?;

        let level_raw = required(Config::LogLevel)?;
        let log_level = level_raw
            .parse::<LogLevel>()
            .map_err(|err| with_context(err, invalid(Config::LogLevel, &level_raw)))?;

        Ok(FencingConfig {
            backend_endpoint: required(Config::BackendEndpoint)?
                .trim_end_matches('/')
                .to_string(),
            backend_timeout: required_duration(Config::BackendTimeout)?,
            poll_interval: required_duration(Config::PollInterval)?,
            cache_ttl,
            cache_sweep_interval,
            action_timeout: required_duration(Config::ActionTimeout)?,
            action_backoff: required_duration(Config::ActionBackoff)?,
            workers,
            fencing_label: required(Config::FencingLabel)?,
            driver: required(Config::Driver)?,
            listen,
            log_format,
            log_level,
        })
    }
}

fn invalid(param: Config, value: &str) -> String {
    format!("invalid value '{}' for {}", value, param.env_var())
}

/// Raises `requested` to the poll floor. Returns the effective interval and
/// whether clamping happened.
pub fn clamp_poll_interval(requested: Duration) -> (Duration, bool) {
    if requested < MIN_POLL_INTERVAL {
        (MIN_POLL_INTERVAL, true)
    } else {
        (requested, false)
    }
}

/// Parses a label value the way Kubernetes tooling parses booleans.
/// Anything unrecognised yields `None`.
pub fn parse_bool(value: &str) -> Option<bool> {
    match value {
        "1" | "t" | "T" | "TRUE" | "true" | "True" => Some(true),
        "0" | "f" | "F" | "FALSE" | "false" | "False" => Some(false),
        _ => None,
    }
}
