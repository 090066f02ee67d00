// Copyright 2019-2020 Benjamin Fry <benjaminfry@me.com>
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Launcher configuration.
//!
//! Values are taken, in order of precedence, from the command line, from `MINIUM_*` environment variables
//!   (a `.env` file in the working directory is loaded into the environment first), from an optional TOML
//!   file, and finally from the defaults below.

use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use clap::{Args, ValueEnum};
use serde::{Deserialize, Serialize};

use crate::app::{AppRef, AppSettings};
use crate::error::ErrorKind;
use crate::procs::RestartPolicy;
use crate::Error;

pub const DEFAULT_APP: &str = "run:app";
pub const DEFAULT_PORT: u16 = 8000;
pub const DEFAULT_WORKERS: usize = 4;
pub const DEFAULT_GRACEFUL_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_MAX_RESTARTS: u32 = 5;
pub const DEFAULT_RESTART_WINDOW: Duration = Duration::from_secs(60);
pub const DEFAULT_ALLOWED_ORIGINS: &[&str] = &[
    "http://localhost:3000",
    "http://127.0.0.1:3000",
    "http://localhost:4200",
    "http://127.0.0.1:4200",
];

/// All interfaces, not only loopback
pub fn default_bind() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], DEFAULT_PORT))
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum Profile {
    #[default]
    Development,
    Production,
    Testing,
}

impl Profile {
    /// Filter used when `RUST_LOG` is not set
    pub fn default_log_filter(self) -> &'static str {
        match self {
            Profile::Development => "minium=debug,tower_http=debug,info",
            Profile::Production => "info",
            Profile::Testing => "warn",
        }
    }
}

/// Arguments of the `serve` command
#[derive(Args, Clone, Debug, Default)]
pub struct ServeArgs {
    /// Application to serve, as `module:object`
    #[arg(value_name = "APP", env = "MINIUM_APP")]
    pub app: Option<String>,

    /// Address to bind the shared listening socket to [default: 0.0.0.0:8000]
    #[arg(short, long, value_name = "ADDR", env = "MINIUM_BIND")]
    pub bind: Option<SocketAddr>,

    /// Number of worker processes [default: 4]
    #[arg(short, long, value_name = "NUMBER", env = "MINIUM_WORKERS")]
    pub workers: Option<usize>,

    /// Runtime profile of the application [default: development]
    #[arg(long, value_enum, env = "MINIUM_ENV")]
    pub profile: Option<Profile>,

    /// Worker restarts allowed within the restart window, 0 disables restarts [default: 5]
    #[arg(long, value_name = "NUMBER", env = "MINIUM_MAX_RESTARTS")]
    pub max_restarts: Option<u32>,

    /// Length of the restart window in seconds [default: 60]
    #[arg(long, value_name = "SECS", env = "MINIUM_RESTART_WINDOW")]
    pub restart_window: Option<u64>,

    /// Seconds workers get to finish in-flight requests on shutdown [default: 30]
    #[arg(long, value_name = "SECS", env = "MINIUM_GRACEFUL_TIMEOUT")]
    pub graceful_timeout: Option<u64>,

    /// Comma separated origins allowed by CORS
    #[arg(long, value_name = "ORIGINS", value_delimiter = ',', env = "MINIUM_ALLOWED_ORIGINS")]
    pub allowed_origins: Vec<String>,

    /// Emit logs as JSON [default: true in production]
    #[arg(
        long,
        value_name = "BOOL",
        num_args = 0..=1,
        default_missing_value = "true",
        env = "MINIUM_LOG_JSON"
    )]
    pub log_json: Option<bool>,

    /// TOML configuration file
    #[arg(short, long, value_name = "FILE", env = "MINIUM_CONFIG")]
    pub config: Option<PathBuf>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RestartFileConfig {
    pub max_restarts: Option<u32>,
    pub window_secs: Option<u64>,
}

/// Layout of the optional TOML configuration file
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FileConfig {
    pub app: Option<String>,
    pub bind: Option<SocketAddr>,
    pub workers: Option<usize>,
    pub profile: Option<Profile>,
    pub graceful_timeout_secs: Option<u64>,
    pub allowed_origins: Option<Vec<String>>,
    pub log_json: Option<bool>,
    #[serde(default)]
    pub restart: RestartFileConfig,
}

impl FileConfig {
    pub fn load(path: &Path) -> Result<Self, Error> {
        let contents = fs::read_to_string(path).map_err(|e| {
            ErrorKind::Config(format!("failed to read {}: {}", path.display(), e))
        })?;

        Self::parse(&contents)
            .map_err(|e| ErrorKind::Config(format!("{}: {}", path.display(), e)).into())
    }

    pub fn parse(contents: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(contents)
    }
}

/// Fully resolved configuration of the worker pool
#[derive(Clone, Debug)]
pub struct ServeSettings {
    pub app: AppRef,
    pub bind: SocketAddr,
    pub workers: usize,
    pub profile: Profile,
    pub restart: RestartPolicy,
    pub graceful_timeout: Duration,
    pub allowed_origins: Vec<String>,
    pub log_json: bool,
}

impl ServeSettings {
    /// Reads the config file named by the arguments, if any, and merges it beneath them
    pub fn resolve(args: &ServeArgs) -> Result<Self, Error> {
        let file = match args.config {
            Some(ref path) => FileConfig::load(path)?,
            None => FileConfig::default(),
        };

        Self::merge(args, file)
    }

    pub fn merge(args: &ServeArgs, file: FileConfig) -> Result<Self, Error> {
        let app = args
            .app
            .clone()
            .or(file.app)
            .unwrap_or_else(|| DEFAULT_APP.to_string());
        // an unparseable reference is a load failure, it names the object that can't be resolved
        let app = app.parse::<AppRef>()?;

        let workers = args.workers.or(file.workers).unwrap_or(DEFAULT_WORKERS);
        if workers == 0 {
            return Err(ErrorKind::Config("workers must be at least 1".to_string()).into());
        }

        let profile = args.profile.or(file.profile).unwrap_or_default();

        let restart = RestartPolicy {
            max_restarts: args
                .max_restarts
                .or(file.restart.max_restarts)
                .unwrap_or(DEFAULT_MAX_RESTARTS),
            window: args
                .restart_window
                .or(file.restart.window_secs)
                .map(Duration::from_secs)
                .unwrap_or(DEFAULT_RESTART_WINDOW),
        };
        if restart.window.is_zero() && restart.max_restarts > 0 {
            return Err(ErrorKind::Config("restart window must be at least 1 second".to_string()).into());
        }

        let allowed_origins = if !args.allowed_origins.is_empty() {
            args.allowed_origins.clone()
        } else {
            file.allowed_origins.unwrap_or_else(|| {
                DEFAULT_ALLOWED_ORIGINS
                    .iter()
                    .map(|s| s.to_string())
                    .collect()
            })
        };
        let allowed_origins = allowed_origins
            .into_iter()
            .map(|origin| origin.trim().to_string())
            .filter(|origin| !origin.is_empty())
            .collect();

        Ok(Self {
            app,
            bind: args.bind.or(file.bind).unwrap_or_else(default_bind),
            workers,
            profile,
            restart,
            graceful_timeout: args
                .graceful_timeout
                .or(file.graceful_timeout_secs)
                .map(Duration::from_secs)
                .unwrap_or(DEFAULT_GRACEFUL_TIMEOUT),
            allowed_origins,
            log_json: args
                .log_json
                .or(file.log_json)
                .unwrap_or(profile == Profile::Production),
        })
    }

    pub fn app_settings(&self) -> AppSettings {
        AppSettings {
            profile: self.profile,
            allowed_origins: self.allowed_origins.clone(),
        }
    }
}
