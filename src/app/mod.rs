// Copyright 2019-2020 Benjamin Fry <benjaminfry@me.com>
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Applications that can be served by the worker pool.
//!
//! An application is referenced as `module:object`. Every module and object known to the binary is
//!   registered in an [`AppRegistry`], loading a reference calls the registered factory and yields the
//!   [`axum::Router`] a worker serves.

pub mod run;

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use axum::Router;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::Profile;

/// Object name used when a reference only names a module
pub const DEFAULT_OBJECT: &str = "app";

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AppLoadError {
    #[error("invalid application reference `{0}`, expected `module:object`")]
    InvalidReference(String),
    #[error("failed to load application: no module named `{module}`")]
    ModuleNotFound { module: String },
    #[error("failed to load application: module `{module}` has no object `{object}` (available: {})", .available.join(", "))]
    ObjectNotFound {
        module: String,
        object: String,
        available: Vec<String>,
    },
    #[error("failed to load application `{reference}`: {reason}")]
    Failed { reference: String, reason: String },
}

/// A reference to an application object, `module:object`
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct AppRef {
    module: String,
    object: String,
}

impl AppRef {
    pub fn new(module: &str, object: &str) -> Self {
        Self {
            module: module.to_string(),
            object: object.to_string(),
        }
    }

    pub fn module(&self) -> &str {
        &self.module
    }

    pub fn object(&self) -> &str {
        &self.object
    }
}

fn is_identifier(s: &str) -> bool {
    let mut chars = s.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => (),
        _ => return false,
    }

    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

impl FromStr for AppRef {
    type Err = AppLoadError;

    /// Accepts `module:object`, `module` and `module.py`, the latter two naming the object `app`
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || AppLoadError::InvalidReference(s.to_string());
        let trimmed = s.trim();

        let (module, object) = match trimmed.split_once(':') {
            Some((module, object)) => (module, object),
            None => (trimmed, DEFAULT_OBJECT),
        };
        let module = module.strip_suffix(".py").unwrap_or(module);

        if !module.split('.').all(is_identifier) || !is_identifier(object) {
            return Err(invalid());
        }

        Ok(Self::new(module, object))
    }
}

impl fmt::Display for AppRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.module, self.object)
    }
}

/// Settings handed to an application factory
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppSettings {
    pub profile: Profile,
    pub allowed_origins: Vec<String>,
}

/// Builds an application, each worker calls this once for its own copy
pub type AppFactory = fn(&AppSettings) -> Result<Router, AppLoadError>;

#[derive(Clone, Default)]
pub struct AppRegistry {
    modules: BTreeMap<String, BTreeMap<String, AppFactory>>,
}

impl AppRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// The applications shipped with this binary
    pub fn builtin() -> Self {
        let mut registry = Self::new();
        registry.register(run::MODULE, run::OBJECT, run::app);
        registry
    }

    pub fn register(&mut self, module: &str, object: &str, factory: AppFactory) -> &mut Self {
        self.modules
            .entry(module.to_string())
            .or_default()
            .insert(object.to_string(), factory);
        self
    }

    pub fn resolve(&self, app: &AppRef) -> Result<AppFactory, AppLoadError> {
        let objects = self
            .modules
            .get(app.module())
            .ok_or_else(|| AppLoadError::ModuleNotFound {
                module: app.module().to_string(),
            })?;

        objects
            .get(app.object())
            .copied()
            .ok_or_else(|| AppLoadError::ObjectNotFound {
                module: app.module().to_string(),
                object: app.object().to_string(),
                available: objects.keys().cloned().collect(),
            })
    }

    pub fn load(&self, app: &AppRef, settings: &AppSettings) -> Result<Router, AppLoadError> {
        let factory = self.resolve(app)?;
        factory(settings)
    }
}

impl fmt::Debug for AppRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut list = f.debug_list();
        for (module, objects) in &self.modules {
            for object in objects.keys() {
                list.entry(&format_args!("{}:{}", module, object));
            }
        }
        list.finish()
    }
}
