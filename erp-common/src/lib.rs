//! ERP Common - Shared configuration, validation, errors and logging for the
//! ERP API gateway.
//!
//! This crate provides:
//! - Configuration types and loading
//! - Configuration validation
//! - Error types and handling utilities
//! - Logging setup and request trace ids

#![warn(clippy::all)]
#![allow(clippy::pedantic)]

pub mod config;
pub mod error;
pub mod logging;
pub mod validation;

pub use config::{
    AbuseConfig, AuthConfig, BucketLimit, Config, EndpointLimit, ObservabilityConfig,
    OverrideStoreConfig, RateLimitsConfig, RewriteEntry, RouteEntry, ServerConfig,
    StaticOverrides, TenantLimit,
};
pub use error::{Error, Result};
pub use validation::{Validate, ValidationError, ValidationResult};
