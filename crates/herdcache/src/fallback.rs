//! Fallback ladder for hidden-error mode.
//!
//! Rungs, first value wins:
//!
//! 1. the `on_error` callback, when it returns `Some`
//! 2. the default value, when `fallback_to_default` is set
//! 3. the custom fallback function, called with `(key, operation)`
//! 4. the type's `Default`
//!
//! A rung that fails is logged and skipped.

use crate::error::CacheError;
use crate::metrics;
use crate::options::CacheOptions;

/// Where a fallback value came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FallbackValue<T> {
    FromErrorCallback(T),
    FromDefault(T),
    FromCustomFn(T),
    None,
}

impl<T> FallbackValue<T> {
    pub fn source(&self) -> &'static str {
        match self {
            FallbackValue::FromErrorCallback(_) => "error_callback",
            FallbackValue::FromDefault(_) => "default_value",
            FallbackValue::FromCustomFn(_) => "custom_fn",
            FallbackValue::None => "zero_value",
        }
    }

    pub fn as_option(&self) -> Option<&T> {
        match self {
            FallbackValue::FromErrorCallback(v)
            | FallbackValue::FromDefault(v)
            | FallbackValue::FromCustomFn(v) => Some(v),
            FallbackValue::None => None,
        }
    }

    pub fn into_option(self) -> Option<T> {
        match self {
            FallbackValue::FromErrorCallback(v)
            | FallbackValue::FromDefault(v)
            | FallbackValue::FromCustomFn(v) => Some(v),
            FallbackValue::None => None,
        }
    }
}

impl<T: Default> FallbackValue<T> {
    /// The resolved value; the last rung yields `T::default()`.
    pub fn into_value(self) -> T {
        self.into_option().unwrap_or_default()
    }
}

/// Walk the ladder for `error` raised by `operation` on `key`.
pub fn resolve<T: Clone>(
    opts: &CacheOptions<T>,
    key: &str,
    operation: &str,
    error: &CacheError,
) -> FallbackValue<T> {
    let value = walk(opts, key, operation, error);
    tracing::warn!(
        key = %key,
        operation,
        error = %error,
        source = value.source(),
        "cache fallback activated"
    );
    metrics::record_fallback(value.source());
    value
}

fn walk<T: Clone>(
    opts: &CacheOptions<T>,
    key: &str,
    operation: &str,
    error: &CacheError,
) -> FallbackValue<T> {
    if let Some(on_error) = &opts.on_error {
        match on_error(error) {
            Ok(Some(value)) => return FallbackValue::FromErrorCallback(value),
            Ok(None) => {}
            Err(e) => {
                tracing::warn!(key = %key, operation, error = %e, "error callback failed");
            }
        }
    }

    if opts.fallback_to_default {
        if let Some(value) = &opts.default_value {
            return FallbackValue::FromDefault(value.clone());
        }
    }

    if let Some(custom) = &opts.custom_fallback {
        match custom(key, operation) {
            Ok(value) => return FallbackValue::FromCustomFn(value),
            Err(e) => {
                tracing::warn!(key = %key, operation, error = %e, "custom fallback failed");
            }
        }
    }

    FallbackValue::None
}
