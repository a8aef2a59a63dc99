//! Central schema of the application state record.
//!
//! Each key is declared once with the Rust type its value must deserialize
//! into. Readers and writers go through these descriptors instead of agreeing
//! on a shape by convention.

use std::fmt;
use std::marker::PhantomData;

use serde::{Deserialize, Serialize};

/// Typed name of a state entry.
pub struct StateKey<T> {
    name: &'static str,
    _shape: PhantomData<fn() -> T>,
}

impl<T> StateKey<T> {
    pub const fn new(name: &'static str) -> Self {
        Self {
            name,
            _shape: PhantomData,
        }
    }

    pub const fn name(&self) -> &'static str {
        self.name
    }
}

impl<T> Clone for StateKey<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for StateKey<T> {}

impl<T> fmt::Debug for StateKey<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("StateKey").field(&self.name).finish()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Location {
    pub city: String,
    pub country: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub latitude: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub longitude: Option<f64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Theme {
    #[default]
    Light,
    Dark,
    System,
}

pub const LANGUAGE: StateKey<String> = StateKey::new("language");
pub const LOCATION: StateKey<Location> = StateKey::new("location");
pub const RECITER: StateKey<String> = StateKey::new("reciter");
pub const CALCULATION_METHOD: StateKey<String> = StateKey::new("calculation_method");
pub const THEME: StateKey<Theme> = StateKey::new("theme");
pub const ONBOARDING_COMPLETED: StateKey<bool> = StateKey::new("onboarding_completed");
pub const NOTIFICATIONS_ENABLED: StateKey<bool> = StateKey::new("notifications_enabled");
/// View identifier last requested through `view:change`.
pub const CURRENT_VIEW: StateKey<String> = StateKey::new("current_view");

/// Check that `value` has the shape declared for `key`. Keys outside the
/// schema are accepted as-is.
pub fn validate(key: &str, value: &serde_json::Value) -> Result<(), String> {
    fn shape<T: serde::de::DeserializeOwned>(value: &serde_json::Value) -> Result<(), String> {
        T::deserialize(value).map(|_| ()).map_err(|err| err.to_string())
    }

    match key {
        k if k == LANGUAGE.name() => shape::<String>(value),
        k if k == LOCATION.name() => shape::<Location>(value),
        k if k == RECITER.name() => shape::<String>(value),
        k if k == CALCULATION_METHOD.name() => shape::<String>(value),
        k if k == THEME.name() => shape::<Theme>(value),
        k if k == ONBOARDING_COMPLETED.name() => shape::<bool>(value),
        k if k == NOTIFICATIONS_ENABLED.name() => shape::<bool>(value),
        k if k == CURRENT_VIEW.name() => shape::<String>(value),
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn validate_checks_declared_shapes() {
        assert!(validate("theme", &json!("dark")).is_ok());
        assert!(validate("theme", &json!("neon")).is_err());
        assert!(validate("onboarding_completed", &json!("yes")).is_err());
        assert!(validate("location", &json!({"city": "Fes", "country": "Morocco"})).is_ok());
        assert!(validate("feature_private", &json!([1, 2, 3])).is_ok());
    }
}
