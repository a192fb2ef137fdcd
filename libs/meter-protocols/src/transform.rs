//! Per-attribute value transforms
//!
//! Some meters report magnitudes in unsigned registers and publish the sign
//! (import/export, lead/lag) through another attribute; others need a fixed
//! scale factor. The transform table is keyed by attribute name and applied
//! once every block of a poll has been decoded.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::codec::round2;

/// Post-processing applied to one decoded attribute
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum ValueTransform {
    /// Multiply by a constant factor
    Scale { factor: f64 },
    /// Give the magnitude the sign of another attribute
    SignFrom { source: String },
    /// Flip the sign
    Negate,
}

/// Transforms keyed by attribute name
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TransformTable {
    entries: HashMap<String, ValueTransform>,
}

impl TransformTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, attribute: impl Into<String>, transform: ValueTransform) {
        self.entries.insert(attribute.into(), transform);
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Apply every transform to `values` in place.
    ///
    /// Sign sources are read from the untransformed values so the result does
    /// not depend on iteration order.
    pub fn apply(&self, values: &mut HashMap<String, f64>) {
        if self.entries.is_empty() {
            return;
        }

        let raw = values.clone();
        for (attribute, transform) in &self.entries {
            let Some(value) = values.get_mut(attribute) else {
                continue;
            };
            match transform {
                ValueTransform::Scale { factor } => *value = round2(*value * factor),
                ValueTransform::Negate => *value = -*value,
                ValueTransform::SignFrom { source } => match raw.get(source) {
                    Some(sign) if *sign < 0.0 => *value = -value.abs(),
                    Some(_) => *value = value.abs(),
                    None => warn!(
                        "Sign source '{}' for '{}' missing from reading",
                        source, attribute
                    ),
                },
            }
        }
    }
}

impl FromIterator<(String, ValueTransform)> for TransformTable {
    fn from_iter<T: IntoIterator<Item = (String, ValueTransform)>>(iter: T) -> Self {
        Self {
            entries: iter.into_iter().collect(),
        }
    }
}
