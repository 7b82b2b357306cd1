// Licensed to the Apache Software Foundation (ASF) under one
// or more contributor license agreements.  See the NOTICE file
// distributed with this work for additional information
// regarding copyright ownership.  The ASF licenses this file
// to you under the Apache License, Version 2.0 (the
// "License"); you may not use this file except in compliance
// with the License.  You may obtain a copy of the License at
//
//   http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing,
// software distributed under the License is distributed on an
// "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied.  See the License for the
// specific language governing permissions and limitations
// under the License.
//! Min/max range runtime filter.
//!
//! Tracks the interval hull of all non-null build keys. Integer and string keys
//! are compared within their own type only; a probe key of another type is never
//! rejected.

use std::cmp::Ordering;

use crate::common::status::{Status, StatusResult};
use crate::exec::chunk::{KeyColumn, KeyValue};

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct MinMaxFilter {
    bounds: Option<(KeyValue, KeyValue)>,
}

fn same_type(a: &KeyValue, b: &KeyValue) -> bool {
    matches!(
        (a, b),
        (KeyValue::Int(_), KeyValue::Int(_)) | (KeyValue::Utf8(_), KeyValue::Utf8(_))
    )
}

impl MinMaxFilter {
    /// Range containing nothing. Rejects every key until something is inserted.
    pub fn empty() -> Self {
        Self { bounds: None }
    }

    pub fn from_bounds(min: KeyValue, max: KeyValue) -> StatusResult<Self> {
        if !same_type(&min, &max) {
            return Err(Status::invalid_argument(format!(
                "runtime min/max bounds type mismatch: {} vs {}",
                min, max
            )));
        }
        if min > max {
            return Err(Status::invalid_argument(format!(
                "runtime min/max bounds inverted: {} > {}",
                min, max
            )));
        }
        Ok(Self {
            bounds: Some((min, max)),
        })
    }

    pub fn bounds(&self) -> Option<(&KeyValue, &KeyValue)> {
        self.bounds.as_ref().map(|(min, max)| (min, max))
    }

    pub fn is_empty(&self) -> bool {
        self.bounds.is_none()
    }

    pub fn insert(&mut self, key: &KeyValue) -> StatusResult<()> {
        match &mut self.bounds {
            None => {
                self.bounds = Some((key.clone(), key.clone()));
            }
            Some((min, max)) => {
                if !same_type(min, key) {
                    return Err(Status::invalid_argument(format!(
                        "runtime min/max insert type mismatch: {} vs {}",
                        min, key
                    )));
                }
                if key < min {
                    *min = key.clone();
                }
                if key > max {
                    *max = key.clone();
                }
            }
        }
        Ok(())
    }

    pub fn insert_column(&mut self, keys: &KeyColumn<'_>) -> StatusResult<()> {
        for row in 0..keys.len() {
            if let Some(key) = keys.value(row) {
                self.insert(&key)?;
            }
        }
        Ok(())
    }

    /// Interval hull of both ranges.
    pub fn merge_from(&mut self, other: &MinMaxFilter) -> StatusResult<()> {
        if let Some((min, max)) = &other.bounds {
            self.insert(min)?;
            self.insert(max)?;
        }
        Ok(())
    }

    pub fn test(&self, key: &KeyValue) -> bool {
        let Some((min, max)) = &self.bounds else {
            return false;
        };
        if !same_type(min, key) {
            return true;
        }
        key.cmp(min) != Ordering::Less && key.cmp(max) != Ordering::Greater
    }

    /// Whether any key in `[lo, hi]` could pass.
    pub fn overlaps(&self, lo: &KeyValue, hi: &KeyValue) -> bool {
        let Some((min, max)) = &self.bounds else {
            return false;
        };
        if !same_type(min, lo) || !same_type(min, hi) {
            return true;
        }
        lo <= max && hi >= min
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn merge_is_interval_hull() {
        let mut a = MinMaxFilter::from_bounds(KeyValue::Int(5), KeyValue::Int(10)).unwrap();
        let b = MinMaxFilter::from_bounds(KeyValue::Int(-3), KeyValue::Int(7)).unwrap();
        a.merge_from(&b).unwrap();
        assert_eq!(
            a.bounds(),
            Some((&KeyValue::Int(-3), &KeyValue::Int(10)))
        );
        a.merge_from(&MinMaxFilter::empty()).unwrap();
        assert_eq!(
            a.bounds(),
            Some((&KeyValue::Int(-3), &KeyValue::Int(10)))
        );
    }

    #[test]
    fn empty_range_rejects_everything() {
        let f = MinMaxFilter::empty();
        assert!(!f.test(&KeyValue::Int(0)));
        assert!(!f.overlaps(&KeyValue::Int(0), &KeyValue::Int(100)));
    }

    #[test]
    fn test_and_overlap_are_exact() {
        let f = MinMaxFilter::from_bounds(KeyValue::Int(10), KeyValue::Int(20)).unwrap();
        assert!(f.test(&KeyValue::Int(10)));
        assert!(f.test(&KeyValue::Int(20)));
        assert!(!f.test(&KeyValue::Int(21)));
        assert!(f.overlaps(&KeyValue::Int(0), &KeyValue::Int(10)));
        assert!(!f.overlaps(&KeyValue::Int(21), &KeyValue::Int(30)));
        assert!(f.test(&KeyValue::Utf8("x".to_string())));
    }

    #[test]
    fn mixed_types_are_rejected_on_insert() {
        let mut f = MinMaxFilter::empty();
        f.insert(&KeyValue::Int(1)).unwrap();
        assert!(f.insert(&KeyValue::Utf8("a".to_string())).is_err());
        assert!(MinMaxFilter::from_bounds(KeyValue::Int(3), KeyValue::Int(1)).is_err());
    }
}
