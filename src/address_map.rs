//! Logical point map
//!
//! Configuration describes PLC points as newline-separated `class,name,address`
//! triples:
//!
//! ```text
//! I,I1,0
//! I,I2,1
//! Q,Q1,8192
//! ```
//!
//! `class` is `I` for discrete inputs, `Q` for coils, or a free-form tag for
//! analog points where `0` marks the low word of a 32-bit pair.

use std::collections::HashSet;

use crate::error::{GatewayError, GatewayResult};

/// Class marking the low word of a 32-bit analog pair.
pub const LOW_WORD_CLASS: &str = "0";

/// Register class of a digital point, derived from its class tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PointKind {
    DiscreteInput,
    Coil,
}

/// Index-aligned `class` / `name` / `address` sequences.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AddressMap {
    class: Vec<String>,
    name: Vec<String>,
    address: Vec<u16>,
}

/// One row of an [`AddressMap`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Point<'a> {
    pub class: &'a str,
    pub name: &'a str,
    pub address: u16,
}

impl Point<'_> {
    /// Digital kind from the first character of the class tag.
    pub fn kind(&self) -> Option<PointKind> {
        match self.class.chars().next() {
            Some('I') => Some(PointKind::DiscreteInput),
            Some('Q') => Some(PointKind::Coil),
            _ => None,
        }
    }

    pub fn is_low_word(&self) -> bool {
        self.class == LOW_WORD_CLASS
    }
}

impl AddressMap {
    /// Parse the `class,name,address` text format.
    ///
    /// Blank lines are skipped; any malformed line fails the whole map.
    pub fn parse(text: &str) -> GatewayResult<Self> {
        let mut map = Self::default();
        let mut seen = HashSet::new();

        for (index, raw) in text.lines().enumerate() {
            let line = raw.trim();
            if line.is_empty() {
                continue;
            }
            let fields: Vec<&str> = line.split(',').map(str::trim).collect();
            let [class, name, address] = fields[..] else {
                return Err(GatewayError::config(format!(
                    "line {}: expected 3 fields, got {}: {:?}",
                    index + 1,
                    fields.len(),
                    line
                )));
            };
            if class.is_empty() || name.is_empty() {
                return Err(GatewayError::config(format!(
                    "line {}: empty class or name: {:?}",
                    index + 1,
                    line
                )));
            }
            let address: u16 = address.parse().map_err(|e| {
                GatewayError::config(format!(
                    "line {}: bad address {:?}: {}",
                    index + 1,
                    address,
                    e
                ))
            })?;
            if !seen.insert(name.to_string()) {
                return Err(GatewayError::config(format!(
                    "line {}: duplicate name {:?}",
                    index + 1,
                    name
                )));
            }

            map.class.push(class.to_string());
            map.name.push(name.to_string());
            map.address.push(address);
        }
        Ok(map)
    }

    pub fn len(&self) -> usize {
        self.name.len()
    }

    pub fn is_empty(&self) -> bool {
        self.name.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<Point<'_>> {
        Some(Point {
            class: self.class.get(index)?,
            name: self.name.get(index)?,
            address: *self.address.get(index)?,
        })
    }

    pub fn iter(&self) -> impl Iterator<Item = Point<'_>> + '_ {
        (0..self.len()).filter_map(move |i| self.get(i))
    }

    /// All addresses, in map order.
    pub fn addresses(&self) -> &[u16] {
        &self.address
    }

    /// Points of one digital kind, in map order.
    pub fn points_of(&self, kind: PointKind) -> impl Iterator<Item = Point<'_>> + '_ {
        self.iter().filter(move |p| p.kind() == Some(kind))
    }

    /// Exact-name lookup.
    pub fn find(&self, name: &str) -> Option<Point<'_>> {
        let index = self.name.iter().position(|n| n == name)?;
        self.get(index)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const READ_MAP: &str = "I,I1,0\nI,I2,1\n\n  Q,Q1,8192  \nI,I3,2\n";

    #[test]
    fn test_parse_keeps_alignment() {
        let map = AddressMap::parse(READ_MAP).unwrap();
        assert_eq!(map.len(), 4);
        assert_eq!(map.addresses(), &[0, 1, 8192, 2]);
        let q1 = map.get(2).unwrap();
        assert_eq!((q1.class, q1.name, q1.address), ("Q", "Q1", 8192));
        assert_eq!(q1.kind(), Some(PointKind::Coil));
    }

    #[test]
    fn test_points_of_kind() {
        let map = AddressMap::parse(READ_MAP).unwrap();
        let inputs: Vec<&str> = map.points_of(PointKind::DiscreteInput).map(|p| p.name).collect();
        assert_eq!(inputs, vec!["I1", "I2", "I3"]);
        assert_eq!(map.points_of(PointKind::Coil).count(), 1);
    }

    #[test]
    fn test_empty_text_is_empty_map() {
        let map = AddressMap::parse("\n  \n").unwrap();
        assert!(map.is_empty());
    }

    #[test]
    fn test_wrong_field_count_fails() {
        assert!(matches!(
            AddressMap::parse("I,I1,0\nQ,Q1"),
            Err(GatewayError::Config { .. })
        ));
        assert!(AddressMap::parse("I,I1,0,9").is_err());
    }

    #[test]
    fn test_non_numeric_address_fails() {
        assert!(AddressMap::parse("I,I1,zero").is_err());
        assert!(AddressMap::parse("I,I1,70000").is_err());
        assert!(AddressMap::parse("I,I1,-1").is_err());
    }

    #[test]
    fn test_duplicate_name_fails() {
        assert!(AddressMap::parse("Q,Q1,8192\nQ,Q1,8193").is_err());
    }

    #[test]
    fn test_find_and_low_word() {
        let map = AddressMap::parse("AI,ENERGY_HI,1032\n0,ENERGY,1033").unwrap();
        assert!(map.find("ENERGY").unwrap().is_low_word());
        assert!(!map.find("ENERGY_HI").unwrap().is_low_word());
        assert!(map.find("energy").is_none());
    }
}
