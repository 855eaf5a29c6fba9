//! # Read Batching
//!
//! Plans the smallest number of Modbus reads that cover a set of point addresses.
//!
//! ## Bits (FC01/FC02)
//!
//! Bits pack eight per byte, so one read over `[min, max]` is cheap even when
//! it covers unused addresses. A [`BitSpan`] is that single read; each point is
//! found by its offset from the span start.
//!
//! ## Registers (FC04)
//!
//! Every register costs two bytes, so gaps are not read. Addresses are sorted,
//! de-duplicated and cut into maximal contiguous [`RegisterRun`]s; every unique
//! address occupies exactly one slot of the concatenated run data, so slot `i`
//! belongs to the `i`-th unique address.
//!
//! ```rust
//! use logo_wialon_gateway::batcher::{AnalogReadPlan, RegisterRun};
//!
//! let plan = AnalogReadPlan::new(&[1034, 1032, 1033, 1039], 125);
//! assert_eq!(
//!     plan.runs(),
//!     &[RegisterRun { start: 1032, quantity: 3 }, RegisterRun { start: 1039, quantity: 1 }]
//! );
//! ```

use crate::bytes::register_to_analog;
use crate::constants::MAX_READ_COILS;
use crate::error::{GatewayError, GatewayResult};

/// One contiguous bit read covering every requested address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BitSpan {
    pub start: u16,
    pub quantity: u16,
}

impl BitSpan {
    /// Span `[min, max]` of `addresses`, or `None` when there is nothing to read.
    ///
    /// Fails when the span is wider than a single FC01/FC02 read allows.
    pub fn covering(addresses: &[u16]) -> GatewayResult<Option<Self>> {
        let (Some(&start), Some(&end)) = (addresses.iter().min(), addresses.iter().max()) else {
            return Ok(None);
        };
        let quantity = usize::from(end - start) + 1;
        if quantity > MAX_READ_COILS {
            return Err(GatewayError::invalid_data(format!(
                "bit addresses {}..={} span {} points, more than one read allows ({})",
                start, end, quantity, MAX_READ_COILS
            )));
        }
        Ok(Some(Self {
            start,
            quantity: quantity as u16,
        }))
    }

    /// Pick each requested address out of the bits read for this span.
    ///
    /// Bits missing from `bits` read as `false`.
    pub fn extract(&self, addresses: &[u16], bits: &[bool]) -> Vec<bool> {
        addresses
            .iter()
            .map(|&address| {
                let offset = usize::from(address - self.start);
                bits.get(offset).copied().unwrap_or(false)
            })
            .collect()
    }
}

/// One contiguous register read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegisterRun {
    pub start: u16,
    pub quantity: u16,
}

impl RegisterRun {
    fn end(&self) -> u32 {
        u32::from(self.start) + u32::from(self.quantity)
    }
}

/// Cut ascending, de-duplicated addresses into maximal contiguous runs of at
/// most `max_run` registers.
pub fn plan_register_runs(sorted_unique: &[u16], max_run: u16) -> Vec<RegisterRun> {
    let mut runs: Vec<RegisterRun> = Vec::new();
    for &address in sorted_unique {
        match runs.last_mut() {
            Some(run) if u32::from(address) == run.end() && run.quantity < max_run => {
                run.quantity += 1;
            }
            _ => runs.push(RegisterRun {
                start: address,
                quantity: 1,
            }),
        }
    }
    runs
}

/// Read plan for a list of analog addresses in caller order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AnalogReadPlan {
    unique: Vec<u16>,
    runs: Vec<RegisterRun>,
}

impl AnalogReadPlan {
    pub fn new(addresses: &[u16], max_run: u16) -> Self {
        let mut unique = addresses.to_vec();
        unique.sort_unstable();
        unique.dedup();
        let runs = plan_register_runs(&unique, max_run.max(1));
        Self { unique, runs }
    }

    pub fn runs(&self) -> &[RegisterRun] {
        &self.runs
    }

    pub fn is_empty(&self) -> bool {
        self.runs.is_empty()
    }

    /// Number of registers the runs read in total.
    pub fn register_count(&self) -> usize {
        self.unique.len()
    }

    /// Map the concatenated run registers back onto `addresses` (caller order).
    pub fn resolve(&self, addresses: &[u16], registers: &[u16]) -> GatewayResult<Vec<f32>> {
        if registers.len() != self.unique.len() {
            return Err(GatewayError::frame(format!(
                "expected {} registers across {} runs, got {}",
                self.unique.len(),
                self.runs.len(),
                registers.len()
            )));
        }
        addresses
            .iter()
            .map(|address| {
                self.unique
                    .binary_search(address)
                    .map(|slot| register_to_analog(registers[slot]))
                    .map_err(|_| {
                        GatewayError::invalid_data(format!("address {} not in read plan", address))
                    })
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_bit_span_empty() {
        assert_eq!(BitSpan::covering(&[]).unwrap(), None);
    }

    #[test]
    fn test_bit_span_ignores_order() {
        let span = BitSpan::covering(&[8194, 8192, 8193]).unwrap().unwrap();
        assert_eq!(span, BitSpan { start: 8192, quantity: 3 });
    }

    #[test]
    fn test_bit_span_too_wide() {
        assert!(BitSpan::covering(&[0, 2000]).is_err());
        assert!(BitSpan::covering(&[0, 1999]).is_ok());
        assert!(BitSpan::covering(&[0, u16::MAX]).is_err());
    }

    #[test]
    fn test_bit_span_extract() {
        let span = BitSpan { start: 0, quantity: 4 };
        let bits = [false, true, true, false];
        assert_eq!(span.extract(&[3, 0, 1], &bits), vec![false, false, true]);
        // Offsets past the data read false.
        assert_eq!(span.extract(&[9], &bits), vec![false]);
    }

    #[test]
    fn test_single_contiguous_run() {
        let runs = plan_register_runs(&[1032, 1033, 1034], 125);
        assert_eq!(runs, vec![RegisterRun { start: 1032, quantity: 3 }]);
    }

    #[test]
    fn test_disjoint_runs() {
        let runs = plan_register_runs(&[0, 1, 5, 6, 7, 20], 125);
        assert_eq!(
            runs,
            vec![
                RegisterRun { start: 0, quantity: 2 },
                RegisterRun { start: 5, quantity: 3 },
                RegisterRun { start: 20, quantity: 1 },
            ]
        );
    }

    #[test]
    fn test_runs_split_at_limit() {
        let addresses: Vec<u16> = (0..5).collect();
        let runs = plan_register_runs(&addresses, 2);
        assert_eq!(runs.len(), 3);
        assert_eq!(runs[2], RegisterRun { start: 4, quantity: 1 });
    }

    #[test]
    fn test_run_at_top_of_address_space() {
        let runs = plan_register_runs(&[65534, 65535], 125);
        assert_eq!(runs, vec![RegisterRun { start: 65534, quantity: 2 }]);
    }

    #[test]
    fn test_resolve_restores_caller_order() {
        let addresses = [1039, 1032, 1033, 1032];
        let plan = AnalogReadPlan::new(&addresses, 125);
        assert_eq!(plan.register_count(), 3);
        // Registers for 1032, 1033, 1039 in ascending order.
        let values = plan.resolve(&addresses, &[500, 850, 200]).unwrap();
        assert_eq!(values, vec![200.0, 500.0, 850.0, 500.0]);
    }

    #[test]
    fn test_resolve_rejects_short_data() {
        let plan = AnalogReadPlan::new(&[1, 2], 125);
        assert!(plan.resolve(&[1, 2], &[7]).is_err());
    }

    proptest! {
        #[test]
        fn prop_runs_cover_each_unique_address_once(
            mut addresses in prop::collection::vec(0u16..600, 1..80),
            max_run in 1u16..130,
        ) {
            addresses.sort_unstable();
            addresses.dedup();
            let runs = plan_register_runs(&addresses, max_run);

            let covered: Vec<u16> = runs
                .iter()
                .flat_map(|r| (0..r.quantity).map(move |i| r.start + i))
                .collect();
            prop_assert_eq!(&covered, &addresses);
            prop_assert!(runs.iter().all(|r| r.quantity >= 1 && r.quantity <= max_run));
        }

        #[test]
        fn prop_bit_span_is_min_max(addresses in prop::collection::vec(0u16..1500, 1..50)) {
            let span = BitSpan::covering(&addresses).unwrap().unwrap();
            let min = *addresses.iter().min().unwrap();
            let max = *addresses.iter().max().unwrap();
            prop_assert_eq!(span.start, min);
            prop_assert_eq!(span.quantity, max - min + 1);
        }
    }
}
