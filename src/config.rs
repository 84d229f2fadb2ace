//
// Copyright (c) The Holo Core Contributors
//
// SPDX-License-Identifier: MIT
//

// §A.3: the typed shape of the configuration this crate consumes.
// Loading it from a file or northbound transaction is out of scope
// (§1); `Config` is a plain data type nothing here parses on its own.

use std::collections::HashMap;

use crate::ktable::check_priority;
use crate::redist::NetworkStatement;

#[derive(Clone, Copy, Debug, Default)]
pub struct TableOverride {
    pub no_fib: bool,
    pub no_fib_sync: bool,
    pub no_evaluate: bool,
}

#[derive(Clone, Debug)]
pub struct Config {
    fib_priority: u8,
    pub table_overrides: HashMap<u32, TableOverride>,
    pub networks: Vec<NetworkStatement>,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct InvalidFibPriority(pub u8);

impl std::fmt::Display for InvalidFibPriority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "fib-priority {} out of range (RTPROT_STATIC, 255)", self.0)
    }
}

impl std::error::Error for InvalidFibPriority {}

impl Config {
    // §A.3/§6: `fib_priority` must lie in `(RTPROT_STATIC, 255)`,
    // matching `kr_check_prio` (see `ktable::check_priority`).
    pub fn new(fib_priority: u8) -> Result<Config, InvalidFibPriority> {
        if !check_priority(fib_priority) {
            return Err(InvalidFibPriority(fib_priority));
        }
        Ok(Config {
            fib_priority,
            table_overrides: HashMap::new(),
            networks: Vec::new(),
        })
    }

    pub fn fib_priority(&self) -> u8 {
        self.fib_priority
    }

    pub fn table_override(&self, rtableid: u32) -> TableOverride {
        self.table_overrides.get(&rtableid).copied().unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fib_priority_range_is_enforced() {
        assert!(Config::new(4).is_err());
        assert!(Config::new(255).is_err());
        assert!(Config::new(64).is_ok());
    }

    #[test]
    fn unconfigured_table_gets_default_overrides() {
        let cfg = Config::new(64).unwrap();
        let ov = cfg.table_override(7);
        assert!(!ov.no_fib);
        assert!(!ov.no_fib_sync);
        assert!(!ov.no_evaluate);
    }
}
