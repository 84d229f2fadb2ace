//
// Copyright (c) The Holo Core Contributors
//
// SPDX-License-Identifier: MIT
//

// §S.1: route-label interning. Two routes tagged with the same
// configured label string share one `u16` id; the id is freed back to
// the pool once the last `RouteEntry` carrying it is gone. Id 0 is the
// reserved "none" sentinel (`rtlabel_name2id("")` in the source) and is
// never handed out by `intern`.

use std::collections::HashMap;

pub const RTLABEL_NONE: u16 = 0;

#[derive(Debug, Default)]
pub struct RtLabelTable {
    name_to_id: HashMap<String, u16>,
    id_to_name: HashMap<u16, String>,
    refcount: HashMap<u16, u32>,
    next_id: u16,
}

impl RtLabelTable {
    // `rtlabel_name2id`: looks up an existing id for `name`, allocating
    // a fresh one (bumping its refcount to 1) on first use; a repeat
    // lookup for a name already in the table bumps the existing
    // refcount instead of allocating again.
    pub fn intern(&mut self, name: &str) -> u16 {
        if name.is_empty() {
            return RTLABEL_NONE;
        }
        if let Some(&id) = self.name_to_id.get(name) {
            *self.refcount.entry(id).or_insert(0) += 1;
            return id;
        }
        self.next_id = self.next_id.wrapping_add(1);
        if self.next_id == RTLABEL_NONE {
            self.next_id = 1;
        }
        let id = self.next_id;
        self.name_to_id.insert(name.to_string(), id);
        self.id_to_name.insert(id, name.to_string());
        self.refcount.insert(id, 1);
        id
    }

    // `rtlabel_id2name`: returns "" for the none sentinel or an id this
    // table never allocated, matching the source's empty-string default.
    pub fn name(&self, id: u16) -> &str {
        if id == RTLABEL_NONE {
            return "";
        }
        self.id_to_name.get(&id).map(String::as_str).unwrap_or("")
    }

    // `rtlabel_unref`: drops one reference; once it reaches zero the id
    // is freed back to the pool and can be reused by a future `intern`
    // for a different name (the source keeps names unique only while
    // referenced).
    pub fn unref(&mut self, id: u16) {
        if id == RTLABEL_NONE {
            return;
        }
        let Some(count) = self.refcount.get_mut(&id) else {
            return;
        };
        *count = count.saturating_sub(1);
        if *count == 0 {
            self.refcount.remove(&id);
            if let Some(name) = self.id_to_name.remove(&id) {
                self.name_to_id.remove(&name);
            }
        }
    }

    pub fn refcount(&self, id: u16) -> u32 {
        self.refcount.get(&id).copied().unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_name_is_the_none_sentinel() {
        let mut labels = RtLabelTable::default();
        assert_eq!(labels.intern(""), RTLABEL_NONE);
        assert_eq!(labels.name(RTLABEL_NONE), "");
    }

    #[test]
    fn repeated_interning_shares_one_id_and_refcounts() {
        let mut labels = RtLabelTable::default();
        let a = labels.intern("customer-a");
        let b = labels.intern("customer-a");
        assert_eq!(a, b);
        assert_eq!(labels.refcount(a), 2);
        assert_eq!(labels.name(a), "customer-a");
    }

    #[test]
    fn unref_to_zero_frees_the_id_for_reuse() {
        let mut labels = RtLabelTable::default();
        let a = labels.intern("customer-a");
        labels.unref(a);
        assert_eq!(labels.refcount(a), 0);
        assert_eq!(labels.name(a), "");

        let b = labels.intern("customer-b");
        assert_eq!(labels.name(b), "customer-b");
    }

    #[test]
    fn transient_comparison_reference_does_not_leak() {
        // Mirrors the redistribution-match path in kr_net_match: intern
        // immediately followed by unref is safe because the table
        // entry's own reference (not this transient one) is what keeps
        // the name alive.
        let mut labels = RtLabelTable::default();
        let id = labels.intern("static-routes");
        labels.unref(id); // table entry's reference, held separately
        let transient = labels.intern("static-routes");
        assert_eq!(transient, id);
        assert_eq!(labels.refcount(id), 1);
        labels.unref(transient);
        assert_eq!(labels.refcount(id), 0);
    }
}
