//! 1-Wire network paths.
//!
//! Large networks are split into branches behind couplers. An [`OwPath`]
//! names the route to one remote segment as the ordered list of
//! (switch, channel) hops, and opening it latches those hops in order so
//! slaves on the segment become reachable.
//!
//! Paths are immutable values: extending one produces a new path, equality
//! and hashing compare the hop lists, and the string form is deterministic
//! regardless of bus state.

use std::fmt;

use snafu::ensure;

use crate::adapter::{AdapterId, OwTransport};
use crate::types::RomAddress;
use crate::{InvalidArgumentSnafu, Result};

/// One hop of a path: a branch switch and the channel to go down.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct PathElement {
    pub switch_address: RomAddress,
    pub channel: u8,
}

/// A route through couplers to a remote bus segment. The empty path is the
/// root, directly at the adapter.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct OwPath {
    adapter: AdapterId,
    elements: Vec<PathElement>,
}

impl OwPath {
    /// The root path on the given adapter.
    pub fn root(adapter: AdapterId) -> Self {
        OwPath { adapter, elements: Vec::new() }
    }

    /// A new path that descends from this one through `channel` of the
    /// switch at `switch_address`.
    pub fn extend(&self, switch_address: RomAddress, channel: u8) -> Self {
        let mut elements = self.elements.clone();
        elements.push(PathElement { switch_address, channel });
        OwPath { adapter: self.adapter.clone(), elements }
    }

    /// The adapter this path is tied to.
    pub fn adapter_id(&self) -> &AdapterId {
        &self.adapter
    }

    /// The hops, outermost first.
    pub fn elements(&self) -> &[PathElement] {
        &self.elements
    }

    pub fn is_root(&self) -> bool {
        self.elements.is_empty()
    }

    /// Whether this path must be open before `other` can be opened. A path
    /// is a parent iff its hop list is a strict prefix of the other's; no
    /// path is its own parent.
    pub fn is_parent_of(&self, other: &OwPath) -> bool {
        self.adapter == other.adapter
            && other.elements.len() > self.elements.len()
            && other.elements.starts_with(&self.elements)
    }

    /// The deepest path that is a parent of (or equal to) both.
    /// # Errors
    /// Returns [`crate::Error::InvalidArgument`] when the paths belong to
    /// different adapters; such paths have no common parent at all.
    pub fn common_parent(&self, other: &OwPath) -> Result<OwPath> {
        ensure!(
            self.adapter == other.adapter,
            InvalidArgumentSnafu {
                reason: format!("{self} and {other} are on different adapters")
            }
        );
        let shared = self
            .elements
            .iter()
            .zip(&other.elements)
            .take_while(|(a, b)| a == b)
            .count();
        Ok(OwPath { adapter: self.adapter.clone(), elements: self.elements[..shared].to_vec() })
    }

    /// Open the path: walk the hops outermost-in, latching each element's
    /// channel on (smart-on where the switch supports it). Safe to repeat;
    /// the switches converge on the same state. The root path just resets
    /// the bus so a following resetless search works.
    pub fn open(&self, bus: &dyn OwTransport) -> Result<()> {
        self.check_adapter(bus)?;
        let _session = Session::enter(bus);

        if self.elements.is_empty() {
            bus.reset()?;
            return Ok(());
        }

        for element in &self.elements {
            let switch = bus.branch_switch(element.switch_address.family())?;
            let mut state = switch.read_state(bus, element.switch_address)?;
            switch.set_latch(&mut state, element.channel, true, switch.has_smart_on())?;
            switch.write_state(bus, element.switch_address, &mut state)?;
        }
        Ok(())
    }

    /// Close the path: walk the hops in reverse, latching each channel off.
    pub fn close(&self, bus: &dyn OwTransport) -> Result<()> {
        self.check_adapter(bus)?;
        let _session = Session::enter(bus);

        for element in self.elements.iter().rev() {
            let switch = bus.branch_switch(element.switch_address.family())?;
            let mut state = switch.read_state(bus, element.switch_address)?;
            switch.set_latch(&mut state, element.channel, false, false)?;
            switch.write_state(bus, element.switch_address, &mut state)?;
        }
        Ok(())
    }

    fn check_adapter(&self, bus: &dyn OwTransport) -> Result<()> {
        ensure!(
            self.adapter == bus.adapter_id(),
            InvalidArgumentSnafu {
                reason: format!("path {self} does not belong to adapter {}", bus.adapter_id())
            }
        );
        Ok(())
    }
}

impl fmt::Display for OwPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/", self.adapter)?;
        for element in &self.elements {
            write!(f, "{}_{}/", element.switch_address, element.channel)?;
        }
        Ok(())
    }
}

/// Holds the bus exclusively for one path walk.
struct Session<'a> {
    bus: &'a dyn OwTransport,
}

impl<'a> Session<'a> {
    fn enter(bus: &'a dyn OwTransport) -> Self {
        bus.begin_exclusive();
        Session { bus }
    }
}

impl Drop for Session<'_> {
    fn drop(&mut self) {
        self.bus.end_exclusive();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Error;

    fn adapter(port: &str) -> AdapterId {
        AdapterId::new("DS9097U", port)
    }

    fn rom(bytes: [u8; 8]) -> RomAddress {
        RomAddress::from_bytes(bytes).unwrap()
    }

    fn switch_a() -> RomAddress {
        rom([0x1F, 0xAA, 0x00, 0x00, 0x00, 0x00, 0x00, 0x2A])
    }

    fn switch_b() -> RomAddress {
        rom([0x1F, 0xBB, 0x00, 0x00, 0x00, 0x00, 0x00, 0x46])
    }

    #[test]
    fn extend_leaves_the_original_alone() {
        let root = OwPath::root(adapter("ttyUSB0"));
        let a0 = root.extend(switch_a(), 0);
        let a1 = root.extend(switch_a(), 1);
        assert!(root.is_root());
        assert_eq!(a0.elements().len(), 1);
        assert_ne!(a0, a1);
        assert_eq!(a0, root.extend(switch_a(), 0));
    }

    #[test]
    fn display_is_deterministic() {
        let root = OwPath::root(adapter("ttyUSB0"));
        assert_eq!(root.to_string(), "DS9097U_ttyUSB0/");
        let a0b1 = root.extend(switch_a(), 0).extend(switch_b(), 1);
        assert_eq!(
            a0b1.to_string(),
            "DS9097U_ttyUSB0/2A0000000000AA1F_0/460000000000BB1F_1/"
        );
    }

    #[test]
    fn parenthood_is_strict_prefix() {
        let root = OwPath::root(adapter("ttyUSB0"));
        let a0 = root.extend(switch_a(), 0);
        let a0b1 = a0.extend(switch_b(), 1);
        let a1 = root.extend(switch_a(), 1);

        assert!(!root.is_parent_of(&root));
        assert!(!a0.is_parent_of(&a0));

        assert!(root.is_parent_of(&a0));
        assert!(root.is_parent_of(&a0b1));
        assert!(a0.is_parent_of(&a0b1));

        assert!(!a0b1.is_parent_of(&a0));
        assert!(!a0.is_parent_of(&a1));
        assert!(!a1.is_parent_of(&a0b1));
    }

    #[test]
    fn parenthood_requires_one_adapter() {
        let here = OwPath::root(adapter("ttyUSB0"));
        let there = OwPath::root(adapter("ttyUSB1")).extend(switch_a(), 0);
        assert!(!here.is_parent_of(&there));
    }

    #[test]
    fn common_parent_is_longest_shared_prefix() {
        let root = OwPath::root(adapter("ttyUSB0"));
        let a0 = root.extend(switch_a(), 0);
        let a0b0 = a0.extend(switch_b(), 0);
        let a0b1 = a0.extend(switch_b(), 1);
        let a1 = root.extend(switch_a(), 1);

        assert_eq!(a0b0.common_parent(&a0b1).unwrap(), a0);
        assert_eq!(a0b1.common_parent(&a1).unwrap(), root);
        assert_eq!(a0b0.common_parent(&a0).unwrap(), a0);
        assert_eq!(a0.common_parent(&a0b0).unwrap(), a0);

        // the result is a parent of (or equal to) both sides
        let parent = a0b0.common_parent(&a0b1).unwrap();
        assert!(parent.is_parent_of(&a0b0) || parent == a0b0);
        assert!(parent.is_parent_of(&a0b1) || parent == a0b1);
    }

    #[test]
    fn common_parent_across_adapters_fails() {
        let here = OwPath::root(adapter("ttyUSB0"));
        let there = OwPath::root(adapter("ttyUSB1"));
        assert!(matches!(
            here.common_parent(&there),
            Err(Error::InvalidArgument { .. })
        ));
    }

    #[test]
    fn value_equality_and_hash() {
        use std::collections::HashSet;
        let root = OwPath::root(adapter("ttyUSB0"));
        let mut set = HashSet::new();
        set.insert(root.extend(switch_a(), 0));
        set.insert(root.extend(switch_a(), 0));
        set.insert(root.extend(switch_a(), 1));
        assert_eq!(set.len(), 2);
    }
}
