//! The switch-driver seam.
//!
//! The control plane never touches hardware directly; it emits
//! [`DriverOp`]s which the runtime funnels through whatever implements
//! [`SwitchDriver`]. Tests record the op stream instead.

use std::io;

use thiserror::Error;

use crate::topology::{IfIndex, VlanId};
use crate::PortId;

/// A MAC address, as handed to FDB operations.
pub type MacAddr = [u8; 6];

/// A driver-layer error.
#[derive(Error, Debug)]
pub enum Error {
    /// The driver doesn't know the referenced port.
    #[error("unknown port {0}")]
    UnknownPort(PortId),
    /// The underlying SDK call failed.
    #[error("driver i/o: {0}")]
    Io(#[from] io::Error),
}

/// A hardware programming operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DriverOp {
    /// Create an aggregated port.
    PortCreate(PortId),
    /// Destroy an aggregated port.
    PortDestroy(PortId),
    /// Administratively enable or disable an aggregated port.
    PortAdminSet {
        /// The port.
        port_id: PortId,
        /// `true` to enable.
        enabled: bool,
    },
    /// Add a port to a VLAN.
    VlanMemberAdd {
        /// Member port's interface index.
        port: IfIndex,
        /// The VLAN.
        vlan: VlanId,
    },
    /// Remove a port from a VLAN.
    VlanMemberRemove {
        /// Member port's interface index.
        port: IfIndex,
        /// The VLAN.
        vlan: VlanId,
    },
    /// Insert a static FDB entry pointing at a port.
    FdbInsert {
        /// The address.
        mac: MacAddr,
        /// Its VLAN.
        vlan: VlanId,
        /// Destination port.
        port_id: PortId,
    },
    /// Flush dynamically learned addresses on a port.
    FdbFlushPort(PortId),
}

/// Hardware abstraction the runtime programs on behalf of the control
/// plane. Calls are serialized through the owning dispatcher.
pub trait SwitchDriver {
    /// Apply a single programming operation.
    fn apply(&mut self, op: &DriverOp) -> Result<(), Error>;
}

/// A driver that records the ops it is asked to apply. The default driver
/// for tests and for running detached from hardware.
#[derive(Debug, Default)]
pub struct MemoryDriver {
    /// Every op applied, in order.
    pub ops: Vec<DriverOp>,
}

impl SwitchDriver for MemoryDriver {
    fn apply(&mut self, op: &DriverOp) -> Result<(), Error> {
        self.ops.push(op.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_driver_records() {
        let mut driver = MemoryDriver::default();
        let vlan = VlanId::new(100).unwrap();

        driver.apply(&DriverOp::PortCreate(42)).unwrap();
        driver
            .apply(&DriverOp::VlanMemberAdd { port: 7, vlan })
            .unwrap();

        assert_eq!(driver.ops.len(), 2);
        assert_eq!(driver.ops[0], DriverOp::PortCreate(42));
    }
}
