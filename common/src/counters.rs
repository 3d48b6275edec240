//! Protocol message counters.
//!
//! One rx/tx pair per message class. Counters are owned by the subsystem
//! that moves the messages; queries get a snapshot copy.

use microserde::Serialize;

/// Traffic classes the daemon accounts for.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum MessageClass {
    /// UDP keepalive datagrams.
    Heartbeat,
    /// Tunneled IGMP PDUs.
    IgmpTunnel,
    /// Tunneled xSTP PDUs.
    XstpTunnel,
    /// Control notifications (sync, state changes).
    Notification,
    /// Port oper-state notifications.
    PortNotification,
    /// FDB synchronization payloads.
    FdbSync,
    /// LACP arbitration messages.
    Lacp,
}

/// Monotonic rx/tx counters, one pair per [`MessageClass`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Counters {
    pub rx_heartbeat: u64,
    pub tx_heartbeat: u64,
    pub rx_igmp_tunnel: u64,
    pub tx_igmp_tunnel: u64,
    pub rx_xstp_tunnel: u64,
    pub tx_xstp_tunnel: u64,
    pub rx_notification: u64,
    pub tx_notification: u64,
    pub rx_port_notification: u64,
    pub tx_port_notification: u64,
    pub rx_fdb_sync: u64,
    pub tx_fdb_sync: u64,
    pub rx_lacp: u64,
    pub tx_lacp: u64,
}

impl Counters {
    /// Create a zeroed counter block.
    pub fn new() -> Self {
        Self::default()
    }

    /// Count one received message of the given class.
    pub fn record_rx(&mut self, class: MessageClass) {
        *self.rx_slot(class) += 1;
    }

    /// Count one transmitted message of the given class.
    pub fn record_tx(&mut self, class: MessageClass) {
        *self.tx_slot(class) += 1;
    }

    /// Add another counter block into this one. Used to aggregate
    /// per-subsystem blocks into the daemon-wide view.
    pub fn merge(&mut self, other: &Counters) {
        self.rx_heartbeat += other.rx_heartbeat;
        self.tx_heartbeat += other.tx_heartbeat;
        self.rx_igmp_tunnel += other.rx_igmp_tunnel;
        self.tx_igmp_tunnel += other.tx_igmp_tunnel;
        self.rx_xstp_tunnel += other.rx_xstp_tunnel;
        self.tx_xstp_tunnel += other.tx_xstp_tunnel;
        self.rx_notification += other.rx_notification;
        self.tx_notification += other.tx_notification;
        self.rx_port_notification += other.rx_port_notification;
        self.tx_port_notification += other.tx_port_notification;
        self.rx_fdb_sync += other.rx_fdb_sync;
        self.tx_fdb_sync += other.tx_fdb_sync;
        self.rx_lacp += other.rx_lacp;
        self.tx_lacp += other.tx_lacp;
    }

    /// Reset all counters to zero.
    pub fn clear(&mut self) {
        *self = Self::default();
    }

    fn rx_slot(&mut self, class: MessageClass) -> &mut u64 {
        match class {
            MessageClass::Heartbeat => &mut self.rx_heartbeat,
            MessageClass::IgmpTunnel => &mut self.rx_igmp_tunnel,
            MessageClass::XstpTunnel => &mut self.rx_xstp_tunnel,
            MessageClass::Notification => &mut self.rx_notification,
            MessageClass::PortNotification => &mut self.rx_port_notification,
            MessageClass::FdbSync => &mut self.rx_fdb_sync,
            MessageClass::Lacp => &mut self.rx_lacp,
        }
    }

    fn tx_slot(&mut self, class: MessageClass) -> &mut u64 {
        match class {
            MessageClass::Heartbeat => &mut self.tx_heartbeat,
            MessageClass::IgmpTunnel => &mut self.tx_igmp_tunnel,
            MessageClass::XstpTunnel => &mut self.tx_xstp_tunnel,
            MessageClass::Notification => &mut self.tx_notification,
            MessageClass::PortNotification => &mut self.tx_port_notification,
            MessageClass::FdbSync => &mut self.tx_fdb_sync,
            MessageClass::Lacp => &mut self.tx_lacp,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_and_merge() {
        let mut a = Counters::new();
        a.record_rx(MessageClass::Heartbeat);
        a.record_rx(MessageClass::Heartbeat);
        a.record_tx(MessageClass::Lacp);

        let mut b = Counters::new();
        b.record_tx(MessageClass::Heartbeat);
        b.merge(&a);

        assert_eq!(b.rx_heartbeat, 2);
        assert_eq!(b.tx_heartbeat, 1);
        assert_eq!(b.tx_lacp, 1);

        b.clear();
        assert_eq!(b, Counters::new());
    }
}
