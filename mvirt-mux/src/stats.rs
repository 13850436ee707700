//! Per-VIF counters.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

/// Counter selector for [`crate::vif::Vif::query_statistic`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Statistic {
    GoodTransmits,
    GoodReceives,
    /// Sends that failed below or could not be admitted.
    TransmitErrors,
    /// Inbound frames dropped because the receive queue was full.
    ReceiveResourceErrors,
    /// Inbound frames dropped for carrying a CFI tag.
    ReceiveFormatErrors,
    /// Inbound frames dropped for a VLAN id mismatch.
    ReceiveVlanIdErrors,
}

#[derive(Debug, Default)]
pub struct VifStats {
    good_transmits: AtomicU64,
    good_receives: AtomicU64,
    transmit_errors: AtomicU64,
    rcv_resource_errors: AtomicU64,
    rcv_format_errors: AtomicU64,
    rcv_vlan_id_errors: AtomicU64,
}

impl VifStats {
    pub fn new() -> Self {
        Self::default()
    }

    fn counter(&self, stat: Statistic) -> &AtomicU64 {
        match stat {
            Statistic::GoodTransmits => &self.good_transmits,
            Statistic::GoodReceives => &self.good_receives,
            Statistic::TransmitErrors => &self.transmit_errors,
            Statistic::ReceiveResourceErrors => &self.rcv_resource_errors,
            Statistic::ReceiveFormatErrors => &self.rcv_format_errors,
            Statistic::ReceiveVlanIdErrors => &self.rcv_vlan_id_errors,
        }
    }

    pub fn incr(&self, stat: Statistic) {
        self.counter(stat).fetch_add(1, Ordering::Relaxed);
    }

    pub fn get(&self, stat: Statistic) -> u64 {
        self.counter(stat).load(Ordering::Relaxed)
    }

    /// Sum of every inbound error counter.
    pub fn receive_errors(&self) -> u64 {
        self.get(Statistic::ReceiveResourceErrors)
            + self.get(Statistic::ReceiveFormatErrors)
            + self.get(Statistic::ReceiveVlanIdErrors)
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            good_transmits: self.get(Statistic::GoodTransmits),
            good_receives: self.get(Statistic::GoodReceives),
            transmit_errors: self.get(Statistic::TransmitErrors),
            receive_drops: self.get(Statistic::ReceiveResourceErrors),
            receive_format_errors: self.get(Statistic::ReceiveFormatErrors),
            receive_vlan_id_errors: self.get(Statistic::ReceiveVlanIdErrors),
        }
    }
}

/// Point-in-time copy of a VIF's counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    pub good_transmits: u64,
    pub good_receives: u64,
    pub transmit_errors: u64,
    pub receive_drops: u64,
    pub receive_format_errors: u64,
    pub receive_vlan_id_errors: u64,
}
