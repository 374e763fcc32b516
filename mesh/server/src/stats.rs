/// Packet and byte tallies for one direction across one boundary.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Counters {
    pub packets: u64,
    pub bytes: u64,
    pub drop_packets: u64,
    pub drop_bytes: u64,
}

impl Counters {
    pub fn record(&mut self, bytes: usize) {
        self.packets += 1;
        self.bytes += bytes as u64;
    }

    pub fn record_drop(&mut self, bytes: usize) {
        self.drop_packets += 1;
        self.drop_bytes += bytes as u64;
    }
}

/// Traffic counters of a node: TUN-side rx/tx and mesh-side rx/tx.
///
/// `tun_rx` counts packets read from the TUN device, `tun_tx` packets
/// written to it; `world_rx`/`world_tx` count packets received from and
/// sent towards mesh peers. Drops are counted wherever a whole packet is
/// discarded instead of queued.
#[derive(Debug, Default, Clone, Copy)]
pub struct Stats {
    pub tun_rx: Counters,
    pub tun_tx: Counters,
    pub world_rx: Counters,
    pub world_tx: Counters,
}

impl Stats {
    pub fn log_summary(&self) {
        tracing::info!(
            tun_rx_packets = self.tun_rx.packets,
            tun_tx_packets = self.tun_tx.packets,
            tun_tx_dropped = self.tun_tx.drop_packets,
            world_rx_packets = self.world_rx.packets,
            world_tx_packets = self.world_tx.packets,
            world_tx_dropped = self.world_tx.drop_packets,
            "Traffic totals"
        );
    }
}
