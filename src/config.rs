// per-shard configuration surface

use {crate::netlink::MacAddress, std::net::Ipv4Addr};

/// the six udp listen ports the xdp program steers to us. a port of 0
/// disables that entry.
#[derive(Clone, Copy, Debug, Default)]
pub struct ListenPorts {
    pub shred: u16,
    pub quic_transaction: u16,
    pub legacy_transaction: u16,
    pub gossip: u16,
    pub repair_intake: u16,
    pub repair_serve: u16,
}

impl ListenPorts {
    /// candidate set handed to the xdp program installer, zeros included
    pub fn candidates(&self) -> [u16; 6] {
        [
            self.legacy_transaction,
            self.quic_transaction,
            self.shred,
            self.gossip,
            self.repair_intake,
            self.repair_serve,
        ]
    }
}

#[derive(Clone, Debug)]
pub struct NetConfig {
    /// nic to bind the primary xsk to. "lo" is allowed for dev setups,
    /// in which case no second loopback socket is created.
    pub interface: String,
    pub src_ip_addr: Ipv4Addr,
    pub src_mac_addr: MacAddress,
    pub xdp_rx_queue_size: u32,
    pub xdp_tx_queue_size: u32,
    pub xdp_aio_depth: usize,
    pub zero_copy: bool,
    pub ports: ListenPorts,
}

impl Default for NetConfig {
    fn default() -> Self {
        NetConfig {
            interface: "lo".to_string(),
            src_ip_addr: Ipv4Addr::new(127, 0, 0, 1),
            src_mac_addr: MacAddress([0; 6]),
            xdp_rx_queue_size: 2048,
            xdp_tx_queue_size: 2048,
            xdp_aio_depth: 256,
            zero_copy: false,
            ports: ListenPorts::default(),
        }
    }
}
