use crate::packet::TrafficClass;
use crate::tsn::Tsn;
use std::time::Duration;
use anyhow::bail;

pub const MAXIMUM_MTU: usize = 2048;

/// The first TSN of each traffic class that carries TSNs
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct InitialTsns {
    pub control: Tsn,
    pub reliable_sequenced: Tsn,
    pub unreliable_sequenced: Tsn,
    pub reliable_unsequenced: Tsn,
    pub unreliable_unsequenced: Tsn,
}

impl Default for InitialTsns {
    fn default() -> Self {
        let first = Tsn::from_raw(1);
        InitialTsns {
            control: first,
            reliable_sequenced: first,
            unreliable_sequenced: first,
            reliable_unsequenced: first,
            unreliable_unsequenced: first,
        }
    }
}

impl InitialTsns {
    pub fn for_class(&self, class: TrafficClass) -> Tsn {
        match class {
            TrafficClass::Control => self.control,
            TrafficClass::ReliableSequenced => self.reliable_sequenced,
            TrafficClass::UnreliableSequenced => self.unreliable_sequenced,
            TrafficClass::ReliableUnsequenced => self.reliable_unsequenced,
            TrafficClass::UnreliableUnsequenced => self.unreliable_unsequenced,
        }
    }

    pub fn for_class_mut(&mut self, class: TrafficClass) -> &mut Tsn {
        match class {
            TrafficClass::Control => &mut self.control,
            TrafficClass::ReliableSequenced => &mut self.reliable_sequenced,
            TrafficClass::UnreliableSequenced => &mut self.unreliable_sequenced,
            TrafficClass::ReliableUnsequenced => &mut self.reliable_unsequenced,
            TrafficClass::UnreliableUnsequenced => &mut self.unreliable_unsequenced,
        }
    }
}

#[derive(Clone, Debug)]
pub struct MocketConfig {
    /// This is the maximum size of a packet as it is sent over UDP (i.e. the UDP payload). Messages
    ///  that do not fit into a single packet are fragmented. The value must be supported by all
    ///  network routes between the two endpoints: Mockets does not discover the path MTU.
    pub mtu: usize,

    /// The maximum number of bytes held in the send-side pending queue. `send` blocks (up to
    ///  its enqueue timeout) while there is no room.
    pub pending_queue_size: usize,

    /// The maximum receive window that is advertised to the peer
    pub max_receive_window: u32,

    /// The time the delivery loop waits for a missing unreliable sequenced packet before it
    ///  skips over it. The wait grows with the number of missing packets ahead of the queue's
    ///  head, up to five times this value.
    pub unreliable_sequenced_delivery_timeout: Duration,

    /// Fragments of unreliable unsequenced messages are discarded if the message is not complete
    ///  after this time
    pub unreliable_unsequenced_fragment_expiry: Duration,

    /// used by `receive` when it is called with a zero timeout. `None` means wait forever.
    pub default_receive_timeout: Option<Duration>,

    /// If this is `false`, unreliable sequenced packets are delivered (or dropped) immediately
    ///  on arrival instead of being held until the packets before them arrive.
    pub buffer_unreliable_sequenced_packets: bool,

    /// With cross-sequencing, packets of the three sequenced classes (control, reliable
    ///  sequenced, unreliable sequenced) carry delivery prerequisites so that the receiver
    ///  delivers them in the order in which they were sent across classes.
    pub cross_sequencing: bool,

    /// RTT estimate used until the first round trip was measured
    pub initial_rtt: Duration,
    pub min_rto: Duration,
    /// `None` means no upper bound
    pub max_rto: Option<Duration>,
    /// multiplier applied to the estimated RTT to get the RTO
    pub rto_factor: u32,

    /// An explicit SAck packet is sent if received packets were not acknowledged by a piggyback
    ///  SAck for this long
    pub sack_transmit_timeout: Duration,

    /// TSNs that this side cancelled are announced to the peer again after this interval until
    ///  they are acknowledged
    pub cancelled_tsn_transmit_interval: Duration,

    /// a heartbeat is sent if nothing else was sent for this long
    pub keepalive_timeout: Duration,

    /// upper bound for outgoing traffic in bytes per second, 0 for no limit
    pub transmit_rate_limit: u32,

    /// Every packet carries this token, and received packets with a different token are
    ///  discarded. The connection handshake normally establishes it.
    pub validation: u32,

    /// the TSNs this side starts sending with, normally agreed on during the handshake
    pub local_initial_tsns: InitialTsns,
    /// the TSNs the peer starts sending with
    pub remote_initial_tsns: InitialTsns,
}

impl Default for MocketConfig {
    fn default() -> Self {
        MocketConfig {
            mtu: 1450,
            pending_queue_size: 32768,
            max_receive_window: 262144,
            unreliable_sequenced_delivery_timeout: Duration::from_millis(3000),
            unreliable_unsequenced_fragment_expiry: Duration::from_millis(3000),
            default_receive_timeout: None,
            buffer_unreliable_sequenced_packets: true,
            cross_sequencing: true,
            initial_rtt: Duration::from_millis(100),
            min_rto: Duration::from_millis(10),
            max_rto: None,
            rto_factor: 2,
            sack_transmit_timeout: Duration::from_millis(5),
            cancelled_tsn_transmit_interval: Duration::from_millis(1000),
            keepalive_timeout: Duration::from_millis(1000),
            transmit_rate_limit: 0,
            validation: 0,
            local_initial_tsns: InitialTsns::default(),
            remote_initial_tsns: InitialTsns::default(),
        }
    }
}

impl MocketConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.mtu > MAXIMUM_MTU {
            bail!("MTU {} exceeds the maximum of {}", self.mtu, MAXIMUM_MTU);
        }
        if self.mtu < 100 {
            bail!("MTU {} is too small", self.mtu);
        }
        if self.pending_queue_size < self.mtu {
            bail!("pending queue size {} must be able to hold at least one packet of size {}", self.pending_queue_size, self.mtu);
        }
        if self.max_receive_window < self.mtu as u32 {
            bail!("receive window {} is smaller than the MTU", self.max_receive_window);
        }
        if self.unreliable_sequenced_delivery_timeout.is_zero() {
            bail!("unreliable sequenced delivery timeout must be positive");
        }
        if self.rto_factor == 0 {
            bail!("RTO factor must be positive");
        }
        if let Some(max_rto) = self.max_rto {
            if max_rto < self.min_rto {
                bail!("maximum RTO {:?} is below the minimum RTO {:?}", max_rto, self.min_rto);
            }
        }
        if self.keepalive_timeout.is_zero() {
            bail!("keepalive timeout must be positive");
        }
        Ok(())
    }

    /// the RTO for a given RTT estimate, clamped to the configured bounds
    pub fn rto_for(&self, rtt: Duration) -> Duration {
        let rto = (rtt * self.rto_factor).max(self.min_rto);
        match self.max_rto {
            Some(max_rto) => rto.min(max_rto),
            None => rto,
        }
    }
}
