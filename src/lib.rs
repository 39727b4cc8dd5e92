//! Mockets is a message-oriented transport over UDP for a single peer-to-peer connection. It
//!  offers four delivery classes per message, combining reliable / unreliable with sequenced /
//!  unsequenced delivery, and lets the application tag, prioritize and cancel messages.
//!
//! ## Design goals
//!
//! * The abstraction is sending and receiving *messages* of arbitrary length. Messages are
//!   fragmented into packets that fit the configured MTU, and reassembled on the receiving side
//! * Reliable packets are acknowledged selectively (SAck) and retransmitted with exponential
//!   backoff. A reliable message can have a retry timeout after which the sender gives up and
//!   tells the receiver to skip it
//! * Unreliable sequenced packets are delivered in order, but a missing packet is skipped after a
//!   (configurable) delivery timeout
//! * Optional cross-sequencing: control, reliable sequenced and unreliable sequenced packets are
//!   delivered in the order they were sent, across classes
//! * Flow control through the receive window the peer advertises, plus a pluggable send gate
//!   for rate limiting or congestion control
//! * A running connection can be frozen into a binary image and defrosted in a different
//!   process, e.g. for migrating it to a different host
//!
//! Establishing a connection (the handshake) is not part of this crate: both sides are
//!  configured with the peer's address, a shared validation token and matching initial TSNs.
//!
//! ## Packet structure
//!
//! All numbers are in network byte order (BE).
//!
//! ```ascii
//!  0: flags (u16): version in the upper 4 bits (0x1000), then
//!      0x0001 reliable
//!      0x0002 sequenced
//!      0x0008 control
//!      0x0010 delivery prerequisites present
//!      0x0020 first fragment
//!      0x0040 intermediate fragment
//!      0x0080 last fragment
//!      0x0100 retransmitted
//!  2: window size (u32): free space in the sender's receive buffer
//!  6: validation (u32)
//! 10: TSN (u32): per-class transmit sequence number
//! 14: delivery prerequisites (2 x u32, only if the flag is set): the next TSNs of the two other
//!      sequenced classes (ctrl, rs, us in this order, leaving out the packet's own class)
//! *: chunks
//! ```
//!
//! A chunk has a four byte header followed by its body:
//!
//! ```ascii
//! 0: chunk type (u16)
//! 2: chunk length (u16), including the header
//! 4: body
//! ```
//!
//! A data chunk's body is the message's tag (u16) followed by the payload. SAck and Cancelled
//!  chunks (*piggyback chunks*) carry lists of TSN blocks and are added to whatever packet is
//!  sent next; SAcks have three cumulative TSNs (ctrl, rs, ru) before the blocks.
//!
//! ```ascii
//! 0: flags (u8): 0x10 for a range block, 0x20 for a single-TSN block, plus flow bits
//! 1: block length (u16), including this header
//! 3: (start, end) u32 pairs for range blocks, u32 TSNs for single blocks
//! ```
//!
//! Lifecycle chunks (Shutdown, Abort, Suspend, Resume etc.) travel in control packets, which are
//!  reliable and sequenced.
//!
//! ## Tasks
//!
//! Each connection runs three loops:
//! * the receive loop admits datagrams, applies piggyback chunks and queues data packets
//! * the packet processor delivers packets in order, reassembles messages and hands them to
//!    the application's `receive` calls
//! * the transmit loop assigns TSNs, sends and retransmits packets, and sends acknowledgements
//!    and heartbeats

pub mod ack_manager;
pub mod cancelled_tsn_manager;
pub mod chunk;
pub mod config;
pub mod freeze;
pub mod mocket;
pub mod packet;
pub mod packet_processor;
pub mod packet_wrapper;
pub mod pending_queue;
pub mod received_data_queue;
pub mod receiver;
pub mod safe_converter;
pub mod sequenced_queue;
pub mod socket;
pub mod state;
pub mod stats;
pub mod transmitter;
pub mod tsn;
pub mod tsn_range;
pub mod unacked_queue;
pub mod unsequenced_queue;

pub use config::MocketConfig;
pub use mocket::Mocket;
pub use packet_processor::ReceiveOutcome;
pub use transmitter::SendOptions;
