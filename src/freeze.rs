//! Binary image of a connection's state for migrating it to a different process.
//!
//! ```ascii
//! 0: magic "MOCK"
//! 4: format version (u8)
//! 5: sections, in a fixed order
//! *: CRC-32 (ISO-HDLC) of everything before it
//! ```
//!
//! Instants are stored as the milliseconds elapsed between them and the freeze moment, and are
//!  re-anchored relative to the defrost moment.

use crate::packet::Packet;
use crate::safe_converter::millis_u32;
use crate::tsn::Tsn;
use anyhow::{bail, Context};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use bytes_varint::{VarIntSupport, VarIntSupportMut};
use crc::Crc;
use std::time::Duration;
use tokio::time::Instant;

const MAGIC: &[u8; 4] = b"MOCK";
const FORMAT_VERSION: u8 = 1;
const CHECKSUM_LEN: usize = 4;

fn checksum(data: &[u8]) -> u32 {
    Crc::<u32>::new(&crc::CRC_32_ISO_HDLC).checksum(data)
}

pub struct Freezer {
    buf: BytesMut,
    now: Instant,
}

impl Freezer {
    pub fn new(now: Instant) -> Freezer {
        let mut buf = BytesMut::new();
        buf.put_slice(MAGIC);
        buf.put_u8(FORMAT_VERSION);
        Freezer { buf, now }
    }

    pub fn put_u8(&mut self, value: u8) {
        self.buf.put_u8(value);
    }

    pub fn put_u32(&mut self, value: u32) {
        self.buf.put_u32(value);
    }

    pub fn put_bool(&mut self, value: bool) {
        self.buf.put_u8(if value { 1 } else { 0 });
    }

    pub fn put_tsn(&mut self, tsn: Tsn) {
        self.buf.put_u32(tsn.to_raw());
    }

    pub fn put_len(&mut self, len: usize) {
        self.buf.put_usize_varint(len);
    }

    /// continuation marker for lists that are written while iterating
    pub fn put_more(&mut self, more: bool) {
        self.put_bool(more);
    }

    pub fn put_duration(&mut self, duration: Duration) {
        self.buf.put_u32(millis_u32(duration));
    }

    pub fn put_instant(&mut self, instant: Instant) {
        self.put_duration(self.now.saturating_duration_since(instant));
    }

    pub fn put_bytes(&mut self, data: &[u8]) {
        self.put_len(data.len());
        self.buf.put_slice(data);
    }

    pub fn put_packet(&mut self, packet: &Packet) {
        let mut packet_buf = BytesMut::with_capacity(packet.size());
        packet.ser(&mut packet_buf);
        self.put_bytes(&packet_buf);
    }

    pub fn finish(mut self) -> Bytes {
        let crc = checksum(&self.buf);
        self.buf.put_u32(crc);
        self.buf.freeze()
    }
}

pub struct Defroster {
    buf: Bytes,
    now: Instant,
}

impl Defroster {
    pub fn new(mut data: Bytes, now: Instant) -> anyhow::Result<Defroster> {
        if data.len() < MAGIC.len() + 1 + CHECKSUM_LEN {
            bail!("frozen image is too short: {} bytes", data.len());
        }

        let mut crc_buf = data.split_off(data.len() - CHECKSUM_LEN);
        let expected_crc = crc_buf.get_u32();
        if checksum(&data) != expected_crc {
            bail!("checksum mismatch in frozen image");
        }

        let magic = data.split_to(MAGIC.len());
        if magic.as_ref() != MAGIC {
            bail!("frozen image does not start with the expected magic bytes");
        }
        let version = data.get_u8();
        if version != FORMAT_VERSION {
            bail!("unsupported frozen image version {}", version);
        }

        Ok(Defroster { buf: data, now })
    }

    pub fn now(&self) -> Instant {
        self.now
    }

    pub fn get_u8(&mut self) -> anyhow::Result<u8> {
        Ok(self.buf.try_get_u8()?)
    }

    pub fn get_u32(&mut self) -> anyhow::Result<u32> {
        Ok(self.buf.try_get_u32()?)
    }

    pub fn get_bool(&mut self) -> anyhow::Result<bool> {
        match self.get_u8()? {
            0 => Ok(false),
            1 => Ok(true),
            other => bail!("invalid boolean value {} in frozen image", other),
        }
    }

    pub fn get_tsn(&mut self) -> anyhow::Result<Tsn> {
        Ok(Tsn::from_raw(self.get_u32()?))
    }

    pub fn get_len(&mut self) -> anyhow::Result<usize> {
        let len = self.buf.try_get_usize_varint()?;
        if len > self.buf.remaining() {
            // every list element takes at least one byte
            bail!("list length {} exceeds the remaining frozen image", len);
        }
        Ok(len)
    }

    pub fn get_more(&mut self) -> anyhow::Result<bool> {
        self.get_bool()
    }

    pub fn get_duration(&mut self) -> anyhow::Result<Duration> {
        Ok(Duration::from_millis(self.get_u32()?.into()))
    }

    pub fn get_instant(&mut self) -> anyhow::Result<Instant> {
        let elapsed = self.get_duration()?;
        Ok(self.now.checked_sub(elapsed).unwrap_or(self.now))
    }

    pub fn get_bytes(&mut self) -> anyhow::Result<Bytes> {
        let len = self.get_len()?;
        Ok(self.buf.split_to(len))
    }

    pub fn get_packet(&mut self) -> anyhow::Result<Packet> {
        let mut packet_buf = self.get_bytes()?;
        Packet::deser(&mut packet_buf)
            .context("invalid packet in frozen image")
    }

    /// fails if there is unconsumed data
    pub fn finish(self) -> anyhow::Result<()> {
        if self.buf.has_remaining() {
            bail!("{} bytes of trailing data in frozen image", self.buf.remaining());
        }
        Ok(())
    }
}

/// Writes a sequence of TSN-ordered items as a continuation-marked list
pub fn put_marked_list<T>(freezer: &mut Freezer, items: impl IntoIterator<Item=T>, mut put_item: impl FnMut(&mut Freezer, T)) {
    for item in items {
        freezer.put_more(true);
        put_item(freezer, item);
    }
    freezer.put_more(false);
}

pub fn get_marked_list<T>(defroster: &mut Defroster, mut get_item: impl FnMut(&mut Defroster) -> anyhow::Result<T>) -> anyhow::Result<Vec<T>> {
    let mut result = Vec::new();
    while defroster.get_more()? {
        result.push(get_item(defroster)?);
    }
    Ok(result)
}
