//! Bounds-checked view over electrode packets.
//!
//! The probe front end delivers data as fixed-layout packets. Each packet
//! covers [`SAMPLES_PER_PACKET`] AP timepoints and one LF timepoint (LF runs
//! at one twelfth of the AP rate). Byte layout, little-endian:
//!
//! | Field | Type | Count |
//! |---|---|---|
//! | timestamps | `u32` | 12 |
//! | AP samples | `i16` | 12 x `n_ap`, timepoint-major |
//! | LF samples | `i16` | `n_lf` |
//! | status/sync words | `u16` | 12 |
//!
//! A [`PacketBuffer`] owns room for a whole fetch; drivers write into it
//! through [`PacketMut`] and the scaling stage reads through
//! [`PacketView`]. Every accessor works on a slice already checked against
//! the layout, so a malformed layout cannot read outside its packet.

use crate::error::{AcqError, AcqResult};

/// AP timepoints per packet; also the AP/LF sample-rate ratio.
pub const SAMPLES_PER_PACKET: usize = 12;

/// Status word bits flagging link errors.
pub mod status {
    pub const COUNT: u16 = 0x04;
    pub const SERDES: u16 = 0x08;
    pub const LOCK: u16 = 0x10;
    pub const POP: u16 = 0x20;
    /// Sync input, inverted by the hardware.
    pub const SYNC: u16 = 0x40;
    pub const SYNC_ERROR: u16 = 0x80;
}

/// Channel counts that fix a packet's shape.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketLayout {
    pub n_ap: usize,
    pub n_lf: usize,
}

impl PacketLayout {
    const TS_BYTES: usize = 4 * SAMPLES_PER_PACKET;

    pub fn new(n_ap: usize, n_lf: usize) -> Self {
        Self { n_ap, n_lf }
    }

    fn ap_offset(&self) -> usize {
        Self::TS_BYTES
    }

    fn lf_offset(&self) -> usize {
        self.ap_offset() + 2 * SAMPLES_PER_PACKET * self.n_ap
    }

    fn status_offset(&self) -> usize {
        self.lf_offset() + 2 * self.n_lf
    }

    /// Size of one packet in bytes.
    pub fn packet_bytes(&self) -> usize {
        self.status_offset() + 2 * SAMPLES_PER_PACKET
    }
}

/// Room for up to `capacity` packets of one layout.
#[derive(Debug, Clone)]
pub struct PacketBuffer {
    layout: PacketLayout,
    capacity: usize,
    bytes: Vec<u8>,
}

impl PacketBuffer {
    pub fn new(layout: PacketLayout, capacity: usize) -> AcqResult<Self> {
        let len = layout.packet_bytes() * capacity;
        let mut bytes = Vec::new();
        bytes
            .try_reserve_exact(len)
            .map_err(|_| AcqError::OutOfMemory {
                stream: "packet buffer".to_string(),
                frames: capacity * SAMPLES_PER_PACKET,
            })?;
        bytes.resize(len, 0);
        Ok(Self {
            layout,
            capacity,
            bytes,
        })
    }

    pub fn layout(&self) -> PacketLayout {
        self.layout
    }

    /// Maximum packets per fetch.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn packet(&self, index: usize) -> Option<PacketView<'_>> {
        let n = self.layout.packet_bytes();
        let start = index.checked_mul(n)?;
        let bytes = self.bytes.get(start..start + n)?;
        Some(PacketView {
            layout: self.layout,
            bytes,
        })
    }

    pub fn packet_mut(&mut self, index: usize) -> Option<PacketMut<'_>> {
        let n = self.layout.packet_bytes();
        let start = index.checked_mul(n)?;
        let bytes = self.bytes.get_mut(start..start + n)?;
        Some(PacketMut {
            layout: self.layout,
            bytes,
        })
    }
}

fn u16_at(bytes: &[u8]) -> u16 {
    u16::from_le_bytes([bytes[0], bytes[1]])
}

/// Read-only view of one packet.
#[derive(Debug, Clone, Copy)]
pub struct PacketView<'a> {
    layout: PacketLayout,
    bytes: &'a [u8],
}

impl PacketView<'_> {
    pub fn timestamps(&self) -> [u32; SAMPLES_PER_PACKET] {
        let mut out = [0u32; SAMPLES_PER_PACKET];
        for (dst, b) in out
            .iter_mut()
            .zip(self.bytes[..PacketLayout::TS_BYTES].chunks_exact(4))
        {
            *dst = u32::from_le_bytes([b[0], b[1], b[2], b[3]]);
        }
        out
    }

    /// Status/sync word of every timepoint.
    pub fn status_words(&self) -> [u16; SAMPLES_PER_PACKET] {
        let start = self.layout.status_offset();
        let mut out = [0u16; SAMPLES_PER_PACKET];
        for (dst, b) in out.iter_mut().zip(self.bytes[start..].chunks_exact(2)) {
            *dst = u16_at(b);
        }
        out
    }

    /// AP samples of timepoint `it`, copied into the front of `dst`.
    ///
    /// Returns the number of samples written.
    pub fn read_ap_row(&self, it: usize, dst: &mut [i16]) -> usize {
        if it >= SAMPLES_PER_PACKET {
            return 0;
        }
        let row = 2 * self.layout.n_ap;
        let start = self.layout.ap_offset() + it * row;
        let src = &self.bytes[start..start + row];
        let mut n = 0;
        for (d, b) in dst.iter_mut().zip(src.chunks_exact(2)) {
            *d = i16::from_le_bytes([b[0], b[1]]);
            n += 1;
        }
        n
    }

    /// The packet's LF timepoint, copied into the front of `dst`.
    pub fn read_lf(&self, dst: &mut [i16]) -> usize {
        let start = self.layout.lf_offset();
        let src = &self.bytes[start..self.layout.status_offset()];
        let mut n = 0;
        for (d, b) in dst.iter_mut().zip(src.chunks_exact(2)) {
            *d = i16::from_le_bytes([b[0], b[1]]);
            n += 1;
        }
        n
    }
}

/// Writable view of one packet. Out-of-range writes are ignored.
#[derive(Debug)]
pub struct PacketMut<'a> {
    layout: PacketLayout,
    bytes: &'a mut [u8],
}

impl PacketMut<'_> {
    pub fn set_timestamp(&mut self, it: usize, value: u32) {
        if it < SAMPLES_PER_PACKET {
            self.bytes[4 * it..4 * it + 4].copy_from_slice(&value.to_le_bytes());
        }
    }

    pub fn set_ap(&mut self, it: usize, ch: usize, value: i16) {
        if it < SAMPLES_PER_PACKET && ch < self.layout.n_ap {
            let at = self.layout.ap_offset() + 2 * (it * self.layout.n_ap + ch);
            self.bytes[at..at + 2].copy_from_slice(&value.to_le_bytes());
        }
    }

    pub fn set_lf(&mut self, ch: usize, value: i16) {
        if ch < self.layout.n_lf {
            let at = self.layout.lf_offset() + 2 * ch;
            self.bytes[at..at + 2].copy_from_slice(&value.to_le_bytes());
        }
    }

    pub fn set_status(&mut self, it: usize, value: u16) {
        if it < SAMPLES_PER_PACKET {
            let at = self.layout.status_offset() + 2 * it;
            self.bytes[at..at + 2].copy_from_slice(&value.to_le_bytes());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_layout_size() {
        // 48 timestamp + 12*384*2 AP + 384*2 LF + 24 status
        assert_eq!(PacketLayout::new(384, 384).packet_bytes(), 48 + 9216 + 768 + 24);
        assert_eq!(PacketLayout::new(4, 0).packet_bytes(), 48 + 96 + 24);
    }

    #[test]
    fn test_write_then_view() {
        let mut buf = PacketBuffer::new(PacketLayout::new(3, 3), 2).unwrap();
        {
            let mut p = buf.packet_mut(1).unwrap();
            p.set_timestamp(11, 0xDEAD_BEEF);
            p.set_ap(5, 2, -1234);
            p.set_lf(0, 77);
            p.set_status(3, status::SYNC | status::POP);
            // Out of range writes are ignored
            p.set_ap(12, 0, 1);
            p.set_lf(3, 1);
        }

        let p = buf.packet(1).unwrap();
        assert_eq!(p.timestamps()[11], 0xDEAD_BEEF);
        let mut row = [0i16; 3];
        assert_eq!(p.read_ap_row(5, &mut row), 3);
        assert_eq!(row, [0, 0, -1234]);
        let mut lf = [0i16; 3];
        assert_eq!(p.read_lf(&mut lf), 3);
        assert_eq!(lf, [77, 0, 0]);
        assert_eq!(p.status_words()[3], 0x60);

        // Packet 0 untouched
        assert_eq!(buf.packet(0).unwrap().timestamps(), [0; 12]);
        assert!(buf.packet(2).is_none());
    }

    #[test]
    fn test_short_destination_is_partial() {
        let buf = PacketBuffer::new(PacketLayout::new(8, 8), 1).unwrap();
        let p = buf.packet(0).unwrap();
        let mut small = [0i16; 5];
        assert_eq!(p.read_ap_row(0, &mut small), 5);
        assert_eq!(p.read_ap_row(12, &mut small), 0);
    }
}
