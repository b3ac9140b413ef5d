//! The object frame header every persisted object starts with.
//!
//! Packing a 32-bit address *and* a 32-bit sequence alongside a size and
//! type tag does not fit in a 12-byte header without either truncating
//! one of them or losing byte alignment, so this implementation uses a
//! 16-byte header instead (still a small, fixed, `Pod` struct any frame
//! can be skipped by) and appends an 8-byte xxh3-64 checksum after the
//! payload as the concrete checksum algorithm choice.

use bytemuck::{Pod, Zeroable};

use crate::cbt::NodeType;

/// Frame type discriminant, stored alongside the node type so forward
/// iteration over a segment can skip non-object frames (sync-head stamps)
/// without consulting the control-block table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FrameKind {
    /// An object frame holding a trie node or value payload.
    Object = 0,
    /// A sync-head frame stamping a virtual timestamp into the log.
    SyncHead = 1,
}

impl FrameKind {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => FrameKind::Object,
            1 => FrameKind::SyncHead,
            other => panic!("impossible frame kind tag {other}"),
        }
    }
}

/// Raw, `Pod` 16-byte allocation header. `size` always refers to the whole
/// frame (header + payload + trailing checksum), so forward iteration over
/// any segment can always skip to the next frame.
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
#[repr(C)]
pub struct FrameHeader {
    /// Total frame size in bytes, including this header and the trailing
    /// checksum.
    pub size: u32,
    /// [`FrameKind`] as a raw byte.
    pub kind: u8,
    /// [`NodeType`] as a raw byte; meaningless when `kind == SyncHead`.
    pub node_type: u8,
    /// Reserved for alignment; always zero.
    pub _reserved: u16,
    /// The control-block address this frame currently backs. Lets the
    /// compactor map a physical frame back to its control block without a
    /// separate reverse index. Meaningless when `kind == SyncHead`.
    pub address: u32,
    /// Monotonically increasing allocation sequence number, unique across
    /// the whole database. Distinguishes a freed-then-reallocated address
    /// from its previous occupant.
    pub sequence: u32,
}

const _: () = assert!(std::mem::size_of::<FrameHeader>() == 16);

/// Bytes of trailing checksum appended after every frame's payload.
pub const CHECKSUM_LEN: usize = 8;

impl FrameHeader {
    /// Build a header for an object frame.
    pub fn object(total_size: u32, node_type: NodeType, address: u32, sequence: u32) -> Self {
        Self {
            size: total_size,
            kind: FrameKind::Object as u8,
            node_type: node_type as u8,
            _reserved: 0,
            address,
            sequence,
        }
    }

    /// Build a header for a sync-head stamp frame.
    pub fn sync_head(total_size: u32, sequence: u32) -> Self {
        Self {
            size: total_size,
            kind: FrameKind::SyncHead as u8,
            node_type: 0,
            _reserved: 0,
            address: 0,
            sequence,
        }
    }

    /// Decoded frame kind.
    pub fn frame_kind(&self) -> FrameKind {
        FrameKind::from_u8(self.kind)
    }

    /// Bytes of this header as a slice, for writing into a segment.
    pub fn as_bytes(&self) -> &[u8] {
        bytemuck::bytes_of(self)
    }

    /// Parse a header out of the start of `bytes`.
    pub fn read(bytes: &[u8]) -> Self {
        *bytemuck::from_bytes(&bytes[..std::mem::size_of::<FrameHeader>()])
    }
}

/// Compute the trailing checksum for a frame's payload bytes.
pub fn checksum(payload: &[u8]) -> u64 {
    xxhash_rust::xxh3::xxh3_64(payload)
}

/// A sync-head frame's payload: a little-endian wall-clock millisecond
/// timestamp, used to derive a virtual age for any preceding object by
/// scanning back to the nearest stamp.
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
#[repr(C)]
pub struct SyncHeadPayload {
    /// Milliseconds since `UNIX_EPOCH` at the time this stamp was written.
    pub wall_time_ms: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_round_trips_through_bytes() {
        let header = FrameHeader::object(128, NodeType::Leaf, 99, 7);
        let bytes = header.as_bytes().to_vec();
        let decoded = FrameHeader::read(&bytes);
        assert_eq!(decoded.size, 128);
        assert_eq!(decoded.frame_kind(), FrameKind::Object);
        assert_eq!(decoded.address, 99);
        assert_eq!(decoded.sequence, 7);
    }

    #[test]
    fn checksum_detects_corruption() {
        let payload = b"hello world";
        let sum = checksum(payload);
        let mut corrupted = payload.to_vec();
        corrupted[0] ^= 0xFF;
        assert_ne!(sum, checksum(&corrupted));
    }
}
