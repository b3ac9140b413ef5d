//! Glue between the control-block table, the segment heap/log, and node
//! encode/decode: resolves an [`Address`] to a decoded [`NodeBody`], and
//! allocates freshly encoded nodes.

use std::sync::Arc;

use crate::cbt::{Address, ControlBlockTable, NodeType};
use crate::error::{Result, TrieError};
use crate::node::NodeBody;
use crate::segment::frame::{checksum, FrameHeader, CHECKSUM_LEN};
use crate::segment::heap::SegmentHeap;
use crate::segment::log::SegmentWriter;
use crate::segment::unpack_location;

/// Resolves Addresses to node bodies and allocates new ones. Shared,
/// read-mostly state; cheap to clone (an `Arc` bundle).
#[derive(Clone)]
pub struct NodeStore {
    heap: Arc<SegmentHeap>,
    cbt: Arc<ControlBlockTable>,
}

impl NodeStore {
    /// Build a store over the given heap and control-block table.
    pub fn new(heap: Arc<SegmentHeap>, cbt: Arc<ControlBlockTable>) -> Self {
        Self { heap, cbt }
    }

    /// Shared control-block table.
    pub fn cbt(&self) -> &Arc<ControlBlockTable> {
        &self.cbt
    }

    /// Resolve `addr` to its decoded node body, verifying the frame's
    /// trailing checksum. Raw pointers into the segment are never
    /// retained past this call — only the owned, decoded body is
    /// returned, never cached across a potential relocation point.
    pub fn resolve(&self, addr: Address) -> Result<NodeBody> {
        let snapshot = self.cbt.get(addr);
        let header_size = std::mem::size_of::<FrameHeader>();
        let (segment, offset) = unpack_location(snapshot.location());
        let base = self.heap.get(segment);
        let header = unsafe {
            FrameHeader::read(std::slice::from_raw_parts(
                base.add(offset as usize),
                header_size,
            ))
        };
        let payload_len = header.size as usize - header_size - CHECKSUM_LEN;
        let (payload, trailing) = unsafe {
            let payload_ptr = base.add(offset as usize).add(header_size);
            (
                std::slice::from_raw_parts(payload_ptr, payload_len),
                std::slice::from_raw_parts(payload_ptr.add(payload_len), CHECKSUM_LEN),
            )
        };
        let stored = u64::from_le_bytes(trailing.try_into().unwrap());
        if checksum(payload) != stored {
            return Err(TrieError::ChecksumMismatch { address: addr.raw() }.into());
        }
        Ok(NodeBody::decode(snapshot.node_type(), payload))
    }

    /// Encode `body`, allocate a fresh control block and frame for it, and
    /// return the new Address with refcount 1.
    pub fn allocate(&self, writer: &mut SegmentWriter, body: &NodeBody) -> Result<Address> {
        let mut payload = Vec::new();
        body.encode(&mut payload);
        let addr = self.cbt.alloc(body.node_type(), 0)?;
        self.write_payload(writer, addr, body.node_type(), &payload)?;
        Ok(addr)
    }

    /// Allocate with a locality hint (siblings under the same parent).
    pub fn allocate_hint(
        &self,
        writer: &mut SegmentWriter,
        body: &NodeBody,
        hints: &[Address],
    ) -> Result<Address> {
        let mut payload = Vec::new();
        body.encode(&mut payload);
        let addr = self.cbt.alloc_hint(body.node_type(), 0, hints)?;
        self.write_payload(writer, addr, body.node_type(), &payload)?;
        Ok(addr)
    }

    /// Re-encode `body` into a fresh frame at the *same* Address (the
    /// `unique`-mode realloc path: in-place from the trie's perspective,
    /// though the allocator always writes a new frame — allocate larger
    /// and replace the same Address).
    pub fn realloc_in_place(
        &self,
        writer: &mut SegmentWriter,
        addr: Address,
        body: &NodeBody,
    ) -> Result<()> {
        let mut payload = Vec::new();
        body.encode(&mut payload);
        self.cbt.with_block(addr, |b| b.start_modify());
        let result = self.write_payload(writer, addr, body.node_type(), &payload);
        self.cbt.with_block(addr, |b| b.end_modify());
        result
    }

    fn write_payload(
        &self,
        writer: &mut SegmentWriter,
        addr: Address,
        node_type: NodeType,
        payload: &[u8],
    ) -> Result<()> {
        let (location, ptr) = writer.alloc_data(payload.len(), node_type, addr.raw())?;
        unsafe {
            std::ptr::copy_nonoverlapping(payload.as_ptr(), ptr, payload.len());
            writer.finalize(location, payload.len());
        }
        self.cbt.publish_location(addr, location);
        Ok(())
    }

    /// Retain a strong reference.
    pub fn retain(&self, addr: Address) {
        self.cbt.retain(addr);
    }

    /// Release a strong reference (does not walk descendants — see
    /// [`crate::trie::refcount`] for the recursive subtree release).
    pub fn release_one(&self, addr: Address) {
        self.cbt.release(addr);
    }
}
