//! Out-of-line value nodes: used when a value exceeds
//! [`crate::config::MAX_INLINE_VALUE_LEN`].

/// A single variable-length payload with no further structure.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ValueNode {
    /// The value's bytes.
    pub bytes: Vec<u8>,
}

impl ValueNode {
    /// Wrap `bytes` as a value node.
    pub fn new(bytes: Vec<u8>) -> Self {
        Self { bytes }
    }

    /// Encode to the persisted byte form: a length-prefixed blob.
    pub fn encode(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&(self.bytes.len() as u32).to_le_bytes());
        out.extend_from_slice(&self.bytes);
    }

    /// Decode a node previously written by [`ValueNode::encode`].
    pub fn decode(bytes: &[u8]) -> Self {
        let len = u32::from_le_bytes(bytes[0..4].try_into().unwrap()) as usize;
        Self {
            bytes: bytes[4..4 + len].to_vec(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_through_bytes() {
        let node = ValueNode::new(vec![1, 2, 3, 4, 5]);
        let mut buf = Vec::new();
        node.encode(&mut buf);
        let decoded = ValueNode::decode(&buf);
        assert_eq!(decoded, node);
    }
}
