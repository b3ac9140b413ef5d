//! The return protocol from a recursive mutation step: what the parent
//! must now place at the edge it recursed through.

use crate::cbt::Address;

/// Maximum children a single `branch_set` may carry: at most 6
/// Addresses and 5 dividers.
pub const MAX_BRANCH_SET_CHILDREN: usize = 6;

/// What a parent must do with the edge it recursed through.
#[derive(Debug, Clone)]
pub enum BranchSet {
    /// The edge now points at this single (possibly unchanged) Address.
    Single(Address),
    /// Replace the edge with these children, `dividers.len() ==
    /// children.len() - 1`. `children[0]` keeps the original edge's key;
    /// `children[i]` for `i > 0` is keyed by `dividers[i - 1]`.
    Multi {
        /// Replacement children, 2..=6 of them.
        children: Vec<Address>,
        /// Divider bytes, one fewer than `children`.
        dividers: Vec<u8>,
    },
}

impl BranchSet {
    /// Build a `Multi` set, asserting the spec's size bound.
    pub fn multi(children: Vec<Address>, dividers: Vec<u8>) -> Self {
        assert_eq!(children.len(), dividers.len() + 1);
        assert!(
            children.len() <= MAX_BRANCH_SET_CHILDREN,
            "branch_set exceeds the {MAX_BRANCH_SET_CHILDREN}-child bound"
        );
        BranchSet::Multi { children, dividers }
    }

    /// All Addresses this branch_set carries, in order.
    pub fn addresses(&self) -> Vec<Address> {
        match self {
            BranchSet::Single(addr) => vec![*addr],
            BranchSet::Multi { children, .. } => children.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    #[should_panic(expected = "exceeds the")]
    fn multi_rejects_oversized_sets() {
        let children = (0..7).map(Address::from_raw).collect::<Vec<_>>();
        let dividers = (0..6).map(|i| i as u8).collect::<Vec<_>>();
        BranchSet::multi(children, dividers);
    }
}
