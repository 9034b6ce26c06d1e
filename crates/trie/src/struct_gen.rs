use ethereum_types::{H256, U256};
use tracing::trace;

use crate::error::TrieError;
use crate::hash_builder::{AccountFieldSet, HashBuilder};
use crate::nibbles::prefix_len;
use crate::rlputil::RlpSerializableBytes;

/// Payload of one structural step: what to emit for the key that was just
/// finalized.
#[derive(Debug)]
pub enum StepData<'a> {
    /// A storage leaf carrying its raw value bytes.
    Leaf(RlpSerializableBytes<'a>),
    /// An account leaf; storage-root/code-hash slots are popped according to
    /// the field set.
    Account(AccountStepData),
    /// A sub-trie summarized by a cached hash.
    Hash { hash: H256, witness_len: u64 },
}

#[derive(Debug, Clone, Default)]
pub struct AccountStepData {
    pub balance: U256,
    pub nonce: u64,
    pub incarnation: u64,
    pub field_set: AccountFieldSet,
}

/// Callback collecting `(nibble prefix, hash, witness length)` for every
/// branch that was rebuilt from raw items; feeds the intermediate-hash cache.
pub type HashCollector<'a> = dyn FnMut(&[u8], H256, u64) -> Result<(), TrieError> + 'a;

/// One step of the structure-generation algorithm.
///
/// `curr` is the key that has just been finalized, `succ` the key about to
/// replace it (empty at a range cutoff); both are nibble paths, terminated
/// with the digit 16 when they come from a leaf. `groups` carries one 16-bit
/// mask per open branch level and threads through successive calls.
///
/// Emits the leaf/hash opcode for `curr`, then walks upward from
/// `len(curr)-1` down to the common prefix, collapsing each level into an
/// extension or a branch. `retain` selects the node-retaining or the
/// hash-only opcode variants.
pub fn gen_struct_step(
    retain: &mut dyn FnMut(&[u8]) -> bool,
    curr: &[u8],
    succ: &[u8],
    hb: &mut HashBuilder,
    data: StepData<'_>,
    mut groups: Vec<u16>,
    mut hash_collector: Option<&mut HashCollector<'_>>,
) -> Result<Vec<u16>, TrieError> {
    let mut curr = curr;
    let mut build_extensions = false;

    loop {
        let prec_exists = !groups.is_empty();
        let prec_len = groups.len().saturating_sub(1);
        let succ_len = prefix_len(succ, curr);
        let max_len = prec_len.max(succ_len);
        trace!(
            target: "trie::struct_gen",
            curr = ?curr, succ = ?succ, ?groups, prec_len, succ_len, build_extensions,
            "struct step"
        );
        if max_len >= curr.len() {
            // the input stream was not strictly ascending
            return Err(TrieError::InvariantViolation(format!(
                "non-monotonic key stream: curr {curr:02x?} after succ {succ:02x?}"
            )));
        }

        // Add the digit immediately following the max common prefix
        let extra_digit = curr[max_len];
        if groups.len() <= max_len {
            groups.resize(max_len + 1, 0);
        }
        groups[max_len] |= 1 << extra_digit;

        let mut remainder_start = max_len;
        if !succ.is_empty() || prec_exists {
            remainder_start += 1;
        }
        let remainder_len = curr.len() - remainder_start;

        if !build_extensions {
            match &data {
                StepData::Leaf(value) => {
                    if retain(&curr[..max_len]) {
                        hb.leaf(remainder_len, curr, *value)?;
                    } else {
                        hb.leaf_hash(remainder_len, curr, *value)?;
                    }
                }
                StepData::Account(account) => {
                    if retain(&curr[..max_len]) {
                        hb.account_leaf(
                            remainder_len,
                            curr,
                            account.balance,
                            account.nonce,
                            account.incarnation,
                            account.field_set,
                        )?;
                    } else {
                        hb.account_leaf_hash(
                            remainder_len,
                            curr,
                            account.balance,
                            account.nonce,
                            account.incarnation,
                            account.field_set,
                        )?;
                    }
                }
                StepData::Hash { hash, witness_len } => {
                    hb.hash(*hash, *witness_len)?;
                    build_extensions = true;
                }
            }
        }

        if build_extensions && remainder_len > 0 {
            let key = &curr[remainder_start..remainder_start + remainder_len];
            if retain(&curr[..max_len]) {
                hb.extension(key)?;
            } else {
                hb.extension_hash(key)?;
            }
        }

        // Check for the optional part
        if prec_len <= succ_len && !succ.is_empty() {
            return Ok(groups);
        }

        // Close the immediately encompassing prefix group, if needed
        if !succ.is_empty() || prec_exists {
            if retain(&curr[..max_len]) {
                hb.branch(groups[max_len])?;
                if let Some(collector) = hash_collector.as_deref_mut() {
                    collector(&curr[..max_len], hb.root_hash()?, hb.top_witness_len())?;
                }
            } else {
                hb.branch_hash(groups[max_len])?;
            }
        }

        groups.truncate(max_len);

        // Check the end of recursion
        if prec_len == 0 {
            return Ok(groups);
        }

        // Identify the preceding key for the buildExtensions invocation
        curr = &curr[..prec_len];
        while groups.last() == Some(&0) {
            groups.pop();
        }
        build_extensions = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hash_builder::HashBuilder;

    fn nibbles_of(bytes: &[u8]) -> Vec<u8> {
        let mut out = Vec::new();
        for b in bytes {
            out.push(b >> 4);
            out.push(b & 0x0f);
        }
        out.push(16);
        out
    }

    fn step(
        hb: &mut HashBuilder,
        curr: &[u8],
        succ: &[u8],
        value: &'static [u8],
        groups: Vec<u16>,
    ) -> Vec<u16> {
        gen_struct_step(
            &mut |_| false,
            curr,
            succ,
            hb,
            StepData::Leaf(RlpSerializableBytes(value)),
            groups,
            None,
        )
        .unwrap()
    }

    /// A lone key produces a single leaf covering the entire path.
    #[test]
    fn single_key_is_one_leaf() {
        let key = nibbles_of(b"FIRSTFIRSTFIRSTFIRSTFIRSTFIRSTFI");

        let mut hb = HashBuilder::new();
        let groups = step(&mut hb, &key, &[], b"FIRST", Vec::new());
        assert!(groups.is_empty());

        let mut expected = HashBuilder::new();
        expected
            .leaf_hash(key.len(), &key, RlpSerializableBytes(b"FIRST"))
            .unwrap();
        assert_eq!(hb.root_hash().unwrap(), expected.root_hash().unwrap());
    }

    /// Keys diverging at the first nibble produce a branch at depth zero.
    #[test]
    fn divergence_at_the_root() {
        let key_a = nibbles_of(&[0xaa; 32]);
        let key_b = nibbles_of(&[0xbb; 32]);

        let mut hb = HashBuilder::new();
        let groups = step(&mut hb, &key_a, &key_b, &[0x02], Vec::new());
        assert_eq!(groups, vec![1 << 0xa]);
        let groups = step(&mut hb, &key_b, &[], &[0x03], groups);
        assert!(groups.is_empty());

        let mut expected = HashBuilder::new();
        expected
            .leaf_hash(64, &key_a, RlpSerializableBytes(&[0x02]))
            .unwrap();
        expected
            .leaf_hash(64, &key_b, RlpSerializableBytes(&[0x03]))
            .unwrap();
        expected.branch_hash((1 << 0xa) | (1 << 0xb)).unwrap();
        assert_eq!(hb.root_hash().unwrap(), expected.root_hash().unwrap());
    }

    /// A shared prefix yields an extension above the branch.
    #[test]
    fn shared_prefix_builds_an_extension() {
        let mut key_a = vec![0x1, 0x2, 0x3];
        let mut key_b = key_a.clone();
        key_a.extend([0x4, 16]);
        key_b.extend([0x9, 16]);

        let mut hb = HashBuilder::new();
        let groups = step(&mut hb, &key_a, &key_b, &[0x02], Vec::new());
        assert_eq!(groups.len(), 4);
        assert_eq!(groups[3], 1 << 0x4);
        let groups = step(&mut hb, &key_b, &[], &[0x03], groups);
        assert!(groups.is_empty());

        let mut expected = HashBuilder::new();
        expected
            .leaf_hash(1, &key_a, RlpSerializableBytes(&[0x02]))
            .unwrap();
        expected
            .leaf_hash(1, &key_b, RlpSerializableBytes(&[0x03]))
            .unwrap();
        expected.branch_hash((1 << 0x4) | (1 << 0x9)).unwrap();
        expected.extension_hash(&[0x1, 0x2, 0x3]).unwrap();
        assert_eq!(hb.root_hash().unwrap(), expected.root_hash().unwrap());
    }

    /// A successor that extends the finalized key is rejected instead of
    /// corrupting the root.
    #[test]
    fn non_monotonic_stream_is_an_error() {
        let mut hb = HashBuilder::new();
        let result = gen_struct_step(
            &mut |_| false,
            &[1, 2, 3],
            &[1, 2, 3, 4],
            &mut hb,
            StepData::Leaf(RlpSerializableBytes(&[0x01])),
            Vec::new(),
            None,
        );
        assert!(result.is_err());
    }

    /// A cached sub-trie hash replaces its whole range in the stream.
    #[test]
    fn hash_items_stand_in_for_subtries() {
        let sub_root = H256::repeat_byte(0x77);
        // the cached sub-trie sits under prefix [0xa]; a leaf follows at
        // [0xb, ...]
        let hashed_prefix = vec![0xa, 0x0];
        let key_b = nibbles_of(&[0xbb; 32]);

        let mut hb = HashBuilder::new();
        let groups = gen_struct_step(
            &mut |_| false,
            &hashed_prefix,
            &key_b,
            &mut hb,
            StepData::Hash {
                hash: sub_root,
                witness_len: 9,
            },
            Vec::new(),
            None,
        )
        .unwrap();
        let groups = step(&mut hb, &key_b, &[], &[0x03], groups);
        assert!(groups.is_empty());

        let mut expected = HashBuilder::new();
        expected.hash(sub_root, 9).unwrap();
        expected.extension_hash(&[0x0]).unwrap();
        expected
            .leaf_hash(64, &key_b, RlpSerializableBytes(&[0x03]))
            .unwrap();
        expected.branch_hash((1 << 0xa) | (1 << 0xb)).unwrap();
        assert_eq!(hb.root_hash().unwrap(), expected.root_hash().unwrap());
    }
}
