use std::io::Write;
use std::mem;

use arrayvec::ArrayVec;
use ethereum_types::{H256, U256};
use strata_common::{Account, EMPTY_CODE_HASH, EMPTY_TRIE_HASH};
use strata_crypto::{keccak_hash, Keccak256State};
use tracing::trace;

use crate::error::TrieError;
use crate::nibbles::Nibbles;
use crate::node::{Node, NodeArena, NodeId};
use crate::rlputil::{generate_struct_len, RlpEncodedBytes, RlpSerializable};

/// One hash-stack slot: a length-prefix byte plus up to 32 bytes of hash or
/// embedded node RLP.
const HASH_STACK_STRIDE: usize = 33;
const HASH_LENGTH: usize = 32;
/// Tag byte of a hashed slot: the RLP string header of a 32-byte hash.
const HASHED_SLOT_TAG: u8 = 0x80 + HASH_LENGTH as u8;

type SlotBuf = ArrayVec<u8, HASH_STACK_STRIDE>;

/// Which optional account fields participate in an `ACCOUNT_LEAF` opcode.
///
/// The storage bit makes the opcode pop a storage-root slot; the code bit
/// makes it pop a code-hash slot (pushed earlier via `HASH` or `CODE`).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AccountFieldSet(u32);

impl AccountFieldSet {
    pub const NONCE: Self = Self(1);
    pub const BALANCE: Self = Self(2);
    pub const STORAGE: Self = Self(4);
    pub const CODE: Self = Self(8);

    pub fn insert(&mut self, other: Self) {
        self.0 |= other.0;
    }

    pub fn contains(self, other: Self) -> bool {
        self.0 & other.0 != 0
    }

    pub fn clear(&mut self) {
        self.0 = 0;
    }
}

/// A stack machine that consumes a linearized description of a (sub)trie and
/// produces its Merkle root.
///
/// Three stacks stay synchronized across opcodes: the hash stack (33-byte
/// slots holding node hashes, or whole node RLP for nodes shorter than 32
/// bytes), the node stack (optionally retained in-memory nodes, as arena
/// indices) and the witness-length stack (cumulative byte count a peer would
/// need to reconstruct the sub-trie under that slot).
pub struct HashBuilder {
    hash_stack: Vec<u8>,
    node_stack: Vec<Option<NodeId>>,
    witness_stack: Vec<u64>,
    arena: NodeArena,
    sha: Keccak256State,
    acc: Account,
    val_buf: Vec<u8>,
}

impl Default for HashBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl HashBuilder {
    pub fn new() -> Self {
        Self {
            hash_stack: Vec::new(),
            node_stack: Vec::new(),
            witness_stack: Vec::new(),
            arena: NodeArena::default(),
            sha: Keccak256State::new(),
            acc: Account::default(),
            val_buf: Vec::with_capacity(128),
        }
    }

    /// Makes the builder suitable for reuse.
    pub fn reset(&mut self) {
        self.hash_stack.clear();
        self.node_stack.clear();
        self.witness_stack.clear();
        self.arena.clear();
    }

    pub fn has_root(&self) -> bool {
        !self.hash_stack.is_empty()
    }

    /// Hash of the single remaining slot. A trie root is always a keccak, so
    /// an embedded top slot is hashed here.
    pub fn root_hash(&self) -> Result<H256, TrieError> {
        if !self.has_root() {
            return Err(TrieError::InvariantViolation("no root in the trie".into()));
        }
        Ok(self.slot_hash_at(0))
    }

    /// Witness length of the sub-trie under the top slot.
    pub fn top_witness_len(&self) -> u64 {
        *self.witness_stack.last().unwrap_or(&0)
    }

    /// Retained node for the top slot, if the opcode that produced it was a
    /// retaining variant.
    pub fn root_node(&self) -> Option<NodeId> {
        self.node_stack.last().copied().flatten()
    }

    pub fn arena(&self) -> &NodeArena {
        &self.arena
    }

    pub fn take_arena(&mut self) -> NodeArena {
        mem::take(&mut self.arena)
    }

    fn check_stacks(&self) {
        debug_assert_eq!(self.hash_stack.len() % HASH_STACK_STRIDE, 0);
        debug_assert_eq!(
            self.hash_stack.len() / HASH_STACK_STRIDE,
            self.node_stack.len()
        );
        debug_assert_eq!(self.node_stack.len(), self.witness_stack.len());
    }

    /// `LEAF` — emits a terminated short node, retaining it on the node
    /// stack. `length` selects the trailing nibbles of `key_hex`.
    pub fn leaf(
        &mut self,
        length: usize,
        key_hex: &[u8],
        val: impl RlpSerializable,
    ) -> Result<(), TrieError> {
        trace!(target: "trie::hash_builder", length, "LEAF");
        let key = tail(key_hex, length)?;
        let slot = self.short_node_ref(key, &val)?;
        let witness = val.raw_bytes().len() as u64 + 1 + key.len() as u64 / 2;
        let node = Node::Leaf {
            key: Nibbles::from_hex(key.to_vec()),
            value: val.raw_bytes().to_vec(),
        };
        self.push_slot(&slot, witness);
        let id = self.arena.push(node);
        *self.node_stack.last_mut().expect("pushed above") = Some(id);
        self.check_stacks();
        Ok(())
    }

    /// `LEAF` without node retention.
    pub fn leaf_hash(
        &mut self,
        length: usize,
        key_hex: &[u8],
        val: impl RlpSerializable,
    ) -> Result<(), TrieError> {
        trace!(target: "trie::hash_builder", length, "LEAFHASH");
        let key = tail(key_hex, length)?;
        let slot = self.short_node_ref(key, &val)?;
        let witness = val.raw_bytes().len() as u64 + 1 + key.len() as u64 / 2;
        self.push_slot(&slot, witness);
        self.check_stacks();
        Ok(())
    }

    /// `ACCOUNT_LEAF` — pops the storage-root and code-hash slots demanded by
    /// `field_set`, encodes the account record and emits it as a terminated
    /// short node, retaining the node.
    #[allow(clippy::too_many_arguments)]
    pub fn account_leaf(
        &mut self,
        length: usize,
        key_hex: &[u8],
        balance: U256,
        nonce: u64,
        incarnation: u64,
        field_set: AccountFieldSet,
    ) -> Result<(), TrieError> {
        trace!(target: "trie::hash_builder", length, ?field_set, "ACCOUNTLEAF");
        self.account_leaf_inner(length, key_hex, balance, nonce, incarnation, field_set, true)
    }

    /// `ACCOUNT_LEAF` without node retention.
    #[allow(clippy::too_many_arguments)]
    pub fn account_leaf_hash(
        &mut self,
        length: usize,
        key_hex: &[u8],
        balance: U256,
        nonce: u64,
        incarnation: u64,
        field_set: AccountFieldSet,
    ) -> Result<(), TrieError> {
        trace!(target: "trie::hash_builder", length, ?field_set, "ACCOUNTLEAFHASH");
        self.account_leaf_inner(length, key_hex, balance, nonce, incarnation, field_set, false)
    }

    #[allow(clippy::too_many_arguments)]
    fn account_leaf_inner(
        &mut self,
        length: usize,
        key_hex: &[u8],
        balance: U256,
        nonce: u64,
        incarnation: u64,
        field_set: AccountFieldSet,
        retain: bool,
    ) -> Result<(), TrieError> {
        let key = tail(key_hex, length)?;

        self.acc.nonce = nonce;
        self.acc.balance = balance;
        self.acc.incarnation = incarnation;
        self.acc.storage_root = *EMPTY_TRIE_HASH;
        self.acc.code_hash = *EMPTY_CODE_HASH;
        self.acc.storage_size = None;

        let mut popped = 0;
        if field_set.contains(AccountFieldSet::STORAGE) {
            if self.node_stack.len() <= popped {
                return Err(TrieError::InvariantViolation(
                    "ACCOUNT_LEAF expects a storage root on the stack".into(),
                ));
            }
            self.acc.storage_root = self.slot_hash_at(popped);
            popped += 1;
        }
        if field_set.contains(AccountFieldSet::CODE) {
            if self.node_stack.len() <= popped {
                return Err(TrieError::InvariantViolation(
                    "ACCOUNT_LEAF expects a code hash on the stack".into(),
                ));
            }
            self.acc.code_hash = self.slot_hash_at(popped);
            popped += 1;
        }

        let val_buf = {
            let mut buf = mem::take(&mut self.val_buf);
            buf.clear();
            self.acc.encode_for_hashing(&mut buf);
            buf
        };
        let slot = self.short_node_ref(key, &RlpEncodedBytes(&val_buf))?;
        self.val_buf = val_buf;

        // opcode + stored record + opcode + key, plus the popped sub-tries
        let mut witness =
            1 + self.acc.encoding_length_for_storage() as u64 + 1 + key.len() as u64 / 2;
        for child in &self.witness_stack[self.witness_stack.len() - popped..] {
            witness += child;
        }

        let node = if retain {
            let storage = field_set
                .contains(AccountFieldSet::STORAGE)
                .then(|| self.child_node_at(0));
            let code_depth = usize::from(field_set.contains(AccountFieldSet::STORAGE));
            let code = field_set
                .contains(AccountFieldSet::CODE)
                .then(|| self.child_node_at(code_depth));
            Some(self.arena.push(Node::Account {
                key: Nibbles::from_hex(key.to_vec()),
                account: self.acc.clone(),
                storage,
                code,
            }))
        } else {
            None
        };

        self.pop_slots(popped);
        self.push_slot(&slot, witness);
        *self.node_stack.last_mut().expect("pushed above") = node;
        self.check_stacks();
        Ok(())
    }

    /// `EXTENSION` — wraps the top slot in an un-terminated short node,
    /// retaining the resulting node.
    pub fn extension(&mut self, key: &[u8]) -> Result<(), TrieError> {
        trace!(target: "trie::hash_builder", key = ?Nibbles::from_hex(key.to_vec()), "EXTENSION");
        self.extension_inner(key, true)
    }

    /// `EXTENSION` without node retention.
    pub fn extension_hash(&mut self, key: &[u8]) -> Result<(), TrieError> {
        trace!(target: "trie::hash_builder", key = ?Nibbles::from_hex(key.to_vec()), "EXTENSIONHASH");
        self.extension_inner(key, false)
    }

    fn extension_inner(&mut self, key: &[u8], retain: bool) -> Result<(), TrieError> {
        if self.hash_stack.is_empty() {
            return Err(TrieError::InvariantViolation(
                "EXTENSION requires a child on the stack".into(),
            ));
        }

        let node = if retain {
            let child = self.child_node_at(0);
            Some(self.arena.push(Node::Extension {
                key: Nibbles::from_hex(key.to_vec()),
                child,
            }))
        } else {
            if self.node_stack.last().copied().flatten().is_some() {
                return Err(TrieError::InvariantViolation(
                    "EXTENSION over a hash cannot consume a retained node".into(),
                ));
            }
            None
        };

        // child RLP item is the top slot verbatim
        let child: SlotBuf = {
            let top = self.top_slot();
            slot_rlp(top).try_into().expect("slot rlp fits the stride")
        };

        let (compact_len, compact0, ni) = compact_header(key);
        let kp = compact_len > 1;
        let total_len = usize::from(kp) + compact_len + child.len();
        let len_prefix = generate_struct_len(total_len);
        let embedded = total_len + len_prefix.len() < HASH_LENGTH;

        let slot = if embedded {
            let mut buf = SlotBuf::new();
            write_short_node(&mut buf, &len_prefix, kp, compact_len, compact0, ni, key)
                .and_then(|_| buf.write_all(&child))
                .map_err(slot_overflow)?;
            buf
        } else {
            self.sha.reset();
            let _ = write_short_node(
                &mut self.sha,
                &len_prefix,
                kp,
                compact_len,
                compact0,
                ni,
                key,
            );
            self.sha.write(&child);
            self.hashed_slot()
        };

        // replace the top slot
        let child_witness = *self.witness_stack.last().expect("checked non-empty");
        self.pop_slots(1);
        self.push_slot(&slot, 1 + key.len() as u64 / 2 + child_witness);
        *self.node_stack.last_mut().expect("pushed above") = node;
        self.check_stacks();
        Ok(())
    }

    /// `BRANCH(mask)` — consumes one slot per set bit (in digit order) and
    /// pushes the 17-element branch node, retaining it.
    pub fn branch(&mut self, set: u16) -> Result<(), TrieError> {
        trace!(target: "trie::hash_builder", set = format_args!("{set:#06b}"), "BRANCH");
        self.branch_inner(set, true)
    }

    /// `BRANCH(mask)` without node retention.
    pub fn branch_hash(&mut self, set: u16) -> Result<(), TrieError> {
        trace!(target: "trie::hash_builder", set = format_args!("{set:#06b}"), "BRANCHHASH");
        self.branch_inner(set, false)
    }

    fn branch_inner(&mut self, set: u16, retain: bool) -> Result<(), TrieError> {
        let digits = set.count_ones() as usize;
        if self.node_stack.len() < digits {
            return Err(TrieError::InvariantViolation(format!(
                "BRANCH({set:#06b}) needs {digits} slots, the stack holds {}",
                self.node_stack.len()
            )));
        }
        let first = self.hash_stack.len() - HASH_STACK_STRIDE * digits;

        let node = if retain {
            let first_node = self.node_stack.len() - digits;
            let mut children = Vec::with_capacity(digits);
            for i in 0..digits {
                let child = match self.node_stack[first_node + i] {
                    Some(id) => id,
                    None => {
                        let hash = self.slot_hash_at(digits - 1 - i);
                        let witness_len = self.witness_stack[first_node + i];
                        self.arena.push(Node::Hash { hash, witness_len })
                    }
                };
                children.push(child);
            }
            Some(self.arena.push(Node::Branch {
                mask: set,
                children,
            }))
        } else {
            None
        };

        // 17 per-element prefix bytes, plus each child's payload
        let mut total_len = 17;
        for i in 0..digits {
            let slot = &self.hash_stack
                [first + HASH_STACK_STRIDE * i..first + HASH_STACK_STRIDE * (i + 1)];
            total_len += if slot[0] == HASHED_SLOT_TAG {
                HASH_LENGTH
            } else {
                embedded_len(slot[0]) - 1
            };
        }
        let len_prefix = generate_struct_len(total_len);
        let embedded = total_len + len_prefix.len() < HASH_LENGTH;

        let slot = if embedded {
            let mut buf = SlotBuf::new();
            self.write_branch(&mut buf, set, digits, first, &len_prefix)
                .map_err(slot_overflow)?;
            buf
        } else {
            self.sha.reset();
            let mut sha = mem::take(&mut self.sha);
            let _ = self.write_branch(&mut sha, set, digits, first, &len_prefix);
            self.sha = sha;
            self.hashed_slot()
        };

        let mut witness = 2; // opcode + mask
        for child in &self.witness_stack[self.witness_stack.len() - digits..] {
            witness += child;
        }

        self.pop_slots(digits);
        self.push_slot(&slot, witness);
        *self.node_stack.last_mut().expect("pushed above") = node;
        self.check_stacks();
        Ok(())
    }

    fn write_branch(
        &self,
        w: &mut dyn Write,
        set: u16,
        digits: usize,
        first: usize,
        len_prefix: &[u8],
    ) -> std::io::Result<()> {
        w.write_all(len_prefix)?;
        let mut i = 0;
        for digit in 0..17u32 {
            if digit < 16 && set & (1 << digit) != 0 {
                let slot = &self.hash_stack
                    [first + HASH_STACK_STRIDE * i..first + HASH_STACK_STRIDE * (i + 1)];
                w.write_all(slot_rlp(slot))?;
                i += 1;
            } else {
                w.write_all(&[0x80])?;
            }
        }
        Ok(())
    }

    /// `HASH` — pushes a pre-computed sub-trie hash.
    pub fn hash(&mut self, hash: H256, witness_len: u64) -> Result<(), TrieError> {
        trace!(target: "trie::hash_builder", ?hash, witness_len, "HASH");
        let mut slot = SlotBuf::new();
        slot.push(HASHED_SLOT_TAG);
        slot.try_extend_from_slice(hash.as_bytes())
            .expect("hash fits the stride");
        // only data below the hash counts, so no opcode byte here
        self.push_slot(&slot, witness_len);
        self.check_stacks();
        Ok(())
    }

    /// `CODE` — pushes the keccak of contract bytecode, retaining the code
    /// itself for witness production; popped by the next `ACCOUNT_LEAF`.
    pub fn code(&mut self, code: &[u8]) -> Result<(), TrieError> {
        trace!(target: "trie::hash_builder", len = code.len(), "CODE");
        self.sha.reset();
        self.sha.write(code);
        let slot = self.hashed_slot();
        self.push_slot(&slot, 1 + code.len() as u64);
        let id = self.arena.push(Node::Code(code.to_vec()));
        *self.node_stack.last_mut().expect("pushed above") = Some(id);
        self.check_stacks();
        Ok(())
    }

    /// `EMPTY_ROOT` — pushes the empty-trie root hash.
    pub fn empty_root(&mut self) {
        trace!(target: "trie::hash_builder", "EMPTYROOT");
        let mut slot = SlotBuf::new();
        slot.push(HASHED_SLOT_TAG);
        slot.try_extend_from_slice(EMPTY_TRIE_HASH.as_bytes())
            .expect("hash fits the stride");
        self.push_slot(&slot, 0);
        self.check_stacks();
    }

    // -- internals ---------------------------------------------------------

    /// Serializes a short node `[compact(key), value]` into a slot: embedded
    /// RLP when shorter than 32 bytes, `0x80+32 ‖ keccak` otherwise.
    fn short_node_ref(
        &mut self,
        key: &[u8],
        val: &dyn RlpSerializable,
    ) -> Result<SlotBuf, TrieError> {
        let (compact_len, compact0, ni) = compact_header(key);
        let kp = compact_len > 1;
        let total_len = usize::from(kp) + compact_len + val.double_rlp_len();
        let len_prefix = generate_struct_len(total_len);
        let embedded = total_len + len_prefix.len() < HASH_LENGTH;

        if embedded {
            let mut buf = SlotBuf::new();
            write_short_node(&mut buf, &len_prefix, kp, compact_len, compact0, ni, key)
                .and_then(|_| val.to_double_rlp(&mut buf))
                .map_err(slot_overflow)?;
            Ok(buf)
        } else {
            self.sha.reset();
            let _ = write_short_node(
                &mut self.sha,
                &len_prefix,
                kp,
                compact_len,
                compact0,
                ni,
                key,
            );
            val.to_double_rlp(&mut self.sha)
                .map_err(|e| TrieError::InvariantViolation(e.to_string()))?;
            Ok(self.hashed_slot())
        }
    }

    fn hashed_slot(&mut self) -> SlotBuf {
        let mut hash = [0u8; 32];
        self.sha.finalize_into(&mut hash);
        let mut slot = SlotBuf::new();
        slot.push(HASHED_SLOT_TAG);
        slot.try_extend_from_slice(&hash).expect("hash fits");
        slot
    }

    fn push_slot(&mut self, slot: &[u8], witness: u64) {
        let start = self.hash_stack.len();
        self.hash_stack.extend_from_slice(slot);
        self.hash_stack.resize(start + HASH_STACK_STRIDE, 0);
        self.node_stack.push(None);
        self.witness_stack.push(witness);
    }

    fn pop_slots(&mut self, count: usize) {
        self.hash_stack
            .truncate(self.hash_stack.len() - HASH_STACK_STRIDE * count);
        self.node_stack.truncate(self.node_stack.len() - count);
        self.witness_stack.truncate(self.witness_stack.len() - count);
    }

    fn top_slot(&self) -> &[u8] {
        &self.hash_stack[self.hash_stack.len() - HASH_STACK_STRIDE..]
    }

    /// Hash of the slot `depth` entries below the top. Embedded slots are
    /// hashed on the fly (sub-trie roots are always keccaks).
    fn slot_hash_at(&self, depth: usize) -> H256 {
        let start = self.hash_stack.len() - HASH_STACK_STRIDE * (depth + 1);
        let slot = &self.hash_stack[start..start + HASH_STACK_STRIDE];
        if slot[0] == HASHED_SLOT_TAG {
            H256::from_slice(&slot[1..HASH_STACK_STRIDE])
        } else {
            H256(keccak_hash(slot_rlp(slot)))
        }
    }

    /// Retained node `depth` entries below the top, or a fresh hash node.
    fn child_node_at(&mut self, depth: usize) -> NodeId {
        match self.node_stack[self.node_stack.len() - 1 - depth] {
            Some(id) => id,
            None => {
                let hash = self.slot_hash_at(depth);
                let witness_len = self.witness_stack[self.witness_stack.len() - 1 - depth];
                self.arena.push(Node::Hash { hash, witness_len })
            }
        }
    }
}

/// Compact-encoding parameters for a nibble key: the packed byte count, the
/// header byte and the index of the first nibble not folded into the header.
fn compact_header(key: &[u8]) -> (usize, u8, usize) {
    if key.last() == Some(&16) {
        let compact_len = (key.len() - 1) / 2 + 1;
        if key.len() & 1 == 0 {
            (compact_len, 0x30 + key[0], 1)
        } else {
            (compact_len, 0x20, 0)
        }
    } else {
        let compact_len = key.len() / 2 + 1;
        if key.len() & 1 == 1 {
            (compact_len, 0x10 + key[0], 1)
        } else {
            (compact_len, 0x00, 0)
        }
    }
}

/// Writes `len_prefix ‖ [key string header] ‖ compact(key)`.
fn write_short_node(
    w: &mut dyn Write,
    len_prefix: &[u8],
    kp: bool,
    compact_len: usize,
    compact0: u8,
    mut ni: usize,
    key: &[u8],
) -> std::io::Result<()> {
    w.write_all(len_prefix)?;
    if kp {
        w.write_all(&[0x80 + compact_len as u8])?;
    }
    w.write_all(&[compact0])?;
    for _ in 1..compact_len {
        w.write_all(&[(key[ni] << 4) | key[ni + 1]])?;
        ni += 2;
    }
    Ok(())
}

/// Byte length of an embedded slot's RLP, tag included.
fn embedded_len(tag: u8) -> usize {
    debug_assert!((0xc0..0xf8).contains(&tag));
    1 + (tag - 0xc0) as usize
}

/// The RLP item a slot contributes to its parent: the full 33 bytes for a
/// hashed slot (string header + hash), the embedded node RLP otherwise.
fn slot_rlp(slot: &[u8]) -> &[u8] {
    if slot[0] == HASHED_SLOT_TAG {
        slot
    } else {
        &slot[..embedded_len(slot[0])]
    }
}

fn slot_overflow(e: std::io::Error) -> TrieError {
    TrieError::InvariantViolation(format!("embedded node exceeds a slot: {e}"))
}

fn tail(key_hex: &[u8], length: usize) -> Result<&[u8], TrieError> {
    key_hex
        .len()
        .checked_sub(length)
        .map(|start| &key_hex[start..])
        .ok_or_else(|| {
            TrieError::InvariantViolation(format!(
                "key of {} nibbles cannot supply {length}",
                key_hex.len()
            ))
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rlputil::RlpSerializableBytes;
    use strata_rlp::encode::RLPEncode;

    fn nibbles_of(bytes: &[u8]) -> Vec<u8> {
        let mut out = Vec::new();
        for b in bytes {
            out.push(b >> 4);
            out.push(b & 0x0f);
        }
        out.push(16);
        out
    }

    /// Single leaf whose key is a full 32-byte path: the root is the keccak
    /// of `[compact(key, term), string(rlp(value))]`.
    #[test]
    fn single_leaf_root() {
        let key = b"FIRSTFIRSTFIRSTFIRSTFIRSTFIRSTFI";
        let key_hex = nibbles_of(key);

        let mut hb = HashBuilder::new();
        hb.leaf_hash(key_hex.len(), &key_hex, RlpSerializableBytes(b"FIRST"))
            .unwrap();

        // expected: keccak(rlp([compact, rlp("FIRST") as a string]))
        let compact = Nibbles::from_hex(key_hex.clone()).encode_compact();
        assert_eq!(compact.len(), 33);
        let mut payload = Vec::new();
        compact.as_slice().encode(&mut payload);
        b"FIRST".as_slice().encode_to_vec().as_slice().encode(&mut payload);
        let mut rlp = Vec::new();
        rlp.push(0xc0 + payload.len() as u8);
        rlp.extend_from_slice(&payload);
        let expected = H256(keccak_hash(&rlp));

        assert_eq!(hb.root_hash().unwrap(), expected);
        // opcode + raw value + half the key nibbles
        assert_eq!(hb.top_witness_len(), 5 + 1 + 65 / 2);
    }

    /// Two 32-byte keys differing in the first nibble force a branch at
    /// depth zero with two hashed leaf children.
    #[test]
    fn two_leaves_branch_at_nibble_zero() {
        let key_a = [0xaa; 32];
        let key_b = [0xbb; 32];
        let hex_a = nibbles_of(&key_a);
        let hex_b = nibbles_of(&key_b);

        let mut hb = HashBuilder::new();
        // the branch consumes the first nibble; leaves keep the remaining 63
        // nibbles plus the terminator
        hb.leaf_hash(64, &hex_a, RlpSerializableBytes(&[0x02]))
            .unwrap();
        hb.leaf_hash(64, &hex_b, RlpSerializableBytes(&[0x03]))
            .unwrap();
        hb.branch_hash((1 << 0xa) | (1 << 0xb)).unwrap();
        let root = hb.root_hash().unwrap();

        let leaf_rlp = |hex: &[u8], value: u8| {
            let compact = Nibbles::from_hex(hex[1..].to_vec()).encode_compact();
            let mut payload = Vec::new();
            compact.as_slice().encode(&mut payload);
            payload.push(value); // single byte below 0x80 is its own item
            let mut rlp = Vec::new();
            rlp.push(0xc0 + payload.len() as u8);
            rlp.extend_from_slice(&payload);
            rlp
        };
        let child_a = keccak_hash(leaf_rlp(&hex_a, 0x02));
        let child_b = keccak_hash(leaf_rlp(&hex_b, 0x03));

        let mut payload = Vec::new();
        for digit in 0..17 {
            match digit {
                0xa => child_a.as_slice().encode(&mut payload),
                0xb => child_b.as_slice().encode(&mut payload),
                _ => payload.push(0x80),
            }
        }
        let mut rlp = Vec::new();
        rlp.push(0xf8);
        rlp.push(payload.len() as u8);
        rlp.extend_from_slice(&payload);
        assert_eq!(root, H256(keccak_hash(&rlp)));
    }

    /// Nodes whose RLP is shorter than 32 bytes are embedded into the parent
    /// instead of being hashed.
    #[test]
    fn short_nodes_embed_into_the_branch() {
        let mut hb = HashBuilder::new();
        // leaves at depth 63: just the terminator remains of each key
        hb.leaf_hash(1, &[0x5, 16], RlpSerializableBytes(&[0x02]))
            .unwrap();
        hb.leaf_hash(1, &[0x8, 16], RlpSerializableBytes(&[0x03]))
            .unwrap();
        hb.branch_hash((1 << 0x5) | (1 << 0x8)).unwrap();

        // [0xc2, 0x20, value] per leaf, written verbatim into the branch
        let mut payload = Vec::new();
        for digit in 0..17 {
            match digit {
                0x5 => payload.extend_from_slice(&[0xc2, 0x20, 0x02]),
                0x8 => payload.extend_from_slice(&[0xc2, 0x20, 0x03]),
                _ => payload.push(0x80),
            }
        }
        let mut rlp = Vec::new();
        rlp.push(0xc0 + payload.len() as u8);
        rlp.extend_from_slice(&payload);
        assert!(rlp.len() < 32);
        // the branch itself is embedded, so the root hashes it on demand
        assert_eq!(hb.root_hash().unwrap(), H256(keccak_hash(&rlp)));
    }

    #[test]
    fn extension_wraps_the_top_slot() {
        let mut hb = HashBuilder::new();
        let child = H256::repeat_byte(0x42);
        hb.hash(child, 10).unwrap();
        hb.extension_hash(&[0x1, 0x2]).unwrap();

        // [compact([1,2]), 0xa0 ‖ child]: compact = 0x00 0x12
        let mut rlp = Vec::new();
        rlp.push(0xc0 + 3 + 33);
        rlp.extend_from_slice(&[0x82, 0x00, 0x12]);
        rlp.push(0xa0);
        rlp.extend_from_slice(child.as_bytes());
        assert_eq!(hb.root_hash().unwrap(), H256(keccak_hash(&rlp)));
        assert_eq!(hb.top_witness_len(), 1 + 1 + 10);
    }

    #[test]
    fn account_leaf_pops_storage_and_code() {
        let storage_root = H256::repeat_byte(0x11);
        let code_hash = H256::repeat_byte(0x22);
        let key_hex = nibbles_of(&[0xcc; 32]);

        let mut hb = HashBuilder::new();
        // code first, storage root on top: the pop order of ACCOUNT_LEAF
        hb.hash(code_hash, 0).unwrap();
        hb.hash(storage_root, 7).unwrap();
        let mut field_set = AccountFieldSet::default();
        field_set.insert(AccountFieldSet::STORAGE);
        field_set.insert(AccountFieldSet::CODE);
        hb.account_leaf_hash(65, &key_hex, U256::from(100), 1, 1, field_set)
            .unwrap();

        let account = Account {
            nonce: 1,
            balance: U256::from(100),
            storage_root,
            code_hash,
            ..Default::default()
        };
        let mut account_rlp = Vec::new();
        account.encode_for_hashing(&mut account_rlp);

        let compact = Nibbles::from_hex(key_hex).encode_compact();
        let mut payload = Vec::new();
        compact.as_slice().encode(&mut payload);
        account_rlp.as_slice().encode(&mut payload);
        let mut rlp = Vec::new();
        rlp.push(0xf8);
        rlp.push(payload.len() as u8);
        rlp.extend_from_slice(&payload);

        assert_eq!(hb.root_hash().unwrap(), H256(keccak_hash(&rlp)));
        // a single slot remains
        assert!(hb.has_root());
    }

    #[test]
    fn empty_root_constant() {
        let mut hb = HashBuilder::new();
        hb.empty_root();
        assert_eq!(hb.root_hash().unwrap(), *EMPTY_TRIE_HASH);
        assert_eq!(hb.top_witness_len(), 0);
    }

    #[test]
    fn code_opcode_hashes_bytecode() {
        let code = vec![0x60, 0x60, 0x60, 0x40];
        let mut hb = HashBuilder::new();
        hb.code(&code).unwrap();
        assert_eq!(hb.root_hash().unwrap(), H256(keccak_hash(&code)));
        assert_eq!(hb.top_witness_len(), 1 + code.len() as u64);
        assert!(matches!(
            hb.arena().get(hb.root_node().unwrap()),
            Node::Code(_)
        ));
    }

    #[test]
    fn branch_requires_enough_slots() {
        let mut hb = HashBuilder::new();
        hb.hash(H256::zero(), 0).unwrap();
        assert!(hb.branch_hash(0b111).is_err());
    }

    #[test]
    fn extension_requires_a_child() {
        let mut hb = HashBuilder::new();
        assert!(hb.extension_hash(&[1]).is_err());
    }

    #[test]
    fn witness_lengths_accumulate() {
        let mut hb = HashBuilder::new();
        hb.hash(H256::repeat_byte(1), 10).unwrap();
        hb.hash(H256::repeat_byte(2), 20).unwrap();
        hb.branch_hash(0b11).unwrap();
        // opcode + mask + children
        assert_eq!(hb.top_witness_len(), 2 + 10 + 20);
        hb.extension_hash(&[0x3, 0x4]).unwrap();
        assert_eq!(hb.top_witness_len(), 1 + 1 + 32);
    }
}
