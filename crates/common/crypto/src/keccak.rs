use std::io;

use sha3::{Digest, Keccak256};

/// One-shot Keccak-256.
pub fn keccak_hash(data: impl AsRef<[u8]>) -> [u8; 32] {
    Keccak256::digest(data.as_ref()).into()
}

/// Reusable Keccak-256 absorber.
///
/// The hash builder reuses a single instance across all node hashes of a
/// computation: absorb with [`write`](Self::write), squeeze with
/// [`finalize_into`](Self::finalize_into) (which also resets the state for
/// the next node).
#[derive(Debug, Default, Clone)]
pub struct Keccak256State {
    inner: Keccak256,
}

impl Keccak256State {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn write(&mut self, data: &[u8]) {
        self.inner.update(data);
    }

    #[inline]
    pub fn reset(&mut self) {
        self.inner.reset();
    }

    /// Squeezes the digest into `out` and resets the state.
    #[inline]
    pub fn finalize_into(&mut self, out: &mut [u8; 32]) {
        let digest = self.inner.finalize_reset();
        out.copy_from_slice(&digest);
    }
}

impl io::Write for Keccak256State {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.inner.update(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keccak_empty() {
        assert_eq!(
            keccak_hash(b"")
                .into_iter()
                .map(|x| format!("{x:02x}"))
                .collect::<String>(),
            "c5d2460186f7233c927e7db2dcc703c0e500b653ca82273b7bfad8045d85a470",
        );
    }

    #[test]
    fn streaming_matches_one_shot() {
        let mut state = Keccak256State::new();
        state.write(b"hello ");
        state.write(b"world");
        let mut out = [0u8; 32];
        state.finalize_into(&mut out);
        assert_eq!(out, keccak_hash(b"hello world"));

        // state is reset after finalize_into
        state.write(b"");
        state.finalize_into(&mut out);
        assert_eq!(out, keccak_hash(b""));
    }
}
