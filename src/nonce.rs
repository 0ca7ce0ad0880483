use rand::distributions::{Distribution, Uniform};
use rand::Rng;

pub const NONCE_LEN: usize = 64;

/// A 64-byte token drawn uniformly from printable ASCII. `Copy`/`Eq`/`Hash`
/// so it can be used directly as a `HashMap` key in the nonce correlation
/// index.
#[derive(Copy, Clone, PartialEq, Eq, Hash)]
pub struct Nonce([u8; NONCE_LEN]);

impl Nonce {
    pub fn as_bytes(&self) -> &[u8; NONCE_LEN] {
        &self.0
    }

    /// Builds a `Nonce` from bytes read off the wire, on a `DIFF_BACK`
    /// connect-back's first line. Fails if the slice isn't exactly 64
    /// bytes.
    pub fn from_bytes(bytes: &[u8]) -> Option<Nonce> {
        if bytes.len() != NONCE_LEN {
            return None;
        }
        let mut buf = [0u8; NONCE_LEN];
        buf.copy_from_slice(bytes);
        Some(Nonce(buf))
    }
}

impl std::fmt::Debug for Nonce {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "Nonce({})", String::from_utf8_lossy(&self.0))
    }
}

/// Printable ASCII range, inclusive.
const PRINTABLE_LOW: u8 = 0x20;
const PRINTABLE_HIGH: u8 = 0x7e;

fn generate_one<R: Rng + ?Sized>(rng: &mut R) -> Nonce {
    let dist = Uniform::new_inclusive(PRINTABLE_LOW, PRINTABLE_HIGH);
    let mut buf = [0u8; NONCE_LEN];
    for slot in buf.iter_mut() {
        *slot = dist.sample(rng);
    }
    Nonce(buf)
}

/// Generates a nonce, regenerating on collision against `exists`. A
/// collision is astronomically unlikely but must be retried rather than
/// overwrite a live entry.
pub fn generate_unique<F: FnMut(&Nonce) -> bool>(mut exists: F) -> Nonce {
    let mut rng = rand::thread_rng();
    loop {
        let candidate = generate_one(&mut rng);
        if !exists(&candidate) {
            return candidate;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_nonce_is_printable_ascii() {
        let n = generate_unique(|_| false);
        assert_eq!(n.as_bytes().len(), NONCE_LEN);
        assert!(n
            .as_bytes()
            .iter()
            .all(|&b| (PRINTABLE_LOW..=PRINTABLE_HIGH).contains(&b)));
    }

    #[test]
    fn retries_on_collision() {
        let mut calls = 0;
        let n = generate_unique(|_| {
            calls += 1;
            calls <= 3
        });
        assert_eq!(n.as_bytes().len(), NONCE_LEN);
        assert_eq!(calls, 4);
    }

    #[test]
    fn from_bytes_rejects_wrong_length() {
        assert!(Nonce::from_bytes(b"too short").is_none());
        assert!(Nonce::from_bytes(&[b'x'; NONCE_LEN]).is_some());
    }

    #[test]
    fn equality_is_by_value() {
        let a = Nonce::from_bytes(&[b'a'; NONCE_LEN]).unwrap();
        let b = Nonce::from_bytes(&[b'a'; NONCE_LEN]).unwrap();
        assert_eq!(a, b);
    }
}
