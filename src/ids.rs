//! Crockford-base32 ULIDs: a 48-bit millisecond timestamp followed by 80
//! bits of randomness, packed into 26 characters. Not required to be
//! strictly monotonic — lexicographic ordering by creation time within a
//! millisecond is good enough for ledger IDs and log correlation.

use rand::RngCore;
use std::time::{SystemTime, UNIX_EPOCH};

const CROCKFORD32: &[u8; 32] = b"0123456789ABCDEFGHJKMNPQRSTVWXYZ";

pub fn ulid() -> String {
    let ts_ms = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock before unix epoch")
        .as_millis() as u64;

    let mut rand_bytes = [0u8; 10]; // 80 bits
    rand::thread_rng().fill_bytes(&mut rand_bytes);
    let rand: u128 = rand_bytes.iter().fold(0u128, |acc, b| (acc << 8) | *b as u128);

    let value: u128 = ((ts_ms as u128) << 80) | rand; // 128 bits
    let value = value << 2; // 130 bits, ULID is 26 * 5-bit groups

    let mut out = String::with_capacity(26);
    for i in 0..26 {
        let shift = (25 - i) * 5;
        let idx = ((value >> shift) & 0x1F) as usize;
        out.push(CROCKFORD32[idx] as char);
    }
    out
}

pub fn new_id(prefix: &str) -> String {
    format!("{}_{}", prefix, ulid())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ulid_is_26_chars_of_crockford_alphabet() {
        let id = ulid();
        assert_eq!(id.len(), 26);
        assert!(id.bytes().all(|b| CROCKFORD32.contains(&b)));
    }

    #[test]
    fn new_id_prefixes_and_is_unique() {
        let a = new_id("tx");
        let b = new_id("tx");
        assert!(a.starts_with("tx_"));
        assert_ne!(a, b);
    }

    #[test]
    fn ids_are_lexicographically_increasing_across_milliseconds() {
        let a = ulid();
        std::thread::sleep(std::time::Duration::from_millis(2));
        let b = ulid();
        assert!(b > a);
    }
}
