use blake2::{Blake2b512, Digest};
use num::BigInt;
use once_cell::sync::Lazy;
use ripemd::Ripemd160;
use secp256k1::ecdsa::{RecoverableSignature, RecoveryId, Signature};
use secp256k1::{All, Message, PublicKey, Secp256k1, SecretKey};
use sha1::Sha1;
use sha2::Sha256;

static SECP: Lazy<Secp256k1<All>> = Lazy::new(Secp256k1::new);

pub fn sha256(data: &[u8]) -> [u8; 32] {
    Sha256::digest(data).into()
}

pub fn sha1(data: &[u8]) -> [u8; 20] {
    Sha1::digest(data).into()
}

pub fn ripemd160(data: &[u8]) -> [u8; 20] {
    Ripemd160::digest(data).into()
}

pub fn hash160(data: &[u8]) -> [u8; 20] {
    ripemd160(&sha256(data))
}

pub fn hash256(data: &[u8]) -> [u8; 32] {
    sha256(&sha256(data))
}

/// The engine's native digest: the low half of blake2b-512.
pub fn blake2bl(data: &[u8]) -> [u8; 32] {
    let wide: [u8; 64] = Blake2b512::digest(data).into();
    let mut out = [0u8; 32];
    out.copy_from_slice(&wide[32..]);
    out
}

/// blake2bl further shortened to its low 20 bytes.
pub fn blake2bls(data: &[u8]) -> [u8; 20] {
    let wide: [u8; 64] = Blake2b512::digest(data).into();
    let mut out = [0u8; 20];
    out.copy_from_slice(&wide[44..]);
    out
}

/// The compressed composition: blake2bls over blake2bl.
pub fn blake2blc(data: &[u8]) -> [u8; 20] {
    blake2bls(&blake2bl(data))
}

/// Verifies a compact ECDSA signature over a 32-byte message hash.
///
/// Signatures travel as 65 bytes; the 65th byte is the recovery id and is
/// ignored here.
pub fn verify_signature(msg: &[u8; 32], signature: &[u8], pubkey: &[u8]) -> bool {
    let Ok(msg) = Message::from_slice(msg) else {
        return false;
    };
    let sig = match signature.get(..64).and_then(|s| Signature::from_compact(s).ok()) {
        Some(sig) => sig,
        None => return false,
    };
    let pk = match PublicKey::from_slice(pubkey) {
        Ok(pk) => pk,
        Err(_) => return false,
    };
    SECP.verify_ecdsa(&msg, &sig, &pk).is_ok()
}

/// Recovers the compressed public key from a 65-byte recoverable signature.
pub fn pubkey_from_signature(msg: &[u8; 32], signature: &[u8]) -> Option<PublicKey> {
    if signature.len() < 65 {
        return None;
    }
    let msg = Message::from_slice(msg).ok()?;
    let recid = RecoveryId::from_i32(signature[64] as i32).ok()?;
    let sig = RecoverableSignature::from_compact(&signature[..64], recid).ok()?;
    SECP.recover_ecdsa(&msg, &sig).ok()
}

/// Produces the 65-byte recoverable signature consumed by the signature
/// opcodes: 64 compact bytes plus the recovery id.
pub fn sign_recoverable(msg: &[u8; 32], secret: &SecretKey) -> [u8; 65] {
    // Message::from_slice only fails on length, and the input is fixed-width
    let msg = Message::from_slice(msg).expect("32-byte message");
    let (recid, compact) = SECP
        .sign_ecdsa_recoverable(&msg, secret)
        .serialize_compact();
    let mut out = [0u8; 65];
    out[..64].copy_from_slice(&compact);
    out[64] = recid.to_i32() as u8;
    out
}

pub fn public_key(secret: &SecretKey) -> PublicKey {
    PublicKey::from_secret_key(&SECP, secret)
}

/// Deterministic byte-difference distance between two digests: the sum of
/// absolute per-byte differences, shorter input left-padded with zeroes.
pub fn byte_distance(a: &[u8], b: &[u8]) -> BigInt {
    let width = a.len().max(b.len());
    let mut sum = BigInt::from(0u32);
    for i in 1..=width {
        let x = if i <= a.len() { a[a.len() - i] } else { 0 };
        let y = if i <= b.len() { b[b.len() - i] } else { 0 };
        sum += (x as i32 - y as i32).abs();
    }
    sum
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_key() -> SecretKey {
        SecretKey::from_slice(&[0x17; 32]).unwrap()
    }

    #[test]
    fn blake2bl_is_low_half_of_blake2b512() {
        let wide: [u8; 64] = Blake2b512::digest(b"collider").into();
        assert_eq!(blake2bl(b"collider"), wide[32..]);
        assert_eq!(blake2bls(b"collider"), wide[44..]);
        assert_eq!(blake2blc(b"collider"), blake2bls(&blake2bl(b"collider")));
    }

    #[test]
    fn recovered_key_verifies() {
        let sk = test_key();
        let msg = sha256(b"spend authorization");
        let sig = sign_recoverable(&msg, &sk);
        let recovered = pubkey_from_signature(&msg, &sig).unwrap();
        assert_eq!(recovered, public_key(&sk));
        assert!(verify_signature(&msg, &sig, &recovered.serialize()));
    }

    #[test]
    fn bit_flip_rejects() {
        let sk = test_key();
        let msg = sha256(b"spend authorization");
        let mut sig = sign_recoverable(&msg, &sk);
        sig[10] ^= 0x01;
        assert!(!verify_signature(&msg, &sig, &public_key(&sk).serialize()));
    }

    #[test]
    fn byte_distance_is_zero_on_equal_inputs() {
        assert_eq!(byte_distance(b"abc", b"abc"), BigInt::from(0));
        assert_eq!(byte_distance(&[0, 5], &[5]), BigInt::from(0));
        assert_eq!(byte_distance(&[1, 2], &[1, 5]), BigInt::from(3));
    }
}
