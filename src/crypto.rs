//! Common cryptographic routines for the CTAP2 PIN protocol and OTP seed
//! generation.
use openssl::{
    bn::{BigNum, BigNumContext},
    ec::{EcGroup, EcKey},
    hash::MessageDigest,
    nid::Nid,
    pkey::{PKey, Private, Public},
    pkey_ctx::PkeyCtx,
    sha::Sha256,
    sign::Signer,
    symm::{Cipher, Crypter, Mode},
};

use crate::error::{AgentError, Result};

pub type Sha256Hash = [u8; 32];

pub fn compute_sha256(data: &[u8]) -> Sha256Hash {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hasher.finish()
}

/// Gets an [EcGroup] for P-256.
pub fn get_group() -> Result<EcGroup> {
    Ok(EcGroup::from_curve_name(Nid::X9_62_PRIME256V1)?)
}

/// Generate a fresh, random P-256 private key.
pub fn regenerate() -> Result<EcKey<Private>> {
    let group = get_group()?;
    Ok(EcKey::generate(&group)?)
}

/// Big-endian affine coordinates of a P-256 public key, zero-padded to
/// 32 bytes each.
pub fn public_key_coords(key: &EcKey<Private>) -> Result<(Vec<u8>, Vec<u8>)> {
    let group = get_group()?;
    let mut ctx = BigNumContext::new()?;
    let mut x = BigNum::new()?;
    let mut y = BigNum::new()?;
    key.public_key()
        .affine_coordinates_gfp(&group, &mut x, &mut y, &mut ctx)?;
    Ok((x.to_vec_padded(32)?, y.to_vec_padded(32)?))
}

/// Builds a P-256 public key from big-endian affine coordinates.
pub fn public_key_from_coords(x: &[u8], y: &[u8]) -> Result<EcKey<Public>> {
    let group = get_group()?;
    let x = BigNum::from_slice(x)?;
    let y = BigNum::from_slice(y)?;
    Ok(EcKey::from_public_key_affine_coordinates(&group, &x, &y)?)
}

/// ECDH: writes the 32-byte big-endian x-coordinate of the shared point into
/// `output`.
pub fn ecdh(private_key: EcKey<Private>, peer_key: EcKey<Public>, output: &mut [u8]) -> Result<()> {
    let peer_key = PKey::from_ec_key(peer_key)?;
    let pkey = PKey::from_ec_key(private_key)?;
    let mut ctx = PkeyCtx::new(&pkey)?;
    ctx.derive_init()?;
    ctx.derive_set_peer(&peer_key)?;
    ctx.derive(Some(output))?;
    Ok(())
}

/// Encrypts some data using AES-256-CBC, with no padding.
///
/// `plaintext.len()` must be a multiple of the cipher's block size.
pub fn encrypt(key: &[u8], iv: Option<&[u8]>, plaintext: &[u8]) -> Result<Vec<u8>> {
    let cipher = Cipher::aes_256_cbc();
    let mut ct = vec![0; plaintext.len() + cipher.block_size()];
    let mut c = Crypter::new(cipher, Mode::Encrypt, key, iv)?;
    c.pad(false);
    let l = c.update(plaintext, &mut ct)?;
    let l = l + c.finalize(&mut ct[l..])?;
    ct.truncate(l);
    Ok(ct)
}

/// Decrypts some data using AES-256-CBC, with no padding.
pub fn decrypt(key: &[u8], iv: Option<&[u8]>, ciphertext: &[u8]) -> Result<Vec<u8>> {
    let cipher = Cipher::aes_256_cbc();
    if ciphertext.len() % cipher.block_size() != 0 {
        error!(
            "ciphertext length {} is not a multiple of {} bytes",
            ciphertext.len(),
            cipher.block_size()
        );
        return Err(AgentError::OpenSsl("bad ciphertext length".to_string()));
    }

    let mut pt = vec![0; ciphertext.len() + cipher.block_size()];
    let mut c = Crypter::new(cipher, Mode::Decrypt, key, iv)?;
    c.pad(false);
    let l = c.update(ciphertext, &mut pt)?;
    let l = l + c.finalize(&mut pt[l..])?;
    pt.truncate(l);
    Ok(pt)
}

/// HMAC-SHA-256 over `data` with `key`.
pub fn hmac_sha256(key: &[u8], data: &[u8]) -> Result<Vec<u8>> {
    let pkey = PKey::hmac(key)?;
    let mut signer = Signer::new(MessageDigest::sha256(), &pkey)?;
    signer.update(data)?;
    Ok(signer.sign_to_vec()?)
}

/// Fills `buf` from the platform CSPRNG.
pub fn rand_bytes(buf: &mut [u8]) -> Result<()> {
    openssl::rand::rand_bytes(buf)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sha256_abc() {
        let h = compute_sha256(b"abc");
        assert_eq!(
            hex::encode(h),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn aes_cbc_round_trip() {
        let key = [0x42u8; 32];
        let pt = [0x05u8; 64];
        let ct = encrypt(&key, Some(&[0u8; 16]), &pt).unwrap();
        assert_eq!(ct.len(), 64);
        assert_ne!(&ct[..], &pt[..]);
        let rt = decrypt(&key, Some(&[0u8; 16]), &ct).unwrap();
        assert_eq!(&rt[..], &pt[..]);
    }

    #[test]
    fn decrypt_rejects_partial_block() {
        let key = [0u8; 32];
        assert!(decrypt(&key, None, &[0u8; 15]).is_err());
    }

    #[test]
    fn hmac_sha256_rfc4231_case_2() {
        let mac = hmac_sha256(b"Jefe", b"what do ya want for nothing?").unwrap();
        assert_eq!(
            hex::encode(mac),
            "5bdcc146bf60754e6a042426089575c75a003f089d2739839dec58b964ec3843"
        );
    }

    #[test]
    fn ecdh_agrees() {
        let a = regenerate().unwrap();
        let b = regenerate().unwrap();

        let (bx, by) = public_key_coords(&b).unwrap();
        let (ax, ay) = public_key_coords(&a).unwrap();
        assert_eq!(bx.len(), 32);
        assert_eq!(by.len(), 32);

        let mut z1 = [0u8; 32];
        let mut z2 = [0u8; 32];
        ecdh(a, public_key_from_coords(&bx, &by).unwrap(), &mut z1).unwrap();
        ecdh(b, public_key_from_coords(&ax, &ay).unwrap(), &mut z2).unwrap();
        assert_eq!(z1, z2);
    }
}
