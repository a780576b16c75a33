//! Cryptographic primitives for the login handshake: the proxy RSA
//! keypair, nonce generation, the identity-service digest and offline
//! profile ids.

use md5::{Digest as _, Md5};
use num_bigint::BigInt;
use rand::distributions::Alphanumeric;
use rand::rngs::OsRng;
use rand::{Rng, RngCore};
use rsa::pkcs8::{DecodePrivateKey, EncodePublicKey};
use rsa::{Pkcs1v15Encrypt, RsaPrivateKey, RsaPublicKey};
use sha1::Sha1;
use subtle::ConstantTimeEq;
use uuid::Uuid;

/// Key size the vanilla client expects.
const RSA_BITS: usize = 1024;

/// The proxy's RSA keypair. Read-only after startup.
pub struct ProxyKeypair {
    private_key: RsaPrivateKey,
    public_key_der: Vec<u8>,
}

impl ProxyKeypair {
    /// Generates a fresh keypair.
    pub fn generate() -> anyhow::Result<Self> {
        let private_key = RsaPrivateKey::new(&mut OsRng, RSA_BITS)?;
        Self::from_private_key(private_key)
    }

    /// Loads a PKCS#8 DER private key from disk.
    pub fn from_der_file(path: &std::path::Path) -> anyhow::Result<Self> {
        let der = std::fs::read(path)?;
        let private_key = RsaPrivateKey::from_pkcs8_der(&der)?;
        Self::from_private_key(private_key)
    }

    fn from_private_key(private_key: RsaPrivateKey) -> anyhow::Result<Self> {
        let public_key_der = RsaPublicKey::from(&private_key)
            .to_public_key_der()?
            .into_vec();
        Ok(Self {
            private_key,
            public_key_der,
        })
    }

    /// X.509 SubjectPublicKeyInfo form, as sent in the encryption request.
    pub fn public_key_der(&self) -> &[u8] {
        &self.public_key_der
    }

    /// RSA-PKCS1v1.5 decrypt with the private key.
    pub fn decrypt(&self, ciphertext: &[u8]) -> anyhow::Result<Vec<u8>> {
        Ok(self.private_key.decrypt(Pkcs1v15Encrypt, ciphertext)?)
    }
}

/// Random alphanumeric server id salt for the encryption request.
pub fn gen_salt() -> String {
    OsRng
        .sample_iter(&Alphanumeric)
        .take(16)
        .map(char::from)
        .collect()
}

/// Random bytes from the OS CSPRNG.
pub fn random_bytes(len: usize) -> Vec<u8> {
    let mut bytes = vec![0u8; len];
    OsRng.fill_bytes(&mut bytes);
    bytes
}

/// Constant-time byte comparison for verify tokens.
pub fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    a.len() == b.len() && bool::from(a.ct_eq(b))
}

/// The identity service's server digest: SHA-1 over salt, shared
/// secret and public key, rendered as a signed two's-complement hex
/// number (the historical Java formatting).
pub fn server_digest(server_id: &str, shared_secret: &[u8], public_key_der: &[u8]) -> String {
    let mut hasher = Sha1::new();
    hasher.update(server_id.as_bytes());
    hasher.update(shared_secret);
    hasher.update(public_key_der);
    let digest = hasher.finalize();
    BigInt::from_signed_bytes_be(&digest).to_str_radix(16)
}

/// Deterministic offline profile id: md5 name-UUID of
/// `"OfflinePlayer:" + name`.
pub fn offline_uuid(name: &str) -> Uuid {
    let mut hash: [u8; 16] = Md5::digest(format!("OfflinePlayer:{}", name).as_bytes()).into();
    hash[6] = (hash[6] & 0x0f) | 0x30;
    hash[8] = (hash[8] & 0x3f) | 0x80;
    Uuid::from_bytes(hash)
}

/// Canonicalizes a profile id (with or without hyphens) to a [`Uuid`].
pub fn canonical_uuid(id: &str) -> Option<Uuid> {
    Uuid::parse_str(id).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    // The classic digest vectors from the protocol documentation,
    // hashing only the name part.
    #[test]
    fn server_digest_signed_hex() {
        assert_eq!(
            server_digest("Notch", &[], &[]),
            "4ed1f46bbe04bc756bcb17c0c7ce3e4632f06a48"
        );
        assert_eq!(
            server_digest("jeb_", &[], &[]),
            "-7c9d5b0044c130109a5d7b5fb5c317c02b4e28c1"
        );
        assert_eq!(
            server_digest("simon", &[], &[]),
            "88e16a1019277b15d58faf0541e11910eb756f6"
        );
    }

    #[test]
    fn offline_uuid_is_deterministic_v3() {
        let uuid = offline_uuid("Alice");
        assert_eq!(uuid, offline_uuid("Alice"));
        assert_ne!(uuid, offline_uuid("Bob"));
        assert_eq!(uuid.get_version_num(), 3);
    }

    #[test]
    fn canonical_uuid_accepts_both_forms() {
        let hyphenated = canonical_uuid("069a79f4-44e9-4726-a5be-fca90e38aaf5").unwrap();
        let simple = canonical_uuid("069a79f444e94726a5befca90e38aaf5").unwrap();
        assert_eq!(hyphenated, simple);
        assert!(canonical_uuid("not-a-uuid").is_none());
    }

    #[test]
    fn constant_time_eq_checks_content_and_length() {
        assert!(constant_time_eq(&[1, 2, 3], &[1, 2, 3]));
        assert!(!constant_time_eq(&[1, 2, 3], &[1, 2, 4]));
        assert!(!constant_time_eq(&[1, 2, 3], &[1, 2]));
    }

    #[test]
    fn keypair_decrypts_what_public_encrypts() {
        use rsa::pkcs8::DecodePublicKey;

        let keypair = ProxyKeypair::generate().unwrap();
        let public_key = RsaPublicKey::from_public_key_der(keypair.public_key_der()).unwrap();
        let secret = random_bytes(16);
        let ciphertext = public_key
            .encrypt(&mut OsRng, Pkcs1v15Encrypt, &secret)
            .unwrap();
        assert_eq!(keypair.decrypt(&ciphertext).unwrap(), secret);
    }
}
