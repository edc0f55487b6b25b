// Hub authentication
//
// P-256 identity (ECDSA signing key + opaque user id) and the three-step
// challenge handshake. The raw ECDH x-coordinate between our key and the
// gateway key is used directly as the AES-256-GCM key for both the
// challenge and the signed response.

use aes_gcm::aead::Aead;
use aes_gcm::{Aes256Gcm, KeyInit, Nonce};
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use p256::ecdsa::signature::Signer;
use p256::ecdsa::{Signature, SigningKey};
use p256::elliptic_curve::sec1::ToEncodedPoint;
use p256::{PublicKey, SecretKey};
use rand::RngCore;
use rand::rngs::OsRng;
use secrecy::SecretString;

use crate::error::Error;

const USER_ID_LEN: usize = 32;
const NONCE_LEN: usize = 32;
const GCM_IV_LEN: usize = 12;

/// A registered (or about-to-be-registered) hub user.
///
/// Carries the long-lived P-256 private key and the user id the hub
/// associates with its public half. Both are produced once by
/// registration and persisted by the configuration layer.
#[derive(Clone)]
pub struct HubIdentity {
    secret: SecretKey,
    user_id: Vec<u8>,
}

impl std::fmt::Debug for HubIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HubIdentity")
            .field("user_id", &self.user_id_b64())
            .finish_non_exhaustive()
    }
}

impl HubIdentity {
    /// Fresh key pair plus 32 random user-id bytes, for registration.
    pub fn generate() -> Self {
        let secret = SecretKey::random(&mut OsRng);
        let mut user_id = vec![0u8; USER_ID_LEN];
        OsRng.fill_bytes(&mut user_id);
        Self { secret, user_id }
    }

    /// Restore an identity from its persisted form: hex private scalar and
    /// base64 user id.
    pub fn from_stored(private_key_hex: &str, user_id_b64: &str) -> Result<Self, Error> {
        let raw = hex::decode(private_key_hex.trim())
            .map_err(|e| Error::InvalidKey(format!("private key is not hex: {e}")))?;
        let secret = SecretKey::from_slice(&raw)
            .map_err(|_| Error::InvalidKey("private key is not a valid P-256 scalar".into()))?;
        let user_id = BASE64
            .decode(user_id_b64.trim())
            .map_err(|e| Error::InvalidKey(format!("user id is not base64: {e}")))?;
        if user_id.is_empty() {
            return Err(Error::InvalidKey("user id is empty".into()));
        }
        Ok(Self { secret, user_id })
    }

    /// Private scalar as hex, for persistence.
    pub fn private_key_hex(&self) -> SecretString {
        SecretString::from(hex::encode(self.secret.to_bytes()))
    }

    pub fn user_id_b64(&self) -> String {
        BASE64.encode(&self.user_id)
    }

    /// Uncompressed SEC1 public point (65 bytes), base64-encoded, as
    /// `addUser` expects it.
    pub fn public_key_b64(&self) -> String {
        let point = self.secret.public_key().to_encoded_point(false);
        BASE64.encode(point.as_bytes())
    }

    /// Start a handshake against the gateway key returned by `pubKey`.
    pub fn handshake(&self, gateway_key_b64: &str) -> Result<Handshake, Error> {
        let raw = BASE64
            .decode(gateway_key_b64.trim())
            .map_err(|e| Error::Crypto(format!("gateway key is not base64: {e}")))?;
        let gateway = PublicKey::from_sec1_bytes(&raw)
            .map_err(|_| Error::Crypto("gateway key is not a P-256 point".into()))?;

        let shared = p256::ecdh::diffie_hellman(self.secret.to_nonzero_scalar(), gateway.as_affine());
        let cipher = Aes256Gcm::new_from_slice(shared.raw_secret_bytes())
            .map_err(|e| Error::Crypto(e.to_string()))?;

        Ok(Handshake {
            cipher,
            signing: SigningKey::from(&self.secret),
        })
    }
}

/// In-flight authentication state: the session cipher and our signer.
pub struct Handshake {
    cipher: Aes256Gcm,
    signing: SigningKey,
}

impl Handshake {
    /// Decrypt the hub's challenge nonce and produce the encrypted,
    /// signed `authenticate` password.
    ///
    /// A challenge that fails to decrypt means the hub does not know our
    /// user id (it encrypted for a different key), which is reported as
    /// an authentication failure rather than a crypto error.
    pub fn respond(&self, encrypted_challenge_b64: &str) -> Result<String, Error> {
        let encrypted = BASE64
            .decode(encrypted_challenge_b64.trim())
            .map_err(|e| Error::Crypto(format!("challenge is not base64: {e}")))?;

        let dev_nonce = self
            .cipher
            .decrypt(Nonce::from_slice(&[0u8; GCM_IV_LEN]), encrypted.as_ref())
            .map_err(|_| Error::Authentication {
                message: "hub challenge could not be decrypted (user not registered?)".into(),
            })?;
        if dev_nonce.len() < GCM_IV_LEN {
            return Err(Error::Crypto(format!(
                "challenge nonce too short: {} bytes",
                dev_nonce.len()
            )));
        }

        let mut user_nonce = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut user_nonce);

        let mut message = dev_nonce.clone();
        message.extend_from_slice(&user_nonce);
        let signature: Signature = self.signing.sign(&message);

        let mut payload = signature.to_der().as_bytes().to_vec();
        payload.extend_from_slice(&user_nonce);

        let encrypted = self
            .cipher
            .encrypt(Nonce::from_slice(&dev_nonce[..GCM_IV_LEN]), payload.as_ref())
            .map_err(|e| Error::Crypto(e.to_string()))?;

        Ok(BASE64.encode(encrypted))
    }
}
