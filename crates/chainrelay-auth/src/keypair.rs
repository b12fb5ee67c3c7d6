//! Ed25519 identity used to answer auth challenges.

use std::fmt;

use ed25519_dalek::{Signer, SigningKey};

use chainrelay_core::error::AuthError;
use chainrelay_core::transaction::Pubkey;

pub struct Keypair {
    signing: SigningKey,
}

impl Keypair {
    pub fn from_secret(secret: [u8; 32]) -> Self {
        Self {
            signing: SigningKey::from_bytes(&secret),
        }
    }

    /// Parse a base58 secret: either the 64-byte `secret || public` form
    /// wallets export, or a bare 32-byte secret.
    pub fn from_base58(s: &str) -> Result<Self, AuthError> {
        let bytes = bs58::decode(s.trim())
            .into_vec()
            .map_err(|e| AuthError::InvalidKey(format!("not base58: {e}")))?;
        Self::from_bytes(&bytes)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, AuthError> {
        match bytes.len() {
            64 => {
                let mut arr = [0u8; 64];
                arr.copy_from_slice(bytes);
                let signing = SigningKey::from_keypair_bytes(&arr)
                    .map_err(|e| AuthError::InvalidKey(e.to_string()))?;
                Ok(Self { signing })
            }
            32 => {
                let mut arr = [0u8; 32];
                arr.copy_from_slice(bytes);
                Ok(Self::from_secret(arr))
            }
            n => Err(AuthError::InvalidKey(format!(
                "expected 32 or 64 key bytes, got {n}"
            ))),
        }
    }

    pub fn pubkey(&self) -> Pubkey {
        Pubkey(self.signing.verifying_key().to_bytes())
    }

    pub fn sign(&self, message: &[u8]) -> [u8; 64] {
        self.signing.sign(message).to_bytes()
    }

    /// Answer an auth challenge. Returns the signed message,
    /// `"{pubkey}-{challenge}"`, together with its signature; the relay
    /// expects both back.
    pub fn answer_challenge(&self, challenge: &str) -> (String, [u8; 64]) {
        let message = format!("{}-{}", self.pubkey(), challenge);
        let sig = self.sign(message.as_bytes());
        (message, sig)
    }
}

impl fmt::Debug for Keypair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Keypair").field("pubkey", &self.pubkey()).finish()
    }
}
