use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::rngs::OsRng;

use crate::constants::KDF_CONTEXT_CONTENT_KEY;
use crate::error::IdentityError;
use crate::types::DrivePublicKey;

/// The writer key of an owned drive. The public half identifies the drive;
/// only the holder of the secret half can append to it.
#[derive(Clone)]
pub struct DriveKeypair {
    signing_key: SigningKey,
}

impl DriveKeypair {
    /// Generate a new random drive keypair
    pub fn generate() -> Self {
        let signing_key = SigningKey::generate(&mut OsRng);
        Self { signing_key }
    }

    /// Restore a keypair from secret key bytes
    pub fn from_secret_bytes(secret: &[u8; 32]) -> Self {
        let signing_key = SigningKey::from_bytes(secret);
        Self { signing_key }
    }

    pub fn public_key(&self) -> DrivePublicKey {
        DrivePublicKey(self.signing_key.verifying_key().to_bytes())
    }

    pub fn secret_bytes(&self) -> &[u8; 32] {
        self.signing_key.as_bytes()
    }

    pub fn sign(&self, message: &[u8]) -> Signature {
        self.signing_key.sign(message)
    }
}

impl std::fmt::Debug for DriveKeypair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DriveKeypair")
            .field("public_key", &self.public_key().short())
            .finish_non_exhaustive()
    }
}

/// Key identifying the drive's blob content, recorded alongside the drive.
pub fn derive_content_key(public_key: &DrivePublicKey) -> [u8; 32] {
    blake3::derive_key(KDF_CONTEXT_CONTENT_KEY, &public_key.0)
}

/// Verify a detached signature against a drive public key
pub fn verify_signature(
    public_key: &DrivePublicKey,
    message: &[u8],
    signature: &[u8],
) -> Result<(), IdentityError> {
    let verifying_key =
        VerifyingKey::from_bytes(&public_key.0).map_err(|_| IdentityError::InvalidKeyBytes)?;
    let signature =
        Signature::from_slice(signature).map_err(|_| IdentityError::BadSignature)?;
    verifying_key
        .verify(message, &signature)
        .map_err(|_| IdentityError::BadSignature)
}
