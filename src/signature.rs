// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! PGP signature verification and repository signing.

The verifier fronts every trust decision in the fetch pipeline: `InRelease`
files, `.changes` files, and `.dsc` files all pass through
[SignatureVerifier::verify_and_clear]. Two toggles adjust strictness:
`accept_unsigned` lets unsigned input pass through, and `ignore_signatures`
extracts cleartext without verification.

The signer produces the composer's `InRelease` (inline clearsigned) and
`Release.gpg` (detached, armored) outputs.
*/

use {
    crate::error::{DebmillError, Result},
    pgp::{
        crypto::{HashAlgorithm, SymmetricKeyAlgorithm},
        packet::{Subpacket, SignatureConfig, SignatureType, SignatureVersion},
        types::{CompressionAlgorithm, KeyTrait, SecretKeyTrait},
        Deserializable, KeyType, SecretKeyParams, SecretKeyParamsBuilder, SignedPublicKey,
        SignedSecretKey, StandaloneSignature,
    },
    pgp_cleartext::{cleartext_sign, CleartextSignatureReader},
    smallvec::smallvec,
    std::{
        io::{Cursor, Read},
        path::Path,
    },
};

const CLEARSIGN_HEADER: &str = "-----BEGIN PGP SIGNED MESSAGE-----";

/// Whether a document begins with the PGP cleartext signature header.
pub fn is_clearsigned(data: &[u8]) -> bool {
    data.starts_with(CLEARSIGN_HEADER.as_bytes())
}

/// Verifies clearsigned documents against a configured key set.
#[derive(Clone, Default)]
pub struct SignatureVerifier {
    keys: Vec<SignedPublicKey>,

    /// Accept documents without any signature.
    pub accept_unsigned: bool,

    /// Extract cleartext without verifying signatures.
    pub ignore_signatures: bool,
}

impl SignatureVerifier {
    /// Construct a verifier trusting the given public keys.
    pub fn new(keys: Vec<SignedPublicKey>) -> Self {
        Self {
            keys,
            accept_unsigned: false,
            ignore_signatures: false,
        }
    }

    /// Parse armored public keys, accepting one or many per input.
    pub fn load_armored_keys(data: &[u8]) -> Result<Vec<SignedPublicKey>> {
        let (keys, _) = SignedPublicKey::from_armor_many(Cursor::new(data))?;

        keys.collect::<pgp::errors::Result<Vec<_>>>()
            .map_err(DebmillError::Pgp)
    }

    /// A copy of this verifier that additionally accepts unsigned input.
    ///
    /// Used for the `.dsc` fallback path where the enclosing trust anchor was
    /// itself signed.
    pub fn accepting_unsigned(&self) -> Self {
        let mut verifier = self.clone();
        verifier.accept_unsigned = true;
        verifier
    }

    /// Verify a document and return its cleartext plus the verifying key ids.
    ///
    /// Behavior by input state and configuration:
    ///
    /// | input       | `accept_unsigned` | `ignore_signatures` | result |
    /// |-------------|-------------------|---------------------|--------|
    /// | clearsigned | any               | true                | cleartext, no keys |
    /// | clearsigned | any               | false               | verify, cleartext + keys |
    /// | unsigned    | false             | any                 | missing-signature error |
    /// | unsigned    | true              | any                 | pass through |
    pub fn verify_and_clear(&self, name: &str, data: &[u8]) -> Result<(Vec<u8>, Vec<String>)> {
        let clearsigned = is_clearsigned(data);

        if !clearsigned {
            return if self.accept_unsigned {
                Ok((data.to_vec(), vec![]))
            } else {
                Err(DebmillError::SignatureMissing(name.to_string()))
            };
        }

        let mut reader = CleartextSignatureReader::new(Cursor::new(data));
        let mut cleartext = vec![];
        reader
            .read_to_end(&mut cleartext)
            .map_err(|e| DebmillError::SignatureInvalid(format!("{}: {}", name, e)))?;
        let signatures = reader.finalize();

        if self.ignore_signatures {
            return Ok((cleartext, vec![]));
        }

        let mut verified_keys = vec![];
        for key in &self.keys {
            if signatures.verify(key).is_ok() {
                verified_keys.push(hex::encode(key.key_id().as_ref()));
            }
        }

        if verified_keys.is_empty() {
            return Err(DebmillError::SignatureInvalid(format!(
                "{}: no signature verifies against the configured keys",
                name
            )));
        }

        Ok((cleartext, verified_keys))
    }
}

/// Signs composed repository metadata.
pub struct RepoSigner {
    key: SignedSecretKey,
    passphrase: String,
}

impl RepoSigner {
    /// Construct from an armored secret key and its passphrase (empty string
    /// for an unprotected key).
    pub fn from_armored_key(data: &[u8], passphrase: impl ToString) -> Result<Self> {
        let (key, _) = SignedSecretKey::from_armor_single(Cursor::new(data))?;

        Ok(Self {
            key,
            passphrase: passphrase.to_string(),
        })
    }

    /// Construct from an already-parsed secret key.
    pub fn new(key: SignedSecretKey, passphrase: impl ToString) -> Self {
        Self {
            key,
            passphrase: passphrase.to_string(),
        }
    }

    /// The signed public key counterpart, for exporting alongside the
    /// repository.
    pub fn signed_public_key(&self) -> Result<SignedPublicKey> {
        let passphrase = self.passphrase.clone();
        let public = self.key.public_key();

        Ok(public.sign(&self.key, || passphrase)?)
    }

    /// Inline-clearsign `source` into `dest` (the `InRelease` flavor).
    pub fn clearsign(&self, source: &Path, dest: &Path) -> Result<()> {
        let data = std::fs::read(source)
            .map_err(|e| DebmillError::IoPath(source.display().to_string(), e))?;

        let passphrase = self.passphrase.clone();
        let signed = cleartext_sign(
            &self.key,
            || passphrase,
            HashAlgorithm::SHA2_256,
            Cursor::new(data),
        )?;

        std::fs::write(dest, signed)
            .map_err(|e| DebmillError::IoPath(dest.display().to_string(), e))?;

        Ok(())
    }

    /// Produce an armored detached signature of `source` at `dest` (the
    /// `Release.gpg` flavor).
    pub fn detached_sign(&self, source: &Path, dest: &Path) -> Result<()> {
        let data = std::fs::read(source)
            .map_err(|e| DebmillError::IoPath(source.display().to_string(), e))?;

        let config = SignatureConfig::new_v4(
            SignatureVersion::V4,
            SignatureType::Binary,
            self.key.algorithm(),
            HashAlgorithm::SHA2_256,
            vec![Subpacket::SignatureCreationTime(chrono::Utc::now())],
            vec![Subpacket::Issuer(self.key.key_id())],
        );

        let passphrase = self.passphrase.clone();
        let signature = config.sign(&self.key, || passphrase, Cursor::new(data))?;

        let armored = StandaloneSignature::new(signature).to_armored_string(None)?;

        std::fs::write(dest, armored)
            .map_err(|e| DebmillError::IoPath(dest.display().to_string(), e))?;

        Ok(())
    }
}

/// Obtain a [SecretKeyParamsBuilder] with defaults appropriate for a
/// repository signing key.
pub fn signing_key_params_builder(primary_user_id: impl ToString) -> SecretKeyParamsBuilder {
    let mut params = SecretKeyParamsBuilder::default();
    params
        .key_type(KeyType::Rsa(2048))
        .preferred_symmetric_algorithms(smallvec![SymmetricKeyAlgorithm::AES256])
        .preferred_hash_algorithms(smallvec![
            HashAlgorithm::SHA2_256,
            HashAlgorithm::SHA2_384,
            HashAlgorithm::SHA2_512
        ])
        .preferred_compression_algorithms(smallvec![CompressionAlgorithm::ZLIB])
        .can_create_certificates(false)
        .can_sign(true)
        .primary_user_id(primary_user_id.to_string());

    params
}

/// Create a self-signed key pair from the given params.
pub fn create_self_signed_key<PW>(
    params: SecretKeyParams,
    key_passphrase: PW,
) -> Result<(SignedSecretKey, SignedPublicKey)>
where
    PW: (FnOnce() -> String) + Clone,
{
    let secret_key = params.generate()?;
    let secret_key_signed = secret_key.sign(key_passphrase.clone())?;

    let public_key = secret_key_signed.public_key();
    let public_key_signed = public_key.sign(&secret_key_signed, key_passphrase)?;

    Ok((secret_key_signed, public_key_signed))
}
