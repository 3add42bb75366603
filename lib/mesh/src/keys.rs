use anyhow::{Context, anyhow};
use data_encoding::BASE64;
use rand::RngCore;
use x25519_dalek::{PublicKey, StaticSecret};

/// An X25519 keypair for the overlay, both halves base64-encoded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MeshKeypair {
  pub private_key: String,
  pub public_key: String,
}

impl MeshKeypair {
  /// Generate a fresh keypair from the OS random source.
  pub fn generate() -> MeshKeypair {
    let mut bytes = [0u8; 32];
    rand::rngs::OsRng.fill_bytes(&mut bytes);
    clamp_scalar(&mut bytes);
    let secret = StaticSecret::from(bytes);
    let public = PublicKey::from(&secret);
    MeshKeypair {
      private_key: BASE64.encode(&secret.to_bytes()),
      public_key: BASE64.encode(public.as_bytes()),
    }
  }

  /// Rebuild the pair from a persisted base64 private key.
  pub fn from_private_key(
    private_key: &str,
  ) -> anyhow::Result<MeshKeypair> {
    let public_key = derive_public_key(private_key)?;
    Ok(MeshKeypair {
      private_key: private_key.trim().to_string(),
      public_key,
    })
  }
}

/// Derive the base64 public key from a base64 private key,
/// clamping the scalar per RFC 7748.
pub fn derive_public_key(private_key: &str) -> anyhow::Result<String> {
  let decoded = BASE64
    .decode(private_key.trim().as_bytes())
    .context("mesh private key is not valid base64")?;
  let mut bytes: [u8; 32] = decoded
    .try_into()
    .map_err(|_| anyhow!("mesh private key must decode to 32 bytes"))?;
  clamp_scalar(&mut bytes);
  let secret = StaticSecret::from(bytes);
  let public = PublicKey::from(&secret);
  Ok(BASE64.encode(public.as_bytes()))
}

/// Clamp per RFC 7748: clear bits 0-2 of byte 0,
/// clear bit 7 and set bit 6 of byte 31.
fn clamp_scalar(bytes: &mut [u8; 32]) {
  bytes[0] &= 248;
  bytes[31] &= 127;
  bytes[31] |= 64;
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn generated_keys_are_44_char_base64() {
    let pair = MeshKeypair::generate();
    assert_eq!(pair.private_key.len(), 44);
    assert_eq!(pair.public_key.len(), 44);
    assert_ne!(pair.private_key, pair.public_key);
  }

  #[test]
  fn public_key_derivation_is_deterministic() {
    let pair = MeshKeypair::generate();
    let rebuilt =
      MeshKeypair::from_private_key(&pair.private_key).unwrap();
    assert_eq!(rebuilt, pair);
  }

  #[test]
  fn rfc7748_section_6_1_vector() {
    // Alice's keypair from RFC 7748 §6.1. The private scalar is
    // already clamped, so clamping must be a no-op here.
    let private = hex_to_b64(
      "77076d0a7318a57d3c16c17251b26645df4c2f87ebc0992ab177fba51db92c2a",
    );
    let public = hex_to_b64(
      "8520f0098930a754748b7ddcb43ef75a0dbf3a0d26381af4eba4a98eaa9b4e6a",
    );
    assert_eq!(derive_public_key(&private).unwrap(), public);
  }

  #[test]
  fn invalid_base64_is_rejected() {
    assert!(derive_public_key("not base64!!").is_err());
    // valid base64, wrong length
    assert!(derive_public_key(&BASE64.encode(&[0u8; 16])).is_err());
  }

  fn hex_to_b64(hex: &str) -> String {
    let bytes = (0..hex.len())
      .step_by(2)
      .map(|i| u8::from_str_radix(&hex[i..i + 2], 16).unwrap())
      .collect::<Vec<_>>();
    BASE64.encode(&bytes)
  }
}
