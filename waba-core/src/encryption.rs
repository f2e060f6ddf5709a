use aes_gcm::{
    aead::{Aead, AeadCore, KeyInit, OsRng},
    Aes256Gcm, Key, Nonce,
};
use anyhow::{anyhow, Result};
use base64::{engine::general_purpose::STANDARD, Engine};
use hex;
use hkdf::Hkdf;
use sha2::Sha256;

/// Encrypt a tenant's Graph API access token using AES-256-GCM.
/// Derives a tenant-specific key from the master encryption key so a leaked
/// ciphertext from one tenant cannot be decrypted with another's context.
pub fn encrypt_token(token: &str, tenant_id: &str, master_key: &str) -> Result<String> {
    let key = derive_tenant_key(master_key, tenant_id)?;
    let cipher = Aes256Gcm::new(&key);
    let nonce = Aes256Gcm::generate_nonce(&mut OsRng);

    let ciphertext = cipher
        .encrypt(&nonce, token.as_bytes())
        .map_err(|e| anyhow!("Encryption failed: {}", e))?;

    // Nonce prepended to ciphertext, then base64
    let mut encrypted_data = nonce.to_vec();
    encrypted_data.extend_from_slice(&ciphertext);

    Ok(STANDARD.encode(&encrypted_data))
}

/// Decrypt a stored access token.
pub fn decrypt_token(encrypted: &str, tenant_id: &str, master_key: &str) -> Result<String> {
    let encrypted_data = STANDARD
        .decode(encrypted)
        .map_err(|e| anyhow!("Base64 decode failed: {}", e))?;

    if encrypted_data.len() < 12 {
        return Err(anyhow!("Invalid encrypted data: too short"));
    }

    let nonce = Nonce::from_slice(&encrypted_data[..12]);
    let ciphertext = &encrypted_data[12..];

    let key = derive_tenant_key(master_key, tenant_id)?;
    let cipher = Aes256Gcm::new(&key);

    let plaintext = cipher
        .decrypt(nonce, ciphertext)
        .map_err(|e| anyhow!("Decryption failed: {}", e))?;

    String::from_utf8(plaintext).map_err(|e| anyhow!("Invalid UTF-8 after decryption: {}", e))
}

fn derive_tenant_key(master_key: &str, tenant_id: &str) -> Result<Key<Aes256Gcm>> {
    let master_key_bytes = if master_key.len() == 64 {
        // 32 bytes hex encoded
        hex::decode(master_key).map_err(|e| anyhow!("Invalid hex master key: {}", e))?
    } else {
        let mut key_bytes = master_key.as_bytes().to_vec();
        key_bytes.resize(32, 0);
        key_bytes
    };

    let hk = Hkdf::<Sha256>::new(None, &master_key_bytes);
    let mut okm = [0u8; 32];
    hk.expand(tenant_id.as_bytes(), &mut okm)
        .map_err(|e| anyhow!("HKDF expansion failed: {}", e))?;

    Ok(*Key::<Aes256Gcm>::from_slice(&okm))
}

#[cfg(test)]
mod tests {
    use super::*;

    const MASTER_KEY: &str = "0123456789abcdef0123456789abcdef0123456789abcdef0123456789abcdef";

    #[test]
    fn test_encrypt_decrypt() {
        let original = "EAABsbCS1234456";

        let encrypted = encrypt_token(original, "tenant-1", MASTER_KEY).unwrap();
        assert_ne!(encrypted, original);

        let decrypted = decrypt_token(&encrypted, "tenant-1", MASTER_KEY).unwrap();
        assert_eq!(decrypted, original);
    }

    #[test]
    fn tenant_context_is_part_of_the_key() {
        let encrypted = encrypt_token("secret-token", "tenant-1", MASTER_KEY).unwrap();
        assert!(decrypt_token(&encrypted, "tenant-2", MASTER_KEY).is_err());
    }
}
