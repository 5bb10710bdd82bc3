use byteorder::{LittleEndian, ReadBytesExt};
use ctor::ctor;
use libsodium_sys;

pub const PUBLIC_KEY_SIZE: usize = libsodium_sys::crypto_kx_PUBLICKEYBYTES as usize;
pub const SECRET_KEY_SIZE: usize = libsodium_sys::crypto_kx_SECRETKEYBYTES as usize;
pub const SESSION_KEY_SIZE: usize = libsodium_sys::crypto_kx_SESSIONKEYBYTES as usize;
pub const MAC_SIZE: usize = libsodium_sys::crypto_aead_chacha20poly1305_IETF_ABYTES as usize;
pub const NONCE_SIZE: usize = libsodium_sys::crypto_aead_chacha20poly1305_IETF_NPUBBYTES as usize;

pub type PublicKey = [u8; PUBLIC_KEY_SIZE];
pub type SessionKey = [u8; SESSION_KEY_SIZE];
pub type Nonce = [u8; NONCE_SIZE];

/// Initialize the sodium infrastructure
#[ctor]
fn INIT_SODIUM() {
    unsafe {
        if libsodium_sys::sodium_init() < 0 {
            panic!("Cryptography initialization failed")
        }
    }
}

/// Long lived public/secret key pair owned by one endpoint. The secret part never
/// leaves this structure and is only consumed by the session key derivation.
pub struct KeyPair {
    pub public_key: PublicKey,
    secret_key: [u8; SECRET_KEY_SIZE],
}

/// Receive/transmit key pair derived for a single logical connection. Both keys are
/// discarded together with the connection.
#[derive(Clone)]
pub struct SessionKeys {
    pub receive_key: SessionKey,
    pub transmit_key: SessionKey,
}

/// Generates a fresh key pair. Every call produces an independent pair, so a failed
/// connection attempt never reuses key material.
#[inline]
pub fn generate_key_pair() -> Option<KeyPair> {
    let mut public_key = [0u8; PUBLIC_KEY_SIZE];
    let mut secret_key = [0u8; SECRET_KEY_SIZE];

    let result = unsafe { libsodium_sys::crypto_kx_keypair(public_key.as_mut_ptr(), secret_key.as_mut_ptr()) };

    if result != 0 {
        return None;
    }

    Some(KeyPair {
        public_key,
        secret_key,
    })
}

/// Derives the client side receive/transmit keys from the client pair and the server
/// public key. Returns `None` when the peer key is rejected, in which case the
/// handshake must be aborted.
#[inline]
pub fn client_session_keys(own: &KeyPair, server_key: &PublicKey) -> Option<SessionKeys> {
    let mut receive_key = [0u8; SESSION_KEY_SIZE];
    let mut transmit_key = [0u8; SESSION_KEY_SIZE];

    let result = unsafe {
        libsodium_sys::crypto_kx_client_session_keys(
            receive_key.as_mut_ptr(),
            transmit_key.as_mut_ptr(),
            own.public_key.as_ptr(),
            own.secret_key.as_ptr(),
            server_key.as_ptr(),
        )
    };

    if result != 0 {
        return None;
    }

    Some(SessionKeys {
        receive_key,
        transmit_key,
    })
}

/// Derives the server side receive/transmit keys from the server pair and the client
/// public key. The roles are asymmetric: the server transmit key is the client
/// receive key and vice versa.
#[inline]
pub fn server_session_keys(own: &KeyPair, client_key: &PublicKey) -> Option<SessionKeys> {
    let mut receive_key = [0u8; SESSION_KEY_SIZE];
    let mut transmit_key = [0u8; SESSION_KEY_SIZE];

    let result = unsafe {
        libsodium_sys::crypto_kx_server_session_keys(
            receive_key.as_mut_ptr(),
            transmit_key.as_mut_ptr(),
            own.public_key.as_ptr(),
            own.secret_key.as_ptr(),
            client_key.as_ptr(),
        )
    };

    if result != 0 {
        return None;
    }

    Some(SessionKeys {
        receive_key,
        transmit_key,
    })
}

/// Encrypts the provided plain text into the cipher buffer. The encrypted message size
/// will be the plain text size plus the MAC size. The function will fail if the cipher
/// slice is not sized exactly.
///
/// The additional data, nonce and key must match those used during encryption, the
/// decryption will fail otherwise.
#[inline]
pub fn encrypt(cipher: &mut [u8], plain: &[u8], additional_data: &[u8], nonce: &Nonce, key: &SessionKey) -> bool {
    if cipher.len() != plain.len() + MAC_SIZE {
        panic!(
            "Encryption: cipher data length ({}) must be plain data length ({}) + MAC size ({})",
            cipher.len(),
            plain.len(),
            MAC_SIZE
        )
    }

    unsafe {
        let result = libsodium_sys::crypto_aead_chacha20poly1305_ietf_encrypt(
            cipher.as_mut_ptr(),
            ::std::ptr::null_mut(),
            plain.as_ptr(),
            plain.len() as u64,
            additional_data.as_ptr(),
            additional_data.len() as u64,
            ::std::ptr::null(),
            nonce.as_ptr(),
            key.as_ptr(),
        );

        result >= 0
    }
}

/// Decrypts the provided ciphertext into the plain buffer. The decoded message size is
/// equal to the cipher text length minus the MAC. Tampering with the ciphertext, the
/// nonce, the additional data or the key makes this fail instead of producing garbage.
#[inline]
pub fn decrypt(plain: &mut [u8], cipher: &[u8], additional_data: &[u8], nonce: &Nonce, key: &SessionKey) -> bool {
    if cipher.len() != plain.len() + MAC_SIZE {
        panic!(
            "Decryption: cipher data length ({}) must be plain data length ({}) + MAC size ({})",
            cipher.len(),
            plain.len(),
            MAC_SIZE
        )
    }

    unsafe {
        let result = libsodium_sys::crypto_aead_chacha20poly1305_ietf_decrypt(
            plain.as_mut_ptr(),
            ::std::ptr::null_mut(),
            ::std::ptr::null_mut(),
            cipher.as_ptr(),
            cipher.len() as u64,
            additional_data.as_ptr(),
            additional_data.len() as u64,
            nonce.as_ptr(),
            key.as_ptr(),
        );

        result >= 0
    }
}

/// Fills the provided buffer with cryptographically secure random bytes
#[inline]
pub fn random_bytes(out: &mut [u8]) {
    unsafe {
        libsodium_sys::randombytes_buf(out.as_mut_ptr() as *mut ::std::ffi::c_void, out.len());
    }
}

/// Mints a fresh random nonce. One nonce per encryption call, always random, never
/// cached or derived from a counter.
#[inline]
pub fn random_nonce() -> Nonce {
    let mut nonce = [0u8; NONCE_SIZE];
    random_bytes(&mut nonce);
    nonce
}

/// Random u64, used for login tokens.
#[inline]
pub fn random_u64() -> u64 {
    let mut raw = [0u8; 8];
    random_bytes(&mut raw);
    (&raw[..]).read_u64::<LittleEndian>().expect("Error reading random data")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn handshake() -> (SessionKeys, SessionKeys) {
        let client = generate_key_pair().unwrap();
        let server = generate_key_pair().unwrap();

        let client_session = client_session_keys(&client, &server.public_key).unwrap();
        let server_session = server_session_keys(&server, &client.public_key).unwrap();

        (client_session, server_session)
    }

    #[test]
    fn test_key_pairs_unique() {
        let first = generate_key_pair().unwrap();
        let second = generate_key_pair().unwrap();

        assert_ne!(first.public_key, second.public_key);
        assert_ne!(first.secret_key, second.secret_key);
    }

    #[test]
    fn test_session_keys_complementary() {
        let (client_session, server_session) = handshake();

        assert_eq!(client_session.transmit_key, server_session.receive_key);
        assert_eq!(client_session.receive_key, server_session.transmit_key);
        assert_ne!(client_session.receive_key, client_session.transmit_key);
    }

    #[test]
    fn test_session_keys_uncorrelated_across_handshakes() {
        let (first, _) = handshake();
        let (second, _) = handshake();

        assert_ne!(first.receive_key, second.receive_key);
        assert_ne!(first.transmit_key, second.transmit_key);
    }

    #[test]
    fn test_encrypt_decrypt_roundtrip() {
        let (client_session, server_session) = handshake();

        let plain = b"the quick brown fox";
        let nonce = random_nonce();
        let mut cipher = vec![0u8; plain.len() + MAC_SIZE];

        assert!(encrypt(&mut cipher, &plain[..], &[], &nonce, &client_session.transmit_key));

        let mut decoded = vec![0u8; plain.len()];

        assert!(decrypt(&mut decoded, &cipher, &[], &nonce, &server_session.receive_key));
        assert_eq!(&decoded[..], &plain[..]);
    }

    #[test]
    fn test_decrypt_fails_on_wrong_key() {
        let (client_session, server_session) = handshake();

        let plain = b"payload";
        let nonce = random_nonce();
        let mut cipher = vec![0u8; plain.len() + MAC_SIZE];

        encrypt(&mut cipher, &plain[..], &[], &nonce, &client_session.transmit_key);

        let mut decoded = vec![0u8; plain.len()];

        // Transmit key of the same role is the wrong key
        assert!(!decrypt(&mut decoded, &cipher, &[], &nonce, &server_session.transmit_key));
    }

    #[test]
    fn test_decrypt_fails_on_bit_flip() {
        let (client_session, server_session) = handshake();

        let plain = b"payload";
        let nonce = random_nonce();
        let mut cipher = vec![0u8; plain.len() + MAC_SIZE];

        encrypt(&mut cipher, &plain[..], &[], &nonce, &client_session.transmit_key);

        for bit in 0..cipher.len() * 8 {
            let mut tampered = cipher.clone();
            tampered[bit / 8] ^= 1 << (bit % 8);

            let mut decoded = vec![0u8; plain.len()];
            assert!(!decrypt(&mut decoded, &tampered, &[], &nonce, &server_session.receive_key));
        }
    }

    #[test]
    fn test_decrypt_fails_on_nonce_mismatch() {
        let (client_session, server_session) = handshake();

        let plain = b"payload";
        let nonce = random_nonce();
        let mut cipher = vec![0u8; plain.len() + MAC_SIZE];

        encrypt(&mut cipher, &plain[..], &[], &nonce, &client_session.transmit_key);

        let other_nonce = random_nonce();
        let mut decoded = vec![0u8; plain.len()];

        assert!(!decrypt(&mut decoded, &cipher, &[], &other_nonce, &server_session.receive_key));
    }

    #[test]
    fn test_nonces_unique() {
        assert_ne!(random_nonce(), random_nonce());
    }
}
