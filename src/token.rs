use aes::cipher::{AsyncStreamCipher, KeyIvInit};
use base64::Engine;
use base64::alphabet;
use base64::engine::general_purpose::{GeneralPurpose, GeneralPurposeConfig, STANDARD};
use base64::engine::DecodePaddingMode;
use rand::RngCore;
use rand::rngs::OsRng;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// URL-safe alphabet, no padding on encode, padding optional on decode.
const TOKEN_ENGINE: GeneralPurpose = GeneralPurpose::new(
    &alphabet::URL_SAFE,
    GeneralPurposeConfig::new()
        .with_encode_padding(false)
        .with_decode_padding_mode(DecodePaddingMode::Indifferent),
);

type Aes128CfbEnc = cfb_mode::Encryptor<aes::Aes128>;
type Aes128CfbDec = cfb_mode::Decryptor<aes::Aes128>;
type Aes192CfbEnc = cfb_mode::Encryptor<aes::Aes192>;
type Aes192CfbDec = cfb_mode::Decryptor<aes::Aes192>;
type Aes256CfbEnc = cfb_mode::Encryptor<aes::Aes256>;
type Aes256CfbDec = cfb_mode::Decryptor<aes::Aes256>;

#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("unsupported cipher {0}")]
    UnsupportedCipher(String),
    #[error("invalid key length for {cipher}: expected {expected} bytes, got {actual}")]
    InvalidKeyLength {
        cipher: Cipher,
        expected: usize,
        actual: usize,
    },
    #[error("invalid iv length for {cipher}: expected {expected} bytes, got {actual}")]
    InvalidIvLength {
        cipher: Cipher,
        expected: usize,
        actual: usize,
    },
    #[error("iv is not valid base64")]
    InvalidIvEncoding,
    #[error("cipher initialisation failed")]
    CipherInit,
    #[error("identifier is not valid base64")]
    InvalidEncoding,
    #[error("decrypted identifier is not valid utf-8")]
    InvalidPlaintext,
    #[error("random iv generation failed")]
    Random,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Cipher {
    Aes128Cfb,
    Aes192Cfb,
    #[default]
    Aes256Cfb,
}

impl Cipher {
    pub fn name(self) -> &'static str {
        match self {
            Cipher::Aes128Cfb => "aes-128-cfb",
            Cipher::Aes192Cfb => "aes-192-cfb",
            Cipher::Aes256Cfb => "aes-256-cfb",
        }
    }

    pub fn key_len(self) -> usize {
        match self {
            Cipher::Aes128Cfb => 16,
            Cipher::Aes192Cfb => 24,
            Cipher::Aes256Cfb => 32,
        }
    }

    pub fn iv_len(self) -> usize {
        16
    }

    /// Fresh random IV for key rotation, base64 encoded with the standard
    /// alphabet so it can be pasted straight into `CIPHER_IV`.
    pub fn generate_iv(self) -> Result<String, CryptoError> {
        let mut iv = vec![0u8; self.iv_len()];
        OsRng
            .try_fill_bytes(&mut iv)
            .map_err(|_| CryptoError::Random)?;
        Ok(STANDARD.encode(iv))
    }
}

impl fmt::Display for Cipher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Cipher {
    type Err = CryptoError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "aes-128-cfb" | "aes-128-cfb128" => Ok(Cipher::Aes128Cfb),
            "aes-192-cfb" | "aes-192-cfb128" => Ok(Cipher::Aes192Cfb),
            "aes-256-cfb" | "aes-256-cfb128" => Ok(Cipher::Aes256Cfb),
            other => Err(CryptoError::UnsupportedCipher(other.to_string())),
        }
    }
}

/// Reversible, deterministic obfuscation of source URLs. The same URL always
/// yields the same identifier for a given key and IV, which is what makes
/// the identifier usable as a cache key.
#[derive(Clone)]
pub struct TokenCodec {
    cipher: Cipher,
    key: Vec<u8>,
    iv: Vec<u8>,
}

impl fmt::Debug for TokenCodec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenCodec")
            .field("cipher", &self.cipher)
            .finish_non_exhaustive()
    }
}

impl TokenCodec {
    pub fn new(cipher: Cipher, iv_base64: &str, key: &[u8]) -> Result<Self, CryptoError> {
        let iv = STANDARD
            .decode(iv_base64.trim())
            .map_err(|_| CryptoError::InvalidIvEncoding)?;
        Self::from_raw(cipher, iv, key.to_vec())
    }

    pub fn from_raw(cipher: Cipher, iv: Vec<u8>, key: Vec<u8>) -> Result<Self, CryptoError> {
        if key.len() != cipher.key_len() {
            return Err(CryptoError::InvalidKeyLength {
                cipher,
                expected: cipher.key_len(),
                actual: key.len(),
            });
        }
        if iv.len() != cipher.iv_len() {
            return Err(CryptoError::InvalidIvLength {
                cipher,
                expected: cipher.iv_len(),
                actual: iv.len(),
            });
        }
        Ok(Self { cipher, key, iv })
    }

    pub fn cipher(&self) -> Cipher {
        self.cipher
    }

    pub fn encode(&self, source_url: &str) -> Result<String, CryptoError> {
        let mut buffer = source_url.as_bytes().to_vec();
        self.encrypt_in_place(&mut buffer)?;
        Ok(TOKEN_ENGINE.encode(buffer))
    }

    pub fn decode(&self, identifier: &str) -> Result<String, CryptoError> {
        let mut buffer = TOKEN_ENGINE
            .decode(identifier)
            .map_err(|_| CryptoError::InvalidEncoding)?;
        self.decrypt_in_place(&mut buffer)?;
        String::from_utf8(buffer).map_err(|_| CryptoError::InvalidPlaintext)
    }

    fn encrypt_in_place(&self, buffer: &mut [u8]) -> Result<(), CryptoError> {
        let (key, iv) = (self.key.as_slice(), self.iv.as_slice());
        match self.cipher {
            Cipher::Aes128Cfb => Aes128CfbEnc::new_from_slices(key, iv)
                .map_err(|_| CryptoError::CipherInit)?
                .encrypt(buffer),
            Cipher::Aes192Cfb => Aes192CfbEnc::new_from_slices(key, iv)
                .map_err(|_| CryptoError::CipherInit)?
                .encrypt(buffer),
            Cipher::Aes256Cfb => Aes256CfbEnc::new_from_slices(key, iv)
                .map_err(|_| CryptoError::CipherInit)?
                .encrypt(buffer),
        }
        Ok(())
    }

    fn decrypt_in_place(&self, buffer: &mut [u8]) -> Result<(), CryptoError> {
        let (key, iv) = (self.key.as_slice(), self.iv.as_slice());
        match self.cipher {
            Cipher::Aes128Cfb => Aes128CfbDec::new_from_slices(key, iv)
                .map_err(|_| CryptoError::CipherInit)?
                .decrypt(buffer),
            Cipher::Aes192Cfb => Aes192CfbDec::new_from_slices(key, iv)
                .map_err(|_| CryptoError::CipherInit)?
                .decrypt(buffer),
            Cipher::Aes256Cfb => Aes256CfbDec::new_from_slices(key, iv)
                .map_err(|_| CryptoError::CipherInit)?
                .decrypt(buffer),
        }
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) const TEST_KEY: &[u8] = b"0123456789abcdef0123456789abcdef";
    pub(crate) const TEST_IV: &str = "ZmVkY2JhOTg3NjU0MzIxMA==";

    pub(crate) fn test_codec() -> TokenCodec {
        TokenCodec::new(Cipher::Aes256Cfb, TEST_IV, TEST_KEY).unwrap()
    }

    #[test]
    fn encode_matches_openssl_aes_256_cfb() {
        let codec = test_codec();
        let encoded = codec
            .encode("https://cdn.example.com/images/cat.jpg")
            .unwrap();
        assert_eq!(encoded, "tiwPL7_KYZsRQIi0X_jWcaWuljSDSrbJXu-xbyG3yuinYuSlwUk");
    }

    #[test]
    fn encode_matches_openssl_aes_128_cfb() {
        let codec = TokenCodec::new(Cipher::Aes128Cfb, TEST_IV, b"0123456789abcdef").unwrap();
        let encoded = codec
            .encode("https://cdn.example.com/images/cat.jpg")
            .unwrap();
        assert_eq!(encoded, "Yz-iAYVKUCbbXK34r2QLUHYcbOKVKD8KTvPOoDFYyZPd0xLHOMc");
    }

    #[test]
    fn round_trip_preserves_urls() {
        let codec = test_codec();
        for url in [
            "https://cdn.example.com/images/cat.jpg",
            "http://example.org/a/b/c.png?size=large&v=2",
            "file:///var/lib/images/üñí©ødé.jpeg",
            "/srv/images/local.gif",
            "x",
        ] {
            let encoded = codec.encode(url).unwrap();
            assert_eq!(codec.decode(&encoded).unwrap(), url);
        }
    }

    #[test]
    fn encoding_is_deterministic_and_url_safe() {
        let codec = test_codec();
        let url = "https://cdn.example.com/some/long/path/with/many/segments/picture.webp";
        let first = codec.encode(url).unwrap();
        let second = codec.encode(url).unwrap();
        assert_eq!(first, second);
        assert!(
            first
                .chars()
                .all(|ch| ch.is_ascii_alphanumeric() || ch == '-' || ch == '_')
        );
    }

    #[test]
    fn decode_accepts_restored_padding() {
        let codec = test_codec();
        let encoded = codec.encode("https://example.com/ab.jpg").unwrap();
        let padding = "===".get((encoded.len() + 3) % 4..).unwrap_or("");
        let padded = format!("{encoded}{padding}");
        assert_eq!(codec.decode(&padded).unwrap(), "https://example.com/ab.jpg");
    }

    #[test]
    fn decode_rejects_non_base64() {
        let codec = test_codec();
        assert!(matches!(
            codec.decode("not*base64!"),
            Err(CryptoError::InvalidEncoding)
        ));
    }

    #[test]
    fn decode_rejects_non_utf8_plaintext() {
        let codec = test_codec();
        let mut raw = vec![0xff, 0xfe, 0xfd];
        codec.encrypt_in_place(&mut raw).unwrap();
        let identifier = TOKEN_ENGINE.encode(raw);
        assert!(matches!(
            codec.decode(&identifier),
            Err(CryptoError::InvalidPlaintext)
        ));
    }

    #[test]
    fn wrong_key_does_not_recover_url() {
        let codec = test_codec();
        let other = TokenCodec::new(Cipher::Aes256Cfb, TEST_IV, b"abcdef0123456789abcdef0123456789")
            .unwrap();
        let encoded = codec.encode("https://example.com/secret.jpg").unwrap();
        match other.decode(&encoded) {
            Ok(value) => assert_ne!(value, "https://example.com/secret.jpg"),
            Err(err) => assert!(matches!(err, CryptoError::InvalidPlaintext)),
        }
    }

    #[test]
    fn new_rejects_bad_key_and_iv() {
        assert!(matches!(
            TokenCodec::new(Cipher::Aes256Cfb, TEST_IV, b"short"),
            Err(CryptoError::InvalidKeyLength { expected: 32, actual: 5, .. })
        ));
        assert!(matches!(
            TokenCodec::new(Cipher::Aes256Cfb, "AAAA", TEST_KEY),
            Err(CryptoError::InvalidIvLength { expected: 16, actual: 3, .. })
        ));
        assert!(matches!(
            TokenCodec::new(Cipher::Aes256Cfb, "%%%", TEST_KEY),
            Err(CryptoError::InvalidIvEncoding)
        ));
    }

    #[test]
    fn cipher_parses_names() {
        assert_eq!("AES-256-CFB".parse::<Cipher>().unwrap(), Cipher::Aes256Cfb);
        assert_eq!("aes-128-cfb".parse::<Cipher>().unwrap(), Cipher::Aes128Cfb);
        assert!("aes-256-gcm".parse::<Cipher>().is_err());
        assert_eq!(Cipher::default().name(), "aes-256-cfb");
    }

    #[test]
    fn generated_iv_has_cipher_length() {
        let iv = Cipher::Aes256Cfb.generate_iv().unwrap();
        let raw = STANDARD.decode(&iv).unwrap();
        assert_eq!(raw.len(), 16);
        assert_ne!(iv, Cipher::Aes256Cfb.generate_iv().unwrap());
        assert!(TokenCodec::new(Cipher::Aes256Cfb, &iv, TEST_KEY).is_ok());
    }
}
