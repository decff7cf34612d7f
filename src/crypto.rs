//! 암호화 모듈 - 세그먼트 단위 암호화 전략
//!
//! 전략은 송신측이 고르고 수신측은 대역 외로 알고 있어야 한다 (와이어에 전략 식별자 없음).
//! - 대칭: 운영자 비밀값을 32바이트로 자르거나 0으로 채운 키 + ChaCha20-Poly1305
//! - 비대칭: 임시 X25519 키쌍 → 수신자 공개키와 공유 비밀 → ChaCha20-Poly1305
//!
//! 암호문 형식
//! - 대칭: nonce(12) + ciphertext(원본 + 16바이트 태그)
//! - 비대칭: 임시 공개키(32) + nonce(12) + ciphertext

use std::fmt;

use base64::{engine::general_purpose::STANDARD, Engine};
use chacha20poly1305::{
    aead::{Aead, KeyInit},
    ChaCha20Poly1305, Key, Nonce,
};
use rand_core::{OsRng, RngCore};
use x25519_dalek::{EphemeralSecret, PublicKey, StaticSecret};

/// 대칭키 크기 (32 bytes)
pub const KEY_SIZE: usize = 32;

/// X25519 공개키 (32 bytes)
pub const PUBLIC_KEY_SIZE: usize = 32;

/// ChaCha20-Poly1305 nonce 크기 (12 bytes)
pub const NONCE_SIZE: usize = 12;

/// ChaCha20-Poly1305 태그 크기 (16 bytes)
pub const TAG_SIZE: usize = 16;

/// 암호화 오류
#[derive(Debug, thiserror::Error)]
pub enum CryptoError {
    #[error("암호화 실패: {0}")]
    EncryptionFailed(String),
    #[error("복호화 실패: {0}")]
    DecryptionFailed(String),
    #[error("잘못된 키 크기: {0} bytes")]
    InvalidKeySize(usize),
    #[error("잘못된 키 인코딩: {0}")]
    InvalidKeyEncoding(String),
    #[error("개인키 없음: 공개키만으로는 복호화할 수 없음")]
    MissingPrivateKey,
}

/// 대칭키
#[derive(Clone)]
pub struct SymmetricKey([u8; KEY_SIZE]);

impl SymmetricKey {
    /// 운영자 비밀값에서 키 유도
    ///
    /// 32바이트보다 길면 자르고 짧으면 0으로 채운다. KDF가 아니다.
    /// 기존 송수신측과의 호환을 위해 바이트 단위 절단을 그대로 유지한다
    /// (멀티바이트 문자가 경계에 걸려도 바이트 기준으로 자름).
    pub fn from_secret(secret: &[u8]) -> Self {
        let mut key = [0u8; KEY_SIZE];
        let len = secret.len().min(KEY_SIZE);
        key[..len].copy_from_slice(&secret[..len]);
        Self(key)
    }

    pub fn from_bytes(bytes: [u8; KEY_SIZE]) -> Self {
        Self(bytes)
    }

    fn cipher(&self) -> ChaCha20Poly1305 {
        ChaCha20Poly1305::new(Key::from_slice(&self.0))
    }

    /// 암호화
    /// 반환: nonce(12) + ciphertext
    pub fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let mut nonce_bytes = [0u8; NONCE_SIZE];
        OsRng.fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);

        let ciphertext = self
            .cipher()
            .encrypt(nonce, plaintext)
            .map_err(|e| CryptoError::EncryptionFailed(e.to_string()))?;

        let mut result = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
        result.extend_from_slice(&nonce_bytes);
        result.extend_from_slice(&ciphertext);
        Ok(result)
    }

    /// 복호화
    /// 입력: nonce(12) + ciphertext
    pub fn decrypt(&self, encrypted: &[u8]) -> Result<Vec<u8>, CryptoError> {
        if encrypted.len() < NONCE_SIZE + TAG_SIZE {
            return Err(CryptoError::DecryptionFailed("데이터가 너무 짧음".into()));
        }

        let nonce = Nonce::from_slice(&encrypted[..NONCE_SIZE]);
        self.cipher()
            .decrypt(nonce, &encrypted[NONCE_SIZE..])
            .map_err(|e| CryptoError::DecryptionFailed(e.to_string()))
    }
}

impl fmt::Debug for SymmetricKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SymmetricKey(..)")
    }
}

/// 비대칭 봉투 키
///
/// 송신측은 수신자 공개키만, 수신측은 개인키를 가진다.
#[derive(Clone)]
pub enum AsymmetricKey {
    Public(PublicKey),
    Private(StaticSecret),
}

impl AsymmetricKey {
    /// 공개키 반환 (개인키면 유도)
    pub fn public_key(&self) -> PublicKey {
        match self {
            AsymmetricKey::Public(public) => *public,
            AsymmetricKey::Private(secret) => PublicKey::from(secret),
        }
    }

    /// 봉투 암호화
    /// 반환: 임시 공개키(32) + nonce(12) + ciphertext
    pub fn seal(&self, plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let ephemeral = EphemeralSecret::random_from_rng(OsRng);
        let ephemeral_public = PublicKey::from(&ephemeral);
        let shared = ephemeral.diffie_hellman(&self.public_key());

        let sealed = SymmetricKey::from_bytes(*shared.as_bytes()).encrypt(plaintext)?;

        let mut result = Vec::with_capacity(PUBLIC_KEY_SIZE + sealed.len());
        result.extend_from_slice(ephemeral_public.as_bytes());
        result.extend_from_slice(&sealed);
        Ok(result)
    }

    /// 봉투 복호화 (개인키 필요)
    pub fn open(&self, sealed: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let secret = match self {
            AsymmetricKey::Private(secret) => secret,
            AsymmetricKey::Public(_) => return Err(CryptoError::MissingPrivateKey),
        };

        if sealed.len() < PUBLIC_KEY_SIZE + NONCE_SIZE + TAG_SIZE {
            return Err(CryptoError::DecryptionFailed("데이터가 너무 짧음".into()));
        }

        let mut peer = [0u8; PUBLIC_KEY_SIZE];
        peer.copy_from_slice(&sealed[..PUBLIC_KEY_SIZE]);
        let shared = secret.diffie_hellman(&PublicKey::from(peer));

        SymmetricKey::from_bytes(*shared.as_bytes()).decrypt(&sealed[PUBLIC_KEY_SIZE..])
    }

    /// base64 공개키 파싱
    pub fn public_from_base64(encoded: &str) -> Result<Self, CryptoError> {
        let bytes = decode_key(encoded)?;
        let raw: [u8; PUBLIC_KEY_SIZE] = bytes
            .as_slice()
            .try_into()
            .map_err(|_| CryptoError::InvalidKeySize(bytes.len()))?;
        Ok(AsymmetricKey::Public(PublicKey::from(raw)))
    }

    /// base64 개인키 파싱
    ///
    /// 패스프레이즈가 주어지면 봉인된 개인키로 보고 대칭키로 먼저 푼다.
    pub fn private_from_base64(
        encoded: &str,
        passphrase: Option<&[u8]>,
    ) -> Result<Self, CryptoError> {
        let mut bytes = decode_key(encoded)?;
        if let Some(passphrase) = passphrase {
            bytes = SymmetricKey::from_secret(passphrase)
                .decrypt(&bytes)
                .map_err(|_| {
                    CryptoError::DecryptionFailed("개인키 봉인 해제 실패 (패스프레이즈 확인)".into())
                })?;
        }

        let raw: [u8; KEY_SIZE] = bytes
            .as_slice()
            .try_into()
            .map_err(|_| CryptoError::InvalidKeySize(bytes.len()))?;
        Ok(AsymmetricKey::Private(StaticSecret::from(raw)))
    }
}

impl fmt::Debug for AsymmetricKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AsymmetricKey::Public(public) => {
                write!(f, "AsymmetricKey::Public({})", STANDARD.encode(public.as_bytes()))
            }
            AsymmetricKey::Private(_) => f.write_str("AsymmetricKey::Private(..)"),
        }
    }
}

fn decode_key(encoded: &str) -> Result<Vec<u8>, CryptoError> {
    STANDARD
        .decode(encoded.trim())
        .map_err(|e| CryptoError::InvalidKeyEncoding(e.to_string()))
}

/// 세그먼트 암호화 전략
///
/// 전송 하나에 정확히 하나의 전략만 사용한다.
#[derive(Debug, Clone)]
pub enum CipherStrategy {
    Symmetric(SymmetricKey),
    Asymmetric(AsymmetricKey),
}

impl CipherStrategy {
    /// 송신측 전략 선택
    ///
    /// 공개키가 있으면 비대칭, 없으면 비밀값 기반 대칭.
    pub fn select(public_key: Option<AsymmetricKey>, secret: &[u8]) -> Self {
        match public_key {
            Some(key) => CipherStrategy::Asymmetric(key),
            None => CipherStrategy::Symmetric(SymmetricKey::from_secret(secret)),
        }
    }

    pub fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        match self {
            CipherStrategy::Symmetric(key) => key.encrypt(plaintext),
            CipherStrategy::Asymmetric(key) => key.seal(plaintext),
        }
    }

    pub fn decrypt(&self, encrypted: &[u8]) -> Result<Vec<u8>, CryptoError> {
        match self {
            CipherStrategy::Symmetric(key) => key.decrypt(encrypted),
            CipherStrategy::Asymmetric(key) => key.open(encrypted),
        }
    }

    /// 로그용 이름
    pub fn name(&self) -> &'static str {
        match self {
            CipherStrategy::Symmetric(_) => "symmetric",
            CipherStrategy::Asymmetric(_) => "asymmetric",
        }
    }
}

/// base64로 인코딩된 키쌍
pub struct KeyPair {
    pub public: String,
    /// 패스프레이즈가 있으면 봉인된 개인키
    pub private: String,
}

/// 새 X25519 키쌍 생성
pub fn generate_keypair(passphrase: Option<&[u8]>) -> Result<KeyPair, CryptoError> {
    let secret = StaticSecret::random_from_rng(OsRng);
    let public = PublicKey::from(&secret);

    let private = match passphrase {
        Some(passphrase) => SymmetricKey::from_secret(passphrase).encrypt(&secret.to_bytes())?,
        None => secret.to_bytes().to_vec(),
    };

    Ok(KeyPair {
        public: STANDARD.encode(public.as_bytes()),
        private: STANDARD.encode(private),
    })
}
