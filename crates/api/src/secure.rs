//! 请求安全头 `X-OCS-Header`
//!
//! ```text
//! X-OCS-Header = base64(RSA-PKCS1v15(aes_key ‖ nonce)) "." base64(AES-256-GCM(json))
//! ```
//!
//! 头部以接收方公钥封装, 只有接收方能打开。`auth` 是以代理密码为密钥对
//! `ts "\n" uri` 计算的 HMAC-SHA256; `keys` 存在时请求体同样经过 AES 加密。

use std::sync::atomic::{AtomicI64, Ordering};

use aes_gcm::aead::{Aead, AeadCore, KeyInit, OsRng};
use aes_gcm::{Aes256Gcm, Nonce};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use chrono::Utc;
use hmac::{Hmac, Mac};
use obshell_domain::entities::AgentInfo;
use obshell_errors::{ObshellError, ObshellResult};
use rsa::pkcs8::{DecodePrivateKey, DecodePublicKey, EncodePrivateKey, EncodePublicKey, LineEnding};
use rsa::{Pkcs1v15Encrypt, RsaPrivateKey, RsaPublicKey};
use serde::{Deserialize, Serialize};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

const AES_KEY_LEN: usize = 32;
const NONCE_LEN: usize = 12;

static LAST_TS: AtomicI64 = AtomicI64::new(0);

/// 单调递增的毫秒时间戳, 同一毫秒内的多次调用依次加一
pub fn next_ts() -> i64 {
    let now = Utc::now().timestamp_millis();
    let mut last = LAST_TS.load(Ordering::SeqCst);
    loop {
        let next = now.max(last + 1);
        match LAST_TS.compare_exchange(last, next, Ordering::SeqCst, Ordering::SeqCst) {
            Ok(_) => return next,
            Err(actual) => last = actual,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ForwardType {
    #[default]
    None,
    /// 跟随者把 API 请求转发给主节点
    AutoForward,
    /// 代理代替调用方把请求转发给另一个代理
    ManualForward,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecureHeader {
    pub ts: i64,
    pub uri: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub keys: Option<String>,
    pub auth: String,
    #[serde(default)]
    pub token: String,
    #[serde(default)]
    pub forward_type: ForwardType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub forward_agent: Option<AgentInfo>,
}

impl SecureHeader {
    /// 以当前时间签名 `uri`
    pub fn new(uri: &str, password: &str) -> ObshellResult<Self> {
        let ts = next_ts();
        Ok(Self {
            ts,
            uri: uri.to_string(),
            keys: None,
            auth: sign(password, ts, uri)?,
            token: String::new(),
            forward_type: ForwardType::None,
            forward_agent: None,
        })
    }

    pub fn with_token<S: Into<String>>(mut self, token: S) -> Self {
        self.token = token.into();
        self
    }

    pub fn with_body_key(mut self, key: String) -> Self {
        self.keys = Some(key);
        self
    }

    pub fn forwarded(mut self, forward_type: ForwardType, forwarder: AgentInfo) -> Self {
        self.forward_type = forward_type;
        self.forward_agent = Some(forwarder);
        self
    }

    pub fn verify_auth(&self, password: &str) -> bool {
        let Ok(expected) = hex::decode(&self.auth) else {
            return false;
        };
        let Ok(mut mac) = <HmacSha256 as Mac>::new_from_slice(password.as_bytes()) else {
            return false;
        };
        mac.update(signing_payload(self.ts, &self.uri).as_bytes());
        mac.verify_slice(&expected).is_ok()
    }

    pub fn is_expired(&self, now_ms: i64, window_ms: i64) -> bool {
        (now_ms - self.ts).abs() > window_ms
    }
}

fn signing_payload(ts: i64, uri: &str) -> String {
    format!("{ts}\n{uri}")
}

pub fn sign(password: &str, ts: i64, uri: &str) -> ObshellResult<String> {
    let mut mac = <HmacSha256 as Mac>::new_from_slice(password.as_bytes())
        .map_err(|e| ObshellError::crypto(format!("初始化签名失败: {e}")))?;
    mac.update(signing_payload(ts, uri).as_bytes());
    Ok(hex::encode(mac.finalize().into_bytes()))
}

/// 本代理的 RSA 密钥
pub struct KeyStore {
    private_key: RsaPrivateKey,
    public_key_pem: String,
}

impl KeyStore {
    /// 生成新的私钥, 返回 PKCS#8 PEM
    pub fn generate_pem(bits: usize) -> ObshellResult<String> {
        let key = RsaPrivateKey::new(&mut OsRng, bits)
            .map_err(|e| ObshellError::crypto(format!("生成RSA密钥失败: {e}")))?;
        let pem = key
            .to_pkcs8_pem(LineEnding::LF)
            .map_err(|e| ObshellError::crypto(format!("编码RSA私钥失败: {e}")))?;
        Ok(pem.as_str().to_string())
    }

    pub fn from_pem(pem: &str) -> ObshellResult<Self> {
        let private_key = RsaPrivateKey::from_pkcs8_pem(pem)
            .map_err(|e| ObshellError::crypto(format!("解析RSA私钥失败: {e}")))?;
        let public_key_pem = RsaPublicKey::from(&private_key)
            .to_public_key_pem(LineEnding::LF)
            .map_err(|e| ObshellError::crypto(format!("编码RSA公钥失败: {e}")))?;
        Ok(Self {
            private_key,
            public_key_pem,
        })
    }

    pub fn public_key_pem(&self) -> &str {
        &self.public_key_pem
    }

    /// 打开发给本代理的安全头
    pub fn open(&self, sealed: &str) -> ObshellResult<SecureHeader> {
        let (key_part, payload_part) = sealed
            .split_once('.')
            .ok_or_else(|| ObshellError::crypto("安全头格式错误"))?;
        let sealed_key = decode_base64(key_part)?;
        let material = self
            .private_key
            .decrypt(Pkcs1v15Encrypt, &sealed_key)
            .map_err(|e| ObshellError::crypto(format!("解密会话密钥失败: {e}")))?;
        if material.len() != AES_KEY_LEN + NONCE_LEN {
            return Err(ObshellError::crypto("会话密钥长度错误"));
        }
        let (key, nonce) = material.split_at(AES_KEY_LEN);
        let plain = aes_decrypt(key, nonce, &decode_base64(payload_part)?)?;
        Ok(serde_json::from_slice(&plain)?)
    }
}

/// 以接收方公钥封装安全头
pub fn seal(public_key_pem: &str, header: &SecureHeader) -> ObshellResult<String> {
    let public_key = RsaPublicKey::from_public_key_pem(public_key_pem)
        .map_err(|e| ObshellError::crypto(format!("解析RSA公钥失败: {e}")))?;
    let key = Aes256Gcm::generate_key(OsRng);
    let nonce = Aes256Gcm::generate_nonce(&mut OsRng);

    let payload = Aes256Gcm::new(&key)
        .encrypt(&nonce, serde_json::to_vec(header)?.as_slice())
        .map_err(|e| ObshellError::crypto(format!("加密安全头失败: {e}")))?;

    let mut material = key.to_vec();
    material.extend_from_slice(&nonce);
    let sealed_key = public_key
        .encrypt(&mut OsRng, Pkcs1v15Encrypt, &material)
        .map_err(|e| ObshellError::crypto(format!("封装会话密钥失败: {e}")))?;

    Ok(format!(
        "{}.{}",
        STANDARD.encode(sealed_key),
        STANDARD.encode(payload)
    ))
}

/// 生成请求体密钥, base64 编码
pub fn generate_body_key() -> String {
    STANDARD.encode(Aes256Gcm::generate_key(OsRng))
}

/// 请求体加密为 `base64(nonce ‖ ciphertext)`
pub fn encrypt_body(key: &str, plain: &[u8]) -> ObshellResult<Vec<u8>> {
    let cipher = body_cipher(key)?;
    let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
    let ciphertext = cipher
        .encrypt(&nonce, plain)
        .map_err(|e| ObshellError::crypto(format!("加密请求体失败: {e}")))?;
    let mut sealed = nonce.to_vec();
    sealed.extend_from_slice(&ciphertext);
    Ok(STANDARD.encode(sealed).into_bytes())
}

pub fn decrypt_body(key: &str, body: &[u8]) -> ObshellResult<Vec<u8>> {
    let sealed = STANDARD
        .decode(body)
        .map_err(|e| ObshellError::crypto(format!("请求体不是合法的base64: {e}")))?;
    if sealed.len() < NONCE_LEN {
        return Err(ObshellError::crypto("请求体长度错误"));
    }
    let (nonce, ciphertext) = sealed.split_at(NONCE_LEN);
    let key = decode_base64(key)?;
    aes_decrypt(&key, nonce, ciphertext)
}

fn body_cipher(key: &str) -> ObshellResult<Aes256Gcm> {
    Aes256Gcm::new_from_slice(&decode_base64(key)?)
        .map_err(|_| ObshellError::crypto("请求体密钥长度错误"))
}

fn aes_decrypt(key: &[u8], nonce: &[u8], ciphertext: &[u8]) -> ObshellResult<Vec<u8>> {
    if nonce.len() != NONCE_LEN {
        return Err(ObshellError::crypto("nonce长度错误"));
    }
    let cipher =
        Aes256Gcm::new_from_slice(key).map_err(|_| ObshellError::crypto("AES密钥长度错误"))?;
    cipher
        .decrypt(Nonce::from_slice(nonce), ciphertext)
        .map_err(|_| ObshellError::crypto("解密失败"))
}

fn decode_base64(text: &str) -> ObshellResult<Vec<u8>> {
    STANDARD
        .decode(text)
        .map_err(|e| ObshellError::crypto(format!("base64解码失败: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::OnceLock;

    fn keys() -> &'static KeyStore {
        static KEYS: OnceLock<KeyStore> = OnceLock::new();
        KEYS.get_or_init(|| KeyStore::from_pem(&KeyStore::generate_pem(1024).unwrap()).unwrap())
    }

    #[test]
    fn test_next_ts_is_strictly_increasing() {
        let mut last = next_ts();
        for _ in 0..1000 {
            let ts = next_ts();
            assert!(ts > last);
            last = ts;
        }
    }

    #[test]
    fn test_seal_and_open() {
        let header = SecureHeader::new("/api/v1/agents", "pwd")
            .unwrap()
            .with_token("token-1")
            .forwarded(ForwardType::AutoForward, AgentInfo::new("10.0.0.2", 2886));
        let sealed = seal(keys().public_key_pem(), &header).unwrap();
        let opened = keys().open(&sealed).unwrap();
        assert_eq!(opened, header);
        assert!(opened.verify_auth("pwd"));
    }

    #[test]
    fn test_open_rejects_foreign_or_broken_header() {
        let other = KeyStore::from_pem(&KeyStore::generate_pem(1024).unwrap()).unwrap();
        let header = SecureHeader::new("/api/v1/agents", "pwd").unwrap();
        let sealed = seal(other.public_key_pem(), &header).unwrap();
        assert!(keys().open(&sealed).is_err());
        assert!(keys().open("not-a-header").is_err());
        assert!(keys().open("YWJj.ZGVm").is_err());
    }

    #[test]
    fn test_auth_is_bound_to_uri_and_password() {
        let mut header = SecureHeader::new("/api/v1/ob/init", "pwd").unwrap();
        assert!(header.verify_auth("pwd"));
        assert!(!header.verify_auth("other"));

        header.uri = "/api/v1/agent/remove".to_string();
        assert!(!header.verify_auth("pwd"));

        header.auth = "zz".to_string();
        assert!(!header.verify_auth("pwd"));
    }

    #[test]
    fn test_expiry_window() {
        let header = SecureHeader::new("/api/v1/agents", "").unwrap();
        assert!(!header.is_expired(header.ts + 1_000, 5_000));
        assert!(header.is_expired(header.ts + 6_000, 5_000));
        assert!(header.is_expired(header.ts - 6_000, 5_000));
    }

    #[test]
    fn test_body_encryption() {
        let key = generate_body_key();
        let body = br#"{"operator":"cancel"}"#;
        let sealed = encrypt_body(&key, body).unwrap();
        assert_ne!(sealed.as_slice(), body.as_slice());
        assert_eq!(decrypt_body(&key, &sealed).unwrap(), body.to_vec());

        assert!(decrypt_body(&generate_body_key(), &sealed).is_err());
        assert!(decrypt_body(&key, b"!!").is_err());
    }
}
