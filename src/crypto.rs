//! Safe-mode message envelope: AES-256-CBC payloads wrapped in `<Encrypt>`.
//!
//! Plaintext layout is `random(16) || len(u32 BE) || message || appid`,
//! padded PKCS#7-style to a 32-byte block. The IV is the first 16 bytes of
//! the key.

use crate::message::xml::{cdata, XmlElement};
use crate::security::signature::{compute_signature, constant_time_eq};
use aes::Aes256;
use base64::engine::general_purpose::{GeneralPurpose, GeneralPurposeConfig};
use base64::Engine as _;
use cbc::cipher::{block_padding::NoPadding, BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use rand::RngExt;

const PAD_BLOCK: usize = 32;
const RANDOM_PREFIX_LEN: usize = 16;

/// EncodingAESKey values issued by the platform often carry non-zero
/// trailing bits, which the strict engine rejects.
const AES_KEY_ENGINE: GeneralPurpose = GeneralPurpose::new(
    &base64::alphabet::STANDARD,
    GeneralPurposeConfig::new().with_decode_allow_trailing_bits(true),
);

#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("EncodingAESKey must decode to 32 bytes")]
    InvalidKey,
    #[error("missing query parameter `msg_signature`")]
    MissingSignature,
    #[error("envelope is not a valid encrypted document: {0}")]
    MalformedEnvelope(String),
    #[error("envelope signature mismatch")]
    InvalidSignature,
    #[error("ciphertext is not valid base64")]
    InvalidBase64,
    #[error("ciphertext could not be decrypted")]
    Decrypt,
    #[error("invalid padding")]
    BadPadding,
    #[error("decrypted payload length is invalid")]
    InvalidLength,
    #[error("decrypted payload is not utf-8")]
    InvalidUtf8,
    #[error("envelope was issued for a different appid")]
    AppIdMismatch,
    #[error("plaintext payload too large")]
    TooLarge,
}

fn random_ascii_token(len: usize) -> String {
    const CHARSET: &[u8] = b"abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";
    let mut out = String::with_capacity(len);
    let mut rng = rand::rng();
    for _ in 0..len {
        let idx = rng.random_range(0..CHARSET.len());
        out.push(CHARSET[idx] as char);
    }
    out
}

fn strip_padding(input: &[u8]) -> Result<&[u8], DecodeError> {
    let Some(last) = input.last() else {
        return Err(DecodeError::BadPadding);
    };
    let pad_len = *last as usize;
    if pad_len == 0 || pad_len > PAD_BLOCK || pad_len > input.len() {
        return Err(DecodeError::BadPadding);
    }
    Ok(&input[..input.len() - pad_len])
}

#[derive(Clone)]
pub struct WeChatCrypto {
    token: String,
    appid: String,
    key: [u8; 32],
}

impl std::fmt::Debug for WeChatCrypto {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WeChatCrypto")
            .field("appid", &self.appid)
            .finish_non_exhaustive()
    }
}

impl WeChatCrypto {
    pub fn new(token: &str, encoding_aes_key: &str, appid: &str) -> Result<Self, DecodeError> {
        let padded = format!("{}=", encoding_aes_key.trim());
        let raw = AES_KEY_ENGINE
            .decode(padded)
            .map_err(|_| DecodeError::InvalidKey)?;
        let key: [u8; 32] = raw.try_into().map_err(|_| DecodeError::InvalidKey)?;

        Ok(Self {
            token: token.trim().to_string(),
            appid: appid.trim().to_string(),
            key,
        })
    }

    fn verify_signature(
        &self,
        msg_signature: &str,
        timestamp: &str,
        nonce: &str,
        encrypt: &str,
    ) -> bool {
        let expected =
            compute_signature(&[&self.token, timestamp.trim(), nonce.trim(), encrypt.trim()]);
        constant_time_eq(expected.as_bytes(), msg_signature.trim().as_bytes())
    }

    /// Unwraps an encrypted `<xml><Encrypt>..</Encrypt></xml>` request body.
    pub fn decrypt_message(
        &self,
        raw: &[u8],
        msg_signature: &str,
        timestamp: &str,
        nonce: &str,
    ) -> Result<String, DecodeError> {
        let root = XmlElement::parse(raw)
            .map_err(|err| DecodeError::MalformedEnvelope(err.to_string()))?;
        let encrypt = root
            .child_text("Encrypt")
            .ok_or_else(|| DecodeError::MalformedEnvelope("missing <Encrypt>".to_string()))?;

        if !self.verify_signature(msg_signature, timestamp, nonce, encrypt) {
            return Err(DecodeError::InvalidSignature);
        }
        self.decrypt_ciphertext(encrypt)
    }

    /// Wraps a rendered reply into the encrypted response document.
    pub fn encrypt_message(
        &self,
        plaintext: &str,
        timestamp: &str,
        nonce: &str,
    ) -> Result<String, DecodeError> {
        let encrypted = self.encrypt_ciphertext(plaintext)?;
        let signature =
            compute_signature(&[&self.token, timestamp.trim(), nonce.trim(), &encrypted]);
        Ok(format!(
            "<xml><Encrypt>{}</Encrypt><MsgSignature>{}</MsgSignature>\
             <TimeStamp>{}</TimeStamp><Nonce>{}</Nonce></xml>",
            cdata(&encrypted),
            cdata(&signature),
            timestamp.trim(),
            cdata(nonce.trim())
        ))
    }

    fn encrypt_ciphertext(&self, plaintext: &str) -> Result<String, DecodeError> {
        let plaintext_bytes = plaintext.as_bytes();
        let len = u32::try_from(plaintext_bytes.len()).map_err(|_| DecodeError::TooLarge)?;

        let mut raw = Vec::with_capacity(plaintext_bytes.len() + self.appid.len() + 64);
        raw.extend_from_slice(random_ascii_token(RANDOM_PREFIX_LEN).as_bytes());
        raw.extend_from_slice(&len.to_be_bytes());
        raw.extend_from_slice(plaintext_bytes);
        raw.extend_from_slice(self.appid.as_bytes());

        let pad_len = PAD_BLOCK - (raw.len() % PAD_BLOCK);
        raw.extend(std::iter::repeat_n(pad_len as u8, pad_len));

        let iv = &self.key[..16];
        let msg_len = raw.len();
        let encrypted = cbc::Encryptor::<Aes256>::new((&self.key).into(), iv.into())
            .encrypt_padded_mut::<NoPadding>(&mut raw, msg_len)
            .map_err(|_| DecodeError::Decrypt)?;
        Ok(base64::engine::general_purpose::STANDARD.encode(encrypted))
    }

    fn decrypt_ciphertext(&self, encrypt: &str) -> Result<String, DecodeError> {
        let mut buf = base64::engine::general_purpose::STANDARD
            .decode(encrypt.trim())
            .map_err(|_| DecodeError::InvalidBase64)?;

        let iv = &self.key[..16];
        let plaintext = cbc::Decryptor::<Aes256>::new((&self.key).into(), iv.into())
            .decrypt_padded_mut::<NoPadding>(&mut buf)
            .map_err(|_| DecodeError::Decrypt)?;

        let unpadded = strip_padding(plaintext)?;
        let header_len = RANDOM_PREFIX_LEN + 4;
        if unpadded.len() < header_len {
            return Err(DecodeError::InvalidLength);
        }

        let msg_len = u32::from_be_bytes([
            unpadded[RANDOM_PREFIX_LEN],
            unpadded[RANDOM_PREFIX_LEN + 1],
            unpadded[RANDOM_PREFIX_LEN + 2],
            unpadded[RANDOM_PREFIX_LEN + 3],
        ]) as usize;
        let msg_end = header_len.saturating_add(msg_len);
        if msg_end > unpadded.len() {
            return Err(DecodeError::InvalidLength);
        }

        let msg = std::str::from_utf8(&unpadded[header_len..msg_end])
            .map_err(|_| DecodeError::InvalidUtf8)?
            .to_string();
        let from_appid =
            std::str::from_utf8(&unpadded[msg_end..]).map_err(|_| DecodeError::InvalidUtf8)?;
        if from_appid != self.appid {
            return Err(DecodeError::AppIdMismatch);
        }

        Ok(msg)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const KEY: &str = "abcdefghijklmnopqrstuvwxyz0123456789ABCDEFG";

    fn crypto() -> WeChatCrypto {
        WeChatCrypto::new("token123", KEY, "wx_appid").unwrap()
    }

    fn request_body(encrypted_reply: &str) -> (String, String) {
        let root = XmlElement::parse(encrypted_reply.as_bytes()).unwrap();
        let encrypt = root.child_text("Encrypt").unwrap().to_string();
        let signature = root.child_text("MsgSignature").unwrap().to_string();
        (
            format!("<xml><ToUserName>gh</ToUserName><Encrypt>{}</Encrypt></xml>", cdata(&encrypt)),
            signature,
        )
    }

    #[test]
    fn encrypt_then_decrypt_recovers_plaintext() {
        let crypto = crypto();
        let plain = "<xml><Content><![CDATA[你好]]></Content></xml>";
        let envelope = crypto.encrypt_message(plain, "1700000000", "nonce123").unwrap();
        let (body, signature) = request_body(&envelope);

        let decrypted = crypto
            .decrypt_message(body.as_bytes(), &signature, "1700000000", "nonce123")
            .unwrap();
        assert_eq!(decrypted, plain);
    }

    #[test]
    fn tampered_inner_signature_is_rejected() {
        let crypto = crypto();
        let envelope = crypto.encrypt_message("<xml/>", "1700000000", "n").unwrap();
        let (body, _) = request_body(&envelope);
        assert!(matches!(
            crypto.decrypt_message(body.as_bytes(), "deadbeef", "1700000000", "n"),
            Err(DecodeError::InvalidSignature)
        ));
    }

    #[test]
    fn foreign_appid_is_rejected() {
        let other = WeChatCrypto::new("token123", KEY, "wx_other").unwrap();
        let envelope = other.encrypt_message("<xml/>", "1700000000", "n").unwrap();
        let (body, signature) = request_body(&envelope);
        assert!(matches!(
            crypto().decrypt_message(body.as_bytes(), &signature, "1700000000", "n"),
            Err(DecodeError::AppIdMismatch)
        ));
    }

    #[test]
    fn malformed_envelopes_fail() {
        let crypto = crypto();
        assert!(matches!(
            crypto.decrypt_message(b"<xml><ToUserName>x</ToUserName></xml>", "s", "1", "n"),
            Err(DecodeError::MalformedEnvelope(_))
        ));
        assert!(matches!(
            crypto.decrypt_message(b"not xml", "s", "1", "n"),
            Err(DecodeError::MalformedEnvelope(_))
        ));

        let bogus = "!!notbase64!!";
        let signature = compute_signature(&["token123", "1", "n", bogus]);
        let body = format!("<xml><Encrypt>{bogus}</Encrypt></xml>");
        assert!(matches!(
            crypto.decrypt_message(body.as_bytes(), &signature, "1", "n"),
            Err(DecodeError::InvalidBase64)
        ));
    }

    #[test]
    fn padding_is_validated() {
        assert!(strip_padding(&[]).is_err());
        assert!(strip_padding(&[1, 2, 0]).is_err());
        assert!(strip_padding(&[1, 2, 33]).is_err());
        assert_eq!(strip_padding(&[7, 7, 2, 2]).unwrap(), &[7, 7]);
    }

    #[test]
    fn short_keys_are_rejected() {
        assert!(matches!(
            WeChatCrypto::new("t", "short", "a"),
            Err(DecodeError::InvalidKey)
        ));
    }
}
