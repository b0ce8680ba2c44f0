//! Voucher codes and signed QR payloads.

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use chrono::{DateTime, Utc};
use hmac::{digest::InvalidLength, Hmac, Mac};
use rand::Rng;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use uuid::Uuid;

type HmacSha256 = Hmac<Sha256>;

const ALPHABET: &[u8; 36] = b"0123456789ABCDEFGHIJKLMNOPQRSTUVWXYZ";
const SUFFIX_LEN: usize = 6;

fn base36(mut n: u128) -> String {
    if n == 0 {
        return "0".to_string();
    }
    let mut digits = Vec::new();
    while n > 0 {
        digits.push(ALPHABET[(n % 36) as usize]);
        n /= 36;
    }
    digits.iter().rev().map(|&b| b as char).collect()
}

/// `VC-{millis in base 36}-{6 random base 36 chars}`, uppercase.
pub fn generate_voucher_code(now: DateTime<Utc>) -> String {
    let millis = u128::try_from(now.timestamp_millis()).unwrap_or_default();
    let mut rng = rand::rng();
    let suffix: String = (0..SUFFIX_LEN)
        .map(|_| ALPHABET[rng.random_range(0..ALPHABET.len())] as char)
        .collect();
    format!("VC-{}-{}", base36(millis), suffix)
}

/// Normalises a code typed in by venue staff.
pub fn normalize_code(code: &str) -> String {
    code.trim().to_uppercase()
}

/// HMAC-SHA256 over arbitrary bytes with a fixed key.
#[derive(Clone)]
pub struct HmacSigner {
    mac: HmacSha256,
}

impl HmacSigner {
    pub fn new(key: &[u8]) -> Result<Self, InvalidLength> {
        Ok(Self {
            mac: HmacSha256::new_from_slice(key)?,
        })
    }

    pub fn sign(&self, data: &[u8]) -> Vec<u8> {
        let mut mac = self.mac.clone();
        mac.update(data);
        mac.finalize().into_bytes().to_vec()
    }

    /// Constant-time comparison against `signature`.
    pub fn verify(&self, data: &[u8], signature: &[u8]) -> bool {
        let mut mac = self.mac.clone();
        mac.update(data);
        mac.verify_slice(signature).is_ok()
    }

    pub fn sign_hex(&self, data: &[u8]) -> String {
        hex::encode(self.sign(data))
    }

    pub fn verify_hex(&self, data: &[u8], signature: &str) -> bool {
        match hex::decode(signature.trim()) {
            Ok(bytes) => self.verify(data, &bytes),
            Err(_) => false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QrPayload {
    pub voucher_id: Uuid,
    pub deal_id: Uuid,
    pub venue_id: Uuid,
    pub voucher_code: String,
}

/// Encodes QR payloads as `base64url(json).base64url(hmac)`.
#[derive(Clone)]
pub struct QrSigner {
    signer: HmacSigner,
}

impl QrSigner {
    pub fn new(secret: &[u8]) -> Result<Self, InvalidLength> {
        Ok(Self {
            signer: HmacSigner::new(secret)?,
        })
    }

    pub fn sign(&self, payload: &QrPayload) -> Result<String, serde_json::Error> {
        let body = URL_SAFE_NO_PAD.encode(serde_json::to_vec(payload)?);
        let signature = URL_SAFE_NO_PAD.encode(self.signer.sign(body.as_bytes()));
        Ok(format!("{body}.{signature}"))
    }

    /// The embedded payload, if the data was produced by this signer unchanged.
    pub fn verify(&self, data: &str) -> Option<QrPayload> {
        let (body, signature) = data.trim().split_once('.')?;
        let signature = URL_SAFE_NO_PAD.decode(signature).ok()?;
        if !self.signer.verify(body.as_bytes(), &signature) {
            return None;
        }
        let json = URL_SAFE_NO_PAD.decode(body).ok()?;
        serde_json::from_slice(&json).ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    fn payload() -> QrPayload {
        QrPayload {
            voucher_id: Uuid::new_v4(),
            deal_id: Uuid::new_v4(),
            venue_id: Uuid::new_v4(),
            voucher_code: "VC-ABC-123456".to_string(),
        }
    }

    #[test]
    fn test_voucher_code_shape() {
        let code = generate_voucher_code(Utc::now());
        let parts: Vec<&str> = code.split('-').collect();
        assert_eq!(parts.len(), 3);
        assert_eq!(parts[0], "VC");
        assert_eq!(parts[2].len(), SUFFIX_LEN);
        assert!(code
            .chars()
            .all(|c| c == '-' || c.is_ascii_digit() || c.is_ascii_uppercase()));
    }

    #[test]
    fn test_voucher_codes_differ_within_same_millisecond() {
        let now = Utc::now();
        let codes: HashSet<String> = (0..200).map(|_| generate_voucher_code(now)).collect();
        assert_eq!(codes.len(), 200);
    }

    #[test]
    fn test_suffix_draws_letters_and_digits() {
        let now = Utc::now();
        let seen: HashSet<char> = (0..500)
            .flat_map(|_| {
                let code = generate_voucher_code(now);
                code.rsplit('-').next().unwrap_or_default().chars().collect::<Vec<_>>()
            })
            .collect();
        assert!(seen.iter().any(|c| c.is_ascii_digit()));
        assert!(seen.iter().any(|c| c.is_ascii_uppercase()));
        assert!(seen.iter().all(|c| ALPHABET.contains(&(*c as u8))));
    }

    #[test]
    fn test_base36() {
        assert_eq!(base36(0), "0");
        assert_eq!(base36(35), "Z");
        assert_eq!(base36(36), "10");
    }

    #[test]
    fn test_normalize_code() {
        assert_eq!(normalize_code("  vc-ab12-xyz \n"), "VC-AB12-XYZ");
    }

    #[test]
    fn test_qr_payload_verifies() {
        let signer = QrSigner::new(b"secret").unwrap();
        let payload = payload();
        let data = signer.sign(&payload).unwrap();
        assert_eq!(signer.verify(&data), Some(payload));
    }

    #[test]
    fn test_qr_payload_rejects_tampering_and_foreign_keys() {
        let signer = QrSigner::new(b"secret").unwrap();
        let data = signer.sign(&payload()).unwrap();

        let (body, signature) = data.split_once('.').unwrap();
        let mut forged = payload();
        forged.voucher_code = "VC-FORGED-000000".to_string();
        let forged_body = URL_SAFE_NO_PAD.encode(serde_json::to_vec(&forged).unwrap());
        assert_eq!(signer.verify(&format!("{forged_body}.{signature}")), None);

        let other = QrSigner::new(b"other").unwrap();
        assert_eq!(other.verify(&data), None);

        assert_eq!(signer.verify(body), None);
        assert_eq!(signer.verify("not-a-payload"), None);
    }

    #[test]
    fn test_hex_signatures() {
        let signer = HmacSigner::new(b"webhook").unwrap();
        let signature = signer.sign_hex(b"{\"a\":1}");
        assert!(signer.verify_hex(b"{\"a\":1}", &signature));
        assert!(!signer.verify_hex(b"{\"a\":2}", &signature));
        assert!(!signer.verify_hex(b"{\"a\":1}", "zz"));
    }
}
