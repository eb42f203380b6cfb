use hmac::{Hmac, Mac};
use sha2::Sha256;
use subtle::ConstantTimeEq;

type HmacSha256 = Hmac<Sha256>;

/// Lowercase hex HMAC-SHA256 of `body` keyed with the subscriber secret.
pub fn sign_payload(body: &[u8], secret: &str) -> String {
    let mut mac =
        HmacSha256::new_from_slice(secret.as_bytes()).expect("HMAC can take key of any size");
    mac.update(body);
    hex::encode(mac.finalize().into_bytes())
}

pub fn verify_signature(body: &[u8], secret: &str, signature_hex: &str) -> bool {
    let expected = sign_payload(body, secret);
    let provided = signature_hex.trim().to_ascii_lowercase();
    ConstantTimeEq::ct_eq(expected.as_bytes(), provided.as_bytes()).into()
}
