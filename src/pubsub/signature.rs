use anyhow::{anyhow, bail};
use hmac::{Hmac, Mac};
use sha1::Sha1;
use sha2::{Sha256, Sha384, Sha512};

/// Secret handed to the hub for one topic, so a leaked topic secret does not
/// expose the others.
pub(crate) fn topic_secret(secret: &str, topic: &str) -> anyhow::Result<String> {
    let mut mac = Hmac::<Sha1>::new_from_slice(secret.as_bytes())
        .map_err(|_| anyhow!("failed to initialize hmac"))?;
    mac.update(topic.as_bytes());
    Ok(hex::encode(mac.finalize().into_bytes()))
}

fn verify_mac<M: Mac>(mut mac: M, body: &[u8], expected: &[u8]) -> anyhow::Result<()> {
    mac.update(body);
    mac.verify_slice(expected)
        .map_err(|_| anyhow!("signature verification failed"))
}

/// Checks an `x-hub-signature: <algo>=<hex>` header against the body.
pub(crate) fn verify_signature(key: &str, header: &str, body: &[u8]) -> anyhow::Result<()> {
    let (algo, digest_hex) = header
        .trim()
        .split_once('=')
        .ok_or_else(|| anyhow!("signature must use <algo>=<hex> format"))?;
    let expected = hex::decode(digest_hex.trim())?;
    let key = key.as_bytes();
    let invalid_key = |_| anyhow!("failed to initialize hmac verifier");
    match algo {
        "sha1" => verify_mac(Hmac::<Sha1>::new_from_slice(key).map_err(invalid_key)?, body, &expected),
        "sha256" => verify_mac(Hmac::<Sha256>::new_from_slice(key).map_err(invalid_key)?, body, &expected),
        "sha384" => verify_mac(Hmac::<Sha384>::new_from_slice(key).map_err(invalid_key)?, body, &expected),
        "sha512" => verify_mac(Hmac::<Sha512>::new_from_slice(key).map_err(invalid_key)?, body, &expected),
        other => bail!("unsupported signature algorithm {}", other),
    }
}
