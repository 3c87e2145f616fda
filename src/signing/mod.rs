//! Canonical-request signing for the backend, pub/sub and ingest endpoints.
//!
//! Implements the standard four-step signature: canonical request → string to
//! sign → derived signing key → hex signature. Only the subset the runtime
//! needs (POST with a JSON body, a handful of headers).

use anyhow::{Context, Result};
use chrono::Utc;
use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;

type HmacSha256 = Hmac<Sha256>;

const ALGORITHM: &str = "AWS4-HMAC-SHA256";

#[derive(Debug, Clone)]
pub struct SigningCredentials {
    pub access_key: String,
    pub secret_key: String,
    pub region: String,
    pub service: String,
}

/// Headers to attach to a signed request, including `authorization`.
pub type SignedHeaders = BTreeMap<String, String>;

fn sha256_hex(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

fn hmac_sha256(key: &[u8], data: &[u8]) -> Vec<u8> {
    let mut mac = HmacSha256::new_from_slice(key).expect("hmac accepts any key length");
    mac.update(data);
    mac.finalize().into_bytes().to_vec()
}

/// Sign a POST of `body` to `host`/`path` at the current time.
///
/// Returns the full header set the caller must send verbatim; the signature
/// covers exactly these headers.
pub fn sign_request(
    credentials: &SigningCredentials,
    host: &str,
    path: &str,
    body: &str,
) -> Result<SignedHeaders> {
    let now = Utc::now();
    let amz_date = now.format("%Y%m%dT%H%M%SZ").to_string();
    let date_stamp = now.format("%Y%m%d").to_string();

    let payload_hash = sha256_hex(body.as_bytes());

    let mut headers: SignedHeaders = BTreeMap::new();
    headers.insert("content-type".to_string(), "application/json".to_string());
    headers.insert("host".to_string(), host.to_string());
    headers.insert("x-amz-date".to_string(), amz_date.clone());

    let canonical_headers: String = headers
        .iter()
        .map(|(k, v)| format!("{}:{}\n", k, v.trim()))
        .collect();
    let signed_header_names: String = headers
        .keys()
        .map(String::as_str)
        .collect::<Vec<_>>()
        .join(";");

    let canonical_request = format!(
        "POST\n{}\n\n{}\n{}\n{}",
        path, canonical_headers, signed_header_names, payload_hash
    );

    let credential_scope = format!(
        "{}/{}/{}/aws4_request",
        date_stamp, credentials.region, credentials.service
    );
    let string_to_sign = format!(
        "{}\n{}\n{}\n{}",
        ALGORITHM,
        amz_date,
        credential_scope,
        sha256_hex(canonical_request.as_bytes())
    );

    let signature = hex::encode(signing_key_chain(
        &credentials.secret_key,
        &date_stamp,
        &credentials.region,
        &credentials.service,
        &string_to_sign,
    ));

    let authorization = format!(
        "{} Credential={}/{}, SignedHeaders={}, Signature={}",
        ALGORITHM, credentials.access_key, credential_scope, signed_header_names, signature
    );

    headers.insert("authorization".to_string(), authorization);
    Ok(headers)
}

fn signing_key_chain(
    secret_key: &str,
    date_stamp: &str,
    region: &str,
    service: &str,
    string_to_sign: &str,
) -> Vec<u8> {
    let k_date = hmac_sha256(format!("AWS4{}", secret_key).as_bytes(), date_stamp.as_bytes());
    let k_region = hmac_sha256(&k_date, region.as_bytes());
    let k_service = hmac_sha256(&k_region, service.as_bytes());
    let k_signing = hmac_sha256(&k_service, b"aws4_request");
    hmac_sha256(&k_signing, string_to_sign.as_bytes())
}

/// Extract the `host` portion of an http(s)/ws(s) endpoint URL.
pub fn host_of(endpoint: &str) -> Result<String> {
    let without_scheme = endpoint
        .splitn(2, "://")
        .nth(1)
        .with_context(|| format!("Endpoint '{}' has no scheme", endpoint))?;
    let host = without_scheme
        .split('/')
        .next()
        .unwrap_or(without_scheme)
        .to_string();
    if host.is_empty() {
        anyhow::bail!("Endpoint '{}' has an empty host", endpoint);
    }
    Ok(host)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn credentials() -> SigningCredentials {
        SigningCredentials {
            access_key: "AKIDEXAMPLE".to_string(),
            secret_key: "wJalrXUtnFEMI/K7MDENG+bPxRfiCYEXAMPLEKEY".to_string(),
            region: "us-east-1".to_string(),
            service: "appsync".to_string(),
        }
    }

    #[test]
    fn test_sign_request_header_set() {
        let headers =
            sign_request(&credentials(), "example.appsync-api.us-east-1.amazonaws.com", "/graphql", "{}")
                .unwrap();

        assert!(headers.contains_key("authorization"));
        assert!(headers.contains_key("x-amz-date"));
        assert_eq!(headers.get("content-type").unwrap(), "application/json");
        assert_eq!(
            headers.get("host").unwrap(),
            "example.appsync-api.us-east-1.amazonaws.com"
        );

        let auth = headers.get("authorization").unwrap();
        assert!(auth.starts_with("AWS4-HMAC-SHA256 Credential=AKIDEXAMPLE/"));
        assert!(auth.contains("SignedHeaders=content-type;host;x-amz-date"));
        assert!(auth.contains("Signature="));
    }

    #[test]
    fn test_signature_is_hex() {
        let headers = sign_request(&credentials(), "host.example.com", "/event", "{}").unwrap();
        let auth = headers.get("authorization").unwrap();
        let signature = auth.rsplit("Signature=").next().unwrap();
        assert_eq!(signature.len(), 64);
        assert!(signature.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_signature_depends_on_body() {
        // Signatures over different payloads must differ (same key, same host).
        let a = sign_request(&credentials(), "h.example.com", "/", "{\"a\":1}").unwrap();
        let b = sign_request(&credentials(), "h.example.com", "/", "{\"a\":2}").unwrap();
        // x-amz-date could differ across the second boundary; compare only when equal.
        if a.get("x-amz-date") == b.get("x-amz-date") {
            assert_ne!(a.get("authorization"), b.get("authorization"));
        }
    }

    #[test]
    fn test_host_of() {
        assert_eq!(
            host_of("https://api.example.com/graphql").unwrap(),
            "api.example.com"
        );
        assert_eq!(host_of("wss://events.example.com").unwrap(), "events.example.com");
        assert!(host_of("no-scheme").is_err());
    }
}
