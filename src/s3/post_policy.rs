//! Browser-form POST policies signed with AWS Signature Version 4
//!
//! The AWS SDK presigns single requests only; a POST policy is a signed
//! JSON document instead:
//!
//! ```text
//! policy    = base64(json{ expiration, conditions })
//! signature = hex(HMAC-SHA256(SigningKey, policy))
//! ```

use std::collections::BTreeMap;
use std::time::Duration;

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use chrono::{DateTime, SecondsFormat, Utc};
use hmac::{Hmac, Mac};
use serde_json::{json, Value};
use sha2::Sha256;

use crate::s3::error::{Result, StorageError};
use crate::s3::types::PresignedPost;

const ALGORITHM: &str = "AWS4-HMAC-SHA256";
const SERVICE: &str = "s3";

/// Placeholder S3 replaces with the uploaded file's name
const FILENAME_VARIABLE: &str = "${filename}";

type HmacSha256 = Hmac<Sha256>;

/// The identity a policy is signed with
#[derive(Debug, Clone, Copy)]
pub struct SigningCredentials<'a> {
    pub access_key_id: &'a str,
    pub secret_access_key: &'a str,
    pub session_token: Option<&'a str>,
}

/// An unsigned POST policy for one key
#[derive(Debug, Clone)]
pub struct PostPolicy {
    bucket: String,
    key: String,
    expires_in: Duration,
    fields: BTreeMap<String, String>,
    conditions: Vec<Value>,
}

impl PostPolicy {
    pub fn new(bucket: impl Into<String>, key: impl Into<String>, expires_in: Duration) -> Self {
        Self {
            bucket: bucket.into(),
            key: key.into(),
            expires_in,
            fields: BTreeMap::new(),
            conditions: Vec::new(),
        }
    }

    /// Prefilled form fields. They are not added to the conditions.
    pub fn fields(mut self, fields: BTreeMap<String, String>) -> Self {
        self.fields = fields;
        self
    }

    /// Extra policy conditions, e.g. `["content-length-range", 0, 1048576]`
    pub fn conditions(mut self, conditions: Vec<Value>) -> Self {
        self.conditions = conditions;
        self
    }

    /// Sign the policy as of `now`, targeting the form at `url`
    pub fn sign(
        &self,
        credentials: &SigningCredentials<'_>,
        region: &str,
        now: DateTime<Utc>,
        url: impl Into<String>,
    ) -> Result<PresignedPost> {
        let ttl = chrono::Duration::from_std(self.expires_in)
            .map_err(|_| StorageError::format(format!("expiry {:?} is out of range", self.expires_in)))?;
        let expiration = (now + ttl).to_rfc3339_opts(SecondsFormat::Millis, true);

        let date_stamp = now.format("%Y%m%d").to_string();
        let amz_date = now.format("%Y%m%dT%H%M%SZ").to_string();
        let credential = format!(
            "{}/{}/{}/{}/aws4_request",
            credentials.access_key_id, date_stamp, region, SERVICE
        );

        let mut fields = self.fields.clone();
        fields.insert("key".to_string(), self.key.clone());
        fields.insert("x-amz-algorithm".to_string(), ALGORITHM.to_string());
        fields.insert("x-amz-credential".to_string(), credential.clone());
        fields.insert("x-amz-date".to_string(), amz_date.clone());

        let mut conditions = self.conditions.clone();
        conditions.push(json!({ "bucket": self.bucket }));
        conditions.push(self.key_condition());
        conditions.push(json!({ "x-amz-algorithm": ALGORITHM }));
        conditions.push(json!({ "x-amz-credential": credential }));
        conditions.push(json!({ "x-amz-date": amz_date }));

        if let Some(token) = credentials.session_token {
            fields.insert("x-amz-security-token".to_string(), token.to_string());
            conditions.push(json!({ "x-amz-security-token": token }));
        }

        let document = json!({
            "expiration": expiration,
            "conditions": conditions,
        });
        let policy = STANDARD.encode(document.to_string());

        let signing_key = derive_signing_key(credentials.secret_access_key, &date_stamp, region, SERVICE);
        let signature = hex::encode(hmac_sha256(&signing_key, policy.as_bytes()));

        fields.insert("policy".to_string(), policy);
        fields.insert("x-amz-signature".to_string(), signature);

        Ok(PresignedPost {
            url: url.into(),
            fields,
        })
    }

    fn key_condition(&self) -> Value {
        match self.key.strip_suffix(FILENAME_VARIABLE) {
            Some(prefix) => json!(["starts-with", "$key", prefix]),
            None => json!({ "key": self.key }),
        }
    }
}

/// SigV4 signing key: HMAC chain over date, region, service and `aws4_request`
pub fn derive_signing_key(secret_key: &str, date: &str, region: &str, service: &str) -> Vec<u8> {
    let date_key = hmac_sha256(format!("AWS4{}", secret_key).as_bytes(), date.as_bytes());
    let date_region_key = hmac_sha256(&date_key, region.as_bytes());
    let date_region_service_key = hmac_sha256(&date_region_key, service.as_bytes());
    hmac_sha256(&date_region_service_key, b"aws4_request")
}

fn hmac_sha256(key: &[u8], data: &[u8]) -> Vec<u8> {
    let mut mac = HmacSha256::new_from_slice(key).expect("HMAC can accept keys of any length");
    mac.update(data);
    mac.finalize().into_bytes().to_vec()
}
