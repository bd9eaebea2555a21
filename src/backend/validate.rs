//! Plain syntax check for TON addresses.
//!
//! Accepts the raw form (`<workchain>:<64 hex>`) and the 48-character
//! user-friendly form (base64 or base64url). Domain names are not resolved.

use std::sync::LazyLock;

use async_trait::async_trait;
use regex::Regex;

use crate::backend::{AddressValidation, AddressValidator};

static RAW_ADDRESS: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^-?[0-9]+:[0-9a-fA-F]{64}$").expect("valid address regex")
});

static FRIENDLY_ADDRESS: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[A-Za-z0-9_\-+/]{48}$").expect("valid address regex")
});

/// Offline validator used by the terminal front end.
#[derive(Debug, Default, Clone, Copy)]
pub struct TonAddressValidator;

impl TonAddressValidator {
    pub fn check(raw: &str) -> AddressValidation {
        let candidate = raw.trim();
        if candidate.is_empty() {
            return AddressValidation::invalid("address is empty");
        }
        if RAW_ADDRESS.is_match(candidate) {
            return AddressValidation::valid(candidate.to_ascii_lowercase());
        }
        if FRIENDLY_ADDRESS.is_match(candidate) {
            return AddressValidation::valid(candidate);
        }
        AddressValidation::invalid("expected a raw (0:hex) or 48-character user-friendly address")
    }
}

#[async_trait]
impl AddressValidator for TonAddressValidator {
    async fn validate_address(&self, raw: &str) -> AddressValidation {
        Self::check(raw)
    }
}
