//! Address policy record.
//!
//! Every field is optional; an unset field inherits from the next less
//! specific matching pattern and finally from the repository default.

use crate::settings::repository::Mergeable;
use serde::{Deserialize, Serialize};

pub const DEFAULT_MAX_DELIVERY_ATTEMPTS: u32 = 10;
pub const DEFAULT_MAX_SIZE_BYTES: i64 = -1;
pub const DEFAULT_PAGE_SIZE_BYTES: i64 = 10 * 1024 * 1024;
pub const DEFAULT_REDELIVERY_DELAY_MS: u64 = 0;
pub const DEFAULT_REDISTRIBUTION_DELAY_MS: i64 = -1;

/// What to do when an address exceeds `max_size_bytes`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AddressFullPolicy {
    Drop,
    Fail,
    #[default]
    Page,
    Block,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddressSettings {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dead_letter_address: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expiry_address: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_delivery_attempts: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_size_bytes: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub page_size_bytes: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub redelivery_delay_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub redistribution_delay_ms: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_value_queue: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub send_to_dla_on_no_route: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub address_full_policy: Option<AddressFullPolicy>,
}

impl AddressSettings {
    pub fn new() -> Self {
        Self::default()
    }

    /// A record with every field set to the broker defaults. Used as the
    /// repository fallback.
    pub fn broker_defaults() -> Self {
        Self {
            dead_letter_address: None,
            expiry_address: None,
            max_delivery_attempts: Some(DEFAULT_MAX_DELIVERY_ATTEMPTS),
            max_size_bytes: Some(DEFAULT_MAX_SIZE_BYTES),
            page_size_bytes: Some(DEFAULT_PAGE_SIZE_BYTES),
            redelivery_delay_ms: Some(DEFAULT_REDELIVERY_DELAY_MS),
            redistribution_delay_ms: Some(DEFAULT_REDISTRIBUTION_DELAY_MS),
            last_value_queue: Some(false),
            send_to_dla_on_no_route: Some(false),
            address_full_policy: Some(AddressFullPolicy::default()),
        }
    }

    pub fn with_dead_letter_address(mut self, address: impl Into<String>) -> Self {
        self.dead_letter_address = Some(address.into());
        self
    }

    pub fn with_expiry_address(mut self, address: impl Into<String>) -> Self {
        self.expiry_address = Some(address.into());
        self
    }

    pub fn with_max_delivery_attempts(mut self, attempts: u32) -> Self {
        self.max_delivery_attempts = Some(attempts);
        self
    }

    pub fn with_max_size_bytes(mut self, bytes: i64) -> Self {
        self.max_size_bytes = Some(bytes);
        self
    }

    pub fn with_redelivery_delay_ms(mut self, delay: u64) -> Self {
        self.redelivery_delay_ms = Some(delay);
        self
    }

    pub fn with_last_value_queue(mut self, enabled: bool) -> Self {
        self.last_value_queue = Some(enabled);
        self
    }

    pub fn with_send_to_dla_on_no_route(mut self, enabled: bool) -> Self {
        self.send_to_dla_on_no_route = Some(enabled);
        self
    }

    pub fn with_address_full_policy(mut self, policy: AddressFullPolicy) -> Self {
        self.address_full_policy = Some(policy);
        self
    }

    pub fn max_delivery_attempts(&self) -> u32 {
        self.max_delivery_attempts.unwrap_or(DEFAULT_MAX_DELIVERY_ATTEMPTS)
    }

    pub fn max_size_bytes(&self) -> i64 {
        self.max_size_bytes.unwrap_or(DEFAULT_MAX_SIZE_BYTES)
    }

    pub fn page_size_bytes(&self) -> i64 {
        self.page_size_bytes.unwrap_or(DEFAULT_PAGE_SIZE_BYTES)
    }

    pub fn redelivery_delay_ms(&self) -> u64 {
        self.redelivery_delay_ms.unwrap_or(DEFAULT_REDELIVERY_DELAY_MS)
    }

    pub fn redistribution_delay_ms(&self) -> i64 {
        self.redistribution_delay_ms.unwrap_or(DEFAULT_REDISTRIBUTION_DELAY_MS)
    }

    pub fn is_last_value_queue(&self) -> bool {
        self.last_value_queue.unwrap_or(false)
    }

    pub fn is_send_to_dla_on_no_route(&self) -> bool {
        self.send_to_dla_on_no_route.unwrap_or(false)
    }

    pub fn address_full_policy(&self) -> AddressFullPolicy {
        self.address_full_policy.unwrap_or_default()
    }

    /// True when no field is set.
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

fn inherit<T: Clone>(slot: &mut Option<T>, from: &Option<T>) {
    if slot.is_none() {
        slot.clone_from(from);
    }
}

impl Mergeable for AddressSettings {
    fn merge(&mut self, less_specific: &Self) {
        inherit(&mut self.dead_letter_address, &less_specific.dead_letter_address);
        inherit(&mut self.expiry_address, &less_specific.expiry_address);
        inherit(
            &mut self.max_delivery_attempts,
            &less_specific.max_delivery_attempts,
        );
        inherit(&mut self.max_size_bytes, &less_specific.max_size_bytes);
        inherit(&mut self.page_size_bytes, &less_specific.page_size_bytes);
        inherit(
            &mut self.redelivery_delay_ms,
            &less_specific.redelivery_delay_ms,
        );
        inherit(
            &mut self.redistribution_delay_ms,
            &less_specific.redistribution_delay_ms,
        );
        inherit(&mut self.last_value_queue, &less_specific.last_value_queue);
        inherit(
            &mut self.send_to_dla_on_no_route,
            &less_specific.send_to_dla_on_no_route,
        );
        inherit(
            &mut self.address_full_policy,
            &less_specific.address_full_policy,
        );
    }
}
