//! Subscription contract state machine.
//!
//! The deployed contract is the source of truth; this is its executable model. An inbound
//! transfer whose amount exactly matches a price buys `(tier, now + period)` and replaces
//! whatever record the sender had. Any other amount is rejected with exit code 101 and
//! bounced in full. The `get_subscription` getter never mutates state.
//!
//! [ContractLedger] serves the model through [LedgerQuery] so the reconciler can run against
//! it in-process.

use crate::abi::{encode_subscription, DecodedSubscription, StackEntry, StackValue, TAG_ADDR};
use crate::query::{GetMethodResult, LedgerQuery, QueryError};
use crate::tier::{PriceTierTable, Tier, SUBSCRIPTION_PERIOD_SECS};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::RwLock;

/// Application exit code for a transfer that matches no price.
pub const EXIT_INVALID_PAYMENT_AMOUNT: i32 = 101;
/// VM exit code for a getter that does not exist.
pub const EXIT_UNKNOWN_METHOD: i32 = 11;
/// VM exit code for a missing or ill-typed getter argument.
pub const EXIT_TYPE_CHECK: i32 = 7;

/// Getter name for the subscription read path.
pub const GET_SUBSCRIPTION: &str = "get_subscription";

/// Inbound value transfer (no payload).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transfer {
    pub sender: String,
    pub amount: u64,
}

/// Funds returned to the sender of a rejected transfer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Bounce {
    pub to: String,
    pub amount: u64,
}

/// Per-address record. Only ever written whole.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OnChainSubscription {
    pub tier: Tier,
    pub expires_at: u64,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ContractError {
    #[error("invalid payment amount {amount} from {}", bounce.to)]
    InvalidPaymentAmount { amount: u64, bounce: Bounce },
}

impl ContractError {
    pub fn exit_code(&self) -> i32 {
        match self {
            ContractError::InvalidPaymentAmount { .. } => EXIT_INVALID_PAYMENT_AMOUNT,
        }
    }

    pub fn bounce(&self) -> &Bounce {
        match self {
            ContractError::InvalidPaymentAmount { bounce, .. } => bounce,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SubscriptionContract {
    prices: PriceTierTable,
    period_secs: u64,
    records: HashMap<String, OnChainSubscription>,
}

impl SubscriptionContract {
    pub fn new(prices: PriceTierTable, period_secs: u64) -> Self {
        Self {
            prices,
            period_secs,
            records: HashMap::new(),
        }
    }

    pub fn prices(&self) -> &PriceTierTable {
        &self.prices
    }

    /// Handle an inbound transfer at time `now` (unix seconds).
    pub fn receive_transfer(
        &mut self,
        transfer: &Transfer,
        now: u64,
    ) -> Result<OnChainSubscription, ContractError> {
        let tier = self.prices.lookup(transfer.amount).ok_or_else(|| {
            ContractError::InvalidPaymentAmount {
                amount: transfer.amount,
                bounce: Bounce {
                    to: transfer.sender.clone(),
                    amount: transfer.amount,
                },
            }
        })?;
        let record = OnChainSubscription {
            tier,
            expires_at: now.saturating_add(self.period_secs),
        };
        self.records.insert(transfer.sender.clone(), record);
        Ok(record)
    }

    pub fn get_subscription(&self, address: &str) -> Option<OnChainSubscription> {
        self.records.get(address).copied()
    }

    /// Wire-level getter dispatch.
    pub fn run_get_method(&self, method: &str, args: &[StackEntry]) -> GetMethodResult {
        if method != GET_SUBSCRIPTION {
            return GetMethodResult {
                exit_code: EXIT_UNKNOWN_METHOD,
                stack: Vec::new(),
            };
        }
        let address = match args {
            [arg] => match arg.classify() {
                StackValue::Other(TAG_ADDR) => arg.value.as_str(),
                _ => return type_check_failure(),
            },
            _ => return type_check_failure(),
        };
        let decoded = match self.get_subscription(address) {
            Some(r) => DecodedSubscription {
                tier: r.tier,
                expires_at: r.expires_at,
            },
            None => DecodedSubscription::absent(),
        };
        GetMethodResult {
            exit_code: 0,
            stack: encode_subscription(&decoded),
        }
    }
}

fn type_check_failure() -> GetMethodResult {
    GetMethodResult {
        exit_code: EXIT_TYPE_CHECK,
        stack: Vec::new(),
    }
}

impl Default for SubscriptionContract {
    fn default() -> Self {
        Self::new(PriceTierTable::default(), SUBSCRIPTION_PERIOD_SECS)
    }
}

/// A deployed [SubscriptionContract] reachable through [LedgerQuery].
#[derive(Debug, Clone)]
pub struct ContractLedger {
    address: String,
    contract: Arc<RwLock<SubscriptionContract>>,
}

impl ContractLedger {
    pub fn new(address: impl Into<String>, contract: SubscriptionContract) -> Self {
        Self {
            address: address.into(),
            contract: Arc::new(RwLock::new(contract)),
        }
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    /// Deliver a transfer to the contract.
    pub async fn transfer(
        &self,
        transfer: &Transfer,
        now: u64,
    ) -> Result<OnChainSubscription, ContractError> {
        let result = self.contract.write().await.receive_transfer(transfer, now);
        match &result {
            Ok(r) => tracing::info!(
                sender = %transfer.sender,
                tier = %r.tier,
                expires_at = r.expires_at,
                "subscription purchased"
            ),
            Err(e) => tracing::warn!(
                sender = %transfer.sender,
                exit_code = e.exit_code(),
                reason = %e,
                "transfer bounced"
            ),
        }
        result
    }

    pub async fn get_subscription(&self, address: &str) -> Option<OnChainSubscription> {
        self.contract.read().await.get_subscription(address)
    }
}

#[async_trait]
impl LedgerQuery for ContractLedger {
    async fn query(
        &self,
        contract: &str,
        method: &str,
        args: &[StackEntry],
    ) -> Result<GetMethodResult, QueryError> {
        if contract != self.address {
            return Err(QueryError::Rejected(format!("unknown account {contract}")));
        }
        let result = self.contract.read().await.run_get_method(method, args);
        if result.exit_code != 0 {
            return Err(QueryError::ExitCode(result.exit_code));
        }
        Ok(result)
    }
}
