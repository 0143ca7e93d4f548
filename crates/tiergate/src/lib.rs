//! Off-chain Subscription runtime: getter polling, stack decoding, and entitlement
//! reconciliation for the Subscription contract.
//!
//! - **SubscriptionContract**: executable model of the on-chain state machine (exact-amount
//!   tier purchase, bounce with exit code 101 otherwise, read-only `get_subscription`).
//! - **HttpLedgerClient**: bounded, retry-free `runGetMethod` calls behind [LedgerQuery].
//! - **Reconciler**: polls every linked wallet, decodes the result stack, and merges into an
//!   [EntitlementStore] under a pluggable [MergePolicy] (default [PromoteOnly]).

pub mod abi;
pub mod address;
pub mod clock;
pub mod config;
pub mod contract;
pub mod merge;
pub mod query;
pub mod reconciler;
pub mod store;
pub mod tier;

pub use abi::{
    decode_subscription, encode_subscription, DecodeError, DecodedSubscription, StackEntry,
    MAX_EXPIRY,
};
pub use address::{AddressParseError, TonAddress};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::ReconcilerConfig;
pub use contract::{
    Bounce, ContractError, ContractLedger, OnChainSubscription, SubscriptionContract, Transfer,
    EXIT_INVALID_PAYMENT_AMOUNT, GET_SUBSCRIPTION,
};
pub use merge::{Authoritative, MergePolicy, PromoteOnly};
pub use query::{GetMethodResult, HttpLedgerClient, LedgerQuery, QueryError};
pub use reconciler::{
    AddressError, BuildError, CycleReport, FailedAddress, Reconciler, ReconcilerBuilder,
};
pub use store::{
    EntitlementRecord, EntitlementStore, MemoryStore, RowUpdate, SqliteStore, StoreError,
};
pub use tier::{PriceTierTable, Tier, UnknownTier, SUBSCRIPTION_PERIOD_SECS};
