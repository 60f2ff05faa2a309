//! chainclient-evm: EVM chain client on top of the chainclient pool.
//!
//! - [`Client`]: balances, heads, receipts, logs, sends and subscriptions
//! - [`SendErrorClassifier`]: maps node rejections onto a [`SendOutcome`]
//! - [`HeadForwarder`]: relays `newHeads` stamped with the local chain id
//! - [`types`]: EVM JSON-RPC data types
//! - [`format_units`] / [`DecCoin`]: fixed-point amount rendering
//!
//! # Example
//!
//! ```rust,no_run
//! use chainclient_evm::{classify, SendError, SendOutcome};
//!
//! let err = SendError::new("already known");
//! assert_eq!(classify(Some(&err), false), SendOutcome::Successful);
//! ```

pub mod client;
pub mod send_error;
pub mod subscription;
pub mod types;
pub mod units;

pub use client::{balance_of_calldata, Client, BALANCE_OF_SELECTOR};
pub use send_error::{
    classify, Classification, ClientErrors, ErrorPatterns, PatternError, SendError,
    SendErrorClassifier, SendErrorKind, SendOutcome, PATTERN_TABLE_VERSION,
};
pub use subscription::{HeadForwarder, HeadSubscription, LogForwarder, Subscription};
pub use types::{
    to_block_number_arg, Block, CallArgs, Head, Header, Log, LogFilter, SignedTransaction,
    Transaction, TransactionReceipt,
};
pub use units::{format_units, DecCoin};
