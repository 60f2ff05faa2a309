//! Send-error classification.
//!
//! Nodes of different clients phrase the same rejection differently. The
//! phrasing lives in per-client [`ClientErrors`] pattern tables held by an
//! [`ErrorPatterns`] registry; [`SendErrorClassifier`] applies a fixed
//! decision table on top of it to produce one [`SendOutcome`] per send.

use std::collections::HashMap;
use std::sync::Arc;

use chainclient_core::{BroadcastError, TransportError};
use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Version of the built-in pattern tables. Bumped whenever a table changes.
pub const PATTERN_TABLE_VERSION: u32 = 1;

// ─── Taxonomy ─────────────────────────────────────────────────────────────────

/// What the node said about a rejected transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SendErrorKind {
    NonceTooLow,
    NonceTooHigh,
    ReplacementUnderpriced,
    /// The node's queue is full at this fee; the transaction may get in later.
    TemporarilyUnderpriced,
    AlreadyInMempool,
    AlreadyMined,
    TerminallyUnderpriced,
    InsufficientFunds,
    TxFeeExceedsCap,
    L2FeeTooLow,
    L2FeeTooHigh,
    L2Full,
    Timeout,
    Fatal,
}

impl std::fmt::Display for SendErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::NonceTooLow => "nonce_too_low",
            Self::NonceTooHigh => "nonce_too_high",
            Self::ReplacementUnderpriced => "replacement_underpriced",
            Self::TemporarilyUnderpriced => "temporarily_underpriced",
            Self::AlreadyInMempool => "already_in_mempool",
            Self::AlreadyMined => "already_mined",
            Self::TerminallyUnderpriced => "terminally_underpriced",
            Self::InsufficientFunds => "insufficient_funds",
            Self::TxFeeExceedsCap => "tx_fee_exceeds_cap",
            Self::L2FeeTooLow => "l2_fee_too_low",
            Self::L2FeeTooHigh => "l2_fee_too_high",
            Self::L2Full => "l2_full",
            Self::Timeout => "timeout",
            Self::Fatal => "fatal",
        };
        f.write_str(s)
    }
}

/// The result of one send attempt, as consumed by the transaction manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SendOutcome {
    /// Accepted, or an equivalent transaction already was. Hand off to confirmation.
    Successful,
    /// Raise the fee and resend.
    Underpriced,
    /// An L2-only error on a chain that is not an L2.
    Unsupported,
    /// Resend the same attempt later.
    Retryable,
    /// Rejected for good by every endpoint. Never resend.
    Fatal,
    /// May or may not have been accepted. Monitor, do not resend or abandon.
    Unknown,
}

impl std::fmt::Display for SendOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Successful => "Successful",
            Self::Underpriced => "Underpriced",
            Self::Unsupported => "Unsupported",
            Self::Retryable => "Retryable",
            Self::Fatal => "Fatal",
            Self::Unknown => "Unknown",
        };
        f.write_str(s)
    }
}

// ─── SendError ────────────────────────────────────────────────────────────────

/// A failed broadcast: the rejection text of every endpoint that answered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SendError {
    messages: Vec<String>,
    timed_out: bool,
    context: Vec<String>,
}

impl SendError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            messages: vec![message.into()],
            timed_out: false,
            context: Vec::new(),
        }
    }

    /// A send that timed out before any node answered.
    pub fn timed_out(message: impl Into<String>) -> Self {
        Self {
            timed_out: true,
            ..Self::new(message)
        }
    }

    /// Wrap with a context message, outermost first.
    pub fn context(mut self, context: impl Into<String>) -> Self {
        self.context.insert(0, context.into());
        self
    }

    pub fn messages(&self) -> &[String] {
        &self.messages
    }

    pub fn is_timeout(&self) -> bool {
        self.timed_out
    }
}

impl std::fmt::Display for SendError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for ctx in &self.context {
            write!(f, "{ctx}: ")?;
        }
        f.write_str(&self.messages.join("; "))
    }
}

impl std::error::Error for SendError {}

impl From<&TransportError> for SendError {
    fn from(err: &TransportError) -> Self {
        Self {
            messages: vec![err.node_message()],
            timed_out: err.is_timeout(),
            context: Vec::new(),
        }
    }
}

impl From<TransportError> for SendError {
    fn from(err: TransportError) -> Self {
        Self::from(&err)
    }
}

impl From<&BroadcastError> for SendError {
    fn from(err: &BroadcastError) -> Self {
        if err.no_targets() {
            return Self::new("no endpoint available to broadcast to");
        }
        Self {
            messages: err.failures.iter().map(|f| f.error.node_message()).collect(),
            timed_out: err.failures.iter().any(|f| f.error.is_timeout()),
            context: Vec::new(),
        }
    }
}

impl From<BroadcastError> for SendError {
    fn from(err: BroadcastError) -> Self {
        Self::from(&err)
    }
}

// ─── Pattern tables ───────────────────────────────────────────────────────────

/// Errors raised while building pattern tables.
#[derive(Debug, Error)]
pub enum PatternError {
    #[error("invalid pattern table JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("client '{client}': invalid {kind} pattern: {source}")]
    Regex {
        client: String,
        kind: SendErrorKind,
        #[source]
        source: regex::Error,
    },
}

/// How one node client phrases each kind of rejection.
#[derive(Debug, Clone)]
pub struct ClientErrors {
    name: String,
    patterns: HashMap<SendErrorKind, Regex>,
}

impl ClientErrors {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            patterns: HashMap::new(),
        }
    }

    /// Add (or replace) the pattern for `kind`.
    pub fn with(mut self, kind: SendErrorKind, pattern: &str) -> Result<Self, PatternError> {
        let re = Regex::new(pattern).map_err(|source| PatternError::Regex {
            client: self.name.clone(),
            kind,
            source,
        })?;
        self.patterns.insert(kind, re);
        Ok(self)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn matches(&self, kind: SendErrorKind, message: &str) -> bool {
        self.patterns
            .get(&kind)
            .is_some_and(|re| re.is_match(message))
    }
}

#[derive(Deserialize)]
struct TableFile {
    #[serde(default)]
    version: Option<u32>,
    clients: Vec<TableEntry>,
}

#[derive(Deserialize)]
struct TableEntry {
    name: String,
    patterns: HashMap<SendErrorKind, String>,
}

/// A versioned set of client pattern tables.
#[derive(Debug, Clone)]
pub struct ErrorPatterns {
    version: u32,
    clients: Vec<ClientErrors>,
}

type Table = (&'static str, &'static [(SendErrorKind, &'static str)]);

const BUILTIN_TABLES: &[Table] = {
    use SendErrorKind::*;
    &[
        ("geth", &[
            (NonceTooLow, r"(: |^)nonce too low(:|$)"),
            (NonceTooHigh, r"(: |^)nonce too high(:|$)"),
            (ReplacementUnderpriced, r"(: |^)replacement transaction underpriced$"),
            (AlreadyInMempool, r"(: |^)(?i)(known transaction|already known)"),
            (TerminallyUnderpriced, r"(: |^)transaction underpriced$"),
            (InsufficientFunds, r"(: |^)(insufficient funds for transfer|insufficient funds for gas \* price \+ value|insufficient balance for transfer)(:|$)"),
            (TxFeeExceedsCap, r"(: |^)tx fee \([0-9\.]+ [a-zA-Z]+\) exceeds the configured cap \([0-9\.]+ [a-zA-Z]+\)$"),
            (Fatal, r"(: |^)(exceeds block gas limit|invalid sender|negative value|oversized data|gas uint64 overflow|intrinsic gas too low)$"),
        ]),
        ("erigon", &[
            (NonceTooLow, r"(: |^)nonce too low$"),
            (NonceTooHigh, r"(: |^)nonce too high$"),
            (ReplacementUnderpriced, r"(: |^)replacement transaction underpriced$"),
            (AlreadyInMempool, r"(: |^)(block already contains this transaction|known transaction|already known)$"),
            (TerminallyUnderpriced, r"(: |^)transaction underpriced$"),
            (InsufficientFunds, r"(: |^)(insufficient funds for gas \* price \+ value|insufficient balance for transfer)$"),
            (TxFeeExceedsCap, r"(: |^)tx fee \([0-9\.]+ [a-zA-Z]+\) exceeds the configured cap \([0-9\.]+ [a-zA-Z]+\)$"),
            (Fatal, r"(: |^)(exceeds block gas limit|invalid sender|negative value|oversized data|gas uint64 overflow|intrinsic gas too low)$"),
        ]),
        ("besu", &[
            (NonceTooLow, r"^Nonce too low$"),
            (ReplacementUnderpriced, r"^Replacement transaction underpriced$"),
            (AlreadyInMempool, r"^Known transaction$"),
            (TerminallyUnderpriced, r"^Gas price below configured minimum gas price$"),
            (InsufficientFunds, r"^Upfront cost exceeds account balance$"),
            (TxFeeExceedsCap, r"^Transaction fee cap exceeded$"),
            (Fatal, r"^(Intrinsic gas exceeds gas limit|Transaction gas limit exceeds block gas limit|Invalid signature)$"),
        ]),
        ("parity", &[
            (NonceTooLow, r"^Transaction nonce is too low\. Try incrementing the nonce\.$"),
            (ReplacementUnderpriced, r"^Transaction gas price .+is too low\. There is another transaction with same nonce in the queue"),
            (TemporarilyUnderpriced, r"There are too many transactions in the queue\. Your transaction was dropped due to limit\. Try increasing the fee\."),
            (AlreadyInMempool, r"Transaction with the same hash was already imported\.$"),
            (TerminallyUnderpriced, r"^Transaction gas price is too low\. It does not satisfy your node's minimal gas price"),
            (InsufficientFunds, r"^(Insufficient funds\. The account you tried to send transaction from does not have enough funds\.|Insufficient balance for transaction\.)"),
            (Fatal, r"^(Transaction gas is too low\. There is not enough gas to cover minimal cost of the transaction|Transaction cost exceeds current gas limit\. Limit:|Invalid signature|Invalid RLP data|Transaction is not permitted|Invalid chain id|Sender is banned in local queue\.|Recipient is banned in local queue\.|Code is banned in local queue\.|Transaction gas limit exceeds block gas limit)"),
        ]),
        ("arbitrum", &[
            (NonceTooLow, r"(: |^)invalid transaction nonce$|(: |^)nonce too low(:|$)"),
            (NonceTooHigh, r"(: |^)nonce too high(:|$)"),
            (TerminallyUnderpriced, r"(: |^)gas price too low$"),
            (InsufficientFunds, r"(: |^)(not enough funds for gas|insufficient funds for gas \* price \+ value)"),
            (L2FeeTooLow, r"(: |^)max fee per gas less than block base fee(:|$)"),
            (L2Full, r"(: |^)(queue full|sequencer pending tx pool full, please try again)(:|$)"),
            (Fatal, r"(: |^)(invalid message format|forbidden sender address)$|(: |^)(execution reverted)(:|$)"),
        ]),
        ("optimism", &[
            (L2FeeTooLow, r"(: |^)fee too low: \d+, use at least tx\.gasLimit = \d+ and tx\.gasPrice = \d+$"),
            (L2FeeTooHigh, r"(: |^)fee too high: \d+, use less than \d+ \* [0-9\.]+$"),
        ]),
        ("metis", &[
            (L2FeeTooLow, r"(: |^)gas price too low: \d+ wei, use at least tx\.gasPrice = \d+ wei$"),
        ]),
        ("substrate", &[
            (NonceTooLow, r"(: |^)Pool\(Stale\)$"),
            (AlreadyInMempool, r"(: |^)(Pool\(AlreadyImported\)|already known)$"),
        ]),
        ("avalanche", &[
            (NonceTooLow, r"(: |^)nonce too low: address 0x[0-9a-fA-F]{40} current nonce \(\d+\) > tx nonce \(\d+\)$"),
        ]),
        ("nethermind", &[
            (NonceTooLow, r"(: |^)OldNonce(,|:|$)"),
            (NonceTooHigh, r"(: |^)NonceGap(,|:|$)"),
            (AlreadyInMempool, r"(: |^)(AlreadyKnown|OwnNonceAlreadyUsed)(,|:|$)"),
            (TerminallyUnderpriced, r"(: |^)(FeeTooLow|FeeTooLowToCompete)(,|:|$)"),
            (InsufficientFunds, r"(: |^)InsufficientFunds(,|:|$)"),
            (Fatal, r"(: |^)(Invalid|GasLimitExceeded|NotSupportedTxType|TxTypeNotSupported)(,|:|$)"),
        ]),
        ("harmony", &[
            (AlreadyMined, r"(: |^)transaction already finalized$"),
        ]),
        ("zksync", &[
            (NonceTooLow, r"(: |^)nonce too low\..+actual: \d*$"),
            (NonceTooHigh, r"(: |^)nonce too high\..+actual: \d*$"),
            (TerminallyUnderpriced, r"(: |^)max fee per gas less than block base fee$"),
            (InsufficientFunds, r"(: |^)(insufficient balance for transfer$|insufficient funds for gas \+ value)"),
            (TxFeeExceedsCap, r"(: |^)max priority fee per gas higher than max fee per gas$"),
            (Fatal, r"(: |^)(exceeds block gas limit|intrinsic gas too low|Not enough gas for transaction validation|Failed to pay the fee to the operator|Transaction is not signed correctly)$"),
        ]),
        ("transport", &[
            (Timeout, r"(?i)(context deadline exceeded|request timed out|i/o timeout)"),
        ]),
    ]
};

lazy_static! {
    static ref BUILTIN: ErrorPatterns = ErrorPatterns::from_tables(BUILTIN_TABLES);
}

impl ErrorPatterns {
    /// A registry with no client tables.
    pub fn empty() -> Self {
        Self {
            version: PATTERN_TABLE_VERSION,
            clients: Vec::new(),
        }
    }

    /// The built-in tables for every supported node client.
    pub fn builtin() -> &'static ErrorPatterns {
        &BUILTIN
    }

    fn from_tables(tables: &[Table]) -> Self {
        let mut patterns = Self::empty();
        for (name, entries) in tables {
            let mut client = ClientErrors::new(*name);
            for (kind, pattern) in entries.iter() {
                client = match client.clone().with(*kind, pattern) {
                    Ok(c) => c,
                    Err(e) => {
                        tracing::error!(error = %e, "skipping invalid built-in send error pattern");
                        client
                    }
                };
            }
            patterns.register(client);
        }
        patterns
    }

    pub fn version(&self) -> u32 {
        self.version
    }

    /// Add a client table, replacing any table with the same name.
    pub fn register(&mut self, client: ClientErrors) {
        self.clients.retain(|c| c.name != client.name);
        self.clients.push(client);
    }

    /// Load client tables from JSON and register them.
    ///
    /// Expected format:
    /// `{ "version": 2, "clients": [{ "name": "...", "patterns": { "nonce_too_low": "..." } }] }`
    pub fn load_json(&mut self, json: &str) -> Result<usize, PatternError> {
        let file: TableFile = serde_json::from_str(json)?;
        let mut loaded = Vec::with_capacity(file.clients.len());
        for entry in file.clients {
            let mut client = ClientErrors::new(entry.name);
            for (kind, pattern) in &entry.patterns {
                client = client.with(*kind, pattern)?;
            }
            loaded.push(client);
        }
        let count = loaded.len();
        for client in loaded {
            self.register(client);
        }
        if let Some(version) = file.version {
            self.version = self.version.max(version);
        }
        Ok(count)
    }

    pub fn client_names(&self) -> impl Iterator<Item = &str> {
        self.clients.iter().map(|c| c.name())
    }

    /// Name of the first client whose `kind` pattern matches `message`.
    pub fn matching_client(&self, kind: SendErrorKind, message: &str) -> Option<&str> {
        self.clients
            .iter()
            .find(|c| c.matches(kind, message))
            .map(|c| c.name())
    }

    pub fn matches(&self, kind: SendErrorKind, message: &str) -> bool {
        self.matching_client(kind, message).is_some()
    }
}

impl Default for ErrorPatterns {
    fn default() -> Self {
        Self::builtin().clone()
    }
}

// ─── Classifier ───────────────────────────────────────────────────────────────

/// A classification with the error kind that decided it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Classification {
    pub outcome: SendOutcome,
    /// `None` for a successful send or an unrecognised error.
    pub kind: Option<SendErrorKind>,
}

impl Classification {
    fn new(outcome: SendOutcome, kind: Option<SendErrorKind>) -> Self {
        Self { outcome, kind }
    }
}

/// Rejections that mean the transaction (or an equivalent one) is already in.
const ACCEPTED_KINDS: [SendErrorKind; 5] = [
    SendErrorKind::NonceTooLow,
    SendErrorKind::AlreadyMined,
    SendErrorKind::ReplacementUnderpriced,
    SendErrorKind::AlreadyInMempool,
    SendErrorKind::TemporarilyUnderpriced,
];

const L2_FEE_KINDS: [SendErrorKind; 3] = [
    SendErrorKind::L2FeeTooLow,
    SendErrorKind::L2FeeTooHigh,
    SendErrorKind::L2Full,
];

/// Maps a send error onto a [`SendOutcome`].
///
/// The decision depends only on the error text, the timeout flag and whether
/// the chain is an L2; never on which endpoint answered.
#[derive(Debug, Clone, Default)]
pub struct SendErrorClassifier {
    patterns: Arc<ErrorPatterns>,
}

impl SendErrorClassifier {
    pub fn new(patterns: ErrorPatterns) -> Self {
        Self {
            patterns: Arc::new(patterns),
        }
    }

    pub fn patterns(&self) -> &ErrorPatterns {
        &self.patterns
    }

    /// Returns `true` if any endpoint's rejection is of `kind`.
    pub fn is(&self, err: &SendError, kind: SendErrorKind) -> bool {
        if kind == SendErrorKind::Timeout && err.timed_out {
            return true;
        }
        err.messages.iter().any(|m| self.patterns.matches(kind, m))
    }

    /// Returns `true` if every endpoint rejected the transaction for good.
    pub fn is_fatal(&self, err: &SendError) -> bool {
        !err.messages.is_empty()
            && err
                .messages
                .iter()
                .all(|m| self.patterns.matches(SendErrorKind::Fatal, m))
    }

    pub fn classify(&self, err: Option<&SendError>, chain_is_l2: bool) -> SendOutcome {
        self.classify_detailed(err, chain_is_l2).outcome
    }

    /// First matching rule wins.
    pub fn classify_detailed(&self, err: Option<&SendError>, chain_is_l2: bool) -> Classification {
        use SendErrorKind as K;
        use SendOutcome as O;

        let Some(err) = err else {
            return Classification::new(O::Successful, None);
        };
        if let Some(kind) = ACCEPTED_KINDS.into_iter().find(|k| self.is(err, *k)) {
            return Classification::new(O::Successful, Some(kind));
        }
        if self.is(err, K::TerminallyUnderpriced) {
            return Classification::new(O::Underpriced, Some(K::TerminallyUnderpriced));
        }
        if let Some(kind) = L2_FEE_KINDS.into_iter().find(|k| self.is(err, *k)) {
            let outcome = if chain_is_l2 { O::Underpriced } else { O::Unsupported };
            return Classification::new(outcome, Some(kind));
        }
        for kind in [K::NonceTooHigh, K::InsufficientFunds, K::Timeout] {
            if self.is(err, kind) {
                return Classification::new(O::Retryable, Some(kind));
            }
        }
        if self.is_fatal(err) {
            return Classification::new(O::Fatal, Some(K::Fatal));
        }
        // a fee cap rejection still falls through to Unknown: another node
        // with a higher cap may have accepted the transaction
        let kind = self.is(err, K::TxFeeExceedsCap).then_some(K::TxFeeExceedsCap);
        Classification::new(O::Unknown, kind)
    }
}

/// Classify with the built-in pattern tables.
pub fn classify(err: Option<&SendError>, chain_is_l2: bool) -> SendOutcome {
    lazy_static! {
        static ref DEFAULT: SendErrorClassifier = SendErrorClassifier::default();
    }
    DEFAULT.classify(err, chain_is_l2)
}
