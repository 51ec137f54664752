use crate::account::AccountId;
use crate::party::PublicKey;

/// A violated ledger rule. The `Display` text of each variant is the literal rule
/// description and is relied upon by callers matching on substrings.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    // arity
    #[error("No inputs should be consumed")]
    InputsConsumed,
    #[error("No outputs should be created")]
    OutputsCreated,
    #[error("A single account must be consumed")]
    SingleInputRequired,
    #[error("A single account must be created")]
    SingleOutputRequired,

    // signers
    #[error("All participants have signed the transaction")]
    ParticipantsNotSigned,
    #[error("The regulator has signed the transaction")]
    RegulatorNotSigned,
    #[error("The previous supplier has signed the transaction")]
    PreviousSupplierNotSigned,

    // mandatory customer fields
    #[error("Name is populated")]
    NameMissing,
    #[error("Date Of Birth is valid")]
    InvalidDateOfBirth,
    #[error("Address is populated")]
    AddressMissing,

    // lineage
    #[error("The account id must be the same")]
    AccountIdChanged,
    #[error("The regulator must be the same")]
    RegulatorChanged,
    #[error("The old and new supplier must be the same")]
    SupplierChanged,
    #[error("The old and new supplier must differ")]
    SupplierUnchanged,
    #[error("The customer details must be the same")]
    CustomerChanged,

    // meter readings
    #[error("There are no meter readings")]
    MeterReadingsPresent,
    #[error("The meter readings must be the same")]
    MeterReadingsChanged,
    #[error("There must be exactly one more reading")]
    ReadingCountMismatch,
    #[error("The time of the new reading must be greater than the previous reading")]
    ReadingTimeNotIncreasing,
    #[error("The value of the new reading must be greater than the previous reading")]
    ReadingValueNotIncreasing,
    #[error("The meter reading history must be the same")]
    ReadingHistoryChanged,

    // billing entries
    #[error("There are no billing entries")]
    BillingEntriesPresent,
    #[error("There must be exactly one more entry")]
    EntryCountMismatch,
    #[error("The time of the new entry must be greater than the previous entry")]
    EntryTimeNotIncreasing,
    #[error("The billing history must be the same")]
    BillingHistoryChanged,
    #[error("The running balance must equal the previous balance plus the amount")]
    RunningBalanceMismatch,
    #[error("The billing entry must be issued by the current supplier")]
    EntryIssuerMismatch,
}

/// Problems with the signatures attached to a transition.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum SignatureError {
    #[error("Transition id does not match its contents")]
    IdMismatch,
    #[error("Invalid signature from {0}")]
    Invalid(PublicKey),
    #[error("Signature from {0} who is not a required signer")]
    UnexpectedSigner(PublicKey),
    #[error("Missing signatures from: {}", .0.join(", "))]
    Missing(Vec<String>),
}

/// A running balance or charge outside the range an amount can hold.
#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("Amount overflows the supported range")]
pub struct AmountOverflow;

/// Failures of a party-to-party session.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum SessionError {
    #[error("No session can be opened with {0}")]
    Unreachable(String),
    #[error("Session with {0} closed")]
    Closed(String),
}

/// Failures of the sled-backed record store.
#[derive(thiserror::Error, Debug)]
pub enum StoreError {
    #[error("Storage backend failure: {0}")]
    Backend(#[from] sled::Error),
    #[error("Failed to encode stored version: {0}")]
    Encode(String),
    #[error("Failed to decode stored version: {0}")]
    Decode(#[from] minicbor::decode::Error),
    #[error("Version {0} is not the current unconsumed version")]
    Conflict(String),
}

/// Errors surfaced by account operations.
#[derive(thiserror::Error, Debug)]
pub enum AccountError {
    #[error("{0}")]
    Validation(#[from] ValidationError),
    #[error("Account with id {0} not found.")]
    NotFound(AccountId),
    #[error("Authorization failed: {0}")]
    Authorization(String),
    #[error("Transport failure: {0}")]
    Transport(String),
    #[error("Invalid request: {0}")]
    InvalidRequest(String),
    #[error(transparent)]
    Storage(#[from] StoreError),
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

// a missing or bad counter-signature is an authorization failure to callers
impl From<SignatureError> for AccountError {
    fn from(value: SignatureError) -> Self {
        AccountError::Authorization(value.to_string())
    }
}

impl From<AmountOverflow> for AccountError {
    fn from(value: AmountOverflow) -> Self {
        AccountError::InvalidRequest(value.to_string())
    }
}

impl AccountError {
    /// The violated rule, when this is a validation failure.
    pub fn validation(&self) -> Option<&ValidationError> {
        match self {
            AccountError::Validation(e) => Some(e),
            _ => None,
        }
    }
}
