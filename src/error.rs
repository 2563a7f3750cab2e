use thiserror::Error;

/// Failures the admission engine reports to its caller.
///
/// Everything else (remote outages, thin tokens, blocked re-entry) resolves
/// to a [`ScanOutcome`](crate::core::admission::ScanOutcome) instead.
#[derive(Error, Debug)]
pub enum AdmissionError {
    #[error("Local store failure: {0}")]
    Storage(#[from] anyhow::Error),

    #[error("No decision is pending for this scan session")]
    NoPendingDecision,
}

#[derive(Error, Debug, PartialEq)]
pub enum TokenError {
    #[error("Scanned token is empty")]
    Empty,

    #[error("Scanned token carries no participant id")]
    MissingId,
}

#[derive(Error, Debug)]
pub enum TransferError {
    #[error("Malformed transfer chunk: {0}")]
    Malformed(String),

    #[error("Part {part} of batch {batch} was already received")]
    DuplicatePart { batch: String, part: u32 },

    #[error("Part {part} is outside of batch {batch} (expected 1..={total})")]
    PartOutOfRange { batch: String, part: u32, total: u32 },

    #[error("Batch {batch} announced {expected} parts, chunk claims {found}")]
    TotalMismatch {
        batch: String,
        expected: u32,
        found: u32,
    },

    #[error("Chunk belongs to event '{chunk}' but this device is admitting '{current}'")]
    EventMismatch { chunk: String, current: String },

    #[error("Local store failure: {0}")]
    Storage(#[from] anyhow::Error),
}

#[derive(Error, Debug)]
pub enum RegistrationError {
    #[error("Missing required field: {0}")]
    MissingField(&'static str),

    #[error("Invalid {0}: {1}")]
    InvalidField(&'static str, String),

    #[error("A participant with this email or phone is already registered for {0}")]
    Duplicate(String),

    #[error("{0} is a paid event, confirm payment before admitting")]
    PaymentRequired(String),

    #[error("Local store failure: {0}")]
    Storage(#[from] anyhow::Error),
}

#[derive(Error, Debug)]
pub enum SheetError {
    #[error("Spreadsheet is missing the '{0}' column")]
    MissingColumn(&'static str),

    #[error("Spreadsheet has no header row")]
    Empty,

    #[error("IO Error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Local store failure: {0}")]
    Storage(#[from] anyhow::Error),
}
