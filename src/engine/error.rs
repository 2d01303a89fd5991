use ulid::Ulid;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineError {
    NotFound(Ulid),
    AlreadyExists(Ulid),
    /// Malformed teacher-entered data, rejected at write time so it never
    /// reaches slot computation.
    ConfigurationInvalid(&'static str),
    /// One or more requested intervals are no longer free. Recoverable:
    /// re-query slots and re-submit. Indices refer to the submitted
    /// selection list.
    SlotConflict { conflicting: Vec<usize> },
    /// Requested starts violate min-notice or max-horizon at commit time.
    /// Same recovery path as SlotConflict.
    PolicyViolation { violating: Vec<usize> },
    /// Calendar not enabled for this teacher; use the manual request flow.
    PolicyDisabled,
    /// External capture failed after reservation; the reservation has
    /// already been released. Retryable as a payment error.
    PaymentFailure(String),
    LimitExceeded(&'static str),
    WalError(String),
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineError::NotFound(id) => write!(f, "not found: {id}"),
            EngineError::AlreadyExists(id) => write!(f, "already exists: {id}"),
            EngineError::ConfigurationInvalid(msg) => {
                write!(f, "invalid configuration: {msg}")
            }
            EngineError::SlotConflict { conflicting } => {
                write!(f, "selections no longer free: {conflicting:?}")
            }
            EngineError::PolicyViolation { violating } => {
                write!(f, "selections outside the booking window: {violating:?}")
            }
            EngineError::PolicyDisabled => write!(f, "booking calendar disabled"),
            EngineError::PaymentFailure(reason) => {
                write!(f, "payment capture failed, reservation released: {reason}")
            }
            EngineError::LimitExceeded(msg) => write!(f, "limit exceeded: {msg}"),
            EngineError::WalError(e) => write!(f, "WAL error: {e}"),
        }
    }
}

impl std::error::Error for EngineError {}
