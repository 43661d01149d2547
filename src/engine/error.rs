use ulid::Ulid;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineError {
    InvalidRange,
    InvalidQuantity { requested: u32, total_units: Option<u32> },
    InvalidGuests(&'static str),
    NotFound(Ulid),
    Unauthorized,
    InsufficientCapacity { requested: u32, available: u32 },
    AlreadyExists(Ulid),
    LimitExceeded(&'static str),
    PersistenceError(String),
}

impl EngineError {
    /// HTTP-class status for the logical operation that failed.
    pub fn status_code(&self) -> u16 {
        match self {
            EngineError::InvalidRange
            | EngineError::InvalidQuantity { .. }
            | EngineError::InvalidGuests(_)
            | EngineError::LimitExceeded(_) => 400,
            EngineError::Unauthorized => 401,
            EngineError::NotFound(_) => 404,
            EngineError::InsufficientCapacity { .. } | EngineError::AlreadyExists(_) => 409,
            EngineError::PersistenceError(_) => 500,
        }
    }

    /// SQLSTATE reported to pgwire clients.
    pub fn sqlstate(&self) -> &'static str {
        match self {
            EngineError::InvalidRange
            | EngineError::InvalidQuantity { .. }
            | EngineError::InvalidGuests(_) => "22023",
            EngineError::LimitExceeded(_) => "54000",
            EngineError::Unauthorized => "28000",
            EngineError::NotFound(_) => "P0002",
            EngineError::InsufficientCapacity { .. } => "23P01",
            EngineError::AlreadyExists(_) => "23505",
            EngineError::PersistenceError(_) => "58030",
        }
    }

    /// Only infrastructure faults may be retried, and only by re-running the whole admission.
    pub fn is_retryable(&self) -> bool {
        matches!(self, EngineError::PersistenceError(_))
    }

    /// Short label for metrics.
    pub fn label(&self) -> &'static str {
        match self {
            EngineError::InvalidRange => "invalid_range",
            EngineError::InvalidQuantity { .. } => "invalid_quantity",
            EngineError::InvalidGuests(_) => "invalid_guests",
            EngineError::NotFound(_) => "not_found",
            EngineError::Unauthorized => "unauthorized",
            EngineError::InsufficientCapacity { .. } => "insufficient_capacity",
            EngineError::AlreadyExists(_) => "already_exists",
            EngineError::LimitExceeded(_) => "limit_exceeded",
            EngineError::PersistenceError(_) => "persistence_error",
        }
    }
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineError::InvalidRange => write!(f, "invalid date range: checkin must be before checkout"),
            EngineError::InvalidQuantity { requested, total_units: Some(total) } => {
                write!(f, "invalid quantity {requested}: room has {total} units")
            }
            EngineError::InvalidQuantity { requested, total_units: None } => {
                write!(f, "invalid quantity {requested}: must be at least 1")
            }
            EngineError::InvalidGuests(msg) => write!(f, "invalid guest details: {msg}"),
            EngineError::NotFound(id) => write!(f, "not found: {id}"),
            EngineError::Unauthorized => write!(f, "unauthorized: booking requires an authenticated guest"),
            EngineError::InsufficientCapacity { requested, available } => {
                write!(
                    f,
                    "insufficient capacity: requested {requested}, {available} available for these dates"
                )
            }
            EngineError::AlreadyExists(id) => write!(f, "already exists: {id}"),
            EngineError::LimitExceeded(msg) => write!(f, "limit exceeded: {msg}"),
            EngineError::PersistenceError(e) => write!(f, "persistence error: {e}"),
        }
    }
}

impl std::error::Error for EngineError {}
