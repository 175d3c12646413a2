use serde::{Deserialize, Serialize};

pub const INITIAL_COUNTER: i64 = 0;
pub const INITIAL_MESSAGE: &str = "initial";

pub const DEFAULT_PAGE: i64 = 1;
pub const DEFAULT_PAGE_SIZE: i64 = 10;
pub const MAX_PAGE_SIZE: i64 = 100;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DomainError {
    EmptyMutation,
    InvalidPage { page: i64 },
    InvalidPageSize { limit: i64 },
}

impl DomainError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::EmptyMutation | Self::InvalidPage { .. } | Self::InvalidPageSize { .. } => {
                "invalid_request"
            }
        }
    }
}

impl std::fmt::Display for DomainError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::EmptyMutation => write!(
                f,
                "at least one field (counter or message) must be provided"
            ),
            Self::InvalidPage { page } => write!(f, "invalid page: {page} (expected >= 1)"),
            Self::InvalidPageSize { limit } => {
                write!(f, "invalid limit: {limit} (expected 1..={MAX_PAGE_SIZE})")
            }
        }
    }
}

impl std::error::Error for DomainError {}

pub fn validate_page(page: i64) -> Result<(), DomainError> {
    if page < 1 {
        return Err(DomainError::InvalidPage { page });
    }
    Ok(())
}

pub fn validate_page_size(limit: i64) -> Result<(), DomainError> {
    if !(1..=MAX_PAGE_SIZE).contains(&limit) {
        return Err(DomainError::InvalidPageSize { limit });
    }
    Ok(())
}

/// The live value the service exposes. Always replaced as a whole.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct State {
    pub counter: i64,
    pub message: String,
}

impl Default for State {
    fn default() -> Self {
        Self {
            counter: INITIAL_COUNTER,
            message: INITIAL_MESSAGE.to_string(),
        }
    }
}

impl State {
    /// Returns a new state with the fields present in `req` replaced and the
    /// rest carried over from `self`.
    pub fn overlay(&self, req: &MutationRequest) -> State {
        State {
            counter: req.counter.unwrap_or(self.counter),
            message: req
                .message
                .clone()
                .unwrap_or_else(|| self.message.clone()),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct MutationRequest {
    #[serde(default)]
    pub counter: Option<i64>,
    #[serde(default)]
    pub message: Option<String>,
}

impl MutationRequest {
    pub fn counter(counter: i64) -> Self {
        Self {
            counter: Some(counter),
            message: None,
        }
    }

    pub fn message(message: impl Into<String>) -> Self {
        Self {
            counter: None,
            message: Some(message.into()),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.counter.is_none() && self.message.is_none()
    }

    pub fn validate(&self) -> Result<(), DomainError> {
        if self.is_empty() {
            return Err(DomainError::EmptyMutation);
        }
        Ok(())
    }
}
