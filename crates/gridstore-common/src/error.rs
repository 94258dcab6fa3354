use thiserror::Error;

#[derive(Error, Debug)]
pub enum GridError {
    #[error("Seed decode error: {0}")]
    SeedDecode(String),

    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Request timeout after {0}ms")]
    Timeout(u64),
}

pub type Result<T> = std::result::Result<T, GridError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        assert_eq!(
            GridError::Connection("refused".to_string()).to_string(),
            "Connection error: refused"
        );
        assert_eq!(
            GridError::Timeout(30_000).to_string(),
            "Request timeout after 30000ms"
        );
    }
}
