use thiserror::Error;

#[derive(Error, Debug)]
pub enum Quack2TexError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Capture error: {0}")]
    Capture(String),

    #[error("LLM error: {0}")]
    Llm(String),

    #[error("Worker error: {0}")]
    Worker(String),

    #[error("UI error: {0}")]
    Ui(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display_config() {
        let err = Quack2TexError::Config("bad value".to_string());
        assert_eq!(err.to_string(), "Configuration error: bad value");
    }

    #[test]
    fn test_error_display_storage() {
        let err = Quack2TexError::Storage("locked".to_string());
        assert_eq!(err.to_string(), "Storage error: locked");
    }

    #[test]
    fn test_error_display_capture() {
        let err = Quack2TexError::Capture("clipboard is empty".to_string());
        assert_eq!(err.to_string(), "Capture error: clipboard is empty");
    }

    #[test]
    fn test_error_display_llm() {
        let err = Quack2TexError::Llm("timeout".to_string());
        assert_eq!(err.to_string(), "LLM error: timeout");
    }

    #[test]
    fn test_error_display_worker() {
        let err = Quack2TexError::Worker("pool shut down".to_string());
        assert_eq!(err.to_string(), "Worker error: pool shut down");
    }

    #[test]
    fn test_error_from_io() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let err: Quack2TexError = io_err.into();
        assert!(err.to_string().contains("file not found"));
    }
}
