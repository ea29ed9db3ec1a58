//! The `utils` module holds the pieces shared by every other module: the
//! error taxonomy and the logging bootstrap.

pub mod error;
pub mod logging;

pub use error::{ErrorClass, RelayError, Result, StorageError, TransportError};

#[cfg(test)]
mod tests {
    use super::error::{ErrorClass, RelayError, TransportError};
    use super::logging;

    #[test]
    fn logging_init_accepts_levels() {
        logging::init("info");
        logging::init("debug");
        logging::init("warn");
    }

    #[test]
    fn unknown_level_falls_back_to_info() {
        assert_eq!(logging::parse_level("verbose"), tracing::Level::INFO);
        assert_eq!(logging::parse_level("WARNING"), tracing::Level::WARN);
    }

    #[test]
    fn errors_map_to_response_classes() {
        assert_eq!(
            RelayError::validation("bad").class(),
            ErrorClass::BadInput
        );
        assert_eq!(
            RelayError::not_found("message", "42").class(),
            ErrorClass::NotFound
        );
        assert_eq!(
            RelayError::from(TransportError::NotConnected).class(),
            ErrorClass::Upstream
        );
    }

    #[test]
    fn not_found_names_kind_and_id() {
        let err = RelayError::not_found("webhook", "abc");
        assert!(err.is_not_found());
        assert_eq!(err.to_string(), "webhook 'abc' not found");
    }
}
