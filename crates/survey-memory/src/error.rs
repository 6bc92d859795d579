use relay_survey::SurveyTransportError;
use thiserror::Error;

/// An error that can occur when working with the in-memory survey fabric.
#[derive(Clone, Debug, Error)]
pub enum Error {
    /// The target node's handler panicked while answering.
    #[error("survey handler panicked")]
    HandlerPanicked,
}

impl SurveyTransportError for Error {}
