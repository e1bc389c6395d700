use thiserror::Error;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Error, PartialEq)]
pub enum Error {
	/// The inputs to an update do not describe a valid batch.
	#[error("invalid input: {0}")]
	InvalidInput(String),
	/// The accuracy was requested before any example was seen.
	#[error("accuracy is undefined before any examples have been seen")]
	NotReady,
	/// The distributed reduction failed. The collaborator's error is kept as its message, not its type, so that `Error` stays `PartialEq`.
	#[error("reduction failed: {0}")]
	Reduce(String),
}
