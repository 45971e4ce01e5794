//! Common types used by the various refold components.
pub mod error;
pub mod ext_serde;

pub use self::error::{DomainError, Error};

//------------ Response Aliases ----------------------------------------------

pub type RefoldEmptyResult = std::result::Result<(), self::error::Error>;
pub type RefoldResult<T> = std::result::Result<T, self::error::Error>;
