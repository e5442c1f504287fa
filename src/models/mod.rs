mod execution;
mod policy;
mod validators;

pub use execution::*;
pub use policy::*;
pub use validators::{
    IDENTIFIER_REGEX, MAX_IDENTIFIER_LENGTH, is_valid_identifier, validate_windows,
};
