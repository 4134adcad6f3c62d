/// Errors which can occur while operating on the tag database or talking to
/// the tag server.
///
/// Every variant other than the transparent wrappers corresponds to a stable
/// status code carried on the wire, so a server-side failure arrives at the
/// client as the same variant that a local check would have produced.
#[derive(thiserror::Error, Debug)]
pub enum DaxError {
    /// The named tag, type or event does not exist.
    #[error("Not found.")]
    NotFound,
    /// A tag or type with the same name but a conflicting definition exists.
    #[error("Already exists.")]
    AlreadyExists,
    /// The data type is wrong for the requested operation.
    #[error("Bad data type.")]
    BadType,
    /// An argument failed validation before any state was touched.
    #[error("Bad argument.")]
    BadArg,
    /// A converted value saturated at the type's maximum.
    #[error("Value overflow.")]
    Overflow,
    /// A converted value saturated at the type's minimum.
    #[error("Value underflow.")]
    Underflow,
    /// The operation is not permitted for this tag.
    #[error("Illegal operation.")]
    Illegal,
    /// A window or frame exceeds the addressed region.
    #[error("Request too big.")]
    TooBig,
    /// Nothing there: an empty queue or an unserved virtual tag.
    #[error("Empty.")]
    Empty,
    /// The server could not allocate room for the request.
    #[error("Allocation failed.")]
    Alloc,
    /// The opcode is recognized but not implemented.
    #[error("Not implemented.")]
    NotImplemented,
    /// The session to the server is gone.
    #[error("Disconnected.")]
    Disconnected,
    /// A wait expired before anything happened.
    #[error("Timed out.")]
    Timeout,
    /// An I/O error occurred which was unrelated to the processing of a request.
    #[error(transparent)]
    IoError(#[from] std::io::Error),
    /// An error occurred while trying to decode a UTF-8 string.
    #[error(transparent)]
    Utf8Error(#[from] std::string::FromUtf8Error),
}

/// Result type alias for tag database and transport errors.
pub type DaxResult<T> = Result<T, DaxError>;

impl DaxError {
    /// The stable status code written into response frames.
    pub fn code(&self) -> i32 {
        match self {
            DaxError::NotFound => -1,
            DaxError::AlreadyExists => -2,
            DaxError::BadType => -3,
            DaxError::BadArg => -4,
            DaxError::Overflow => -5,
            DaxError::Underflow => -6,
            DaxError::Illegal => -7,
            DaxError::TooBig => -8,
            DaxError::Empty => -9,
            DaxError::Alloc => -10,
            DaxError::NotImplemented => -11,
            DaxError::Disconnected => -12,
            DaxError::Timeout => -13,
            // Transport faults never travel as a status; a session that hits
            // one is torn down instead.
            DaxError::IoError(_) => -12,
            DaxError::Utf8Error(_) => -4,
        }
    }

    /// Rebuild an error from a status code received off the wire.
    pub fn from_code(code: i32) -> DaxError {
        match code {
            -1 => DaxError::NotFound,
            -2 => DaxError::AlreadyExists,
            -3 => DaxError::BadType,
            -4 => DaxError::BadArg,
            -5 => DaxError::Overflow,
            -6 => DaxError::Underflow,
            -7 => DaxError::Illegal,
            -8 => DaxError::TooBig,
            -9 => DaxError::Empty,
            -10 => DaxError::Alloc,
            -11 => DaxError::NotImplemented,
            -13 => DaxError::Timeout,
            _ => DaxError::Disconnected,
        }
    }

    pub fn not_found<T>() -> DaxResult<T> {
        Err(DaxError::NotFound)
    }

    pub fn bad_arg<T>() -> DaxResult<T> {
        Err(DaxError::BadArg)
    }

    pub fn too_big<T>() -> DaxResult<T> {
        Err(DaxError::TooBig)
    }
}

#[cfg(test)]
mod test {
    use super::DaxError;

    #[test]
    fn codes_round_trip() {
        for err in [
            DaxError::NotFound,
            DaxError::AlreadyExists,
            DaxError::BadType,
            DaxError::BadArg,
            DaxError::Overflow,
            DaxError::Underflow,
            DaxError::Illegal,
            DaxError::TooBig,
            DaxError::Empty,
            DaxError::Alloc,
            DaxError::NotImplemented,
            DaxError::Disconnected,
            DaxError::Timeout,
        ] {
            let code = err.code();
            assert_eq!(DaxError::from_code(code).code(), code);
        }
    }
}
