use thiserror::Error;

/// The ways a CBOR stream can be malformed.
///
/// Any error latches the parser: [`crate::Parser::stopped`] reports `true`
/// and further stepping is a no-op until [`crate::Parser::reset`].
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    #[error("Unexpected end of input")]
    UnexpectedEof,

    #[error("Unknown or reserved type information")]
    UnknownType,

    #[error("Text string is not valid UTF-8")]
    InvalidUtf8TextString,

    #[error("Number exceeds the addressable range")]
    NumberTooLarge,

    #[error("Maximum nesting depth exceeded")]
    MaxNestingDepthExceeded,

    #[error("String reference index out of range")]
    StringRefTooLarge,

    #[error("Malformed decimal fraction")]
    InvalidBigDec,

    #[error("Malformed bigfloat")]
    InvalidBigFloat,

    #[error("Chunked string contains an invalid chunk")]
    InvalidChunk,

    #[error("Malformed multi-dimensional array")]
    InvalidMultiDim,
}
