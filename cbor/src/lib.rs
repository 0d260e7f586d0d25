#![cfg_attr(not(test), no_std)]

//! Streaming, visitor-driven decoder for Concise Binary Object
//! Representation (RFC 8949), including string references (RFC 8742) and
//! typed arrays (RFC 8746).
//!
//! The [`Parser`] walks a byte [`Source`] and delivers each decoded item to
//! a [`Visitor`] as it is encountered, without building an intermediate
//! value tree. Visitors can pause the parser by returning `false` from any
//! callback and pick up exactly where they left off with
//! [`Parser::restart`].

extern crate alloc;

mod bigint;
mod error;
mod options;
mod parse;
mod source;
mod visit;


pub use error::Error;
pub use options::DecodeOptions;
pub use parse::Parser;
pub use source::{SliceSource, Source};
pub use visit::{Context, SemanticTag, TypedArrayView, Visitor};
