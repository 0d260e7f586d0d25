#![no_main]

use libfuzzer_sys::fuzz_target;
use wicker_cbor::{Parser, SliceSource, Visitor};

struct Discard;

impl Visitor for Discard {}

fuzz_target!(|data: &[u8]| {
    let mut parser = Parser::new(SliceSource::new(data));
    let mut visitor = Discard;
    _ = parser.parse(&mut visitor);
});
