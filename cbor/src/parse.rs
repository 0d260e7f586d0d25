use alloc::{
    format,
    string::{String, ToString},
    vec::Vec,
};
use core::mem;

use base64::prelude::*;
use half::f16;

use crate::bigint;
use crate::error::Error;
use crate::options::DecodeOptions;
use crate::source::Source;
use crate::visit::{Context, SemanticTag, TypedArrayView, Visitor};

const MAJOR_UNSIGNED: u8 = 0;
const MAJOR_NEGATIVE: u8 = 1;
const MAJOR_BYTES: u8 = 2;
const MAJOR_TEXT: u8 = 3;
const MAJOR_ARRAY: u8 = 4;
const MAJOR_MAP: u8 = 5;
const MAJOR_TAG: u8 = 6;
const MAJOR_SIMPLE: u8 = 7;

const INDEFINITE: u8 = 31;
const BREAK: u8 = 0xff;

fn major(byte: u8) -> u8 {
    byte >> 5
}

fn info(byte: u8) -> u8 {
    byte & 0x1f
}

/// Typed-array tags (RFC 8746): integer widths 1..8, signed variants,
/// half/single/double floats. 128-bit floats and the reserved value 0x4c
/// are not interpreted.
fn is_typed_array_tag(tag: u64) -> bool {
    matches!(tag, 0x40..=0x4b | 0x4d..=0x52 | 0x54..=0x56)
}

/// Bit 2 of a typed-array tag selects little-endian element order.
fn is_little_endian_tag(tag: u8) -> bool {
    tag & 0x04 != 0
}

/// RFC 8742 ties the minimum length worth referencing to the encoded size
/// of the next table index.
fn min_stringref_len(table_size: usize) -> usize {
    match table_size as u64 {
        0..=23 => 3,
        24..=0xff => 4,
        0x100..=0xffff => 5,
        0x1_0000..=0xffff_ffff => 7,
        _ => 11,
    }
}

fn string_tag_for(item: Option<u64>) -> SemanticTag {
    match item {
        Some(0) => SemanticTag::Datetime,
        Some(32) => SemanticTag::Uri,
        Some(33) => SemanticTag::Base64Url,
        Some(34) => SemanticTag::Base64,
        _ => SemanticTag::None,
    }
}

fn lanes<const N: usize>(data: &[u8]) -> impl Iterator<Item = [u8; N]> + '_ {
    data.chunks_exact(N).map(|chunk| {
        let mut lane = [0u8; N];
        lane.copy_from_slice(chunk);
        lane
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ParseMode {
    Root,
    BeforeDone,
    Array,
    IndefiniteArray,
    MapKey,
    MapValue,
    IndefiniteMapKey,
    IndefiniteMapValue,
    MultiDim,
}

#[derive(Debug, Clone, Copy)]
struct Frame {
    mode: ParseMode,
    length: usize,
    index: usize,
    pop_stringref: bool,
}

impl Frame {
    fn new(mode: ParseMode, length: usize, pop_stringref: bool) -> Self {
        Self {
            mode,
            length,
            index: 0,
            pop_stringref,
        }
    }
}

enum MappedString {
    Text(String),
    Bytes(Vec<u8>),
}

/// Tags seen since the last data item. Consumed by the reader that follows;
/// always empty between top-level items.
#[derive(Default)]
struct PendingTags {
    stringref: bool,
    stringref_namespace: bool,
    item: Option<u64>,
}

/// Streaming CBOR parser.
///
/// Drives a [`Source`] and reports each decoded item to a [`Visitor`]. One
/// call to [`parse`](Parser::parse) processes one complete root item unless
/// the visitor halts early or the input is malformed.
pub struct Parser<S> {
    source: S,
    options: DecodeOptions,
    more: bool,
    done: bool,
    frames: Vec<Frame>,
    pending: PendingTags,
    stringref_tables: Vec<Vec<MappedString>>,
    nesting_depth: usize,
    text_buffer: Vec<u8>,
    bytes_buffer: Vec<u8>,
    shape: Vec<usize>,
}

impl<S: Source> Parser<S> {
    pub fn new(source: S) -> Self {
        Self::with_options(source, DecodeOptions::default())
    }

    pub fn with_options(source: S, options: DecodeOptions) -> Self {
        let mut frames = Vec::new();
        frames.push(Frame::new(ParseMode::Root, 0, false));
        Self {
            source,
            options,
            more: true,
            done: false,
            frames,
            pending: PendingTags::default(),
            stringref_tables: Vec::new(),
            nesting_depth: 0,
            text_buffer: Vec::new(),
            bytes_buffer: Vec::new(),
            shape: Vec::new(),
        }
    }

    /// The root item has been fully delivered.
    pub fn done(&self) -> bool {
        self.done
    }

    /// No further events will be produced without [`restart`](Self::restart)
    /// or [`reset`](Self::reset).
    pub fn stopped(&self) -> bool {
        !self.more
    }

    /// Bytes consumed from the source.
    pub fn position(&self) -> u64 {
        self.source.position()
    }

    /// Resume after a visitor-requested halt.
    pub fn restart(&mut self) {
        self.more = true;
    }

    /// Drop all decoder state and prepare to read a fresh root item. The
    /// source is not rewound.
    pub fn reset(&mut self) {
        self.frames.clear();
        self.frames.push(Frame::new(ParseMode::Root, 0, false));
        self.pending = PendingTags::default();
        self.stringref_tables.clear();
        self.nesting_depth = 0;
        self.more = true;
        self.done = false;
    }

    /// Step the state machine until the root item is complete, the visitor
    /// halts, or the input turns out to be malformed.
    ///
    /// Errors latch: once `Err` is returned, further calls are no-ops until
    /// [`reset`](Self::reset).
    pub fn parse<V: Visitor>(&mut self, visitor: &mut V) -> Result<(), Error> {
        let result = self.drive(visitor);
        if result.is_err() {
            self.more = false;
        }
        result
    }

    fn drive<V: Visitor>(&mut self, visitor: &mut V) -> Result<(), Error> {
        while !self.done && self.more {
            let Some(&Frame {
                mode, length, index, ..
            }) = self.frames.last()
            else {
                break;
            };
            match mode {
                ParseMode::Root => {
                    self.set_mode(ParseMode::BeforeDone);
                    self.read_item(visitor)?;
                }
                ParseMode::BeforeDone => {
                    self.frames.clear();
                    self.done = true;
                    self.more = false;
                    visitor.flush(&self.context());
                }
                ParseMode::Array => {
                    if index < length {
                        self.bump_index();
                        self.read_item(visitor)?;
                    } else {
                        self.end_array(visitor);
                    }
                }
                ParseMode::IndefiniteArray => match self.source.peek() {
                    None => return Err(Error::UnexpectedEof),
                    Some(BREAK) => {
                        self.source.ignore(1);
                        self.end_array(visitor);
                    }
                    Some(_) => self.read_item(visitor)?,
                },
                ParseMode::MapKey => {
                    if index < length {
                        self.bump_index();
                        self.read_name(visitor)?;
                        self.set_mode(ParseMode::MapValue);
                    } else {
                        self.end_object(visitor);
                    }
                }
                ParseMode::MapValue => {
                    self.set_mode(ParseMode::MapKey);
                    self.read_item(visitor)?;
                }
                ParseMode::IndefiniteMapKey => match self.source.peek() {
                    None => return Err(Error::UnexpectedEof),
                    Some(BREAK) => {
                        self.source.ignore(1);
                        self.end_object(visitor);
                    }
                    Some(_) => {
                        self.read_name(visitor)?;
                        self.set_mode(ParseMode::IndefiniteMapValue);
                    }
                },
                ParseMode::IndefiniteMapValue => {
                    self.set_mode(ParseMode::IndefiniteMapKey);
                    self.read_item(visitor)?;
                }
                ParseMode::MultiDim => {
                    if index == 0 {
                        self.bump_index();
                        self.read_item(visitor)?;
                    } else {
                        self.more = visitor.end_multi_dim(&self.context());
                        self.frames.pop();
                    }
                }
            }
        }
        Ok(())
    }

    fn context(&self) -> Context {
        Context::new(self.source.position())
    }

    fn set_mode(&mut self, mode: ParseMode) {
        if let Some(frame) = self.frames.last_mut() {
            frame.mode = mode;
        }
    }

    fn bump_index(&mut self) {
        if let Some(frame) = self.frames.last_mut() {
            frame.index += 1;
        }
    }

    fn pop_frame(&mut self) {
        if let Some(frame) = self.frames.pop() {
            if frame.pop_stringref {
                self.stringref_tables.pop();
            }
        }
    }

    // One complete data item, dispatched on the head byte after any tags.
    fn read_item<V: Visitor>(&mut self, visitor: &mut V) -> Result<(), Error> {
        self.read_tags()?;
        let head = self.source.peek().ok_or(Error::UnexpectedEof)?;
        if self.pending.stringref && major(head) != MAJOR_UNSIGNED {
            return Err(Error::UnknownType);
        }
        match major(head) {
            MAJOR_UNSIGNED => {
                let value = self.read_argument()?;
                if self.pending.stringref && !self.stringref_tables.is_empty() {
                    self.pending.stringref = false;
                    self.emit_stringref(value, visitor)?;
                } else {
                    self.pending.stringref = false;
                    let tag = self.numeric_tag();
                    self.more = visitor.visit_uint64(value, tag, &self.context());
                }
            }
            MAJOR_NEGATIVE => {
                let value = self.read_negative()?;
                let tag = self.numeric_tag();
                self.more = visitor.visit_int64(value, tag, &self.context());
            }
            MAJOR_BYTES => {
                self.read_byte_string()?;
                self.emit_byte_string(visitor)?;
            }
            MAJOR_TEXT => {
                self.read_text_string()?;
                self.emit_text_string(visitor)?;
            }
            MAJOR_ARRAY => match self.pending.item.take() {
                Some(4) => {
                    let value = self.read_decimal_fraction()?;
                    self.more = visitor.visit_string(&value, SemanticTag::Bigdec, &self.context());
                }
                Some(5) => {
                    let value = self.read_hexfloat()?;
                    self.more =
                        visitor.visit_string(&value, SemanticTag::Bigfloat, &self.context());
                }
                Some(40) => self.begin_multi_dim(SemanticTag::MultiDimRowMajor, visitor)?,
                Some(1040) => self.begin_multi_dim(SemanticTag::MultiDimColumnMajor, visitor)?,
                _ => self.begin_array(visitor)?,
            },
            MAJOR_MAP => self.begin_object(visitor)?,
            MAJOR_TAG => unreachable!(), // consumed by read_tags
            MAJOR_SIMPLE => self.read_simple(visitor)?,
            _ => unreachable!(),
        }
        self.pending = PendingTags::default();
        Ok(())
    }

    // Accumulate semantic tags until something that is not a tag comes up.
    fn read_tags(&mut self) -> Result<(), Error> {
        loop {
            let head = self.source.peek().ok_or(Error::UnexpectedEof)?;
            if major(head) != MAJOR_TAG {
                return Ok(());
            }
            let tag = self.read_argument()?;
            match tag {
                25 => self.pending.stringref = true,
                256 => self.pending.stringref_namespace = true,
                0..=5 | 21..=23 | 32..=34 | 40 | 1040 => self.pending.item = Some(tag),
                tag if is_typed_array_tag(tag) => self.pending.item = Some(tag),
                _ => {} // unrecognised tags are accepted and discarded
            }
        }
    }

    // Consume a head byte and decode its argument word.
    fn read_argument(&mut self) -> Result<u64, Error> {
        let head = self.source.get().ok_or(Error::UnexpectedEof)?;
        match info(head) {
            value @ 0..=23 => Ok(u64::from(value)),
            24 => self.source.get().map(u64::from).ok_or(Error::UnexpectedEof),
            25 => Ok(u64::from(u16::from_be_bytes(self.read_exact::<2>()?))),
            26 => Ok(u64::from(u32::from_be_bytes(self.read_exact::<4>()?))),
            27 => Ok(u64::from_be_bytes(self.read_exact::<8>()?)),
            _ => Err(Error::UnknownType), // 28..30 reserved, 31 handled by callers
        }
    }

    fn read_exact<const N: usize>(&mut self) -> Result<[u8; N], Error> {
        let mut buf = [0u8; N];
        if self.source.read(&mut buf) != N {
            return Err(Error::UnexpectedEof);
        }
        Ok(buf)
    }

    fn read_negative(&mut self) -> Result<i64, Error> {
        let argument = self.read_argument()?;
        let argument = i64::try_from(argument).map_err(|_| Error::NumberTooLarge)?;
        Ok(-1 - argument)
    }

    fn read_size(&mut self) -> Result<usize, Error> {
        usize::try_from(self.read_argument()?).map_err(|_| Error::NumberTooLarge)
    }

    fn numeric_tag(&mut self) -> SemanticTag {
        match self.pending.item.take() {
            Some(1) => SemanticTag::Timestamp,
            _ => SemanticTag::None,
        }
    }

    fn string_tag(&mut self) -> SemanticTag {
        string_tag_for(self.pending.item.take())
    }

    // Read one string item of `major` into `buf`, concatenating chunks when
    // it is indefinite-length. Chunks must be definite-length strings of the
    // same major type. Returns whether the string was definite-length.
    fn read_chunked(&mut self, major_type: u8, buf: &mut Vec<u8>) -> Result<bool, Error> {
        let head = self.source.peek().ok_or(Error::UnexpectedEof)?;
        debug_assert_eq!(major(head), major_type);
        if info(head) == INDEFINITE {
            self.source.ignore(1);
            loop {
                let next = self.source.peek().ok_or(Error::UnexpectedEof)?;
                if next == BREAK {
                    self.source.ignore(1);
                    return Ok(false);
                }
                if major(next) != major_type || info(next) == INDEFINITE {
                    return Err(Error::InvalidChunk);
                }
                let length = self.read_size()?;
                self.read_payload(buf, length)?;
            }
        } else {
            let length = self.read_size()?;
            self.read_payload(buf, length)?;
            Ok(true)
        }
    }

    fn read_payload(&mut self, buf: &mut Vec<u8>, length: usize) -> Result<(), Error> {
        if self.source.read_into(buf, length) != length {
            return Err(Error::UnexpectedEof);
        }
        Ok(())
    }

    // Byte string into the shared buffer; definite-length strings of useful
    // length are recorded in the innermost stringref table.
    fn read_byte_string(&mut self) -> Result<bool, Error> {
        let mut buf = mem::take(&mut self.bytes_buffer);
        buf.clear();
        let result = self.read_chunked(MAJOR_BYTES, &mut buf);
        self.bytes_buffer = buf;
        let definite = result?;
        if definite {
            if let Some(table) = self.stringref_tables.last_mut() {
                if self.bytes_buffer.len() >= min_stringref_len(table.len()) {
                    table.push(MappedString::Bytes(self.bytes_buffer.clone()));
                }
            }
        }
        Ok(definite)
    }

    // Text string into the shared buffer, validated as UTF-8 before anything
    // else happens to it.
    fn read_text_string(&mut self) -> Result<(), Error> {
        let mut buf = mem::take(&mut self.text_buffer);
        buf.clear();
        let result = self.read_chunked(MAJOR_TEXT, &mut buf);
        self.text_buffer = buf;
        let definite = result?;
        let text = core::str::from_utf8(&self.text_buffer)
            .map_err(|_| Error::InvalidUtf8TextString)?;
        if definite {
            if let Some(table) = self.stringref_tables.last_mut() {
                if text.len() >= min_stringref_len(table.len()) {
                    table.push(MappedString::Text(String::from(text)));
                }
            }
        }
        Ok(())
    }

    fn emit_text_string<V: Visitor>(&mut self, visitor: &mut V) -> Result<(), Error> {
        let tag = self.string_tag();
        let ctx = self.context();
        let text = core::str::from_utf8(&self.text_buffer)
            .map_err(|_| Error::InvalidUtf8TextString)?;
        self.more = visitor.visit_string(text, tag, &ctx);
        Ok(())
    }

    // The byte string in the shared buffer becomes an event, steered by the
    // pending item tag: bignum, encoding hint, typed array, or plain bytes.
    fn emit_byte_string<V: Visitor>(&mut self, visitor: &mut V) -> Result<(), Error> {
        let ctx = self.context();
        match self.pending.item.take() {
            Some(2) => {
                let value = bigint::decimal_digits(&self.bytes_buffer);
                self.more = visitor.visit_string(&value, SemanticTag::Bigint, &ctx);
            }
            Some(3) => {
                let value = format!("-{}", bigint::decimal_digits(&self.bytes_buffer));
                self.more = visitor.visit_string(&value, SemanticTag::Bigint, &ctx);
            }
            Some(0x15) => {
                self.more =
                    visitor.visit_byte_string(&self.bytes_buffer, SemanticTag::Base64Url, &ctx);
            }
            Some(0x16) => {
                self.more =
                    visitor.visit_byte_string(&self.bytes_buffer, SemanticTag::Base64, &ctx);
            }
            Some(0x17) => {
                self.more =
                    visitor.visit_byte_string(&self.bytes_buffer, SemanticTag::Base16, &ctx);
            }
            Some(tag) if is_typed_array_tag(tag) => self.emit_typed_array(tag as u8, visitor),
            _ => {
                self.more = visitor.visit_byte_string(&self.bytes_buffer, SemanticTag::None, &ctx);
            }
        }
        Ok(())
    }

    // Reassemble the raw bytes as homogeneous elements, honouring the tag's
    // endianness bit. A trailing fragment shorter than one element is
    // dropped.
    fn emit_typed_array<V: Visitor>(&mut self, tag: u8, visitor: &mut V) {
        let ctx = self.context();
        let little = is_little_endian_tag(tag);
        let data = &self.bytes_buffer;
        self.more = match tag {
            0x40 | 0x44 => {
                let semantic = if tag == 0x44 {
                    SemanticTag::Clamped
                } else {
                    SemanticTag::None
                };
                visitor.visit_typed_array(TypedArrayView::U8(data), semantic, &ctx)
            }
            0x48 => {
                let values: Vec<i8> = data.iter().map(|&b| b as i8).collect();
                visitor.visit_typed_array(TypedArrayView::I8(&values), SemanticTag::None, &ctx)
            }
            0x41 | 0x45 => {
                let values: Vec<u16> = lanes::<2>(data)
                    .map(|l| {
                        if little {
                            u16::from_le_bytes(l)
                        } else {
                            u16::from_be_bytes(l)
                        }
                    })
                    .collect();
                visitor.visit_typed_array(TypedArrayView::U16(&values), SemanticTag::None, &ctx)
            }
            0x42 | 0x46 => {
                let values: Vec<u32> = lanes::<4>(data)
                    .map(|l| {
                        if little {
                            u32::from_le_bytes(l)
                        } else {
                            u32::from_be_bytes(l)
                        }
                    })
                    .collect();
                visitor.visit_typed_array(TypedArrayView::U32(&values), SemanticTag::None, &ctx)
            }
            0x43 | 0x47 => {
                let values: Vec<u64> = lanes::<8>(data)
                    .map(|l| {
                        if little {
                            u64::from_le_bytes(l)
                        } else {
                            u64::from_be_bytes(l)
                        }
                    })
                    .collect();
                visitor.visit_typed_array(TypedArrayView::U64(&values), SemanticTag::None, &ctx)
            }
            0x49 | 0x4d => {
                let values: Vec<i16> = lanes::<2>(data)
                    .map(|l| {
                        if little {
                            i16::from_le_bytes(l)
                        } else {
                            i16::from_be_bytes(l)
                        }
                    })
                    .collect();
                visitor.visit_typed_array(TypedArrayView::I16(&values), SemanticTag::None, &ctx)
            }
            0x4a | 0x4e => {
                let values: Vec<i32> = lanes::<4>(data)
                    .map(|l| {
                        if little {
                            i32::from_le_bytes(l)
                        } else {
                            i32::from_be_bytes(l)
                        }
                    })
                    .collect();
                visitor.visit_typed_array(TypedArrayView::I32(&values), SemanticTag::None, &ctx)
            }
            0x4b | 0x4f => {
                let values: Vec<i64> = lanes::<8>(data)
                    .map(|l| {
                        if little {
                            i64::from_le_bytes(l)
                        } else {
                            i64::from_be_bytes(l)
                        }
                    })
                    .collect();
                visitor.visit_typed_array(TypedArrayView::I64(&values), SemanticTag::None, &ctx)
            }
            0x50 | 0x54 => {
                let values: Vec<f16> = lanes::<2>(data)
                    .map(|l| {
                        f16::from_bits(if little {
                            u16::from_le_bytes(l)
                        } else {
                            u16::from_be_bytes(l)
                        })
                    })
                    .collect();
                visitor.visit_typed_array(TypedArrayView::F16(&values), SemanticTag::None, &ctx)
            }
            0x51 | 0x55 => {
                let values: Vec<f32> = lanes::<4>(data)
                    .map(|l| {
                        if little {
                            f32::from_le_bytes(l)
                        } else {
                            f32::from_be_bytes(l)
                        }
                    })
                    .collect();
                visitor.visit_typed_array(TypedArrayView::F32(&values), SemanticTag::None, &ctx)
            }
            0x52 | 0x56 => {
                let values: Vec<f64> = lanes::<8>(data)
                    .map(|l| {
                        if little {
                            f64::from_le_bytes(l)
                        } else {
                            f64::from_be_bytes(l)
                        }
                    })
                    .collect();
                visitor.visit_typed_array(TypedArrayView::F64(&values), SemanticTag::None, &ctx)
            }
            _ => unreachable!(), // filtered by is_typed_array_tag
        };
    }

    // A backreference into the innermost stringref table. Resolved items go
    // through the same tagged emission paths as directly-read ones.
    fn emit_stringref<V: Visitor>(
        &mut self,
        reference: u64,
        visitor: &mut V,
    ) -> Result<(), Error> {
        let ctx = self.context();
        let item = self.pending.item.take();
        {
            let table = match self.stringref_tables.last() {
                Some(table) => table,
                None => return Err(Error::StringRefTooLarge),
            };
            if reference >= table.len() as u64 {
                return Err(Error::StringRefTooLarge);
            }
            match &table[reference as usize] {
                MappedString::Text(text) => {
                    self.more = visitor.visit_string(text, string_tag_for(item), &ctx);
                    return Ok(());
                }
                MappedString::Bytes(bytes) => {
                    self.bytes_buffer.clear();
                    self.bytes_buffer.extend_from_slice(bytes);
                }
            }
        }
        self.pending.item = item;
        self.emit_byte_string(visitor)
    }

    fn read_simple<V: Visitor>(&mut self, visitor: &mut V) -> Result<(), Error> {
        let head = self.source.peek().ok_or(Error::UnexpectedEof)?;
        match info(head) {
            20 => {
                self.source.ignore(1);
                self.more = visitor.visit_bool(false, SemanticTag::None, &self.context());
            }
            21 => {
                self.source.ignore(1);
                self.more = visitor.visit_bool(true, SemanticTag::None, &self.context());
            }
            22 => {
                self.source.ignore(1);
                self.more = visitor.visit_null(SemanticTag::None, &self.context());
            }
            23 => {
                self.source.ignore(1);
                self.more = visitor.visit_null(SemanticTag::Undefined, &self.context());
            }
            25 => {
                self.source.ignore(1);
                let bits = u16::from_be_bytes(self.read_exact::<2>()?);
                self.more = visitor.visit_half(bits, SemanticTag::None, &self.context());
            }
            26 => {
                self.source.ignore(1);
                let value = f32::from_be_bytes(self.read_exact::<4>()?);
                let tag = self.numeric_tag();
                self.more = visitor.visit_double(f64::from(value), tag, &self.context());
            }
            27 => {
                self.source.ignore(1);
                let value = f64::from_be_bytes(self.read_exact::<8>()?);
                let tag = self.numeric_tag();
                self.more = visitor.visit_double(value, tag, &self.context());
            }
            _ => return Err(Error::UnknownType),
        }
        Ok(())
    }

    fn enter_container(&mut self) -> Result<(), Error> {
        self.nesting_depth += 1;
        if self.nesting_depth > self.options.max_nesting_depth() {
            return Err(Error::MaxNestingDepthExceeded);
        }
        Ok(())
    }

    // A pending namespace tag opens a fresh stringref table tied to the
    // container being entered.
    fn take_namespace(&mut self) -> bool {
        let pop = self.pending.stringref_namespace;
        if pop {
            self.pending.stringref_namespace = false;
            self.stringref_tables.push(Vec::new());
        }
        pop
    }

    fn begin_array<V: Visitor>(&mut self, visitor: &mut V) -> Result<(), Error> {
        self.enter_container()?;
        let pop_stringref = self.take_namespace();
        let head = self.source.peek().ok_or(Error::UnexpectedEof)?;
        if info(head) == INDEFINITE {
            self.source.ignore(1);
            self.frames
                .push(Frame::new(ParseMode::IndefiniteArray, 0, pop_stringref));
            self.more = visitor.begin_array(None, SemanticTag::None, &self.context());
        } else {
            let length = self.read_size()?;
            self.frames
                .push(Frame::new(ParseMode::Array, length, pop_stringref));
            self.more = visitor.begin_array(Some(length), SemanticTag::None, &self.context());
        }
        Ok(())
    }

    fn end_array<V: Visitor>(&mut self, visitor: &mut V) {
        self.nesting_depth = self.nesting_depth.saturating_sub(1);
        self.more = visitor.end_array(&self.context());
        self.pop_frame();
    }

    fn begin_object<V: Visitor>(&mut self, visitor: &mut V) -> Result<(), Error> {
        self.enter_container()?;
        let pop_stringref = self.take_namespace();
        let head = self.source.peek().ok_or(Error::UnexpectedEof)?;
        if info(head) == INDEFINITE {
            self.source.ignore(1);
            self.frames
                .push(Frame::new(ParseMode::IndefiniteMapKey, 0, pop_stringref));
            self.more = visitor.begin_object(None, SemanticTag::None, &self.context());
        } else {
            let length = self.read_size()?;
            self.frames
                .push(Frame::new(ParseMode::MapKey, length, pop_stringref));
            self.more = visitor.begin_object(Some(length), SemanticTag::None, &self.context());
        }
        Ok(())
    }

    fn end_object<V: Visitor>(&mut self, visitor: &mut V) {
        self.nesting_depth = self.nesting_depth.saturating_sub(1);
        self.more = visitor.end_object(&self.context());
        self.pop_frame();
    }

    // A map key. Text keys are delivered as-is, byte-string keys as
    // base64url, backreferences resolve through the table, and anything else
    // is rendered to a JSON fragment.
    fn read_name<V: Visitor>(&mut self, visitor: &mut V) -> Result<(), Error> {
        self.read_tags()?;
        let head = self.source.peek().ok_or(Error::UnexpectedEof)?;
        if self.pending.stringref && major(head) != MAJOR_UNSIGNED {
            return Err(Error::UnknownType);
        }
        match major(head) {
            MAJOR_TEXT => {
                self.read_text_string()?;
                let ctx = self.context();
                let text = core::str::from_utf8(&self.text_buffer)
                    .map_err(|_| Error::InvalidUtf8TextString)?;
                self.more = visitor.visit_key(text, &ctx);
            }
            MAJOR_BYTES => {
                self.read_byte_string()?;
                let ctx = self.context();
                let name = BASE64_URL_SAFE_NO_PAD.encode(&self.bytes_buffer);
                self.more = visitor.visit_key(&name, &ctx);
            }
            MAJOR_UNSIGNED if self.pending.stringref && !self.stringref_tables.is_empty() => {
                self.pending.stringref = false;
                let reference = self.read_argument()?;
                let ctx = self.context();
                let table = match self.stringref_tables.last() {
                    Some(table) => table,
                    None => return Err(Error::StringRefTooLarge),
                };
                if reference >= table.len() as u64 {
                    return Err(Error::StringRefTooLarge);
                }
                match &table[reference as usize] {
                    MappedString::Text(text) => {
                        self.more = visitor.visit_key(text, &ctx);
                    }
                    MappedString::Bytes(bytes) => {
                        let name = BASE64_URL_SAFE_NO_PAD.encode(bytes);
                        self.more = visitor.visit_key(&name, &ctx);
                    }
                }
            }
            _ => {
                let name = self.read_name_fallback()?;
                self.more = visitor.visit_key(&name, &self.context());
            }
        }
        self.pending = PendingTags::default();
        Ok(())
    }

    // Non-string keys become the JSON rendering of the item. Stringref
    // tables are frozen for the duration: nothing is recorded and
    // backreferences do not resolve.
    fn read_name_fallback(&mut self) -> Result<String, Error> {
        let mut out = String::new();
        let remaining_depth = self
            .options
            .max_nesting_depth()
            .saturating_sub(self.nesting_depth);
        self.append_item_as_json(&mut out, remaining_depth)?;
        Ok(out)
    }

    fn append_item_as_json(&mut self, out: &mut String, remaining_depth: usize) -> Result<(), Error> {
        self.read_tags()?;
        self.pending.stringref_namespace = false;
        let head = self.source.peek().ok_or(Error::UnexpectedEof)?;
        if self.pending.stringref {
            self.pending.stringref = false;
            if major(head) != MAJOR_UNSIGNED {
                return Err(Error::UnknownType);
            }
        }
        match major(head) {
            MAJOR_UNSIGNED => {
                let value = self.read_argument()?;
                out.push_str(&value.to_string());
            }
            MAJOR_NEGATIVE => {
                let value = self.read_negative()?;
                out.push_str(&value.to_string());
            }
            MAJOR_BYTES => {
                let item = self.pending.item.take();
                let mut buf = Vec::new();
                self.read_chunked(MAJOR_BYTES, &mut buf)?;
                match item {
                    Some(2) => out.push_str(&bigint::decimal_digits(&buf)),
                    Some(3) => {
                        out.push('-');
                        out.push_str(&bigint::decimal_digits(&buf));
                    }
                    _ => {
                        out.push('"');
                        out.push_str(&BASE64_URL_SAFE_NO_PAD.encode(&buf));
                        out.push('"');
                    }
                }
            }
            MAJOR_TEXT => {
                let mut buf = Vec::new();
                self.read_chunked(MAJOR_TEXT, &mut buf)?;
                let text =
                    core::str::from_utf8(&buf).map_err(|_| Error::InvalidUtf8TextString)?;
                append_json_string(out, text);
            }
            MAJOR_ARRAY => match self.pending.item.take() {
                Some(4) => out.push_str(&self.read_decimal_fraction()?),
                Some(5) => {
                    let value = self.read_hexfloat()?;
                    append_json_string(out, &value);
                }
                _ => {
                    if remaining_depth == 0 {
                        return Err(Error::MaxNestingDepthExceeded);
                    }
                    out.push('[');
                    if info(head) == INDEFINITE {
                        self.source.ignore(1);
                        let mut first = true;
                        loop {
                            let next = self.source.peek().ok_or(Error::UnexpectedEof)?;
                            if next == BREAK {
                                self.source.ignore(1);
                                break;
                            }
                            if !first {
                                out.push(',');
                            }
                            first = false;
                            self.append_item_as_json(out, remaining_depth - 1)?;
                        }
                    } else {
                        let count = self.read_size()?;
                        for i in 0..count {
                            if i > 0 {
                                out.push(',');
                            }
                            self.append_item_as_json(out, remaining_depth - 1)?;
                        }
                    }
                    out.push(']');
                }
            },
            MAJOR_MAP => {
                if remaining_depth == 0 {
                    return Err(Error::MaxNestingDepthExceeded);
                }
                out.push('{');
                if info(head) == INDEFINITE {
                    self.source.ignore(1);
                    let mut first = true;
                    loop {
                        let next = self.source.peek().ok_or(Error::UnexpectedEof)?;
                        if next == BREAK {
                            self.source.ignore(1);
                            break;
                        }
                        if !first {
                            out.push(',');
                        }
                        first = false;
                        self.append_pair_as_json(out, remaining_depth)?;
                    }
                } else {
                    let count = self.read_size()?;
                    for i in 0..count {
                        if i > 0 {
                            out.push(',');
                        }
                        self.append_pair_as_json(out, remaining_depth)?;
                    }
                }
                out.push('}');
            }
            MAJOR_TAG => unreachable!(), // consumed by read_tags
            MAJOR_SIMPLE => match info(head) {
                20 => {
                    self.source.ignore(1);
                    out.push_str("false");
                }
                21 => {
                    self.source.ignore(1);
                    out.push_str("true");
                }
                22 | 23 => {
                    self.source.ignore(1);
                    out.push_str("null");
                }
                25 => {
                    self.source.ignore(1);
                    let bits = u16::from_be_bytes(self.read_exact::<2>()?);
                    push_json_number(out, f64::from(f16::from_bits(bits)));
                }
                26 => {
                    self.source.ignore(1);
                    let value = f32::from_be_bytes(self.read_exact::<4>()?);
                    push_json_number(out, f64::from(value));
                }
                27 => {
                    self.source.ignore(1);
                    let value = f64::from_be_bytes(self.read_exact::<8>()?);
                    push_json_number(out, value);
                }
                _ => return Err(Error::UnknownType),
            },
            _ => unreachable!(),
        }
        self.pending.item = None;
        Ok(())
    }

    fn append_pair_as_json(&mut self, out: &mut String, remaining_depth: usize) -> Result<(), Error> {
        let mut key = String::new();
        self.append_item_as_json(&mut key, remaining_depth - 1)?;
        if key.starts_with('"') {
            out.push_str(&key);
        } else {
            append_json_string(out, &key);
        }
        out.push(':');
        self.append_item_as_json(out, remaining_depth - 1)
    }

    // Tag 4: [exponent, mantissa] rendered as a plain base-10 string.
    fn read_decimal_fraction(&mut self) -> Result<String, Error> {
        self.read_pair_head(Error::InvalidBigDec)?;
        let exponent = self.read_exponent(Error::InvalidBigDec)?;
        let head = self.source.peek().ok_or(Error::UnexpectedEof)?;
        let (negative, digits) = match major(head) {
            MAJOR_UNSIGNED => (false, self.read_argument()?.to_string()),
            MAJOR_NEGATIVE => {
                let value = self.read_negative()?;
                (true, value.unsigned_abs().to_string())
            }
            MAJOR_TAG => {
                let tag = self.read_argument()?;
                if tag != 2 && tag != 3 {
                    return Err(Error::InvalidBigDec);
                }
                let next = self.source.peek().ok_or(Error::UnexpectedEof)?;
                if major(next) != MAJOR_BYTES {
                    return Err(Error::InvalidBigDec);
                }
                self.read_byte_string()?;
                (tag == 3, bigint::decimal_digits(&self.bytes_buffer))
            }
            _ => return Err(Error::InvalidBigDec),
        };
        Ok(format_decimal(negative, &digits, exponent))
    }

    // Tag 5: [exponent, mantissa] rendered as a C99 hex float,
    // `[-]0x<hex>p<dec>`.
    fn read_hexfloat(&mut self) -> Result<String, Error> {
        self.read_pair_head(Error::InvalidBigFloat)?;
        let exponent = self.read_exponent(Error::InvalidBigFloat)?;
        let head = self.source.peek().ok_or(Error::UnexpectedEof)?;
        let mut out = String::new();
        match major(head) {
            MAJOR_UNSIGNED => {
                let value = self.read_argument()?;
                out.push_str("0x");
                out.push_str(&bigint::hex_digits(&value.to_be_bytes()));
            }
            MAJOR_NEGATIVE => {
                let value = self.read_negative()?;
                out.push_str("-0x");
                out.push_str(&bigint::hex_digits(&value.unsigned_abs().to_be_bytes()));
            }
            MAJOR_TAG => {
                let tag = self.read_argument()?;
                if tag != 2 && tag != 3 {
                    return Err(Error::InvalidBigFloat);
                }
                let next = self.source.peek().ok_or(Error::UnexpectedEof)?;
                if major(next) != MAJOR_BYTES {
                    return Err(Error::InvalidBigFloat);
                }
                self.read_byte_string()?;
                if tag == 3 {
                    out.push('-');
                }
                out.push_str("0x");
                out.push_str(&bigint::hex_digits(&self.bytes_buffer));
            }
            _ => return Err(Error::InvalidBigFloat),
        }
        out.push('p');
        out.push_str(&exponent.to_string());
        Ok(out)
    }

    // Both tag 4 and tag 5 wrap a definite-length two-element array.
    fn read_pair_head(&mut self, invalid: Error) -> Result<(), Error> {
        let head = self.source.peek().ok_or(Error::UnexpectedEof)?;
        if info(head) == INDEFINITE {
            return Err(invalid);
        }
        if self.read_size()? != 2 {
            return Err(invalid);
        }
        Ok(())
    }

    fn read_exponent(&mut self, invalid: Error) -> Result<i32, Error> {
        let head = self.source.peek().ok_or(Error::UnexpectedEof)?;
        let exponent = match major(head) {
            MAJOR_UNSIGNED => {
                i64::try_from(self.read_argument()?).map_err(|_| Error::NumberTooLarge)?
            }
            MAJOR_NEGATIVE => self.read_negative()?,
            _ => return Err(invalid),
        };
        i32::try_from(exponent).map_err(|_| Error::NumberTooLarge)
    }

    // Tags 40/1040: [[dim, ...], payload]. The shape is read eagerly, the
    // payload is driven as an ordinary item under a MultiDim frame.
    fn begin_multi_dim<V: Visitor>(
        &mut self,
        tag: SemanticTag,
        visitor: &mut V,
    ) -> Result<(), Error> {
        self.read_pair_head(Error::InvalidMultiDim)?;
        self.read_shape()?;
        self.frames.push(Frame::new(ParseMode::MultiDim, 0, false));
        let ctx = self.context();
        self.more = visitor.begin_multi_dim(&self.shape, tag, &ctx);
        Ok(())
    }

    fn read_shape(&mut self) -> Result<(), Error> {
        self.shape.clear();
        let head = self.source.peek().ok_or(Error::UnexpectedEof)?;
        if major(head) != MAJOR_ARRAY {
            return Err(Error::InvalidMultiDim);
        }
        if info(head) == INDEFINITE {
            self.source.ignore(1);
            loop {
                let next = self.source.peek().ok_or(Error::UnexpectedEof)?;
                if next == BREAK {
                    self.source.ignore(1);
                    return Ok(());
                }
                if major(next) != MAJOR_UNSIGNED {
                    return Err(Error::InvalidMultiDim);
                }
                let dim = self.read_size()?;
                self.shape.push(dim);
            }
        }
        let count = self.read_size()?;
        for _ in 0..count {
            let next = self.source.peek().ok_or(Error::UnexpectedEof)?;
            if major(next) != MAJOR_UNSIGNED {
                return Err(Error::InvalidMultiDim);
            }
            let dim = self.read_size()?;
            self.shape.push(dim);
        }
        Ok(())
    }
}

fn format_decimal(negative: bool, digits: &str, exponent: i32) -> String {
    let mut out = String::with_capacity(digits.len() + 2);
    if negative {
        out.push('-');
    }
    if exponent >= 0 {
        out.push_str(digits);
        for _ in 0..exponent {
            out.push('0');
        }
    } else {
        let scale = exponent.unsigned_abs() as usize;
        if scale < digits.len() {
            let (int_part, frac_part) = digits.split_at(digits.len() - scale);
            out.push_str(int_part);
            out.push('.');
            out.push_str(frac_part);
        } else {
            out.push_str("0.");
            for _ in 0..scale - digits.len() {
                out.push('0');
            }
            out.push_str(digits);
        }
    }
    out
}

fn append_json_string(out: &mut String, text: &str) {
    out.push('"');
    for ch in text.chars() {
        match ch {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            c if (c as u32) < 0x20 => {
                out.push_str(&format!("\\u{:04x}", c as u32));
            }
            c => out.push(c),
        }
    }
    out.push('"');
}

fn push_json_number(out: &mut String, value: f64) {
    if value.is_finite() {
        out.push_str(&format!("{value}"));
    } else {
        out.push_str("null");
    }
}
