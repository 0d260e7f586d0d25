use half::f16;

/// Position information handed to every visitor callback.
pub struct Context {
    position: u64,
}

impl Context {
    pub(crate) fn new(position: u64) -> Self {
        Self { position }
    }

    /// Bytes consumed from the source when the event was produced.
    pub fn position(&self) -> u64 {
        self.position
    }

    /// CBOR is a binary format; there is only ever one "line".
    pub fn line(&self) -> u64 {
        1
    }
}

/// Semantic refinement attached to an event by a preceding tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SemanticTag {
    None,
    Undefined,
    Timestamp,
    Datetime,
    Uri,
    Base64Url,
    Base64,
    Base16,
    Bigint,
    Bigdec,
    Bigfloat,
    Clamped,
    MultiDimRowMajor,
    MultiDimColumnMajor,
}

/// A borrowed view of a decoded homogeneous numeric array (RFC 8746).
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum TypedArrayView<'a> {
    U8(&'a [u8]),
    I8(&'a [i8]),
    U16(&'a [u16]),
    I16(&'a [i16]),
    U32(&'a [u32]),
    I32(&'a [i32]),
    U64(&'a [u64]),
    I64(&'a [i64]),
    F16(&'a [f16]),
    F32(&'a [f32]),
    F64(&'a [f64]),
}

impl TypedArrayView<'_> {
    /// Number of elements in the view.
    pub fn len(&self) -> usize {
        match self {
            TypedArrayView::U8(v) => v.len(),
            TypedArrayView::I8(v) => v.len(),
            TypedArrayView::U16(v) => v.len(),
            TypedArrayView::I16(v) => v.len(),
            TypedArrayView::U32(v) => v.len(),
            TypedArrayView::I32(v) => v.len(),
            TypedArrayView::U64(v) => v.len(),
            TypedArrayView::I64(v) => v.len(),
            TypedArrayView::F16(v) => v.len(),
            TypedArrayView::F32(v) => v.len(),
            TypedArrayView::F64(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Receives the event stream produced by [`crate::Parser`].
///
/// Every callback returns `true` to keep parsing or `false` to request a
/// graceful halt; the parser stops before producing the next event and can
/// be resumed with [`crate::Parser::restart`]. Returning `false` is not an
/// error.
///
/// All methods default to doing nothing and continuing, so a visitor only
/// implements the events it cares about.
pub trait Visitor {
    fn visit_uint64(&mut self, _value: u64, _tag: SemanticTag, _ctx: &Context) -> bool {
        true
    }

    fn visit_int64(&mut self, _value: i64, _tag: SemanticTag, _ctx: &Context) -> bool {
        true
    }

    /// A half-precision float, delivered as its raw bits.
    fn visit_half(&mut self, _value: u16, _tag: SemanticTag, _ctx: &Context) -> bool {
        true
    }

    fn visit_double(&mut self, _value: f64, _tag: SemanticTag, _ctx: &Context) -> bool {
        true
    }

    fn visit_bool(&mut self, _value: bool, _tag: SemanticTag, _ctx: &Context) -> bool {
        true
    }

    /// `null`, or `undefined` when `tag` is [`SemanticTag::Undefined`].
    fn visit_null(&mut self, _tag: SemanticTag, _ctx: &Context) -> bool {
        true
    }

    fn visit_string(&mut self, _value: &str, _tag: SemanticTag, _ctx: &Context) -> bool {
        true
    }

    fn visit_byte_string(&mut self, _value: &[u8], _tag: SemanticTag, _ctx: &Context) -> bool {
        true
    }

    fn visit_typed_array(
        &mut self,
        _value: TypedArrayView<'_>,
        _tag: SemanticTag,
        _ctx: &Context,
    ) -> bool {
        true
    }

    /// A map key, always materialised as text.
    fn visit_key(&mut self, _name: &str, _ctx: &Context) -> bool {
        true
    }

    /// `length` is `None` for indefinite-length arrays.
    fn begin_array(&mut self, _length: Option<usize>, _tag: SemanticTag, _ctx: &Context) -> bool {
        true
    }

    fn end_array(&mut self, _ctx: &Context) -> bool {
        true
    }

    /// `length` is the number of pairs, `None` for indefinite-length maps.
    fn begin_object(&mut self, _length: Option<usize>, _tag: SemanticTag, _ctx: &Context) -> bool {
        true
    }

    fn end_object(&mut self, _ctx: &Context) -> bool {
        true
    }

    fn begin_multi_dim(&mut self, _shape: &[usize], _tag: SemanticTag, _ctx: &Context) -> bool {
        true
    }

    fn end_multi_dim(&mut self, _ctx: &Context) -> bool {
        true
    }

    /// The root item is complete.
    fn flush(&mut self, _ctx: &Context) {}
}
