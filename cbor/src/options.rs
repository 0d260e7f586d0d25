/// Decode-time limits.
#[derive(Debug, Clone)]
pub struct DecodeOptions {
    max_nesting_depth: usize,
}

impl Default for DecodeOptions {
    fn default() -> Self {
        Self {
            max_nesting_depth: 1024,
        }
    }
}

impl DecodeOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// The deepest container nesting the parser will enter.
    pub fn max_nesting_depth(&self) -> usize {
        self.max_nesting_depth
    }

    pub fn with_max_nesting_depth(mut self, depth: usize) -> Self {
        self.max_nesting_depth = depth;
        self
    }
}
