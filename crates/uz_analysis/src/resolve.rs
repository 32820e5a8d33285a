//! Peeling nested formats off a stream
//!
//! [`LayerResolver`] recognizes the outermost format, decodes it when it can,
//! and repeats on the decoded bytes until it reaches an archive, a format it
//! cannot decode, or bytes it does not recognize.

use crate::{
    buffer::{StreamBuffer, StreamView},
    error::Result,
    format::{self, Format, FormatDescriptor},
};
use std::{cell::RefCell, fmt, io::Read, path::Path};

/// Default limit on the number of layers resolved
pub const DEFAULT_MAX_DEPTH: usize = 16;

/// Formats detected in a stream, outermost (the bytes on disk) first.
///
/// An empty stack means the stream is not wrapped in any known format.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LayerStack {
    layers: Vec<FormatDescriptor>,
}

impl LayerStack {
    /// Create an empty stack
    pub fn new() -> Self {
        Self::default()
    }

    /// All layers, outermost first
    pub fn layers(&self) -> &[FormatDescriptor] {
        &self.layers
    }

    /// Number of layers
    pub fn len(&self) -> usize {
        self.layers.len()
    }

    /// Whether no known format was found
    pub fn is_empty(&self) -> bool {
        self.layers.is_empty()
    }

    /// Iterate over the layers, outermost first
    pub fn iter(&self) -> std::slice::Iter<'_, FormatDescriptor> {
        self.layers.iter()
    }

    /// The format of each layer, outermost first
    pub fn formats(&self) -> Vec<Format> {
        self.layers.iter().map(FormatDescriptor::format).collect()
    }

    /// The layer holding the bytes on disk
    pub fn outermost(&self) -> Option<&FormatDescriptor> {
        self.layers.first()
    }

    /// The deepest layer that was recognized
    pub fn innermost(&self) -> Option<&FormatDescriptor> {
        self.layers.last()
    }

    /// The first layer that needs random access but sits inside another
    /// layer, together with its index.
    ///
    /// Such a layer can only be unpacked after the layers around it have been
    /// written out to a file.
    pub fn nested_non_streamable(&self) -> Option<(usize, &FormatDescriptor)> {
        self.layers
            .iter()
            .enumerate()
            .skip(1)
            .find(|(_, layer)| !layer.is_streamable())
    }

    /// Whether unpacking needs an intermediate file
    pub fn needs_two_pass(&self) -> bool {
        self.nested_non_streamable().is_some()
    }

    /// The outer layers that can be unpacked in a single pipeline, i.e. the
    /// stack cut off before [`nested_non_streamable`](Self::nested_non_streamable)
    pub fn streamable_prefix(&self) -> LayerStack {
        let end = self
            .nested_non_streamable()
            .map_or(self.layers.len(), |(index, _)| index);
        self.layers[..end].iter().cloned().collect()
    }
}

/// `gzip <- tar`; the alternate form includes each layer's metadata.
impl fmt::Display for LayerStack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, layer) in self.layers.iter().enumerate() {
            if i > 0 {
                f.write_str(" <- ")?;
            }
            if f.alternate() {
                write!(f, "{layer:#}")?;
            } else {
                write!(f, "{layer}")?;
            }
        }
        Ok(())
    }
}

impl From<Vec<FormatDescriptor>> for LayerStack {
    fn from(layers: Vec<FormatDescriptor>) -> Self {
        Self { layers }
    }
}

impl FromIterator<FormatDescriptor> for LayerStack {
    fn from_iter<I: IntoIterator<Item = FormatDescriptor>>(iter: I) -> Self {
        Self {
            layers: iter.into_iter().collect(),
        }
    }
}

impl<'a> IntoIterator for &'a LayerStack {
    type Item = &'a FormatDescriptor;
    type IntoIter = std::slice::Iter<'a, FormatDescriptor>;

    fn into_iter(self) -> Self::IntoIter {
        self.layers.iter()
    }
}

/// Detects the stack of formats wrapped around a stream
#[derive(Debug, Clone)]
pub struct LayerResolver {
    max_depth: usize,
}

impl LayerResolver {
    /// Create a resolver with default settings
    pub fn new() -> Self {
        Self {
            max_depth: DEFAULT_MAX_DEPTH,
        }
    }

    /// Stop after this many layers, treating the last one as terminal
    pub fn with_max_depth(mut self, max_depth: usize) -> Self {
        self.max_depth = max_depth.max(1);
        self
    }

    /// Resolve the layers of a stream.
    ///
    /// Only as much of `source` is read as recognizing each layer needs.
    /// A layer that is recognized but fails to decode is an error.
    pub fn resolve<R: Read>(&self, mut source: R) -> Result<LayerStack> {
        let mut layers = Vec::new();
        self.unravel(&mut source, &mut layers)?;
        Ok(LayerStack::from(layers))
    }

    /// Resolve the layers of a file
    pub fn resolve_file(&self, path: &Path) -> Result<LayerStack> {
        let file = fs_err::File::open(path)?;
        self.resolve(file)
    }

    fn unravel(&self, source: &mut dyn Read, layers: &mut Vec<FormatDescriptor>) -> Result<()> {
        let buffer = RefCell::new(StreamBuffer::new(source));

        let descriptor = {
            let mut buffer = buffer.borrow_mut();
            format::recognize(&mut *buffer)?
        };
        let Some(descriptor) = descriptor else {
            tracing::debug!(depth = layers.len(), "no further known format");
            return Ok(());
        };

        tracing::debug!(
            depth = layers.len(),
            format = descriptor.name(),
            metadata = ?descriptor.metadata(),
            "matched layer"
        );
        let format = descriptor.format();
        layers.push(descriptor);

        if format.is_archive() {
            return Ok(());
        }
        if layers.len() >= self.max_depth {
            tracing::warn!(
                max_depth = self.max_depth,
                "layer limit reached, not looking inside {format}"
            );
            return Ok(());
        }

        // Recognizers only peek, so the decoder starts at the first byte.
        // The decoder borrows `buffer` and has to be dropped before it.
        let result = match format.open(StreamView::new(&buffer, 0))? {
            Some(mut decoded) => self.unravel(&mut *decoded, layers),
            None => Ok(()),
        };
        result
    }
}

impl Default for LayerResolver {
    fn default() -> Self {
        Self::new()
    }
}

/// Resolve the layers of a stream with default settings
pub fn resolve<R: Read>(source: R) -> Result<LayerStack> {
    LayerResolver::new().resolve(source)
}
