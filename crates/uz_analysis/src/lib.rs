//! Detect which compression and archive formats are wrapped around a file
//!
//! This crate looks at the first few bytes of a stream, recognizes the
//! outermost format, decodes it on the fly where it can and repeats on the
//! decoded bytes. The result is a [`LayerStack`] such as `gzip <- tar`, from
//! which [`get_command`] derives the external commands that unpack the file
//! and [`get_filename`] the name of the unpacked result.
//!
//! # Features
//!
//! - Recognizes xz, gzip, bzip2, zip, tar, rar and 7z
//! - Works on forward-only sources such as pipes and reads only as much as
//!   recognition needs
//! - Decodes gzip, bzip2 and xz layers in-process to look inside them
//! - Archives (zip, tar, rar, 7z) end the stack, their entries are never read
//!
//! # Examples
//!
//! ## Resolving a file
//!
//! ```no_run
//! use uz_analysis::{get_command, get_filename, Action, CommandOptions, LayerResolver};
//! use std::path::Path;
//!
//! let stack = LayerResolver::new().resolve_file(Path::new("archive.tar.gz"))?;
//! println!("archive.tar.gz: {stack}");
//!
//! for command in get_command(&stack, Action::Extract, &CommandOptions::new(), "archive.tar.gz") {
//!     println!("  {}", command.join(" "));
//! }
//! println!("unpacks to {}", get_filename(&stack, "archive.tar.gz")?);
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```
//!
//! ## Resolving a stream
//!
//! ```
//! use uz_analysis::{resolve, Format};
//!
//! let stack = resolve(&b"not compressed at all"[..])?;
//! assert!(stack.is_empty());
//!
//! let stack = resolve(&b"PK\x03\x04\x14\x00\x00\x00\x08\x00"[..])?;
//! assert_eq!(stack.formats(), vec![Format::Zip]);
//! assert_eq!(format!("{stack:#}"), "zip(min_version=20, flags=0, compression_method=8)");
//! # Ok::<(), uz_analysis::UnravelError>(())
//! ```

pub mod buffer;
pub mod decompress;
pub mod error;
pub mod format;
pub mod gzip;
pub mod pipeline;
pub mod resolve;

pub use buffer::{StreamBuffer, StreamView};
pub use decompress::{BlockDecompressor, Bzip2Decompressor, DecompressingReader, XzDecompressor};
pub use error::{Result, UnravelError};
pub use format::{Format, FormatDescriptor, MetadataValue};
pub use gzip::{GzipHeader, GzipReader};
pub use pipeline::{get_command, get_filename, Action, Command, CommandOptions};
pub use resolve::{resolve, LayerResolver, LayerStack};
