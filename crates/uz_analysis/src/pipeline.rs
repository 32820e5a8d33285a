//! Output names and external unpack commands for a layer stack
//!
//! Nothing here runs a process; the commands are argument lists for whoever
//! orchestrates the pipeline. The first command reads the input file and
//! every later one reads the previous command's output from stdin.

use crate::{
    error::{Result, UnravelError},
    format::Format,
    resolve::LayerStack,
};

/// What the pipeline should do with the innermost archive
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Action {
    /// Show the archive's entries
    List,
    /// Unpack the archive's entries
    Extract,
}

/// Options for building unpack commands
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOptions {
    verbose: bool,
}

impl CommandOptions {
    /// Create options with default settings
    pub fn new() -> Self {
        Self::default()
    }

    /// Ask the archive tools for verbose output.
    ///
    /// Tar gets `-v`, zip and rar listings switch to their verbose listing
    /// (`unzip -v`, `unrar v`) and 7z gets `-bb1`. `unzip` and `unrar x`
    /// already name every entry they extract, so extraction commands for
    /// zip and rar are unchanged, as are the compression tools.
    pub fn with_verbose(mut self, verbose: bool) -> Self {
        self.verbose = verbose;
        self
    }

    /// Whether verbose output was requested
    pub fn verbose(&self) -> bool {
        self.verbose
    }
}

/// The arguments of one external command, program first
pub type Command = Vec<String>;

/// Strip each layer's extension from `filename`, outermost layer first.
///
/// `archive.tar.gz` with a `gzip <- tar` stack becomes `archive`. Matching is
/// case-insensitive, and a compression layer right outside tar may use the
/// short combined form (`.tgz`, `.tbz2`, `.txz`, ...).
pub fn get_filename(stack: &LayerStack, filename: &str) -> Result<String> {
    let layers = stack.layers();
    let mut name = filename.to_string();
    let mut i = 0;

    while i < layers.len() {
        let format = layers[i].format();

        let wraps_tar = layers.get(i + 1).map(|layer| layer.format()) == Some(Format::Tar);
        let alias = if wraps_tar {
            format
                .tar_aliases()
                .iter()
                .find_map(|alias| strip_suffix_ignore_case(&name, alias))
        } else {
            None
        };

        let (stripped, consumed) = match alias {
            Some(stripped) => (stripped, 2),
            None => {
                let extension = format.extension();
                let stripped = strip_suffix_ignore_case(&name, extension).ok_or_else(|| {
                    UnravelError::malformed_header(
                        "extension",
                        format!("{name:?} does not end in {extension:?} as a {format} file should"),
                    )
                })?;
                (stripped, 1)
            }
        };

        if stripped.is_empty() {
            return Err(UnravelError::malformed_header(
                "extension",
                format!("nothing is left of {filename:?} once the extensions are removed"),
            ));
        }
        name = stripped;
        i += consumed;
    }

    Ok(name)
}

fn strip_suffix_ignore_case(name: &str, suffix: &str) -> Option<String> {
    let split = name.len().checked_sub(suffix.len())?;
    if !name.is_char_boundary(split) {
        return None;
    }
    let (stem, tail) = name.split_at(split);
    tail.eq_ignore_ascii_case(suffix).then(|| stem.to_string())
}

/// Build the commands that list or extract `filename`, in pipe order.
///
/// Layers are handled innermost first; a gzip, bzip2 or xz layer directly
/// around a tar archive is folded into the tar invocation. Formats that need
/// random access (zip, rar, 7z) cannot sit at the end of a pipe, so when one
/// is nested inside another layer the commands stop at the layer around it
/// and the caller has to unpack that to a file first
/// (see [`LayerStack::needs_two_pass`]).
pub fn get_command(
    stack: &LayerStack,
    action: Action,
    options: &CommandOptions,
    filename: &str,
) -> Vec<Command> {
    if let Some((index, layer)) = stack.nested_non_streamable() {
        tracing::warn!(
            layer = index,
            "{} cannot be read from a pipe; the layers around it have to be unpacked to a file first",
            layer.name()
        );
    }
    let stack = stack.streamable_prefix();
    let layers = stack.layers();

    let mut commands = Vec::with_capacity(layers.len());
    let mut i = layers.len();
    while i > 0 {
        i -= 1;
        let format = layers[i].format();

        let tar_compression = match (format, i.checked_sub(1)) {
            (Format::Tar, Some(outer)) => layers[outer].format().tar_flag(),
            _ => None,
        };
        if tar_compression.is_some() {
            i -= 1;
        }

        let input = (i == 0).then_some(filename);
        let command = match format {
            Format::Gzip | Format::Bzip2 | Format::Xz => decompress_command(format, input),
            Format::Tar => tar_command(action, options, tar_compression, input),
            Format::Zip | Format::Rar | Format::SevenZip => {
                archive_command(format, action, options, input.unwrap_or("-"))
            }
        };
        commands.push(command);
    }

    commands.reverse();
    commands
}

fn decompress_command(format: Format, input: Option<&str>) -> Command {
    let program = match format {
        Format::Bzip2 => "bzip2",
        Format::Xz => "xz",
        _ => "gzip",
    };
    let mut command = vec![program.to_string(), "-d".to_string(), "-c".to_string()];
    command.extend(input.map(str::to_string));
    command
}

fn tar_command(
    action: Action,
    options: &CommandOptions,
    compression: Option<&str>,
    input: Option<&str>,
) -> Command {
    let mode = match action {
        Action::List => "-t",
        Action::Extract => "-x",
    };
    let mut command = vec!["tar".to_string(), mode.to_string()];
    if options.verbose() {
        command.push("-v".to_string());
    }
    command.extend(compression.map(str::to_string));
    command.push("-f".to_string());
    command.push(input.unwrap_or("-").to_string());
    command
}

fn archive_command(format: Format, action: Action, options: &CommandOptions, input: &str) -> Command {
    let verbose = options.verbose();
    let args: &[&str] = match (format, action) {
        (Format::Zip, Action::List) if verbose => &["unzip", "-v"],
        (Format::Zip, Action::List) => &["unzip", "-l"],
        (Format::Rar, Action::List) if verbose => &["unrar", "v"],
        (Format::Rar, Action::List) => &["unrar", "l"],
        (Format::Rar, Action::Extract) => &["unrar", "x"],
        (Format::SevenZip, Action::List) => &["7z", "l"],
        (Format::SevenZip, Action::Extract) => &["7z", "x"],
        _ => &["unzip"],
    };

    let mut command: Command = args.iter().map(|arg| arg.to_string()).collect();
    command.push(input.to_string());
    if format == Format::SevenZip && verbose {
        command.push("-bb1".to_string());
    }
    command
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::FormatDescriptor;
    use assert_matches::assert_matches;
    use rstest::rstest;

    fn stack(formats: &[Format]) -> LayerStack {
        formats.iter().copied().map(FormatDescriptor::new).collect()
    }

    fn commands(raw: &[&[&str]]) -> Vec<Command> {
        raw.iter()
            .map(|command| command.iter().map(|arg| arg.to_string()).collect())
            .collect()
    }

    #[rstest]
    #[case::tar_gz(&[Format::Gzip, Format::Tar], "archive.tar.gz", "archive")]
    #[case::upper_case(&[Format::Gzip, Format::Tar], "ARCHIVE.TAR.GZ", "ARCHIVE")]
    #[case::tgz(&[Format::Gzip, Format::Tar], "archive.tgz", "archive")]
    #[case::tbz2(&[Format::Bzip2, Format::Tar], "archive.tbz2", "archive")]
    #[case::txz(&[Format::Xz, Format::Tar], "archive.txz", "archive")]
    #[case::plain_xz(&[Format::Xz], "data.txt.xz", "data.txt")]
    #[case::zip_in_gzip(&[Format::Gzip, Format::Zip], "bundle.zip.gz", "bundle")]
    #[case::double_gzip(&[Format::Gzip, Format::Gzip], "twice.gz.gz", "twice")]
    #[case::nothing_to_strip(&[], "notes.txt", "notes.txt")]
    fn test_get_filename(#[case] formats: &[Format], #[case] filename: &str, #[case] expected: &str) {
        assert_eq!(get_filename(&stack(formats), filename).unwrap(), expected);
    }

    #[rstest]
    #[case::wrong_compression(&[Format::Gzip, Format::Tar], "archive.tar.bz2")]
    #[case::missing_tar(&[Format::Gzip, Format::Tar], "archive.gz")]
    #[case::alias_without_tar(&[Format::Gzip], "archive.tgz")]
    #[case::only_extension(&[Format::Gzip], ".gz")]
    fn test_get_filename_mismatch(#[case] formats: &[Format], #[case] filename: &str) {
        assert_matches!(
            get_filename(&stack(formats), filename),
            Err(UnravelError::MalformedHeader { field, .. }) if field == "extension"
        );
    }

    #[test]
    fn test_tar_gz_is_one_command() {
        let stack = stack(&[Format::Gzip, Format::Tar]);
        assert_eq!(
            get_command(&stack, Action::Extract, &CommandOptions::new(), "a.tar.gz"),
            commands(&[&["tar", "-x", "-z", "-f", "a.tar.gz"]])
        );
        assert_eq!(
            get_command(
                &stack,
                Action::List,
                &CommandOptions::new().with_verbose(true),
                "a.tar.gz"
            ),
            commands(&[&["tar", "-t", "-v", "-z", "-f", "a.tar.gz"]])
        );
    }

    #[test]
    fn test_only_the_layer_next_to_tar_is_folded() {
        let stack = stack(&[Format::Xz, Format::Bzip2, Format::Tar]);
        assert_eq!(
            get_command(&stack, Action::Extract, &CommandOptions::new(), "a.tar.bz2.xz"),
            commands(&[
                &["xz", "-d", "-c", "a.tar.bz2.xz"],
                &["tar", "-x", "-j", "-f", "-"],
            ])
        );
    }

    #[test]
    fn test_compressed_file_without_archive() {
        let stack = stack(&[Format::Gzip, Format::Bzip2]);
        assert_eq!(
            get_command(&stack, Action::Extract, &CommandOptions::new(), "f.bz2.gz"),
            commands(&[&["gzip", "-d", "-c", "f.bz2.gz"], &["bzip2", "-d", "-c"]])
        );
    }

    #[test]
    fn test_plain_tar() {
        let stack = stack(&[Format::Tar]);
        assert_eq!(
            get_command(&stack, Action::List, &CommandOptions::new(), "a.tar"),
            commands(&[&["tar", "-t", "-f", "a.tar"]])
        );
    }

    #[rstest]
    #[case::zip_list(Format::Zip, Action::List, false, &["unzip", "-l", "f"])]
    #[case::zip_list_verbose(Format::Zip, Action::List, true, &["unzip", "-v", "f"])]
    #[case::zip_extract(Format::Zip, Action::Extract, true, &["unzip", "f"])]
    #[case::rar_list(Format::Rar, Action::List, false, &["unrar", "l", "f"])]
    #[case::rar_list_verbose(Format::Rar, Action::List, true, &["unrar", "v", "f"])]
    #[case::rar_extract(Format::Rar, Action::Extract, false, &["unrar", "x", "f"])]
    #[case::rar_extract_verbose(Format::Rar, Action::Extract, true, &["unrar", "x", "f"])]
    #[case::sevenz_extract(Format::SevenZip, Action::Extract, false, &["7z", "x", "f"])]
    #[case::sevenz_list_verbose(Format::SevenZip, Action::List, true, &["7z", "l", "f", "-bb1"])]
    fn test_archive_commands(
        #[case] format: Format,
        #[case] action: Action,
        #[case] verbose: bool,
        #[case] expected: &[&str],
    ) {
        let options = CommandOptions::new().with_verbose(verbose);
        assert_eq!(
            get_command(&stack(&[format]), action, &options, "f"),
            commands(&[expected])
        );
    }

    #[tracing_test::traced_test]
    #[test]
    fn test_nested_zip_is_left_for_a_second_pass() {
        let stack = stack(&[Format::Gzip, Format::Zip]);
        assert!(stack.needs_two_pass());
        assert_eq!(
            get_command(&stack, Action::Extract, &CommandOptions::new(), "a.zip.gz"),
            commands(&[&["gzip", "-d", "-c", "a.zip.gz"]])
        );
        assert!(logs_contain("cannot be read from a pipe"));
    }

    #[test]
    fn test_empty_stack_has_no_commands() {
        assert!(get_command(&LayerStack::new(), Action::Extract, &CommandOptions::new(), "f").is_empty());
    }
}
