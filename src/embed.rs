//! Embed a text file as a C string constant.
//!
//! Each input line is right-trimmed, escaped and emitted as one string
//! literal ending in `\n`; adjacent literals concatenate at compile time.
//!
//! ```text
//! /*
//!  * NB:  This file is machine generated, DO NOT EDIT!
//!  *
//!  * Edit builtin.vcl instead and run make
//!  *
//!  */
//!
//! const char * const builtin_text =
//! 	"vcl 4.1;\n"
//! 	"sub vcl_recv { return (pass); }\n";
//! ```

use std::fs::File;
use std::io::{self, BufRead, BufReader};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::debug;

/// Output options.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EmbedOptions {
    /// Name of the generated constant.
    pub name: String,
    /// Headers to `#include` before the constant.
    pub includes: Vec<String>,
}

impl Default for EmbedOptions {
    fn default() -> Self {
        Self {
            name: "builtin_text".to_string(),
            includes: Vec::new(),
        }
    }
}

#[derive(Debug, Error)]
pub enum EmbedError {
    #[error("failed to read '{}': {source}", .path.display())]
    Input { path: PathBuf, source: io::Error },
    #[error("failed to write '{}': {source}", .path.display())]
    Output { path: PathBuf, source: io::Error },
}

/// Generate `output` from `input` with default options.
pub fn generate(input: impl AsRef<Path>, output: impl AsRef<Path>) -> Result<usize, EmbedError> {
    generate_with(input, output, &EmbedOptions::default())
}

/// Generate `output` from `input`. Returns the number of embedded lines.
pub fn generate_with(
    input: impl AsRef<Path>,
    output: impl AsRef<Path>,
    options: &EmbedOptions,
) -> Result<usize, EmbedError> {
    let input = input.as_ref();
    let output = output.as_ref();
    let input_err = |source| EmbedError::Input {
        path: input.to_path_buf(),
        source,
    };

    let reader = BufReader::new(File::open(input).map_err(input_err)?);
    let lines = reader
        .lines()
        .collect::<io::Result<Vec<_>>>()
        .map_err(input_err)?;

    let source_name = input
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| input.display().to_string());

    let rendered = render(&source_name, lines.as_slice(), options);
    std::fs::write(output, rendered).map_err(|source| EmbedError::Output {
        path: output.to_path_buf(),
        source,
    })?;

    debug!(input = %input.display(), output = %output.display(), lines = lines.len(), "Embedded text");
    Ok(lines.len())
}

/// Render the generated source for `lines`.
pub fn render<S: AsRef<str>>(source_name: &str, lines: &[S], options: &EmbedOptions) -> String {
    let mut out = String::new();
    out.push_str("/*\n");
    out.push_str(" * NB:  This file is machine generated, DO NOT EDIT!\n");
    out.push_str(" *\n");
    out.push_str(&format!(" * Edit {source_name} instead and run make\n"));
    out.push_str(" *\n");
    out.push_str(" */\n");
    for include in &options.includes {
        out.push_str(&format!("#include \"{include}\"\n"));
    }
    out.push('\n');
    out.push_str(&format!("const char * const {} =\n", options.name));

    if lines.is_empty() {
        out.push_str("\t\"\"");
    } else {
        let literals: Vec<String> = lines
            .iter()
            .map(|line| format!("\t\"{}\\n\"", escape(line.as_ref().trim_end())))
            .collect();
        out.push_str(&literals.join("\n"));
    }
    out.push_str(";\n");
    out
}

/// Escape a line for use inside a C string literal.
fn escape(line: &str) -> String {
    let mut escaped = String::with_capacity(line.len());
    for c in line.chars() {
        match c {
            '\\' => escaped.push_str("\\\\"),
            '"' => escaped.push_str("\\\""),
            c => escaped.push(c),
        }
    }
    escaped
}
