use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::pipeline::Phase;

#[derive(Debug, Error)]
pub enum ClassFormatError {
    #[error("unexpected end of class file")]
    UnexpectedEof,
    #[error("invalid class file magic header {0:#010x}")]
    InvalidMagic(u32),
    #[error("unsupported class file version {major}.{minor} (supported up to {max_major})")]
    UnsupportedVersion { major: u16, minor: u16, max_major: u16 },
    #[error("unsupported constant pool tag {tag}")]
    UnsupportedConstant { tag: u8 },
    #[error("invalid constant pool index {index}")]
    InvalidConstantIndex { index: u16 },
    #[error("constant pool entry {index} is not a {expected}")]
    UnexpectedConstant { index: u16, expected: &'static str },
    #[error("invalid modified UTF-8 string in constant pool")]
    InvalidUtf8,
    #[error("constant pool is full")]
    ConstantPoolOverflow,
    #[error("malformed descriptor: {0}")]
    InvalidDescriptor(String),
    #[error("malformed annotation element tag '{tag}'")]
    InvalidElementTag { tag: char },
    #[error("invalid opcode {opcode:#04x} at offset {offset}")]
    InvalidOpcode { opcode: u8, offset: u32 },
    #[error("branch at offset {offset} targets {target}, which is not an instruction boundary")]
    InvalidBranchTarget { offset: u32, target: i64 },
    #[error("branch from {from} to {to} does not fit a 16-bit offset")]
    BranchOutOfRange { from: u32, to: u32 },
    #[error("offset {offset} in {table} is not an instruction boundary")]
    InvalidTableOffset { table: &'static str, offset: u32 },
    #[error("invalid stack map frame type {frame_type}")]
    InvalidFrameType { frame_type: u8 },
    #[error("operand stack underflow at offset {offset}")]
    StackUnderflow { offset: u32 },
    #[error("code of method {method} exceeds 65535 bytes")]
    CodeTooLarge { method: String },
    #[error("{count} trailing bytes after class file")]
    TrailingBytes { count: usize },
    #[error("attribute {name} has length {declared} but {actual} bytes were consumed")]
    AttributeLength {
        name: String,
        declared: usize,
        actual: usize,
    },
}

#[derive(Debug, Error)]
pub enum WeaveError {
    #[error("malformed class {entry}: {source}")]
    Format {
        entry: String,
        #[source]
        source: ClassFormatError,
    },
    #[error("i/o failure on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("configuration error: {0}")]
    Configuration(String),
    #[error("{phase} did not finish within {timeout:?} ({pending} tasks still running)")]
    Timeout {
        phase: Phase,
        pending: usize,
        timeout: Duration,
    },
    #[error("{phase} failed: {failures} task(s) did not complete: {first}")]
    PhaseFailed {
        phase: Phase,
        failures: usize,
        first: String,
    },
    #[error("provider synthesis failed: {0:#}")]
    Synthesis(anyhow::Error),
    #[error("registry state store failed: {0:#}")]
    State(anyhow::Error),
}

impl WeaveError {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    pub fn format(entry: impl Into<String>, source: ClassFormatError) -> Self {
        Self::Format {
            entry: entry.into(),
            source,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn format_errors_name_the_entry() {
        let error = WeaveError::format("com/example/Broken.class", ClassFormatError::UnexpectedEof);
        assert_eq!(
            error.to_string(),
            "malformed class com/example/Broken.class: unexpected end of class file"
        );
        assert!(std::error::Error::source(&error).is_some());
    }
}
