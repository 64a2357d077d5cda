pub mod text;

pub use text::{normalize_spaces, tail_chars, trim_to_chars};
