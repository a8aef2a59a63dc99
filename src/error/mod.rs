mod types;

pub use types::{Result, ShellError};
