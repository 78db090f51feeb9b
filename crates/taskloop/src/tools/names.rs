//! Canonical tool name constants.
//!
//! All tool-name string literals should reference these constants to avoid
//! scattered magic strings.

pub const READ_FILE: &str = "read_file";
pub const WRITE_FILE: &str = "write_file";
pub const LIST_DIRECTORY: &str = "list_directory";
pub const DELETE_FILE: &str = "delete_file";
pub const HTTP_GET: &str = "http_get";
pub const PYTHON_EXECUTE: &str = "python_execute";
