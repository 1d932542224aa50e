//! Standard wording for errors reported by builtins.
//!
//! Handlers pass these to [`crate::command::CommandContext::error`] and
//! friends, which add the `prog: ` prefix.

use std::fmt::Display;

pub fn path_not_found(path: impl Display) -> String {
    format!("cannot open `{path}` (No such file or directory)")
}

pub fn permission_denied(path: impl Display) -> String {
    format!("cannot open `{path}` (permission denied)")
}

pub fn file_exists(path: impl Display) -> String {
    format!("cannot create directory `{path}`: File exists")
}

pub fn cannot_read_dir(path: impl Display) -> String {
    format!("cannot read `{path}`: Is a directory")
}

pub fn dir_not_empty(path: impl Display) -> String {
    format!("failed to remove `{path}`: Directory not empty")
}

pub fn not_a_dir(path: impl Display) -> String {
    format!("{path}: Not a directory")
}

pub fn parameter_not_specified(param: impl Display) -> String {
    format!("{param} not specified")
}

/// `invalid argument 'x'`, optionally followed by the rule it broke.
pub fn invalid_argument(param: impl Display, rule: Option<&str>) -> String {
    match rule {
        Some(rule) => format!("invalid argument '{param}': {rule}"),
        None => format!("invalid argument '{param}'"),
    }
}

pub fn too_many_args() -> String {
    "too many arguments".to_string()
}

/// Pick the standard message for an IO error on `path`.
pub fn for_io_error(path: impl Display, err: &std::io::Error) -> String {
    match err.kind() {
        std::io::ErrorKind::NotFound => path_not_found(path),
        std::io::ErrorKind::PermissionDenied => permission_denied(path),
        std::io::ErrorKind::AlreadyExists => file_exists(path),
        std::io::ErrorKind::IsADirectory => cannot_read_dir(path),
        std::io::ErrorKind::NotADirectory => not_a_dir(path),
        std::io::ErrorKind::DirectoryNotEmpty => dir_not_empty(path),
        _ => format!("{path}: {err}"),
    }
}
