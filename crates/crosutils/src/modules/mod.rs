//! One module per subcommand. Each exposes an options struct built from the
//! config file plus command-line overrides, and a `run` taking it by value.

pub mod firmware;
pub mod profile;
pub mod remote_merge;
pub mod stateful;
pub mod util;
