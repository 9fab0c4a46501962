#![warn(
    // Base lints.
    clippy::all,
    // Some pedantic lints.
    clippy::pedantic,
    // New lints which are cool.
    clippy::nursery,
)]
#![
    allow(
        // I don't care about this.
        clippy::module_name_repetitions,
        // Yo, the hell you should put
        // it in docs, if signature is clear as sky.
        clippy::missing_errors_doc
    )
]
pub mod access;
pub mod args;
pub mod commands;
pub mod config_writer;
pub mod control_plane;
pub mod error;
pub mod identity;
pub mod mail;
pub mod permissions;
pub mod pipeline;
pub mod request;
pub mod retriever;
pub mod utils;
