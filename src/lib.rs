#![warn(clippy::all, clippy::pedantic)]
#![allow(
    clippy::doc_markdown,
    clippy::missing_errors_doc,
    clippy::missing_panics_doc,
    clippy::module_name_repetitions,
    clippy::must_use_candidate,
    clippy::needless_pass_by_value,
    clippy::return_self_not_must_use,
    clippy::similar_names,
    clippy::too_many_lines,
    clippy::uninlined_format_args
)]

//! Session core of a multi-account WhatsApp bot: pairing new accounts,
//! persisting and restoring their credentials, supervising reconnects and
//! resolving per-account settings. Chat commands plug in through
//! [`dispatch::CommandHandler`].

pub mod auth;
pub mod background;
pub mod config;
pub mod db;
pub mod dispatch;
pub mod error;
pub mod number;
pub mod pairing;
pub mod protocol;
pub mod routes;
pub mod session;
pub mod settings;
pub mod state;
pub mod store;
