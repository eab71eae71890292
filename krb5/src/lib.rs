mod context;
mod credential_cache;
mod crypto;
mod error;
pub mod fmt;
mod principal;

pub use self::{
    context::{Conf, Context},
    credential_cache::{
        collection_last_change_time, compare_creds, is_config_principal, Address, AuthData,
        BackendState, CollectionCursor, CredMask, Credential, CredentialCache, Ops, TicketTimes,
    },
    crypto::{Enctype, Keyblock},
    error::{Error, ErrorCode},
    principal::{NameType, Principal},
};
use std::process::ExitCode;

pub const BUFSIZ: usize = 1024;

pub type Flags = i32;

pub fn prefix_progname_to_error_if_needed(
    progname: &str,
    result: anyhow::Result<()>,
    status_only: bool,
) -> ExitCode {
    match (result, status_only) {
        (Ok(_), _) => ExitCode::SUCCESS,
        (Err(_), true) => ExitCode::FAILURE,
        (Err(err), false) if err.to_string().is_empty() => ExitCode::FAILURE,
        (Err(err), false) if err.to_string().starts_with(&format!("Usage: {}", progname)) => {
            eprintln!("{:?}", err);
            ExitCode::FAILURE
        }
        (Err(err), false) => {
            eprintln!("{}: {:?}", progname, err);
            ExitCode::FAILURE
        }
    }
}
