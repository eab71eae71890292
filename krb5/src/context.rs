mod profile;

use self::profile::Profile;
use crate::credential_cache::{CcRegistry, Ops};
use crate::Flags;
use nix::unistd::{Gid, Uid};
use std::env;

const DEFAULT_CCACHE_TYPE: i32 = 4;
const DEFAULT_KDC_TIMESYNC: i32 = 1;
const KRB5_LIBOPT_SYNC_KDCTIME: Flags = 0x0001;
const KRB5_OS_TOFFSET_VALID: Flags = 1;

pub struct Conf;

macro_rules! conf {
    ($name:ident, $value:expr) => {
        pub const $name: &'static str = $value;
    };
}

impl Conf {
    conf!(LIBDEFAULTS, "libdefaults");
    conf!(DEFAULT_CCACHE_NAME, "default_cc_name");
    conf!(DEFAULT_CCACHE_TYPE, "default_cc_type");
    conf!(CCACHE_TYPE, "ccache_type");
    conf!(KDC_TIMESYNC, "kdc_timesync");
}

/// Returns true when the process is running set-UID or set-GID, i.e. its
/// real and effective credentials differ. Environment-variable inputs that
/// influence the default cache name are ignored whenever this is true.
pub fn issuid() -> bool {
    Uid::current() != Uid::effective() || Gid::current() != Gid::effective()
}

/// A Kerberos context: the ambient configuration, OS-derived state and
/// credential-cache registry that every CC core operation is threaded
/// through. There is no global state beyond what an individual backend
/// documents (the built-in `MEMORY` backend's process-wide cache table).
pub struct Context {
    pub os_context: OsContext,
    pub profile: Profile,
    pub library_options: Flags,
    pub fcc_default_format: i32,
    pub(crate) cc_registry: CcRegistry,
    pub(crate) default_cc_name: Option<String>,
    pub(crate) default_cc_name_env: Option<String>,
    pub(crate) default_cc_name_set: bool,
}

impl Context {
    pub fn init() -> anyhow::Result<Self> {
        Self::new(false)
    }

    pub fn init_secure() -> anyhow::Result<Self> {
        Self::new(true)
    }

    pub fn new(secure: bool) -> anyhow::Result<Self> {
        let os_context = OsContext::new();
        let profile = Profile::new(secure)?;

        let library_options =
            if Self::get_int(&profile, Conf::KDC_TIMESYNC, DEFAULT_KDC_TIMESYNC) > 0 {
                KRB5_LIBOPT_SYNC_KDCTIME
            } else {
                0
            };

        let fcc_default_format =
            Self::get_int(&profile, Conf::CCACHE_TYPE, DEFAULT_CCACHE_TYPE) + 0x0500;

        Ok(Self {
            os_context,
            profile,
            library_options,
            fcc_default_format,
            cc_registry: CcRegistry::with_builtins(),
            default_cc_name: None,
            default_cc_name_env: None,
            default_cc_name_set: false,
        })
    }

    fn get_int(profile: &Profile, name: &str, default: i32) -> i32 {
        profile
            .get_int(&format!("{}.{}", Conf::LIBDEFAULTS, name))
            .map(|v| v as i32)
            .unwrap_or(default)
    }

    pub(crate) fn get_string(&self, name: &str) -> Option<String> {
        self.profile
            .get_string(&format!("{}.{}", Conf::LIBDEFAULTS, name))
    }

    pub fn expand_path_tokens(path: &str) -> anyhow::Result<String> {
        let mut buf = vec![];
        let mut path_remained = &path[0..];
        while !path_remained.is_empty() {
            let token_begin = match path_remained.find("%{") {
                Some(token_begin) => {
                    buf.append(&mut path_remained[..token_begin].as_bytes().to_vec());
                    token_begin
                }
                None => {
                    buf.append(&mut path_remained.as_bytes().to_vec());
                    break;
                }
            };
            let token_end = match path_remained[token_begin..].find('}') {
                Some(token_end) => token_begin + token_end,
                None => Err(crate::Error::KRB5_CONFIG_BADFORMAT)?,
            };
            let token_value = Self::expand_token(&path_remained[token_begin + 2..token_end])?;
            buf.append(&mut token_value.as_bytes().to_vec());
            path_remained = &path_remained[token_end + 1..];
        }
        Ok(String::from_utf8(buf)?)
    }

    fn expand_token(token: &str) -> anyhow::Result<String> {
        let token_value = match token {
            "uid" => Uid::current().to_string(),
            "null" => String::new(),
            _ => Err(crate::Error::KRB5_CONFIG_BADFORMAT)?,
        };
        Ok(token_value)
    }

    pub fn sync_kdctime(&self) -> bool {
        self.library_options & KRB5_LIBOPT_SYNC_KDCTIME > 0
    }

    /// Registers `ops` under its prefix, extending or replacing the
    /// built-in `FILE`/`MEMORY` backends. Fails with *type-exists* if the
    /// prefix is already registered and `override_existing` is false.
    pub fn register_backend(&mut self, ops: &'static Ops, override_existing: bool) -> anyhow::Result<()> {
        self.cc_registry.register(ops, override_existing)
    }
}

impl std::fmt::Debug for Context {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Context")
            .field("default_cc_name", &self.default_cc_name)
            .field("default_cc_name_set", &self.default_cc_name_set)
            .finish_non_exhaustive()
    }
}

#[derive(Debug)]
pub struct OsContext {
    pub time_offset: i32,
    pub usec_offset: i32,
    pub os_flags: Flags,
}

impl OsContext {
    pub fn new() -> Self {
        Self {
            time_offset: 0,
            usec_offset: 0,
            os_flags: 0,
        }
    }

    pub fn time_offset_valid(&self) -> bool {
        self.os_flags & KRB5_OS_TOFFSET_VALID > 0
    }

    pub fn set_time_offset_valid(&mut self) {
        self.os_flags |= KRB5_OS_TOFFSET_VALID;
    }
}

impl Default for OsContext {
    fn default() -> Self {
        Self::new()
    }
}

pub(crate) fn env_ccname() -> Option<String> {
    if issuid() {
        None
    } else {
        env::var(super::credential_cache::KRB5_ENV_CCNAME).ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn expand_path_tokens_literal() {
        assert_eq!(Context::expand_path_tokens("literal").unwrap(), "literal");
    }

    #[test]
    fn expand_path_tokens_null() {
        assert_eq!(Context::expand_path_tokens("%{null}").unwrap(), "");
    }

    #[test]
    fn expand_path_tokens_uid() {
        let expanded = Context::expand_path_tokens("/tmp/ccache_%{uid}").unwrap();
        assert_eq!(expanded, format!("/tmp/ccache_{}", Uid::current()));
    }

    #[test]
    fn expand_path_tokens_missing_brace_is_bad_format() {
        assert!(Context::expand_path_tokens("bad%{").is_err());
    }

    #[test]
    fn expand_path_tokens_unknown_variable_is_bad_format() {
        assert!(Context::expand_path_tokens("bad%{unknown}").is_err());
    }
}
