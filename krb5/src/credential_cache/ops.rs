use super::{Credential, CredentialCache};
use crate::{Context, Flags, Principal};
use std::any::Any;
use std::sync::{Arc, Mutex};

pub type BackendState = Box<dyn Any + Send>;

/// The vtable a credential-cache backend registers under a prefix.
///
/// Operations the backend does not implement are represented as `None`
/// rather than a stub that returns an error, so callers can match on
/// `Option` instead of probing behavior at runtime.
pub struct Ops {
    pub prefix: &'static str,
    pub resolve: fn(&mut Context, &str) -> anyhow::Result<Arc<Mutex<CredentialCache>>>,
    pub gen_new: fn(&mut Context, Option<&str>) -> anyhow::Result<Arc<Mutex<CredentialCache>>>,
    pub init: fn(&mut Context, &mut CredentialCache, &Principal) -> anyhow::Result<()>,
    pub destroy: fn(&mut Context, &mut CredentialCache) -> anyhow::Result<()>,
    pub close: fn(&mut Context, &mut CredentialCache) -> anyhow::Result<()>,
    pub store: fn(&mut Context, &mut CredentialCache, Credential) -> anyhow::Result<()>,
    pub get_principal: fn(&mut Context, &CredentialCache) -> anyhow::Result<Principal>,
    pub credentials_iter: for<'a> fn(
        &mut Context,
        &'a mut CredentialCache,
    ) -> anyhow::Result<
        Box<dyn Iterator<Item = anyhow::Result<Arc<Mutex<Credential>>>> + 'a>,
    >,
    pub get_default_name: fn(&mut Context) -> anyhow::Result<String>,
    pub lastchange: fn(&mut Context, &CredentialCache) -> anyhow::Result<i64>,
    pub set_flags: fn(&mut Context, &mut CredentialCache, Flags) -> anyhow::Result<()>,
    pub move_cache:
        fn(&mut Context, &mut CredentialCache, &mut CredentialCache) -> anyhow::Result<()>,
    pub credential_caches:
        Option<fn(&mut Context) -> anyhow::Result<Vec<Arc<Mutex<CredentialCache>>>>>,
    pub retrieve: Option<
        fn(&mut Context, &mut CredentialCache, CredMask, &Credential) -> anyhow::Result<Option<Credential>>,
    >,
    pub remove_cred: Option<
        fn(&mut Context, &mut CredentialCache, CredMask, &Credential) -> anyhow::Result<()>,
    >,
    pub get_version: Option<fn(&mut Context, &CredentialCache) -> anyhow::Result<i32>>,
    pub set_default: Option<fn(&mut Context, &CredentialCache) -> anyhow::Result<()>>,
}

impl std::fmt::Debug for Ops {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Ops").field("prefix", &self.prefix).finish_non_exhaustive()
    }
}

/// Bitmask gating which fields of a template credential `compare_creds`
/// compares against a candidate. An empty mask matches everything.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CredMask(pub u8);

impl CredMask {
    pub const EMPTY: CredMask = CredMask(0);
    pub const SERVER: CredMask = CredMask(1 << 0);
    pub const CLIENT: CredMask = CredMask(1 << 1);
    pub const SERVER_IS_LOCAL_TGT: CredMask = CredMask(1 << 2);

    fn has(self, bit: CredMask) -> bool {
        self.0 & bit.0 != 0
    }
}

impl std::ops::BitOr for CredMask {
    type Output = CredMask;

    fn bitor(self, rhs: CredMask) -> CredMask {
        CredMask(self.0 | rhs.0)
    }
}

/// Compares `candidate` against `template` under `mask`; bit 2 treats
/// `template.server` as a wildcard for "any krbtgt of this realm".
pub fn compare_creds(mask: CredMask, template: &Credential, candidate: &Credential) -> bool {
    if mask.has(CredMask::SERVER_IS_LOCAL_TGT) {
        if !candidate.server.is_local_tgt(&template.server.realm) {
            return false;
        }
    } else if mask.has(CredMask::SERVER) && !candidate.server.matches(&template.server) {
        return false;
    }
    if mask.has(CredMask::CLIENT) && !candidate.client.matches(&template.client) {
        return false;
    }
    true
}
