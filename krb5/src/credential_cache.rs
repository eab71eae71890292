mod collection;
mod config;
mod credential;
mod file_backend;
mod memory_backend;
mod ops;

pub use self::collection::CollectionCursor;
pub use self::config::is_config_principal;
pub use self::credential::{Address, AuthData, Credential, TicketTimes};
pub use self::ops::{compare_creds, BackendState, CredMask, Ops};

use self::{
    file_backend::{FileData, FCC_OPS},
    memory_backend::{MemoryData, MCC_OPS},
};
use crate::{context::env_ccname, Conf, Context, Error, Principal};
use std::{
    any::Any,
    sync::{Arc, Mutex},
};

pub(crate) const KRB5_ENV_CCNAME: &str = "KRB5CCNAME";
const DEFAULT_CC_NAME_TEMPLATE: &str = "FILE:/tmp/krb5cc_%{uid}";

/// An ordered, per-`Context` table of registered backend vtables, keyed
/// by prefix. Pre-populated with `FILE` then `MEMORY`.
pub(crate) struct CcRegistry {
    entries: Vec<&'static Ops>,
}

impl CcRegistry {
    pub(crate) fn with_builtins() -> Self {
        Self {
            entries: vec![FCC_OPS, MCC_OPS],
        }
    }

    pub(crate) fn register(&mut self, ops: &'static Ops, override_existing: bool) -> anyhow::Result<()> {
        match self.entries.iter().position(|o| o.prefix == ops.prefix) {
            Some(index) if !override_existing => {
                let _ = index;
                Err(Error::KRB5_CC_TYPE_EXISTS)?
            }
            Some(index) => {
                self.entries[index] = ops;
                Ok(())
            }
            None => {
                self.entries.push(ops);
                Ok(())
            }
        }
    }

    fn find(&self, prefix: &str) -> Option<&'static Ops> {
        self.entries.iter().find(|o| o.prefix == prefix).copied()
    }

    pub fn get_prefix_ops(&self, hint: Option<&str>) -> anyhow::Result<&'static Ops> {
        match hint {
            None => self.find("FILE").ok_or_else(|| Error::KRB5_CC_UNKNOWN_TYPE.into()),
            Some(hint) if hint.starts_with('/') => {
                self.find("FILE").ok_or_else(|| Error::KRB5_CC_UNKNOWN_TYPE.into())
            }
            Some(hint) => {
                let prefix = hint.split(':').next().unwrap_or(hint);
                self.find(prefix).ok_or_else(|| Error::KRB5_CC_UNKNOWN_TYPE.into())
            }
        }
    }

    pub(crate) fn iter(&self) -> impl Iterator<Item = &'static Ops> + '_ {
        self.entries.iter().copied()
    }
}

/// A bound credential-cache handle: a backend vtable plus whatever
/// type-erased state that backend needs (a file path, a table key, ...).
pub struct CredentialCache {
    ops: &'static Ops,
    data: BackendState,
}

impl std::fmt::Debug for CredentialCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CredentialCache")
            .field("prefix", &self.ops.prefix)
            .finish_non_exhaustive()
    }
}

impl CredentialCache {
    pub fn from_parts(ops: &'static Ops, data: BackendState) -> Self {
        Self { ops, data }
    }

    pub(crate) fn downcast_ref<T: Any>(&self) -> &T {
        self.data
            .downcast_ref::<T>()
            .expect("backend state type mismatch")
    }

    pub(crate) fn downcast_mut<T: Any>(&mut self) -> &mut T {
        self.data
            .downcast_mut::<T>()
            .expect("backend state type mismatch")
    }

    /// Priority cascade: `KRB5CCNAME` (unless set-UID), then
    /// `libdefaults.default_cc_name` (variable-expanded), then the
    /// backend named by `libdefaults.default_cc_type`'s own
    /// `get_default_name`, falling back to `FILE`'s.
    pub fn default_name(context: &mut Context) -> anyhow::Result<String> {
        Self::refresh_default_name_if_env_changed(context)?;
        if let Some(name) = context.default_cc_name.clone() {
            return Ok(name);
        }
        let name = Self::compute_default_name(context)?;
        context.default_cc_name = Some(name.clone());
        Ok(name)
    }

    fn compute_default_name(context: &mut Context) -> anyhow::Result<String> {
        if let Some(name) = env_ccname() {
            context.default_cc_name_env = Some(name.clone());
            log::debug!("default cache name taken from KRB5CCNAME");
            return Ok(name);
        }
        if let Some(template) = context.get_string(Conf::DEFAULT_CCACHE_NAME) {
            return Context::expand_path_tokens(&template);
        }
        if let Some(type_hint) = context.get_string(Conf::DEFAULT_CCACHE_TYPE) {
            if let Ok(ops) = context.cc_registry.get_prefix_ops(Some(&type_hint)) {
                return (ops.get_default_name)(context);
            }
        }
        let fallback = Context::expand_path_tokens(DEFAULT_CC_NAME_TEMPLATE)?;
        Ok(fallback)
    }

    fn refresh_default_name_if_env_changed(context: &mut Context) -> anyhow::Result<()> {
        if context.default_cc_name_set || crate::context::issuid() {
            return Ok(());
        }
        let current_env = env_ccname();
        let changed = match (&current_env, &context.default_cc_name_env) {
            (None, Some(_)) => true,
            (Some(current), cached) => cached.as_deref() != Some(current.as_str()),
            (None, None) => false,
        };
        if changed {
            log::debug!("KRB5CCNAME changed, recomputing default cache name");
            context.default_cc_name = None;
            context.default_cc_name_env = current_env;
        }
        Ok(())
    }

    /// Sets the default cache name explicitly. `None` clears the
    /// explicitly-set flag and reruns the cascade on next read.
    pub fn set_default_name(context: &mut Context, name: Option<&str>) {
        match name {
            Some(name) => {
                context.default_cc_name = Some(name.to_owned());
                context.default_cc_name_set = true;
            }
            None => {
                context.default_cc_name = None;
                context.default_cc_name_set = false;
            }
        }
    }

    pub fn default(context: &mut Context) -> anyhow::Result<Arc<Mutex<Self>>> {
        let name = Self::default_name(context)?;
        Self::resolve(context, &name)
    }

    /// `resolve(name)`: split on the first `:` unless the prefix is a
    /// single ASCII letter immediately followed by `:` (a Windows drive
    /// letter), in which case the whole string is a file path.
    pub fn resolve(context: &mut Context, name: &str) -> anyhow::Result<Arc<Mutex<Self>>> {
        let (prefix, residual) = match name.split_once(':') {
            None => {
                let ops = context.cc_registry.get_prefix_ops(None)?;
                return (ops.resolve)(context, name);
            }
            Some((p, _)) if p.len() == 1 && p.as_bytes()[0].is_ascii_alphabetic() => {
                let ops = context.cc_registry.get_prefix_ops(None)?;
                return (ops.resolve)(context, name);
            }
            Some((prefix, residual)) => (prefix, residual),
        };
        let ops = context.cc_registry.get_prefix_ops(Some(prefix))?;
        (ops.resolve)(context, residual)
    }

    /// Generates a fresh, uniquely-named cache of the given (or default)
    /// backend type. `human_hint` is advisory.
    pub fn new_unique(
        context: &mut Context,
        type_hint: Option<&str>,
        human_hint: Option<&str>,
    ) -> anyhow::Result<Arc<Mutex<Self>>> {
        let ops = context.cc_registry.get_prefix_ops(type_hint)?;
        (ops.gen_new)(context, human_hint)
    }

    pub fn initialize(&mut self, context: &mut Context, principal: &Principal) -> anyhow::Result<()> {
        (self.ops.init)(context, self, principal)
    }

    /// Erases the backing storage, then releases in-memory state. The
    /// destroy error, if any, is returned; a later `close` error never
    /// masks it.
    pub fn destroy(&mut self, context: &mut Context) -> anyhow::Result<()> {
        let destroy_result = (self.ops.destroy)(context, self);
        let close_result = (self.ops.close)(context, self);
        match destroy_result {
            Err(e) => Err(e),
            Ok(()) => close_result,
        }
    }

    pub fn close(&mut self, context: &mut Context) -> anyhow::Result<()> {
        (self.ops.close)(context, self)
    }

    pub fn store(&mut self, context: &mut Context, credential: Credential) -> anyhow::Result<()> {
        (self.ops.store)(context, self, credential)
    }

    /// Delegates to the backend's `retrieve` if present; otherwise
    /// iterates `credentials_iter` and applies `compare_creds`.
    pub fn retrieve(
        &mut self,
        context: &mut Context,
        mask: CredMask,
        template: &Credential,
    ) -> anyhow::Result<Option<Credential>> {
        if let Some(retrieve) = self.ops.retrieve {
            return retrieve(context, self, mask, template);
        }
        for candidate in self.credentials_iter(context)? {
            let candidate = candidate?;
            let locked = candidate.lock().map_err(|e| anyhow::anyhow!("{}", e))?;
            if compare_creds(mask, template, &locked) {
                return Ok(Some(locked.clone()));
            }
        }
        Ok(None)
    }

    /// Delegates to the backend's `remove_cred`, or fails with
    /// permission-denied when the backend does not support it.
    pub fn remove_cred(
        &mut self,
        context: &mut Context,
        mask: CredMask,
        template: &Credential,
    ) -> anyhow::Result<()> {
        match self.ops.remove_cred {
            Some(remove_cred) => remove_cred(context, self, mask, template),
            None => Err(Error::KRB5_CC_NOPERM)?,
        }
    }

    pub fn get_principal(&mut self, context: &mut Context) -> anyhow::Result<Principal> {
        (self.ops.get_principal)(context, self)
    }

    pub fn get_type(&self) -> &'static str {
        self.ops.prefix
    }

    pub fn get_name(&self) -> &str {
        match self.ops.prefix {
            "FILE" => &self.downcast_ref::<FileData>().name,
            "MEMORY" => &self.downcast_ref::<MemoryData>().name,
            _ => "",
        }
    }

    pub fn get_full_name(&self) -> anyhow::Result<String> {
        let name = self.get_name();
        if name.is_empty() {
            Err(Error::KRB5_CC_BADNAME)?
        }
        Ok(format!("{}:{}", self.get_type(), name))
    }

    /// Hard-wired to `0`: this framework never models per-cache flags,
    /// mirroring the asymmetry against the required `set_flags` hook.
    pub fn get_flags(&self) -> crate::Flags {
        0
    }

    pub fn set_flags(&mut self, context: &mut Context, flags: crate::Flags) -> anyhow::Result<()> {
        (self.ops.set_flags)(context, self, flags)
    }

    pub fn get_version(&self, context: &mut Context) -> anyhow::Result<Option<i32>> {
        match self.ops.get_version {
            Some(get_version) => get_version(context, self).map(Some),
            None => Ok(None),
        }
    }

    pub fn last_change_time(&self, context: &mut Context) -> anyhow::Result<i64> {
        (self.ops.lastchange)(context, self)
    }

    pub fn credentials_iter<'a>(
        &'a mut self,
        context: &mut Context,
    ) -> anyhow::Result<Box<dyn Iterator<Item = anyhow::Result<Arc<Mutex<Credential>>>> + 'a>> {
        (self.ops.credentials_iter)(context, self)
    }

    /// `switch(handle)`: makes this cache the backend's "current" one if
    /// the backend supports it; otherwise a no-op success.
    pub fn switch(&self, context: &mut Context) -> anyhow::Result<()> {
        match self.ops.set_default {
            Some(set_default) => set_default(context, self),
            None => Ok(()),
        }
    }

    /// Requires `from.prefix == to.prefix`; cross-type moves fail with
    /// *not-supported* and mutate neither handle.
    pub fn move_into(
        context: &mut Context,
        from: &mut CredentialCache,
        to: &mut CredentialCache,
    ) -> anyhow::Result<()> {
        if from.ops.prefix != to.ops.prefix {
            Err(Error::KRB5_CC_NOSUPP_CROSS_TYPE)?
        }
        (from.ops.move_cache)(context, from, to)
    }

    /// Initializes `to` with `from`'s owner principal, then copies every
    /// credential matching `mask`/`template` (or all, if `template` is
    /// absent), always releasing `from`'s iterator afterward.
    pub fn copy_cache_match(
        context: &mut Context,
        from: &mut CredentialCache,
        to: &mut CredentialCache,
        mask: CredMask,
        template: Option<&Credential>,
    ) -> anyhow::Result<u32> {
        let owner = from.get_principal(context)?;
        to.initialize(context, &owner)?;
        let mut copied = 0u32;
        let copy_result: anyhow::Result<()> = (|| {
            for candidate in from.credentials_iter(context)? {
                let candidate = candidate?;
                let credential = candidate.lock().map_err(|e| anyhow::anyhow!("{}", e))?.clone();
                let include = match template {
                    Some(template) => compare_creds(mask, template, &credential),
                    None => true,
                };
                if include {
                    to.store(context, credential)?;
                    copied += 1;
                }
            }
            Ok(())
        })();
        copy_result?;
        Ok(copied)
    }

    pub fn copy_cache(
        context: &mut Context,
        from: &mut CredentialCache,
        to: &mut CredentialCache,
    ) -> anyhow::Result<u32> {
        Self::copy_cache_match(context, from, to, CredMask::EMPTY, None)
    }
}

/// `collection_last_change_time(type_hint)`: the max `lastchange` across
/// every cache the collection cursor can open (optionally restricted to
/// one backend), skipping caches that error, `0` if none were found.
pub fn collection_last_change_time(
    context: &mut Context,
    type_hint: Option<&str>,
) -> anyhow::Result<i64> {
    let mut cursor = CollectionCursor::new(context)?;
    let mut max_change = 0i64;
    while let Some(cache) = cursor.next(context) {
        let locked = cache.lock().map_err(|e| anyhow::anyhow!("{}", e))?;
        if let Some(hint) = type_hint {
            if locked.get_type() != hint {
                continue;
            }
        }
        if let Ok(change) = locked.last_change_time(context) {
            max_change = max_change.max(change);
        }
    }
    Ok(max_change)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolve_typed_prefix_dispatches_to_matching_backend() {
        let mut context = Context::init().unwrap();
        let cache = CredentialCache::resolve(&mut context, "MEMORY:resolve_typed_prefix").unwrap();
        assert_eq!(cache.lock().unwrap().get_type(), "MEMORY");
    }

    #[test]
    fn resolve_bare_path_dispatches_to_file_backend() {
        let mut context = Context::init().unwrap();
        let cache = CredentialCache::resolve(&mut context, "/tmp/resolve_bare_path_test").unwrap();
        let locked = cache.lock().unwrap();
        assert_eq!(locked.get_type(), "FILE");
        assert_eq!(locked.get_name(), "/tmp/resolve_bare_path_test");
    }

    #[test]
    fn resolve_drive_letter_is_treated_as_file_path() {
        let mut context = Context::init().unwrap();
        let cache = CredentialCache::resolve(&mut context, "C:\\foo\\bar").unwrap();
        let locked = cache.lock().unwrap();
        assert_eq!(locked.get_type(), "FILE");
        assert_eq!(locked.get_name(), "C:\\foo\\bar");
    }

    #[test]
    fn register_duplicate_prefix_without_override_fails() {
        let mut context = Context::init().unwrap();
        let err = context.register_backend(FCC_OPS, false).unwrap_err();
        let code = err.downcast_ref::<Error>().map(|e| e.code);
        assert_eq!(code, Some(Error::KRB5_CC_TYPE_EXISTS.code));
    }

    #[test]
    fn register_duplicate_prefix_with_override_replaces_entry() {
        let mut context = Context::init().unwrap();
        context.register_backend(FCC_OPS, true).unwrap();
        assert_eq!(context.cc_registry.entries.len(), 2);
    }

    #[test]
    fn move_into_rejects_cross_backend_types() {
        let mut context = Context::init().unwrap();
        let from_arc =
            CredentialCache::resolve(&mut context, "MEMORY:move_into_cross_from").unwrap();
        let to_arc =
            CredentialCache::resolve(&mut context, "/tmp/move_into_cross_to").unwrap();
        let mut from = from_arc.lock().unwrap();
        let mut to = to_arc.lock().unwrap();
        let err = CredentialCache::move_into(&mut context, &mut from, &mut to).unwrap_err();
        let code = err.downcast_ref::<Error>().map(|e| e.code);
        assert_eq!(code, Some(Error::KRB5_CC_NOSUPP_CROSS_TYPE.code));
    }

    #[test]
    fn copy_cache_copies_every_credential() {
        let mut context = Context::init().unwrap();
        let owner = Principal::from_strs("EXAMPLE.COM", &["alice"]);
        let from_arc = CredentialCache::resolve(&mut context, "MEMORY:copy_cache_from").unwrap();
        {
            let mut from = from_arc.lock().unwrap();
            from.initialize(&mut context, &owner).unwrap();
            from.store(&mut context, Credential::config_template(
                owner.clone(),
                "k",
                None,
                Some(b"v"),
            ))
            .unwrap();
        }
        let to_arc = CredentialCache::resolve(&mut context, "MEMORY:copy_cache_to").unwrap();
        let copied = {
            let mut from = from_arc.lock().unwrap();
            let mut to = to_arc.lock().unwrap();
            CredentialCache::copy_cache(&mut context, &mut from, &mut to).unwrap()
        };
        assert_eq!(copied, 1);
        assert_eq!(
            to_arc.lock().unwrap().get_principal(&mut context).unwrap(),
            owner
        );
    }
}
