use super::ops::{compare_creds, CredMask, Ops};
use super::{Credential, CredentialCache};
use crate::{Context, Error, Principal};
use once_cell::sync::Lazy;
use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex,
    },
};

static UNIQUE_COUNTER: AtomicU64 = AtomicU64::new(0);

pub(super) const MCC_OPS: &Ops = &Ops {
    prefix: "MEMORY",
    resolve,
    gen_new,
    init,
    destroy,
    close,
    store,
    get_principal,
    credentials_iter,
    get_default_name,
    lastchange,
    set_flags,
    move_cache,
    credential_caches: Some(credential_caches),
    retrieve: None,
    remove_cred: Some(remove_cred),
    get_version: None,
    set_default: None,
};

/// Shared across every `Context` in the process, matching the reference
/// implementation's single process-wide MEMORY table.
static MEMORY_CACHES: Lazy<Mutex<HashMap<String, Arc<Mutex<CredentialCache>>>>> =
    Lazy::new(|| Mutex::new(HashMap::new()));

#[derive(Debug)]
pub(super) struct MemoryData {
    pub(super) name: String,
    pub(super) principal: Option<Principal>,
    pub(super) time_offset: i32,
    pub(super) usec_offset: i32,
    pub(super) credentials: Vec<Arc<Mutex<Credential>>>,
    pub(super) last_change: i64,
}

impl MemoryData {
    fn empty(name: &str) -> Self {
        Self {
            name: name.to_owned(),
            principal: None,
            time_offset: 0,
            usec_offset: 0,
            credentials: vec![],
            last_change: 0,
        }
    }
}

fn table() -> anyhow::Result<std::sync::MutexGuard<'static, HashMap<String, Arc<Mutex<CredentialCache>>>>>
{
    MEMORY_CACHES.lock().map_err(|e| anyhow::anyhow!("{}", e))
}

fn state(cache: &CredentialCache) -> &MemoryData {
    cache.downcast_ref::<MemoryData>()
}

fn state_mut(cache: &mut CredentialCache) -> &mut MemoryData {
    cache.downcast_mut::<MemoryData>()
}

fn resolve(context: &mut Context, name: &str) -> anyhow::Result<Arc<Mutex<CredentialCache>>> {
    let existing = table()?.get(name).map(Arc::clone);
    let cache = match existing {
        Some(cache) => cache,
        None => {
            let cache = Arc::new(Mutex::new(CredentialCache::from_parts(
                MCC_OPS,
                Box::new(MemoryData::empty(name)),
            )));
            table()?.insert(name.to_owned(), Arc::clone(&cache));
            cache
        }
    };
    if context.sync_kdctime() && context.os_context.time_offset_valid() {
        let locked = cache.lock().map_err(|e| anyhow::anyhow!("{}", e))?;
        let data = state(&locked);
        context.os_context.time_offset = data.time_offset;
        context.os_context.usec_offset = data.usec_offset;
        context.os_context.set_time_offset_valid();
    }
    Ok(cache)
}

fn gen_new(
    _: &mut Context,
    human_hint: Option<&str>,
) -> anyhow::Result<Arc<Mutex<CredentialCache>>> {
    let counter = UNIQUE_COUNTER.fetch_add(1, Ordering::Relaxed);
    let name = match human_hint {
        Some(hint) => format!("{}_{}", hint, counter),
        None => format!("p{}_{}", std::process::id(), counter),
    };
    let cache = Arc::new(Mutex::new(CredentialCache::from_parts(
        MCC_OPS,
        Box::new(MemoryData::empty(&name)),
    )));
    table()?.insert(name, Arc::clone(&cache));
    Ok(cache)
}

fn init(_: &mut Context, cache: &mut CredentialCache, principal: &Principal) -> anyhow::Result<()> {
    let data = state_mut(cache);
    data.principal = Some(principal.clone());
    data.credentials.clear();
    data.last_change = now_secs();
    Ok(())
}

fn destroy(_: &mut Context, cache: &mut CredentialCache) -> anyhow::Result<()> {
    let name = state(cache).name.clone();
    table()?.remove(&name);
    let data = state_mut(cache);
    data.principal = None;
    data.credentials.clear();
    Ok(())
}

fn close(_: &mut Context, _cache: &mut CredentialCache) -> anyhow::Result<()> {
    Ok(())
}

fn store(_: &mut Context, cache: &mut CredentialCache, credential: Credential) -> anyhow::Result<()> {
    let data = state_mut(cache);
    data.credentials.push(Arc::new(Mutex::new(credential)));
    data.last_change = now_secs();
    Ok(())
}

fn get_principal(_: &mut Context, cache: &CredentialCache) -> anyhow::Result<Principal> {
    state(cache)
        .principal
        .clone()
        .ok_or_else(|| Error::KRB5_FCC_NOFILE.into())
}

fn credentials_iter<'a>(
    _: &mut Context,
    cache: &'a mut CredentialCache,
) -> anyhow::Result<Box<dyn Iterator<Item = anyhow::Result<Arc<Mutex<Credential>>>> + 'a>> {
    Ok(Box::new(
        state(cache)
            .credentials
            .iter()
            .map(|credential| Ok(Arc::clone(credential))),
    ))
}

fn remove_cred(
    _: &mut Context,
    cache: &mut CredentialCache,
    mask: CredMask,
    template: &Credential,
) -> anyhow::Result<()> {
    let data = state_mut(cache);
    let index = data.credentials.iter().position(|candidate| {
        let candidate = candidate.lock().expect("credential mutex poisoned");
        compare_creds(mask, template, &candidate)
    });
    match index {
        Some(index) => {
            data.credentials.remove(index);
            data.last_change = now_secs();
            Ok(())
        }
        None => Err(Error::KRB5_CC_NOTFOUND.into()),
    }
}

fn get_default_name(_: &mut Context) -> anyhow::Result<String> {
    Ok("MEMORY:".to_owned())
}

fn lastchange(_: &mut Context, cache: &CredentialCache) -> anyhow::Result<i64> {
    Ok(state(cache).last_change)
}

fn set_flags(_: &mut Context, _cache: &mut CredentialCache, _flags: crate::Flags) -> anyhow::Result<()> {
    Ok(())
}

fn move_cache(
    _: &mut Context,
    from: &mut CredentialCache,
    to: &mut CredentialCache,
) -> anyhow::Result<()> {
    let _guard = table()?;
    let from_data = state_mut(from);
    let principal = from_data.principal.take();
    let credentials = std::mem::take(&mut from_data.credentials);
    let last_change = from_data.last_change;

    let to_data = state_mut(to);
    to_data.principal = principal;
    to_data.credentials = credentials;
    to_data.last_change = last_change;
    Ok(())
}

fn credential_caches(_: &mut Context) -> anyhow::Result<Vec<Arc<Mutex<CredentialCache>>>> {
    Ok(table()?.values().map(Arc::clone).collect())
}

fn now_secs() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Context;

    #[test]
    fn store_and_iterate_roundtrip() {
        let mut context = Context::init().unwrap();
        let cache = resolve(&mut context, "store_and_iterate_roundtrip").unwrap();
        let owner = Principal::from_strs("EXAMPLE.COM", &["alice"]);
        {
            let mut locked = cache.lock().unwrap();
            init(&mut context, &mut locked, &owner).unwrap();
        }
        assert_eq!(
            get_principal(&mut context, &cache.lock().unwrap()).unwrap(),
            owner
        );
    }

    #[test]
    fn credential_caches_enumerates_every_live_cache() {
        let mut context = Context::init().unwrap();
        let a = resolve(&mut context, "credential_caches_enumerates_a").unwrap();
        let b = resolve(&mut context, "credential_caches_enumerates_b").unwrap();
        let found = credential_caches(&mut context).unwrap();
        let names: Vec<String> = found
            .iter()
            .map(|cache| state(&cache.lock().unwrap()).name.clone())
            .collect();
        assert!(names.contains(&state(&a.lock().unwrap()).name));
        assert!(names.contains(&state(&b.lock().unwrap()).name));
    }
}
