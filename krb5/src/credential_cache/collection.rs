use super::CredentialCache;
use crate::{Context, Principal};
use std::sync::{Arc, Mutex};

/// Iterates every cache of every registered backend. Built eagerly at
/// construction time: each backend is asked once for its caches, and
/// backends that fail or lack the capability are skipped rather than
/// aborting the whole walk.
pub struct CollectionCursor {
    caches: std::vec::IntoIter<Arc<Mutex<CredentialCache>>>,
}

impl CollectionCursor {
    pub fn new(context: &mut Context) -> anyhow::Result<Self> {
        let mut caches = vec![];
        let ops_list: Vec<_> = context.cc_registry.iter().collect();
        for ops in ops_list {
            let Some(credential_caches) = ops.credential_caches else {
                log::debug!("collection cursor: backend {} has no cache enumeration", ops.prefix);
                continue;
            };
            match credential_caches(context) {
                Ok(mut found) => caches.append(&mut found),
                Err(e) => log::debug!("collection cursor: skipping backend {}: {}", ops.prefix, e),
            }
        }
        Ok(Self {
            caches: caches.into_iter(),
        })
    }

    pub fn next(&mut self, _context: &mut Context) -> Option<Arc<Mutex<CredentialCache>>> {
        self.caches.next()
    }

    /// Opens every cache in the collection, comparing its owner principal
    /// to `client`; returns the first match, closing the rest.
    pub fn cache_match(
        context: &mut Context,
        client: &Principal,
    ) -> anyhow::Result<Arc<Mutex<CredentialCache>>> {
        let mut cursor = Self::new(context)?;
        while let Some(cache) = cursor.next(context) {
            let matches = {
                let mut locked = cache.lock().map_err(|e| anyhow::anyhow!("{}", e))?;
                locked
                    .get_principal(context)
                    .map(|owner| owner.matches(client))
                    .unwrap_or(false)
            };
            if matches {
                return Ok(cache);
            }
        }
        Err(crate::Error::KRB5_CC_NOTFOUND)?
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cursor_visits_every_registered_memory_cache() {
        let mut context = Context::init().unwrap();
        CredentialCache::resolve(&mut context, "MEMORY:cursor_visits_a").unwrap();
        CredentialCache::resolve(&mut context, "MEMORY:cursor_visits_b").unwrap();

        let mut cursor = CollectionCursor::new(&mut context).unwrap();
        let mut names = vec![];
        while let Some(cache) = cursor.next(&mut context) {
            names.push(cache.lock().unwrap().get_full_name().unwrap());
        }
        assert!(names.contains(&"MEMORY:cursor_visits_a".to_string()));
        assert!(names.contains(&"MEMORY:cursor_visits_b".to_string()));
    }
}
