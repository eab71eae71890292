use super::{
    credential::{CONF_NAME, CONF_REALM},
    ops::CredMask,
    Credential, CredentialCache,
};
use crate::{Context, Error, Principal};

pub const FRIENDLY_NAME_KEY: &str = "FriendlyName";

/// True iff `p` is the server principal shape of a configuration entry:
/// reserved realm, first component the reserved config-data name.
pub fn is_config_principal(p: &Principal) -> bool {
    p.realm == CONF_REALM.as_bytes()
        && p.components
            .first()
            .is_some_and(|c| c == CONF_NAME.as_bytes())
}

impl CredentialCache {
    pub fn set_config(
        &mut self,
        context: &mut Context,
        principal: Option<&Principal>,
        name: &str,
        data: Option<&[u8]>,
    ) -> anyhow::Result<()> {
        let owner = self.get_principal(context)?;
        let template = Credential::config_template(owner, name, principal, None);
        match self.remove_cred(context, CredMask::SERVER | CredMask::CLIENT, &template) {
            Ok(()) => {}
            Err(e) if is_not_found(&e) => {}
            Err(e) => return Err(e),
        }
        if let Some(data) = data {
            let owner = self.get_principal(context)?;
            let mut entry = Credential::config_template(owner, name, principal, Some(data));
            let now = now_secs();
            entry.times.authtime = now;
            entry.times.endtime = now + 30 * 24 * 3600;
            self.store(context, entry)?;
        }
        Ok(())
    }

    pub fn get_config(
        &mut self,
        context: &mut Context,
        principal: Option<&Principal>,
        name: &str,
    ) -> anyhow::Result<Vec<u8>> {
        let owner = self.get_principal(context)?;
        let template = Credential::config_template(owner, name, principal, None);
        let found = self.retrieve(context, CredMask::SERVER | CredMask::CLIENT, &template)?;
        found
            .map(|cred| cred.ticket)
            .ok_or_else(|| Error::KRB5_CC_NOTFOUND.into())
    }

    pub fn get_friendly_name(&mut self, context: &mut Context) -> anyhow::Result<String> {
        match self.get_config(context, None, FRIENDLY_NAME_KEY) {
            Ok(bytes) => Ok(String::from_utf8(bytes)?),
            Err(_) => self.get_principal(context)?.unparse_name(),
        }
    }

    pub fn set_friendly_name(&mut self, context: &mut Context, name: &str) -> anyhow::Result<()> {
        self.set_config(context, None, FRIENDLY_NAME_KEY, Some(name.as_bytes()))
    }
}

fn is_not_found(e: &anyhow::Error) -> bool {
    e.downcast_ref::<Error>()
        .is_some_and(|e| e.code == Error::KRB5_CC_NOTFOUND.code)
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

    #[test]
    fn is_config_principal_matches_reserved_shape() {
        let p = Principal::new(
            CONF_REALM.as_bytes().to_vec(),
            vec![CONF_NAME.as_bytes().to_vec(), b"FriendlyName".to_vec()],
        );
        assert!(is_config_principal(&p));
    }

    #[test]
    fn is_config_principal_rejects_ordinary_principal() {
        let p = Principal::from_strs("EXAMPLE.COM", &["alice"]);
        assert!(!is_config_principal(&p));
    }

    #[test]
    fn set_get_delete_config_roundtrip() {
        let mut context = Context::init().unwrap();
        let owner = Principal::from_strs("EXAMPLE.COM", &["alice"]);
        let cache_arc = CredentialCache::resolve(&mut context, "MEMORY:config_roundtrip").unwrap();
        let mut cache = cache_arc.lock().unwrap();
        cache.initialize(&mut context, &owner).unwrap();

        cache
            .set_config(&mut context, None, "greeting", Some(b"hello"))
            .unwrap();
        assert_eq!(
            cache.get_config(&mut context, None, "greeting").unwrap(),
            b"hello".to_vec()
        );

        cache.set_config(&mut context, None, "greeting", None).unwrap();
        assert!(cache.get_config(&mut context, None, "greeting").is_err());
    }
}
