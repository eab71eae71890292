const REALM_SEP: u8 = b'@';
const COMPONENT_SEP: u8 = b'/';

/// Kerberos name-type tag carried alongside a principal's components.
///
/// The core never branches on the value; it is read from and written to
/// the `FILE` backend's on-disk format unchanged.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NameType(pub i32);

impl NameType {
    pub const UNKNOWN: NameType = NameType(0);
    pub const PRINCIPAL: NameType = NameType(1);
    pub const SRV_HST: NameType = NameType(3);
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Principal {
    pub realm: Vec<u8>,
    pub components: Vec<Vec<u8>>,
    pub name_type: NameType,
}

impl Principal {
    pub fn new(realm: impl Into<Vec<u8>>, components: Vec<Vec<u8>>) -> Self {
        Self {
            realm: realm.into(),
            components,
            name_type: NameType::PRINCIPAL,
        }
    }

    /// Builds a principal from string components, the shape the
    /// configuration protocol (`X-CACHECONF:`) and tests need most often.
    pub fn from_strs(realm: &str, components: &[&str]) -> Self {
        Self::new(
            realm.as_bytes().to_vec(),
            components.iter().map(|c| c.as_bytes().to_vec()).collect(),
        )
    }

    pub fn unparse_name(&self) -> anyhow::Result<String> {
        // TODO: flags `KRB5_PRINCIPAL_UNPARSE_SHORT`, `KRB5_PRINCIPAL_UNPARSE_NO_REALM`
        let name = self
            .components
            .iter()
            .cloned()
            .collect::<Vec<Vec<u8>>>()
            .join(&COMPONENT_SEP);
        let unparsed = vec![name, self.realm.clone()].join(&REALM_SEP);
        Ok(String::from_utf8(unparsed)?)
    }

    /// Equality used by `compare_creds` and `cache_match`: realm plus
    /// ordered components, ignoring `name_type`.
    pub fn matches(&self, other: &Principal) -> bool {
        self.realm == other.realm && self.components == other.components
    }

    /// True if `self` names the krbtgt service for `realm` (any instance).
    pub fn is_local_tgt(&self, realm: &[u8]) -> bool {
        self.realm == realm
            && self.components.len() == 2
            && self.components[0] == b"krbtgt"
            && self.components[1] == realm
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unparse_joins_components_and_realm() {
        let p = Principal::from_strs("EXAMPLE.COM", &["user", "admin"]);
        assert_eq!(p.unparse_name().unwrap(), "user/admin@EXAMPLE.COM");
    }

    #[test]
    fn matches_ignores_name_type() {
        let mut a = Principal::from_strs("EXAMPLE.COM", &["alice"]);
        let mut b = Principal::from_strs("EXAMPLE.COM", &["alice"]);
        a.name_type = NameType::PRINCIPAL;
        b.name_type = NameType::UNKNOWN;
        assert!(a.matches(&b));
    }

    #[test]
    fn is_local_tgt_detects_krbtgt_for_realm() {
        let p = Principal::from_strs("EXAMPLE.COM", &["krbtgt", "EXAMPLE.COM"]);
        assert!(p.is_local_tgt(b"EXAMPLE.COM"));
        assert!(!p.is_local_tgt(b"OTHER.COM"));
    }
}
