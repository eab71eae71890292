/// Encryption type tag carried in a credential's keyblock. The core and the
/// `FILE` backend treat this as an opaque wire integer; the enctype-to-name
/// tables and cipher implementations that operate on it are out of scope for
/// the credential-cache core.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Enctype(pub i32);

#[derive(Debug, Clone)]
pub struct Keyblock {
    pub enctype: Enctype,
    pub contents: Vec<u8>,
}
