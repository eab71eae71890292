use super::ops::Ops;
use super::{Address, AuthData, Credential, CredentialCache, TicketTimes};
use crate::{Context, Conf, Enctype, Error, Keyblock, NameType, Principal};
use nom::number::Endianness;
use std::{
    fs::{self, File, OpenOptions},
    io::{BufReader, BufWriter, Read, Write},
    marker::PhantomData,
    mem::size_of,
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex,
    },
};

const FILE_FIRST_BYTE: u8 = 5;
const FCC_TAG_DELTATIME: u16 = 1;
const WRITE_VERSION: FileFormatVersion = FileFormatVersion::V4;
static UNIQUE_COUNTER: AtomicU64 = AtomicU64::new(0);

pub(super) const FCC_OPS: &Ops = &Ops {
    prefix: "FILE",
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
    remove_cred: None,
    get_version: Some(get_version),
    set_default: None,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FileFormatVersion {
    V1 = 1,
    V2,
    V3,
    V4,
}

impl TryFrom<u8> for FileFormatVersion {
    type Error = anyhow::Error;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(Self::V1),
            2 => Ok(Self::V2),
            3 => Ok(Self::V3),
            4 => Ok(Self::V4),
            _ => Err(Error::KRB5_CCACHE_BADVNO)?,
        }
    }
}

#[derive(Debug)]
pub(super) struct FileData {
    pub(super) name: String,
}

impl FileData {
    fn credentials_iter(&mut self, context: &mut Context) -> anyhow::Result<CredentialsIter> {
        let path = Path::new(&self.name);
        let mut reader = BufReader::new(File::open(path)?);
        let (version, _) = Self::read_up_to_principal(context, &mut reader)?;
        Ok(CredentialsIter {
            reader,
            version,
            phantom: PhantomData,
        })
    }

    // There are four versions of the file format used by the FILE credential
    // cache type.
    // The first byte of the file always has the value 5, and the value of the
    // second byte contains the version number (1 through 4).
    fn read_version(reader: &mut BufReader<File>) -> anyhow::Result<FileFormatVersion> {
        if read_u8(reader)? != Some(FILE_FIRST_BYTE) {
            Err(Error::KRB5_CC_FORMAT)?
        }
        let version = read_u8(reader)?.ok_or(Error::KRB5_CC_FORMAT)?;
        let version = FileFormatVersion::try_from(version)?;
        Ok(version)
    }

    // Versions 1 and 2 of the file format use native byte order for integer
    // representations.
    // Versions 3 and 4 always use big-endian byte order.
    fn endianness(version: FileFormatVersion) -> Endianness {
        match version {
            FileFormatVersion::V1 | FileFormatVersion::V2 => Endianness::Native,
            FileFormatVersion::V3 | FileFormatVersion::V4 => Endianness::Big,
        }
    }

    // After the two-byte version indicator, the file has three parts:
    // - the header (in version 4 only),
    // - the default principal name,
    // - and a sequence of credentials.
    fn read_up_to_principal(
        context: &mut Context,
        reader: &mut BufReader<File>,
    ) -> anyhow::Result<(FileFormatVersion, Option<Principal>)> {
        let version = Self::read_version(reader)?;
        if version == FileFormatVersion::V4 {
            Self::read_header(context, reader, Self::endianness(version))?;
        }
        let principal = Self::read_principal(reader, version)?;
        Ok((version, principal))
    }

    // The header appears only in format version 4.
    // It begins with a 16-bit integer giving the length of the entire header,
    // followed by a sequence of fields.
    // Each field consists of a 16-bit tag, a 16-bit length, and a value of the
    // given length.
    // A file format implementation should ignore fields with unknown tags.
    //
    // At this time there is only one defined header field.
    // Its tag value is 1, its length is always 8, and its contents are two
    // 32-bit integers giving the seconds and microseconds of the time offset of
    // the KDC relative to the client.
    fn read_header(
        context: &mut Context,
        reader: &mut BufReader<File>,
        endianness: Endianness,
    ) -> anyhow::Result<()> {
        let mut header_size = read_u16(reader, endianness)?.ok_or(Error::KRB5_CC_FORMAT)?;
        while header_size > 0 {
            if header_size < 4 {
                Err(Error::KRB5_CC_FORMAT)?
            }
            let tag = read_u16(reader, endianness)?.ok_or(Error::KRB5_CC_FORMAT)?;
            let field_size = match read_u16(reader, endianness)? {
                Some(field_size) if field_size <= header_size - 4 => field_size,
                _ => Err(Error::KRB5_CC_FORMAT)?,
            };
            match tag {
                FCC_TAG_DELTATIME => {
                    if field_size != 8 {
                        Err(Error::KRB5_CC_FORMAT)?
                    }
                    let time_offset = read_i32(reader, endianness)?.ok_or(Error::KRB5_CC_FORMAT)?;
                    let usec_offset = read_i32(reader, endianness)?.ok_or(Error::KRB5_CC_FORMAT)?;
                    if context.sync_kdctime() && !context.os_context.time_offset_valid() {
                        context.os_context.time_offset = time_offset;
                        context.os_context.usec_offset = usec_offset;
                        context.os_context.set_time_offset_valid();
                    }
                }
                _ => {
                    reader.seek_relative(field_size.into())?;
                }
            }
            header_size -= 4 + field_size;
        }
        Ok(())
    }

    // The default principal is marshalled using the following informal grammar:
    //
    // principal ::=
    //     name type (32 bits) [omitted in version 1]
    //     count of components (32 bits) [includes realm in version 1]
    //     realm (data)
    //     component1 (data)
    //     component2 (data)
    //     ...
    // data ::=
    //     length (32 bits)
    //     value (length bytes)
    fn read_principal(
        reader: &mut BufReader<File>,
        version: FileFormatVersion,
    ) -> anyhow::Result<Option<Principal>> {
        let endianness = Self::endianness(version);

        let name_type = if version == FileFormatVersion::V1 {
            NameType::UNKNOWN
        } else {
            match read_i32(reader, endianness)? {
                Some(name_type) => NameType(name_type),
                None => return Ok(None),
            }
        };

        let mut component_count = read_u32(reader, endianness)?.ok_or(Error::KRB5_CC_FORMAT)?;
        if version == FileFormatVersion::V1 {
            component_count -= 1;
        }

        let realm = Self::read_data(reader, endianness)?.ok_or(Error::KRB5_CC_FORMAT)?;

        let mut components = vec![];
        for _ in 0..component_count {
            let component = Self::read_data(reader, endianness)?.ok_or(Error::KRB5_CC_FORMAT)?;
            components.push(component);
        }

        let principal = Principal {
            realm,
            components,
            name_type,
        };
        Ok(Some(principal))
    }

    fn read_data(
        reader: &mut BufReader<File>,
        endianness: Endianness,
    ) -> anyhow::Result<Option<Vec<u8>>> {
        let size = read_u32(reader, endianness)?.ok_or(Error::KRB5_CC_FORMAT)? as usize;
        let mut buf = vec![0; size];
        if reader.read(&mut buf)? == size {
            Ok(Some(buf))
        } else {
            Ok(None)
        }
    }

    // credential ::=
    //     client (principal)
    //     server (principal)
    //     keyblock (keyblock)
    //     authtime (32 bits)
    //     starttime (32 bits)
    //     endtime (32 bits)
    //     renew_till (32 bits)
    //     is_skey (1 byte, 0 or 1)
    //     ticket_flags (32 bits)
    //     addresses (addresses)
    //     authdata (authdata)
    //     ticket (data)
    //     second_ticket (data)
    fn read_credential(
        reader: &mut BufReader<File>,
        version: FileFormatVersion,
    ) -> anyhow::Result<Option<Credential>> {
        let endianness = Self::endianness(version);

        let client = match Self::read_principal(reader, version)? {
            Some(principal) => principal,
            None => return Ok(None),
        };

        let server = match Self::read_principal(reader, version)? {
            Some(principal) => principal,
            None => return Ok(None),
        };

        let keyblock = Self::read_keyblock(reader, version)?;

        let times = Self::read_ticket_times(reader, endianness)?;

        let is_skey = read_u8(reader)?.ok_or(Error::KRB5_CC_FORMAT)? > 0;

        let ticket_flags = read_i32(reader, endianness)?.ok_or(Error::KRB5_CC_FORMAT)?;

        let addresses = Self::read_addresses(reader, endianness)?;

        let authdata = Self::read_authdata(reader, endianness)?;

        let ticket = Self::read_data(reader, endianness)?.ok_or(Error::KRB5_CC_FORMAT)?;

        let second_ticket = Self::read_data(reader, endianness)?.ok_or(Error::KRB5_CC_FORMAT)?;

        let credential = Credential {
            client,
            server,
            keyblock,
            times,
            is_skey,
            ticket_flags,
            addresses,
            ticket,
            second_ticket,
            authdata,
        };
        Ok(Some(credential))
    }

    fn read_keyblock(
        reader: &mut BufReader<File>,
        version: FileFormatVersion,
    ) -> anyhow::Result<Keyblock> {
        let endianness = Self::endianness(version);
        let enctype = Enctype(read_u16(reader, endianness)?.ok_or(Error::KRB5_CC_FORMAT)? as i32);
        if version == FileFormatVersion::V3 {
            read_u16(reader, endianness)?.ok_or(Error::KRB5_CC_FORMAT)?;
        }
        let contents = FileData::read_data(reader, endianness)?.ok_or(Error::KRB5_CC_FORMAT)?;
        let keyblock = Keyblock { enctype, contents };
        Ok(keyblock)
    }

    fn read_ticket_times(
        reader: &mut BufReader<File>,
        endianness: Endianness,
    ) -> anyhow::Result<TicketTimes> {
        let authtime = read_i32(reader, endianness)?.ok_or(Error::KRB5_CC_FORMAT)?;
        let starttime = read_i32(reader, endianness)?.ok_or(Error::KRB5_CC_FORMAT)?;
        let endtime = read_u32(reader, endianness)?.ok_or(Error::KRB5_CC_FORMAT)?;
        let renew_till = read_u32(reader, endianness)?.ok_or(Error::KRB5_CC_FORMAT)?;
        Ok(TicketTimes {
            authtime: authtime as i64,
            starttime: starttime as i64,
            endtime: endtime as i64,
            renew_till: renew_till as i64,
        })
    }

    fn read_addresses(
        reader: &mut BufReader<File>,
        endianness: Endianness,
    ) -> anyhow::Result<Vec<Address>> {
        let count = read_u32(reader, endianness)?.ok_or(Error::KRB5_CC_FORMAT)?;
        let mut addresses = vec![];
        for _ in 0..count {
            let addrtype = read_u16(reader, endianness)?.ok_or(Error::KRB5_CC_FORMAT)?;
            let contents = Self::read_data(reader, endianness)?.ok_or(Error::KRB5_CC_FORMAT)?;
            addresses.push(Address { addrtype, contents });
        }
        Ok(addresses)
    }

    fn read_authdata(
        reader: &mut BufReader<File>,
        endianness: Endianness,
    ) -> anyhow::Result<Vec<AuthData>> {
        let count = read_u32(reader, endianness)?.ok_or(Error::KRB5_CC_FORMAT)?;
        let mut authdata = vec![];
        for _ in 0..count {
            let ad_type = read_u16(reader, endianness)?.ok_or(Error::KRB5_CC_FORMAT)?;
            let contents = Self::read_data(reader, endianness)?.ok_or(Error::KRB5_CC_FORMAT)?;
            authdata.push(AuthData { ad_type, contents });
        }
        Ok(authdata)
    }

    // Writers in this crate only ever produce version 4: big-endian, with
    // the name-type field and the (empty) KDC time-skew header present.
    fn write_principal<W: Write>(writer: &mut W, principal: &Principal) -> anyhow::Result<()> {
        writer.write_all(&principal.name_type.0.to_be_bytes())?;
        writer.write_all(&(principal.components.len() as u32).to_be_bytes())?;
        Self::write_data(writer, &principal.realm)?;
        for component in &principal.components {
            Self::write_data(writer, component)?;
        }
        Ok(())
    }

    fn write_data<W: Write>(writer: &mut W, data: &[u8]) -> anyhow::Result<()> {
        writer.write_all(&(data.len() as u32).to_be_bytes())?;
        writer.write_all(data)?;
        Ok(())
    }

    fn write_credential<W: Write>(writer: &mut W, credential: &Credential) -> anyhow::Result<()> {
        Self::write_principal(writer, &credential.client)?;
        Self::write_principal(writer, &credential.server)?;
        writer.write_all(&(credential.keyblock.enctype.0 as u16).to_be_bytes())?;
        Self::write_data(writer, &credential.keyblock.contents)?;
        writer.write_all(&(credential.times.authtime as i32).to_be_bytes())?;
        writer.write_all(&(credential.times.starttime as i32).to_be_bytes())?;
        writer.write_all(&(credential.times.endtime as u32).to_be_bytes())?;
        writer.write_all(&(credential.times.renew_till as u32).to_be_bytes())?;
        writer.write_all(&[credential.is_skey as u8])?;
        writer.write_all(&credential.ticket_flags.to_be_bytes())?;
        writer.write_all(&(credential.addresses.len() as u32).to_be_bytes())?;
        for address in &credential.addresses {
            writer.write_all(&address.addrtype.to_be_bytes())?;
            Self::write_data(writer, &address.contents)?;
        }
        writer.write_all(&(credential.authdata.len() as u32).to_be_bytes())?;
        for authdata in &credential.authdata {
            writer.write_all(&authdata.ad_type.to_be_bytes())?;
            Self::write_data(writer, &authdata.contents)?;
        }
        Self::write_data(writer, &credential.ticket)?;
        Self::write_data(writer, &credential.second_ticket)?;
        Ok(())
    }

    fn write_cache_file(path: &Path, principal: &Principal, credentials: &[Credential]) -> anyhow::Result<()> {
        let tmp_path = path.with_extension("tmp");
        {
            let mut writer = BufWriter::new(
                OpenOptions::new()
                    .write(true)
                    .create(true)
                    .truncate(true)
                    .open(&tmp_path)?,
            );
            writer.write_all(&[FILE_FIRST_BYTE, WRITE_VERSION as u8])?;
            // An empty header: a single 16-bit length field of zero.
            writer.write_all(&0u16.to_be_bytes())?;
            Self::write_principal(&mut writer, principal)?;
            for credential in credentials {
                Self::write_credential(&mut writer, credential)?;
            }
            writer.flush()?;
        }
        fs::rename(&tmp_path, path)?;
        Ok(())
    }

    fn read_all_credentials(path: &Path, context: &mut Context) -> anyhow::Result<(Principal, Vec<Credential>)> {
        let mut reader = BufReader::new(File::open(path)?);
        let (version, principal) = Self::read_up_to_principal(context, &mut reader)?;
        let principal = principal.ok_or(Error::KRB5_CC_FORMAT)?;
        let mut credentials = vec![];
        while let Some(credential) = Self::read_credential(&mut reader, version)? {
            if !credential.is_removed() {
                credentials.push(credential);
            }
        }
        Ok((principal, credentials))
    }
}

struct CredentialsIter<'a> {
    reader: BufReader<File>,
    version: FileFormatVersion,
    phantom: PhantomData<&'a ()>,
}

impl<'a> CredentialsIter<'a> {
    fn next_entry(&mut self) -> anyhow::Result<Option<Arc<Mutex<Credential>>>> {
        let credential = match FileData::read_credential(&mut self.reader, self.version)? {
            Some(credential) => credential,
            None => return Ok(None),
        };
        if credential.is_removed() {
            self.next_entry()
        } else {
            Ok(Some(Arc::new(Mutex::new(credential))))
        }
    }
}

impl<'a> Iterator for CredentialsIter<'a> {
    type Item = anyhow::Result<Arc<Mutex<Credential>>>;

    fn next(&mut self) -> Option<Self::Item> {
        self.next_entry().transpose()
    }
}

macro_rules! read_int {
    ($fn:ident, $type:ident) => {
        fn $fn(
            reader: &mut BufReader<File>,
            endianness: Endianness,
        ) -> anyhow::Result<Option<$type>> {
            let mut buf = [0; size_of::<$type>()];
            if reader.read(&mut buf)? != size_of::<$type>() {
                return Ok(None);
            }
            match endianness {
                Endianness::Big => Ok(Some($type::from_be_bytes(buf))),
                Endianness::Little => Ok(Some($type::from_le_bytes(buf))),
                Endianness::Native => Ok(Some($type::from_ne_bytes(buf))),
            }
        }
    };
}

read_int!(read_u16, u16);
read_int!(read_u32, u32);
read_int!(read_i32, i32);

fn read_u8(reader: &mut BufReader<File>) -> anyhow::Result<Option<u8>> {
    let mut buf = [0];
    if reader.read(&mut buf)? == 1 {
        Ok(Some(buf[0]))
    } else {
        Ok(None)
    }
}

fn state(cache: &CredentialCache) -> &FileData {
    cache.downcast_ref::<FileData>()
}

fn resolve(_: &mut Context, name: &str) -> anyhow::Result<Arc<Mutex<CredentialCache>>> {
    let data = FileData {
        name: name.to_owned(),
    };
    Ok(Arc::new(Mutex::new(CredentialCache::from_parts(
        FCC_OPS,
        Box::new(data),
    ))))
}

fn gen_new(context: &mut Context, _human_hint: Option<&str>) -> anyhow::Result<Arc<Mutex<CredentialCache>>> {
    let uid = nix::unistd::Uid::current();
    let suffix = UNIQUE_COUNTER.fetch_add(1, Ordering::Relaxed);
    let name = format!("/tmp/krb5cc_{}_{}_{}", uid, std::process::id(), suffix);
    resolve(context, &name)
}

fn init(_: &mut Context, cache: &mut CredentialCache, principal: &Principal) -> anyhow::Result<()> {
    let path = PathBuf::from(&cache.downcast_ref::<FileData>().name);
    FileData::write_cache_file(&path, principal, &[])
}

fn destroy(_: &mut Context, cache: &mut CredentialCache) -> anyhow::Result<()> {
    let path = cache.downcast_ref::<FileData>().name.clone();
    match fs::remove_file(&path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

fn close(_: &mut Context, _cache: &mut CredentialCache) -> anyhow::Result<()> {
    Ok(())
}

fn store(context: &mut Context, cache: &mut CredentialCache, credential: Credential) -> anyhow::Result<()> {
    let path = PathBuf::from(&state(cache).name);
    let (principal, mut credentials) = FileData::read_all_credentials(&path, context)?;
    credentials.push(credential);
    FileData::write_cache_file(&path, &principal, &credentials)
}

fn get_principal(context: &mut Context, cache: &CredentialCache) -> anyhow::Result<Principal> {
    let path = Path::new(&state(cache).name);
    let mut reader = BufReader::new(File::open(path)?);
    let (_, principal) = FileData::read_up_to_principal(context, &mut reader)?;
    principal.ok_or(Error::KRB5_CC_FORMAT.into())
}

fn credentials_iter<'a>(
    context: &mut Context,
    cache: &'a mut CredentialCache,
) -> anyhow::Result<Box<dyn Iterator<Item = anyhow::Result<Arc<Mutex<Credential>>>> + 'a>> {
    Ok(Box::new(
        cache
            .downcast_mut::<FileData>()
            .credentials_iter(context)?,
    ))
}

fn get_default_name(context: &mut Context) -> anyhow::Result<String> {
    let template = context.get_string(Conf::DEFAULT_CCACHE_NAME);
    Context::expand_path_tokens(template.as_deref().unwrap_or("/tmp/krb5cc_%{uid}"))
}

fn lastchange(_: &mut Context, cache: &CredentialCache) -> anyhow::Result<i64> {
    let metadata = fs::metadata(&state(cache).name)?;
    let modified = metadata.modified()?;
    Ok(modified
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0))
}

fn set_flags(_: &mut Context, _cache: &mut CredentialCache, _flags: crate::Flags) -> anyhow::Result<()> {
    Ok(())
}

fn move_cache(
    _: &mut Context,
    from: &mut CredentialCache,
    to: &mut CredentialCache,
) -> anyhow::Result<()> {
    let from_path = state(from).name.clone();
    let to_path = state(to).name.clone();
    fs::rename(&from_path, &to_path)?;
    Ok(())
}

fn get_version(context: &mut Context, cache: &CredentialCache) -> anyhow::Result<i32> {
    let path = Path::new(&state(cache).name);
    let mut reader = BufReader::new(File::open(path)?);
    let version = FileData::read_version(&mut reader)?;
    let _ = context;
    Ok(version as i32)
}

fn credential_caches(context: &mut Context) -> anyhow::Result<Vec<Arc<Mutex<CredentialCache>>>> {
    let default_name = CredentialCache::default_name(context)?;
    let residual = if let Some(residual) = default_name.strip_prefix("FILE:") {
        residual
    } else if default_name.find(':').map(|i| i < 2).unwrap_or(true) {
        default_name.as_str()
    } else {
        return Ok(vec![]);
    };
    let path = Path::new(residual);
    if !path.try_exists()? {
        return Ok(vec![]);
    }
    Ok(vec![resolve(context, residual)?])
}

#[cfg(test)]
mod tests {
    use super::*;

    fn zeroed_credential(client: Principal, server: Principal) -> Credential {
        Credential {
            client,
            server,
            keyblock: Keyblock {
                enctype: Enctype(0),
                contents: vec![],
            },
            times: TicketTimes {
                authtime: 0,
                starttime: 0,
                endtime: 0,
                renew_till: 0,
            },
            is_skey: false,
            ticket_flags: 0,
            addresses: vec![],
            ticket: vec![],
            second_ticket: vec![],
            authdata: vec![],
        }
    }

    #[test]
    fn store_close_reresolve_roundtrip() {
        let mut context = Context::init().unwrap();
        let path = format!(
            "/tmp/file_backend_roundtrip_{}_{}",
            std::process::id(),
            UNIQUE_COUNTER.fetch_add(1, Ordering::Relaxed)
        );
        let owner = Principal::from_strs("EXAMPLE.COM", &["alice"]);
        let server = Principal::from_strs("EXAMPLE.COM", &["krbtgt", "EXAMPLE.COM"]);

        let cache_arc = CredentialCache::resolve(&mut context, &path).unwrap();
        {
            let mut cache = cache_arc.lock().unwrap();
            cache.initialize(&mut context, &owner).unwrap();
            cache
                .store(&mut context, zeroed_credential(owner.clone(), server))
                .unwrap();
            cache.close(&mut context).unwrap();
        }

        let reopened_arc = CredentialCache::resolve(&mut context, &path).unwrap();
        let mut reopened = reopened_arc.lock().unwrap();
        assert_eq!(reopened.get_principal(&mut context).unwrap(), owner);
        let count = reopened.credentials_iter(&mut context).unwrap().count();
        assert_eq!(count, 1);
        reopened.destroy(&mut context).unwrap();
    }
}
