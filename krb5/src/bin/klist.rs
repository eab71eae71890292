use chrono::{DateTime, TimeZone, Utc};
use clap::{CommandFactory, Parser};
use dns_lookup::lookup_addr;
use krb5::{
    fmt::timestamp_to_sfstring, prefix_progname_to_error_if_needed, Address, CollectionCursor,
    Context, Credential, CredentialCache, Flags,
};
use once_cell::sync::Lazy;
use std::{
    net::{IpAddr, Ipv4Addr, Ipv6Addr},
    process::ExitCode,
};

const PROGNAME: &str = "klist";

static ARGS: Lazy<Args> = Lazy::new(Args::parse);
static NOW: Lazy<DateTime<Utc>> = Lazy::new(Utc::now);
static TIMESTAMP_WIDTH: Lazy<usize> = Lazy::new(|| timestamp_to_sfstring(*NOW).len());

#[derive(Parser)]
#[command(name = PROGNAME, version)]
struct Args {
    /// lists credential caches in collection
    #[arg(short = 'l', default_value_t = false)]
    list_all: bool,
    /// shows content of all credential caches
    #[arg(short = 'A', default_value_t = false)]
    show_all: bool,
    /// shows the submitted authorization data types
    #[arg(short = 'd', default_value_t = false)]
    show_adtype: bool,
    /// shows credentials flags
    #[arg(short = 'f', default_value_t = false)]
    show_flags: bool,
    /// sets exit status based on valid tgt existence
    #[arg(short = 's', default_value_t = false)]
    status_only: bool,
    /// displays the address list
    #[arg(short = 'a', default_value_t = false)]
    show_addresses: bool,
    /// do not reverse-resolve
    #[arg(short = 'n', default_value_t = false)]
    no_resolve: bool,

    name: Option<String>,
}

fn main() -> ExitCode {
    env_logger::init();
    prefix_progname_to_error_if_needed(PROGNAME, run(), ARGS.status_only)
}

fn run() -> anyhow::Result<()> {
    if ARGS.no_resolve && !ARGS.show_addresses {
        return usage();
    }
    if (ARGS.show_all && ARGS.list_all) || (ARGS.status_only && ARGS.list_all) {
        return usage();
    }

    // Forces the evaluation of lazy static value `NOW` to use current time
    let _ = *NOW;

    let mut context =
        Context::init().map_err(|e| anyhow::anyhow!("{} while initializing krb5", e))?;

    if let Some(name) = &ARGS.name {
        CredentialCache::set_default_name(&mut context, Some(name));
    }

    if ARGS.list_all {
        return list_all_ccaches(&mut context);
    }
    if ARGS.show_all {
        return show_all_ccaches(&mut context);
    }
    let cache = CredentialCache::default(&mut context)
        .map_err(|e| anyhow::anyhow!("{} while resolving ccache", e))?;
    let mut cache = cache.lock().map_err(|e| anyhow::anyhow!("{}", e))?;
    if ARGS.status_only {
        check_ccache(&mut context, &mut cache)
    } else {
        show_ccache(&mut context, &mut cache)
    }
}

fn usage() -> anyhow::Result<()> {
    Err(anyhow::anyhow!(Args::command().render_help()))
}

fn collected_caches(context: &mut Context) -> anyhow::Result<Vec<std::sync::Arc<std::sync::Mutex<CredentialCache>>>> {
    let mut cursor = CollectionCursor::new(context)?;
    let mut caches = vec![];
    while let Some(cache) = cursor.next(context) {
        caches.push(cache);
    }
    Ok(caches)
}

fn list_all_ccaches(context: &mut Context) -> anyhow::Result<()> {
    let caches = collected_caches(context)?;
    println!("{:30} {}", "Principal name", "Cache name");
    println!("{:30} {}", "--------------", "----------");
    let mut exit_status = false;
    for cache in caches {
        let mut cache = cache.lock().map_err(|e| anyhow::anyhow!("{}", e))?;
        let status = list_ccache(context, &mut cache).is_ok();
        exit_status |= status;
    }
    if exit_status {
        Ok(())
    } else {
        Err(anyhow::anyhow!(""))
    }
}

fn list_ccache(context: &mut Context, cache: &mut CredentialCache) -> anyhow::Result<()> {
    let principal_name = cache
        .get_principal(context)?
        .unparse_name()
        .map_err(|_| anyhow::anyhow!(""))?;
    let credential_cache_name = cache.get_full_name()?;
    print!("{:30} {}", principal_name, credential_cache_name);
    if check_ccache(context, cache).is_err() {
        print!(" (Expired)");
    }
    println!();
    Ok(())
}

fn show_all_ccaches(context: &mut Context) -> anyhow::Result<()> {
    let caches = collected_caches(context)?;
    let mut exit_status = false;
    let mut first = true;
    for cache in caches {
        let mut cache = cache.lock().map_err(|e| anyhow::anyhow!("{}", e))?;
        if !ARGS.status_only && !first {
            println!();
        }
        first = false;
        let status = if ARGS.status_only {
            check_ccache(context, &mut cache).is_ok()
        } else {
            show_ccache(context, &mut cache).is_ok()
        };
        exit_status |= status;
    }
    if exit_status {
        Ok(())
    } else {
        Err(anyhow::anyhow!(""))
    }
}

fn check_ccache(context: &mut Context, cache: &mut CredentialCache) -> anyhow::Result<()> {
    let principal = cache.get_principal(context)?;
    let mut credentials_iter = cache.credentials_iter(context)?;
    let mut found_tgt = false;
    let mut found_current_tgt = false;
    let mut found_current_cred = false;
    while let Some(credential) = credentials_iter.next().transpose()? {
        let credential = credential.lock().map_err(|e| anyhow::anyhow!("{}", e))?;
        if credential.server.is_local_tgt(&principal.realm) {
            found_tgt = true;
            if credential.times.endtime > NOW.timestamp() {
                found_current_tgt = true;
            }
        } else if !credential.is_config() && credential.times.endtime > NOW.timestamp() {
            found_current_cred = true;
        }
    }
    if (found_tgt && found_current_tgt) || (!found_tgt && found_current_cred) {
        Ok(())
    } else {
        Err(anyhow::anyhow!(""))
    }
}

fn show_ccache(context: &mut Context, cache: &mut CredentialCache) -> anyhow::Result<()> {
    let default_name = cache
        .get_principal(context)?
        .unparse_name()
        .map_err(|e| anyhow::anyhow!("{} while unparsing principal name", e))?;
    println!("Ticket cache: {}:{}", cache.get_type(), cache.get_name());
    println!("Default principal: {}", default_name);
    if let Ok(friendly_name) = cache.get_friendly_name(context) {
        if friendly_name != default_name {
            println!("Friendly name: {}", friendly_name);
        }
    }
    println!();
    println!(
        "Valid starting{}  Expires{}  Service principal",
        " ".repeat(TIMESTAMP_WIDTH.saturating_sub("Valid starting".len())),
        " ".repeat(TIMESTAMP_WIDTH.saturating_sub("Expires".len()))
    );
    let mut credentials_iter = cache
        .credentials_iter(context)
        .map_err(|e| anyhow::anyhow!("{} while starting to retrieve tickets", e))?;
    while let Some(credential) = credentials_iter
        .next()
        .transpose()
        .map_err(|e| anyhow::anyhow!("{} while retrieving a ticket", e))?
    {
        let credential = credential.lock().map_err(|e| anyhow::anyhow!("{}", e))?;
        if credential.is_config() {
            continue;
        }
        show_credential(&credential, &default_name)?;
    }
    Ok(())
}

fn show_credential(credential: &Credential, default_name: &str) -> anyhow::Result<()> {
    let name = credential
        .client
        .unparse_name()
        .map_err(|e| anyhow::anyhow!("{} while unparsing client name", e))?;
    let sname = credential
        .server
        .unparse_name()
        .map_err(|e| anyhow::anyhow!("{} while unparsing server name", e))?;
    let starttime = if credential.times.starttime == 0 {
        credential.times.authtime
    } else {
        credential.times.starttime
    };

    let start_timestamp = Utc.timestamp_opt(starttime, 0).unwrap();
    let end_timestamp = Utc.timestamp_opt(credential.times.endtime, 0).unwrap();
    println!(
        "{}  {}  {}",
        timestamp_to_sfstring(start_timestamp),
        timestamp_to_sfstring(end_timestamp),
        sname
    );

    let mut extra_field = 0;
    let prefix = |extra_field: i32| if extra_field == 0 { "\t" } else { ", " };
    if name != default_name {
        print!("{}for client {}", prefix(extra_field), name);
        extra_field += 1;
    }
    if credential.times.renew_till != 0 {
        let renew_till_timestamp = Utc.timestamp_opt(credential.times.renew_till, 0).unwrap();
        print!(
            "{}renew until {}",
            prefix(extra_field),
            timestamp_to_sfstring(renew_till_timestamp)
        );
        extra_field += 2;
    }
    if ARGS.show_flags {
        let flags = flags_string(credential.ticket_flags);
        if !flags.is_empty() {
            print!("{}Flags: {}", prefix(extra_field), flags);
            extra_field += 1;
        }
    }
    if extra_field > 2 {
        println!();
        extra_field = 0;
    }
    if ARGS.show_adtype {
        let ad_types: Vec<String> = credential
            .authdata
            .iter()
            .map(|ad| ad.ad_type.to_string())
            .collect();
        print!("{}AD types: {}", prefix(extra_field), ad_types.join(", "));
        extra_field += 1;
    }
    if extra_field > 0 {
        println!();
    }
    if ARGS.show_addresses {
        if credential.addresses.is_empty() {
            println!("\tAddresses: (none)");
        } else {
            let addresses: Vec<String> = credential.addresses.iter().map(one_addr).collect();
            println!("\tAddresses: {}", addresses.join(", "));
        }
    }
    Ok(())
}

macro_rules! add_flag {
    ($flags:expr, $buf:expr, $flag:ident, $name:expr) => {
        if $flags & Credential::$flag > 0 {
            $buf.push($name);
        }
    };
}

fn flags_string(flags: Flags) -> String {
    let mut buf = vec![];
    add_flag!(flags, buf, TKT_FLG_FORWARDABLE, "F");
    add_flag!(flags, buf, TKT_FLG_FORWARDED, "f");
    add_flag!(flags, buf, TKT_FLG_PROXIABLE, "P");
    add_flag!(flags, buf, TKT_FLG_PROXY, "p");
    add_flag!(flags, buf, TKT_FLG_MAY_POSTDATE, "D");
    add_flag!(flags, buf, TKT_FLG_POSTDATED, "d");
    add_flag!(flags, buf, TKT_FLG_INVALID, "i");
    add_flag!(flags, buf, TKT_FLG_RENEWABLE, "R");
    add_flag!(flags, buf, TKT_FLG_INITIAL, "I");
    add_flag!(flags, buf, TKT_FLG_HW_AUTH, "H");
    add_flag!(flags, buf, TKT_FLG_PRE_AUTH, "A");
    add_flag!(flags, buf, TKT_FLG_TRANSIT_POLICY_CHECKED, "T");
    add_flag!(flags, buf, TKT_FLG_OK_AS_DELEGATE, "O");
    add_flag!(flags, buf, TKT_FLG_ANONYMOUS, "a");
    buf.join("")
}

fn one_addr(address: &Address) -> String {
    let ip_addr = match (address.addrtype, address.contents.len()) {
        (Address::ADDRTYPE_INET, 4) => match address.contents[0..4] {
            [a, b, c, d] => IpAddr::V4(Ipv4Addr::new(a, b, c, d)),
            _ => unreachable!(),
        },
        (Address::ADDRTYPE_INET6, 16) => {
            let mut data = [0; 8];
            for i in 0..8 {
                data[i] =
                    u16::from_be_bytes([address.contents[2 * i], address.contents[2 * i + 1]]);
            }
            IpAddr::V6(Ipv6Addr::from(data))
        }
        (Address::ADDRTYPE_INET, length) | (Address::ADDRTYPE_INET6, length) => {
            return format!(
                "broken address (type {} length {})",
                address.addrtype, length
            );
        }
        (addrtype, _) => {
            return format!("unknown addrtype {}", addrtype);
        }
    };
    if ARGS.no_resolve {
        ip_addr.to_string()
    } else {
        lookup_addr(&ip_addr).unwrap_or_else(|_| ip_addr.to_string())
    }
}
