use super::{error, Error};

error!(
    KRB5_CC_TYPE_EXISTS,
    -1765328189, "Credential cache type already registered"
);
error!(
    KRB5_CC_UNKNOWN_TYPE,
    -1765328190, "Unknown credential cache type"
);
error!(KRB5_CC_NOMEM, -1765328191, "No memory");
error!(
    KRB5_CC_NOTFOUND,
    -1765328192, "Matching credential not found"
);
error!(
    KRB5_CC_BADNAME,
    -1765328194, "Credential cache has no name of this type"
);
error!(
    KRB5_CONFIG_BADFORMAT,
    -1765328195, "Bad format in default cache name expansion"
);
error!(
    KRB5_CC_NOPERM,
    -1765328197, "Credential cache does not support remove_cred"
);
error!(
    KRB5_CC_NOSUPP_CROSS_TYPE,
    -1765328198, "Moving credentials between different cache types is not supported"
);
error!(
    KRB5_CC_FORMAT,
    -1765328199, "Bad credential cache file format"
);
error!(
    KRB5_CCACHE_BADVNO,
    -1765328200, "Unsupported credential cache format version number"
);
error!(
    KRB5_FCC_NOFILE,
    -1765328201, "No credential cache file found"
);
