//! Option keys recognized by the address manager.

use std::collections::HashMap;

/// Free-form options passed with pool and address requests.
pub type Options = HashMap<String, String>;

/// Restricts wildcard pool selection to pools on this host interface.
pub const OPT_INTERFACE_NAME: &str = "azure.interface.name";

/// Opaque lease ID; repeated requests with the same ID replay the same address.
pub const OPT_ADDRESS_ID: &str = "azure.address.id";

/// Kind of address requested.
pub const OPT_ADDRESS_TYPE: &str = "azure.address.type";

/// [`OPT_ADDRESS_TYPE`] value requesting the pool's gateway.
pub const OPT_ADDRESS_TYPE_GATEWAY: &str = "gateway";

/// Returns the non-empty value of `key`, if any.
pub(crate) fn non_empty<'a>(options: &'a Options, key: &str) -> Option<&'a str> {
    options
        .get(key)
        .map(String::as_str)
        .filter(|value| !value.is_empty())
}

/// Returns whether the caller asked for the gateway pseudo-address.
pub(crate) fn wants_gateway(options: &Options) -> bool {
    non_empty(options, OPT_ADDRESS_TYPE) == Some(OPT_ADDRESS_TYPE_GATEWAY)
}
