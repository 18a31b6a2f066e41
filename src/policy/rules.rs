//! Policy statements injected into every loaded policy.
//!
//! Kept as data so backends can be swapped and tests can compare the exact
//! sequence that was applied.

use serde::Serialize;

/// Wildcard accepted in any position of an allow rule
pub const ANY: &str = "*";

/// Process domain the agent runs in
pub const AGENT_DOMAIN: &str = "magisk";
/// File context assigned to agent-owned files
pub const AGENT_FILE_DOMAIN: &str = "magisk_file";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum PolicyStatement {
    /// Declare a new type usable as a domain
    CreateDomain(&'static str),
    /// Mark a domain permissive
    Permissive(&'static str),
    Allow {
        source: &'static str,
        target: &'static str,
        class: &'static str,
        perm: &'static str,
    },
    /// Add a type to an attribute
    AttributeAdd {
        ty: &'static str,
        attribute: &'static str,
    },
}

const fn allow(
    source: &'static str,
    target: &'static str,
    class: &'static str,
    perm: &'static str,
) -> PolicyStatement {
    PolicyStatement::Allow {
        source,
        target,
        class,
        perm,
    }
}

const fn attradd(ty: &'static str, attribute: &'static str) -> PolicyStatement {
    PolicyStatement::AttributeAdd { ty, attribute }
}

pub const AGENT_RULES: &[PolicyStatement] = &[
    PolicyStatement::CreateDomain(AGENT_DOMAIN),
    PolicyStatement::CreateDomain(AGENT_FILE_DOMAIN),
    PolicyStatement::Permissive(AGENT_DOMAIN),
    attradd(AGENT_DOMAIN, "mlstrustedsubject"),
    attradd(AGENT_DOMAIN, "netdomain"),
    attradd(AGENT_DOMAIN, "bluetoothdomain"),
    attradd(AGENT_FILE_DOMAIN, "mlstrustedobject"),
    // init launches the agent from its rc script
    allow("init", AGENT_DOMAIN, "process", "transition"),
    allow("init", AGENT_DOMAIN, "process", "rlimitinh"),
    allow("init", AGENT_DOMAIN, "process", "siginh"),
    allow("init", AGENT_DOMAIN, "process", "noatsecure"),
    allow("kernel", AGENT_DOMAIN, "fd", "use"),
    allow("kernel", AGENT_DOMAIN, "unix_stream_socket", "connectto"),
    // clients reach the daemon over its socket
    allow(ANY, AGENT_DOMAIN, "unix_stream_socket", "connectto"),
    allow(ANY, AGENT_DOMAIN, "unix_stream_socket", "getopt"),
    allow(ANY, AGENT_DOMAIN, "fd", "use"),
    allow(ANY, AGENT_DOMAIN, "fifo_file", ANY),
    allow(ANY, AGENT_FILE_DOMAIN, "file", ANY),
    allow(ANY, AGENT_FILE_DOMAIN, "dir", ANY),
    allow(ANY, AGENT_FILE_DOMAIN, "lnk_file", ANY),
    allow(ANY, AGENT_FILE_DOMAIN, "sock_file", ANY),
    allow(ANY, AGENT_FILE_DOMAIN, "fifo_file", ANY),
    allow("servicemanager", AGENT_DOMAIN, "dir", "search"),
    allow("servicemanager", AGENT_DOMAIN, "dir", "read"),
    allow("servicemanager", AGENT_DOMAIN, "file", "open"),
    allow("servicemanager", AGENT_DOMAIN, "file", "read"),
    allow("servicemanager", AGENT_DOMAIN, "process", "getattr"),
    allow("servicemanager", AGENT_DOMAIN, "binder", "transfer"),
    allow("hwservicemanager", AGENT_DOMAIN, "binder", "transfer"),
];
