use crate::types::Protocol;

/// Label used when a port has no well-known service.
pub const UNKNOWN_SERVICE: &str = "Unknown";

/// Well-known service name for a port, for display only.
pub fn service_name(port: u16, protocol: Protocol) -> &'static str {
    let name = match protocol {
        Protocol::Tcp => tcp_service(port),
        Protocol::Udp => udp_service(port),
    };
    name.unwrap_or(UNKNOWN_SERVICE)
}

fn tcp_service(port: u16) -> Option<&'static str> {
    Some(match port {
        20 => "ftp-data",
        21 => "ftp",
        22 => "ssh",
        23 => "telnet",
        25 => "smtp",
        53 => "domain",
        80 => "http",
        110 => "pop3",
        111 => "sunrpc",
        135 => "msrpc",
        139 => "netbios-ssn",
        143 => "imap",
        389 => "ldap",
        443 => "https",
        445 => "microsoft-ds",
        465 => "smtps",
        587 => "submission",
        631 => "ipp",
        636 => "ldaps",
        993 => "imaps",
        995 => "pop3s",
        1433 => "ms-sql-s",
        1521 => "oracle",
        1723 => "pptp",
        1883 => "mqtt",
        2049 => "nfs",
        3306 => "mysql",
        3389 => "ms-wbt-server",
        5432 => "postgresql",
        5672 => "amqp",
        5900 => "vnc",
        6379 => "redis",
        8000 => "http-alt",
        8080 => "http-proxy",
        8443 => "https-alt",
        9200 => "elasticsearch",
        11211 => "memcache",
        27017 => "mongodb",
        _ => return None,
    })
}

fn udp_service(port: u16) -> Option<&'static str> {
    Some(match port {
        53 => "domain",
        67 => "bootps",
        68 => "bootpc",
        69 => "tftp",
        123 => "ntp",
        137 => "netbios-ns",
        138 => "netbios-dgm",
        161 => "snmp",
        162 => "snmptrap",
        500 => "isakmp",
        514 => "syslog",
        1900 => "ssdp",
        5353 => "mdns",
        11211 => "memcache",
        _ => return None,
    })
}
