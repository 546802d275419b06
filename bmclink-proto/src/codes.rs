//! Fixed error-string tables for IPMI completion codes and RMCP+ status codes.

/// Human-readable text for an IPMI completion code, if it is one of the
/// generic codes of table 5-2.
///
/// Command-specific codes (0x80–0xBE) mean different things per command and
/// are left to the caller.
pub fn completion_text(code: u8) -> Option<&'static str> {
    Some(match code {
        0xc0 => "Node Busy",
        0xc1 => "Invalid command",
        0xc2 => "Invalid command for given LUN",
        0xc3 => "Timeout while processing command",
        0xc4 => "Out of storage space on BMC",
        0xc5 => "Reservation canceled or invalid",
        0xc6 => "Request data truncated",
        0xc7 => "Request data length invalid",
        0xc8 => "Request data field length limit exceeded",
        0xc9 => "Parameter out of range",
        0xca => "Cannot return number of requested data bytes",
        0xcb => "Requested sensor, data, or record not present",
        0xcc => "Invalid data field in request",
        0xcd => "Command illegal for specified sensor or record type",
        0xce => "Command response could not be provided",
        0xcf => "Cannot execute duplicated request",
        0xd0 => "SDR repository in update mode",
        0xd1 => "Device in firmware update mode",
        0xd2 => "BMC initialization in progress",
        0xd3 => "Internal destination unavailable",
        0xd4 => "Insufficient privilege level",
        0xd5 => "Command not supported in present state",
        0xd6 => "Cannot execute command, command disabled",
        0xff => "Unspecified error",
        _ => return None,
    })
}

/// Text for an RMCP+ / RAKP status code (table 13-15).
pub fn rmcp_status_text(code: u8) -> Option<&'static str> {
    Some(match code {
        1 => "Insufficient resources to create new session",
        2 => "Invalid Session ID",
        3 => "Invalid payload type",
        4 => "Invalid authentication algorithm",
        5 => "Invalid integrity algorithm",
        6 => "No matching authentication payload",
        7 => "No matching integrity payload",
        8 => "Inactive Session ID",
        9 => "Invalid role",
        0xa => "Unauthorized role or privilege level requested",
        0xb => "Insufficient resources to create a session at the requested role",
        0xc => "Invalid username length",
        0xd => "Unauthorized name",
        0xe => "Unauthorized GUID",
        0xf => "Invalid integrity check value",
        0x10 => "Invalid confidentiality algorithm",
        0x11 => "No cipher suite match with proposed security algorithms",
        0x12 => "Illegal or unrecognized parameter",
        _ => return None,
    })
}

/// Completion text with a fallback for codes outside the generic table.
pub fn completion_text_or_unknown(code: u8) -> String {
    match completion_text(code) {
        Some(s) => s.to_string(),
        None => format!("Unknown IPMI completion code {code:#04x}"),
    }
}

/// RMCP+ status text with a fallback, matching the wording surfaced to
/// login callbacks.
pub fn rmcp_status_text_or_unknown(code: u8) -> String {
    match rmcp_status_text(code) {
        Some(s) => s.to_string(),
        None => format!("Unrecognized RMCP code {code}"),
    }
}
