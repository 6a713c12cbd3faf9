//! Input validation for rule requests
//!
//! Validators return `Result<_, String>` with a user-facing message; the
//! rules manager maps failures to [`Error::InvalidInput`](crate::Error::InvalidInput).

/// Longest protocol name accepted
const MAX_PROTOCOL_LEN: usize = 16;

/// Validates a single port number.
///
/// # Errors
///
/// Returns `Err` if port is 0 (reserved).
///
/// # Examples
///
/// ```
/// use netrules::validators::validate_port;
///
/// assert_eq!(validate_port(443), Ok(443));
/// assert!(validate_port(0).is_err());
/// ```
pub fn validate_port(port: u16) -> Result<u16, String> {
    if port == 0 {
        Err("Port must be between 1 and 65535".to_string())
    } else {
        Ok(port)
    }
}

/// Validates a port range.
///
/// # Errors
///
/// Returns `Err` if:
/// - Either port is 0
/// - Start port is greater than end port
pub fn validate_port_range(start: u16, end: u16) -> Result<(u16, u16), String> {
    validate_port(start)?;
    validate_port(end)?;

    if start > end {
        Err("Start port must be less than or equal to end port".to_string())
    } else {
        Ok((start, end))
    }
}

/// Validates every port of a reservation request.
///
/// # Errors
///
/// Returns `Err` naming the first invalid port.
pub fn validate_ports(ports: &[u16]) -> Result<(), String> {
    for port in ports {
        validate_port(*port).map_err(|e| format!("{e} (got {port})"))?;
    }
    Ok(())
}

/// Validates a protocol name and returns it trimmed and lowercased.
///
/// Only the shape is checked here; whether the network actually supports the
/// protocol is decided by its capabilities.
///
/// # Errors
///
/// Returns `Err` if the name is empty, too long, or not ASCII alphanumeric.
///
/// # Examples
///
/// ```
/// use netrules::validators::validate_protocol;
///
/// assert_eq!(validate_protocol(" TCP ").unwrap(), "tcp");
/// assert!(validate_protocol("tcp;drop").is_err());
/// ```
pub fn validate_protocol(name: &str) -> Result<String, String> {
    let name = name.trim();
    if name.is_empty() {
        return Err("Protocol is required".to_string());
    }
    if name.len() > MAX_PROTOCOL_LEN {
        return Err(format!(
            "Protocol name too long (max {MAX_PROTOCOL_LEN} characters)"
        ));
    }
    // SECURITY: ASCII-only, the name ends up in backend payloads
    if !name.chars().all(|c| c.is_ascii_alphanumeric()) {
        return Err("Protocol contains invalid characters".to_string());
    }
    Ok(name.to_ascii_lowercase())
}
