//! Device return codes follow the OS errno convention: negative values map
//! to standard error names for display.

/// Name for a (positive) errno value, if known.
pub fn errno_name(errno: u16) -> Option<&'static str> {
    Some(match errno {
        1 => "EPERM",
        2 => "ENOENT",
        3 => "ESRCH",
        4 => "EINTR",
        5 => "EIO",
        6 => "ENXIO",
        9 => "EBADF",
        11 => "EAGAIN",
        12 => "ENOMEM",
        13 => "EACCES",
        14 => "EFAULT",
        16 => "EBUSY",
        17 => "EEXIST",
        19 => "ENODEV",
        22 => "EINVAL",
        28 => "ENOSPC",
        32 => "EPIPE",
        34 => "ERANGE",
        35 => "ENOMSG",
        71 => "EPROTO",
        90 => "EMSGSIZE",
        95 => "ENOTSUP",
        110 => "ETIMEDOUT",
        111 => "ECONNREFUSED",
        113 => "ECONNABORTED",
        116 => "ECONNRESET",
        _ => return None,
    })
}

/// Render a device return code for display: `0`, `3`, or `-5 (EIO)`.
pub fn format_return_code(return_code: i16) -> String {
    if return_code >= 0 {
        return return_code.to_string();
    }
    match errno_name(return_code.unsigned_abs()) {
        Some(name) => format!("{return_code} ({name})"),
        None => return_code.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_codes_get_names() {
        assert_eq!(format_return_code(-5), "-5 (EIO)");
        assert_eq!(format_return_code(-22), "-22 (EINVAL)");
        assert_eq!(format_return_code(-110), "-110 (ETIMEDOUT)");
    }

    #[test]
    fn unknown_and_positive_codes_are_numeric() {
        assert_eq!(format_return_code(0), "0");
        assert_eq!(format_return_code(1), "1");
        assert_eq!(format_return_code(-999), "-999");
    }
}
