//! Small path and host helpers shared by the engines.

use std::net::IpAddr;
use std::path::Path;

/// Canonically clean a URL path: collapse duplicate slashes, resolve `.` and
/// `..` segments, preserve a leading `/`. A rooted path never escapes the
/// root (`/..` cleans to `/`). An empty relative path cleans to `.`.
pub fn clean_path(path: &str) -> String {
    let rooted = path.starts_with('/');
    let mut segments: Vec<&str> = Vec::new();

    for segment in path.split('/') {
        match segment {
            "" | "." => {}
            ".." => {
                if segments.last().is_some_and(|s| *s != "..") {
                    segments.pop();
                } else if !rooted {
                    segments.push("..");
                }
            }
            s => segments.push(s),
        }
    }

    let joined = segments.join("/");
    if rooted {
        format!("/{joined}")
    } else if joined.is_empty() {
        ".".to_string()
    } else {
        joined
    }
}

/// Join a URL base path and a request path with exactly one `/` at the
/// junction, regardless of trailing/leading slashes on either side.
pub fn single_joining_slash(base: &str, path: &str) -> String {
    let base_slash = base.ends_with('/');
    let path_slash = path.starts_with('/');
    match (base_slash, path_slash) {
        (true, true) => format!("{}{}", base, &path[1..]),
        (false, false) => format!("{base}/{path}"),
        _ => format!("{base}{path}"),
    }
}

/// True when the host names the local machine: the literal `localhost` or a
/// loopback IP address.
pub fn is_loopback_host(host: &str) -> bool {
    if host == "localhost" {
        return true;
    }
    host.parse::<IpAddr>().map(|ip| ip.is_loopback()).unwrap_or(false)
}

/// Strip a `:port` suffix from a host header value.
pub fn host_without_port(host: &str) -> &str {
    host.split(':').next().unwrap_or(host)
}

/// Check whether a directory exists and can be listed.
pub fn is_dir_readable(path: &Path) -> bool {
    std::fs::read_dir(path).is_ok()
}

/// Check whether a directory accepts new files, by creating and removing a
/// probe file.
pub fn is_dir_writable(path: &Path) -> bool {
    let probe = path.join(".tmp_permission_check");
    match std::fs::File::create(&probe) {
        Ok(file) => {
            drop(file);
            std::fs::remove_file(&probe).is_ok()
        }
        Err(_) => false,
    }
}
