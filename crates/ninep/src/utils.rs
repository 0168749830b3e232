use crate::error;
use crate::fcall::STD_PORT;

pub type Result<T> = ::std::result::Result<T, error::Error>;

#[macro_export]
macro_rules! io_err {
    ($kind:ident, $msg:expr) => {
        ::std::io::Error::new(::std::io::ErrorKind::$kind, $msg)
    };
}

#[macro_export]
macro_rules! res {
    ($err:expr) => {
        Err(From::from($err))
    };
}

/// Lexically clean a slash-separated path: collapse repeated slashes,
/// resolve `.` and `..`, and clamp `..` at the root for rooted paths.
///
/// Relative paths stay relative; the cleaned form of an empty or
/// all-dots relative path is `"."`, of an empty rooted path `"/"`.
pub fn clean(path: &str) -> String {
    let rooted = path.starts_with('/');

    let mut parts: Vec<&str> = Vec::new();
    for comp in path.split('/') {
        match comp {
            "" | "." => {}
            ".." => match parts.last() {
                Some(&last) if last != ".." => {
                    parts.pop();
                }
                Some(_) => parts.push(".."),
                None if !rooted => parts.push(".."),
                None => {}
            },
            comp => parts.push(comp),
        }
    }

    let joined = parts.join("/");
    match (rooted, joined.is_empty()) {
        (true, true) => "/".to_owned(),
        (true, false) => format!("/{}", joined),
        (false, true) => ".".to_owned(),
        (false, false) => joined,
    }
}

/// Join a path component onto a base path and clean the result.
pub fn join(base: &str, name: &str) -> String {
    clean(&format!("{}/{}", base, name))
}

/// Normalize an attach name: empty and `"."` mean the root of the
/// exported tree, everything else is cleaned and rooted.
pub fn clean_aname(aname: &str) -> String {
    match aname {
        "" | "." => "/".to_owned(),
        aname if aname.starts_with('/') => clean(aname),
        aname => clean(&format!("/{}", aname)),
    }
}

/// Parse a `proto!address!port` server address as used by [`srv_async`]
/// (e.g. `tcp!0.0.0.0!564` or `unix!/tmp/sock`).
///
/// [`srv_async`]: crate::srv::srv_async
pub fn parse_proto(arg: &str) -> Option<(&str, String)> {
    let mut split = arg.split('!');
    match (split.next()?, split.next()?, split.next()) {
        ("tcp", addr, Some(port)) => Some(("tcp", format!("{}:{}", addr, port))),
        ("unix", path, _) => Some(("unix", path.to_owned())),
        _ => None,
    }
}

/// A dial address accepted by the client convenience layer.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Addr {
    Tcp(String),
    Unix(String),
}

/// Parse the address forms accepted by [`Client::dial`]:
///
/// * `tcp!host!port` and `unix!path`
/// * `./path` and `/path` (unix-domain sockets)
/// * `host:port`, with the service names `9p` and `9fs` mapping to the
///   standard port
/// * a bare `host`, which gets the standard port
///
/// [`Client::dial`]: crate::client::Client::dial
pub fn parse_addr(addr: &str) -> Result<Addr> {
    if let Some(rest) = addr.strip_prefix("tcp!") {
        return match rest.split_once('!') {
            Some((host, port)) => Ok(Addr::Tcp(format!("{}:{}", host, port))),
            None => Ok(Addr::Tcp(format!("{}:{}", rest, STD_PORT))),
        };
    }
    if let Some(path) = addr.strip_prefix("unix!") {
        return Ok(Addr::Unix(path.to_owned()));
    }
    if addr.starts_with('/') || addr.starts_with("./") {
        return Ok(Addr::Unix(addr.to_owned()));
    }

    match addr.rsplit_once(':') {
        Some((host, "9p")) | Some((host, "9fs")) => Ok(Addr::Tcp(format!("{}:{}", host, STD_PORT))),
        Some((host, port)) => match port.parse::<u16>() {
            Ok(port) => Ok(Addr::Tcp(format!("{}:{}", host, port))),
            Err(_) => res!(error::Error::InvalidAddress(addr.to_owned())),
        },
        None => Ok(Addr::Tcp(format!("{}:{}", addr, STD_PORT))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clean_paths() {
        assert_eq!(clean("/"), "/");
        assert_eq!(clean(""), ".");
        assert_eq!(clean("."), ".");
        assert_eq!(clean("/a/b/../c"), "/a/c");
        assert_eq!(clean("a//b/./c/"), "a/b/c");
        assert_eq!(clean("/.."), "/");
        assert_eq!(clean("/../a"), "/a");
        assert_eq!(clean("../a"), "../a");
        assert_eq!(clean("a/.."), ".");
    }

    #[test]
    fn join_clamps_at_root() {
        assert_eq!(join("/", "test"), "/test");
        assert_eq!(join("/a/b", ".."), "/a");
        assert_eq!(join("/", ".."), "/");
        assert_eq!(join("/a", "."), "/a");
    }

    #[test]
    fn aname_forms() {
        assert_eq!(clean_aname(""), "/");
        assert_eq!(clean_aname("."), "/");
        assert_eq!(clean_aname("/"), "/");
        assert_eq!(clean_aname("sub/tree"), "/sub/tree");
        assert_eq!(clean_aname("/sub/./tree"), "/sub/tree");
    }

    #[test]
    fn addr_forms() {
        assert_eq!(
            parse_addr("tcp!example.com!564").unwrap(),
            Addr::Tcp("example.com:564".to_owned())
        );
        assert_eq!(
            parse_addr("unix!/tmp/sock").unwrap(),
            Addr::Unix("/tmp/sock".to_owned())
        );
        assert_eq!(
            parse_addr("/tmp/sock").unwrap(),
            Addr::Unix("/tmp/sock".to_owned())
        );
        assert_eq!(
            parse_addr("localhost:9999").unwrap(),
            Addr::Tcp("localhost:9999".to_owned())
        );
        assert_eq!(
            parse_addr("example.com:9fs").unwrap(),
            Addr::Tcp("example.com:564".to_owned())
        );
        assert_eq!(
            parse_addr("example.com").unwrap(),
            Addr::Tcp("example.com:564".to_owned())
        );
        assert!(parse_addr("host:notaport").is_err());
    }
}
