//! Derivation of one [`Environment`] per parsed request.
//!
//! The builder is constructed once per server, next to the listener config,
//! and invoked once per request with the parsed head
//! ([`http::request::Parts`]), the per-connection facts and the body input.
//! Values the derivation has to copy out of the borrowed request anyway are
//! stored ready; everything else goes in as a deferred producer so requests
//! whose handlers never read most fields pay for none of them.

use std::net::SocketAddr;
use std::sync::Arc;

use http::{HeaderMap, Version, header, request::Parts};
use tracing::trace;

use crate::env::{Environment, LazyEntry, Value};
use crate::error::BuildError;
use crate::hijack::{HijackCell, HijackProc};
use crate::io::{ErrorSink, RackInput, Transport};
use crate::key::{KeyRegistry, RackKey};

/// The rack protocol version this adapter speaks, `rack.version`.
pub const RACK_VERSION: [u8; 2] = [1, 4];

/// Per-connection facts the server layer hands over next to the parsed
/// request head.
#[derive(Debug)]
pub struct ConnectionParts {
    /// Peer socket address, when the transport can name one.
    pub peer_addr: Option<SocketAddr>,
    /// Whether the connection is TLS-terminated.
    pub secure: bool,
    /// The raw connection byte stream, armed for a potential hijack.
    pub transport: Transport,
}

/// Builds a fresh [`Environment`] for every inbound request.
#[derive(Debug)]
pub struct EnvironmentBuilder {
    registry: Arc<KeyRegistry>,
    errors: ErrorSink,
    server_name: String,
    server_port: u16,
    mount: String,
}

impl EnvironmentBuilder {
    /// Create a builder with the default local endpoint
    /// (`localhost:80`, mounted at the root) and a stderr error sink.
    #[must_use]
    pub fn new(registry: Arc<KeyRegistry>) -> Self {
        Self {
            registry,
            errors: ErrorSink::stderr(),
            server_name: "localhost".to_owned(),
            server_port: 80,
            mount: "/".to_owned(),
        }
    }

    pub fn set_server_name(&mut self, name: impl Into<String>) -> &mut Self {
        self.server_name = name.into();
        self
    }

    #[must_use]
    pub fn with_server_name(mut self, name: impl Into<String>) -> Self {
        self.set_server_name(name);
        self
    }

    pub fn set_server_port(&mut self, port: u16) -> &mut Self {
        self.server_port = port;
        self
    }

    #[must_use]
    pub fn with_server_port(mut self, port: u16) -> Self {
        self.set_server_port(port);
        self
    }

    /// Set the fixed mount path the application is served under.
    pub fn set_mount(&mut self, mount: impl Into<String>) -> &mut Self {
        self.mount = mount.into();
        self
    }

    #[must_use]
    pub fn with_mount(mut self, mount: impl Into<String>) -> Self {
        self.set_mount(mount);
        self
    }

    pub fn set_errors(&mut self, errors: ErrorSink) -> &mut Self {
        self.errors = errors;
        self
    }

    #[must_use]
    pub fn with_errors(mut self, errors: ErrorSink) -> Self {
        self.set_errors(errors);
        self
    }

    /// Build the environment for one request.
    ///
    /// Fails only on a malformed `Content-Length` header; every other
    /// derivation is infallible. Soft-missing data (no peer address) is
    /// normalized, never an error.
    pub fn build(
        &self,
        parts: &Parts,
        conn: ConnectionParts,
        input: RackInput,
    ) -> Result<Environment, BuildError> {
        let ConnectionParts {
            peer_addr,
            secure,
            transport,
        } = conn;

        let content_length = parse_content_length(&parts.headers)?;

        let cell = HijackCell::new(transport);
        let mut env = Environment::new(self.registry.clone(), cell.clone());

        env.lazy_put(RackKey::Input, Value::Input(input));
        env.lazy_put(RackKey::Errors, Value::Errors(self.errors.clone()));

        // the raw path as received from the transport layer,
        // decoding is the application's job
        let (script_name, path_info) = split_mount(&self.mount, parts.uri.path());

        let method = parts.method.clone();
        env.lazy_put(
            RackKey::RequestMethod,
            LazyEntry::thunk(move || Value::Str(method.as_str().to_owned())),
        );
        env.lazy_put(RackKey::ScriptName, Value::from(script_name.clone()));
        env.lazy_put(RackKey::PathInfo, Value::from(path_info.clone()));
        env.lazy_put(
            RackKey::QueryString,
            Value::from(parts.uri.query().unwrap_or_default()),
        );
        env.lazy_put(RackKey::ServerName, Value::from(self.server_name.clone()));
        let port = self.server_port;
        env.lazy_put(
            RackKey::ServerPort,
            LazyEntry::thunk(move || Value::Str(port.to_string())),
        );
        let version = parts.version;
        env.lazy_put(
            RackKey::HttpVersion,
            LazyEntry::thunk(move || Value::Str(http_version_token(version).to_owned())),
        );
        if let Some(content_type) = parts.headers.get(header::CONTENT_TYPE) {
            let content_type = content_type.clone();
            env.lazy_put(
                RackKey::ContentType,
                LazyEntry::thunk(move || {
                    Value::Str(String::from_utf8_lossy(content_type.as_bytes()).into_owned())
                }),
            );
        }
        env.lazy_put(
            RackKey::RequestUri,
            LazyEntry::thunk(move || Value::Str(format!("{script_name}{path_info}"))),
        );
        env.lazy_put(
            RackKey::RemoteAddr,
            LazyEntry::thunk(move || Value::Str(remote_addr(peer_addr))),
        );
        env.lazy_put(
            RackKey::UrlScheme,
            Value::from(if secure { "https" } else { "http" }),
        );
        env.lazy_put(RackKey::Version, Value::Version(RACK_VERSION));
        env.lazy_put(RackKey::Multithread, Value::Bool(true));
        env.lazy_put(RackKey::Multiprocess, Value::Bool(false));
        env.lazy_put(RackKey::RunOnce, Value::Bool(false));
        env.lazy_put(RackKey::HijackCheck, Value::Bool(true));
        env.lazy_put(RackKey::Hijack, Value::Proc(HijackProc::new(cell)));

        if let Some(length) = content_length {
            env.lazy_put(RackKey::ContentLength, Value::Str(length.to_string()));
        }
        if secure {
            env.lazy_put(RackKey::Https, Value::from("on"));
        }

        trace!(
            http.request.method = %parts.method,
            url.path = parts.uri.path(),
            "rack env: request environment built"
        );

        Ok(env)
    }
}

/// Resolve `SCRIPT_NAME` and `PATH_INFO` against the fixed mount path.
///
/// The root mount yields an empty script name, never `"/"`. A non-root
/// mount strips its own prefix from the path; a path outside the mount is
/// passed through untouched.
fn split_mount(mount: &str, path: &str) -> (String, String) {
    if mount == "/" {
        return (String::new(), path.to_owned());
    }
    let path_info = path.strip_prefix(mount).unwrap_or(path);
    (mount.to_owned(), path_info.to_owned())
}

fn http_version_token(version: Version) -> &'static str {
    if version == Version::HTTP_11 {
        "HTTP/1.1"
    } else {
        "HTTP/1.0"
    }
}

/// Textual peer address; soft-missing data becomes an empty string.
fn remote_addr(peer_addr: Option<SocketAddr>) -> String {
    peer_addr
        .map(|addr| addr.ip().to_string())
        .unwrap_or_default()
}

/// `Ok(None)` when the header is absent, empty, or negative; only a
/// present but non-numeric value is a hard failure.
fn parse_content_length(headers: &HeaderMap) -> Result<Option<u64>, BuildError> {
    let Some(raw) = headers.get(header::CONTENT_LENGTH) else {
        return Ok(None);
    };
    let raw = raw
        .to_str()
        .map_err(|_| BuildError::InvalidContentLength(format!("{raw:?}")))?;
    if raw.is_empty() {
        return Ok(None);
    }
    let length = raw
        .parse::<i64>()
        .map_err(|_| BuildError::InvalidContentLength(raw.to_owned()))?;
    Ok(u64::try_from(length).ok())
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::Request;
    use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};

    fn builder() -> EnvironmentBuilder {
        EnvironmentBuilder::new(Arc::new(KeyRegistry::new()))
    }

    fn head(request: Request<()>) -> Parts {
        request.into_parts().0
    }

    fn build_with_peer(
        builder: &EnvironmentBuilder,
        parts: &Parts,
        secure: bool,
    ) -> (Result<Environment, BuildError>, DuplexStream) {
        let (near, far) = tokio::io::duplex(64);
        let conn = ConnectionParts {
            peer_addr: Some("127.0.0.1:34712".parse().unwrap()),
            secure,
            transport: Transport::new(near),
        };
        (builder.build(parts, conn, RackInput::empty()), far)
    }

    fn build(parts: &Parts, secure: bool) -> Result<Environment, BuildError> {
        build_with_peer(&builder(), parts, secure).0
    }

    fn get_str<'a>(env: &'a mut Environment, key: &str) -> Option<&'a str> {
        env.get(key).and_then(Value::as_str)
    }

    #[test]
    fn root_mounted_request_paths() {
        let parts = head(Request::get("/foo/bar?x=1").body(()).unwrap());
        let mut env = build(&parts, false).unwrap();

        assert_eq!(get_str(&mut env, "SCRIPT_NAME"), Some(""));
        assert_eq!(get_str(&mut env, "PATH_INFO"), Some("/foo/bar"));
        assert_eq!(get_str(&mut env, "QUERY_STRING"), Some("x=1"));
        assert_eq!(get_str(&mut env, "REQUEST_URI"), Some("/foo/bar"));
        assert_eq!(get_str(&mut env, "REQUEST_METHOD"), Some("GET"));
    }

    #[test]
    fn non_root_mount_strips_its_prefix() {
        let builder = builder().with_mount("/app");
        let parts = head(Request::get("/app/reports?id=7").body(()).unwrap());
        let mut env = build_with_peer(&builder, &parts, false).0.unwrap();

        assert_eq!(get_str(&mut env, "SCRIPT_NAME"), Some("/app"));
        assert_eq!(get_str(&mut env, "PATH_INFO"), Some("/reports"));
        assert_eq!(get_str(&mut env, "REQUEST_URI"), Some("/app/reports"));

        // a path outside the mount is passed through untouched
        let parts = head(Request::get("/other").body(()).unwrap());
        let mut env = build_with_peer(&builder, &parts, false).0.unwrap();
        assert_eq!(get_str(&mut env, "PATH_INFO"), Some("/other"));
    }

    #[test]
    fn path_is_not_decoded_by_the_adapter() {
        let parts = head(Request::get("/foo%20bar/%2e").body(()).unwrap());
        let mut env = build(&parts, false).unwrap();
        assert_eq!(get_str(&mut env, "PATH_INFO"), Some("/foo%20bar/%2e"));
    }

    #[test]
    fn query_string_is_empty_not_absent() {
        let parts = head(Request::get("/foo").body(()).unwrap());
        let mut env = build(&parts, false).unwrap();
        assert_eq!(get_str(&mut env, "QUERY_STRING"), Some(""));
    }

    #[test]
    fn url_scheme_follows_the_secure_flag() {
        let parts = head(Request::get("/").body(()).unwrap());

        let mut env = build(&parts, false).unwrap();
        assert_eq!(get_str(&mut env, "rack.url_scheme"), Some("http"));
        assert!(env.get("HTTPS").is_none());
        assert!(!env.keys().any(|key| key == "HTTPS"));

        let mut env = build(&parts, true).unwrap();
        assert_eq!(get_str(&mut env, "rack.url_scheme"), Some("https"));
        assert_eq!(get_str(&mut env, "HTTPS"), Some("on"));
    }

    #[test]
    fn content_length_present_and_numeric() {
        let parts = head(
            Request::post("/submit")
                .header(header::CONTENT_LENGTH, "42")
                .body(())
                .unwrap(),
        );
        let mut env = build(&parts, false).unwrap();
        assert_eq!(get_str(&mut env, "CONTENT_LENGTH"), Some("42"));
    }

    #[test]
    fn content_length_absent_means_no_entry() {
        let parts = head(Request::get("/").body(()).unwrap());
        let env = build(&parts, false).unwrap();
        assert!(!env.keys().any(|key| key == "CONTENT_LENGTH"));
    }

    #[test]
    fn content_length_negative_is_silently_omitted() {
        let parts = head(
            Request::post("/submit")
                .header(header::CONTENT_LENGTH, "-5")
                .body(())
                .unwrap(),
        );
        let env = build(&parts, false).unwrap();
        assert!(!env.keys().any(|key| key == "CONTENT_LENGTH"));
    }

    #[test]
    fn content_length_unparsable_is_a_hard_error() {
        let parts = head(
            Request::post("/submit")
                .header(header::CONTENT_LENGTH, "abc")
                .body(())
                .unwrap(),
        );
        let err = build(&parts, false).unwrap_err();
        assert!(matches!(err, BuildError::InvalidContentLength(raw) if raw == "abc"));
    }

    #[test]
    fn content_type_verbatim_or_absent() {
        let parts = head(
            Request::post("/submit")
                .header(header::CONTENT_TYPE, "application/json; charset=utf-8")
                .body(())
                .unwrap(),
        );
        let mut env = build(&parts, false).unwrap();
        assert_eq!(
            get_str(&mut env, "CONTENT_TYPE"),
            Some("application/json; charset=utf-8")
        );

        let parts = head(Request::get("/").body(()).unwrap());
        let mut env = build(&parts, false).unwrap();
        assert!(env.get("CONTENT_TYPE").is_none());
    }

    #[test]
    fn http_version_distinguishes_only_two_tokens() {
        let parts = head(
            Request::get("/")
                .version(Version::HTTP_11)
                .body(())
                .unwrap(),
        );
        let mut env = build(&parts, false).unwrap();
        assert_eq!(get_str(&mut env, "HTTP_VERSION"), Some("HTTP/1.1"));

        let parts = head(
            Request::get("/")
                .version(Version::HTTP_10)
                .body(())
                .unwrap(),
        );
        let mut env = build(&parts, false).unwrap();
        assert_eq!(get_str(&mut env, "HTTP_VERSION"), Some("HTTP/1.0"));
    }

    #[test]
    fn remote_addr_is_the_peer_ip_or_empty() {
        let parts = head(Request::get("/").body(()).unwrap());
        let mut env = build(&parts, false).unwrap();
        assert_eq!(get_str(&mut env, "REMOTE_ADDR"), Some("127.0.0.1"));

        let (near, _far) = tokio::io::duplex(8);
        let conn = ConnectionParts {
            peer_addr: None,
            secure: false,
            transport: Transport::new(near),
        };
        let mut env = builder().build(&parts, conn, RackInput::empty()).unwrap();
        assert_eq!(get_str(&mut env, "REMOTE_ADDR"), Some(""));
    }

    #[test]
    fn server_endpoint_comes_from_the_builder() {
        let builder = builder()
            .with_server_name("app.internal")
            .with_server_port(8443);
        let parts = head(Request::get("/").body(()).unwrap());
        let mut env = build_with_peer(&builder, &parts, true).0.unwrap();

        assert_eq!(get_str(&mut env, "SERVER_NAME"), Some("app.internal"));
        assert_eq!(get_str(&mut env, "SERVER_PORT"), Some("8443"));
    }

    #[test]
    fn process_model_flags_are_fixed() {
        let parts = head(Request::get("/").body(()).unwrap());
        let mut env = build(&parts, false).unwrap();

        assert_eq!(env.get("rack.multithread").and_then(Value::as_bool), Some(true));
        assert_eq!(env.get("rack.multiprocess").and_then(Value::as_bool), Some(false));
        assert_eq!(env.get("rack.run_once").and_then(Value::as_bool), Some(false));
        assert_eq!(env.get("rack.hijack?").and_then(Value::as_bool), Some(true));
        assert_eq!(
            env.get("rack.version").and_then(Value::as_version),
            Some([1, 4])
        );
    }

    #[test]
    fn input_and_errors_handles_are_present() {
        let parts = head(Request::get("/").body(()).unwrap());
        let mut env = build(&parts, false).unwrap();

        assert!(env.get("rack.input").and_then(Value::as_input).is_some());
        assert!(env.get("rack.errors").and_then(Value::as_errors).is_some());
    }

    #[test]
    fn hijacked_transport_reaches_the_connection_peer() {
        let parts = head(Request::get("/").body(()).unwrap());
        let (env, mut far) = build_with_peer(&builder(), &parts, false);
        let mut env = env.unwrap();

        env.get("rack.hijack")
            .and_then(Value::as_proc)
            .expect("rack.hijack entry")
            .call()
            .unwrap();
        assert!(env.is_hijacked());

        assert!(matches!(
            env.get(crate::env::HIJACK_IO_KEY),
            Some(Value::Io(_))
        ));
        let Some(Value::Io(mut transport)) = env.remove(crate::env::HIJACK_IO_KEY) else {
            panic!("rack.hijack_io holds the transport")
        };

        tokio_test::block_on(async move {
            let payload = b"HTTP/1.1 101 Switching Protocols\r\n";
            transport.write_all(payload).await.unwrap();
            transport.flush().await.unwrap();

            let mut read = vec![0u8; payload.len()];
            far.read_exact(&mut read).await.unwrap();
            assert_eq!(&read, payload);
        });
    }
}
