//! User authentication (RFC 4252).
//!
//! The handshake hands the session identifier (the first exchange hash) to
//! this module once NEWKEYS are active in both directions. The driver
//! requests the `ssh-userauth` service and runs the configured methods in
//! order; per RFC 4252 only the first instance of each method name is
//! attempted. A cheap "none" probe always runs first, matching common
//! client behavior.
//!
//! Method *implementations* beyond [`NoneAuth`] and [`PasswordAuth`] are
//! out of scope; the [`AuthMethod`] trait and the RFC 4252 Section 7
//! signature-data builder are the contract key-based methods build on.

use async_trait::async_trait;
use bytes::BytesMut;
use skiff_platform::{SkiffError, SkiffResult};
use std::collections::HashSet;
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{debug, info};

use crate::ssh::message::{expect_type, MessageType, ServiceAccept, ServiceRequest};
use crate::ssh::transport::{TransportReader, TransportWriter};
use crate::ssh::wire;

/// The user-authentication service name.
pub const SERVICE_USERAUTH: &str = "ssh-userauth";

/// The connection service requested once authentication succeeds.
pub const SERVICE_CONNECTION: &str = "ssh-connection";

/// SSH_MSG_USERAUTH_REQUEST (RFC 4252 Section 5).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserauthRequest {
    /// User name being authenticated.
    pub user: String,
    /// Service to start, normally "ssh-connection".
    pub service: String,
    /// Method name, e.g. "none", "password", "publickey".
    pub method: String,
    /// Method-specific trailing payload.
    pub payload: Vec<u8>,
}

impl UserauthRequest {
    /// Serializes to bytes.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = BytesMut::new();
        wire::write_u8(&mut buf, MessageType::UserauthRequest as u8);
        wire::write_string(&mut buf, self.user.as_bytes());
        wire::write_string(&mut buf, self.service.as_bytes());
        wire::write_string(&mut buf, self.method.as_bytes());
        buf.extend_from_slice(&self.payload);
        buf.to_vec()
    }

    /// Parses from bytes; trailing bytes become the payload.
    pub fn from_bytes(data: &[u8]) -> SkiffResult<Self> {
        let mut offset = 0;
        expect_type(data, &mut offset, MessageType::UserauthRequest)?;
        Ok(Self {
            user: wire::read_string_utf8(data, &mut offset)?,
            service: wire::read_string_utf8(data, &mut offset)?,
            method: wire::read_string_utf8(data, &mut offset)?,
            payload: data[offset..].to_vec(),
        })
    }
}

/// SSH_MSG_USERAUTH_FAILURE (RFC 4252 Section 5.1).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserauthFailure {
    /// Methods that can continue, in server preference order.
    pub methods: Vec<String>,
    /// Whether the attempted method partially succeeded.
    pub partial_success: bool,
}

impl UserauthFailure {
    /// Serializes to bytes.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = BytesMut::new();
        wire::write_u8(&mut buf, MessageType::UserauthFailure as u8);
        wire::write_string(&mut buf, self.methods.join(",").as_bytes());
        wire::write_bool(&mut buf, self.partial_success);
        buf.to_vec()
    }

    /// Parses from bytes.
    pub fn from_bytes(data: &[u8]) -> SkiffResult<Self> {
        let mut offset = 0;
        expect_type(data, &mut offset, MessageType::UserauthFailure)?;
        let list = wire::read_string_utf8(data, &mut offset)?;
        let methods = if list.is_empty() {
            vec![]
        } else {
            list.split(',').map(String::from).collect()
        };
        Ok(Self {
            methods,
            partial_success: wire::read_bool(data, &mut offset)?,
        })
    }
}

/// SSH_MSG_USERAUTH_BANNER (RFC 4252 Section 5.4).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserauthBanner {
    /// Banner text. Sanitized with [`wire::safe_string`] before display.
    pub message: String,
    /// RFC 3066 language tag.
    pub language: String,
}

impl UserauthBanner {
    /// Serializes to bytes.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = BytesMut::new();
        wire::write_u8(&mut buf, MessageType::UserauthBanner as u8);
        wire::write_string(&mut buf, self.message.as_bytes());
        wire::write_string(&mut buf, self.language.as_bytes());
        buf.to_vec()
    }

    /// Parses from bytes.
    pub fn from_bytes(data: &[u8]) -> SkiffResult<Self> {
        let mut offset = 0;
        expect_type(data, &mut offset, MessageType::UserauthBanner)?;
        Ok(Self {
            message: wire::read_string_utf8(data, &mut offset)?,
            language: wire::read_string_utf8(data, &mut offset)?,
        })
    }
}

/// Builds the data a publickey method signs to prove possession of the key
/// (RFC 4252 Section 7): session id, message byte 50, user, service,
/// method, the TRUE byte, algorithm name, and the public-key blob.
pub fn build_sign_data(
    session_id: &[u8],
    user: &str,
    service: &str,
    method: &str,
    algo: &str,
    pub_key: &[u8],
) -> Vec<u8> {
    let mut buf = BytesMut::new();
    wire::write_string(&mut buf, session_id);
    wire::write_u8(&mut buf, MessageType::UserauthRequest as u8);
    wire::write_string(&mut buf, user.as_bytes());
    wire::write_string(&mut buf, service.as_bytes());
    wire::write_string(&mut buf, method.as_bytes());
    wire::write_u8(&mut buf, 1);
    wire::write_string(&mut buf, algo.as_bytes());
    wire::write_string(&mut buf, pub_key);
    buf.to_vec()
}

/// Packet access handed to authentication methods during the sequential
/// handshake phase.
pub struct AuthTransport<'a, R, W> {
    reader: &'a mut TransportReader<R>,
    writer: &'a mut TransportWriter<W>,
}

impl<'a, R: AsyncRead + Unpin, W: AsyncWrite + Unpin> AuthTransport<'a, R, W> {
    /// Wraps the two transport halves.
    pub fn new(reader: &'a mut TransportReader<R>, writer: &'a mut TransportWriter<W>) -> Self {
        Self { reader, writer }
    }

    /// Writes one packet.
    pub async fn write_packet(&mut self, payload: &[u8]) -> SkiffResult<()> {
        self.writer.write_packet(payload).await
    }

    /// Reads one packet.
    pub async fn read_packet(&mut self) -> SkiffResult<Vec<u8>> {
        self.reader.read_packet().await
    }

    /// Sends one userauth request and consumes responses until the server
    /// accepts or refuses it. Banners are logged and skipped.
    pub async fn round_trip(&mut self, request: &UserauthRequest) -> SkiffResult<bool> {
        self.write_packet(&request.to_bytes()).await?;
        loop {
            let packet = self.read_packet().await?;
            match packet.first().copied() {
                Some(b) if b == MessageType::UserauthSuccess as u8 => return Ok(true),
                Some(b) if b == MessageType::UserauthFailure as u8 => {
                    let failure = UserauthFailure::from_bytes(&packet)?;
                    debug!(
                        methods = failure.methods.join(",").as_str(),
                        partial = failure.partial_success,
                        "authentication attempt refused"
                    );
                    return Ok(false);
                }
                Some(b) if b == MessageType::UserauthBanner as u8 => {
                    let banner = UserauthBanner::from_bytes(&packet)?;
                    info!("server banner: {}", wire::safe_string(&banner.message));
                }
                Some(got) => {
                    return Err(SkiffError::UnexpectedMessage {
                        expected: MessageType::UserauthSuccess as u8,
                        got,
                    })
                }
                None => {
                    return Err(SkiffError::MalformedMessage(
                        "empty packet during authentication".to_string(),
                    ))
                }
            }
        }
    }
}

/// One RFC 4252 authentication method.
#[async_trait]
pub trait AuthMethod: Send + Sync {
    /// The RFC 4252 method name, e.g. "password".
    fn method_name(&self) -> &'static str;

    /// Runs the method's conversation. Returns whether the server accepted
    /// authentication.
    async fn authenticate(
        &self,
        transport: &mut AuthTransport<
            '_,
            Box<dyn AsyncRead + Send + Unpin>,
            Box<dyn AsyncWrite + Send + Unpin>,
        >,
        user: &str,
        session_id: &[u8],
    ) -> SkiffResult<bool>;
}

/// The "none" method: succeeds only on servers that require no
/// authentication, and doubles as the customary opening probe.
pub struct NoneAuth;

#[async_trait]
impl AuthMethod for NoneAuth {
    fn method_name(&self) -> &'static str {
        "none"
    }

    async fn authenticate(
        &self,
        transport: &mut AuthTransport<
            '_,
            Box<dyn AsyncRead + Send + Unpin>,
            Box<dyn AsyncWrite + Send + Unpin>,
        >,
        user: &str,
        _session_id: &[u8],
    ) -> SkiffResult<bool> {
        let request = UserauthRequest {
            user: user.to_string(),
            service: SERVICE_CONNECTION.to_string(),
            method: "none".to_string(),
            payload: vec![],
        };
        transport.round_trip(&request).await
    }
}

/// The "password" method (RFC 4252 Section 8).
pub struct PasswordAuth {
    /// The password to present.
    pub password: String,
}

#[async_trait]
impl AuthMethod for PasswordAuth {
    fn method_name(&self) -> &'static str {
        "password"
    }

    async fn authenticate(
        &self,
        transport: &mut AuthTransport<
            '_,
            Box<dyn AsyncRead + Send + Unpin>,
            Box<dyn AsyncWrite + Send + Unpin>,
        >,
        user: &str,
        _session_id: &[u8],
    ) -> SkiffResult<bool> {
        let mut payload = BytesMut::new();
        wire::write_bool(&mut payload, false);
        wire::write_string(&mut payload, self.password.as_bytes());

        let request = UserauthRequest {
            user: user.to_string(),
            service: SERVICE_CONNECTION.to_string(),
            method: "password".to_string(),
            payload: payload.to_vec(),
        };
        transport.round_trip(&request).await
    }
}

/// Runs the authentication phase: requests the `ssh-userauth` service, then
/// tries "none" followed by each configured method, skipping repeated
/// method names.
pub(crate) async fn authenticate(
    transport: &mut AuthTransport<
        '_,
        Box<dyn AsyncRead + Send + Unpin>,
        Box<dyn AsyncWrite + Send + Unpin>,
    >,
    user: &str,
    methods: &[Box<dyn AuthMethod>],
    session_id: &[u8],
) -> SkiffResult<()> {
    let service_request = ServiceRequest {
        service: SERVICE_USERAUTH.to_string(),
    };
    transport.write_packet(&service_request.to_bytes()).await?;

    let packet = transport.read_packet().await?;
    let accept = ServiceAccept::from_bytes(&packet)?;
    if accept.service != SERVICE_USERAUTH {
        return Err(SkiffError::Security(format!(
            "server accepted service '{}' instead of '{}'",
            accept.service, SERVICE_USERAUTH
        )));
    }

    let none = NoneAuth;
    let mut tried = HashSet::new();

    tried.insert(none.method_name());
    if none.authenticate(transport, user, session_id).await? {
        return Ok(());
    }

    for method in methods {
        // Only the first instance of each RFC 4252 method is used.
        if !tried.insert(method.method_name()) {
            continue;
        }
        if method.authenticate(transport, user, session_id).await? {
            return Ok(());
        }
    }

    Err(SkiffError::Security(
        "no configured authentication method succeeded".to_string(),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_userauth_request_round_trip() {
        let request = UserauthRequest {
            user: "deploy".to_string(),
            service: SERVICE_CONNECTION.to_string(),
            method: "none".to_string(),
            payload: vec![],
        };
        let bytes = request.to_bytes();
        assert_eq!(bytes[0], 50);
        assert_eq!(UserauthRequest::from_bytes(&bytes).unwrap(), request);
    }

    #[test]
    fn test_userauth_failure_round_trip() {
        let failure = UserauthFailure {
            methods: vec!["publickey".to_string(), "password".to_string()],
            partial_success: false,
        };
        assert_eq!(
            UserauthFailure::from_bytes(&failure.to_bytes()).unwrap(),
            failure
        );
    }

    #[test]
    fn test_userauth_banner_round_trip() {
        let banner = UserauthBanner {
            message: "authorized use only\n".to_string(),
            language: String::new(),
        };
        assert_eq!(
            UserauthBanner::from_bytes(&banner.to_bytes()).unwrap(),
            banner
        );
    }

    #[test]
    fn test_build_sign_data_layout() {
        let data = build_sign_data(b"sid", "u", "svc", "publickey", "ssh-rsa", b"blob");

        let mut expected = BytesMut::new();
        wire::write_string(&mut expected, b"sid");
        expected.extend_from_slice(&[50]);
        wire::write_string(&mut expected, b"u");
        wire::write_string(&mut expected, b"svc");
        wire::write_string(&mut expected, b"publickey");
        expected.extend_from_slice(&[1]);
        wire::write_string(&mut expected, b"ssh-rsa");
        wire::write_string(&mut expected, b"blob");

        assert_eq!(data, expected.to_vec());
    }

    #[test]
    fn test_password_payload_layout() {
        let mut payload = BytesMut::new();
        wire::write_bool(&mut payload, false);
        wire::write_string(&mut payload, b"hunter2");

        // FALSE byte then the password as a byte-string.
        assert_eq!(payload[0], 0);
        let mut offset = 1;
        assert_eq!(
            wire::read_string(&payload, &mut offset).unwrap(),
            b"hunter2"
        );
    }
}
