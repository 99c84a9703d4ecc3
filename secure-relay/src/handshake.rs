//! Session establishment.
//!
//! ```text
//! server -> peer   base64(SubjectPublicKeyInfo DER)
//! peer   -> server base64(RSA-PKCS1v15(session key))
//! peer   -> server NICK|<display name>
//! ```
//!
//! Both sides block on each line. Any failure is reported as
//! [`RelayError::Handshake`] and is terminal for the connection.

use tokio::io::{AsyncBufRead, AsyncWrite};
use tracing::debug;

use crate::{
    config::RelayConfig,
    crypto::{self, SessionKey},
    error::{RelayError, RelayResult},
    protocol,
    transport::{expect_line, write_line},
};

/// Result of a successful server-side handshake.
#[derive(Debug)]
pub struct Established {
    pub session_key: SessionKey,
    pub display_name: String,
}

/// Server side: announce the public key, unwrap the peer's session key, read its name.
pub async fn accept<R, W>(reader: &mut R, writer: &mut W, config: &RelayConfig) -> RelayResult<Established>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    run_accept(reader, writer, config)
        .await
        .map_err(RelayError::during_handshake)
}

async fn run_accept<R, W>(reader: &mut R, writer: &mut W, config: &RelayConfig) -> RelayResult<Established>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    write_line(writer, config.public_key_text()).await?;

    let wrapped = expect_line(reader, "the session key").await?;
    let wrapped = crypto::text_decode(wrapped.trim())?;
    let raw_key = crypto::asymmetric_decrypt(&wrapped, config.keypair().private_key())?;
    let session_key = SessionKey::from_bytes(&raw_key)?;
    debug!(bits = session_key.bits(), "session key unwrapped");

    let nick = expect_line(reader, "the display name").await?;
    let display_name = protocol::parse_nick_line(&nick)
        .ok_or_else(|| RelayError::Handshake("expected a NICK|<name> line".to_string()))?
        .to_string();

    Ok(Established {
        session_key,
        display_name,
    })
}

/// Peer side: read the relay's public key, send a freshly generated session key and a display name.
pub async fn initiate<R, W>(
    reader: &mut R,
    writer: &mut W,
    display_name: &str,
    key_bits: usize,
) -> RelayResult<SessionKey>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let session_key = crypto::generate_session_key(key_bits)?;
    offer_session_key(reader, writer, display_name, session_key)
        .await
        .map_err(RelayError::during_handshake)
}

/// Like [`initiate`] but with a caller-chosen key.
pub async fn offer_session_key<R, W>(
    reader: &mut R,
    writer: &mut W,
    display_name: &str,
    session_key: SessionKey,
) -> RelayResult<SessionKey>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let nick = protocol::nick_line(display_name);
    if display_name.contains(['\n', '\r']) || protocol::parse_nick_line(&nick).is_none() {
        return Err(RelayError::Handshake(format!(
            "display name {display_name:?} must be a single non-empty line"
        )));
    }

    let public_text = expect_line(reader, "the relay public key").await?;
    let public_key = crypto::decode_public_key(&public_text)?;
    let wrapped = crypto::asymmetric_encrypt(session_key.as_bytes(), &public_key)?;

    write_line(writer, &crypto::text_encode(&wrapped)).await?;
    write_line(writer, &nick).await?;

    Ok(session_key)
}
