//! Link obfuscation for the peer wire protocol.
//!
//! This is a lightweight Diffie-Hellman key exchange over the 768-bit MODP
//! group from RFC 2409 Appendix E, followed by RC4 stream encryption of
//! everything exchanged afterwards. It is NOT BEP10 Message Stream
//! Encryption: there is no crypto_provide negotiation, no `VC`/padding
//! scheme, and both directions share a single derived key rather than
//! deriving independent send/receive keys. It exists purely to defeat naive
//! traffic fingerprinting, not as a confidentiality guarantee against an
//! active adversary.

use std::{
    io,
    pin::Pin,
    task::{Context, Poll},
};

use bytes::{Buf, BytesMut};
use num_bigint::BigUint;
use num_traits::{FromPrimitive, One};
use rand::RngCore;
use rc4::{consts::U16, KeyInit, Rc4, StreamCipher};
use sha1::{Digest, Sha1};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf};

use crate::error::SessionError;

const P_HEX: &str = concat!(
    "FFFFFFFFFFFFFFFFC90FDAA22168C234C4C6628B80DC1CD1",
    "29024E088A67CC74020BBEA63B139B22514A08798E3404DD",
    "EF9519B3CD3A431B302B0A6DF25F14374FE1356D6D51C245",
    "E485B576625E7EC6F44C42E9A63A3620FFFFFFFFFFFFFFFF",
);
const PUB_KEY_LEN: usize = 96;

fn group_modulus() -> BigUint {
    BigUint::parse_bytes(P_HEX.as_bytes(), 16).expect("DH modulus is a valid hex literal")
}

/// Picks a private exponent in `[2, p - 2]` from 96 bytes of randomness.
fn generate_private_key(modulus: &BigUint) -> BigUint {
    let mut bytes = [0u8; PUB_KEY_LEN];
    rand::thread_rng().fill_bytes(&mut bytes);
    let candidate = BigUint::from_bytes_be(&bytes);
    let two = BigUint::from_u8(2).unwrap();
    &two + candidate % (modulus - &two - BigUint::one())
}

fn to_fixed_width_bytes(n: &BigUint, width: usize) -> Vec<u8> {
    let raw = n.to_bytes_be();
    let mut out = vec![0u8; width - raw.len()];
    out.extend_from_slice(&raw);
    out
}

/// Derives a single 128-bit RC4 key from the DH shared secret, used for both
/// the send and the receive stream.
fn derive_key(shared_secret: &BigUint) -> [u8; 16] {
    let secret_bytes = shared_secret.to_bytes_be();
    let digest = Sha1::digest(&secret_bytes);
    let mut key = [0u8; 16];
    key.copy_from_slice(&digest[..16]);
    key
}

/// A TCP stream wrapped in RC4 obfuscation after a completed DH exchange.
pub struct EncryptedStream<S> {
    inner: S,
    encryptor: Rc4<U16>,
    decryptor: Rc4<U16>,
    write_buf: BytesMut,
}

impl<S> EncryptedStream<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    fn new(inner: S, key: [u8; 16]) -> Self {
        Self {
            inner,
            encryptor: Rc4::new((&key).into()),
            decryptor: Rc4::new((&key).into()),
            write_buf: BytesMut::new(),
        }
    }

    /// Performs the DH exchange as the connecting (outbound) side: we send
    /// our public key first, then read the peer's.
    pub async fn handshake_as_initiator(mut stream: S) -> Result<Self, SessionError> {
        let modulus = group_modulus();
        let private_key = generate_private_key(&modulus);
        let public_key = BigUint::from_u8(2).unwrap().modpow(&private_key, &modulus);

        stream
            .write_all(&to_fixed_width_bytes(&public_key, PUB_KEY_LEN))
            .await?;

        let mut peer_public_bytes = [0u8; PUB_KEY_LEN];
        stream.read_exact(&mut peer_public_bytes).await?;
        let peer_public_key = BigUint::from_bytes_be(&peer_public_bytes);

        let shared_secret = peer_public_key.modpow(&private_key, &modulus);
        Ok(Self::new(stream, derive_key(&shared_secret)))
    }

    /// Performs the DH exchange as the accepting (inbound) side: we read the
    /// peer's public key first, then send ours.
    pub async fn handshake_as_responder(mut stream: S) -> Result<Self, SessionError> {
        let modulus = group_modulus();

        let mut peer_public_bytes = [0u8; PUB_KEY_LEN];
        stream.read_exact(&mut peer_public_bytes).await?;
        let peer_public_key = BigUint::from_bytes_be(&peer_public_bytes);

        let private_key = generate_private_key(&modulus);
        let public_key = BigUint::from_u8(2).unwrap().modpow(&private_key, &modulus);
        stream
            .write_all(&to_fixed_width_bytes(&public_key, PUB_KEY_LEN))
            .await?;

        let shared_secret = peer_public_key.modpow(&private_key, &modulus);
        Ok(Self::new(stream, derive_key(&shared_secret)))
    }

    pub fn into_inner(self) -> S {
        self.inner
    }
}

impl<S> AsyncRead for EncryptedStream<S>
where
    S: AsyncRead + Unpin,
{
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        let filled_before = buf.filled().len();
        match Pin::new(&mut this.inner).poll_read(cx, buf) {
            Poll::Ready(Ok(())) => {
                this.decryptor
                    .apply_keystream(&mut buf.filled_mut()[filled_before..]);
                Poll::Ready(Ok(()))
            }
            other => other,
        }
    }
}

impl<S> AsyncWrite for EncryptedStream<S>
where
    S: AsyncWrite + Unpin,
{
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        if this.write_buf.is_empty() {
            let mut encrypted = buf.to_vec();
            this.encryptor.apply_keystream(&mut encrypted);
            this.write_buf.extend_from_slice(&encrypted);
        }
        while !this.write_buf.is_empty() {
            match Pin::new(&mut this.inner).poll_write(cx, &this.write_buf) {
                Poll::Ready(Ok(n)) => this.write_buf.advance(n),
                Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),
                Poll::Pending => return Poll::Pending,
            }
        }
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn private_key_is_within_group_bounds() {
        let modulus = group_modulus();
        for _ in 0..50 {
            let key = generate_private_key(&modulus);
            assert!(key >= BigUint::from_u8(2).unwrap());
            assert!(key < &modulus - BigUint::one());
        }
    }

    #[test]
    fn shared_secret_agrees_between_both_sides() {
        let modulus = group_modulus();
        let g = BigUint::from_u8(2).unwrap();

        let initiator_priv = generate_private_key(&modulus);
        let initiator_pub = g.modpow(&initiator_priv, &modulus);

        let responder_priv = generate_private_key(&modulus);
        let responder_pub = g.modpow(&responder_priv, &modulus);

        let initiator_secret = responder_pub.modpow(&initiator_priv, &modulus);
        let responder_secret = initiator_pub.modpow(&responder_priv, &modulus);

        assert_eq!(initiator_secret, responder_secret);
        assert_eq!(derive_key(&initiator_secret), derive_key(&responder_secret));
    }

    #[test]
    fn fixed_width_encoding_pads_to_requested_length() {
        let n = BigUint::from_u8(5).unwrap();
        let bytes = to_fixed_width_bytes(&n, PUB_KEY_LEN);
        assert_eq!(bytes.len(), PUB_KEY_LEN);
        assert_eq!(bytes[PUB_KEY_LEN - 1], 5);
        assert!(bytes[..PUB_KEY_LEN - 1].iter().all(|&b| b == 0));
    }

    #[tokio::test]
    async fn handshake_over_a_duplex_pipe_derives_matching_keys() {
        let (client, server) = tokio::io::duplex(4096);

        let client_task = tokio::spawn(EncryptedStream::handshake_as_initiator(client));
        let server_task = tokio::spawn(EncryptedStream::handshake_as_responder(server));

        let mut client_stream = client_task.await.unwrap().unwrap();
        let mut server_stream = server_task.await.unwrap().unwrap();

        client_stream.write_all(b"hello peer").await.unwrap();
        client_stream.flush().await.unwrap();

        let mut buf = [0u8; 10];
        server_stream.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hello peer");
    }
}
